use chrono::{DateTime, Utc};
use oso::PolarClass;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::VehicleClass;
use crate::error::{invalid_state_error, Error};

const DEFAULT_FEE_RATE: f64 = 0.15;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub status: Status,
    pub vehicle_class: VehicleClass,
    pub verified: bool,
    /// Platform commission taken from each payout, set by the driver's tier.
    pub fee_rate: f64,
    pub strikes: u32,
    pub strikes_reset_at: DateTime<Utc>,
    pub deactivation: Option<Deactivation>,
}

impl PolarClass for Driver {
    fn get_polar_class_builder() -> oso::ClassBuilder<Driver> {
        oso::Class::builder()
            .name("Driver")
            .add_attribute_getter("id", |recv: &Driver| recv.id.to_string())
    }

    fn get_polar_class() -> oso::Class {
        let builder = Driver::get_polar_class_builder();
        builder.build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Status {
    Offline,
    Available,
    Assigned { job_id: Uuid },
}

impl Status {
    pub fn name(&self) -> String {
        match self {
            Self::Offline => "offline".into(),
            Self::Available => "available".into(),
            Self::Assigned { job_id: _ } => "assigned".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deactivation {
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrikeNotice {
    Strike,
    FinalWarning,
    Deactivated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrikeOutcome {
    pub strikes: u32,
    pub deactivated: bool,
    pub notice: StrikeNotice,
}

/// Which message a driver gets after reaching `strikes` out of `threshold`.
pub fn strike_notice(strikes: u32, threshold: u32) -> StrikeNotice {
    if strikes >= threshold {
        StrikeNotice::Deactivated
    } else if strikes + 1 == threshold {
        StrikeNotice::FinalWarning
    } else {
        StrikeNotice::Strike
    }
}

impl Driver {
    pub fn new(id: Uuid, vehicle_class: VehicleClass, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: Status::Offline,
            vehicle_class,
            verified: false,
            fee_rate: DEFAULT_FEE_RATE,
            strikes: 0,
            strikes_reset_at: now,
            deactivation: None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status, Status::Available)
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivation.is_some()
    }

    /// Whether dispatch may page this driver for a job needing `vehicle_class`.
    pub fn is_eligible(&self, vehicle_class: VehicleClass) -> bool {
        self.vehicle_class == vehicle_class
            && self.is_available()
            && self.verified
            && !self.is_deactivated()
    }

    #[tracing::instrument]
    pub fn assign(&mut self, job_id: Uuid) -> Result<(), Error> {
        match self.status {
            Status::Available if !self.is_deactivated() => {
                self.status = Status::Assigned { job_id };
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Frees the driver from `job_id`. Returns true if the driver was holding that job.
    /// Deactivated drivers go offline instead of back into the pool.
    #[tracing::instrument]
    pub fn release(&mut self, job_id: Uuid) -> bool {
        match self.status {
            Status::Assigned { job_id: current } if current == job_id => {
                self.status = if self.is_deactivated() {
                    Status::Offline
                } else {
                    Status::Available
                };
                true
            }
            _ => false,
        }
    }

    #[tracing::instrument]
    pub fn issue_strike(&mut self, now: DateTime<Utc>, threshold: u32, reason: &str) -> StrikeOutcome {
        self.strikes += 1;

        let notice = strike_notice(self.strikes, threshold);
        let deactivated = notice == StrikeNotice::Deactivated;

        if deactivated && self.deactivation.is_none() {
            self.deactivation = Some(Deactivation {
                at: now,
                reason: format!(
                    "{} driver cancellations (last: {})",
                    self.strikes, reason
                ),
            });
        }

        StrikeOutcome {
            strikes: self.strikes,
            deactivated,
            notice,
        }
    }

    pub fn reset_strikes(&mut self, now: DateTime<Utc>) {
        self.strikes = 0;
        self.strikes_reset_at = now;
    }
}

#[cfg(test)]
pub(crate) fn available_driver(vehicle_class: VehicleClass) -> Driver {
    let mut driver = Driver::new(Uuid::new_v4(), vehicle_class, Utc::now());
    driver.status = Status::Available;
    driver.verified = true;
    driver
}

#[test]
fn eligibility_requires_class_availability_verification_and_standing() {
    let driver = available_driver(VehicleClass::Van);
    assert!(driver.is_eligible(VehicleClass::Van));
    assert!(!driver.is_eligible(VehicleClass::Truck));

    let mut unverified = driver.clone();
    unverified.verified = false;
    assert!(!unverified.is_eligible(VehicleClass::Van));

    let mut busy = driver.clone();
    busy.assign(Uuid::new_v4()).unwrap();
    assert!(!busy.is_eligible(VehicleClass::Van));

    let mut banned = driver;
    banned.deactivation = Some(Deactivation {
        at: Utc::now(),
        reason: "test".into(),
    });
    assert!(!banned.is_eligible(VehicleClass::Van));
}

#[test]
fn assign_and_release_round_trip() {
    let mut driver = available_driver(VehicleClass::Van);
    let job_id = Uuid::new_v4();

    driver.assign(job_id).unwrap();
    assert!(driver.assign(Uuid::new_v4()).unwrap_err().is_invalid_state());
    assert!(!driver.release(Uuid::new_v4()));
    assert!(driver.release(job_id));
    assert!(driver.is_available());
}

#[test]
fn strikes_deactivate_at_threshold_only() {
    let now = Utc::now();
    let mut driver = available_driver(VehicleClass::Van);

    let first = driver.issue_strike(now, 3, "flat tyre");
    assert_eq!(first.strikes, 1);
    assert_eq!(first.notice, StrikeNotice::Strike);
    assert!(!driver.is_deactivated());

    let second = driver.issue_strike(now, 3, "traffic");
    assert_eq!(second.strikes, 2);
    assert_eq!(second.notice, StrikeNotice::FinalWarning);
    assert!(!driver.is_deactivated());

    let third = driver.issue_strike(now, 3, "no show");
    assert_eq!(third.strikes, 3);
    assert!(third.deactivated);
    assert_eq!(third.notice, StrikeNotice::Deactivated);
    assert!(driver.is_deactivated());
}

#[test]
fn deactivated_drivers_go_offline_on_release() {
    let mut driver = available_driver(VehicleClass::Van);
    let job_id = Uuid::new_v4();
    driver.assign(job_id).unwrap();

    for _ in 0..3 {
        driver.issue_strike(Utc::now(), 3, "cancelled");
    }

    assert!(driver.release(job_id));
    assert_eq!(driver.status, Status::Offline);
}

#[test]
fn reset_keeps_deactivation() {
    let now = Utc::now();
    let mut driver = available_driver(VehicleClass::Van);
    for _ in 0..3 {
        driver.issue_strike(now, 3, "cancelled");
    }

    driver.reset_strikes(now);
    assert_eq!(driver.strikes, 0);
    assert!(driver.is_deactivated());
}

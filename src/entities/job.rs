use chrono::{DateTime, Utc};
use oso::PolarClass;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::lifecycle::{transition, Effect, Event, Milestone, Status};
use crate::entities::{Bid, Location};
use crate::error::{invalid_input_error, invalid_state_error, invalid_transition_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleClass {
    Motorbike,
    Pickup,
    Van,
    Truck,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewJob {
    pub pickup: Location,
    pub dropoff: Location,
    pub vehicle_class: VehicleClass,
    pub min_price: i64,
    pub max_price: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: Status,
    pub pickup: Location,
    pub dropoff: Location,
    pub vehicle_class: VehicleClass,
    pub distance_km: f64,
    pub min_price: i64,
    pub max_price: i64,
    pub final_price: Option<i64>,
    pub driver_id: Option<Uuid>,
    pub accepted_bid_id: Option<Uuid>,
    pub driver_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub pickup_arrived_at: Option<DateTime<Utc>>,
    pub dropoff_arrived_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl PolarClass for Job {
    fn get_polar_class_builder() -> oso::ClassBuilder<Job> {
        oso::Class::builder()
            .name("Job")
            .add_attribute_getter("customer_id", |recv: &Job| recv.customer_id.to_string())
            .add_attribute_getter("driver_id", |recv: &Job| {
                recv.driver_id.map(|id| id.to_string()).unwrap_or_default()
            })
            .add_attribute_getter("status", |recv: &Job| recv.status.name().to_string())
    }

    fn get_polar_class() -> oso::Class {
        let builder = Job::get_polar_class_builder();
        builder.build()
    }
}

impl Job {
    pub fn new(customer_id: Uuid, new_job: NewJob, now: DateTime<Utc>) -> Result<Self, Error> {
        if !new_job.pickup.coordinates.is_valid() || !new_job.dropoff.coordinates.is_valid() {
            return Err(invalid_input_error());
        }

        if new_job.min_price <= 0 || new_job.min_price > new_job.max_price {
            return Err(invalid_input_error());
        }

        let distance_km = new_job
            .pickup
            .coordinates
            .distance_km(&new_job.dropoff.coordinates);

        Ok(Self {
            id: Uuid::new_v4(),
            customer_id,
            status: Status::PendingBids,
            pickup: new_job.pickup,
            dropoff: new_job.dropoff,
            vehicle_class: new_job.vehicle_class,
            distance_km,
            min_price: new_job.min_price,
            max_price: new_job.max_price,
            final_price: None,
            driver_id: None,
            accepted_bid_id: None,
            driver_confirmed_at: None,
            created_at: now,
            accepted_at: None,
            pickup_arrived_at: None,
            dropoff_arrived_at: None,
            completed_at: None,
            cancelled_at: None,
        })
    }

    pub fn is_pending_bids(&self) -> bool {
        self.status == Status::PendingBids
    }

    pub fn is_customer(&self, user_id: Uuid) -> bool {
        self.customer_id == user_id
    }

    pub fn is_driver(&self, user_id: Uuid) -> bool {
        self.driver_id == Some(user_id)
    }

    /// Applies `event` through the transition table and stamps milestones.
    /// Returns the remaining side effects for the caller to carry out.
    pub fn apply(&mut self, event: Event, at: DateTime<Utc>) -> Result<&'static [Effect], Error> {
        if self.status.is_terminal() {
            return Err(invalid_state_error());
        }

        let transition = transition(self.status, event).ok_or_else(invalid_transition_error)?;

        for effect in transition.effects {
            if let Effect::Stamp(milestone) = effect {
                self.stamp(*milestone, at);
            }
        }

        self.status = transition.to;

        Ok(transition.effects)
    }

    fn stamp(&mut self, milestone: Milestone, at: DateTime<Utc>) {
        let slot = match milestone {
            Milestone::Accepted => &mut self.accepted_at,
            Milestone::PickupArrived => &mut self.pickup_arrived_at,
            Milestone::DropoffArrived => &mut self.dropoff_arrived_at,
            Milestone::Completed => &mut self.completed_at,
            Milestone::Cancelled => &mut self.cancelled_at,
        };

        slot.get_or_insert(at);
    }

    pub fn accept_bid(&mut self, bid: &Bid, at: DateTime<Utc>) -> Result<(), Error> {
        if !self.is_pending_bids() || bid.job_id != self.id {
            return Err(invalid_state_error());
        }

        self.apply(Event::AcceptBid, at)?;

        self.driver_id = Some(bid.driver_id);
        self.final_price = Some(bid.price);
        self.accepted_bid_id = Some(bid.id);

        Ok(())
    }

    /// Moves the job to `to`, which must be the immediate successor reported by the driver.
    pub fn advance(&mut self, to: Status, at: DateTime<Utc>) -> Result<&'static [Effect], Error> {
        if self.status.is_terminal() {
            return Err(invalid_state_error());
        }

        let event = Event::reported_by_driver(to).ok_or_else(invalid_transition_error)?;

        match transition(self.status, event) {
            Some(transition) if transition.to == to => self.apply(event, at),
            _ => Err(invalid_transition_error()),
        }
    }

    /// Records the driver's half of the dual confirmation. Returns false if it was already recorded.
    pub fn confirm_by_driver(&mut self, at: DateTime<Utc>) -> Result<bool, Error> {
        if self.status != Status::DropoffArrived {
            return Err(invalid_state_error());
        }

        if self.driver_confirmed_at.is_some() {
            return Ok(false);
        }

        self.driver_confirmed_at = Some(at);
        Ok(true)
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<(), Error> {
        if self.status != Status::DropoffArrived {
            return Err(invalid_state_error());
        }

        self.apply(Event::ConfirmDelivery, at).map(|_| ())
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), Error> {
        self.apply(Event::Cancel, at).map(|_| ())
    }

    pub fn exhaust_dispatch(&mut self, at: DateTime<Utc>) -> Result<(), Error> {
        if !self.is_pending_bids() {
            return Err(invalid_state_error());
        }

        self.apply(Event::ExhaustDispatch, at).map(|_| ())
    }
}

#[cfg(test)]
pub(crate) fn sample_new_job() -> NewJob {
    use crate::entities::Coordinates;

    NewJob {
        pickup: Location::new(Coordinates::new(24.8607, 67.0011), "Saddar".into()),
        dropoff: Location::new(Coordinates::new(24.9056, 67.0822), "Gulshan".into()),
        vehicle_class: VehicleClass::Van,
        min_price: 2_000,
        max_price: 5_000,
    }
}

#[test]
fn new_job_starts_pending_with_distance() {
    let job = Job::new(Uuid::new_v4(), sample_new_job(), Utc::now()).unwrap();
    assert_eq!(job.status, Status::PendingBids);
    assert!(job.distance_km > 9.0 && job.distance_km < 10.5);
    assert!(job.driver_id.is_none());
}

#[test]
fn new_job_rejects_inverted_price_bounds() {
    let mut new_job = sample_new_job();
    new_job.min_price = 6_000;
    assert!(Job::new(Uuid::new_v4(), new_job, Utc::now())
        .unwrap_err()
        .is_invalid_input());
}

#[test]
fn accepting_a_bid_assigns_driver_and_price() {
    let now = Utc::now();
    let mut job = Job::new(Uuid::new_v4(), sample_new_job(), now).unwrap();
    let bid = Bid::new(job.id, Uuid::new_v4(), 3_000, 12, "".into(), now, chrono::Duration::minutes(10));

    job.accept_bid(&bid, now).unwrap();

    assert_eq!(job.status, Status::BidAccepted);
    assert_eq!(job.driver_id, Some(bid.driver_id));
    assert_eq!(job.final_price, Some(3_000));
    assert_eq!(job.accepted_bid_id, Some(bid.id));
    assert_eq!(job.accepted_at, Some(now));

    let err = job.accept_bid(&bid, now).unwrap_err();
    assert!(err.is_invalid_state());
}

#[test]
fn advance_rejects_skipping_and_completion() {
    let now = Utc::now();
    let mut job = Job::new(Uuid::new_v4(), sample_new_job(), now).unwrap();
    let bid = Bid::new(job.id, Uuid::new_v4(), 3_000, 12, "".into(), now, chrono::Duration::minutes(10));
    job.accept_bid(&bid, now).unwrap();

    assert!(job
        .advance(Status::PickupArrived, now)
        .unwrap_err()
        .is_invalid_transition());
    assert!(job
        .advance(Status::Completed, now)
        .unwrap_err()
        .is_invalid_transition());

    job.advance(Status::DriverArriving, now).unwrap();
    let effects = job.advance(Status::PickupArrived, now).unwrap();
    assert!(effects.contains(&Effect::NotifyCustomer));
    assert_eq!(job.pickup_arrived_at, Some(now));
}

#[test]
fn terminal_jobs_reject_every_event() {
    let now = Utc::now();
    let mut job = Job::new(Uuid::new_v4(), sample_new_job(), now).unwrap();
    job.cancel(now).unwrap();

    assert!(job.cancel(now).unwrap_err().is_invalid_state());
    assert!(job
        .advance(Status::DriverArriving, now)
        .unwrap_err()
        .is_invalid_state());
    assert!(job.exhaust_dispatch(now).unwrap_err().is_invalid_state());
}

#[test]
fn driver_confirmation_is_recorded_once() {
    let now = Utc::now();
    let mut job = Job::new(Uuid::new_v4(), sample_new_job(), now).unwrap();
    assert!(job.confirm_by_driver(now).unwrap_err().is_invalid_state());

    job.status = Status::DropoffArrived;
    assert!(job.confirm_by_driver(now).unwrap());
    assert!(!job.confirm_by_driver(now + chrono::Duration::seconds(5)).unwrap());
    assert_eq!(job.driver_confirmed_at, Some(now));
}

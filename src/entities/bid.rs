use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{invalid_state_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Active,
    Accepted,
    Rejected,
    Expired,
}

impl BidStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewBid {
    pub price: i64,
    pub eta_minutes: u32,
    #[serde(default)]
    pub note: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub job_id: Uuid,
    pub driver_id: Uuid,
    pub price: i64,
    pub eta_minutes: u32,
    pub note: String,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Bid {
    pub fn new(
        job_id: Uuid,
        driver_id: Uuid,
        price: i64,
        eta_minutes: u32,
        note: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Bid {
            id: Uuid::new_v4(),
            job_id,
            driver_id,
            price,
            eta_minutes,
            note,
            status: BidStatus::Active,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Active and not yet past its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == BidStatus::Active && now < self.expires_at
    }

    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        if !self.is_live(now) {
            return Err(invalid_state_error());
        }

        self.status = BidStatus::Accepted;
        Ok(())
    }

    pub fn reject(&mut self) {
        if self.status == BidStatus::Active {
            self.status = BidStatus::Rejected;
        }
    }

    pub fn expire(&mut self) {
        if self.status == BidStatus::Active {
            self.status = BidStatus::Expired;
        }
    }
}

#[test]
fn bids_stop_being_live_at_expiry() {
    let now = Utc::now();
    let bid = Bid::new(Uuid::new_v4(), Uuid::new_v4(), 100, 5, "".into(), now, Duration::minutes(10));

    assert!(bid.is_live(now));
    assert!(bid.is_live(now + Duration::minutes(9)));
    assert!(!bid.is_live(now + Duration::minutes(10)));
}

#[test]
fn expired_bids_cannot_be_accepted() {
    let now = Utc::now();
    let mut bid = Bid::new(Uuid::new_v4(), Uuid::new_v4(), 100, 5, "".into(), now, Duration::minutes(10));

    assert!(bid
        .accept(now + Duration::minutes(11))
        .unwrap_err()
        .is_invalid_state());
    assert_eq!(bid.status, BidStatus::Active);

    bid.accept(now).unwrap();
    assert_eq!(bid.status, BidStatus::Accepted);
}

#[test]
fn reject_only_touches_active_bids() {
    let now = Utc::now();
    let mut bid = Bid::new(Uuid::new_v4(), Uuid::new_v4(), 100, 5, "".into(), now, Duration::minutes(10));
    bid.accept(now).unwrap();
    bid.reject();
    assert_eq!(bid.status, BidStatus::Accepted);
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Initiator {
    Customer,
    Driver,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    NotApplicable,
    Pending,
    Processed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cancellation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub initiator: Initiator,
    pub reason: String,
    pub within_grace: bool,
    pub fee: i64,
    pub refund_amount: i64,
    pub refund_status: RefundStatus,
    pub strike_issued: bool,
    pub strike_count: Option<u32>,
    pub driver_deactivated: bool,
    pub created_at: DateTime<Utc>,
}

impl Cancellation {
    pub fn by_customer(
        job_id: Uuid,
        reason: String,
        within_grace: bool,
        fee: i64,
        refund_amount: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            initiator: Initiator::Customer,
            reason,
            within_grace,
            fee,
            refund_amount,
            refund_status: initial_refund_status(refund_amount),
            strike_issued: false,
            strike_count: None,
            driver_deactivated: false,
            created_at: now,
        }
    }

    pub fn by_driver(
        job_id: Uuid,
        reason: String,
        refund_amount: i64,
        strike_count: u32,
        driver_deactivated: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            initiator: Initiator::Driver,
            reason,
            within_grace: false,
            fee: 0,
            refund_amount,
            refund_status: initial_refund_status(refund_amount),
            strike_issued: true,
            strike_count: Some(strike_count),
            driver_deactivated,
            created_at: now,
        }
    }
}

fn initial_refund_status(refund_amount: i64) -> RefundStatus {
    if refund_amount > 0 {
        RefundStatus::Pending
    } else {
        RefundStatus::NotApplicable
    }
}

/// A job that was never accepted is always within grace. The boundary itself counts as within grace.
pub fn is_within_grace(accepted_at: Option<DateTime<Utc>>, now: DateTime<Utc>, grace_window: Duration) -> bool {
    match accepted_at {
        Some(accepted_at) => now - accepted_at <= grace_window,
        None => true,
    }
}

pub fn customer_fee(within_grace: bool, late_fee: i64) -> i64 {
    if within_grace {
        0
    } else {
        late_fee
    }
}

pub fn refund_amount(captured: i64, fee: i64) -> i64 {
    (captured - fee).max(0)
}

#[test]
fn grace_boundary_is_inclusive() {
    let accepted_at = Utc::now();
    let grace = Duration::minutes(5);

    assert!(is_within_grace(Some(accepted_at), accepted_at, grace));
    assert!(is_within_grace(Some(accepted_at), accepted_at + grace, grace));
    assert!(!is_within_grace(
        Some(accepted_at),
        accepted_at + grace + Duration::milliseconds(1),
        grace
    ));
    assert!(is_within_grace(None, accepted_at + Duration::days(1), grace));
}

#[test]
fn fee_is_flat_outside_grace() {
    assert_eq!(customer_fee(true, 500), 0);
    assert_eq!(customer_fee(false, 500), 500);
}

#[test]
fn refund_never_goes_negative() {
    assert_eq!(refund_amount(10_000, 500), 9_500);
    assert_eq!(refund_amount(0, 500), 0);
    assert_eq!(refund_amount(300, 500), 0);
}

#[test]
fn refund_status_follows_amount() {
    let now = Utc::now();
    let free = Cancellation::by_customer(Uuid::new_v4(), "".into(), true, 0, 0, now);
    assert_eq!(free.refund_status, RefundStatus::NotApplicable);

    let refunded = Cancellation::by_driver(Uuid::new_v4(), "".into(), 4_000, 1, false, now);
    assert_eq!(refunded.refund_status, RefundStatus::Pending);
    assert!(refunded.strike_issued);
}

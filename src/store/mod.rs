//! Persistent store for jobs, bids, drivers, escrow, payouts and cancellations.
//!
//! Every multi-record change the coordinator makes is a single call here, so
//! an implementation can apply it inside one transaction. Writes that can
//! race carry the status the caller read (`expected`) and only apply if it
//! still matches.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{
    Bid, Cancellation, Driver, Job, JobStatus, Payment, PaymentStatus, Payout, StrikeOutcome,
};
use crate::error::Error;

/// A bid acceptance: the job already moved to BID_ACCEPTED in memory.
#[derive(Clone, Debug)]
pub struct Acceptance {
    pub job: Job,
    pub bid_id: Uuid,
    pub driver_id: Uuid,
    pub now: DateTime<Utc>,
}

/// The finalize sequence shared by customer confirmation, the sweep and gateway callbacks.
#[derive(Clone, Debug)]
pub struct Finalization {
    /// Job already moved to COMPLETED; stored only if still DROPOFF_ARRIVED.
    pub job: Job,
    pub payment: Payment,
    pub expected_payment: PaymentStatus,
    pub payout: Payout,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DriverChange {
    Nothing,
    /// Free the driver from the job.
    Release { driver_id: Uuid },
    /// Free the driver and count a strike against them.
    Strike {
        driver_id: Uuid,
        threshold: u32,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct CancellationCommit {
    pub job: Job,
    pub expected: JobStatus,
    pub cancellation: Cancellation,
    /// Refunded escrow and the status it was read in.
    pub payment: Option<(Payment, PaymentStatus)>,
    pub driver: DriverChange,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct CancellationCommitted {
    pub cancellation: Cancellation,
    pub driver: Option<Driver>,
    pub strike: Option<StrikeOutcome>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), Error>;
    async fn find_job(&self, id: Uuid) -> Result<Job, Error>;
    /// Writes `job` if the stored status is still `expected`. Returns false otherwise.
    async fn update_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool, Error>;

    /// Fails with DuplicateBid while the driver holds a live bid on the job,
    /// and with InvalidState once the job stopped taking bids.
    async fn insert_bid(&self, bid: &Bid) -> Result<(), Error>;
    async fn find_bid(&self, id: Uuid) -> Result<Bid, Error>;
    async fn list_bids(&self, job_id: Uuid) -> Result<Vec<Bid>, Error>;
    /// Applies an acceptance atomically and returns the bids it rejected.
    /// Fails with InvalidState if the job or bid moved on, Forbidden if the driver was deactivated.
    async fn accept_bid(&self, acceptance: &Acceptance) -> Result<Vec<Bid>, Error>;

    async fn insert_driver(&self, driver: &Driver) -> Result<(), Error>;
    async fn find_driver(&self, id: Uuid) -> Result<Driver, Error>;
    async fn find_drivers(&self, ids: &[Uuid]) -> Result<Vec<Driver>, Error>;
    async fn drivers_due_strike_reset(&self, cutoff: DateTime<Utc>) -> Result<Vec<Driver>, Error>;
    /// Zeroes the driver's strikes if their last reset is still older than `cutoff`.
    async fn reset_strikes_if_due(&self, driver_id: Uuid, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool, Error>;

    /// Records that `driver_id` was paged for `job_id`. Returns false if it already was.
    async fn record_dispatch_notification(&self, job_id: Uuid, driver_id: Uuid, at: DateTime<Utc>) -> Result<bool, Error>;

    async fn find_payment(&self, job_id: Uuid) -> Result<Option<Payment>, Error>;
    async fn find_payment_by_ref(&self, provider_ref: &str) -> Result<Option<Payment>, Error>;
    /// Inserts the job's escrow record, or replaces one that is still PENDING or FAILED.
    async fn save_payment(&self, payment: &Payment) -> Result<bool, Error>;
    async fn update_payment_if(&self, payment: &Payment, expected: PaymentStatus) -> Result<bool, Error>;
    async fn payments_held_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>, Error>;

    async fn find_payout(&self, job_id: Uuid) -> Result<Option<Payout>, Error>;
    /// Inserts the payout if none exists for the job, then completes job, escrow and
    /// frees the driver, all or nothing. Returns false without writing anything if the
    /// payout already existed or the job or escrow moved on.
    async fn finalize_delivery(&self, finalization: &Finalization) -> Result<bool, Error>;

    /// Fails with InvalidState if the job moved on or was already cancelled, and with
    /// Forbidden when a strike targets a deactivated driver.
    async fn record_cancellation(&self, commit: CancellationCommit) -> Result<CancellationCommitted, Error>;
    async fn find_cancellation(&self, job_id: Uuid) -> Result<Option<Cancellation>, Error>;
    async fn update_cancellation(&self, cancellation: &Cancellation) -> Result<(), Error>;
}

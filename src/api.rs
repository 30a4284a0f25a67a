use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::User;
use crate::entities::{
    Bid, Cancellation, Coordinates, DispatchRequest, Driver, GatewayOutcome, Job, JobStatus, NewBid,
    NewJob, Payment, PaymentMethod, StepOutcome,
};
use crate::error::Error;
use crate::queue::Task;

#[async_trait]
pub trait JobAPI {
    async fn create_job(&self, user: User, new_job: NewJob) -> Result<Job, Error>;
    async fn find_job(&self, user: User, id: Uuid) -> Result<Job, Error>;
}

#[async_trait]
pub trait DispatchAPI {
    async fn initiate_dispatch(&self, request: DispatchRequest) -> Result<(), Error>;
    async fn run_dispatch_step(&self, request: DispatchRequest, step: usize) -> Result<StepOutcome, Error>;
    async fn check_bids_and_continue(
        &self,
        request: DispatchRequest,
        step: usize,
    ) -> Result<StepOutcome, Error>;
}

#[async_trait]
pub trait AuctionAPI {
    async fn submit_bid(&self, user: User, job_id: Uuid, new_bid: NewBid) -> Result<Bid, Error>;
    async fn list_bids(&self, user: User, job_id: Uuid) -> Result<Vec<Bid>, Error>;
    async fn accept_bid(&self, user: User, job_id: Uuid, bid_id: Uuid) -> Result<Job, Error>;
    async fn advance_status(&self, user: User, job_id: Uuid, status: JobStatus) -> Result<Job, Error>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[async_trait]
pub trait EscrowAPI {
    async fn initiate_payment(&self, user: User, job_id: Uuid, method: PaymentMethod) -> Result<Payment, Error>;
    async fn hold_payment(&self, user: User, job_id: Uuid) -> Result<Payment, Error>;
    async fn confirm_delivery(&self, user: User, job_id: Uuid) -> Result<Job, Error>;
    async fn auto_confirm_sweep(&self, user: User) -> Result<SweepReport, Error>;
    async fn handle_gateway_callback(
        &self,
        user: User,
        provider_ref: String,
        outcome: GatewayOutcome,
    ) -> Result<Payment, Error>;
}

#[async_trait]
pub trait CancellationAPI {
    async fn cancel_by_customer(&self, user: User, job_id: Uuid, reason: String) -> Result<Cancellation, Error>;
    async fn cancel_by_driver(&self, user: User, job_id: Uuid, reason: String) -> Result<Cancellation, Error>;
    async fn reset_monthly_strikes(&self, user: User) -> Result<usize, Error>;
}

#[async_trait]
pub trait DriverAPI {
    async fn find_driver(&self, user: User, id: Uuid) -> Result<Driver, Error>;
    async fn update_driver_location(&self, user: User, coordinates: Coordinates) -> Result<(), Error>;
}

#[async_trait]
pub trait TaskAPI {
    /// Executes one delivery of a scheduled task. An error asks the worker to retry.
    async fn run_task(&self, task: Task) -> Result<(), Error>;

    /// Called once a task has used up its retries.
    async fn handle_exhausted(&self, task: Task) -> Result<(), Error>;

    /// Enqueues the next occurrence of a periodic task after the current one finished.
    async fn schedule_next(&self, task: &Task) -> Result<(), Error>;

    async fn schedule_maintenance(&self) -> Result<(), Error>;
}

pub trait API: JobAPI + DispatchAPI + AuctionAPI + EscrowAPI + CancellationAPI + DriverAPI + TaskAPI {}

pub type DynAPI = Arc<dyn API + Send + Sync>;

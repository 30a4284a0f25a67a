//! Durable delayed task queue.
//!
//! Dispatch steps, bid checks and the periodic sweeps are all scheduled as
//! [`Task`]s with an explicit payload and run-at time, so a restart loses
//! nothing that was already enqueued. Delivery is at-least-once: a claimed
//! task that is neither completed nor rescheduled before its lease expires
//! becomes visible again.
//!
//! At most one pending task exists per [`Task::dedup_key`]; enqueueing a
//! second one reports [`EnqueueResult::Deduplicated`].

pub mod memory;
pub mod postgres;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::DispatchRequest;
use crate::error::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    DispatchStep { request: DispatchRequest, step: usize },
    CheckBids { request: DispatchRequest, step: usize },
    AutoConfirmSweep,
    ResetMonthlyStrikes,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DispatchStep { .. } => "dispatch_step",
            Self::CheckBids { .. } => "check_bids",
            Self::AutoConfirmSweep => "auto_confirm_sweep",
            Self::ResetMonthlyStrikes => "reset_monthly_strikes",
        }
    }

    pub fn dedup_key(&self) -> String {
        match self {
            Self::DispatchStep { request, step } => format!("dispatch:{}:{}", request.job_id, step),
            Self::CheckBids { request, step } => format!("check_bids:{}:{}", request.job_id, step),
            Self::AutoConfirmSweep => "auto_confirm_sweep".into(),
            Self::ResetMonthlyStrikes => "reset_monthly_strikes".into(),
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, Self::AutoConfirmSweep | Self::ResetMonthlyStrikes)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub task: Task,
    /// Number of deliveries so far, including the current one once claimed.
    pub attempt: u32,
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task: Task, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            attempt: 0,
            run_at,
            enqueued_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Enqueued { id: Uuid },
    Deduplicated { existing_id: Uuid },
}

impl EnqueueResult {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Enqueued { id } | Self::Deduplicated { existing_id: id } => *id,
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedules `task` to become due after `delay`.
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<EnqueueResult, Error>;

    /// Leases up to `limit` due tasks and bumps their attempt counters.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize, lease: Duration) -> Result<Vec<TaskEnvelope>, Error>;

    /// Removes a finished task.
    async fn complete(&self, id: Uuid) -> Result<(), Error>;

    /// Makes a failed task due again after `delay`.
    async fn reschedule(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), Error>;

    /// Drops a task whose retries are exhausted.
    async fn abandon(&self, id: Uuid, error: &str) -> Result<(), Error>;

    async fn depth(&self) -> Result<usize, Error>;
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Coordinates, VehicleClass};

/// Everything a dispatch step needs, carried in the scheduled task payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: Uuid,
    pub pickup: Coordinates,
    pub vehicle_class: VehicleClass,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The job already left PENDING_BIDS.
    Skipped,
    Notified { drivers: Vec<Uuid> },
    /// Nobody to page at this tier; the next one is scheduled.
    Escalated { next_step: usize },
    /// Out of tiers; the job is now NO_DRIVERS_AVAILABLE.
    Exhausted,
    BidsReceived { count: usize },
}

mod bid;
mod cancellation;
mod dispatch;
mod driver;
mod job;
mod lifecycle;
mod location;
mod payment;

pub use bid::{Bid, BidStatus, NewBid};
pub use cancellation::{customer_fee, is_within_grace, refund_amount, Cancellation, Initiator, RefundStatus};
pub use dispatch::{DispatchRequest, StepOutcome};
pub use driver::{strike_notice, Deactivation, Driver, Status as DriverStatus, StrikeNotice, StrikeOutcome};
pub use job::{Job, NewJob, VehicleClass};
pub use lifecycle::{transition, Effect, Event, Milestone, Status as JobStatus, Transition, TRANSITIONS};
pub use location::{Coordinates, Location};
pub use payment::{split_amount, ConfirmationSource, GatewayOutcome, Payment, PaymentMethod, PaymentStatus, Payout};

#[cfg(test)]
pub(crate) use driver::available_driver;
#[cfg(test)]
pub(crate) use job::sample_new_job;

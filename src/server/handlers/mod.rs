pub mod bids;
pub mod cancellations;
pub mod drivers;
pub mod jobs;
pub mod maintenance;
pub mod payments;

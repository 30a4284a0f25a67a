//! Collaborators the coordinator talks to but does not own.

pub mod geo_index;
pub mod notifier;
pub mod payment_gateway;

pub use geo_index::{GeoIndex, MemoryGeoIndex, NearbyDriver, PgGeoIndex};
pub use notifier::{Channel, HttpNotifier, MemoryNotifier, Notification, Notifier, TracingNotifier};
pub use payment_gateway::{ChargeRequest, HttpPaymentGateway, MemoryPaymentGateway, PaymentGateway};

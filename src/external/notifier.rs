use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::entities::{Initiator, JobStatus, Location, VehicleClass};
use crate::error::{invalid_input_error, unexpected_error, upstream_error, Error};

/// One channel per driver and one per customer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Channel {
    Driver(Uuid),
    Customer(Uuid),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    JobOffered {
        job_id: Uuid,
        pickup: Location,
        dropoff: Location,
        vehicle_class: VehicleClass,
        /// From the driver to the pickup point.
        distance_km: f64,
        min_price: i64,
        max_price: i64,
    },
    BidReceived {
        job_id: Uuid,
        bid_id: Uuid,
        driver_id: Uuid,
        price: i64,
        eta_minutes: u32,
    },
    BidAccepted {
        job_id: Uuid,
        bid_id: Uuid,
        price: i64,
    },
    BidRejected {
        job_id: Uuid,
        bid_id: Uuid,
    },
    NoDriversAvailable {
        job_id: Uuid,
    },
    StatusChanged {
        job_id: Uuid,
        status: JobStatus,
    },
    DeliveryAwaitingConfirmation {
        job_id: Uuid,
    },
    PaymentHeld {
        job_id: Uuid,
        amount: i64,
    },
    DeliveryCompleted {
        job_id: Uuid,
        auto_confirmed: bool,
        payout: i64,
    },
    JobCancelled {
        job_id: Uuid,
        initiator: Initiator,
        fee: i64,
        refund_amount: i64,
    },
    StrikeIssued {
        job_id: Uuid,
        strikes: u32,
        threshold: u32,
    },
    FinalWarning {
        job_id: Uuid,
        strikes: u32,
        threshold: u32,
    },
    DriverDeactivated {
        reason: String,
    },
    PaymentFailed {
        job_id: Uuid,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobOffered { .. } => "job_offered",
            Self::BidReceived { .. } => "bid_received",
            Self::BidAccepted { .. } => "bid_accepted",
            Self::BidRejected { .. } => "bid_rejected",
            Self::NoDriversAvailable { .. } => "no_drivers_available",
            Self::StatusChanged { .. } => "status_changed",
            Self::DeliveryAwaitingConfirmation { .. } => "delivery_awaiting_confirmation",
            Self::PaymentHeld { .. } => "payment_held",
            Self::DeliveryCompleted { .. } => "delivery_completed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::StrikeIssued { .. } => "strike_issued",
            Self::FinalWarning { .. } => "final_warning",
            Self::DriverDeactivated { .. } => "driver_deactivated",
            Self::PaymentFailed { .. } => "payment_failed",
        }
    }
}

/// Fire-and-forget delivery. Callers log failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: Channel, notification: Notification) -> Result<(), Error>;
}

/// Writes every notification to the log. Used when no fan-out endpoint is configured.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, channel: Channel, notification: Notification) -> Result<(), Error> {
        tracing::info!(?channel, event = notification.name(), ?notification, "notification");
        Ok(())
    }
}

/// Posts notifications to an HTTP fan-out service.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[tracing::instrument(skip(self, notification), fields(event = notification.name()))]
    async fn send(&self, channel: Channel, notification: Notification) -> Result<(), Error> {
        let res = self
            .client
            .post(&self.url)
            .json(&json!({
                "channel": channel,
                "event": notification.name(),
                "notification": notification,
            }))
            .send()
            .await?;

        let status_code = res.status().as_u16();

        if (400..500).contains(&status_code) {
            return Err(invalid_input_error());
        } else if !res.status().is_success() {
            return Err(upstream_error());
        }

        Ok(())
    }
}

/// Keeps every notification in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(Channel, Notification)>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    tracing::error!("notifier lock poisoned");
    unexpected_error()
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Result<Vec<(Channel, Notification)>, Error> {
        Ok(self.sent.lock().map_err(poison_err)?.clone())
    }

    pub fn sent_to(&self, channel: Channel) -> Result<Vec<Notification>, Error> {
        Ok(self
            .sent()?
            .into_iter()
            .filter(|(to, _)| *to == channel)
            .map(|(_, notification)| notification)
            .collect())
    }

    /// Channels that received a notification with the given name.
    pub fn recipients_of(&self, name: &str) -> Result<Vec<Channel>, Error> {
        Ok(self
            .sent()?
            .into_iter()
            .filter(|(_, notification)| notification.name() == name)
            .map(|(to, _)| to)
            .collect())
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.sent.lock().map_err(poison_err)?.clear();
        Ok(())
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, channel: Channel, notification: Notification) -> Result<(), Error> {
        self.sent
            .lock()
            .map_err(poison_err)?
            .push((channel, notification));
        Ok(())
    }
}

#[test]
fn notifications_serialize_with_type_and_payload() {
    let job_id = Uuid::new_v4();
    let value = serde_json::to_value(Notification::NoDriversAvailable { job_id }).unwrap();

    assert_eq!(value["type"], "no_drivers_available");
    assert_eq!(value["payload"]["job_id"], job_id.to_string());

    let channel = serde_json::to_value(Channel::Driver(job_id)).unwrap();
    assert_eq!(channel["role"], "driver");
}

#[test]
fn memory_notifier_filters_by_channel() {
    use tokio_test::block_on;

    let notifier = MemoryNotifier::new();
    let customer = Channel::Customer(Uuid::new_v4());
    let driver = Channel::Driver(Uuid::new_v4());
    let job_id = Uuid::new_v4();

    block_on(notifier.send(customer, Notification::NoDriversAvailable { job_id })).unwrap();
    block_on(notifier.send(driver, Notification::PaymentFailed { job_id })).unwrap();

    assert_eq!(notifier.sent_to(customer).unwrap().len(), 1);
    assert_eq!(notifier.recipients_of("payment_failed").unwrap(), vec![driver]);
}

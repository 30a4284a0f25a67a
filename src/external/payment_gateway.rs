use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::PaymentMethod;
use crate::error::{gateway_failure_error, unexpected_error, Error};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub job_id: Uuid,
    pub customer_id: Uuid,
    pub method: PaymentMethod,
    /// Minor currency units.
    pub amount: i64,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges the customer and returns the provider's reference for the charge.
    async fn charge(&self, request: ChargeRequest) -> Result<String, Error>;
    async fn refund(&self, provider_ref: &str, amount: i64) -> Result<(), Error>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChargeResponse {
    provider_ref: String,
}

pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    key: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            key,
        }
    }
}

fn unreachable_gateway(err: reqwest::Error) -> Error {
    tracing::warn!(%err, "payment gateway unreachable");
    gateway_failure_error()
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[tracing::instrument(skip(self))]
    async fn charge(&self, request: ChargeRequest) -> Result<String, Error> {
        let url = format!("{}/charges", self.base_url);

        let res = self
            .client
            .post(url)
            .bearer_auth(&self.key)
            .json(&request)
            .send()
            .await
            .map_err(unreachable_gateway)?;

        if !res.status().is_success() {
            tracing::warn!(status = res.status().as_u16(), "charge rejected");
            return Err(gateway_failure_error());
        }

        let data: ChargeResponse = res.json().await.map_err(unreachable_gateway)?;

        Ok(data.provider_ref)
    }

    #[tracing::instrument(skip(self))]
    async fn refund(&self, provider_ref: &str, amount: i64) -> Result<(), Error> {
        let url = format!("{}/charges/{}/refunds", self.base_url, provider_ref);

        let res = self
            .client
            .post(url)
            .bearer_auth(&self.key)
            .json(&serde_json::json!({ "amount": amount }))
            .send()
            .await
            .map_err(unreachable_gateway)?;

        if !res.status().is_success() {
            tracing::warn!(status = res.status().as_u16(), "refund rejected");
            return Err(gateway_failure_error());
        }

        Ok(())
    }
}

/// Accepts every charge unless told to fail, and remembers what it was asked to do.
#[derive(Debug, Default)]
pub struct MemoryPaymentGateway {
    failing: AtomicBool,
    charges: Mutex<Vec<(String, ChargeRequest)>>,
    refunds: Mutex<Vec<(String, i64)>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    tracing::error!("payment gateway lock poisoned");
    unexpected_error()
}

impl MemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn charges(&self) -> Result<Vec<(String, ChargeRequest)>, Error> {
        Ok(self.charges.lock().map_err(poison_err)?.clone())
    }

    pub fn refunds(&self) -> Result<Vec<(String, i64)>, Error> {
        Ok(self.refunds.lock().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl PaymentGateway for MemoryPaymentGateway {
    async fn charge(&self, request: ChargeRequest) -> Result<String, Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(gateway_failure_error());
        }

        let provider_ref = format!("ch_{}", Uuid::new_v4().simple());
        self.charges
            .lock()
            .map_err(poison_err)?
            .push((provider_ref.clone(), request));

        Ok(provider_ref)
    }

    async fn refund(&self, provider_ref: &str, amount: i64) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(gateway_failure_error());
        }

        self.refunds
            .lock()
            .map_err(poison_err)?
            .push((provider_ref.to_string(), amount));

        Ok(())
    }
}

#[tokio::test]
async fn memory_gateway_records_charges_until_failing() {
    let gateway = MemoryPaymentGateway::new();
    let request = ChargeRequest {
        job_id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        method: PaymentMethod::Card,
        amount: 3_000,
    };

    let provider_ref = gateway.charge(request.clone()).await.unwrap();
    assert!(provider_ref.starts_with("ch_"));
    assert_eq!(gateway.charges().unwrap().len(), 1);

    gateway.set_failing(true);
    let err = gateway.charge(request).await.unwrap_err();
    assert!(err.is_gateway_failure());
    assert_eq!(gateway.charges().unwrap().len(), 1);
}

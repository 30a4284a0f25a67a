use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{invalid_state_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Wallet,
}

impl PaymentMethod {
    /// Whether money moves through the payment provider.
    pub fn is_gateway(&self) -> bool {
        !matches!(self, Self::Cash)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    OnHold,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::OnHold => "ON_HOLD",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// States an existing record may be overwritten from by a fresh payment initiation.
    pub fn is_replaceable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationSource {
    Customer,
    AutoSweep,
    Gateway,
}

/// Asynchronous result reported by the payment provider's webhook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOutcome {
    Succeeded,
    Failed,
}

/// Escrow record; exactly one per job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub job_id: Uuid,
    pub customer_id: Uuid,
    pub driver_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: i64,
    pub platform_fee: i64,
    pub driver_payout: i64,
    pub provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub held_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<ConfirmationSource>,
}

/// Splits `amount` into (platform fee, driver payout).
pub fn split_amount(amount: i64, fee_rate: f64) -> (i64, i64) {
    let fee = ((amount as f64) * fee_rate.clamp(0.0, 1.0)).round() as i64;
    (fee, amount - fee)
}

impl Payment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: Uuid,
        customer_id: Uuid,
        driver_id: Uuid,
        method: PaymentMethod,
        amount: i64,
        fee_rate: f64,
        provider_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let (platform_fee, driver_payout) = split_amount(amount, fee_rate);

        Self {
            id: Uuid::new_v4(),
            job_id,
            customer_id,
            driver_id,
            method,
            status: PaymentStatus::Pending,
            amount,
            platform_fee,
            driver_payout,
            provider_ref,
            created_at: now,
            held_at: None,
            completed_at: None,
            confirmed_by: None,
        }
    }

    pub fn hold(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        match self.status {
            PaymentStatus::Pending => {
                self.status = PaymentStatus::OnHold;
                self.held_at = Some(now);
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    pub fn complete(&mut self, source: ConfirmationSource, now: DateTime<Utc>) -> Result<(), Error> {
        match self.status {
            PaymentStatus::Pending | PaymentStatus::OnHold => {
                self.status = PaymentStatus::Completed;
                self.completed_at = Some(now);
                self.confirmed_by = Some(source);
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    pub fn fail(&mut self) -> Result<(), Error> {
        match self.status {
            PaymentStatus::Pending | PaymentStatus::OnHold | PaymentStatus::Failed => {
                self.status = PaymentStatus::Failed;
                Ok(())
            }
            _ => Err(invalid_state_error()),
        }
    }

    /// Money the provider has taken from the customer and could give back.
    pub fn captured_amount(&self) -> i64 {
        match self.status {
            PaymentStatus::Pending | PaymentStatus::OnHold if self.method.is_gateway() => self.amount,
            _ => 0,
        }
    }

    /// Marks the escrow refunded. Returns the status it had before.
    pub fn refund(&mut self) -> Result<PaymentStatus, Error> {
        let previous = self.status;

        match previous {
            PaymentStatus::Pending | PaymentStatus::OnHold => {
                self.status = PaymentStatus::Refunded;
                Ok(previous)
            }
            _ => Err(invalid_state_error()),
        }
    }
}

/// Ledger entry crediting a driver for a job. The unique `job_id` is what makes crediting happen once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub job_id: Uuid,
    pub driver_id: Uuid,
    pub amount: i64,
    pub source: ConfirmationSource,
    pub created_at: DateTime<Utc>,
}

impl Payout {
    pub fn for_payment(payment: &Payment, source: ConfirmationSource, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: payment.job_id,
            driver_id: payment.driver_id,
            amount: payment.driver_payout,
            source,
            created_at: now,
        }
    }
}

#[cfg(test)]
fn sample_payment(method: PaymentMethod) -> Payment {
    Payment::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        method,
        10_000,
        0.15,
        None,
        Utc::now(),
    )
}

#[test]
fn split_rounds_fee_and_keeps_the_total() {
    assert_eq!(split_amount(10_000, 0.15), (1_500, 8_500));
    assert_eq!(split_amount(333, 0.1), (33, 300));
    assert_eq!(split_amount(100, 1.5), (100, 0));
}

#[test]
fn escrow_moves_strictly_forward() {
    let now = Utc::now();
    let mut payment = sample_payment(PaymentMethod::Card);

    payment.hold(now).unwrap();
    assert_eq!(payment.status, PaymentStatus::OnHold);
    assert_eq!(payment.held_at, Some(now));
    assert!(payment.hold(now).unwrap_err().is_invalid_state());

    payment.complete(ConfirmationSource::AutoSweep, now).unwrap();
    assert_eq!(payment.confirmed_by, Some(ConfirmationSource::AutoSweep));
    assert!(payment
        .complete(ConfirmationSource::Customer, now)
        .unwrap_err()
        .is_invalid_state());
    assert!(payment.fail().unwrap_err().is_invalid_state());
    assert!(payment.refund().unwrap_err().is_invalid_state());
}

#[test]
fn only_gateway_escrow_has_captured_money() {
    let cash = sample_payment(PaymentMethod::Cash);
    assert_eq!(cash.captured_amount(), 0);

    let mut card = sample_payment(PaymentMethod::Card);
    assert_eq!(card.captured_amount(), 10_000);

    card.refund().unwrap();
    assert_eq!(card.captured_amount(), 0);
}

use super::Engine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    api::{EscrowAPI, SweepReport},
    auth::{Platform, User},
    entities::{ConfirmationSource, GatewayOutcome, Job, JobStatus, Payment, PaymentMethod, PaymentStatus},
    error::{invalid_state_error, not_found_error, out_of_order_error, Error},
    external::{ChargeRequest, Channel, Notification},
};

impl Engine {
    /// Whether the driver of a held job is verifiably at the dropoff. Location wins when
    /// there is one; otherwise the job's own status is trusted.
    async fn driver_at_destination(&self, job: &Job) -> bool {
        let by_status = matches!(job.status, JobStatus::DropoffArrived | JobStatus::Completed);

        let driver_id = match job.driver_id {
            Some(driver_id) => driver_id,
            None => return false,
        };

        match self.geo.last_location(driver_id).await {
            Ok(Some(location)) => {
                let distance_km = location.distance_km(&job.dropoff.coordinates);
                tracing::debug!(distance_km, "geofence check");
                distance_km <= self.config.escrow.geofence_radius_km
            }
            Ok(None) => by_status,
            Err(err) => {
                tracing::warn!(%err, "driver location unavailable, falling back to job status");
                by_status
            }
        }
    }

    /// Settles one stale hold. Returns whether it was finalized.
    #[tracing::instrument(skip(self, payment), fields(job_id = %payment.job_id))]
    async fn sweep_one(&self, payment: Payment, now: DateTime<Utc>) -> Result<bool, Error> {
        let job = self.store.find_job(payment.job_id).await?;

        if job.status != JobStatus::DropoffArrived {
            tracing::info!(status = job.status.name(), "held job not at dropoff, skipping");
            return Ok(false);
        }

        if !self.driver_at_destination(&job).await {
            tracing::info!("driver not at destination, skipping");
            return Ok(false);
        }

        Ok(self
            .finalize_delivery(job, payment, ConfirmationSource::AutoSweep, now)
            .await?
            .is_some())
    }
}

#[async_trait]
impl EscrowAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn initiate_payment(&self, user: User, job_id: Uuid, method: PaymentMethod) -> Result<Payment, Error> {
        let job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "initiate_payment", job.clone())?;

        if job.status.is_terminal() || job.is_pending_bids() {
            return Err(invalid_state_error());
        }

        let (driver_id, amount) = match (job.driver_id, job.final_price) {
            (Some(driver_id), Some(amount)) => (driver_id, amount),
            _ => return Err(invalid_state_error()),
        };

        if let Some(existing) = self.store.find_payment(job.id).await? {
            let charged = existing.status == PaymentStatus::Pending && existing.provider_ref.is_some();

            if !existing.status.is_replaceable() || charged {
                tracing::info!(status = existing.status.name(), "escrow already in progress");
                return Err(invalid_state_error());
            }
        }

        let driver = self.store.find_driver(driver_id).await?;

        // a failed charge leaves nothing behind
        let provider_ref = if method.is_gateway() {
            let provider_ref = self
                .gateway
                .charge(ChargeRequest {
                    job_id: job.id,
                    customer_id: job.customer_id,
                    method,
                    amount,
                })
                .await?;

            Some(provider_ref)
        } else {
            None
        };

        let payment = Payment::new(
            job.id,
            job.customer_id,
            driver_id,
            method,
            amount,
            driver.fee_rate,
            provider_ref,
            Utc::now(),
        );

        if !self.store.save_payment(&payment).await? {
            return Err(invalid_state_error());
        }

        tracing::info!(?method, amount, "payment initiated");

        Ok(payment)
    }

    #[tracing::instrument(skip(self))]
    async fn hold_payment(&self, user: User, job_id: Uuid) -> Result<Payment, Error> {
        let job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "hold_payment", job.clone())?;

        if job.status != JobStatus::DropoffArrived {
            return Err(invalid_state_error());
        }

        let mut payment = self
            .store
            .find_payment(job.id)
            .await?
            .ok_or_else(not_found_error)?;

        payment.hold(Utc::now())?;

        if !self
            .store
            .update_payment_if(&payment, PaymentStatus::Pending)
            .await?
        {
            return Err(invalid_state_error());
        }

        self.notify(
            Channel::Customer(job.customer_id),
            Notification::PaymentHeld {
                job_id: job.id,
                amount: payment.amount,
            },
        )
        .await;

        Ok(payment)
    }

    #[tracing::instrument(skip(self))]
    async fn confirm_delivery(&self, user: User, job_id: Uuid) -> Result<Job, Error> {
        let mut job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "confirm_delivery", job.clone())?;

        if job.status != JobStatus::DropoffArrived {
            return Err(invalid_state_error());
        }

        let now = Utc::now();

        if job.is_driver(user.id) {
            if job.confirm_by_driver(now)? {
                if !self
                    .store
                    .update_job_if(&job, JobStatus::DropoffArrived)
                    .await?
                {
                    return Err(invalid_state_error());
                }

                tracing::info!("driver confirmed delivery");

                self.notify(
                    Channel::Customer(job.customer_id),
                    Notification::DeliveryAwaitingConfirmation { job_id: job.id },
                )
                .await;
            }

            return Ok(job);
        }

        if job.driver_confirmed_at.is_none() {
            return Err(out_of_order_error());
        }

        let payment = self
            .store
            .find_payment(job.id)
            .await?
            .ok_or_else(invalid_state_error)?;

        self.finalize_delivery(job, payment, ConfirmationSource::Customer, now)
            .await?
            .ok_or_else(invalid_state_error)
    }

    #[tracing::instrument(skip(self))]
    async fn auto_confirm_sweep(&self, user: User) -> Result<SweepReport, Error> {
        self.authorize(user, "run_maintenance", Platform::new())?;

        let now = Utc::now();
        let cutoff = now - self.config.escrow.hold_timeout;
        let held = self.store.payments_held_before(cutoff).await?;

        let mut report = SweepReport::default();

        for payment in held {
            report.scanned += 1;
            let job_id = payment.job_id;

            match self.sweep_one(payment, now).await {
                Ok(true) => report.confirmed += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    tracing::error!(%err, %job_id, "auto-confirm failed for held payment");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(?report, "auto-confirm sweep finished");

        Ok(report)
    }

    #[tracing::instrument(skip(self))]
    async fn handle_gateway_callback(
        &self,
        user: User,
        provider_ref: String,
        outcome: GatewayOutcome,
    ) -> Result<Payment, Error> {
        self.authorize(user, "handle_gateway_callback", Platform::new())?;

        let mut payment = self
            .store
            .find_payment_by_ref(&provider_ref)
            .await?
            .ok_or_else(not_found_error)?;

        match outcome {
            GatewayOutcome::Succeeded => {
                let job = self.store.find_job(payment.job_id).await?;

                let open = matches!(payment.status, PaymentStatus::Pending | PaymentStatus::OnHold);
                if job.status != JobStatus::DropoffArrived || !open {
                    tracing::info!(
                        job_status = job.status.name(),
                        payment_status = payment.status.name(),
                        "nothing to finalize for gateway success"
                    );
                    return Ok(payment);
                }

                self.finalize_delivery(job, payment.clone(), ConfirmationSource::Gateway, Utc::now())
                    .await?;

                Ok(self
                    .store
                    .find_payment(payment.job_id)
                    .await?
                    .unwrap_or(payment))
            }
            GatewayOutcome::Failed => {
                let expected = payment.status;
                payment.fail()?;

                if !self.store.update_payment_if(&payment, expected).await? {
                    return Err(invalid_state_error());
                }

                tracing::warn!("payment failed at gateway");

                self.notify(
                    Channel::Customer(payment.customer_id),
                    Notification::PaymentFailed {
                        job_id: payment.job_id,
                    },
                )
                .await;

                Ok(payment)
            }
        }
    }
}

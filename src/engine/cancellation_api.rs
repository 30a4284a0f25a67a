use super::Engine;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    api::CancellationAPI,
    auth::{Platform, User},
    entities::{
        customer_fee, is_within_grace, refund_amount, Cancellation, Job, Payment, PaymentStatus,
        StrikeNotice,
    },
    error::{forbidden_error, invalid_state_error, Error},
    external::{Channel, Notification},
    store::{CancellationCommit, DriverChange},
};

/// What a cancellation gives back from the job's escrow.
struct Refundable {
    captured: i64,
    /// Escrow already marked refunded, with the status it was read in.
    payment: Option<(Payment, PaymentStatus)>,
    provider_ref: Option<String>,
}

fn refundable(payment: Option<Payment>) -> Result<Refundable, Error> {
    match payment {
        Some(mut payment) if payment.captured_amount() > 0 => {
            let captured = payment.captured_amount();
            let provider_ref = payment.provider_ref.clone();
            let previous = payment.refund()?;

            Ok(Refundable {
                captured,
                payment: Some((payment, previous)),
                provider_ref,
            })
        }
        _ => Ok(Refundable {
            captured: 0,
            payment: None,
            provider_ref: None,
        }),
    }
}

impl Engine {
    async fn announce_cancellation(&self, job: &Job, cancellation: &Cancellation) {
        let cancelled = Notification::JobCancelled {
            job_id: job.id,
            initiator: cancellation.initiator,
            fee: cancellation.fee,
            refund_amount: cancellation.refund_amount,
        };

        self.notify(Channel::Customer(job.customer_id), cancelled.clone())
            .await;
        if let Some(driver_id) = job.driver_id {
            self.notify(Channel::Driver(driver_id), cancelled).await;
        }
    }
}

#[async_trait]
impl CancellationAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn cancel_by_customer(&self, user: User, job_id: Uuid, reason: String) -> Result<Cancellation, Error> {
        let mut job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "cancel_by_customer", job.clone())?;

        if job.status.is_terminal() {
            return Err(invalid_state_error());
        }

        let now = Utc::now();
        let within_grace = is_within_grace(job.accepted_at, now, self.config.cancellation.grace_window);
        let fee = customer_fee(within_grace, self.config.cancellation.late_fee);

        let Refundable {
            captured,
            payment,
            provider_ref,
        } = refundable(self.store.find_payment(job.id).await?)?;
        let refund = refund_amount(captured, fee);

        let expected = job.status;
        job.cancel(now)?;

        let driver = match job.driver_id {
            Some(driver_id) => DriverChange::Release { driver_id },
            None => DriverChange::Nothing,
        };

        let committed = self
            .store
            .record_cancellation(CancellationCommit {
                job: job.clone(),
                expected,
                cancellation: Cancellation::by_customer(job.id, reason, within_grace, fee, refund, now),
                payment,
                driver,
                now,
            })
            .await?;

        tracing::info!(within_grace, fee, refund, "job cancelled by customer");

        if let Some(driver) = &committed.driver {
            self.restore_availability(driver.id).await;
        }

        let cancellation = self
            .process_refund(committed.cancellation, provider_ref)
            .await;

        self.announce_cancellation(&job, &cancellation).await;

        Ok(cancellation)
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_by_driver(&self, user: User, job_id: Uuid, reason: String) -> Result<Cancellation, Error> {
        match self.store.find_driver(user.id).await {
            Ok(driver) if driver.is_deactivated() => return Err(forbidden_error()),
            Ok(_) => {}
            // callers without a driver profile are turned away by the policy below
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let mut job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "cancel_by_driver", job.clone())?;

        if job.status.is_terminal() {
            return Err(invalid_state_error());
        }

        let driver_id = job.driver_id.ok_or_else(invalid_state_error)?;

        let now = Utc::now();

        // no grace for drivers, and the customer gets everything back
        let Refundable {
            captured,
            payment,
            provider_ref,
        } = refundable(self.store.find_payment(job.id).await?)?;

        let expected = job.status;
        job.cancel(now)?;

        let threshold = self.config.cancellation.strike_threshold;

        let committed = self
            .store
            .record_cancellation(CancellationCommit {
                job: job.clone(),
                expected,
                cancellation: Cancellation::by_driver(job.id, reason.clone(), captured, 0, false, now),
                payment,
                driver: DriverChange::Strike {
                    driver_id,
                    threshold,
                    reason,
                },
                now,
            })
            .await?;

        if let Some(driver) = &committed.driver {
            self.restore_availability(driver.id).await;
        }

        if let Some(strike) = committed.strike {
            tracing::info!(strikes = strike.strikes, deactivated = strike.deactivated, "strike issued");

            let notice = match strike.notice {
                StrikeNotice::Strike => Notification::StrikeIssued {
                    job_id: job.id,
                    strikes: strike.strikes,
                    threshold,
                },
                StrikeNotice::FinalWarning => Notification::FinalWarning {
                    job_id: job.id,
                    strikes: strike.strikes,
                    threshold,
                },
                StrikeNotice::Deactivated => Notification::DriverDeactivated {
                    reason: committed
                        .driver
                        .as_ref()
                        .and_then(|driver| driver.deactivation.as_ref())
                        .map(|deactivation| deactivation.reason.clone())
                        .unwrap_or_default(),
                },
            };

            self.notify(Channel::Driver(driver_id), notice).await;
        }

        let cancellation = self
            .process_refund(committed.cancellation, provider_ref)
            .await;

        self.announce_cancellation(&job, &cancellation).await;

        Ok(cancellation)
    }

    #[tracing::instrument(skip(self))]
    async fn reset_monthly_strikes(&self, user: User) -> Result<usize, Error> {
        self.authorize(user, "run_maintenance", Platform::new())?;

        let now = Utc::now();
        let cutoff = now - self.config.cancellation.strike_reset_period;

        let mut reset = 0;

        for driver in self.store.drivers_due_strike_reset(cutoff).await? {
            match self.store.reset_strikes_if_due(driver.id, cutoff, now).await {
                Ok(true) => reset += 1,
                Ok(false) => {}
                Err(err) => tracing::error!(%err, driver_id = %driver.id, "failed to reset strikes"),
            }
        }

        tracing::info!(reset, "monthly strike reset finished");

        Ok(reset)
    }
}

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::Engine;
use crate::{
    entities::{Cancellation, ConfirmationSource, Job, Payment, Payout, RefundStatus},
    error::Error,
    external::{Channel, Notification},
    queue::{EnqueueResult, Task},
    store::Finalization,
};

impl Engine {
    /// Sends without waiting on the outcome beyond logging it.
    pub(super) async fn notify(&self, channel: Channel, notification: Notification) {
        let event = notification.name();

        if let Err(err) = self.notifier.send(channel, notification).await {
            tracing::warn!(%err, ?channel, event, "notification delivery failed");
        }
    }

    pub(super) async fn schedule(&self, task: Task, delay: Duration) -> Result<(), Error> {
        match self.queue.enqueue(task.clone(), delay).await? {
            EnqueueResult::Enqueued { id } => {
                tracing::debug!(%id, task = task.name(), "task scheduled");
            }
            EnqueueResult::Deduplicated { existing_id } => {
                tracing::debug!(%existing_id, task = task.name(), "task already pending");
            }
        }

        Ok(())
    }

    /// Puts a freed driver back into the geo index's available set.
    pub(super) async fn restore_availability(&self, driver_id: Uuid) {
        match self.store.find_driver(driver_id).await {
            Ok(driver) if driver.is_available() => {
                if let Err(err) = self.geo.add_available(driver_id).await {
                    tracing::warn!(%err, %driver_id, "failed to re-add driver to geo index");
                }
            }
            Ok(_) => tracing::debug!(%driver_id, "driver not available, leaving geo index alone"),
            Err(err) => tracing::warn!(%err, %driver_id, "failed to load released driver"),
        }
    }

    /// Completes the job and escrow and credits the payout, once. Shared by customer
    /// confirmation, the auto-confirm sweep and gateway callbacks.
    ///
    /// Returns the completed job, or `None` if another path finalized it first.
    #[tracing::instrument(skip(self, job, payment), fields(job_id = %job.id))]
    pub(super) async fn finalize_delivery(
        &self,
        mut job: Job,
        mut payment: Payment,
        source: ConfirmationSource,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, Error> {
        let expected_payment = payment.status;

        job.complete(now)?;
        payment.complete(source, now)?;
        let payout = Payout::for_payment(&payment, source, now);

        let finalization = Finalization {
            job: job.clone(),
            payment,
            expected_payment,
            payout: payout.clone(),
        };

        if !self.store.finalize_delivery(&finalization).await? {
            tracing::info!("delivery already finalized, not crediting again");
            return Ok(None);
        }

        tracing::info!(payout = payout.amount, ?source, "delivery finalized");

        if let Some(driver_id) = job.driver_id {
            self.restore_availability(driver_id).await;
        }

        let completed = Notification::DeliveryCompleted {
            job_id: job.id,
            auto_confirmed: source == ConfirmationSource::AutoSweep,
            payout: payout.amount,
        };

        self.notify(Channel::Customer(job.customer_id), completed.clone())
            .await;
        if let Some(driver_id) = job.driver_id {
            self.notify(Channel::Driver(driver_id), completed).await;
        }

        Ok(Some(job))
    }

    /// Asks the gateway to return a cancelled job's money and records how that went.
    pub(super) async fn process_refund(
        &self,
        mut cancellation: Cancellation,
        provider_ref: Option<String>,
    ) -> Cancellation {
        let provider_ref = match (cancellation.refund_status, provider_ref) {
            (RefundStatus::Pending, Some(provider_ref)) => provider_ref,
            _ => return cancellation,
        };

        cancellation.refund_status = match self
            .gateway
            .refund(&provider_ref, cancellation.refund_amount)
            .await
        {
            Ok(()) => RefundStatus::Processed,
            Err(err) => {
                tracing::warn!(%err, job_id = %cancellation.job_id, "refund failed");
                RefundStatus::Failed
            }
        };

        if let Err(err) = self.store.update_cancellation(&cancellation).await {
            tracing::error!(%err, job_id = %cancellation.job_id, "failed to record refund status");
        }

        cancellation
    }
}

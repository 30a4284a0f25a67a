use super::Engine;

use async_trait::async_trait;

use crate::{
    api::{CancellationAPI, DispatchAPI, EscrowAPI, TaskAPI},
    auth::User,
    error::Error,
    queue::Task,
};

#[async_trait]
impl TaskAPI for Engine {
    #[tracing::instrument(skip(self, task), fields(task = task.name()))]
    async fn run_task(&self, task: Task) -> Result<(), Error> {
        match task {
            Task::DispatchStep { request, step } => {
                let outcome = self.run_dispatch_step(request, step).await?;
                tracing::debug!(?outcome, "dispatch step finished");
            }
            Task::CheckBids { request, step } => {
                let outcome = self.check_bids_and_continue(request, step).await?;
                tracing::debug!(?outcome, "bid check finished");
            }
            Task::AutoConfirmSweep => {
                self.auto_confirm_sweep(User::new_system_user()).await?;
            }
            Task::ResetMonthlyStrikes => {
                self.reset_monthly_strikes(User::new_system_user()).await?;
            }
        }

        Ok(())
    }

    /// A dispatch step that keeps failing counts as a tier with nobody in it.
    #[tracing::instrument(skip(self, task), fields(task = task.name()))]
    async fn handle_exhausted(&self, task: Task) -> Result<(), Error> {
        match task {
            Task::DispatchStep { request, step } | Task::CheckBids { request, step } => {
                let job = match self.store.find_job(request.job_id).await {
                    Ok(job) => job,
                    Err(err) if err.is_not_found() => {
                        tracing::warn!(job_id = %request.job_id, "abandoned dispatch step for an unknown job");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                };

                if !job.is_pending_bids() {
                    return Ok(());
                }

                let outcome = self.escalate(job, request, step).await?;
                tracing::warn!(?outcome, "dispatch step abandoned, escalated as empty");
            }
            Task::AutoConfirmSweep | Task::ResetMonthlyStrikes => {
                tracing::warn!("maintenance run abandoned, waiting for the next one");
            }
        }

        Ok(())
    }

    async fn schedule_next(&self, task: &Task) -> Result<(), Error> {
        match task {
            Task::AutoConfirmSweep => {
                self.schedule(Task::AutoConfirmSweep, self.config.escrow.sweep_interval)
                    .await
            }
            Task::ResetMonthlyStrikes => {
                self.schedule(
                    Task::ResetMonthlyStrikes,
                    self.config.cancellation.strike_reset_interval,
                )
                .await
            }
            _ => Ok(()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn schedule_maintenance(&self) -> Result<(), Error> {
        self.schedule(Task::AutoConfirmSweep, self.config.escrow.sweep_interval)
            .await?;
        self.schedule(
            Task::ResetMonthlyStrikes,
            self.config.cancellation.strike_reset_interval,
        )
        .await
    }
}

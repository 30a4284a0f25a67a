use super::Engine;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    api::{DispatchAPI, JobAPI},
    auth::{Platform, User},
    entities::{DispatchRequest, Job, NewJob},
    error::Error,
};

impl Engine {
    /// Takes a job that never got a dispatch chain out of PENDING_BIDS so it
    /// cannot sit there with nobody looking for drivers.
    async fn close_undispatched(&self, mut job: Job) {
        let expected = job.status;

        if let Err(err) = job.exhaust_dispatch(Utc::now()) {
            tracing::error!(%err, job_id = %job.id, "job could not be closed");
            return;
        }

        match self.store.update_job_if(&job, expected).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(job_id = %job.id, "job moved on before it could be closed"),
            Err(err) => tracing::error!(%err, job_id = %job.id, "job could not be closed"),
        }
    }
}

#[async_trait]
impl JobAPI for Engine {
    #[tracing::instrument(skip(self, new_job))]
    async fn create_job(&self, user: User, new_job: NewJob) -> Result<Job, Error> {
        self.authorize(user.clone(), "create_job", Platform::new())?;

        let job = Job::new(user.id, new_job, Utc::now())?;

        self.store.insert_job(&job).await?;

        tracing::info!(job_id = %job.id, "job created, starting dispatch");

        let dispatched = self
            .initiate_dispatch(DispatchRequest {
                job_id: job.id,
                pickup: job.pickup.coordinates,
                vehicle_class: job.vehicle_class,
            })
            .await;

        if let Err(err) = dispatched {
            tracing::error!(%err, job_id = %job.id, "could not schedule dispatch, closing job");
            self.close_undispatched(job).await;
            return Err(err);
        }

        Ok(job)
    }

    #[tracing::instrument(skip(self))]
    async fn find_job(&self, user: User, id: Uuid) -> Result<Job, Error> {
        let job = self.store.find_job(id).await?;

        self.authorize(user, "read", job.clone())?;

        Ok(job)
    }
}

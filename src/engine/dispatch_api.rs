use super::Engine;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    api::DispatchAPI,
    entities::{DispatchRequest, Driver, Job, StepOutcome},
    error::Error,
    external::{Channel, NearbyDriver, Notification},
    queue::Task,
    retry,
};

impl Engine {
    /// Drivers near the pickup who may take the job, nearest first. An unreachable
    /// geo index reads as nobody being around.
    async fn eligible_drivers(&self, job: &Job, radius_km: f64) -> Result<Vec<(Driver, f64)>, Error> {
        let center = job.pickup.coordinates;

        let nearby = match retry::with_backoff(&self.config.dispatch.geo_retry, "geo index query", || {
            self.geo.within_radius(center, radius_km)
        })
        .await
        {
            Ok(nearby) => nearby,
            Err(err) => {
                tracing::warn!(%err, radius_km, "geo index unavailable, treating tier as empty");
                vec![]
            }
        };

        let ids: Vec<Uuid> = nearby.iter().map(|nearby| nearby.driver_id).collect();
        let drivers = self.store.find_drivers(&ids).await?;

        Ok(nearby
            .into_iter()
            .filter_map(|NearbyDriver { driver_id, distance_km }| {
                drivers
                    .iter()
                    .find(|driver| driver.id == driver_id)
                    .filter(|driver| driver.is_eligible(job.vehicle_class))
                    .map(|driver| (driver.clone(), distance_km))
            })
            .collect())
    }

    /// Moves on to the tier after `step`, or gives up on the job when there is none.
    #[tracing::instrument(skip(self, job, request), fields(job_id = %job.id))]
    pub(super) async fn escalate(
        &self,
        mut job: Job,
        request: DispatchRequest,
        step: usize,
    ) -> Result<StepOutcome, Error> {
        let next_step = step + 1;

        if next_step < self.config.dispatch.tiers.len() {
            tracing::info!(next_step, "escalating dispatch radius");

            self.schedule(
                Task::DispatchStep {
                    request,
                    step: next_step,
                },
                self.config.dispatch.escalation_delay,
            )
            .await?;

            return Ok(StepOutcome::Escalated { next_step });
        }

        let expected = job.status;
        job.exhaust_dispatch(Utc::now())?;

        if !self.store.update_job_if(&job, expected).await? {
            tracing::debug!("job left PENDING_BIDS before dispatch gave up");
            return Ok(StepOutcome::Skipped);
        }

        tracing::info!("dispatch exhausted, no drivers available");

        self.notify(
            Channel::Customer(job.customer_id),
            Notification::NoDriversAvailable { job_id: job.id },
        )
        .await;

        Ok(StepOutcome::Exhausted)
    }

    /// Live bids whose driver could still be assigned the job. Bids from drivers
    /// who were since taken by another job or deactivated cannot be accepted.
    async fn acceptable_bid_count(&self, job: &Job) -> Result<usize, Error> {
        let now = Utc::now();

        let live: Vec<Uuid> = self
            .store
            .list_bids(job.id)
            .await?
            .into_iter()
            .filter(|bid| bid.is_live(now))
            .map(|bid| bid.driver_id)
            .collect();

        if live.is_empty() {
            return Ok(0);
        }

        let drivers = self.store.find_drivers(&live).await?;

        Ok(drivers
            .iter()
            .filter(|driver| driver.is_available() && !driver.is_deactivated())
            .count())
    }

    /// The job if it is still taking bids.
    async fn open_job(&self, job_id: Uuid) -> Result<Option<Job>, Error> {
        let job = self.store.find_job(job_id).await?;

        if !job.is_pending_bids() {
            tracing::debug!(status = job.status.name(), "job no longer PENDING_BIDS, skipping step");
            return Ok(None);
        }

        Ok(Some(job))
    }
}

#[async_trait]
impl DispatchAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn initiate_dispatch(&self, request: DispatchRequest) -> Result<(), Error> {
        self.schedule(
            Task::DispatchStep { request, step: 0 },
            self.config.dispatch.initial_delay,
        )
        .await
    }

    #[tracing::instrument(skip(self, request), fields(job_id = %request.job_id))]
    async fn run_dispatch_step(&self, request: DispatchRequest, step: usize) -> Result<StepOutcome, Error> {
        let job = match self.open_job(request.job_id).await? {
            Some(job) => job,
            None => return Ok(StepOutcome::Skipped),
        };

        let tier = match self.config.dispatch.tiers.get(step) {
            Some(tier) => *tier,
            None => {
                tracing::warn!(step, "dispatch step beyond the last tier");
                return self.escalate(job, request, step).await;
            }
        };

        let drivers = self.eligible_drivers(&job, tier.radius_km).await?;

        if drivers.is_empty() {
            tracing::info!(step, radius_km = tier.radius_km, "no eligible drivers in tier");
            return self.escalate(job, request, step).await;
        }

        let now = Utc::now();
        let mut notified = vec![];

        for (driver, distance_km) in drivers {
            // one page per driver per job, however often steps are re-delivered
            if !self
                .store
                .record_dispatch_notification(job.id, driver.id, now)
                .await?
            {
                continue;
            }

            self.notify(
                Channel::Driver(driver.id),
                Notification::JobOffered {
                    job_id: job.id,
                    pickup: job.pickup.clone(),
                    dropoff: job.dropoff.clone(),
                    vehicle_class: job.vehicle_class,
                    distance_km,
                    min_price: job.min_price,
                    max_price: job.max_price,
                },
            )
            .await;

            notified.push(driver.id);
        }

        tracing::info!(step, count = notified.len(), "drivers notified");

        self.schedule(Task::CheckBids { request, step }, tier.wait)
            .await?;

        Ok(StepOutcome::Notified { drivers: notified })
    }

    #[tracing::instrument(skip(self, request), fields(job_id = %request.job_id))]
    async fn check_bids_and_continue(
        &self,
        request: DispatchRequest,
        step: usize,
    ) -> Result<StepOutcome, Error> {
        let job = match self.open_job(request.job_id).await? {
            Some(job) => job,
            None => return Ok(StepOutcome::Skipped),
        };

        let count = self.acceptable_bid_count(&job).await?;

        if count > 0 {
            tracing::info!(count, "bids received, escalation stops");
            return Ok(StepOutcome::BidsReceived { count });
        }

        tracing::info!("no acceptable bids, escalating");

        self.escalate(job, request, step).await
    }
}

use super::Engine;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    api::AuctionAPI,
    auth::User,
    entities::{Bid, Effect, Job, JobStatus, NewBid},
    error::{forbidden_error, invalid_input_error, invalid_state_error, not_found_error, Error},
    external::{Channel, Notification},
    store::Acceptance,
};

#[async_trait]
impl AuctionAPI for Engine {
    #[tracing::instrument(skip(self, new_bid))]
    async fn submit_bid(&self, user: User, job_id: Uuid, new_bid: NewBid) -> Result<Bid, Error> {
        let job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "submit_bid", job.clone())?;

        let driver = self.store.find_driver(user.id).await?;
        if driver.is_deactivated() {
            return Err(forbidden_error());
        }

        if !job.is_pending_bids() {
            return Err(invalid_state_error());
        }

        if new_bid.price < job.min_price || new_bid.price > job.max_price {
            return Err(invalid_input_error());
        }

        let bid = Bid::new(
            job.id,
            driver.id,
            new_bid.price,
            new_bid.eta_minutes,
            new_bid.note,
            Utc::now(),
            self.config.auction.bid_ttl,
        );

        self.store.insert_bid(&bid).await?;

        tracing::info!(bid_id = %bid.id, price = bid.price, "bid submitted");

        self.notify(
            Channel::Customer(job.customer_id),
            Notification::BidReceived {
                job_id: job.id,
                bid_id: bid.id,
                driver_id: bid.driver_id,
                price: bid.price,
                eta_minutes: bid.eta_minutes,
            },
        )
        .await;

        Ok(bid)
    }

    #[tracing::instrument(skip(self))]
    async fn list_bids(&self, user: User, job_id: Uuid) -> Result<Vec<Bid>, Error> {
        let job = self.store.find_job(job_id).await?;

        self.authorize(user, "list_bids", job)?;

        self.store.list_bids(job_id).await
    }

    #[tracing::instrument(skip(self))]
    async fn accept_bid(&self, user: User, job_id: Uuid, bid_id: Uuid) -> Result<Job, Error> {
        let mut job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "accept_bid", job.clone())?;

        if !job.is_pending_bids() {
            tracing::info!("job is not in the PENDING_BIDS state, returning early...");
            return Err(invalid_state_error());
        }

        let now = Utc::now();

        let bid = self.store.find_bid(bid_id).await?;
        if bid.job_id != job.id {
            return Err(not_found_error());
        }
        if !bid.is_live(now) {
            return Err(invalid_state_error());
        }

        let driver = self.store.find_driver(bid.driver_id).await?;
        if driver.is_deactivated() {
            return Err(forbidden_error());
        }

        job.accept_bid(&bid, now)?;

        // preconditions are checked again inside the store; a lost race is InvalidState
        let rejected = self
            .store
            .accept_bid(&Acceptance {
                job: job.clone(),
                bid_id: bid.id,
                driver_id: driver.id,
                now,
            })
            .await?;

        tracing::info!(%bid_id, driver_id = %driver.id, rejected = rejected.len(), "bid accepted");

        if let Err(err) = self.geo.remove_available(driver.id).await {
            tracing::warn!(%err, driver_id = %driver.id, "failed to remove driver from geo index");
        }

        self.notify(
            Channel::Driver(driver.id),
            Notification::BidAccepted {
                job_id: job.id,
                bid_id: bid.id,
                price: bid.price,
            },
        )
        .await;

        for other in rejected {
            self.notify(
                Channel::Driver(other.driver_id),
                Notification::BidRejected {
                    job_id: job.id,
                    bid_id: other.id,
                },
            )
            .await;
        }

        Ok(job)
    }

    #[tracing::instrument(skip(self))]
    async fn advance_status(&self, user: User, job_id: Uuid, status: JobStatus) -> Result<Job, Error> {
        let mut job = self.store.find_job(job_id).await?;

        self.authorize(user.clone(), "advance_status", job.clone())?;

        let expected = job.status;
        let effects = job.advance(status, Utc::now())?;

        if !self.store.update_job_if(&job, expected).await? {
            tracing::info!("job changed underneath status update");
            return Err(invalid_state_error());
        }

        tracing::info!(from = expected.name(), to = status.name(), "job advanced");

        let changed = Notification::StatusChanged {
            job_id: job.id,
            status: job.status,
        };

        for effect in effects {
            match effect {
                Effect::NotifyCustomer => {
                    self.notify(Channel::Customer(job.customer_id), changed.clone())
                        .await
                }
                Effect::NotifyDriver => {
                    if let Some(driver_id) = job.driver_id {
                        self.notify(Channel::Driver(driver_id), changed.clone())
                            .await
                    }
                }
                Effect::Stamp(_) => {}
            }
        }

        Ok(job)
    }
}

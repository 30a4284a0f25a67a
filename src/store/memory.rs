use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Acceptance, CancellationCommit, CancellationCommitted, DriverChange, Finalization, Store};
use crate::entities::{
    Bid, BidStatus, Cancellation, Driver, Job, JobStatus, Payment, PaymentStatus, Payout,
};
use crate::error::{
    database_error, duplicate_bid_error, forbidden_error, invalid_state_error, not_found_error, unexpected_error, Error,
};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    bids: HashMap<Uuid, Bid>,
    drivers: HashMap<Uuid, Driver>,
    notifications: HashSet<(Uuid, Uuid)>,
    payments: HashMap<Uuid, Payment>,
    payouts: HashMap<Uuid, Payout>,
    cancellations: HashMap<Uuid, Cancellation>,
}

/// Single-process store. One lock around everything makes each call atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    driver_reads_failing: AtomicBool,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    tracing::error!("memory store lock poisoned");
    unexpected_error()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, Error> {
        self.state.lock().map_err(poison_err)
    }

    /// Edits a stored job in place, bypassing every guard. For fixtures.
    pub fn modify_job<F: FnOnce(&mut Job)>(&self, id: Uuid, f: F) -> Result<(), Error> {
        let mut state = self.lock()?;
        let job = state.jobs.get_mut(&id).ok_or_else(not_found_error)?;
        f(job);
        Ok(())
    }

    /// Edits a stored driver in place, bypassing every guard. For fixtures.
    pub fn modify_driver<F: FnOnce(&mut Driver)>(&self, id: Uuid, f: F) -> Result<(), Error> {
        let mut state = self.lock()?;
        let driver = state.drivers.get_mut(&id).ok_or_else(not_found_error)?;
        f(driver);
        Ok(())
    }

    /// Edits a job's escrow record in place, bypassing every guard. For fixtures.
    pub fn modify_payment<F: FnOnce(&mut Payment)>(&self, job_id: Uuid, f: F) -> Result<(), Error> {
        let mut state = self.lock()?;
        let payment = state.payments.get_mut(&job_id).ok_or_else(not_found_error)?;
        f(payment);
        Ok(())
    }

    pub fn jobs_of(&self, customer_id: Uuid) -> Result<Vec<Job>, Error> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|job| job.customer_id == customer_id)
            .cloned()
            .collect())
    }

    /// Makes `find_driver` fail the way an unreachable database would.
    pub fn set_driver_reads_failing(&self, failing: bool) {
        self.driver_reads_failing.store(failing, Ordering::SeqCst);
    }

    pub fn payout_count(&self) -> Result<usize, Error> {
        Ok(self.lock()?.payouts.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), Error> {
        self.lock()?.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_job(&self, id: Uuid) -> Result<Job, Error> {
        self.lock()?.jobs.get(&id).cloned().ok_or_else(not_found_error)
    }

    async fn update_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool, Error> {
        let mut state = self.lock()?;

        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == expected => {
                *stored = job.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(not_found_error()),
        }
    }

    async fn insert_bid(&self, bid: &Bid) -> Result<(), Error> {
        let mut state = self.lock()?;

        let job = state.jobs.get(&bid.job_id).ok_or_else(not_found_error)?;
        if !job.is_pending_bids() {
            return Err(invalid_state_error());
        }

        let same_driver = |other: &Bid| other.job_id == bid.job_id && other.driver_id == bid.driver_id;

        if state
            .bids
            .values()
            .any(|other| same_driver(other) && other.is_live(bid.created_at))
        {
            return Err(duplicate_bid_error());
        }

        for stale in state
            .bids
            .values_mut()
            .filter(|other| same_driver(other) && other.status == BidStatus::Active)
        {
            stale.expire();
        }

        state.bids.insert(bid.id, bid.clone());

        Ok(())
    }

    async fn find_bid(&self, id: Uuid) -> Result<Bid, Error> {
        self.lock()?.bids.get(&id).cloned().ok_or_else(not_found_error)
    }

    async fn list_bids(&self, job_id: Uuid) -> Result<Vec<Bid>, Error> {
        let state = self.lock()?;

        let mut bids: Vec<Bid> = state
            .bids
            .values()
            .filter(|bid| bid.job_id == job_id)
            .cloned()
            .collect();
        bids.sort_by_key(|bid| bid.created_at);

        Ok(bids)
    }

    async fn accept_bid(&self, acceptance: &Acceptance) -> Result<Vec<Bid>, Error> {
        let mut state = self.lock()?;
        let job = &acceptance.job;

        let stored = state.jobs.get(&job.id).ok_or_else(not_found_error)?;
        if stored.status != JobStatus::PendingBids {
            return Err(invalid_state_error());
        }

        let mut bid = state
            .bids
            .get(&acceptance.bid_id)
            .cloned()
            .ok_or_else(not_found_error)?;
        if bid.job_id != job.id {
            return Err(invalid_state_error());
        }
        bid.accept(acceptance.now)?;

        let mut driver = state
            .drivers
            .get(&acceptance.driver_id)
            .cloned()
            .ok_or_else(not_found_error)?;
        if driver.is_deactivated() {
            return Err(forbidden_error());
        }
        driver.assign(job.id)?;

        let mut rejected = vec![];
        for other in state
            .bids
            .values_mut()
            .filter(|other| other.job_id == job.id && other.id != bid.id && other.status == BidStatus::Active)
        {
            other.reject();
            rejected.push(other.clone());
        }

        state.bids.insert(bid.id, bid);
        state.drivers.insert(driver.id, driver);
        state.jobs.insert(job.id, job.clone());

        Ok(rejected)
    }

    async fn insert_driver(&self, driver: &Driver) -> Result<(), Error> {
        self.lock()?.drivers.insert(driver.id, driver.clone());
        Ok(())
    }

    async fn find_driver(&self, id: Uuid) -> Result<Driver, Error> {
        if self.driver_reads_failing.load(Ordering::SeqCst) {
            return Err(database_error("driver read failed"));
        }

        self.lock()?.drivers.get(&id).cloned().ok_or_else(not_found_error)
    }

    async fn find_drivers(&self, ids: &[Uuid]) -> Result<Vec<Driver>, Error> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.drivers.get(id).cloned())
            .collect())
    }

    async fn drivers_due_strike_reset(&self, cutoff: DateTime<Utc>) -> Result<Vec<Driver>, Error> {
        let state = self.lock()?;
        Ok(state
            .drivers
            .values()
            .filter(|driver| driver.strikes_reset_at < cutoff)
            .cloned()
            .collect())
    }

    async fn reset_strikes_if_due(&self, driver_id: Uuid, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut state = self.lock()?;
        let driver = state.drivers.get_mut(&driver_id).ok_or_else(not_found_error)?;

        if driver.strikes_reset_at >= cutoff {
            return Ok(false);
        }

        driver.reset_strikes(now);
        Ok(true)
    }

    async fn record_dispatch_notification(&self, job_id: Uuid, driver_id: Uuid, _at: DateTime<Utc>) -> Result<bool, Error> {
        Ok(self.lock()?.notifications.insert((job_id, driver_id)))
    }

    async fn find_payment(&self, job_id: Uuid) -> Result<Option<Payment>, Error> {
        Ok(self.lock()?.payments.get(&job_id).cloned())
    }

    async fn find_payment_by_ref(&self, provider_ref: &str) -> Result<Option<Payment>, Error> {
        let state = self.lock()?;
        Ok(state
            .payments
            .values()
            .find(|payment| payment.provider_ref.as_deref() == Some(provider_ref))
            .cloned())
    }

    async fn save_payment(&self, payment: &Payment) -> Result<bool, Error> {
        let mut state = self.lock()?;

        if let Some(existing) = state.payments.get(&payment.job_id) {
            if !existing.status.is_replaceable() {
                return Ok(false);
            }
        }

        state.payments.insert(payment.job_id, payment.clone());
        Ok(true)
    }

    async fn update_payment_if(&self, payment: &Payment, expected: PaymentStatus) -> Result<bool, Error> {
        let mut state = self.lock()?;

        match state.payments.get_mut(&payment.job_id) {
            Some(stored) if stored.status == expected => {
                *stored = payment.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(not_found_error()),
        }
    }

    async fn payments_held_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>, Error> {
        let state = self.lock()?;

        let mut held: Vec<Payment> = state
            .payments
            .values()
            .filter(|payment| payment.status == PaymentStatus::OnHold)
            .filter(|payment| payment.held_at.map_or(false, |at| at < cutoff))
            .cloned()
            .collect();
        held.sort_by_key(|payment| payment.held_at);

        Ok(held)
    }

    async fn find_payout(&self, job_id: Uuid) -> Result<Option<Payout>, Error> {
        Ok(self.lock()?.payouts.get(&job_id).cloned())
    }

    async fn finalize_delivery(&self, finalization: &Finalization) -> Result<bool, Error> {
        let mut state = self.lock()?;
        let job = &finalization.job;

        if state.payouts.contains_key(&job.id) {
            return Ok(false);
        }

        match state.jobs.get(&job.id) {
            Some(stored) if stored.status == JobStatus::DropoffArrived => {}
            _ => return Ok(false),
        }

        match state.payments.get(&job.id) {
            Some(stored) if stored.status == finalization.expected_payment => {}
            _ => return Ok(false),
        }

        if let Some(driver) = job.driver_id.and_then(|id| state.drivers.get_mut(&id)) {
            driver.release(job.id);
        }

        state.payouts.insert(job.id, finalization.payout.clone());
        state.payments.insert(job.id, finalization.payment.clone());
        state.jobs.insert(job.id, job.clone());

        Ok(true)
    }

    async fn record_cancellation(&self, commit: CancellationCommit) -> Result<CancellationCommitted, Error> {
        let mut state = self.lock()?;
        let CancellationCommit {
            job,
            expected,
            mut cancellation,
            payment,
            driver: change,
            now,
        } = commit;

        if state.cancellations.contains_key(&job.id) {
            return Err(invalid_state_error());
        }

        match state.jobs.get(&job.id) {
            Some(stored) if stored.status == expected => {}
            Some(_) => return Err(invalid_state_error()),
            None => return Err(not_found_error()),
        }

        if let Some((_, expected_payment)) = &payment {
            match state.payments.get(&job.id) {
                Some(stored) if stored.status == *expected_payment => {}
                _ => return Err(invalid_state_error()),
            }
        }

        let mut strike = None;
        let driver = match change {
            DriverChange::Nothing => None,
            DriverChange::Release { driver_id } => {
                let mut driver = state
                    .drivers
                    .get(&driver_id)
                    .cloned()
                    .ok_or_else(not_found_error)?;
                driver.release(job.id);
                Some(driver)
            }
            DriverChange::Strike {
                driver_id,
                threshold,
                reason,
            } => {
                let mut driver = state
                    .drivers
                    .get(&driver_id)
                    .cloned()
                    .ok_or_else(not_found_error)?;
                if driver.is_deactivated() {
                    return Err(forbidden_error());
                }

                let outcome = driver.issue_strike(now, threshold, &reason);
                driver.release(job.id);

                cancellation.strike_count = Some(outcome.strikes);
                cancellation.driver_deactivated = outcome.deactivated;
                strike = Some(outcome);

                Some(driver)
            }
        };

        if let Some(driver) = &driver {
            state.drivers.insert(driver.id, driver.clone());
        }
        if let Some((payment, _)) = payment {
            state.payments.insert(job.id, payment);
        }
        state.cancellations.insert(job.id, cancellation.clone());
        state.jobs.insert(job.id, job);

        Ok(CancellationCommitted {
            cancellation,
            driver,
            strike,
        })
    }

    async fn find_cancellation(&self, job_id: Uuid) -> Result<Option<Cancellation>, Error> {
        Ok(self.lock()?.cancellations.get(&job_id).cloned())
    }

    async fn update_cancellation(&self, cancellation: &Cancellation) -> Result<(), Error> {
        let mut state = self.lock()?;

        if !state.cancellations.contains_key(&cancellation.job_id) {
            return Err(not_found_error());
        }

        state
            .cancellations
            .insert(cancellation.job_id, cancellation.clone());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{available_driver, sample_new_job, VehicleClass};
    use chrono::Duration;

    async fn open_job(store: &MemoryStore) -> Job {
        let job = Job::new(Uuid::new_v4(), sample_new_job(), Utc::now()).unwrap();
        store.insert_job(&job).await.unwrap();
        job
    }

    fn bid(job: &Job, driver_id: Uuid, now: DateTime<Utc>) -> Bid {
        Bid::new(job.id, driver_id, 3_000, 10, "".into(), now, Duration::minutes(10))
    }

    #[tokio::test]
    async fn conditional_update_checks_expected_status() {
        let store = MemoryStore::new();
        let mut job = open_job(&store).await;

        job.cancel(Utc::now()).unwrap();

        assert!(!store.update_job_if(&job, JobStatus::BidAccepted).await.unwrap());
        assert!(store.update_job_if(&job, JobStatus::PendingBids).await.unwrap());
        assert!(!store.update_job_if(&job, JobStatus::PendingBids).await.unwrap());
    }

    #[tokio::test]
    async fn one_live_bid_per_driver_per_job() {
        let store = MemoryStore::new();
        let job = open_job(&store).await;
        let driver_id = Uuid::new_v4();
        let now = Utc::now();

        store.insert_bid(&bid(&job, driver_id, now)).await.unwrap();

        let err = store.insert_bid(&bid(&job, driver_id, now)).await.unwrap_err();
        assert!(err.is_duplicate_bid());

        // once the first bid lapses the driver may bid again
        let later = now + Duration::minutes(11);
        store.insert_bid(&bid(&job, driver_id, later)).await.unwrap();

        let statuses: Vec<BidStatus> = store
            .list_bids(job.id)
            .await
            .unwrap()
            .iter()
            .map(|bid| bid.status)
            .collect();
        assert_eq!(statuses, vec![BidStatus::Expired, BidStatus::Active]);
    }

    #[tokio::test]
    async fn acceptance_rejects_every_other_active_bid() {
        let store = MemoryStore::new();
        let mut job = open_job(&store).await;
        let now = Utc::now();

        let winner = available_driver(VehicleClass::Van);
        store.insert_driver(&winner).await.unwrap();

        let winning = bid(&job, winner.id, now);
        store.insert_bid(&winning).await.unwrap();
        store.insert_bid(&bid(&job, Uuid::new_v4(), now)).await.unwrap();
        store.insert_bid(&bid(&job, Uuid::new_v4(), now)).await.unwrap();

        job.accept_bid(&winning, now).unwrap();
        let rejected = store
            .accept_bid(&Acceptance {
                job: job.clone(),
                bid_id: winning.id,
                driver_id: winner.id,
                now,
            })
            .await
            .unwrap();

        assert_eq!(rejected.len(), 2);

        let bids = store.list_bids(job.id).await.unwrap();
        assert_eq!(bids.iter().filter(|b| b.status == BidStatus::Accepted).count(), 1);
        assert_eq!(bids.iter().filter(|b| b.status == BidStatus::Active).count(), 0);

        let driver = store.find_driver(winner.id).await.unwrap();
        assert!(!driver.is_available());

        // the second acceptance sees a job that already moved on
        let err = store
            .accept_bid(&Acceptance {
                job,
                bid_id: winning.id,
                driver_id: winner.id,
                now,
            })
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn dispatch_ledger_is_insert_if_absent() {
        let store = MemoryStore::new();
        let (job_id, driver_id) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(store.record_dispatch_notification(job_id, driver_id, Utc::now()).await.unwrap());
        assert!(!store.record_dispatch_notification(job_id, driver_id, Utc::now()).await.unwrap());
        assert!(store
            .record_dispatch_notification(Uuid::new_v4(), driver_id, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn completed_escrow_is_never_replaced() {
        use crate::entities::{ConfirmationSource, PaymentMethod};

        let store = MemoryStore::new();
        let now = Utc::now();
        let mut payment = Payment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            PaymentMethod::Cash,
            1_000,
            0.1,
            None,
            now,
        );

        assert!(store.save_payment(&payment).await.unwrap());
        assert!(store.save_payment(&payment).await.unwrap());

        payment.complete(ConfirmationSource::Customer, now).unwrap();
        assert!(store.update_payment_if(&payment, PaymentStatus::Pending).await.unwrap());
        assert!(!store.save_payment(&payment).await.unwrap());
    }
}

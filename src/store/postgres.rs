use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, Acquire, Executor, Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{Acceptance, CancellationCommit, CancellationCommitted, DriverChange, Finalization, Store};
use crate::entities::{Bid, Cancellation, Driver, Job, JobStatus, Payment, PaymentStatus, Payout};
use crate::error::{
    database_error, duplicate_bid_error, forbidden_error, invalid_state_error, not_found_error, Error,
};

type Database = Postgres;

/// Store backed by the tables created in `db::migrate`. Each record is a JSONB
/// document next to the columns that queries filter on.
pub struct PgStore {
    pool: Pool<Database>,
}

impl PgStore {
    pub fn new(pool: Pool<Database>) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[tracing::instrument(skip(tx))]
async fn fetch_job_for_update(tx: &mut Transaction<'_, Database>, id: &Uuid) -> Result<Job, Error> {
    let Json(job): Json<Job> = tx
        .fetch_optional(sqlx::query("SELECT data FROM jobs WHERE id = $1 FOR UPDATE").bind(id))
        .await?
        .ok_or_else(not_found_error)?
        .try_get("data")?;

    Ok(job)
}

#[tracing::instrument(skip(tx))]
async fn fetch_bid_for_update(tx: &mut Transaction<'_, Database>, id: &Uuid) -> Result<Bid, Error> {
    let Json(bid): Json<Bid> = tx
        .fetch_optional(sqlx::query("SELECT data FROM bids WHERE id = $1 FOR UPDATE").bind(id))
        .await?
        .ok_or_else(not_found_error)?
        .try_get("data")?;

    Ok(bid)
}

#[tracing::instrument(skip(tx))]
async fn fetch_driver_for_update(tx: &mut Transaction<'_, Database>, id: &Uuid) -> Result<Driver, Error> {
    let Json(driver): Json<Driver> = tx
        .fetch_optional(sqlx::query("SELECT data FROM drivers WHERE id = $1 FOR UPDATE").bind(id))
        .await?
        .ok_or_else(not_found_error)?
        .try_get("data")?;

    Ok(driver)
}

#[tracing::instrument(skip(tx, job), fields(job_id = %job.id))]
async fn update_job_where(
    tx: &mut Transaction<'_, Database>,
    job: &Job,
    expected: JobStatus,
) -> Result<bool, Error> {
    let updated = tx
        .execute(
            sqlx::query("UPDATE jobs SET status = $2, data = $3 WHERE id = $1 AND status = $4")
                .bind(&job.id)
                .bind(job.status.name())
                .bind(Json(job))
                .bind(expected.name()),
        )
        .await?
        .rows_affected();

    Ok(updated == 1)
}

#[tracing::instrument(skip(tx, bid), fields(bid_id = %bid.id))]
async fn update_bid(tx: &mut Transaction<'_, Database>, bid: &Bid) -> Result<(), Error> {
    tx.execute(
        sqlx::query("UPDATE bids SET status = $2, data = $3 WHERE id = $1")
            .bind(&bid.id)
            .bind(bid.status.name())
            .bind(Json(bid)),
    )
    .await?;

    Ok(())
}

#[tracing::instrument(skip(tx, driver), fields(driver_id = %driver.id))]
async fn update_driver(tx: &mut Transaction<'_, Database>, driver: &Driver) -> Result<(), Error> {
    tx.execute(
        sqlx::query("UPDATE drivers SET status = $2, strikes_reset_at = $3, data = $4 WHERE id = $1")
            .bind(&driver.id)
            .bind(driver.status.name())
            .bind(driver.strikes_reset_at)
            .bind(Json(driver)),
    )
    .await?;

    Ok(())
}

#[tracing::instrument(skip(tx, payment), fields(job_id = %payment.job_id))]
async fn update_payment_where(
    tx: &mut Transaction<'_, Database>,
    payment: &Payment,
    expected: PaymentStatus,
) -> Result<bool, Error> {
    let updated = tx
        .execute(
            sqlx::query(
                "UPDATE payments SET provider_ref = $2, status = $3, held_at = $4, data = $5
                 WHERE job_id = $1 AND status = $6",
            )
            .bind(&payment.job_id)
            .bind(&payment.provider_ref)
            .bind(payment.status.name())
            .bind(payment.held_at)
            .bind(Json(payment))
            .bind(expected.name()),
        )
        .await?
        .rows_affected();

    Ok(updated == 1)
}

#[async_trait]
impl Store for PgStore {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert_job(&self, job: &Job) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query("INSERT INTO jobs (id, customer_id, status, data) VALUES ($1, $2, $3, $4)")
                .bind(&job.id)
                .bind(&job.customer_id)
                .bind(job.status.name())
                .bind(Json(job)),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn find_job(&self, id: Uuid) -> Result<Job, Error> {
        let mut conn = self.pool.acquire().await?;

        let Json(job): Json<Job> = conn
            .fetch_optional(sqlx::query("SELECT data FROM jobs WHERE id = $1").bind(&id))
            .await?
            .ok_or_else(not_found_error)?
            .try_get("data")?;

        Ok(job)
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let updated = update_job_where(&mut tx, job, expected).await?;

        tx.commit().await?;

        Ok(updated)
    }

    #[tracing::instrument(skip(self, bid), fields(bid_id = %bid.id, job_id = %bid.job_id))]
    async fn insert_bid(&self, bid: &Bid) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let status: String = tx
            .fetch_optional(sqlx::query("SELECT status FROM jobs WHERE id = $1 FOR SHARE").bind(&bid.job_id))
            .await?
            .ok_or_else(not_found_error)?
            .try_get("status")?;

        if status != JobStatus::PendingBids.name() {
            return Err(invalid_state_error());
        }

        tx.execute(
            sqlx::query(
                "UPDATE bids SET status = 'EXPIRED', data = jsonb_set(data, '{status}', '\"EXPIRED\"')
                 WHERE job_id = $1 AND driver_id = $2 AND status = 'ACTIVE' AND expires_at <= $3",
            )
            .bind(&bid.job_id)
            .bind(&bid.driver_id)
            .bind(bid.created_at),
        )
        .await?;

        let inserted = tx
            .execute(
                sqlx::query(
                    "INSERT INTO bids (id, job_id, driver_id, status, created_at, expires_at, data)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(&bid.id)
                .bind(&bid.job_id)
                .bind(&bid.driver_id)
                .bind(bid.status.name())
                .bind(bid.created_at)
                .bind(bid.expires_at)
                .bind(Json(bid)),
            )
            .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Err(duplicate_bid_error()),
            Err(err) => return Err(database_error(err)),
        }

        tx.commit().await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn find_bid(&self, id: Uuid) -> Result<Bid, Error> {
        let mut conn = self.pool.acquire().await?;

        let Json(bid): Json<Bid> = conn
            .fetch_optional(sqlx::query("SELECT data FROM bids WHERE id = $1").bind(&id))
            .await?
            .ok_or_else(not_found_error)?
            .try_get("data")?;

        Ok(bid)
    }

    #[tracing::instrument(skip(self))]
    async fn list_bids(&self, job_id: Uuid) -> Result<Vec<Bid>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(sqlx::query("SELECT data FROM bids WHERE job_id = $1 ORDER BY created_at ASC").bind(&job_id))
            .await?;

        let mut bids = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let Json(bid): Json<Bid> = row.try_get("data")?;
            bids.push(bid);
        }

        Ok(bids)
    }

    #[tracing::instrument(skip(self, acceptance), fields(job_id = %acceptance.job.id, bid_id = %acceptance.bid_id))]
    async fn accept_bid(&self, acceptance: &Acceptance) -> Result<Vec<Bid>, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let job = &acceptance.job;

        let stored = fetch_job_for_update(&mut tx, &job.id).await?;
        if stored.status != JobStatus::PendingBids {
            tracing::info!("job is no longer PENDING_BIDS, rejecting acceptance");
            return Err(invalid_state_error());
        }

        let mut bid = fetch_bid_for_update(&mut tx, &acceptance.bid_id).await?;
        if bid.job_id != job.id {
            return Err(invalid_state_error());
        }
        bid.accept(acceptance.now)?;

        let mut driver = fetch_driver_for_update(&mut tx, &acceptance.driver_id).await?;
        if driver.is_deactivated() {
            return Err(forbidden_error());
        }
        driver.assign(job.id)?;

        let rows = tx
            .fetch_all(
                sqlx::query("SELECT data FROM bids WHERE job_id = $1 AND id <> $2 AND status = 'ACTIVE' FOR UPDATE")
                    .bind(&job.id)
                    .bind(&bid.id),
            )
            .await?;

        let mut rejected = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let Json(mut other): Json<Bid> = row.try_get("data")?;
            other.reject();
            update_bid(&mut tx, &other).await?;
            rejected.push(other);
        }

        update_bid(&mut tx, &bid).await?;
        update_driver(&mut tx, &driver).await?;

        if !update_job_where(&mut tx, job, JobStatus::PendingBids).await? {
            return Err(invalid_state_error());
        }

        tx.commit().await?;

        Ok(rejected)
    }

    #[tracing::instrument(skip(self, driver), fields(driver_id = %driver.id))]
    async fn insert_driver(&self, driver: &Driver) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query(
                "INSERT INTO drivers (id, status, strikes_reset_at, data) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, strikes_reset_at = EXCLUDED.strikes_reset_at, data = EXCLUDED.data",
            )
            .bind(&driver.id)
            .bind(driver.status.name())
            .bind(driver.strikes_reset_at)
            .bind(Json(driver)),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn find_driver(&self, id: Uuid) -> Result<Driver, Error> {
        let mut conn = self.pool.acquire().await?;

        let Json(driver): Json<Driver> = conn
            .fetch_optional(sqlx::query("SELECT data FROM drivers WHERE id = $1").bind(&id))
            .await?
            .ok_or_else(not_found_error)?
            .try_get("data")?;

        Ok(driver)
    }

    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    async fn find_drivers(&self, ids: &[Uuid]) -> Result<Vec<Driver>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(sqlx::query("SELECT data FROM drivers WHERE id = ANY($1)").bind(ids))
            .await?;

        let mut found = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let Json(driver): Json<Driver> = row.try_get("data")?;
            found.push(driver);
        }

        // keep the caller's order
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|driver| driver.id == *id).cloned())
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn drivers_due_strike_reset(&self, cutoff: DateTime<Utc>) -> Result<Vec<Driver>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(sqlx::query("SELECT data FROM drivers WHERE strikes_reset_at < $1").bind(cutoff))
            .await?;

        let mut drivers = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let Json(driver): Json<Driver> = row.try_get("data")?;
            drivers.push(driver);
        }

        Ok(drivers)
    }

    #[tracing::instrument(skip(self))]
    async fn reset_strikes_if_due(&self, driver_id: Uuid, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let mut driver = fetch_driver_for_update(&mut tx, &driver_id).await?;

        if driver.strikes_reset_at >= cutoff {
            return Ok(false);
        }

        driver.reset_strikes(now);
        update_driver(&mut tx, &driver).await?;

        tx.commit().await?;

        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    async fn record_dispatch_notification(&self, job_id: Uuid, driver_id: Uuid, at: DateTime<Utc>) -> Result<bool, Error> {
        let mut conn = self.pool.acquire().await?;

        let inserted = conn
            .execute(
                sqlx::query(
                    "INSERT INTO dispatch_notifications (job_id, driver_id, notified_at) VALUES ($1, $2, $3)
                     ON CONFLICT (job_id, driver_id) DO NOTHING",
                )
                .bind(&job_id)
                .bind(&driver_id)
                .bind(at),
            )
            .await?
            .rows_affected();

        Ok(inserted == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn find_payment(&self, job_id: Uuid) -> Result<Option<Payment>, Error> {
        let mut conn = self.pool.acquire().await?;

        let maybe_row = conn
            .fetch_optional(sqlx::query("SELECT data FROM payments WHERE job_id = $1").bind(&job_id))
            .await?;

        match maybe_row {
            Some(row) => {
                let Json(payment): Json<Payment> = row.try_get("data")?;
                Ok(Some(payment))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn find_payment_by_ref(&self, provider_ref: &str) -> Result<Option<Payment>, Error> {
        let mut conn = self.pool.acquire().await?;

        let maybe_row = conn
            .fetch_optional(sqlx::query("SELECT data FROM payments WHERE provider_ref = $1").bind(provider_ref))
            .await?;

        match maybe_row {
            Some(row) => {
                let Json(payment): Json<Payment> = row.try_get("data")?;
                Ok(Some(payment))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, payment), fields(job_id = %payment.job_id))]
    async fn save_payment(&self, payment: &Payment) -> Result<bool, Error> {
        let mut conn = self.pool.acquire().await?;

        let written = conn
            .execute(
                sqlx::query(
                    "INSERT INTO payments (job_id, provider_ref, status, held_at, data) VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (job_id) DO UPDATE SET
                        provider_ref = EXCLUDED.provider_ref,
                        status = EXCLUDED.status,
                        held_at = EXCLUDED.held_at,
                        data = EXCLUDED.data
                     WHERE payments.status IN ('PENDING', 'FAILED')",
                )
                .bind(&payment.job_id)
                .bind(&payment.provider_ref)
                .bind(payment.status.name())
                .bind(payment.held_at)
                .bind(Json(payment)),
            )
            .await?
            .rows_affected();

        Ok(written == 1)
    }

    #[tracing::instrument(skip(self, payment), fields(job_id = %payment.job_id))]
    async fn update_payment_if(&self, payment: &Payment, expected: PaymentStatus) -> Result<bool, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let updated = update_payment_where(&mut tx, payment, expected).await?;

        tx.commit().await?;

        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    async fn payments_held_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(
                sqlx::query(
                    "SELECT data FROM payments WHERE status = 'ON_HOLD' AND held_at < $1 ORDER BY held_at ASC",
                )
                .bind(cutoff),
            )
            .await?;

        let mut payments = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let Json(payment): Json<Payment> = row.try_get("data")?;
            payments.push(payment);
        }

        Ok(payments)
    }

    #[tracing::instrument(skip(self))]
    async fn find_payout(&self, job_id: Uuid) -> Result<Option<Payout>, Error> {
        let mut conn = self.pool.acquire().await?;

        let maybe_row = conn
            .fetch_optional(sqlx::query("SELECT data FROM payouts WHERE job_id = $1").bind(&job_id))
            .await?;

        match maybe_row {
            Some(row) => {
                let Json(payout): Json<Payout> = row.try_get("data")?;
                Ok(Some(payout))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, finalization), fields(job_id = %finalization.job.id))]
    async fn finalize_delivery(&self, finalization: &Finalization) -> Result<bool, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let job = &finalization.job;
        let payout = &finalization.payout;

        let inserted = tx
            .execute(
                sqlx::query(
                    "INSERT INTO payouts (job_id, driver_id, amount, data) VALUES ($1, $2, $3, $4)
                     ON CONFLICT (job_id) DO NOTHING",
                )
                .bind(&payout.job_id)
                .bind(&payout.driver_id)
                .bind(payout.amount)
                .bind(Json(payout)),
            )
            .await?
            .rows_affected();

        if inserted == 0 {
            tracing::debug!("payout already recorded, nothing to finalize");
            return Ok(false);
        }

        if !update_job_where(&mut tx, job, JobStatus::DropoffArrived).await? {
            tracing::debug!("job is no longer DROPOFF_ARRIVED, rolling back");
            return Ok(false);
        }

        if !update_payment_where(&mut tx, &finalization.payment, finalization.expected_payment).await? {
            tracing::debug!("escrow moved on, rolling back");
            return Ok(false);
        }

        if let Some(driver_id) = job.driver_id {
            let mut driver = fetch_driver_for_update(&mut tx, &driver_id).await?;
            driver.release(job.id);
            update_driver(&mut tx, &driver).await?;
        }

        tx.commit().await?;

        Ok(true)
    }

    #[tracing::instrument(skip(self, commit), fields(job_id = %commit.job.id))]
    async fn record_cancellation(&self, commit: CancellationCommit) -> Result<CancellationCommitted, Error> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let CancellationCommit {
            job,
            expected,
            mut cancellation,
            payment,
            driver: change,
            now,
        } = commit;

        if !update_job_where(&mut tx, &job, expected).await? {
            return Err(invalid_state_error());
        }

        if let Some((payment, expected_payment)) = &payment {
            if !update_payment_where(&mut tx, payment, *expected_payment).await? {
                return Err(invalid_state_error());
            }
        }

        let mut strike = None;
        let driver = match change {
            DriverChange::Nothing => None,
            DriverChange::Release { driver_id } => {
                let mut driver = fetch_driver_for_update(&mut tx, &driver_id).await?;
                driver.release(job.id);
                update_driver(&mut tx, &driver).await?;
                Some(driver)
            }
            DriverChange::Strike {
                driver_id,
                threshold,
                reason,
            } => {
                let mut driver = fetch_driver_for_update(&mut tx, &driver_id).await?;
                if driver.is_deactivated() {
                    return Err(forbidden_error());
                }

                let outcome = driver.issue_strike(now, threshold, &reason);
                driver.release(job.id);
                update_driver(&mut tx, &driver).await?;

                cancellation.strike_count = Some(outcome.strikes);
                cancellation.driver_deactivated = outcome.deactivated;
                strike = Some(outcome);

                Some(driver)
            }
        };

        let inserted = tx
            .execute(
                sqlx::query(
                    "INSERT INTO cancellations (job_id, data) VALUES ($1, $2) ON CONFLICT (job_id) DO NOTHING",
                )
                .bind(&cancellation.job_id)
                .bind(Json(&cancellation)),
            )
            .await?
            .rows_affected();

        if inserted == 0 {
            return Err(invalid_state_error());
        }

        tx.commit().await?;

        Ok(CancellationCommitted {
            cancellation,
            driver,
            strike,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn find_cancellation(&self, job_id: Uuid) -> Result<Option<Cancellation>, Error> {
        let mut conn = self.pool.acquire().await?;

        let maybe_row = conn
            .fetch_optional(sqlx::query("SELECT data FROM cancellations WHERE job_id = $1").bind(&job_id))
            .await?;

        match maybe_row {
            Some(row) => {
                let Json(cancellation): Json<Cancellation> = row.try_get("data")?;
                Ok(Some(cancellation))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, cancellation), fields(job_id = %cancellation.job_id))]
    async fn update_cancellation(&self, cancellation: &Cancellation) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        let updated = conn
            .execute(
                sqlx::query("UPDATE cancellations SET data = $2 WHERE job_id = $1")
                    .bind(&cancellation.job_id)
                    .bind(Json(cancellation)),
            )
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(not_found_error());
        }

        Ok(())
    }
}

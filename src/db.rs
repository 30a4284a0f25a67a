use sqlx::{postgres::PgPoolOptions, Executor, Pool, Postgres};

pub struct PgPool(pub Pool<Postgres>);

impl PgPool {
    pub async fn new(db_uri: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_uri)
            .await?;

        Ok(Self(pool))
    }
}

/// Creates every table the store, geo index and task queue use. Safe to run on each boot.
#[tracing::instrument(skip_all)]
pub async fn migrate(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    pool.execute("CREATE EXTENSION IF NOT EXISTS postgis").await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            customer_id UUID NOT NULL,
            status VARCHAR NOT NULL,
            data JSONB NOT NULL
        )",
    )
    .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS bids (
            id UUID PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES jobs(id),
            driver_id UUID NOT NULL,
            status VARCHAR NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            data JSONB NOT NULL
        )",
    )
    .await?;
    pool.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS bids_one_active_per_driver
         ON bids (job_id, driver_id) WHERE status = 'ACTIVE'",
    )
    .await?;
    pool.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS bids_one_accepted_per_job
         ON bids (job_id) WHERE status = 'ACCEPTED'",
    )
    .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS drivers (
            id UUID PRIMARY KEY,
            status VARCHAR NOT NULL,
            strikes_reset_at TIMESTAMPTZ NOT NULL,
            data JSONB NOT NULL
        )",
    )
    .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS dispatch_notifications (
            job_id UUID NOT NULL,
            driver_id UUID NOT NULL,
            notified_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (job_id, driver_id)
        )",
    )
    .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS payments (
            job_id UUID PRIMARY KEY REFERENCES jobs(id),
            provider_ref VARCHAR,
            status VARCHAR NOT NULL,
            held_at TIMESTAMPTZ,
            data JSONB NOT NULL
        )",
    )
    .await?;
    pool.execute("CREATE INDEX IF NOT EXISTS payments_provider_ref ON payments (provider_ref)")
        .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS payouts (
            job_id UUID PRIMARY KEY REFERENCES jobs(id),
            driver_id UUID NOT NULL,
            amount INT8 NOT NULL,
            data JSONB NOT NULL
        )",
    )
    .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS cancellations (
            job_id UUID PRIMARY KEY REFERENCES jobs(id),
            data JSONB NOT NULL
        )",
    )
    .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS driver_locations (
            driver_id UUID PRIMARY KEY,
            location geometry(Point, 4326) NOT NULL,
            available BOOLEAN NOT NULL DEFAULT FALSE,
            updated_at TIMESTAMPTZ NOT NULL
        )",
    )
    .await?;
    pool.execute(
        "CREATE INDEX IF NOT EXISTS driver_locations_location ON driver_locations USING GIST (location)",
    )
    .await?;

    pool.execute(
        "CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id UUID PRIMARY KEY,
            dedup_key VARCHAR NOT NULL UNIQUE,
            kind VARCHAR NOT NULL,
            payload JSONB NOT NULL,
            attempt INT4 NOT NULL DEFAULT 0,
            run_at TIMESTAMPTZ NOT NULL,
            leased_until TIMESTAMPTZ,
            enqueued_at TIMESTAMPTZ NOT NULL,
            last_error VARCHAR
        )",
    )
    .await?;

    Ok(())
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use geo_types::Geometry;
use geozero::wkb;
use serde::{Deserialize, Serialize};
use sqlx::{Executor, Pool, Postgres, Row};
use uuid::Uuid;

use crate::entities::Coordinates;
use crate::error::{unexpected_error, upstream_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NearbyDriver {
    pub driver_id: Uuid,
    pub distance_km: f64,
}

/// Last known driver positions plus the set of drivers open for new work.
#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Available drivers within `radius_km` of `center`, nearest first.
    async fn within_radius(&self, center: Coordinates, radius_km: f64) -> Result<Vec<NearbyDriver>, Error>;
    async fn add_available(&self, driver_id: Uuid) -> Result<(), Error>;
    async fn remove_available(&self, driver_id: Uuid) -> Result<(), Error>;
    /// Moves the driver without touching their availability.
    async fn update_location(&self, driver_id: Uuid, coordinates: Coordinates) -> Result<(), Error>;
    async fn last_location(&self, driver_id: Uuid) -> Result<Option<Coordinates>, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    location: Option<Coordinates>,
    available: bool,
}

#[derive(Debug, Default)]
pub struct MemoryGeoIndex {
    entries: Mutex<HashMap<Uuid, Entry>>,
    failing: AtomicBool,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    tracing::error!("geo index lock poisoned");
    unexpected_error()
}

impl MemoryGeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places an available driver at `coordinates`.
    pub fn insert(&self, driver_id: Uuid, coordinates: Coordinates) -> Result<(), Error> {
        self.lock()?.insert(
            driver_id,
            Entry {
                location: Some(coordinates),
                available: true,
            },
        );
        Ok(())
    }

    pub fn is_available(&self, driver_id: Uuid) -> Result<bool, Error> {
        Ok(self
            .lock()?
            .get(&driver_id)
            .map_or(false, |entry| entry.available))
    }

    /// Makes every call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Entry>>, Error> {
        self.entries.lock().map_err(poison_err)
    }

    fn check(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(upstream_error());
        }
        Ok(())
    }
}

#[async_trait]
impl GeoIndex for MemoryGeoIndex {
    async fn within_radius(&self, center: Coordinates, radius_km: f64) -> Result<Vec<NearbyDriver>, Error> {
        self.check()?;

        let entries = self.lock()?;

        let mut nearby: Vec<NearbyDriver> = entries
            .iter()
            .filter(|(_, entry)| entry.available)
            .filter_map(|(driver_id, entry)| {
                let distance_km = entry.location?.distance_km(&center);
                (distance_km <= radius_km).then(|| NearbyDriver {
                    driver_id: *driver_id,
                    distance_km,
                })
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });

        Ok(nearby)
    }

    async fn add_available(&self, driver_id: Uuid) -> Result<(), Error> {
        self.check()?;
        self.lock()?.entry(driver_id).or_default().available = true;
        Ok(())
    }

    async fn remove_available(&self, driver_id: Uuid) -> Result<(), Error> {
        self.check()?;
        if let Some(entry) = self.lock()?.get_mut(&driver_id) {
            entry.available = false;
        }
        Ok(())
    }

    async fn update_location(&self, driver_id: Uuid, coordinates: Coordinates) -> Result<(), Error> {
        self.check()?;
        self.lock()?.entry(driver_id).or_default().location = Some(coordinates);
        Ok(())
    }

    async fn last_location(&self, driver_id: Uuid) -> Result<Option<Coordinates>, Error> {
        self.check()?;
        Ok(self.lock()?.get(&driver_id).and_then(|entry| entry.location))
    }
}

/// PostGIS-backed index over the `driver_locations` table.
pub struct PgGeoIndex {
    pool: Pool<Postgres>,
}

impl PgGeoIndex {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GeoIndex for PgGeoIndex {
    #[tracing::instrument(skip(self))]
    async fn within_radius(&self, center: Coordinates, radius_km: f64) -> Result<Vec<NearbyDriver>, Error> {
        let center: Geometry<f64> = center.into();

        let query = "
            SELECT
                driver_id,
                ST_Distance(location::geography, ST_SetSRID($1, 4326)::geography) AS distance
            FROM
                driver_locations
            WHERE
                available
                AND ST_DWithin(location::geography, ST_SetSRID($1, 4326)::geography, $2)
            ORDER BY
                distance ASC, driver_id ASC
        ";

        let mut conn = self.pool.acquire().await?;
        let rows = conn
            .fetch_all(
                sqlx::query(query)
                    .bind(wkb::Encode(center))
                    .bind(radius_km * 1000.0),
            )
            .await?;

        let mut nearby = Vec::with_capacity(rows.len());

        for row in rows.iter() {
            let distance_m: f64 = row.try_get("distance")?;

            nearby.push(NearbyDriver {
                driver_id: row.try_get("driver_id")?,
                distance_km: distance_m / 1000.0,
            });
        }

        Ok(nearby)
    }

    #[tracing::instrument(skip(self))]
    async fn add_available(&self, driver_id: Uuid) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query("UPDATE driver_locations SET available = TRUE WHERE driver_id = $1").bind(&driver_id),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn remove_available(&self, driver_id: Uuid) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query("UPDATE driver_locations SET available = FALSE WHERE driver_id = $1").bind(&driver_id),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn update_location(&self, driver_id: Uuid, coordinates: Coordinates) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        let coordinates: Geometry<f64> = coordinates.into();

        conn.execute(
            sqlx::query(
                "INSERT INTO driver_locations (driver_id, location, updated_at) VALUES ($1, ST_SetSRID($2, 4326), $3)
                 ON CONFLICT (driver_id) DO UPDATE SET location = EXCLUDED.location, updated_at = EXCLUDED.updated_at",
            )
            .bind(&driver_id)
            .bind(wkb::Encode(coordinates))
            .bind(Utc::now()),
        )
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn last_location(&self, driver_id: Uuid) -> Result<Option<Coordinates>, Error> {
        let mut conn = self.pool.acquire().await?;

        let maybe_row = conn
            .fetch_optional(
                sqlx::query("SELECT ST_Y(location) AS lat, ST_X(location) AS lng FROM driver_locations WHERE driver_id = $1")
                    .bind(&driver_id),
            )
            .await?;

        match maybe_row {
            Some(row) => Ok(Some(Coordinates::new(row.try_get("lat")?, row.try_get("lng")?))),
            None => Ok(None),
        }
    }
}

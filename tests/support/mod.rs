#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use uuid::Uuid;

use cartage::api::{AuctionAPI, EscrowAPI, JobAPI};
use cartage::auth::User;
use cartage::config::Config;
use cartage::engine::{Components, Engine};
use cartage::entities::{
    Bid, Coordinates, Driver, DriverStatus, Job, JobStatus, Location, NewBid, NewJob, Payment, PaymentMethod,
    VehicleClass,
};
use cartage::external::{MemoryGeoIndex, MemoryNotifier, MemoryPaymentGateway};
use cartage::queue::memory::InMemoryTaskQueue;
use cartage::queue::worker::{Delivery, Worker};
use cartage::queue::TaskQueue;
use cartage::retry::RetryPolicy;
use cartage::store::{MemoryStore, Store};

pub const PICKUP: Coordinates = Coordinates {
    lat: 24.8607,
    lng: 67.0011,
};

pub const DROPOFF: Coordinates = Coordinates {
    lat: 24.9056,
    lng: 67.0822,
};

/// A point roughly `km` north of the pickup.
pub fn north_of_pickup(km: f64) -> Coordinates {
    Coordinates::new(PICKUP.lat + km / 111.19, PICKUP.lng)
}

pub fn fast_config() -> Config {
    let mut config = Config::default();

    let quick = RetryPolicy {
        max_attempts: 2,
        min_backoff: StdDuration::from_millis(1),
        max_backoff: StdDuration::from_millis(2),
    };

    config.dispatch.geo_retry = quick;
    config.queue.retry = quick;

    config
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub geo: Arc<MemoryGeoIndex>,
    pub notifier: Arc<MemoryNotifier>,
    pub gateway: Arc<MemoryPaymentGateway>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub worker: Worker,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let geo = Arc::new(MemoryGeoIndex::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let gateway = Arc::new(MemoryPaymentGateway::new());
        let queue = Arc::new(InMemoryTaskQueue::new());

        let components = Components {
            store: store.clone(),
            geo: geo.clone(),
            notifier: notifier.clone(),
            gateway: gateway.clone(),
            queue: queue.clone(),
        };

        let engine = Arc::new(Engine::new(components, config.clone()).unwrap());
        let worker = Worker::new(queue.clone(), engine.clone(), config.queue);

        Self {
            engine,
            store,
            geo,
            notifier,
            gateway,
            queue,
            worker,
        }
    }

    /// An available, verified van driver parked at `at`.
    pub async fn add_driver(&self, at: Coordinates) -> Uuid {
        let mut driver = Driver::new(Uuid::new_v4(), VehicleClass::Van, Utc::now());
        driver.status = DriverStatus::Available;
        driver.verified = true;

        self.store.insert_driver(&driver).await.unwrap();
        self.geo.insert(driver.id, at).unwrap();

        driver.id
    }

    pub async fn post_job(&self, customer_id: Uuid) -> Job {
        let new_job = NewJob {
            pickup: Location::new(PICKUP, "Saddar".into()),
            dropoff: Location::new(DROPOFF, "Gulshan".into()),
            vehicle_class: VehicleClass::Van,
            min_price: 2_000,
            max_price: 5_000,
        };

        self.engine
            .create_job(User::customer(customer_id), new_job)
            .await
            .unwrap()
    }

    pub async fn bid(&self, driver_id: Uuid, job_id: Uuid, price: i64) -> Bid {
        self.engine
            .submit_bid(
                User::driver(driver_id),
                job_id,
                NewBid {
                    price,
                    eta_minutes: 15,
                    note: String::new(),
                },
            )
            .await
            .unwrap()
    }

    /// A job whose bid from a fresh driver next to the pickup was accepted.
    pub async fn accepted_job(&self) -> (Job, Uuid, Uuid) {
        let customer_id = Uuid::new_v4();
        let driver_id = self.add_driver(north_of_pickup(1.0)).await;
        let job = self.accepted_job_with(customer_id, driver_id).await;

        (job, customer_id, driver_id)
    }

    pub async fn accepted_job_with(&self, customer_id: Uuid, driver_id: Uuid) -> Job {
        let job = self.post_job(customer_id).await;
        let bid = self.bid(driver_id, job.id, 3_000).await;

        self.engine
            .accept_bid(User::customer(customer_id), job.id, bid.id)
            .await
            .unwrap()
    }

    /// Walks an accepted job to DROPOFF_ARRIVED.
    pub async fn drive_to_dropoff(&self, job_id: Uuid, driver_id: Uuid) -> Job {
        let mut job = None;

        for status in [
            JobStatus::DriverArriving,
            JobStatus::PickupArrived,
            JobStatus::Loading,
            JobStatus::InTransit,
            JobStatus::DropoffArrived,
        ] {
            job = Some(
                self.engine
                    .advance_status(User::driver(driver_id), job_id, status)
                    .await
                    .unwrap(),
            );
        }

        job.unwrap()
    }

    /// Job at the dropoff with a held payment of `method`.
    pub async fn held_job(&self, method: PaymentMethod) -> (Job, Uuid, Uuid, Payment) {
        let (job, customer_id, driver_id) = self.accepted_job().await;

        self.engine
            .initiate_payment(User::customer(customer_id), job.id, method)
            .await
            .unwrap();
        let job = self.drive_to_dropoff(job.id, driver_id).await;
        let payment = self
            .engine
            .hold_payment(User::driver(driver_id), job.id)
            .await
            .unwrap();

        (job, customer_id, driver_id, payment)
    }

    /// Delivers every pending task once, ignoring run-at times. Tasks scheduled by
    /// those deliveries wait for the next call.
    pub async fn run_pending(&self) -> Vec<Delivery> {
        let envelopes = self
            .queue
            .claim_due(Utc::now() + Duration::days(365), 1_000, Duration::minutes(5))
            .await
            .unwrap();

        let mut deliveries = vec![];
        for envelope in envelopes {
            deliveries.push(self.worker.deliver(envelope).await.unwrap());
        }

        deliveries
    }
}

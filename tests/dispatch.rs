mod support;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use cartage::api::{AuctionAPI, JobAPI};
use cartage::auth::User;
use cartage::engine::{Components, Engine};
use cartage::entities::{Deactivation, JobStatus, Location, NewJob, VehicleClass};
use cartage::error::{database_error, Error};
use cartage::external::{Channel, MemoryGeoIndex, MemoryNotifier, MemoryPaymentGateway};
use cartage::queue::worker::Delivery;
use cartage::queue::{EnqueueResult, Task, TaskEnvelope, TaskQueue};
use cartage::store::MemoryStore;

use support::{fast_config, north_of_pickup, Harness, DROPOFF, PICKUP};

fn pending_steps(harness: &Harness) -> Vec<(&'static str, usize)> {
    harness
        .queue
        .pending_where(|_| true)
        .unwrap()
        .into_iter()
        .filter_map(|task| match task {
            Task::DispatchStep { step, .. } => Some(("dispatch", step)),
            Task::CheckBids { step, .. } => Some(("check_bids", step)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn escalates_until_the_tier_that_reaches_drivers() {
    let harness = Harness::new();

    let mut far = vec![];
    for _ in 0..3 {
        far.push(harness.add_driver(north_of_pickup(15.0)).await);
    }

    let customer_id = Uuid::new_v4();
    let job = harness.post_job(customer_id).await;
    assert_eq!(pending_steps(&harness), vec![("dispatch", 0)]);

    // 5 km and 10 km find nobody
    harness.run_pending().await;
    assert_eq!(pending_steps(&harness), vec![("dispatch", 1)]);
    harness.run_pending().await;
    assert_eq!(pending_steps(&harness), vec![("dispatch", 2)]);

    harness.run_pending().await;
    assert_eq!(pending_steps(&harness), vec![("check_bids", 2)]);

    let mut offered = harness.notifier.recipients_of("job_offered").unwrap();
    offered.sort_by_key(|channel| format!("{:?}", channel));
    let mut expected: Vec<Channel> = far.iter().map(|id| Channel::Driver(*id)).collect();
    expected.sort_by_key(|channel| format!("{:?}", channel));
    assert_eq!(offered, expected);

    let stored = harness.engine.find_job(User::customer(customer_id), job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::PendingBids);

    harness.bid(far[0], job.id, 4_000).await;

    // a live bid stops the search
    let deliveries = harness.run_pending().await;
    assert_eq!(deliveries, vec![Delivery::Completed]);
    assert!(harness.queue.pending().unwrap().is_empty());
    assert_eq!(harness.notifier.recipients_of("job_offered").unwrap().len(), 3);
}

#[tokio::test]
async fn drivers_are_paged_once_per_job() {
    let harness = Harness::new();
    let near = harness.add_driver(north_of_pickup(1.0)).await;

    let job = harness.post_job(Uuid::new_v4()).await;
    harness.run_pending().await;

    // no bids, so the 10 km tier finds the same driver again
    harness.run_pending().await;
    harness.run_pending().await;

    let offers: Vec<_> = harness
        .notifier
        .sent_to(Channel::Driver(near))
        .unwrap()
        .into_iter()
        .filter(|notification| notification.name() == "job_offered")
        .collect();
    assert_eq!(offers.len(), 1);

    let stored = harness
        .engine
        .find_job(User::new_system_user(), job.id)
        .await
        .unwrap();
    assert_eq!(stored.status, JobStatus::PendingBids);
}

#[tokio::test]
async fn acceptance_mid_escalation_stops_later_steps() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();

    let job = harness.post_job(customer_id).await;
    harness.run_pending().await;
    assert_eq!(pending_steps(&harness), vec![("dispatch", 1)]);

    let driver_id = harness.add_driver(north_of_pickup(0.5)).await;
    let bid = harness.bid(driver_id, job.id, 3_500).await;
    harness
        .engine
        .accept_bid(User::customer(customer_id), job.id, bid.id)
        .await
        .unwrap();

    harness.run_pending().await;

    assert!(harness.queue.pending().unwrap().is_empty());
    assert!(harness.notifier.recipients_of("job_offered").unwrap().is_empty());

    let stored = harness.engine.find_job(User::customer(customer_id), job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::BidAccepted);
    assert_eq!(stored.driver_id, Some(driver_id));
}

#[tokio::test]
async fn runs_out_of_tiers_without_drivers() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();

    let job = harness.post_job(customer_id).await;

    for _ in 0..4 {
        harness.run_pending().await;
    }

    assert!(harness.queue.pending().unwrap().is_empty());

    let stored = harness.engine.find_job(User::customer(customer_id), job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::NoDriversAvailable);
    assert_eq!(
        harness.notifier.recipients_of("no_drivers_available").unwrap(),
        vec![Channel::Customer(customer_id)]
    );

    let late = harness.add_driver(north_of_pickup(1.0)).await;
    let err = harness
        .engine
        .submit_bid(
            User::driver(late),
            job.id,
            cartage::entities::NewBid {
                price: 3_000,
                eta_minutes: 10,
                note: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
}

#[tokio::test]
async fn unreachable_geo_index_counts_as_an_empty_tier() {
    let harness = Harness::new();
    harness.add_driver(north_of_pickup(1.0)).await;
    harness.geo.set_failing(true);

    harness.post_job(Uuid::new_v4()).await;
    let deliveries = harness.run_pending().await;

    assert_eq!(deliveries, vec![Delivery::Completed]);
    assert_eq!(pending_steps(&harness), vec![("dispatch", 1)]);
    assert!(harness.notifier.recipients_of("job_offered").unwrap().is_empty());

    harness.geo.set_failing(false);
    harness.run_pending().await;
    assert_eq!(harness.notifier.recipients_of("job_offered").unwrap().len(), 1);
}

#[tokio::test]
async fn ineligible_drivers_are_not_paged() {
    let harness = Harness::new();

    let unverified = harness.add_driver(north_of_pickup(1.0)).await;
    harness
        .store
        .modify_driver(unverified, |driver| driver.verified = false)
        .unwrap();

    let truck = harness.add_driver(north_of_pickup(1.0)).await;
    harness
        .store
        .modify_driver(truck, |driver| {
            driver.vehicle_class = cartage::entities::VehicleClass::Truck
        })
        .unwrap();

    let good = harness.add_driver(north_of_pickup(2.0)).await;

    harness.post_job(Uuid::new_v4()).await;
    harness.run_pending().await;

    assert_eq!(
        harness.notifier.recipients_of("job_offered").unwrap(),
        vec![Channel::Driver(good)]
    );
}

#[tokio::test]
async fn bids_from_drivers_taken_elsewhere_do_not_stop_the_search() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();
    let driver_id = harness.add_driver(north_of_pickup(1.0)).await;

    let job = harness.post_job(customer_id).await;
    harness.run_pending().await;
    assert_eq!(pending_steps(&harness), vec![("check_bids", 0)]);

    let stale = harness.bid(driver_id, job.id, 3_000).await;

    // the same driver wins another job before the bid window closes
    harness.accepted_job_with(Uuid::new_v4(), driver_id).await;

    let err = harness
        .engine
        .accept_bid(User::customer(customer_id), job.id, stale.id)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());

    harness.run_pending().await;
    assert_eq!(pending_steps(&harness), vec![("dispatch", 1)]);

    let stored = harness.engine.find_job(User::customer(customer_id), job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::PendingBids);
}

#[tokio::test]
async fn bids_from_deactivated_drivers_do_not_stop_the_search() {
    let harness = Harness::new();
    let driver_id = harness.add_driver(north_of_pickup(1.0)).await;

    let job = harness.post_job(Uuid::new_v4()).await;
    harness.run_pending().await;
    harness.bid(driver_id, job.id, 3_000).await;

    harness
        .store
        .modify_driver(driver_id, |driver| {
            driver.deactivation = Some(Deactivation {
                reason: "documents expired".into(),
                at: Utc::now(),
            })
        })
        .unwrap();

    harness.run_pending().await;
    assert_eq!(pending_steps(&harness), vec![("dispatch", 1)]);
}

/// A queue whose backing table is unreachable.
struct UnreachableQueue;

#[async_trait]
impl TaskQueue for UnreachableQueue {
    async fn enqueue(&self, _: Task, _: Duration) -> Result<EnqueueResult, Error> {
        Err(database_error("connection refused"))
    }

    async fn claim_due(&self, _: DateTime<Utc>, _: usize, _: Duration) -> Result<Vec<TaskEnvelope>, Error> {
        Err(database_error("connection refused"))
    }

    async fn complete(&self, _: Uuid) -> Result<(), Error> {
        Err(database_error("connection refused"))
    }

    async fn reschedule(&self, _: Uuid, _: Duration, _: &str) -> Result<(), Error> {
        Err(database_error("connection refused"))
    }

    async fn abandon(&self, _: Uuid, _: &str) -> Result<(), Error> {
        Err(database_error("connection refused"))
    }

    async fn depth(&self) -> Result<usize, Error> {
        Err(database_error("connection refused"))
    }
}

#[tokio::test]
async fn job_without_a_dispatch_chain_is_closed() {
    let store = Arc::new(MemoryStore::new());

    let engine = Engine::new(
        Components {
            store: store.clone(),
            geo: Arc::new(MemoryGeoIndex::new()),
            notifier: Arc::new(MemoryNotifier::new()),
            gateway: Arc::new(MemoryPaymentGateway::new()),
            queue: Arc::new(UnreachableQueue),
        },
        fast_config(),
    )
    .unwrap();

    let customer_id = Uuid::new_v4();
    let new_job = NewJob {
        pickup: Location::new(PICKUP, "Saddar".into()),
        dropoff: Location::new(DROPOFF, "Gulshan".into()),
        vehicle_class: VehicleClass::Van,
        min_price: 2_000,
        max_price: 5_000,
    };

    let err = engine
        .create_job(User::customer(customer_id), new_job)
        .await
        .unwrap_err();
    assert!(err.is_internal());

    let jobs = store.jobs_of(customer_id).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::NoDriversAvailable);
}

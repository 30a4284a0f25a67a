mod support;

use std::sync::Arc;

use uuid::Uuid;

use cartage::api::{AuctionAPI, DriverAPI};
use cartage::auth::User;
use cartage::entities::{BidStatus, DriverStatus, JobStatus, NewBid};
use cartage::external::{Channel, GeoIndex};
use cartage::store::Store;

use support::{north_of_pickup, Harness};

fn new_bid(price: i64) -> NewBid {
    NewBid {
        price,
        eta_minutes: 12,
        note: "two helpers".into(),
    }
}

#[tokio::test]
async fn second_live_bid_from_the_same_driver_is_rejected() {
    let harness = Harness::new();
    let driver_id = harness.add_driver(north_of_pickup(1.0)).await;
    let job = harness.post_job(Uuid::new_v4()).await;

    harness.bid(driver_id, job.id, 3_000).await;

    let err = harness
        .engine
        .submit_bid(User::driver(driver_id), job.id, new_bid(2_800))
        .await
        .unwrap_err();
    assert!(err.is_duplicate_bid());
}

#[tokio::test]
async fn bids_outside_the_price_range_are_invalid() {
    let harness = Harness::new();
    let driver_id = harness.add_driver(north_of_pickup(1.0)).await;
    let job = harness.post_job(Uuid::new_v4()).await;

    for price in [1_999, 5_001] {
        let err = harness
            .engine
            .submit_bid(User::driver(driver_id), job.id, new_bid(price))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }
}

#[tokio::test]
async fn customer_hears_about_each_bid() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();
    let job = harness.post_job(customer_id).await;

    for km in [1.0, 2.0] {
        let driver_id = harness.add_driver(north_of_pickup(km)).await;
        harness.bid(driver_id, job.id, 3_000).await;
    }

    let received = harness
        .notifier
        .sent_to(Channel::Customer(customer_id))
        .unwrap()
        .into_iter()
        .filter(|notification| notification.name() == "bid_received")
        .count();
    assert_eq!(received, 2);

    let bids = harness
        .engine
        .list_bids(User::customer(customer_id), job.id)
        .await
        .unwrap();
    assert_eq!(bids.len(), 2);

    let err = harness
        .engine
        .list_bids(User::customer(Uuid::new_v4()), job.id)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn accepting_assigns_the_winner_and_rejects_the_rest() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();
    let job = harness.post_job(customer_id).await;

    let winner = harness.add_driver(north_of_pickup(1.0)).await;
    let loser = harness.add_driver(north_of_pickup(2.0)).await;

    let winning_bid = harness.bid(winner, job.id, 3_200).await;
    let losing_bid = harness.bid(loser, job.id, 2_900).await;

    let accepted = harness
        .engine
        .accept_bid(User::customer(customer_id), job.id, winning_bid.id)
        .await
        .unwrap();

    assert_eq!(accepted.status, JobStatus::BidAccepted);
    assert_eq!(accepted.driver_id, Some(winner));
    assert_eq!(accepted.final_price, Some(3_200));
    assert!(accepted.accepted_at.is_some());

    assert_eq!(harness.store.find_bid(winning_bid.id).await.unwrap().status, BidStatus::Accepted);
    assert_eq!(harness.store.find_bid(losing_bid.id).await.unwrap().status, BidStatus::Rejected);

    let driver = harness.store.find_driver(winner).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Assigned { job_id: job.id });
    assert!(!harness.geo.is_available(winner).unwrap());
    assert!(harness.geo.is_available(loser).unwrap());

    assert_eq!(
        harness.notifier.recipients_of("bid_accepted").unwrap(),
        vec![Channel::Driver(winner)]
    );
    assert_eq!(
        harness.notifier.recipients_of("bid_rejected").unwrap(),
        vec![Channel::Driver(loser)]
    );

    // drivers read only their own profile
    let profile = harness.engine.find_driver(User::driver(winner), winner).await.unwrap();
    assert_eq!(profile.id, winner);
    assert!(harness
        .engine
        .find_driver(User::driver(loser), winner)
        .await
        .unwrap_err()
        .is_unauthorized());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acceptances_let_exactly_one_through() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();
    let job = harness.post_job(customer_id).await;

    let mut bids = vec![];
    for km in [1.0, 2.0, 3.0] {
        let driver_id = harness.add_driver(north_of_pickup(km)).await;
        bids.push(harness.bid(driver_id, job.id, 3_000).await);
    }

    let engine = Arc::clone(&harness.engine);
    let first = bids[0].id;
    let a = tokio::spawn(async move {
        engine
            .accept_bid(User::customer(customer_id), job.id, first)
            .await
    });

    let engine = Arc::clone(&harness.engine);
    let second = bids[1].id;
    let b = tokio::spawn(async move {
        engine
            .accept_bid(User::customer(customer_id), job.id, second)
            .await
    });

    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(|err| err.is_invalid_state()));

    let stored = harness.store.list_bids(job.id).await.unwrap();
    assert_eq!(
        stored.iter().filter(|bid| bid.status == BidStatus::Accepted).count(),
        1
    );
    assert_eq!(
        stored.iter().filter(|bid| bid.status == BidStatus::Rejected).count(),
        2
    );

    let assigned = harness.store.find_job(job.id).await.unwrap().driver_id.unwrap();
    let busy = harness
        .store
        .find_drivers(&bids.iter().map(|bid| bid.driver_id).collect::<Vec<_>>())
        .await
        .unwrap()
        .into_iter()
        .filter(|driver| !driver.is_available())
        .map(|driver| driver.id)
        .collect::<Vec<_>>();
    assert_eq!(busy, vec![assigned]);
}

#[tokio::test]
async fn expired_bids_cannot_be_accepted() {
    let mut config = support::fast_config();
    config.auction.bid_ttl = chrono::Duration::zero();
    let harness = Harness::with_config(config);

    let customer_id = Uuid::new_v4();
    let job = harness.post_job(customer_id).await;
    let driver_id = harness.add_driver(north_of_pickup(1.0)).await;

    let stale = harness.bid(driver_id, job.id, 3_000).await;

    let err = harness
        .engine
        .accept_bid(User::customer(customer_id), job.id, stale.id)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());

    // an expired bid does not block a fresh one
    harness.bid(driver_id, job.id, 3_100).await;
    assert_eq!(harness.store.find_bid(stale.id).await.unwrap().status, BidStatus::Expired);

    let err = harness
        .engine
        .accept_bid(User::customer(customer_id), job.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn status_walks_forward_one_step_at_a_time() {
    let harness = Harness::new();
    let (job, customer_id, driver_id) = harness.accepted_job().await;

    let err = harness
        .engine
        .advance_status(User::driver(driver_id), job.id, JobStatus::Loading)
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition());

    let err = harness
        .engine
        .advance_status(User::driver(Uuid::new_v4()), job.id, JobStatus::DriverArriving)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let err = harness
        .engine
        .advance_status(User::customer(customer_id), job.id, JobStatus::DriverArriving)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let arrived = harness.drive_to_dropoff(job.id, driver_id).await;
    assert_eq!(arrived.status, JobStatus::DropoffArrived);
    assert!(arrived.pickup_arrived_at.is_some());
    assert!(arrived.dropoff_arrived_at.is_some());

    // every step told the customer
    let updates = harness
        .notifier
        .sent_to(Channel::Customer(customer_id))
        .unwrap()
        .into_iter()
        .filter(|notification| notification.name() == "status_changed")
        .count();
    assert_eq!(updates, 5);

    let err = harness
        .engine
        .advance_status(User::driver(driver_id), job.id, JobStatus::Completed)
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition());
}

#[tokio::test]
async fn location_updates_feed_the_geo_index() {
    let harness = Harness::new();
    let driver_id = harness.add_driver(north_of_pickup(1.0)).await;
    let there = north_of_pickup(3.0);

    harness
        .engine
        .update_driver_location(User::driver(driver_id), there)
        .await
        .unwrap();
    assert_eq!(harness.geo.last_location(driver_id).await.unwrap(), Some(there));

    let err = harness
        .engine
        .update_driver_location(User::driver(driver_id), cartage::entities::Coordinates::new(91.0, 0.0))
        .await
        .unwrap_err();
    assert!(err.is_invalid_input());

    let err = harness
        .engine
        .update_driver_location(User::customer(driver_id), there)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

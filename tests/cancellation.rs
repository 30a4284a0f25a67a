mod support;

use chrono::{Duration, Utc};
use uuid::Uuid;

use cartage::api::{AuctionAPI, CancellationAPI, EscrowAPI};
use cartage::auth::User;
use cartage::entities::{Deactivation, DriverStatus, Initiator, JobStatus, PaymentMethod, PaymentStatus, RefundStatus};
use cartage::external::Channel;
use cartage::store::Store;

use support::{north_of_pickup, Harness};

async fn accepted_minutes_ago(harness: &Harness, minutes: i64) -> (Uuid, Uuid, Uuid, String) {
    let (job, customer_id, driver_id) = harness.accepted_job().await;

    let payment = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap();

    harness
        .store
        .modify_job(job.id, |job| {
            job.accepted_at = Some(Utc::now() - Duration::minutes(minutes))
        })
        .unwrap();

    (job.id, customer_id, driver_id, payment.provider_ref.unwrap())
}

#[tokio::test]
async fn late_customer_cancellation_pays_the_fee() {
    let harness = Harness::new();
    let (job_id, customer_id, driver_id, provider_ref) = accepted_minutes_ago(&harness, 6).await;

    let cancellation = harness
        .engine
        .cancel_by_customer(User::customer(customer_id), job_id, "found another mover".into())
        .await
        .unwrap();

    assert_eq!(cancellation.initiator, Initiator::Customer);
    assert!(!cancellation.within_grace);
    assert_eq!(cancellation.fee, 500);
    assert_eq!(cancellation.refund_amount, 2_500);
    assert_eq!(cancellation.refund_status, RefundStatus::Processed);
    assert!(!cancellation.strike_issued);
    assert_eq!(harness.gateway.refunds().unwrap(), vec![(provider_ref, 2_500)]);

    let job = harness.store.find_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.cancelled_at.is_some());

    let payment = harness.store.find_payment(job_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);

    let stored = harness.store.find_cancellation(job_id).await.unwrap().unwrap();
    assert_eq!(stored.refund_status, RefundStatus::Processed);

    // the driver goes back into the pool without a strike
    let driver = harness.store.find_driver(driver_id).await.unwrap();
    assert_eq!(driver.status, DriverStatus::Available);
    assert_eq!(driver.strikes, 0);
    assert!(harness.geo.is_available(driver_id).unwrap());

    let mut told = harness.notifier.recipients_of("job_cancelled").unwrap();
    told.sort_by_key(|channel| format!("{:?}", channel));
    let mut expected = vec![Channel::Customer(customer_id), Channel::Driver(driver_id)];
    expected.sort_by_key(|channel| format!("{:?}", channel));
    assert_eq!(told, expected);
}

#[tokio::test]
async fn cancellation_within_grace_is_free() {
    let harness = Harness::new();
    let (job_id, customer_id, _, provider_ref) = accepted_minutes_ago(&harness, 4).await;

    let cancellation = harness
        .engine
        .cancel_by_customer(User::customer(customer_id), job_id, "changed plans".into())
        .await
        .unwrap();

    assert!(cancellation.within_grace);
    assert_eq!(cancellation.fee, 0);
    assert_eq!(cancellation.refund_amount, 3_000);
    assert_eq!(harness.gateway.refunds().unwrap(), vec![(provider_ref, 3_000)]);
}

#[tokio::test]
async fn cancelling_an_open_job_needs_no_refund() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();
    let job = harness.post_job(customer_id).await;

    let cancellation = harness
        .engine
        .cancel_by_customer(User::customer(customer_id), job.id, "too expensive".into())
        .await
        .unwrap();
    assert!(cancellation.within_grace);
    assert_eq!(cancellation.refund_amount, 0);
    assert_eq!(cancellation.refund_status, RefundStatus::NotApplicable);

    let err = harness
        .engine
        .cancel_by_customer(User::customer(customer_id), job.id, "again".into())
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());

    // pending dispatch steps find the job gone
    harness.run_pending().await;
    assert!(harness.queue.pending().unwrap().is_empty());
}

#[tokio::test]
async fn failed_refund_is_recorded() {
    let harness = Harness::new();
    let (job_id, customer_id, _, _) = accepted_minutes_ago(&harness, 1).await;
    harness.gateway.set_failing(true);

    let cancellation = harness
        .engine
        .cancel_by_customer(User::customer(customer_id), job_id, "moved date".into())
        .await
        .unwrap();

    assert_eq!(cancellation.refund_status, RefundStatus::Failed);
    assert_eq!(
        harness
            .store
            .find_cancellation(job_id)
            .await
            .unwrap()
            .unwrap()
            .refund_status,
        RefundStatus::Failed
    );
    assert_eq!(
        harness.store.find_job(job_id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn third_driver_cancellation_deactivates() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();
    let driver_id = harness.add_driver(north_of_pickup(1.0)).await;

    for reason in ["flat tyre", "stuck in traffic"] {
        let job = harness.accepted_job_with(customer_id, driver_id).await;
        let cancellation = harness
            .engine
            .cancel_by_driver(User::driver(driver_id), job.id, reason.into())
            .await
            .unwrap();
        assert!(cancellation.strike_issued);
        assert!(!cancellation.driver_deactivated);
    }

    // a bid left open on another job before the last strike
    let open_job = harness.post_job(customer_id).await;
    let open_bid = harness.bid(driver_id, open_job.id, 3_000).await;

    let job = harness.accepted_job_with(customer_id, driver_id).await;
    let payment = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap();

    let cancellation = harness
        .engine
        .cancel_by_driver(User::driver(driver_id), job.id, "no show".into())
        .await
        .unwrap();

    assert_eq!(cancellation.initiator, Initiator::Driver);
    assert_eq!(cancellation.strike_count, Some(3));
    assert!(cancellation.driver_deactivated);
    assert_eq!(cancellation.fee, 0);
    assert_eq!(cancellation.refund_amount, payment.amount);
    assert_eq!(cancellation.refund_status, RefundStatus::Processed);

    let driver = harness.store.find_driver(driver_id).await.unwrap();
    assert_eq!(driver.strikes, 3);
    assert!(driver.is_deactivated());
    assert_eq!(driver.status, DriverStatus::Offline);
    assert!(!harness.geo.is_available(driver_id).unwrap());

    let notices: Vec<&'static str> = harness
        .notifier
        .sent_to(Channel::Driver(driver_id))
        .unwrap()
        .iter()
        .map(|notification| notification.name())
        .filter(|name| ["strike_issued", "final_warning", "driver_deactivated"].contains(name))
        .collect();
    assert_eq!(notices, vec!["strike_issued", "final_warning", "driver_deactivated"]);

    let err = harness
        .engine
        .cancel_by_driver(User::driver(driver_id), job.id, "again".into())
        .await
        .unwrap_err();
    assert!(err.is_forbidden());

    let err = harness
        .engine
        .accept_bid(User::customer(customer_id), open_job.id, open_bid.id)
        .await
        .unwrap_err();
    assert!(err.is_forbidden());

    let fresh_job = harness.post_job(customer_id).await;
    let err = harness
        .engine
        .submit_bid(
            User::driver(driver_id),
            fresh_job.id,
            cartage::entities::NewBid {
                price: 3_000,
                eta_minutes: 5,
                note: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_forbidden());
}

#[tokio::test]
async fn only_the_assigned_driver_may_cancel() {
    let harness = Harness::new();
    let (job, _, _) = harness.accepted_job().await;
    let stranger = harness.add_driver(north_of_pickup(2.0)).await;

    let err = harness
        .engine
        .cancel_by_driver(User::driver(stranger), job.id, "nope".into())
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn monthly_reset_clears_only_stale_counters() {
    let harness = Harness::new();

    let stale = harness.add_driver(north_of_pickup(1.0)).await;
    harness
        .store
        .modify_driver(stale, |driver| {
            driver.strikes = 2;
            driver.strikes_reset_at = Utc::now() - Duration::days(31);
        })
        .unwrap();

    let recent = harness.add_driver(north_of_pickup(1.0)).await;
    harness
        .store
        .modify_driver(recent, |driver| driver.strikes = 1)
        .unwrap();

    let err = harness
        .engine
        .reset_monthly_strikes(User::driver(stale))
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let reset = harness
        .engine
        .reset_monthly_strikes(User::new_system_user())
        .await
        .unwrap();
    assert_eq!(reset, 1);

    let stale = harness.store.find_driver(stale).await.unwrap();
    assert_eq!(stale.strikes, 0);
    assert!(stale.strikes_reset_at > Utc::now() - Duration::minutes(1));
    assert_eq!(harness.store.find_driver(recent).await.unwrap().strikes, 1);

    assert_eq!(
        harness
            .engine
            .reset_monthly_strikes(User::new_system_user())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn driver_cancellation_stops_when_the_driver_cannot_be_read() {
    let harness = Harness::new();
    let (job, _, driver_id) = harness.accepted_job().await;

    harness
        .store
        .modify_driver(driver_id, |driver| {
            driver.deactivation = Some(Deactivation {
                at: Utc::now(),
                reason: "documents expired".into(),
            })
        })
        .unwrap();
    harness.store.set_driver_reads_failing(true);

    let err = harness
        .engine
        .cancel_by_driver(User::driver(driver_id), job.id, "no show".into())
        .await
        .unwrap_err();
    assert!(err.is_internal());

    assert_eq!(
        harness.store.find_job(job.id).await.unwrap().status,
        JobStatus::BidAccepted
    );
    assert!(harness.store.find_cancellation(job.id).await.unwrap().is_none());
}

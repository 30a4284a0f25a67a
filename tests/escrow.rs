mod support;

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use cartage::api::{DriverAPI, EscrowAPI, SweepReport};
use cartage::auth::User;
use cartage::entities::{ConfirmationSource, GatewayOutcome, JobStatus, PaymentMethod, PaymentStatus};
use cartage::external::Channel;
use cartage::store::Store;

use support::{Harness, DROPOFF};

async fn park_at_dropoff(harness: &Harness, driver_id: Uuid) {
    harness
        .engine
        .update_driver_location(User::driver(driver_id), DROPOFF)
        .await
        .unwrap();
}

fn age_hold(harness: &Harness, job_id: Uuid, minutes: i64) {
    harness
        .store
        .modify_payment(job_id, |payment| {
            payment.held_at = Some(Utc::now() - Duration::minutes(minutes))
        })
        .unwrap();
}

#[tokio::test]
async fn payment_is_split_by_the_drivers_fee_rate() {
    let harness = Harness::new();
    let (job, customer_id, _) = harness.accepted_job().await;

    let payment = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Cash)
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, 3_000);
    assert_eq!(payment.platform_fee, 450);
    assert_eq!(payment.driver_payout, 2_550);
    assert!(payment.provider_ref.is_none());
    assert!(harness.gateway.charges().unwrap().is_empty());
}

#[tokio::test]
async fn payment_needs_an_accepted_job() {
    let harness = Harness::new();
    let customer_id = Uuid::new_v4();
    let job = harness.post_job(customer_id).await;

    let err = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
}

#[tokio::test]
async fn gateway_failure_leaves_no_escrow_behind() {
    let harness = Harness::new();
    let (job, customer_id, _) = harness.accepted_job().await;
    harness.gateway.set_failing(true);

    let err = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(err.is_gateway_failure());
    assert!(harness.store.find_payment(job.id).await.unwrap().is_none());

    harness.gateway.set_failing(false);
    let payment = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap();
    assert!(payment.provider_ref.is_some());
    assert_eq!(harness.gateway.charges().unwrap().len(), 1);

    // already charged
    let err = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
}

#[tokio::test]
async fn hold_waits_for_the_dropoff() {
    let harness = Harness::new();
    let (job, customer_id, driver_id) = harness.accepted_job().await;

    harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Wallet)
        .await
        .unwrap();

    let err = harness
        .engine
        .hold_payment(User::driver(driver_id), job.id)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());

    harness.drive_to_dropoff(job.id, driver_id).await;
    let held = harness
        .engine
        .hold_payment(User::driver(driver_id), job.id)
        .await
        .unwrap();

    assert_eq!(held.status, PaymentStatus::OnHold);
    assert!(held.held_at.is_some());
    assert_eq!(
        harness.notifier.recipients_of("payment_held").unwrap(),
        vec![Channel::Customer(customer_id)]
    );

    let err = harness
        .engine
        .hold_payment(User::driver(driver_id), job.id)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
}

#[tokio::test]
async fn customer_cannot_confirm_before_the_driver() {
    let harness = Harness::new();
    let (job, customer_id, driver_id, _) = harness.held_job(PaymentMethod::Cash).await;

    let err = harness
        .engine
        .confirm_delivery(User::customer(customer_id), job.id)
        .await
        .unwrap_err();
    assert!(err.is_out_of_order());

    let job = harness
        .engine
        .confirm_delivery(User::driver(driver_id), job.id)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::DropoffArrived);
    assert!(job.driver_confirmed_at.is_some());
    assert_eq!(
        harness
            .notifier
            .recipients_of("delivery_awaiting_confirmation")
            .unwrap(),
        vec![Channel::Customer(customer_id)]
    );

    let completed = harness
        .engine
        .confirm_delivery(User::customer(customer_id), job.id)
        .await
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    assert!(completed.completed_at.is_some());

    let payment = harness.store.find_payment(job.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.confirmed_by, Some(ConfirmationSource::Customer));

    let payout = harness.store.find_payout(job.id).await.unwrap().unwrap();
    assert_eq!(payout.amount, payment.driver_payout);
    assert_eq!(payout.driver_id, driver_id);

    // the driver is free for the next job
    assert!(harness.store.find_driver(driver_id).await.unwrap().is_available());
    assert!(harness.geo.is_available(driver_id).unwrap());

    let err = harness
        .engine
        .confirm_delivery(User::customer(customer_id), job.id)
        .await
        .unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(harness.store.payout_count().unwrap(), 1);
}

#[tokio::test]
async fn sweep_settles_stale_holds_at_the_destination() {
    let harness = Harness::new();
    let (job, customer_id, driver_id, _) = harness.held_job(PaymentMethod::Card).await;

    park_at_dropoff(&harness, driver_id).await;

    // a fresh hold is left alone
    let report = harness
        .engine
        .auto_confirm_sweep(User::new_system_user())
        .await
        .unwrap();
    assert_eq!(report, SweepReport::default());

    age_hold(&harness, job.id, 16);

    let report = harness
        .engine
        .auto_confirm_sweep(User::new_system_user())
        .await
        .unwrap();
    assert_eq!(
        report,
        SweepReport {
            scanned: 1,
            confirmed: 1,
            skipped: 0,
            failed: 0,
        }
    );

    let stored = harness.store.find_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);

    let payment = harness.store.find_payment(job.id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.confirmed_by, Some(ConfirmationSource::AutoSweep));
    assert_eq!(harness.store.payout_count().unwrap(), 1);

    let mut notified = harness.notifier.recipients_of("delivery_completed").unwrap();
    notified.sort_by_key(|channel| format!("{:?}", channel));
    let mut expected = vec![Channel::Customer(customer_id), Channel::Driver(driver_id)];
    expected.sort_by_key(|channel| format!("{:?}", channel));
    assert_eq!(notified, expected);

    // nothing left to do on the next pass
    let report = harness
        .engine
        .auto_confirm_sweep(User::new_system_user())
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(harness.store.payout_count().unwrap(), 1);
}

#[tokio::test]
async fn sweep_skips_drivers_away_from_the_dropoff() {
    let harness = Harness::new();
    let (job, _, _, _) = harness.held_job(PaymentMethod::Cash).await;

    age_hold(&harness, job.id, 30);

    let report = harness
        .engine
        .auto_confirm_sweep(User::new_system_user())
        .await
        .unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(
        harness.store.find_job(job.id).await.unwrap().status,
        JobStatus::DropoffArrived
    );
    assert_eq!(harness.store.payout_count().unwrap(), 0);
}

#[tokio::test]
async fn sweep_is_for_operators_only() {
    let harness = Harness::new();

    let err = harness
        .engine
        .auto_confirm_sweep(User::customer(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweep_and_customer_confirmation_credit_the_driver_once() {
    let harness = Harness::new();
    let (job, customer_id, driver_id, _) = harness.held_job(PaymentMethod::Card).await;

    park_at_dropoff(&harness, driver_id).await;
    harness
        .engine
        .confirm_delivery(User::driver(driver_id), job.id)
        .await
        .unwrap();
    age_hold(&harness, job.id, 20);

    let engine = Arc::clone(&harness.engine);
    let sweep = tokio::spawn(async move { engine.auto_confirm_sweep(User::new_system_user()).await });

    let engine = Arc::clone(&harness.engine);
    let job_id = job.id;
    let confirm = tokio::spawn(async move {
        engine
            .confirm_delivery(User::customer(customer_id), job_id)
            .await
    });

    let report = sweep.await.unwrap().unwrap();
    let confirmed = confirm.await.unwrap();

    assert_eq!(report.failed, 0);
    assert_eq!(
        report.confirmed + usize::from(confirmed.is_ok()),
        1,
        "exactly one path finalizes"
    );

    assert_eq!(harness.store.payout_count().unwrap(), 1);
    assert_eq!(
        harness.store.find_job(job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(
        harness
            .notifier
            .sent_to(Channel::Customer(customer_id))
            .unwrap()
            .into_iter()
            .filter(|notification| notification.name() == "delivery_completed")
            .count(),
        1
    );
}

#[tokio::test]
async fn gateway_success_settles_a_held_payment() {
    let harness = Harness::new();
    let (job, _, _, payment) = harness.held_job(PaymentMethod::Card).await;
    let provider_ref = payment.provider_ref.clone().unwrap();

    let settled = harness
        .engine
        .handle_gateway_callback(User::new_system_user(), provider_ref.clone(), GatewayOutcome::Succeeded)
        .await
        .unwrap();

    assert_eq!(settled.status, PaymentStatus::Completed);
    assert_eq!(settled.confirmed_by, Some(ConfirmationSource::Gateway));
    assert_eq!(
        harness.store.find_job(job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(harness.store.payout_count().unwrap(), 1);

    // redelivered webhook
    let again = harness
        .engine
        .handle_gateway_callback(User::new_system_user(), provider_ref, GatewayOutcome::Succeeded)
        .await
        .unwrap();
    assert_eq!(again.status, PaymentStatus::Completed);
    assert_eq!(harness.store.payout_count().unwrap(), 1);
}

#[tokio::test]
async fn gateway_failure_marks_the_payment_failed() {
    let harness = Harness::new();
    let (job, customer_id, _) = harness.accepted_job().await;

    let payment = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap();
    let provider_ref = payment.provider_ref.unwrap();

    let err = harness
        .engine
        .handle_gateway_callback(User::customer(customer_id), provider_ref.clone(), GatewayOutcome::Failed)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let failed = harness
        .engine
        .handle_gateway_callback(User::new_system_user(), provider_ref, GatewayOutcome::Failed)
        .await
        .unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(
        harness.notifier.recipients_of("payment_failed").unwrap(),
        vec![Channel::Customer(customer_id)]
    );

    // a failed escrow may be started again
    let retried = harness
        .engine
        .initiate_payment(User::customer(customer_id), job.id, PaymentMethod::Card)
        .await
        .unwrap();
    assert_eq!(retried.status, PaymentStatus::Pending);

    let err = harness
        .engine
        .handle_gateway_callback(User::new_system_user(), "ch_unknown".into(), GatewayOutcome::Succeeded)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

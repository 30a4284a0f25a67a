use oso::{Oso, PolarClass};

use crate::auth::{Platform, User};
use crate::entities::{Driver, Job};
use crate::error::Error;

pub fn new() -> Result<Oso, Error> {
    let mut o = Oso::new();

    o.register_class(Platform::get_polar_class())?;
    o.register_class(User::get_polar_class())?;
    o.register_class(Driver::get_polar_class())?;
    o.register_class(Job::get_polar_class())?;

    o.load_str(include_str!("rules.polar"))?;

    Ok(o)
}

#[cfg(test)]
fn sample_job(customer_id: uuid::Uuid) -> Job {
    use chrono::Utc;

    Job::new(customer_id, crate::entities::sample_new_job(), Utc::now()).unwrap()
}

#[test]
fn customer_owns_their_job() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let customer = User::customer(Uuid::new_v4());
    let stranger = User::customer(Uuid::new_v4());
    let job = sample_job(customer.id);

    for action in [
        "read",
        "list_bids",
        "accept_bid",
        "initiate_payment",
        "cancel_by_customer",
        "confirm_delivery",
    ] {
        let result = authorizor.is_allowed(customer.clone(), action, job.clone());
        assert_eq!(result.unwrap(), true, "{}", action);

        let result = authorizor.is_allowed(stranger.clone(), action, job.clone());
        assert_eq!(result.unwrap(), false, "{}", action);
    }

    let result = authorizor.is_allowed(customer.clone(), "advance_status", job.clone());
    assert_eq!(result.unwrap(), false);

    let result = authorizor.is_allowed(customer.clone(), "submit_bid", job.clone());
    assert_eq!(result.unwrap(), false);
}

#[test]
fn assigned_driver_acts_on_job() {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::entities::Bid;

    let authorizor = new().unwrap();

    let driver = User::driver(Uuid::new_v4());
    let other_driver = User::driver(Uuid::new_v4());
    let mut job = sample_job(Uuid::new_v4());

    // before a bid is accepted

    let result = authorizor.is_allowed(driver.clone(), "submit_bid", job.clone());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(driver.clone(), "advance_status", job.clone());
    assert_eq!(result.unwrap(), false);

    let result = authorizor.is_allowed(driver.clone(), "read", job.clone());
    assert_eq!(result.unwrap(), false);

    let now = Utc::now();
    let bid = Bid::new(job.id, driver.id, 3_000, 10, "".into(), now, Duration::minutes(10));
    job.accept_bid(&bid, now).unwrap();

    // after the driver's bid is accepted

    for action in [
        "read",
        "advance_status",
        "hold_payment",
        "confirm_delivery",
        "cancel_by_driver",
    ] {
        let result = authorizor.is_allowed(driver.clone(), action, job.clone());
        assert_eq!(result.unwrap(), true, "{}", action);

        let result = authorizor.is_allowed(other_driver.clone(), action, job.clone());
        assert_eq!(result.unwrap(), false, "{}", action);
    }

    let result = authorizor.is_allowed(driver.clone(), "accept_bid", job.clone());
    assert_eq!(result.unwrap(), false);
}

#[test]
fn platform_actions_need_roles() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let customer = User::customer(Uuid::new_v4());
    let driver = User::driver(Uuid::new_v4());

    let result = authorizor.is_allowed(customer.clone(), "create_job", Platform::new());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(driver.clone(), "create_job", Platform::new());
    assert_eq!(result.unwrap(), false);

    let result = authorizor.is_allowed(driver.clone(), "update_location", Platform::new());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(customer.clone(), "run_maintenance", Platform::new());
    assert_eq!(result.unwrap(), false);
}

#[test]
fn system_role_can_do_anything() {
    use uuid::Uuid;

    let authorizor = new().unwrap();

    let system = User::new_system_user();
    let job = sample_job(Uuid::new_v4());

    let result = authorizor.is_allowed(system.clone(), "run_maintenance", Platform::new());
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(system.clone(), "cancel_by_customer", job.clone());
    assert_eq!(result.unwrap(), true);
}

#[test]
fn drivers_read_only_their_own_profile() {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::entities::VehicleClass;

    let authorizor = new().unwrap();

    let user = User::driver(Uuid::new_v4());
    let own = Driver::new(user.id, VehicleClass::Van, Utc::now());
    let other = Driver::new(Uuid::new_v4(), VehicleClass::Van, Utc::now());

    let result = authorizor.is_allowed(user.clone(), "read", own);
    assert_eq!(result.unwrap(), true);

    let result = authorizor.is_allowed(user.clone(), "read", other);
    assert_eq!(result.unwrap(), false);
}

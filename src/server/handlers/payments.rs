use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::DynAPI;
use crate::auth::User;
use crate::entities::{GatewayOutcome, Job, Payment, PaymentMethod};
use crate::error::Error;

#[derive(Serialize, Deserialize)]
pub struct InitiateParams {
    method: PaymentMethod,
}

#[derive(Serialize, Deserialize)]
pub struct CallbackParams {
    provider_ref: String,
    outcome: GatewayOutcome,
}

pub async fn initiate(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
    Json(params): Json<InitiateParams>,
) -> Result<Json<Payment>, Error> {
    let payment = api.initiate_payment(user, id, params.method).await?;

    Ok(payment.into())
}

pub async fn hold(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, Error> {
    let payment = api.hold_payment(user, id).await?;

    Ok(payment.into())
}

pub async fn confirm(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, Error> {
    let job = api.confirm_delivery(user, id).await?;

    Ok(job.into())
}

pub async fn callback(
    Extension(api): Extension<DynAPI>,
    user: User,
    Json(params): Json<CallbackParams>,
) -> Result<Json<Payment>, Error> {
    let payment = api
        .handle_gateway_callback(user, params.provider_ref, params.outcome)
        .await?;

    Ok(payment.into())
}

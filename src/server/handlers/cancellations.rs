use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::DynAPI;
use crate::auth::User;
use crate::entities::Cancellation;
use crate::error::Error;

#[derive(Serialize, Deserialize)]
pub struct CancelParams {
    #[serde(default)]
    reason: String,
}

pub async fn by_customer(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
    Json(params): Json<CancelParams>,
) -> Result<Json<Cancellation>, Error> {
    let cancellation = api.cancel_by_customer(user, id, params.reason).await?;

    Ok(cancellation.into())
}

pub async fn by_driver(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
    Json(params): Json<CancelParams>,
) -> Result<Json<Cancellation>, Error> {
    let cancellation = api.cancel_by_driver(user, id, params.reason).await?;

    Ok(cancellation.into())
}

use axum::extract::{Extension, Json};
use serde_json::{json, Value};

use crate::api::{DynAPI, SweepReport};
use crate::auth::User;
use crate::error::Error;

pub async fn auto_confirm(
    Extension(api): Extension<DynAPI>,
    user: User,
) -> Result<Json<SweepReport>, Error> {
    let report = api.auto_confirm_sweep(user).await?;

    Ok(report.into())
}

pub async fn reset_strikes(
    Extension(api): Extension<DynAPI>,
    user: User,
) -> Result<Json<Value>, Error> {
    let reset = api.reset_monthly_strikes(user).await?;

    Ok(json!({ "reset": reset }).into())
}

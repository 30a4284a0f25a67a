use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::DynAPI;
use crate::auth::User;
use crate::entities::{Job, JobStatus, NewJob};
use crate::error::Error;

#[derive(Serialize, Deserialize)]
pub struct AdvanceParams {
    status: JobStatus,
}

pub async fn create(
    Extension(api): Extension<DynAPI>,
    user: User,
    Json(params): Json<NewJob>,
) -> Result<Json<Job>, Error> {
    let job = api.create_job(user, params).await?;

    Ok(job.into())
}

pub async fn find(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, Error> {
    let job = api.find_job(user, id).await?;

    Ok(job.into())
}

pub async fn advance(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
    Json(params): Json<AdvanceParams>,
) -> Result<Json<Job>, Error> {
    let job = api.advance_status(user, id, params.status).await?;

    Ok(job.into())
}

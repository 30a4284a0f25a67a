use axum::extract::{Extension, Json, Path};
use uuid::Uuid;

use crate::api::DynAPI;
use crate::auth::User;
use crate::entities::{Bid, Job, NewBid};
use crate::error::Error;

pub async fn submit(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
    Json(params): Json<NewBid>,
) -> Result<Json<Bid>, Error> {
    let bid = api.submit_bid(user, id, params).await?;

    Ok(bid.into())
}

pub async fn list(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Bid>>, Error> {
    let bids = api.list_bids(user, id).await?;

    Ok(bids.into())
}

pub async fn accept(
    Extension(api): Extension<DynAPI>,
    user: User,
    Path((id, bid_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Job>, Error> {
    let job = api.accept_bid(user, id, bid_id).await?;

    Ok(job.into())
}

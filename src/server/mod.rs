mod handlers;
mod identity;

use std::net::SocketAddr;

use axum::{
    extract::Extension,
    routing::{get, patch, post},
    Router,
};

use crate::api::DynAPI;
use crate::error::{unexpected_error, Error};
use crate::server::handlers::{bids, cancellations, drivers, jobs, maintenance, payments};

pub fn router(api: DynAPI) -> Router {
    Router::new()
        .route("/jobs", post(jobs::create))
        .route("/jobs/:id", get(jobs::find))
        .route("/jobs/:id/status", patch(jobs::advance))
        .route("/jobs/:id/bids", get(bids::list).post(bids::submit))
        .route("/jobs/:id/bids/:bid_id/accept", patch(bids::accept))
        .route("/jobs/:id/payment", post(payments::initiate))
        .route("/jobs/:id/payment/hold", patch(payments::hold))
        .route("/jobs/:id/confirm", patch(payments::confirm))
        .route("/jobs/:id/cancel", patch(cancellations::by_customer))
        .route("/jobs/:id/driver/cancel", patch(cancellations::by_driver))
        .route("/payments/callback", post(payments::callback))
        .route("/drivers/me/location", patch(drivers::update_location))
        .route("/drivers/:id", get(drivers::find))
        .route("/maintenance/auto_confirm", post(maintenance::auto_confirm))
        .route("/maintenance/reset_strikes", post(maintenance::reset_strikes))
        .layer(Extension(api))
}

pub async fn serve(api: DynAPI, addr: SocketAddr) -> Result<(), Error> {
    let app = router(api);

    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            tracing::error!(%err, "server stopped");
            unexpected_error()
        })
}

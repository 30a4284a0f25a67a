use std::sync::Arc;

use cartage::api::{DynAPI, TaskAPI};
use cartage::config::{Config, GatewaySettings};
use cartage::db::{self, PgPool};
use cartage::engine::{Components, Engine};
use cartage::error::Error;
use cartage::external::{
    GeoIndex, HttpNotifier, HttpPaymentGateway, MemoryPaymentGateway, Notifier, PaymentGateway, PgGeoIndex,
    TracingNotifier,
};
use cartage::queue::{postgres::PgTaskQueue, worker::Worker, TaskQueue};
use cartage::server;
use cartage::store::{PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    let PgPool(pool) = PgPool::new(&config.server.database_url, config.server.max_connections).await?;
    db::migrate(&pool).await?;

    let notifier: Arc<dyn Notifier> = match &config.server.fanout_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone())),
        None => Arc::new(TracingNotifier),
    };

    let gateway: Arc<dyn PaymentGateway> = match config.server.gateway()? {
        GatewaySettings::Http { url, key } => Arc::new(HttpPaymentGateway::new(url, key)),
        GatewaySettings::Simulated => {
            tracing::warn!("CARTAGE_SIMULATED_GATEWAY is set, card and wallet charges are simulated");
            Arc::new(MemoryPaymentGateway::new())
        }
    };

    let queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(pool.clone()));
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let geo: Arc<dyn GeoIndex> = Arc::new(PgGeoIndex::new(pool));

    let components = Components {
        store,
        geo,
        notifier,
        gateway,
        queue: queue.clone(),
    };

    let engine = Arc::new(Engine::new(components, config.clone())?);

    engine.schedule_maintenance().await?;

    let worker = Worker::new(queue, engine.clone(), config.queue.clone());
    tokio::spawn(worker.run());

    server::serve(engine as DynAPI, config.server.listen_addr).await
}

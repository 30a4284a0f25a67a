mod auction_api;
mod cancellation_api;
mod dispatch_api;
mod driver_api;
mod escrow_api;
mod helpers;
mod job_api;
mod task_api;

use std::sync::Arc;

use oso::Oso;

use crate::{
    api::API,
    auth::authorizor,
    config::Config,
    error::{unauthorized_error, Error},
    external::{GeoIndex, Notifier, PaymentGateway},
    queue::TaskQueue,
    store::Store,
};

/// The collaborators an [`Engine`] is assembled from.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<dyn Store>,
    pub geo: Arc<dyn GeoIndex>,
    pub notifier: Arc<dyn Notifier>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub queue: Arc<dyn TaskQueue>,
}

pub struct Engine {
    store: Arc<dyn Store>,
    geo: Arc<dyn GeoIndex>,
    notifier: Arc<dyn Notifier>,
    gateway: Arc<dyn PaymentGateway>,
    queue: Arc<dyn TaskQueue>,
    config: Config,
    authorizor: Oso,
}

impl Engine {
    #[tracing::instrument(name = "Engine::new", skip_all)]
    pub fn new(components: Components, config: Config) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            store: components.store,
            geo: components.geo,
            notifier: components.notifier,
            gateway: components.gateway,
            queue: components.queue,
            config,
            authorizor: authorizor::new()?,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Engine {
    pub fn authorize<Actor, Action, Resource>(
        &self,
        actor: Actor,
        action: Action,
        resource: Resource,
    ) -> Result<(), Error>
    where
        Actor: oso::ToPolar,
        Action: oso::ToPolar,
        Resource: oso::ToPolar,
    {
        if self.authorizor.is_allowed(actor, action, resource)? {
            return Ok(());
        }

        Err(unauthorized_error())
    }
}

impl API for Engine {}

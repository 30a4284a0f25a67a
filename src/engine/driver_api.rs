use super::Engine;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    api::DriverAPI,
    auth::{Platform, User},
    entities::{Coordinates, Driver},
    error::{invalid_input_error, Error},
};

#[async_trait]
impl DriverAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn find_driver(&self, user: User, id: Uuid) -> Result<Driver, Error> {
        let driver = self.store.find_driver(id).await?;

        self.authorize(user, "read", driver.clone())?;

        Ok(driver)
    }

    #[tracing::instrument(skip(self))]
    async fn update_driver_location(&self, user: User, coordinates: Coordinates) -> Result<(), Error> {
        self.authorize(user.clone(), "update_location", Platform::new())?;

        if !coordinates.is_valid() {
            return Err(invalid_input_error());
        }

        self.geo.update_location(user.id, coordinates).await
    }
}

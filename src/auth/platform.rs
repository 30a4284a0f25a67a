use oso::PolarClass;
use serde::{Deserialize, Serialize};

/// Resource for actions that do not target a single job or driver: posting jobs,
/// reporting locations, running sweeps and taking gateway webhooks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Platform;

impl Platform {
    pub fn new() -> Self {
        Self
    }
}

impl PolarClass for Platform {
    fn get_polar_class_builder() -> oso::ClassBuilder<Platform> {
        oso::Class::builder().name("Platform")
    }

    fn get_polar_class() -> oso::Class {
        Platform::get_polar_class_builder().build()
    }
}

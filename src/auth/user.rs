use oso::PolarClass;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CUSTOMER: &str = "customer";
pub const DRIVER: &str = "driver";
pub const SYSTEM: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub roles: Vec<String>,
}

impl User {
    pub fn customer(id: Uuid) -> Self {
        Self {
            id,
            roles: vec![CUSTOMER.into()],
        }
    }

    pub fn driver(id: Uuid) -> Self {
        Self {
            id,
            roles: vec![DRIVER.into()],
        }
    }

    pub fn new_system_user() -> Self {
        Self {
            id: Uuid::new_v4(),
            roles: vec![SYSTEM.into()],
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|x| x == role)
    }
}

impl PolarClass for User {
    fn get_polar_class_builder() -> oso::ClassBuilder<User> {
        oso::Class::builder()
            .name("User")
            .add_attribute_getter("id", |recv: &User| recv.id.to_string())
            .add_attribute_getter("roles", |recv: &User| recv.roles.clone())
    }

    fn get_polar_class() -> oso::Class {
        let builder = User::get_polar_class_builder();
        builder.build()
    }
}

#[test]
fn role_constructors() {
    let id = Uuid::new_v4();
    assert!(User::customer(id).has_role(CUSTOMER));
    assert!(!User::customer(id).has_role(DRIVER));
    assert!(User::driver(id).has_role(DRIVER));
    assert!(User::new_system_user().has_role(SYSTEM));
}

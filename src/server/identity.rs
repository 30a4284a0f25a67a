use async_trait::async_trait;
use axum::extract::{FromRequest, RequestParts};
use uuid::Uuid;

use crate::auth::User;
use crate::error::{unauthorized_error, Error};

const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLES_HEADER: &str = "x-user-roles";

/// Caller identity as asserted by the gateway in front of this service.
#[async_trait]
impl<B: Send> FromRequest<B> for User {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let headers = req.headers();

        let id = headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .ok_or_else(unauthorized_error)?;

        let roles = headers
            .get(USER_ROLES_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(parse_roles)
            .unwrap_or_default();

        Ok(User { id, roles })
    }
}

fn parse_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[test]
fn roles_are_comma_separated() {
    assert_eq!(parse_roles("customer, Driver,,"), vec!["customer", "driver"]);
    assert!(parse_roles("").is_empty());
}

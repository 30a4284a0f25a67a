use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::env;
use std::fmt::{self, Debug, Display};

pub const INVALID_STATE: i32 = 100;
pub const INVALID_INPUT: i32 = 101;
pub const NOT_FOUND: i32 = 102;
pub const UNAUTHORIZED: i32 = 103;
pub const FORBIDDEN: i32 = 104;
pub const DUPLICATE_BID: i32 = 105;
pub const OUT_OF_ORDER: i32 = 106;
pub const INVALID_TRANSITION: i32 = 107;
pub const GATEWAY_FAILURE: i32 = 108;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

impl Error {
    pub fn is_invalid_state(&self) -> bool {
        self.code == INVALID_STATE
    }

    pub fn is_invalid_input(&self) -> bool {
        self.code == INVALID_INPUT
    }

    pub fn is_not_found(&self) -> bool {
        self.code == NOT_FOUND
    }

    pub fn is_unauthorized(&self) -> bool {
        self.code == UNAUTHORIZED
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == FORBIDDEN
    }

    pub fn is_duplicate_bid(&self) -> bool {
        self.code == DUPLICATE_BID
    }

    pub fn is_out_of_order(&self) -> bool {
        self.code == OUT_OF_ORDER
    }

    pub fn is_invalid_transition(&self) -> bool {
        self.code == INVALID_TRANSITION
    }

    pub fn is_gateway_failure(&self) -> bool {
        self.code == GATEWAY_FAILURE
    }

    /// Internal errors never leak their message to callers.
    pub fn is_internal(&self) -> bool {
        (1..=99).contains(&self.code)
    }

    fn status_code(&self) -> StatusCode {
        match self.code {
            1..=99 => StatusCode::INTERNAL_SERVER_ERROR,
            INVALID_INPUT => StatusCode::BAD_REQUEST,
            NOT_FOUND => StatusCode::NOT_FOUND,
            UNAUTHORIZED | FORBIDDEN => StatusCode::FORBIDDEN,
            GATEWAY_FAILURE => StatusCode::BAD_GATEWAY,
            _ => StatusCode::CONFLICT,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for Error {}

impl From<env::VarError> for Error {
    fn from(err: env::VarError) -> Self {
        env_var_error(err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        database_error(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        reqwest_error(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        serialization_error(err)
    }
}

impl From<oso::OsoError> for Error {
    fn from(err: oso::OsoError) -> Self {
        authorizor_error(err)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_message = if self.is_internal() {
            "Internal Server Error"
        } else {
            self.message.as_str()
        };

        let body = Json(json!({
            "code": self.code,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub fn invalid_state_error() -> Error {
    Error {
        code: INVALID_STATE,
        message: "invalid state".into(),
    }
}

pub fn invalid_input_error() -> Error {
    Error {
        code: INVALID_INPUT,
        message: "invalid input".into(),
    }
}

pub fn not_found_error() -> Error {
    Error {
        code: NOT_FOUND,
        message: "not found".into(),
    }
}

pub fn unauthorized_error() -> Error {
    Error {
        code: UNAUTHORIZED,
        message: "unauthorized".into(),
    }
}

pub fn forbidden_error() -> Error {
    Error {
        code: FORBIDDEN,
        message: "forbidden: driver is deactivated".into(),
    }
}

pub fn duplicate_bid_error() -> Error {
    Error {
        code: DUPLICATE_BID,
        message: "driver already holds an active bid on this job".into(),
    }
}

pub fn out_of_order_error() -> Error {
    Error {
        code: OUT_OF_ORDER,
        message: "driver must confirm delivery before the customer".into(),
    }
}

pub fn invalid_transition_error() -> Error {
    Error {
        code: INVALID_TRANSITION,
        message: "invalid status transition".into(),
    }
}

pub fn gateway_failure_error() -> Error {
    Error {
        code: GATEWAY_FAILURE,
        message: "payment gateway failure".into(),
    }
}

pub fn env_var_error(_: env::VarError) -> Error {
    Error {
        code: 1,
        message: "environment variable error".into(),
    }
}

pub fn database_error<T: Debug>(err: T) -> Error {
    tracing::error!(?err, "database error");

    Error {
        code: 2,
        message: "database error".into(),
    }
}

pub fn reqwest_error(err: reqwest::Error) -> Error {
    tracing::warn!(%err, "reqwest error");

    Error {
        code: 3,
        message: "reqwest error".into(),
    }
}

pub fn upstream_error() -> Error {
    Error {
        code: 4,
        message: "upstream error".into(),
    }
}

pub fn unexpected_error() -> Error {
    Error {
        code: 5,
        message: "unexpected error".into(),
    }
}

pub fn authorizor_error<T: Debug>(err: T) -> Error {
    tracing::error!(?err, "authorizor error");

    Error {
        code: 6,
        message: "authorizor error".into(),
    }
}

pub fn config_error(name: &str) -> Error {
    Error {
        code: 7,
        message: format!("invalid configuration value for {}", name),
    }
}

pub fn serialization_error<T: Debug>(err: T) -> Error {
    tracing::error!(?err, "serialization error");

    Error {
        code: 8,
        message: "serialization error".into(),
    }
}

#[test]
fn internal_errors_hide_their_message() {
    let err = database_error("connection reset");
    assert!(err.is_internal());
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

    let err = duplicate_bid_error();
    assert!(!err.is_internal());
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
}

#[test]
fn user_facing_errors_map_to_status_codes() {
    assert_eq!(not_found_error().status_code(), StatusCode::NOT_FOUND);
    assert_eq!(unauthorized_error().status_code(), StatusCode::FORBIDDEN);
    assert_eq!(forbidden_error().status_code(), StatusCode::FORBIDDEN);
    assert_eq!(invalid_input_error().status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(gateway_failure_error().status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(out_of_order_error().status_code(), StatusCode::CONFLICT);
}

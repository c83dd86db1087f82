//! Error taxonomy for management operations and plain responses for end clients
//!
//! Management callers (the admin API) get structured JSON failures. Clients of a
//! gateway listener only ever see a short plain-text status body; internal
//! detail stays in the logs.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors returned by gateway management operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Rejected input; nothing was mutated
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service {0} is not running")]
    NotRunning(String),
    /// Socket bind or TLS setup failure at launch
    #[error("failed to bind listener: {0}")]
    Bind(String),
    #[error("ACME: {0}")]
    Acme(String),
    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        GatewayError::NotFound(what.into())
    }

    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::Validation(_) => GatewayErrorCode::ValidationFailed,
            GatewayError::NotFound(_) => GatewayErrorCode::NotFound,
            GatewayError::Conflict(_) => GatewayErrorCode::Conflict,
            GatewayError::NotRunning(_) => GatewayErrorCode::NotRunning,
            GatewayError::Bind(_) => GatewayErrorCode::BindFailed,
            GatewayError::Acme(_) => GatewayErrorCode::AcmeFailed,
            GatewayError::Store(_) => GatewayErrorCode::StoreError,
        }
    }
}

/// Error codes surfaced by the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    ValidationFailed,
    NotFound,
    Conflict,
    NotRunning,
    BindFailed,
    AcmeFailed,
    StoreError,
    Unauthorized,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::ValidationFailed => StatusCode::BAD_REQUEST,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::Conflict => StatusCode::CONFLICT,
            GatewayErrorCode::NotRunning => StatusCode::CONFLICT,
            GatewayErrorCode::BindFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::AcmeFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorCode::ValidationFailed => "VALIDATION_FAILED",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::Conflict => "CONFLICT",
            GatewayErrorCode::NotRunning => "NOT_RUNNING",
            GatewayErrorCode::BindFailed => "BIND_FAILED",
            GatewayErrorCode::AcmeFailed => "ACME_FAILED",
            GatewayErrorCode::StoreError => "STORE_ERROR",
            GatewayErrorCode::Unauthorized => "UNAUTHORIZED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

impl From<&GatewayError> for ErrorResponse {
    fn from(err: &GatewayError) -> Self {
        ErrorResponse::new(err.code(), err.to_string())
    }
}

/// Plain-text response for end clients of a gateway listener
pub fn plain_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    let reason = status.canonical_reason().unwrap_or("Error");
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(reason)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode and static header")
}

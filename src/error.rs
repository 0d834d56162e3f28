//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Response body type shared by every handler
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Error codes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Synthesized target URL is malformed
    InvalidTarget,
    /// Target is not reachable and no activation was requested
    UpstreamUnavailable,
    /// The orchestration call itself failed
    ActivationFailed,
    /// Forwarding to a reachable target failed
    ProxyFailed,
    /// Target did not answer in time
    RequestTimeout,
    /// Route exists but not for this method
    MethodNotAllowed,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::InvalidTarget => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::ActivationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::ProxyFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::InvalidTarget => "INVALID_TARGET",
            GatewayErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            GatewayErrorCode::ActivationFailed => "ACTIVATION_FAILED",
            GatewayErrorCode::ProxyFailed => "PROXY_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Failures of the activation and dispatch engine
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The synthesized target could not form a valid URL
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// The target is down and the caller did not ask for activation
    #[error("upstream '{host}' unavailable: {reason}")]
    UpstreamUnavailable {
        host: String,
        status: StatusCode,
        reason: String,
    },

    /// The orchestration call timed out or could not connect
    #[error("activation call to {url} failed: {reason}")]
    ActivationTransport { url: String, reason: String },
}

impl GatewayError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::InvalidTarget { .. } => GatewayErrorCode::InvalidTarget,
            GatewayError::UpstreamUnavailable { .. } => GatewayErrorCode::UpstreamUnavailable,
            GatewayError::ActivationTransport { .. } => GatewayErrorCode::ActivationFailed,
        }
    }

    /// Status reported to the client; unavailability carries the probe's status
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UpstreamUnavailable { status, .. } => *status,
            other => other.code().status_code(),
        }
    }

    pub fn to_response(&self) -> Response<GatewayBody> {
        json_error_response_with_status(self.code(), self.status_code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self::with_status(code, code.status_code(), message)
    }

    pub fn with_status(code: GatewayErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap a static or owned payload into the shared body type
pub fn full_body(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

/// JSON response with the given status
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    json_error_response_with_status(code, code.status_code(), message)
}

/// Create a JSON error response whose status differs from the code's default
pub fn json_error_response_with_status(
    code: GatewayErrorCode,
    status: StatusCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let error = ErrorResponse::with_status(code, status, message);

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode value and static headers")
}

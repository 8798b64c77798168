// Error types for every layer of the gateway.
//
// Admission and abuse decisions are plain values (see `rate_limit` and
// `abuse`); they only become errors here, where the pipeline maps them to
// HTTP responses.

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::time::Duration;

use crate::models::ErrorBody;
use crate::rate_limit::{RateLimitDecision, retry_after_secs};

pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

// Invalid static configuration (route table, rate limit categories, CLI).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid rate limit category `{category}`: {reason}")]
    InvalidRateLimit { category: String, reason: String },

    #[error("no `{0}` rate limit category configured")]
    MissingDefaultCategory(String),

    #[error("invalid route `{prefix}`: {reason}")]
    InvalidRoute { prefix: String, reason: String },

    #[error("invalid abuse guard settings: {0}")]
    InvalidAbuseGuard(String),

    #[error("invalid service spec `{0}`, expected name=host:port")]
    InvalidService(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid instance: {0}")]
    InvalidInstance(String),
}

// Failure of a single outbound HTTP exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("circuit open for {service}, retry in {retry_in:?}")]
    CircuitOpen { service: String, retry_in: Duration },

    #[error("no healthy instances of {0}")]
    NoHealthyInstances(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("upstream responded with {0}")]
    Status(StatusCode),

    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode upstream body: {0}")]
    Decode(#[source] serde_json::Error),
}

// Every way a request can be turned away by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limit exceeded")]
    AdmissionRejected(RateLimitDecision),

    #[error("too many requests from source")]
    AbuseThrottled { retry_after: Duration },

    #[error("source temporarily blocked")]
    AbuseBlocked { retry_after: Duration },

    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),

    #[error("insufficient permissions")]
    Unauthorized,

    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error("service {service} unavailable")]
    BackendUnavailable { service: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AdmissionRejected(_) | GatewayError::AbuseThrottled { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::AbuseBlocked { .. } | GatewayError::Unauthorized => StatusCode::FORBIDDEN,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // Seconds the client should wait, for the retryable rejections
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::AdmissionRejected(decision) => Some(decision.retry_after_secs()),
            GatewayError::AbuseThrottled { retry_after } | GatewayError::AbuseBlocked { retry_after } => {
                Some(retry_after_secs(*retry_after))
            }
            _ => None,
        }
    }

    // Message sent to the client; never carries internal detail.
    fn public_message(&self) -> String {
        match self {
            GatewayError::AdmissionRejected(_) => "Too many requests, please try again later".into(),
            GatewayError::AbuseThrottled { .. } => "Too many requests per second".into(),
            GatewayError::AbuseBlocked { .. } => "Access temporarily blocked".into(),
            GatewayError::Unauthenticated(reason) => format!("Authentication required: {reason}"),
            GatewayError::Unauthorized => "Insufficient permissions".into(),
            GatewayError::RouteNotFound { .. } => "Route not found".into(),
            GatewayError::PayloadTooLarge => "Request body too large".into(),
            GatewayError::BadRequest(_) => "Malformed request body".into(),
            GatewayError::BackendUnavailable { .. } => "Service temporarily unavailable".into(),
            GatewayError::Internal(_) => INTERNAL_ERROR_MESSAGE.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after();
        let body = ErrorBody {
            success: false,
            error: self.public_message(),
            retry_after,
        };

        let mut headers = HeaderMap::new();
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let GatewayError::AdmissionRejected(decision) = &self {
            decision.apply_headers(&mut headers);
        }

        (self.status(), headers, Json(body)).into_response()
    }
}

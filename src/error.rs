//! Error types for the forwarding proxy.
//!
//! Every failure a caller can observe is a [`ProxyError`]. Each variant maps
//! to one [`ErrorKind`], which fixes the HTTP status and the `kind` field of
//! the JSON error body.

use crate::http::response::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable failure category reported in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed target, or an unusable inbound request
    InvalidRequest,
    /// Target host outside the allow-list
    Forbidden,
    /// Upstream unreachable: DNS, connect, TLS, send failure or timeout
    UpstreamFailure,
    /// Unexpected failure inside the forwarding logic
    InternalError,
    /// Request addressed to a path other than the proxy endpoint
    NotFound,
}

/// Errors surfaced to the caller of the proxy endpoint.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing {param} query parameter")]
    MissingTarget { param: &'static str },

    #[error("Invalid target url: {reason}")]
    InvalidTarget { reason: String },

    #[error("Malformed HTTP request: {reason}")]
    MalformedRequest { reason: String },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Request header section too large")]
    HeadersTooLarge,

    #[error("Access denied. Host {host} not in allowed hosts list.")]
    HostDenied { host: String, allowed: Vec<String> },

    #[error("Upstream request to {host} failed: {reason}")]
    Upstream { host: String, reason: String },

    #[error("Upstream request to {host} timed out after {}ms", .after.as_millis())]
    UpstreamTimeout { host: String, after: Duration },

    #[error("Internal error while forwarding to {host}: {reason}")]
    Internal { host: String, reason: String },

    #[error("No proxy endpoint at {path}")]
    NotFound { path: String },
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::MissingTarget { .. }
            | ProxyError::InvalidTarget { .. }
            | ProxyError::MalformedRequest { .. }
            | ProxyError::PayloadTooLarge { .. }
            | ProxyError::HeadersTooLarge => ErrorKind::InvalidRequest,
            ProxyError::HostDenied { .. } => ErrorKind::Forbidden,
            ProxyError::Upstream { .. } | ProxyError::UpstreamTimeout { .. } => {
                ErrorKind::UpstreamFailure
            }
            ProxyError::Internal { .. } => ErrorKind::InternalError,
            ProxyError::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::HeadersTooLarge => StatusCode::HEADERS_TOO_LARGE,
            _ => match self.kind() {
                ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
                ErrorKind::Forbidden => StatusCode::FORBIDDEN,
                ErrorKind::UpstreamFailure => StatusCode::BAD_GATEWAY,
                ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
            },
        }
    }

    /// JSON error response. CORS headers are added by the caller.
    pub fn to_response(&self) -> Response {
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let ProxyError::HostDenied { allowed, .. } = self {
            body["allowedHosts"] = serde_json::json!(allowed);
        }
        Response::json(self.status(), &body)
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

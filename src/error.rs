//! Error types for the gateway.
//!
//! Every failure the gateway can surface is a [`ProxyError`]. The variants map
//! onto the Anthropic error envelope through [`ProxyError::to_error_response`],
//! and [`ProxyError::is_transient`] decides whether the retry layer may try again.

use crate::translate::anthropic_types::ErrorResponse;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed or incomplete inbound request.
    #[error("Invalid request: {message}")]
    Validation { message: String },

    /// Rate limit, 5xx or transport timeout from the upstream.
    #[error("Upstream temporarily unavailable: {message}")]
    UpstreamTransient {
        status: Option<u16>,
        timed_out: bool,
        message: String,
        detail: Option<String>,
    },

    /// Authentication, invalid argument, not found.
    #[error("Upstream rejected the request ({status}): {message}")]
    UpstreamFatal {
        status: u16,
        message: String,
        detail: Option<String>,
    },

    /// The upstream answered but the body is unusable.
    #[error("Unexpected upstream response: {message}")]
    UpstreamShape { message: String },

    #[error("Upstream stream broken: {message}")]
    StreamIntegrity { message: String },

    /// No upstream slot became free within the request timeout.
    #[error("Gateway overloaded: {message}")]
    ResourceExhausted { message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn upstream_shape(msg: impl Into<String>) -> Self {
        Self::UpstreamShape {
            message: msg.into(),
        }
    }

    pub fn stream_integrity(msg: impl Into<String>) -> Self {
        Self::StreamIntegrity {
            message: msg.into(),
        }
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::UpstreamTransient {
            status: None,
            timed_out: true,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the retry layer is allowed to attempt the call again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UpstreamTransient { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            _ => false,
        }
    }

    /// Short taxonomy name carried in the error envelope details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "ConfigError",
            Self::Validation { .. } => "ValidationError",
            Self::UpstreamTransient { .. } => "UpstreamTransientError",
            Self::UpstreamFatal { .. } => "UpstreamFatalError",
            Self::UpstreamShape { .. } => "UpstreamShapeError",
            Self::StreamIntegrity { .. } => "StreamIntegrityError",
            Self::ResourceExhausted { .. } => "ResourceExhaustionError",
            Self::Cancelled => "Cancelled",
            Self::Http(e) if e.is_timeout() => "UpstreamTransientError",
            _ => "InternalError",
        }
    }

    /// HTTP status and Anthropic error type for this error.
    fn classify(&self) -> (u16, &'static str) {
        match self {
            Self::Validation { .. } => (400, "invalid_request_error"),
            Self::UpstreamTransient {
                status: Some(429), ..
            } => (503, "rate_limit_error"),
            Self::UpstreamTransient {
                timed_out: true, ..
            }
            | Self::UpstreamTransient {
                status: Some(408 | 504),
                ..
            } => (504, "timeout_error"),
            Self::UpstreamTransient { .. } => (502, "api_error"),
            Self::UpstreamFatal { status: 401, .. } => (502, "authentication_error"),
            Self::UpstreamFatal { status: 403, .. } => (502, "permission_error"),
            Self::UpstreamFatal { status: 404, .. } => (502, "not_found_error"),
            Self::UpstreamFatal { .. } => (502, "invalid_request_error"),
            Self::UpstreamShape { .. } | Self::StreamIntegrity { .. } => (502, "api_error"),
            Self::ResourceExhausted { .. } => (503, "overloaded_error"),
            Self::Cancelled => (499, "cancelled_error"),
            Self::Http(e) if e.is_timeout() => (504, "timeout_error"),
            Self::Http(_) => (502, "api_error"),
            _ => (500, "api_error"),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.classify().0
    }

    /// Render as an Anthropic error envelope. Upstream diagnostics are kept
    /// under `error.details`.
    pub fn to_error_response(&self) -> (u16, ErrorResponse) {
        let (status, error_type) = self.classify();

        let mut details = serde_json::Map::new();
        details.insert("kind".to_string(), self.kind().into());
        match self {
            Self::UpstreamTransient {
                status: upstream_status,
                detail,
                ..
            } => {
                if let Some(s) = upstream_status {
                    details.insert("upstream_status".to_string(), (*s).into());
                }
                if let Some(d) = detail {
                    details.insert("upstream_error".to_string(), d.clone().into());
                }
            }
            Self::UpstreamFatal {
                status: upstream_status,
                detail,
                ..
            } => {
                details.insert("upstream_status".to_string(), (*upstream_status).into());
                if let Some(d) = detail {
                    details.insert("upstream_error".to_string(), d.clone().into());
                }
            }
            _ => {}
        }

        let response = ErrorResponse::new(error_type, self.to_string())
            .with_details(serde_json::Value::Object(details));
        (status, response)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fatal(status: u16) -> ProxyError {
        ProxyError::UpstreamFatal {
            status,
            message: "nope".to_string(),
            detail: Some("{\"error\":{}}".to_string()),
        }
    }

    #[test]
    fn test_validation_maps_to_400() {
        let (status, body) = ProxyError::validation("messages is empty").to_error_response();
        assert_eq!(status, 400);
        assert_eq!(body.error_type, "error");
        assert_eq!(body.error.error_type, "invalid_request_error");
        assert!(body.error.message.contains("messages is empty"));
    }

    #[test]
    fn test_fatal_statuses() {
        assert_eq!(fatal(401).to_error_response().1.error.error_type, "authentication_error");
        assert_eq!(fatal(403).to_error_response().1.error.error_type, "permission_error");
        assert_eq!(fatal(404).to_error_response().1.error.error_type, "not_found_error");
        assert_eq!(fatal(400).to_error_response().1.error.error_type, "invalid_request_error");
        assert_eq!(fatal(400).status_code(), 502);
    }

    #[test]
    fn test_upstream_detail_is_preserved() {
        let (_, body) = fatal(401).to_error_response();
        let details = body.error.details.unwrap();
        assert_eq!(details["upstream_status"], 401);
        assert_eq!(details["upstream_error"], "{\"error\":{}}");
        assert_eq!(details["kind"], "UpstreamFatalError");
    }

    #[test]
    fn test_transient_classification() {
        let rate_limited = ProxyError::UpstreamTransient {
            status: Some(429),
            timed_out: false,
            message: "quota".to_string(),
            detail: None,
        };
        assert!(rate_limited.is_transient());
        assert_eq!(rate_limited.to_error_response().0, 503);
        assert_eq!(
            rate_limited.to_error_response().1.error.error_type,
            "rate_limit_error"
        );

        let timeout = ProxyError::timeout("no answer");
        assert!(timeout.is_transient());
        assert_eq!(timeout.status_code(), 504);

        assert!(!fatal(401).is_transient());
        assert!(!ProxyError::Cancelled.is_transient());
        assert!(!ProxyError::validation("x").is_transient());
    }

    #[test]
    fn test_overload_and_cancel() {
        assert_eq!(ProxyError::resource_exhausted("busy").status_code(), 503);
        assert_eq!(ProxyError::Cancelled.status_code(), 499);
        assert_eq!(ProxyError::config("bad").status_code(), 500);
    }
}

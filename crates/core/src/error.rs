use serde_json::json;
use std::collections::HashMap;

/// Unified error type for all dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upstream error (status {status}): {body}")]
    Upstream {
        status: u16,
        body: String,
        /// Parsed from upstream `Retry-After` header (seconds), if present.
        retry_after_secs: Option<u64>,
        /// Upstream headers attached to the error, if any. WebSocket error
        /// envelopes carry rate-limit headers this way.
        headers: Option<HashMap<String, String>>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Build an upstream error without retry/header metadata.
    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
            retry_after_secs: None,
            headers: None,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth(_) => 401,
            Self::Upstream { status, .. } => *status,
            Self::Network(_) => 502,
            Self::Translation(_) | Self::Internal(_) => 500,
            Self::BadRequest(_) => 400,
            Self::NotImplemented(_) => 501,
            Self::Cancelled => 499,
        }
    }

    /// Whether this is an upstream error with the given status code.
    pub fn is_status(&self, code: u16) -> bool {
        matches!(self, Self::Upstream { status, .. } if *status == code)
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Auth(_) => "authentication_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::NotImplemented(_) => "invalid_request_error",
            Self::Upstream { .. } => "upstream_error",
            _ => "server_error",
        }
    }

    /// Render this error as a JSON body in the common `{"error": {...}}`
    /// envelope. Upstream errors with a JSON body pass that body through.
    pub fn to_json_body(&self) -> String {
        if let Self::Upstream { body, .. } = self
            && serde_json::from_str::<serde_json::Value>(body).is_ok()
        {
            return body.clone();
        }
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        })
        .to_string()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network(format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::Network(format!("connection failed: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Translation(format!("JSON error: {e}"))
    }
}

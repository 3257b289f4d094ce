use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for the relay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("upstream unavailable: {upstream}")]
    UpstreamUnavailable { upstream: String },

    #[error("relay failed with status {status}: {code} {message}")]
    Relay {
        status: u16,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;

/// `type` assigned to errors raised by the relay itself rather than the upstream.
pub const RELAY_ERROR_TYPE: &str = "relay_error";

/// Error object in the OpenAI wire shape. Used both for errors decoded from an
/// upstream envelope and for errors the relay produces on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<serde_json::Value>,
    /// Upstreams send either a string or a number here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

impl UpstreamError {
    pub fn code_str(&self) -> Option<String> {
        match &self.code {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }
    }
}

/// A structured error paired with the HTTP status the client should see.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}: {}", .status, .error.message)]
pub struct ErrorWithStatus {
    pub error: UpstreamError,
    pub status: StatusCode,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a UpstreamError,
}

impl ErrorWithStatus {
    /// Wrap a local failure under a stable machine-readable `code`.
    pub fn wrap(err: impl std::fmt::Display, code: &str, status: StatusCode) -> Self {
        let message = err.to_string();
        tracing::error!(error.kind = code, status = status.as_u16(), "{message}");
        Self {
            error: UpstreamError {
                message,
                kind: RELAY_ERROR_TYPE.to_string(),
                param: None,
                code: Some(serde_json::Value::String(code.to_string())),
            },
            status,
        }
    }

    /// Stable code for local failures, or the upstream's `type` otherwise.
    pub fn kind(&self) -> String {
        self.error
            .code_str()
            .filter(|_| self.error.kind == RELAY_ERROR_TYPE)
            .unwrap_or_else(|| self.error.kind.clone())
    }

    /// Client-facing JSON body: `{"error": {...}}`.
    pub fn to_body(&self) -> Vec<u8> {
        serde_json::to_vec(&ErrorBody { error: &self.error }).unwrap_or_default()
    }
}

impl From<ErrorWithStatus> for RelayError {
    fn from(e: ErrorWithStatus) -> Self {
        RelayError::Relay {
            status: e.status.as_u16(),
            code: e.kind(),
            message: e.error.message,
        }
    }
}

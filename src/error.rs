//! Error taxonomy for the MQTT relay
//!
//! Network and protocol failures surface to the caller of a registry or
//! session operation. Persistence failures raised as a side effect of a
//! successful network operation are logged and swallowed by the caller, so
//! they only reach the HTTP layer when persistence *is* the operation.

use crate::config::ConfigError;
use crate::persistence::PersistenceError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection {connection_id} not found")]
    NotFound { connection_id: i64 },

    #[error("Connection timed out after {secs}s")]
    ConnectTimeout { secs: u64 },

    #[error("Broker rejected credentials: {message}")]
    AuthFailure { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Topic cannot be empty")]
    EmptyTopic,

    #[error("MQTT client for connection {connection_id} is not connected")]
    ClientNotConnected { connection_id: i64 },

    #[error("Broker rejected request: {message}")]
    BrokerReject { message: String },

    #[error("No acknowledgment for {operation} within {secs}s")]
    AckTimeout { operation: &'static str, secs: u64 },

    #[error("Connect for {connection_id} was superseded by a newer request")]
    Superseded { connection_id: i64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Structured failure body returned to HTTP callers
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FailureResponse {
    pub error: String,
    pub code: &'static str,
    pub details: String,
}

impl RelayError {
    /// Stable machine-readable code for this failure
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotFound { .. } => "NOT_FOUND",
            RelayError::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            RelayError::AuthFailure { .. } => "AUTH_FAILURE",
            RelayError::NetworkError { .. } => "NETWORK_ERROR",
            RelayError::EmptyTopic => "EMPTY_TOPIC",
            RelayError::ClientNotConnected { .. } => "CLIENT_NOT_CONNECTED",
            RelayError::BrokerReject { .. } => "BROKER_REJECT",
            RelayError::AckTimeout { .. } => "ACK_TIMEOUT",
            RelayError::Superseded { .. } => "SUPERSEDED",
            RelayError::InvalidInput { .. } => "INVALID_INPUT",
            RelayError::Persistence(_) => "PERSISTENCE_ERROR",
            RelayError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// HTTP status the API layer answers with
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::EmptyTopic | RelayError::InvalidInput { .. } => 400,
            RelayError::NotFound { .. } => 404,
            RelayError::ClientNotConnected { .. } | RelayError::Superseded { .. } => 409,
            RelayError::AuthFailure { .. }
            | RelayError::NetworkError { .. }
            | RelayError::BrokerReject { .. } => 502,
            RelayError::ConnectTimeout { .. } | RelayError::AckTimeout { .. } => 504,
            RelayError::Persistence(_) | RelayError::Config(_) => 500,
        }
    }

    /// Convert into the body sent over HTTP, with secrets scrubbed
    pub fn to_failure(&self, summary: &str) -> FailureResponse {
        FailureResponse {
            error: summary.to_string(),
            code: self.code(),
            details: sanitize_error_message(&self.to_string()),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    pub fn broker_reject<S: Into<String>>(message: S) -> Self {
        Self::BrokerReject {
            message: message.into(),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").expect("static regex")
});

static CREDENTIAL_URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"://[^/@\s:]+:[^/@\s]+@").expect("static regex"));

const MAX_DETAIL_LEN: usize = 500;

/// Redact credential-looking fragments and bound the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = CREDENTIAL_URL_PATTERN
        .replace_all(&sanitized, "://***@")
        .to_string();

    if sanitized.len() > MAX_DETAIL_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_DETAIL_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

//! Error types for xproc.
//!
//! Every failure a caller can observe from a remote call maps onto one of the
//! variants here. Dispatcher-side failures travel back to the caller as a status
//! byte on the response transaction, see [`XprocError::to_status_code`].

use std::time::Duration;
use thiserror::Error;

/// Main error type for the xproc library.
#[derive(Debug, Error)]
pub enum XprocError {
    // Codec errors
    #[error("Malformed payload: {message}")]
    MalformedPayload { message: String },

    // Versioning errors
    #[error("Remote end does not implement transaction code {code}")]
    UnsupportedMethod { code: u32 },

    // Connection errors
    #[error("Remote process is gone")]
    RemoteProcessGone,

    #[error("Call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("Connection is not bound")]
    NotConnected,

    #[error("Remote service failed: {message}")]
    RemoteFailure { message: String },

    #[error("Interface mismatch: requested {requested}, remote answered {message}")]
    InterfaceMismatch { requested: String, message: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown method: {name}")]
    UnknownMethod { name: String },
}

/// Result type alias for xproc operations.
pub type Result<T> = std::result::Result<T, XprocError>;

impl From<std::io::Error> for XprocError {
    fn from(err: std::io::Error) -> Self {
        XprocError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for XprocError {
    fn from(err: serde_json::Error) -> Self {
        XprocError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Status byte: the call succeeded.
pub const STATUS_OK: u8 = 0;
/// Status byte: the callee has no method for the transaction code.
pub const STATUS_UNSUPPORTED_METHOD: u8 = 1;
/// Status byte: the callee could not decode the request or encode the result.
pub const STATUS_MALFORMED_PAYLOAD: u8 = 2;
/// Status byte: the service object returned an error or panicked.
pub const STATUS_SERVICE_FAILURE: u8 = 3;
/// Status byte: the handshake named an interface the host does not serve.
pub const STATUS_INTERFACE_MISMATCH: u8 = 4;

impl XprocError {
    /// Shorthand for a `MalformedPayload` error.
    pub fn malformed(message: impl Into<String>) -> Self {
        XprocError::MalformedPayload {
            message: message.into(),
        }
    }

    /// Convert to the status byte carried by an error response.
    ///
    /// Errors that only make sense on the caller side (timeouts, connection
    /// state) are reported as service failures if they ever reach a dispatcher.
    pub fn to_status_code(&self) -> u8 {
        match self {
            XprocError::UnsupportedMethod { .. } => STATUS_UNSUPPORTED_METHOD,
            XprocError::MalformedPayload { .. } => STATUS_MALFORMED_PAYLOAD,
            XprocError::InterfaceMismatch { .. } => STATUS_INTERFACE_MISMATCH,
            _ => STATUS_SERVICE_FAILURE,
        }
    }

    /// Rebuild the caller-visible error from a response status byte.
    pub fn from_status(status: u8, code: u32, message: Option<String>) -> Self {
        let message = message.unwrap_or_default();
        match status {
            STATUS_UNSUPPORTED_METHOD => XprocError::UnsupportedMethod { code },
            STATUS_MALFORMED_PAYLOAD => XprocError::MalformedPayload { message },
            STATUS_INTERFACE_MISMATCH => XprocError::InterfaceMismatch {
                requested: String::new(),
                message,
            },
            STATUS_SERVICE_FAILURE => XprocError::RemoteFailure { message },
            other => XprocError::malformed(format!("unknown response status {}", other)),
        }
    }

    /// Check if this error means the connection can no longer carry calls.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            XprocError::RemoteProcessGone | XprocError::NotConnected | XprocError::Transport { .. }
        )
    }
}

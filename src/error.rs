//! Error types for the RPC client.
//!
//! Failures are split by what the caller can do about them: transport-class
//! errors are retried by calling again (the transport reconnects lazily),
//! authentication and configuration errors need reconfiguration, and RPC
//! errors carry the daemon's own code and message.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::RpcErrorObject;

/// Underlying I/O or HTTP failure behind a transport error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Client error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection could not be established or was lost mid-exchange.
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// No response within the configured timeout. The connection has been torn down.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The daemon rejected the credentials.
    #[error("Authentication failed (HTTP {status})")]
    Authentication {
        /// HTTP status returned by the daemon
        status: u16,
    },

    /// The daemon returned a structured JSON-RPC error.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Daemon error code
        code: i64,
        /// Daemon error message
        message: String,
        /// Optional additional data
        data: Option<serde_json::Value>,
    },

    /// No usable endpoint or credentials.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed or uncorrelated response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The call was made from an execution context the session cannot serve.
    #[error("Context error: {0}")]
    Context(String),

    /// Parameter encoding or result decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O failure (config files, runtime construction).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether calling again may succeed without reconfiguration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }

    /// The daemon error code, if this is an RPC error.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Error::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<RpcErrorObject> for Error {
    fn from(err: RpcErrorObject) -> Self {
        Error::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

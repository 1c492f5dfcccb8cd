// src/error.rs
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures reported by a card transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The card left the reader before we could talk to it
    #[error("no card present on {0}")]
    NoCard(String),

    /// APDU exchange failed at the connection level
    #[error("transmit failed: {0}")]
    Fault(String),

    /// The reader subsystem itself misbehaved
    #[error("reader error: {0}")]
    Reader(#[from] pcsc::Error),

    /// Waiting was interrupted by shutdown
    #[error("card wait cancelled")]
    Cancelled,
}

/// Failures talking to the remote RPC service.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("cannot connect to {uri}: {source}")]
    Connection {
        uri: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("connection to the RPC server is closed")]
    Closed,

    #[error("server returned errors {errors:?} for request {request}")]
    Protocol { errors: Vec<String>, request: String },

    #[error("no response to request {id} within {timeout:?}")]
    Timeout { id: u64, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// True when a fresh connection might make the same call succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Connection { .. } | RpcError::Closed)
    }
}

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("unknown key name: {0}")]
    UnknownKey(String),

    #[error("key injection is not supported on this platform")]
    Unsupported,

    #[error("key injection failed: {0}")]
    Injection(String),
}

/// Failure of a single sink dispatch. Never fatal to the card loop.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

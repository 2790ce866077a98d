//! Error types shared by the adapter and its transports.
//!
//! `TransportError` describes what went wrong talking to the broker;
//! `BusError` is what the adapter hands back to the host application.

use std::time::Duration;

use thiserror::Error;

/// Boxed error produced by pluggable collaborators such as id generators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a transport client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker rejected connection: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,

    #[error("broker unreachable at {0}")]
    Unreachable(String),
}

/// Errors returned by `BusAdapter` operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// No connection has been established yet.
    #[error("no connection to broker")]
    NoConnection,

    /// `connect` failed; carries the transport cause.
    #[error("failed to connect to broker: {0}")]
    Connection(#[source] TransportError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to generate inbox: {0}")]
    IdentifierGeneration(#[source] BoxError),

    #[error("request on {subject} timed out after {timeout:?}")]
    RequestTimeout { subject: String, timeout: Duration },
}

impl BusError {
    pub fn is_no_connection(&self) -> bool {
        matches!(self, BusError::NoConnection)
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, BusError::Connection(_))
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;

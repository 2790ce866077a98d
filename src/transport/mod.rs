//! The `transport` module is the boundary between the adapter and the broker.
//!
//! A `Connector` opens connections and hands back a `BrokerClient`; the
//! adapter never speaks a wire protocol itself. Two transports ship with the
//! crate:
//!
//! - `websocket`: JSON frames over a WebSocket, with automatic reconnection
//!   and client-side resubscription.
//! - `memory`: an in-process broker for tests and local development.

pub mod memory;
pub mod message;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::utils::error::TransportError;
use crate::utils::logging::Logger;

pub use memory::{MemoryBroker, MemoryClient};
pub use websocket::{WsClient, WsConnector};

/// Identifier of one broker-level listener, assigned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid-{}", self.0)
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Connection lifecycle reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Initial handshake completed.
    Connected,
    /// The link dropped; the client is trying to get it back.
    Disconnected,
    /// The link is back and every live listener has been re-registered.
    Reconnected,
    /// The client gave up or was closed.
    Closed,
}

pub type DeliveryHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type EventHook = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Everything a connector needs to open a connection.
#[derive(Clone)]
pub struct ConnectionInfo {
    /// `host:port`
    pub address: String,
    pub username: String,
    pub password: String,
    pub logger: Option<Arc<dyn Logger>>,
}

impl ConnectionInfo {
    /// Report through `tracing` and, when one is installed, the injected logger.
    pub(crate) fn log_info(&self, message: &str) {
        tracing::info!("{message}");
        if let Some(logger) = &self.logger {
            logger.info(message);
        }
    }

    pub(crate) fn log_warn(&self, message: &str) {
        tracing::warn!("{message}");
        if let Some(logger) = &self.logger {
            logger.warn(message);
        }
    }

    pub(crate) fn log_debug(&self, message: &str) {
        tracing::debug!("{message}");
        if let Some(logger) = &self.logger {
            logger.debug(message);
        }
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// An open connection to a broker.
///
/// Registration and publishing are non-blocking; inbound messages are pushed
/// to the `DeliveryHandler` from the client's own task or thread. Handlers
/// are never invoked while the client holds an internal lock, so they may
/// call back into the client.
pub trait BrokerClient: Send + Sync + 'static {
    fn subscribe(
        &self,
        subject: &str,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionId, TransportError>;

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Remove every listener this client holds on `subject`.
    fn unsubscribe_all(&self, subject: &str) -> Result<(), TransportError>;

    fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    fn ping(&self) -> impl Future<Output = bool> + Send;

    fn close(&self);
}

/// Opens connections; one call per `BusAdapter::connect`.
///
/// Implementations emit `ConnectionEvent::Connected` through `events` once
/// the handshake succeeds, and later lifecycle changes as they happen.
pub trait Connector: Send + Sync + 'static {
    type Client: BrokerClient;

    fn connect(
        &self,
        info: &ConnectionInfo,
        events: EventHook,
    ) -> impl Future<Output = Result<Self::Client, TransportError>> + Send;
}

#[cfg(test)]
mod websocket_tests;

//! # busadapter
//!
//! `busadapter` is a message-bus client adapter: it connects to a
//! publish/subscribe broker, keeps track of subscriptions and re-establishes
//! them after every (re)connect, and exposes publish, subscribe,
//! request/reply and ping operations to a host application.
//!
//! ## Core Modules
//!
//! - `adapter`: `BusAdapter`, the stored subscription set and request inboxes.
//! - `transport`: the connector/client boundary plus the WebSocket and
//!   in-memory transports.
//! - `config`: loading broker and client settings.
//! - `utils`: error types and logging.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use busadapter::{BusAdapter, WsConnector};
//!
//! # async fn run() -> Result<(), busadapter::BusError> {
//! let adapter = BusAdapter::new(WsConnector::default());
//! adapter.configure("127.0.0.1", 4222, "user", "secret");
//! adapter.subscribe("greetings", |payload| println!("{payload:?}"))?;
//! adapter.connect().await?;
//! adapter.publish("greetings", b"hello")?;
//! let reply = adapter
//!     .request_reply("time.now", b"", Duration::from_secs(1))
//!     .await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod transport;
pub mod utils;

pub use adapter::{BusAdapter, IdGenerator, Registration};
pub use config::{AdapterConfig, Settings, load_config};
pub use transport::{
    BrokerClient, ConnectionEvent, Connector, InboundMessage, MemoryBroker, SubscriptionId,
    WsConnector,
};
pub use utils::error::{BusError, TransportError};
pub use utils::logging::Logger;

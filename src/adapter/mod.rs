//! The `adapter` module contains `BusAdapter`, the host-facing wrapper around
//! a broker connection, along with its stored subscriptions and the inbox
//! machinery used for request/reply.

pub mod engine;
pub mod inbox;
pub mod subscription;

pub use engine::{BusAdapter, ConnectCallback};
pub use inbox::{INBOX_PREFIX, IdGenerator, UuidGenerator};
pub use subscription::{MessageHandler, Registration, ReplyHandler, SubscriptionMode};

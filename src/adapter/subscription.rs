//! Stored subscriptions
//!
//! Every `subscribe` / `respond_to_channel` call appends a `Subscription` to
//! the adapter's `SubscriptionSet`. The set is replayed in insertion order
//! against each new connection and only ever cleared as a whole.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::transport::{BrokerClient, DeliveryHandler, InboundMessage, SubscriptionId};

/// Fire-and-forget handler receiving the raw payload.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Handler whose return value is sent to the message's reply-to address.
pub type ReplyHandler = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub enum SubscriptionMode {
    Callback(MessageHandler),
    Reply(ReplyHandler),
}

impl SubscriptionMode {
    /// Build the broker-level listener for this mode.
    ///
    /// Reply handlers run for every message; their output is published only
    /// when the message names a reply-to address. The client is held weakly
    /// so listeners never keep a replaced connection alive.
    pub(crate) fn delivery_handler<C: BrokerClient>(&self, client: Weak<C>) -> DeliveryHandler {
        match self {
            SubscriptionMode::Callback(callback) => {
                let callback = callback.clone();
                Arc::new(move |msg: InboundMessage| callback(msg.payload))
            }
            SubscriptionMode::Reply(reply) => {
                let reply = reply.clone();
                Arc::new(move |msg: InboundMessage| {
                    let response = reply(msg.payload);

                    let Some(reply_to) = msg.reply_to else {
                        debug!(subject = %msg.subject, "no reply-to address; response dropped");
                        return;
                    };
                    let Some(client) = client.upgrade() else {
                        return;
                    };
                    if let Err(e) = client.publish(&reply_to, None, &response) {
                        warn!(subject = %msg.subject, %reply_to, error = %e, "failed to send reply");
                    }
                })
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionMode::Callback(_) => f.write_str("Callback"),
            SubscriptionMode::Reply(_) => f.write_str("Reply"),
        }
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub subject: String,
    pub mode: SubscriptionMode,
    /// Id assigned by the current connection; `None` while queued.
    pub id: Option<SubscriptionId>,
}

impl Subscription {
    pub fn new(subject: &str, mode: SubscriptionMode) -> Self {
        Self {
            subject: subject.to_string(),
            mode,
            id: None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.mode, SubscriptionMode::Reply(_))
    }
}

/// Outcome of a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Registered with the broker right away.
    Active(SubscriptionId),
    /// No connection yet; registered on the next successful `connect`.
    Queued,
}

impl Registration {
    pub fn is_active(&self) -> bool {
        matches!(self, Registration::Active(_))
    }

    pub fn id(&self) -> Option<SubscriptionId> {
        match self {
            Registration::Active(id) => Some(*id),
            Registration::Queued => None,
        }
    }
}

/// Insertion-ordered subscriptions plus a version bumped on every change.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    entries: Vec<Subscription>,
    version: u64,
}

impl SubscriptionSet {
    pub fn push(&mut self, subscription: Subscription) -> &mut Subscription {
        self.version += 1;
        self.entries.push(subscription);
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscription> {
        self.entries.iter_mut()
    }

    /// Distinct subjects in first-subscribed order.
    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = Vec::new();
        for entry in self.iter() {
            if !subjects.contains(&entry.subject) {
                subjects.push(entry.subject.clone());
            }
        }
        subjects
    }

    pub fn clear(&mut self) {
        self.version += 1;
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

//! In-process broker
//!
//! `MemoryBroker` keeps subjects, connections and their listeners in memory
//! and delivers messages synchronously on the publishing thread. It is a
//! `Connector`, so a `BusAdapter` can run against it without a network;
//! clones share the same broker.
//!
//! Routing notes:
//! - subjects match exactly (no wildcards)
//! - listeners on a subject are invoked in registration order
//! - handlers run after the broker lock is released, so they may publish
//!
//! Test hooks: `set_online(false)` refuses new connections and fails pings,
//! `bounce()` simulates a dropped link that the client re-establishes on its
//! own, and `published()` returns the most recent publishes (up to the
//! history limit) for later inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::transport::{
    BrokerClient, ConnectionEvent, ConnectionInfo, Connector, DeliveryHandler, EventHook,
    InboundMessage, SubscriptionId,
};
use crate::utils::error::TransportError;
use crate::utils::lock;

pub type ConnectionId = u64;

/// Publishes kept for `published()` unless `with_history` says otherwise.
pub const DEFAULT_HISTORY: usize = 1024;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    subjects: HashMap<String, Vec<(ConnectionId, SubscriptionId)>>,
    connections: HashMap<ConnectionId, Connection>,
    credentials: Option<(String, String)>,
    offline: bool,
    next_connection: ConnectionId,
    published: VecDeque<InboundMessage>,
    history: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            subjects: HashMap::new(),
            connections: HashMap::new(),
            credentials: None,
            offline: false,
            next_connection: 0,
            published: VecDeque::new(),
            history: DEFAULT_HISTORY,
        }
    }
}

struct Connection {
    listeners: HashMap<SubscriptionId, Listener>,
    events: EventHook,
    next_sid: u64,
}

struct Listener {
    subject: String,
    handler: DeliveryHandler,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept connections presenting these credentials.
    pub fn with_credentials(username: &str, password: &str) -> Self {
        let broker = Self::new();
        broker.state().credentials = Some((username.to_string(), password.to_string()));
        broker
    }

    /// Keep at most `limit` publishes for `published()`; 0 records nothing.
    pub fn with_history(limit: usize) -> Self {
        let broker = Self::new();
        broker.state().history = limit;
        broker
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    pub fn set_online(&self, online: bool) {
        self.state().offline = !online;
    }

    /// Drop every link and let the clients re-establish it, keeping their
    /// listeners, the way a reconnecting client resubscribes on its own.
    pub fn bounce(&self) {
        let hooks: Vec<EventHook> = self
            .state()
            .connections
            .values()
            .map(|c| c.events.clone())
            .collect();

        for hook in &hooks {
            hook(ConnectionEvent::Disconnected);
        }
        for hook in &hooks {
            hook(ConnectionEvent::Reconnected);
        }
    }

    /// Publish as an outside party, e.g. a responder living elsewhere.
    pub fn inject(&self, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
        self.deliver(InboundMessage {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload: payload.to_vec(),
        });
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.state().subjects.get(subject).map_or(0, Vec::len)
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// The most recent publishes, oldest first.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.state().published.iter().cloned().collect()
    }

    pub fn published_on(&self, subject: &str) -> Vec<InboundMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    fn deliver(&self, msg: InboundMessage) {
        let handlers: Vec<DeliveryHandler> = {
            let mut state = self.state();
            if state.history > 0 {
                if state.published.len() == state.history {
                    state.published.pop_front();
                }
                state.published.push_back(msg.clone());
            }

            let Some(listeners) = state.subjects.get(&msg.subject) else {
                debug!(subject = %msg.subject, "no listeners for subject");
                return;
            };

            listeners
                .iter()
                .filter_map(|(conn, sid)| {
                    state
                        .connections
                        .get(conn)
                        .and_then(|c| c.listeners.get(sid))
                        .map(|l| l.handler.clone())
                })
                .collect()
        };

        for handler in handlers {
            handler(msg.clone());
        }
    }
}

impl BrokerState {
    fn remove_listener(&mut self, conn: ConnectionId, sid: SubscriptionId) -> Option<Listener> {
        let listener = self.connections.get_mut(&conn)?.listeners.remove(&sid)?;
        if let Some(list) = self.subjects.get_mut(&listener.subject) {
            list.retain(|entry| *entry != (conn, sid));
            if list.is_empty() {
                self.subjects.remove(&listener.subject);
            }
        }
        Some(listener)
    }
}

impl Connector for MemoryBroker {
    type Client = MemoryClient;

    async fn connect(
        &self,
        info: &ConnectionInfo,
        events: EventHook,
    ) -> Result<MemoryClient, TransportError> {
        let id = {
            let mut state = self.state();
            if state.offline {
                return Err(TransportError::Unreachable(info.address.clone()));
            }
            if let Some((user, pass)) = &state.credentials {
                if *user != info.username || *pass != info.password {
                    return Err(TransportError::Rejected("invalid credentials".to_string()));
                }
            }

            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(
                id,
                Connection {
                    listeners: HashMap::new(),
                    events: events.clone(),
                    next_sid: 0,
                },
            );
            id
        };

        info.log_info(&format!(
            "connected to in-memory broker at {} as connection {id}",
            info.address
        ));
        events(ConnectionEvent::Connected);

        Ok(MemoryClient {
            broker: self.clone(),
            id,
            info: info.clone(),
        })
    }
}

/// One connection to a `MemoryBroker`. Closing (or dropping) it removes all
/// of its listeners.
pub struct MemoryClient {
    broker: MemoryBroker,
    id: ConnectionId,
    info: ConnectionInfo,
}

impl MemoryClient {
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

impl BrokerClient for MemoryClient {
    fn subscribe(
        &self,
        subject: &str,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionId, TransportError> {
        let mut state = self.broker.state();
        let conn = state
            .connections
            .get_mut(&self.id)
            .ok_or(TransportError::Closed)?;

        conn.next_sid += 1;
        let sid = SubscriptionId(conn.next_sid);
        conn.listeners.insert(
            sid,
            Listener {
                subject: subject.to_string(),
                handler,
            },
        );
        state
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push((self.id, sid));

        Ok(sid)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        state.remove_listener(self.id, id);
        Ok(())
    }

    fn unsubscribe_all(&self, subject: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let sids: Vec<SubscriptionId> = state
            .connections
            .get(&self.id)
            .ok_or(TransportError::Closed)?
            .listeners
            .iter()
            .filter(|(_, l)| l.subject == subject)
            .map(|(sid, _)| *sid)
            .collect();

        for sid in sids {
            state.remove_listener(self.id, sid);
        }
        Ok(())
    }

    fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if !self.broker.state().connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        self.broker.inject(subject, reply_to, payload);
        Ok(())
    }

    async fn ping(&self) -> bool {
        let state = self.broker.state();
        !state.offline && state.connections.contains_key(&self.id)
    }

    fn close(&self) {
        let removed = {
            let mut state = self.broker.state();
            let sids: Vec<SubscriptionId> = match state.connections.get(&self.id) {
                Some(conn) => conn.listeners.keys().copied().collect(),
                None => return,
            };
            for sid in sids {
                state.remove_listener(self.id, sid);
            }
            state.connections.remove(&self.id)
        };

        if let Some(conn) = removed {
            self.info
                .log_debug(&format!("in-memory connection {} closed", self.id));
            (conn.events)(ConnectionEvent::Closed);
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.close();
    }
}

//! Bus adapter engine
//!
//! `BusAdapter` wraps a transport `Connector` and is the only type a host
//! application needs:
//! - `configure` + `connect` open a connection; every stored subscription is
//!   replayed against it
//! - `subscribe` / `respond_to_channel` register right away when connected
//!   and are queued otherwise
//! - `publish`, `request` and `ping` go straight through the current client
//!
//! Concurrency notes:
//! - All adapter state sits behind one mutex. It is never held across an
//!   `.await` or while publishing, so handlers may call back into the
//!   adapter.
//! - Replaying subscriptions on `connect` happens under that mutex, so it is
//!   atomic with respect to concurrent `subscribe` calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::adapter::inbox::{IdGenerator, PendingRequest, UuidGenerator, inbox_subject};
use crate::adapter::subscription::{
    Registration, Subscription, SubscriptionMode, SubscriptionSet,
};
use crate::config::{AdapterConfig, Settings};
use crate::transport::{
    BrokerClient, ConnectionEvent, ConnectionInfo, Connector, DeliveryHandler, EventHook,
    InboundMessage, SubscriptionId, WsConnector,
};
use crate::utils::error::{BusError, Result, TransportError};
use crate::utils::lock;
use crate::utils::logging::Logger;

pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Hooks shared with the transport's event callback.
#[derive(Default)]
struct Hooks {
    on_connect: Mutex<Option<ConnectCallback>>,
    logger: Mutex<Option<Arc<dyn Logger>>>,
}

impl Hooks {
    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected | ConnectionEvent::Reconnected => {
                info!(?event, "broker connection established");
                let callback = lock(&self.on_connect).clone();
                if let Some(callback) = callback {
                    callback();
                }
            }
            ConnectionEvent::Disconnected => warn!("broker connection lost"),
            ConnectionEvent::Closed => debug!("broker connection closed"),
        }
    }
}

struct AdapterState<T> {
    config: AdapterConfig,
    connection: Option<Arc<T>>,
    subscriptions: SubscriptionSet,
    runtime: Option<Handle>,
}

pub struct BusAdapter<C: Connector = WsConnector> {
    connector: C,
    state: Mutex<AdapterState<C::Client>>,
    hooks: Arc<Hooks>,
    ids: Box<dyn IdGenerator>,
}

impl BusAdapter<WsConnector> {
    /// WebSocket adapter configured from loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let adapter = Self::new(WsConnector::from_settings(&settings.client));
        lock(&adapter.state).config = settings.broker.clone();
        adapter
    }
}

impl<C: Connector> BusAdapter<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            state: Mutex::new(AdapterState {
                config: AdapterConfig::default(),
                connection: None,
                subscriptions: SubscriptionSet::default(),
                runtime: None,
            }),
            hooks: Arc::new(Hooks::default()),
            ids: Box::new(UuidGenerator),
        }
    }

    /// Replace the generator behind inbox names.
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn configure(&self, host: &str, port: u16, username: &str, password: &str) {
        lock(&self.state).config = AdapterConfig::new(host, port, username, password);
    }

    pub fn config(&self) -> AdapterConfig {
        lock(&self.state).config.clone()
    }

    /// Single slot: replaces any earlier callback. Runs on every connect and
    /// on every automatic reconnect.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.hooks.on_connect) = Some(Arc::new(callback));
    }

    /// Handed to the transport on the next `connect`.
    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        *lock(&self.hooks.logger) = Some(logger);
    }

    /// Open a new connection, replacing the current one, and replay every
    /// stored subscription against it.
    pub async fn connect(&self) -> Result<()> {
        let info = {
            let state = lock(&self.state);
            ConnectionInfo {
                address: state.config.address(),
                username: state.config.username.clone(),
                password: state.config.password.clone(),
                logger: lock(&self.hooks.logger).clone(),
            }
        };

        let hooks = self.hooks.clone();
        let events: EventHook = Arc::new(move |event| hooks.handle_event(event));

        let client = self
            .connector
            .connect(&info, events)
            .await
            .map_err(BusError::Connection)?;
        let client = Arc::new(client);

        let mut state = lock(&self.state);
        state.runtime = Handle::try_current().ok();
        if let Some(previous) = state.connection.replace(client.clone()) {
            previous.close();
        }

        let mut replayed = 0;
        for sub in state.subscriptions.iter_mut() {
            match register(&client, sub) {
                Ok(_) => replayed += 1,
                Err(e) => {
                    sub.id = None;
                    warn!(
                        subject = %sub.subject,
                        reply = sub.is_reply(),
                        error = %e,
                        "failed to replay subscription"
                    );
                }
            }
        }
        debug!(
            address = %info.address,
            replayed,
            stored = state.subscriptions.len(),
            version = state.subscriptions.version(),
            "connected; subscriptions replayed"
        );

        Ok(())
    }

    pub fn subscribe<F>(&self, subject: &str, callback: F) -> Result<Registration>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.add_subscription(subject, SubscriptionMode::Callback(Arc::new(callback)))
    }

    /// Answer requests on `subject` with the handler's output.
    pub fn respond_to_channel<F>(&self, subject: &str, handler: F) -> Result<Registration>
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        self.add_subscription(subject, SubscriptionMode::Reply(Arc::new(handler)))
    }

    fn add_subscription(&self, subject: &str, mode: SubscriptionMode) -> Result<Registration> {
        let mut state = lock(&self.state);
        let client = state.connection.clone();
        let sub = state.subscriptions.push(Subscription::new(subject, mode));

        match client {
            Some(client) => Ok(Registration::Active(register(&client, sub)?)),
            None => {
                debug!(subject, "no connection to broker; caching subscription");
                Ok(Registration::Queued)
            }
        }
    }

    /// Drop this adapter's listeners on every stored subject and forget the
    /// stored subscriptions.
    pub fn unsubscribe_all(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let client = state.connection.clone().ok_or(BusError::NoConnection)?;

        for subject in state.subscriptions.subjects() {
            if let Err(e) = client.unsubscribe_all(&subject) {
                warn!(%subject, error = %e, "failed to unsubscribe");
            }
        }
        state.subscriptions.clear();
        debug!(
            version = state.subscriptions.version(),
            "stored subscriptions cleared"
        );
        Ok(())
    }

    pub fn publish(&self, subject: &str, message: &[u8]) -> Result<()> {
        self.client()?.publish(subject, None, message)?;
        Ok(())
    }

    /// Publish `message` with a fresh inbox as reply-to and hand the first
    /// reply to `callback`. The inbox is released after that reply or once
    /// `timeout` elapses, in which case `callback` is dropped unused.
    ///
    /// Returns the inbox subject.
    pub fn request<F>(
        &self,
        subject: &str,
        message: &[u8],
        timeout: Duration,
        callback: F,
    ) -> Result<String>
    where
        F: FnOnce(Vec<u8>) + Send + 'static,
    {
        let (client, runtime) = {
            let state = lock(&self.state);
            let client = state.connection.clone().ok_or(BusError::NoConnection)?;
            (client, state.runtime.clone())
        };

        let id = self
            .ids
            .generate()
            .map_err(BusError::IdentifierGeneration)?;
        let inbox = inbox_subject(&id);

        let pending = PendingRequest::new(&inbox, &client, Box::new(callback));
        let handler: DeliveryHandler = {
            let pending = pending.clone();
            Arc::new(move |msg: InboundMessage| {
                if let Some(callback) = pending.finish() {
                    callback(msg.payload);
                }
            })
        };
        pending.bind(client.subscribe(&inbox, handler)?);

        if let Err(e) = client.publish(subject, Some(&inbox), message) {
            pending.finish();
            return Err(e.into());
        }

        match runtime {
            Some(runtime) => {
                runtime.spawn(pending.expire_after(timeout));
            }
            None => warn!(%inbox, "no runtime available; request will not time out"),
        }

        Ok(inbox)
    }

    /// Send a request and wait for its reply.
    pub async fn request_reply(
        &self,
        subject: &str,
        message: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.request(subject, message, timeout, move |payload| {
            let _ = tx.send(payload);
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            _ => Err(BusError::RequestTimeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }

    /// `false` until a connection exists; then the transport's liveness check.
    pub async fn ping(&self) -> bool {
        let client = lock(&self.state).connection.clone();
        match client {
            Some(client) => client.ping().await,
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connection.is_some()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    pub fn subjects(&self) -> Vec<String> {
        lock(&self.state).subscriptions.subjects()
    }

    fn client(&self) -> Result<Arc<C::Client>> {
        lock(&self.state)
            .connection
            .clone()
            .ok_or(BusError::NoConnection)
    }
}

fn register<T: BrokerClient>(
    client: &Arc<T>,
    sub: &mut Subscription,
) -> Result<SubscriptionId, TransportError> {
    let handler = sub.mode.delivery_handler(Arc::downgrade(client));
    let id = client.subscribe(&sub.subject, handler)?;
    sub.id = Some(id);
    Ok(id)
}

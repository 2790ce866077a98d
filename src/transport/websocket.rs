//! WebSocket transport
//!
//! `WsConnector` opens a `ws://host:port` connection, authenticates with a
//! `connect` frame and hands back a `WsClient`. Each client runs two tasks:
//! - a writer draining an unbounded channel into the socket, so publishing
//!   never blocks the caller
//! - a supervisor reading inbound frames, dispatching `message` frames to
//!   the listener registered for their `sid` and answering pings
//!
//! When the socket drops the supervisor emits `Disconnected`, retries the
//! handshake according to the reconnect policy, re-sends `subscribe` for
//! every live listener and emits `Reconnected`. Once the attempts run out
//! the client is closed and `Closed` is emitted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::ClientSettings;
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::transport::{
    BrokerClient, ConnectionEvent, ConnectionInfo, Connector, DeliveryHandler, EventHook,
    InboundMessage, SubscriptionId,
};
use crate::utils::error::TransportError;
use crate::utils::lock;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    ping_timeout: Duration,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl WsConnector {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            ping_timeout: settings.ping_timeout(),
            reconnect_attempts: settings.reconnect_attempts,
            reconnect_delay: settings.reconnect_delay(),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::from_settings(&ClientSettings::default())
    }
}

impl Connector for WsConnector {
    type Client = WsClient;

    async fn connect(
        &self,
        info: &ConnectionInfo,
        events: EventHook,
    ) -> Result<WsClient, TransportError> {
        let (sink, source) = handshake(info, self.connect_timeout).await?;

        let shared = Arc::new(Shared {
            info: info.clone(),
            events,
            settings: self.clone(),
            outbound: Mutex::new(spawn_writer(sink)),
            listeners: Mutex::new(HashMap::new()),
            pending_pongs: Mutex::new(VecDeque::new()),
            supervisor: Mutex::new(None),
            next_sid: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        info.log_info(&format!("connected to broker at {}", info.address));
        (shared.events)(ConnectionEvent::Connected);

        let task = tokio::spawn(supervise(shared.clone(), source));
        *lock(&shared.supervisor) = Some(task.abort_handle());

        Ok(WsClient { shared })
    }
}

struct Listener {
    subject: String,
    handler: DeliveryHandler,
}

pub(crate) struct Shared {
    info: ConnectionInfo,
    events: EventHook,
    settings: WsConnector,
    /// Replaced on every reconnect; the old writer ends with its sender.
    outbound: Mutex<mpsc::UnboundedSender<WsMessage>>,
    listeners: Mutex<HashMap<u64, Listener>>,
    pending_pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
    supervisor: Mutex<Option<AbortHandle>>,
    next_sid: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = serde_json::to_string(frame)?;
        lock(&self.outbound)
            .send(WsMessage::text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Message {
                sid,
                subject,
                reply_to,
                payload,
            } => {
                let handler = lock(&self.listeners).get(&sid).map(|l| l.handler.clone());
                match handler {
                    Some(handler) => handler(InboundMessage {
                        subject,
                        reply_to,
                        payload,
                    }),
                    None => self.info.log_debug(&format!(
                        "dropping message on {subject} for unknown listener {sid}"
                    )),
                }
            }
            ServerFrame::Pong => {
                // waiters that already timed out are skipped
                let mut pending = lock(&self.pending_pongs);
                while let Some(waiter) = pending.pop_front() {
                    if waiter.send(()).is_ok() {
                        break;
                    }
                }
            }
            ServerFrame::Error { message } => {
                self.info.log_warn(&format!("broker reported error: {message}"));
            }
            ServerFrame::Connected {} => self.info.log_debug("ignoring duplicate connected frame"),
        }
    }

    /// Switch writes to a fresh socket and re-register every live listener
    /// on it. The listener map stays locked throughout, so a concurrent
    /// `subscribe` lands either before the snapshot or after the switch and
    /// each sid is sent once on the new link.
    pub(crate) fn relink(&self, sink: WsSink) {
        let listeners = lock(&self.listeners);
        *lock(&self.outbound) = spawn_writer(sink);

        let mut live: Vec<(u64, &str)> = listeners
            .iter()
            .map(|(sid, l)| (*sid, l.subject.as_str()))
            .collect();
        live.sort_unstable_by_key(|(sid, _)| *sid);

        for (sid, subject) in live {
            let frame = ClientFrame::Subscribe {
                sid,
                subject: subject.to_string(),
            };
            if let Err(e) = self.send_frame(&frame) {
                warn!(sid, error = %e, "failed to re-register listener");
            }
        }
    }

    /// Mark closed exactly once; returns whether this call did it.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Open the socket and complete the `connect` handshake within `timeout`.
pub(crate) async fn handshake(
    info: &ConnectionInfo,
    timeout: Duration,
) -> Result<(WsSink, WsSource), TransportError> {
    tokio::time::timeout(timeout, open_session(info))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

async fn open_session(info: &ConnectionInfo) -> Result<(WsSink, WsSource), TransportError> {
    let url = format!("ws://{}", info.address);
    let (stream, _response) = connect_async(url).await?;
    let (mut sink, mut source) = stream.split();

    let hello = ClientFrame::Connect {
        username: info.username.clone(),
        password: info.password.clone(),
    };
    sink.send(WsMessage::text(serde_json::to_string(&hello)?))
        .await?;

    while let Some(msg) = source.next().await {
        match msg? {
            WsMessage::Text(text) => match serde_json::from_str::<ServerFrame>(text.as_str())? {
                ServerFrame::Connected {} => return Ok((sink, source)),
                ServerFrame::Error { message } => return Err(TransportError::Rejected(message)),
                other => debug!(?other, "ignoring frame received before handshake completed"),
            },
            WsMessage::Close(_) => return Err(TransportError::Closed),
            _ => {}
        }
    }

    Err(TransportError::Closed)
}

fn spawn_writer(mut sink: WsSink) -> mpsc::UnboundedSender<WsMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!(error = %e, "websocket write failed");
                break;
            }
        }
        debug!("send loop closed");
    });
    tx
}

async fn supervise(shared: Arc<Shared>, mut source: WsSource) {
    loop {
        read_session(&shared, &mut source).await;
        if shared.is_closed() {
            break;
        }

        shared
            .info
            .log_warn(&format!("lost connection to broker at {}", shared.info.address));
        // pending pings cannot be answered on the old link
        lock(&shared.pending_pongs).clear();
        (shared.events)(ConnectionEvent::Disconnected);

        match reconnect(&shared).await {
            Some(next) => {
                source = next;
                (shared.events)(ConnectionEvent::Reconnected);
            }
            None => {
                if shared.mark_closed() {
                    shared.info.log_warn(&format!(
                        "giving up on broker at {} after {} reconnect attempts",
                        shared.info.address, shared.settings.reconnect_attempts
                    ));
                    (shared.events)(ConnectionEvent::Closed);
                }
                break;
            }
        }
    }
}

async fn read_session(shared: &Shared, source: &mut WsSource) {
    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "websocket read failed");
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                Ok(frame) => shared.handle_frame(frame),
                Err(err) => {
                    let snippet: String = text.as_str().chars().take(100).collect();
                    warn!(error = %err, frame = %snippet, "invalid frame from broker");
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn reconnect(shared: &Shared) -> Option<WsSource> {
    for attempt in 1..=shared.settings.reconnect_attempts {
        tokio::time::sleep(shared.settings.reconnect_delay).await;
        if shared.is_closed() {
            return None;
        }

        match handshake(&shared.info, shared.settings.connect_timeout).await {
            Ok((sink, source)) => {
                shared.relink(sink);
                shared.info.log_info(&format!(
                    "reconnected to broker at {} (attempt {attempt})",
                    shared.info.address
                ));
                return Some(source);
            }
            Err(e) => shared
                .info
                .log_warn(&format!("reconnect attempt {attempt} failed: {e}")),
        }
    }
    None
}

/// Handle to a WebSocket broker connection. Dropping it closes the link.
pub struct WsClient {
    pub(crate) shared: Arc<Shared>,
}

impl WsClient {
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl BrokerClient for WsClient {
    fn subscribe(
        &self,
        subject: &str,
        handler: DeliveryHandler,
    ) -> Result<SubscriptionId, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }

        let sid = self.shared.next_sid.fetch_add(1, Ordering::SeqCst);
        let mut listeners = lock(&self.shared.listeners);
        listeners.insert(
            sid,
            Listener {
                subject: subject.to_string(),
                handler,
            },
        );

        // while the link is down the listener is registered by the reconnect
        if let Err(e) = self.shared.send_frame(&ClientFrame::Subscribe {
            sid,
            subject: subject.to_string(),
        }) {
            self.shared
                .info
                .log_debug(&format!("subscribe {sid} deferred until reconnect: {e}"));
        }
        drop(listeners);

        Ok(SubscriptionId(sid))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let mut listeners = lock(&self.shared.listeners);
        if listeners.remove(&id.0).is_some() {
            self.shared
                .send_frame(&ClientFrame::Unsubscribe { sid: id.0 })?;
        }
        Ok(())
    }

    fn unsubscribe_all(&self, subject: &str) -> Result<(), TransportError> {
        let mut listeners = lock(&self.shared.listeners);
        let sids: Vec<u64> = listeners
            .iter()
            .filter(|(_, l)| l.subject == subject)
            .map(|(sid, _)| *sid)
            .collect();

        for sid in &sids {
            listeners.remove(sid);
        }
        for sid in sids {
            self.shared.send_frame(&ClientFrame::Unsubscribe { sid })?;
        }
        Ok(())
    }

    fn publish(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.shared.send_frame(&ClientFrame::Publish {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload: payload.to_vec(),
        })
    }

    async fn ping(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        {
            // hold the queue while sending so the pong cannot overtake the push
            let mut pending = lock(&self.shared.pending_pongs);
            if self.shared.send_frame(&ClientFrame::Ping).is_err() {
                return false;
            }
            pending.push_back(tx);
        }

        let answered = matches!(
            tokio::time::timeout(self.shared.settings.ping_timeout, rx).await,
            Ok(Ok(()))
        );
        if !answered {
            // the receiver is gone; drop its sender so a late pong skips it
            lock(&self.shared.pending_pongs).retain(|waiter| !waiter.is_closed());
        }
        answered
    }

    fn close(&self) {
        if !self.shared.mark_closed() {
            return;
        }

        let _ = lock(&self.shared.outbound).send(WsMessage::Close(None));
        if let Some(task) = lock(&self.shared.supervisor).take() {
            task.abort();
        }
        lock(&self.shared.pending_pongs).clear();

        self.shared
            .info
            .log_info(&format!("closed connection to broker at {}", self.shared.info.address));
        (self.shared.events)(ConnectionEvent::Closed);
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.close();
    }
}

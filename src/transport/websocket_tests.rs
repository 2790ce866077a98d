use crate::adapter::BusAdapter;
use crate::config::ClientSettings;
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::transport::websocket::handshake;
use crate::transport::{
    BrokerClient, ConnectionEvent, ConnectionInfo, Connector, DeliveryHandler, InboundMessage,
    WsConnector,
};
use crate::utils::error::{BusError, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_async;
use tungstenite::protocol::Message as WsMessage;

const PASSWORD: &str = "secret";

struct Route {
    conn: u64,
    sid: u64,
    subject: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<Vec<Route>>,
    /// `(connection, sid)` of every subscribe frame, in arrival order.
    subscribes: Mutex<Vec<(u64, u64)>>,
    /// Pings left to ignore before answering again.
    unanswered_pings: AtomicUsize,
}

/// Minimal broker speaking the client's frame protocol on a loopback port.
struct TestServer {
    port: u16,
    kick: broadcast::Sender<()>,
    state: Arc<ServerState>,
}

impl TestServer {
    async fn start() -> Self {
        let port = portpicker::pick_unused_port().expect("No free ports");
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("Failed to bind test server");
        let (kick, _) = broadcast::channel(4);
        let state = Arc::new(ServerState::default());
        let next_conn = Arc::new(AtomicU64::new(1));

        let kicker = kick.clone();
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = next_conn.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, conn, shared.clone(), kicker.subscribe()));
            }
        });

        Self { port, kick, state }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: format!("127.0.0.1:{}", self.port),
            username: "svc".to_string(),
            password: PASSWORD.to_string(),
            logger: None,
        }
    }

    fn subscribes(&self) -> Vec<(u64, u64)> {
        self.state.subscribes.lock().unwrap().clone()
    }

    fn ignore_pings(&self, count: usize) {
        self.state.unanswered_pings.store(count, Ordering::SeqCst);
    }

    /// Close every open connection from the server side.
    fn drop_connections(&self) {
        let _ = self.kick.send(());
    }
}

async fn serve(
    stream: TcpStream,
    conn: u64,
    state: Arc<ServerState>,
    mut kicked: broadcast::Receiver<()>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let Some(Ok(WsMessage::Text(hello))) = source.next().await else {
        return;
    };
    let Ok(ClientFrame::Connect { password, .. }) = serde_json::from_str(hello.as_str()) else {
        return;
    };
    let reply = if password == PASSWORD {
        ServerFrame::Connected {}
    } else {
        ServerFrame::Error {
            message: "invalid credentials".to_string(),
        }
    };
    let accepted = matches!(reply, ServerFrame::Connected {});
    let _ = sink
        .send(WsMessage::text(serde_json::to_string(&reply).unwrap()))
        .await;
    if !accepted {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    loop {
        tokio::select! {
            _ = kicked.recv() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            Some(frame) = rx.recv() => {
                let text = serde_json::to_string(&frame).unwrap();
                if sink.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }
            msg = source.next() => {
                let Some(Ok(WsMessage::Text(text))) = msg else {
                    break;
                };
                match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Subscribe { sid, subject }) => {
                        state.subscribes.lock().unwrap().push((conn, sid));
                        state.routes.lock().unwrap().push(Route { conn, sid, subject, tx: tx.clone() });
                    }
                    Ok(ClientFrame::Unsubscribe { sid }) => {
                        state.routes.lock().unwrap().retain(|r| !(r.conn == conn && r.sid == sid));
                    }
                    Ok(ClientFrame::Publish { subject, reply_to, payload }) => {
                        for route in state.routes.lock().unwrap().iter().filter(|r| r.subject == subject) {
                            let _ = route.tx.send(ServerFrame::Message {
                                sid: route.sid,
                                subject: subject.clone(),
                                reply_to: reply_to.clone(),
                                payload: payload.clone(),
                            });
                        }
                    }
                    Ok(ClientFrame::Ping) => {
                        let skip = state
                            .unanswered_pings
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok();
                        if !skip {
                            let _ = tx.send(ServerFrame::Pong);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    state.routes.lock().unwrap().retain(|r| r.conn != conn);
}

fn connector() -> WsConnector {
    WsConnector::from_settings(&ClientSettings {
        connect_timeout_ms: 1000,
        ping_timeout_ms: 500,
        request_timeout_ms: 1000,
        reconnect_attempts: 20,
        reconnect_delay_ms: 50,
    })
}

fn adapter_for(server: &TestServer, password: &str) -> BusAdapter {
    let adapter = BusAdapter::new(connector());
    adapter.configure("127.0.0.1", server.port, "svc", password);
    adapter
}

fn channel_handler() -> (
    mpsc::UnboundedReceiver<Vec<u8>>,
    impl Fn(Vec<u8>) + Send + Sync + 'static,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (rx, move |payload: Vec<u8>| {
        let _ = tx.send(payload);
    })
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, ms: u64) -> Option<Vec<u8>> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_publish_subscribe_over_websocket() {
    let server = TestServer::start().await;
    let adapter = adapter_for(&server, PASSWORD);
    let (mut rx, on_message) = channel_handler();

    adapter.subscribe("greetings", on_message).unwrap();
    adapter.connect().await.unwrap();
    assert!(adapter.ping().await);

    adapter.publish("greetings", &[0, 1, 2, 255]).unwrap();
    assert_eq!(recv_within(&mut rx, 1000).await, Some(vec![0, 1, 2, 255]));
}

#[tokio::test]
async fn test_rejected_credentials() {
    let server = TestServer::start().await;
    let adapter = adapter_for(&server, "wrong");

    let err = adapter.connect().await.unwrap_err();
    match err {
        BusError::Connection(TransportError::Rejected(message)) => {
            assert_eq!(message, "invalid credentials")
        }
        other => panic!("Expected rejected connection, got {other:?}"),
    }
    assert!(!adapter.is_connected());
}

#[tokio::test]
async fn test_unreachable_broker() {
    let port = portpicker::pick_unused_port().expect("No free ports");
    let adapter = BusAdapter::new(connector());
    adapter.configure("127.0.0.1", port, "svc", PASSWORD);

    let err = adapter.connect().await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn test_request_reply_across_adapters() {
    let server = TestServer::start().await;
    let responder = adapter_for(&server, PASSWORD);
    let requester = adapter_for(&server, PASSWORD);

    responder
        .respond_to_channel("upper", |payload| payload.to_ascii_uppercase())
        .unwrap();
    responder.connect().await.unwrap();
    requester.connect().await.unwrap();
    // the subscribe frame travels ahead of the ping on the same socket
    assert!(responder.ping().await);

    let reply = requester
        .request_reply("upper", b"shout", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply, b"SHOUT".to_vec());

    let err = requester
        .request_reply("nobody", b"?", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RequestTimeout { .. }));
}

#[tokio::test]
async fn test_unsubscribe_all_over_websocket() {
    let server = TestServer::start().await;
    let adapter = adapter_for(&server, PASSWORD);
    let (mut rx, on_message) = channel_handler();

    adapter.connect().await.unwrap();
    adapter.subscribe("ticks", on_message).unwrap();
    adapter.unsubscribe_all().unwrap();
    adapter.publish("ticks", b"1").unwrap();

    assert_eq!(recv_within(&mut rx, 200).await, None);
    assert_eq!(adapter.subscription_count(), 0);
}

#[tokio::test]
async fn test_reconnect_resubscribes_and_fires_on_connect() {
    let server = TestServer::start().await;
    let adapter = adapter_for(&server, PASSWORD);
    let connects = Arc::new(AtomicUsize::new(0));
    let (mut rx, on_message) = channel_handler();

    let counter = connects.clone();
    adapter.on_connect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    adapter.subscribe("alerts", on_message).unwrap();
    adapter.connect().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    server.drop_connections();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while connects.load(Ordering::SeqCst) < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client did not reconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    adapter.publish("alerts", b"after").unwrap();
    assert_eq!(recv_within(&mut rx, 1000).await, Some(b"after".to_vec()));
    // exactly one listener survived the reconnect
    assert_eq!(recv_within(&mut rx, 200).await, None);
}

#[tokio::test]
async fn test_relink_sends_each_listener_once() {
    let server = TestServer::start().await;
    let info = server.info();
    let client = connector()
        .connect(&info, Arc::new(|_: ConnectionEvent| {}))
        .await
        .unwrap();
    let noop: DeliveryHandler = Arc::new(|_: InboundMessage| {});

    let before = client.subscribe("dup", noop.clone()).unwrap();
    let (sink, _source) = handshake(&info, Duration::from_secs(1)).await.unwrap();
    client.shared.relink(sink);
    let after = client.subscribe("dup", noop).unwrap();

    // frames on one socket arrive in order, so `after` marks the end
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let link = loop {
        if let Some((conn, _)) = server.subscribes().into_iter().find(|(_, sid)| *sid == after.0) {
            break conn;
        }
        assert!(tokio::time::Instant::now() < deadline, "subscribe never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let on_link: Vec<u64> = server
        .subscribes()
        .into_iter()
        .filter(|(conn, _)| *conn == link)
        .map(|(_, sid)| sid)
        .collect();
    assert_eq!(on_link, vec![before.0, after.0]);
}

#[tokio::test]
async fn test_ping_recovers_after_unanswered_ping() {
    let server = TestServer::start().await;
    let adapter = adapter_for(&server, PASSWORD);
    adapter.connect().await.unwrap();

    server.ignore_pings(1);
    assert!(!adapter.ping().await);
    assert!(adapter.ping().await);
    assert!(adapter.ping().await);
}

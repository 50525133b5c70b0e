//! End-to-end tests for the WebSocket telemetry server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use pistats_broadcaster::collector::{GuardedCollector, TelemetryCollector};
use pistats_broadcaster::config::ServerConfig;
use pistats_broadcaster::registry::SubscriberRegistry;
use pistats_broadcaster::server::TelemetryServer;
use pistats_common::{TelemetrySnapshot, decode};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reports the subscriber count it was handed instead of real metrics.
struct EchoCountCollector;

impl TelemetryCollector for EchoCountCollector {
    fn collect(&mut self, connected_clients: usize) -> TelemetrySnapshot {
        TelemetrySnapshot::error(format!("clients={}", connected_clients))
    }
}

struct Harness {
    addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    cancel: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

fn local_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        broadcast_interval_ms: 50,
        ..ServerConfig::default()
    }
}

async fn start(max_subscribers: usize) -> Harness {
    start_with(ServerConfig {
        max_subscribers,
        ..local_config()
    })
    .await
}

async fn start_with(config: ServerConfig) -> Harness {
    let collector = GuardedCollector::new(EchoCountCollector, Duration::from_secs(1));

    let server = TelemetryServer::bind(config, collector).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.run(cancel.clone()));

    Harness {
        addr,
        registry,
        cancel,
        handle,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .expect("connect failed");
    client
}

/// Next snapshot frame, skipping control frames.
async fn next_snapshot(client: &mut Client) -> TelemetrySnapshot {
    let read = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return decode(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("no snapshot received")
}

async fn wait_for_members(registry: &SubscriberRegistry, expected: usize) {
    let wait = async {
        while registry.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("registry never reached {} members", expected));
}

fn error_text(snapshot: &TelemetrySnapshot) -> &str {
    match snapshot {
        TelemetrySnapshot::Error(err) => &err.error,
        other => panic!("unexpected snapshot {:?}", other),
    }
}

#[tokio::test]
async fn test_every_subscriber_receives_snapshots() {
    let harness = start(8).await;

    let mut first = connect(harness.addr).await;
    let mut second = connect(harness.addr).await;
    wait_for_members(&harness.registry, 2).await;

    // Drain frames produced before both clients were registered.
    let mut a = next_snapshot(&mut first).await;
    while error_text(&a) != "clients=2" {
        a = next_snapshot(&mut first).await;
    }
    let mut b = next_snapshot(&mut second).await;
    while error_text(&b) != "clients=2" {
        b = next_snapshot(&mut second).await;
    }

    harness.cancel.cancel();
    harness.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disconnect_unregisters_only_that_subscriber() {
    let harness = start(8).await;

    let mut staying = connect(harness.addr).await;
    let mut leaving = connect(harness.addr).await;
    wait_for_members(&harness.registry, 2).await;

    leaving.close(None).await.unwrap();
    drop(leaving);
    wait_for_members(&harness.registry, 1).await;

    let mut snapshot = next_snapshot(&mut staying).await;
    while error_text(&snapshot) != "clients=1" {
        snapshot = next_snapshot(&mut staying).await;
    }

    harness.cancel.cancel();
    harness.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inbound_messages_are_ignored() {
    let harness = start(8).await;

    let mut client = connect(harness.addr).await;
    wait_for_members(&harness.registry, 1).await;

    client
        .send(Message::Text("hello".into()))
        .await
        .unwrap();
    let snapshot = next_snapshot(&mut client).await;
    assert_eq!(error_text(&snapshot), "clients=1");
    assert_eq!(harness.registry.len(), 1);

    harness.cancel.cancel();
    harness.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_subscribers() {
    let harness = start(1).await;

    let _first = connect(harness.addr).await;
    wait_for_members(&harness.registry, 1).await;

    let rejected = tokio_tungstenite::connect_async(format!("ws://{}", harness.addr)).await;
    assert!(rejected.is_err());
    assert_eq!(harness.registry.len(), 1);

    harness.cancel.cancel();
    harness.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_subscribers_and_listener() {
    let harness = start(8).await;

    let mut client = connect(harness.addr).await;
    wait_for_members(&harness.registry, 1).await;

    harness.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), harness.handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert!(harness.registry.is_empty());

    // The client sees the close handshake or the stream ending.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    assert!(TcpStream::connect(harness.addr).await.is_err());
}

#[tokio::test]
async fn test_silent_subscriber_reclaimed_by_keepalive() {
    let harness = start_with(ServerConfig {
        ping_interval_secs: 1,
        ping_timeout_secs: 1,
        ..local_config()
    })
    .await;

    // Never polled, so pings are never answered.
    let silent = connect(harness.addr).await;
    wait_for_members(&harness.registry, 1).await;

    wait_for_members(&harness.registry, 0).await;
    drop(silent);

    harness.cancel.cancel();
    harness.handle.await.unwrap().unwrap();
}

//! WebSocket telemetry server.
//!
//! Accepts subscribers on the telemetry port, registers each one for the
//! lifetime of its connection, and runs the broadcast loop alongside.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, sleep_until, timeout};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;

use crate::broadcast;
use crate::collector::{GuardedCollector, TelemetryCollector};
use crate::config::{KeepAlive, ServerConfig};
use crate::registry::{Subscriber, SubscriberRegistry};

/// Why a subscriber connection ended.
#[derive(Debug)]
enum Disconnect {
    /// Client sent a close frame or the stream ended.
    Closed,
    /// No pong within the keep-alive deadline.
    PongTimeout,
    /// The server is shutting down.
    Shutdown,
    /// Transport or protocol error.
    Error(String),
}

/// Bound telemetry server, ready to run.
pub struct TelemetryServer<C> {
    listener: TcpListener,
    registry: Arc<SubscriberRegistry>,
    collector: GuardedCollector<C>,
    config: ServerConfig,
}

impl<C: TelemetryCollector> TelemetryServer<C> {
    /// Bind the listening socket. Failing to bind is fatal for the service.
    pub async fn bind(config: ServerConfig, collector: GuardedCollector<C>) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind telemetry server to {}", addr))?;

        Ok(Self {
            listener,
            registry: Arc::new(SubscriberRegistry::new()),
            collector,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SubscriberRegistry> {
        self.registry.clone()
    }

    /// Serve subscribers until `cancel` fires.
    ///
    /// On cancellation the listener is closed first, then the broadcast loop
    /// and every connection are stopped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self {
            listener,
            registry,
            collector,
            config,
        } = self;

        tracing::info!(
            "Telemetry server listening on {}",
            listener.local_addr().map_or_else(|_| config.bind_addr(), |a| a.to_string())
        );

        let broadcaster = tokio::spawn(broadcast::run(
            registry.clone(),
            collector,
            config.broadcast_interval(),
            cancel.child_token(),
        ));

        let semaphore = Arc::new(Semaphore::new(config.max_subscribers));
        let keepalive = config.keepalive();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let registry = registry.clone();
                            let cancel = cancel.child_token();
                            let buffer = config.subscriber_buffer;
                            connections.spawn(async move {
                                let _permit = permit; // Hold permit until connection closes
                                handle_connection(stream, addr, registry, keepalive, buffer, cancel)
                                    .await;
                            });
                        }
                        Err(_) => {
                            tracing::warn!("Max subscribers reached, rejecting {}", addr);
                            drop(stream);
                        }
                    },
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                },
            }
        }

        drop(listener);
        tracing::info!("Telemetry server stopped accepting connections");

        if let Err(e) = broadcaster.await {
            tracing::warn!("Broadcast loop ended abnormally: {}", e);
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if timeout(keepalive.close_timeout, drain).await.is_err() {
            tracing::warn!("Subscriber connections did not close in time, aborting");
            connections.abort_all();
        }

        Ok(())
    }
}

/// Serve one subscriber from handshake to close.
///
/// The subscriber is registered after the handshake and removed exactly once
/// on every exit path.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    keepalive: KeepAlive,
    buffer: usize,
    cancel: CancellationToken,
) {
    let ws = match timeout(
        keepalive.close_timeout,
        tokio_tungstenite::accept_async(stream),
    )
    .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
        Err(_) => {
            tracing::debug!("WebSocket handshake with {} timed out", addr);
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel(buffer);
    let id = registry.next_id();
    registry.add(Subscriber::new(id, addr.to_string(), tx));
    tracing::info!(client = %addr, clients = registry.len(), "Client connected");

    let (mut sink, stream) = ws.split();
    let reason = serve(&mut sink, stream, &mut rx, addr, keepalive, &cancel).await;
    if let Disconnect::Error(e) = &reason {
        tracing::debug!(client = %addr, "Connection error: {}", e);
    }

    if registry.remove(id).is_some() {
        tracing::info!(
            client = %addr,
            clients = registry.len(),
            reason = ?reason,
            "Client disconnected"
        );
    }

    if timeout(keepalive.close_timeout, sink.close()).await.is_err() {
        tracing::debug!("Close handshake with {} timed out", addr);
    }
}

async fn serve<S, R>(
    sink: &mut S,
    mut stream: R,
    frames: &mut mpsc::Receiver<Utf8Bytes>,
    addr: SocketAddr,
    keepalive: KeepAlive,
    cancel: &CancellationToken,
) -> Disconnect
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut ping = tokio::time::interval_at(
        Instant::now() + keepalive.ping_interval,
        keepalive.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Disconnect::Shutdown,
            _ = pong_expired => return Disconnect::PongTimeout,
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    return Disconnect::Closed;
                };
                if let Err(reason) = send(sink, Message::Text(frame), keepalive).await {
                    return reason;
                }
            }
            _ = ping.tick() => {
                if let Err(reason) = send(sink, Message::Ping(Default::default()), keepalive).await {
                    return reason;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + keepalive.ping_timeout);
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(client = %addr, "Ignoring message: {}", text);
                }
                Some(Ok(Message::Close(_))) | None => return Disconnect::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Disconnect::Error(e.to_string()),
            },
        }
    }
}

/// Send one message, treating a write that outlasts the ping timeout as dead.
async fn send<S>(sink: &mut S, message: Message, keepalive: KeepAlive) -> Result<(), Disconnect>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match timeout(keepalive.ping_timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Disconnect::Error(e.to_string())),
        Err(_) => Err(Disconnect::PongTimeout),
    }
}

//! WebSocket Quiz Server
//!
//! Connection lifecycle: accept, handshake, greet, pump frames through the
//! router, and reconcile on close. Each connection owns a reader loop and a
//! writer task joined by an mpsc queue; the registry only ever sees the
//! queue's sender side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::auth::AuthConfig;
use crate::network::dispatch::BroadcastDispatcher;
use crate::network::registry::{next_connection_id, ConnectionRegistry};
use crate::network::router::{ConnectionContext, MessageRouter};
use crate::persist::DurableStore;
use crate::presence::{FriendNotifier, Presence};
use crate::reconcile::{ReconcileConfig, ReconciliationScheduler};
use crate::session::store::SessionStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections with no inbound frame for this long are dropped.
    pub idle_timeout: Duration,
    /// Per-connection outbound queue depth.
    pub outbound_buffer: usize,
    /// Server version string, sent in the greeting.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static bind address"),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            outbound_buffer: 64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            idle_timeout: std::env::var("IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            outbound_buffer: defaults.outbound_buffer,
            version: defaults.version,
        }
    }
}

/// Quiz server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The quiz session server.
pub struct QuizServer {
    config: ServerConfig,
    sessions: Arc<SessionStore>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    reconciler: Arc<ReconciliationScheduler>,
    /// Raw connection count, including unauthenticated ones.
    active_connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl QuizServer {
    /// Assemble the server and all its session services.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        reconcile: ReconcileConfig,
        durable: Arc<dyn DurableStore>,
        notifier: Arc<dyn FriendNotifier>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone()));
        let presence = Arc::new(Presence::new(registry.clone(), notifier));
        let reconciler = ReconciliationScheduler::new(
            sessions.clone(),
            durable.clone(),
            dispatcher.clone(),
            presence.clone(),
            reconcile,
        );
        let router = Arc::new(MessageRouter::new(
            sessions.clone(),
            registry.clone(),
            dispatcher,
            durable,
            reconciler.clone(),
            presence,
            auth,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            sessions,
            registry,
            router,
            reconciler,
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Run the server until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("quiz server listening on {}", self.config.bind_addr);

        let sweep_handle = self.reconciler.spawn_sweep();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let active = self.active_connections.load(Ordering::Relaxed);
                            if active >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        sweep_handle.abort();
        Ok(())
    }

    /// Spawn the reader/writer pair for one accepted socket.
    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let config = self.config.clone();
        let router = self.router.clone();
        let registry = self.registry.clone();
        let reconciler = self.reconciler.clone();
        let active = self.active_connections.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            Self::run_connection(stream, addr, config, router, registry, reconciler, shutdown_rx)
                .await;
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn run_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        router: Arc<MessageRouter>,
        registry: Arc<ConnectionRegistry>,
        reconciler: Arc<ReconciliationScheduler>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("websocket handshake failed for {}: {}", addr, e);
                return;
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel(config.outbound_buffer);

        // Writer task: owns the sink, drains the queue.
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let text = match crate::network::protocol::ServerMessage::to_json(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let mut ctx = ConnectionContext::new(next_connection_id(), msg_tx.clone());

        let greeting = crate::network::protocol::ServerMessage::Connected {
            server_version: config.version.clone(),
        };
        if msg_tx.send(greeting).await.is_err() {
            writer_task.abort();
            return;
        }

        let mut last_activity = Instant::now();
        let mut idle_ticker = interval(config.idle_timeout / 4);
        idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            if let Some(reply) = router.route(&mut ctx, &text).await {
                                if msg_tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("websocket error for {}: {}", addr, e);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = idle_ticker.tick() => {
                    if last_activity.elapsed() > config.idle_timeout {
                        info!("dropping idle connection {}", addr);
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("closing {} for shutdown", addr);
                    break;
                }
            }
        }

        writer_task.abort();

        // Fatal errors, idle drops, and graceful closes all reconcile the
        // same way. A stale unregister (the user already reconnected on a
        // newer transport) skips reconciliation.
        if let Some(user) = ctx.user {
            if registry.unregister(&user.user_id, ctx.connection_id).await {
                reconciler.handle_disconnect(user.user_id).await;
            }
        }
        debug!("client {} cleaned up", addr);
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active raw connection count.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Authenticated user count.
    pub async fn online_count(&self) -> usize {
        self.registry.online_count().await
    }

    /// Resident lobby count.
    pub async fn lobby_count(&self) -> usize {
        self.sessions.len().await
    }
}

//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host:port/<doc>
//!             ├── Connection ── DocumentRegistry ── DocumentSession(<doc>)
//! Client B ──┘                        │                   │
//!                                     │             replica + awareness
//!                                   Reaper                │
//!                              (idle sessions)     BroadcastGroup
//!                                                   ┌─────┴─────┐
//!                                                   ▼           ▼
//!                                                Client A    Client B
//! ```
//!
//! The path of the upgrade request, minus its leading `/`, names the
//! document. Plain HTTP requests on the same port get a short liveness
//! response instead of an upgrade.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docsync_core::ConnectionId;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::config::ServerConfig;
use crate::connection::{self, Connection};
use crate::error::RelayError;
use crate::reaper::Reaper;
use crate::registry::DocumentRegistry;

/// Bytes of the request head inspected to tell probes from upgrades.
const PEEK_LIMIT: usize = 4096;
const PEEK_ATTEMPTS: usize = 50;
const PEEK_BACKOFF: Duration = Duration::from_millis(20);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The websocket layer drops the connection past this multiple of the
/// configured cap; below it, oversized messages are skipped individually.
const HARD_LIMIT_FACTOR: usize = 4;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// Lock-free counters shared by all connection tasks.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message(&self, len: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// The relay server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    registry: Arc<DocumentRegistry>,
    stats: Arc<StatsCounters>,
    next_conn_id: AtomicU64,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(DocumentRegistry::new(config.outbound_capacity));
        Self {
            config: Arc::new(config),
            registry,
            stats: Arc::new(StatsCounters::default()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address. Failure here is the only fatal error.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        tokio::select! {
            result = self.serve(listener) => result,
            _ = shutdown => {
                let stats = self.stats().await;
                log::info!(
                    "Shutting down ({} connections, {} sessions)",
                    stats.active_connections,
                    stats.active_sessions
                );
                Ok(())
            }
        }
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let local_addr = listener.local_addr()?;
        log::info!("Relay listening on {local_addr}");

        let _reaper = Reaper::spawn(self.registry.clone(), self.config.reap_interval);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let conn_id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
            let config = self.config.clone();
            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_socket(stream, addr, conn_id, config, registry, stats).await {
                    log::debug!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_socket(
        stream: TcpStream,
        addr: SocketAddr,
        conn_id: ConnectionId,
        config: Arc<ServerConfig>,
        registry: Arc<DocumentRegistry>,
        stats: Arc<StatsCounters>,
    ) -> Result<(), RelayError> {
        if !wants_websocket(&stream).await? {
            log::debug!("Answering HTTP probe from {addr}");
            return respond_probe(stream, &config.probe_response).await;
        }

        let hard_limit = config.max_message_size.saturating_mul(HARD_LIMIT_FACTOR);
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(hard_limit))
            .max_frame_size(Some(hard_limit));

        let mut path = String::new();
        let callback = |req: &Request, resp: Response| {
            path = req.uri().path().to_owned();
            Ok::<Response, ErrorResponse>(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

        let document = document_name(&path).to_owned();
        log::info!("{conn_id} connected from {addr} to '{document}'");

        stats.connection_opened();
        let conn = Connection::new(conn_id, document, config.max_message_size);
        connection::run(ws, conn, registry, stats.clone()).await;
        stats.connection_closed();

        log::info!("{conn_id} from {addr} disconnected");
        Ok(())
    }

    /// Snapshot of the server counters.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_sessions: self.registry.size().await,
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Document name for a request path: the path minus its leading `/`.
pub fn document_name(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Inspect the request head without consuming it.
///
/// `None` while the head is incomplete.
fn upgrade_requested(head: &[u8]) -> Option<bool> {
    let end = head.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&head[..end]);
    let upgrade = head.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.to_ascii_lowercase().contains("websocket")
        })
    });
    Some(upgrade)
}

async fn wants_websocket(stream: &TcpStream) -> Result<bool, RelayError> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    for _ in 0..PEEK_ATTEMPTS {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        match upgrade_requested(&buf[..n]) {
            Some(upgrade) => return Ok(upgrade),
            // Oversized head: let the handshake decide
            None if n == buf.len() => return Ok(true),
            None => tokio::time::sleep(PEEK_BACKOFF).await,
        }
    }
    Ok(true)
}

async fn respond_probe(mut stream: TcpStream, body: &str) -> Result<(), RelayError> {
    let mut head = vec![0u8; PEEK_LIMIT];
    let _ = stream.read(&mut head).await?;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

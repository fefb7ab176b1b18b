use docsync_core::{ProtocolError, ReplicaError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by the relay and its client.
///
/// Only [`RelayError::Bind`] is fatal to the process; everything else is
/// scoped to one message or one connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Not connected to {0}")]
    NotConnected(String),
}

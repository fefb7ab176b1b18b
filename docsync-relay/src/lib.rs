//! # docsync-relay — Real-time document sync relay
//!
//! Relays replica deltas and presence between clients editing the same
//! named document, and keeps an authoritative in-memory replica per
//! document so late joiners can catch up.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer       │
//! │ (per user)  │  SYNC / AWARENESS   │ (one per process)│
//! └──────┬──────┘                     └────────┬─────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌─────────────┐                     ┌──────────────────┐
//! │ YrsReplica  │                     │ DocumentRegistry │
//! │ (local)     │                     │ name → session   │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │
//!                                     ┌────────┴────────┐
//!                                     │ DocumentSession │
//!                                     │ replica,        │
//!                                     │ awareness,      │
//!                                     │ BroadcastGroup  │
//!                                     └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`broadcast`] — per-session fan-out that never echoes to the origin
//! - [`session`] — one document's replica, presence and peer set
//! - [`registry`] — name → session map with eviction-safe attach
//! - [`connection`] — per-connection state machine and socket loop
//! - [`reaper`] — periodic sweep of idle sessions
//! - [`server`] — listener, HTTP probe, routing and stats
//! - [`client`] — sync client with a local replica and presence
//! - [`config`] — environment-driven server settings

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, Subscription};
pub use client::{CollaborationUser, SyncClient, SyncEvent, USER_COLORS};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionState};
pub use error::RelayError;
pub use registry::DocumentRegistry;
pub use server::{document_name, ServerStats, SyncServer};
pub use session::{Attachment, DocumentSession};

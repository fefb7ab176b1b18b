//! Relay configuration.
//!
//! Only the listen port is required in practice; everything else has a
//! default that suits a single-node deployment.

use std::time::Duration;

use crate::error::RelayError;

/// Port used when `WS_PORT` is not set.
pub const DEFAULT_PORT: u16 = 1234;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between idle-session sweeps
    pub reap_interval: Duration,
    /// Frames buffered per peer before it is considered too slow
    pub outbound_capacity: usize,
    /// Largest accepted inbound message, in bytes
    pub max_message_size: usize,
    /// Body returned to plain HTTP probes
    pub probe_response: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            reap_interval: Duration::from_secs(60),
            outbound_capacity: 256,
            max_message_size: 16 << 20,
            probe_response: "docsync relay is running".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build from process environment.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `WS_PORT` | listen port on all interfaces |
    /// | `DOCSYNC_BIND` | full bind address, wins over `WS_PORT` |
    /// | `DOCSYNC_REAP_INTERVAL_SECS` | idle sweep interval |
    /// | `DOCSYNC_OUTBOUND_CAPACITY` | per-peer broadcast buffer |
    /// | `DOCSYNC_MAX_MESSAGE_SIZE` | inbound message cap in bytes |
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("WS_PORT") {
            let port: u16 = parse("WS_PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = lookup("DOCSYNC_BIND") {
            config.bind_addr = addr;
        }
        if let Some(secs) = lookup("DOCSYNC_REAP_INTERVAL_SECS") {
            let secs: u64 = parse("DOCSYNC_REAP_INTERVAL_SECS", &secs)?;
            if secs == 0 {
                return Err(RelayError::Config("DOCSYNC_REAP_INTERVAL_SECS must be positive".into()));
            }
            config.reap_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = lookup("DOCSYNC_OUTBOUND_CAPACITY") {
            config.outbound_capacity = parse("DOCSYNC_OUTBOUND_CAPACITY", &capacity)?;
            if config.outbound_capacity == 0 {
                return Err(RelayError::Config("DOCSYNC_OUTBOUND_CAPACITY must be positive".into()));
            }
        }
        if let Some(size) = lookup("DOCSYNC_MAX_MESSAGE_SIZE") {
            config.max_message_size = parse("DOCSYNC_MAX_MESSAGE_SIZE", &size)?;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, RelayError> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("{key}: cannot parse '{value}'")))
}

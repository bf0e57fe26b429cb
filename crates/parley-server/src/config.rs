//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::str::FromStr;

use parley_shared::constants::{DEFAULT_HTTP_PORT, OFFLINE_BUFFER_CAP, RELAY_HISTORY_CAP};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Messages kept per conversation.
    /// Env: `HISTORY_LIMIT`
    /// Default: `100`
    pub history_limit: usize,

    /// Messages buffered per offline recipient; the oldest are dropped.
    /// Env: `OFFLINE_BUFFER_LIMIT`
    /// Default: `500`
    pub offline_buffer_limit: usize,

    /// Age after which buffered messages are discarded (0 = never).
    /// Env: `OFFLINE_BUFFER_TTL_SECS`
    /// Default: 7 days
    pub offline_buffer_ttl_secs: u64,

    /// Sustained requests per second per IP / per socket.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `20`
    pub rate_limit_per_sec: f64,

    /// Burst allowance per IP / per socket.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `60`
    pub rate_limit_burst: f64,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley Relay"`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            history_limit: RELAY_HISTORY_CAP,
            offline_buffer_limit: OFFLINE_BUFFER_CAP,
            offline_buffer_ttl_secs: 7 * 24 * 3600,
            rate_limit_per_sec: 20.0,
            rate_limit_burst: 60.0,
            instance_name: "Parley Relay".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);
        parse_into(&lookup, "HISTORY_LIMIT", &mut config.history_limit);
        parse_into(&lookup, "OFFLINE_BUFFER_LIMIT", &mut config.offline_buffer_limit);
        parse_into(&lookup, "OFFLINE_BUFFER_TTL_SECS", &mut config.offline_buffer_ttl_secs);
        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        if let Some(name) = lookup("INSTANCE_NAME") {
            if !name.trim().is_empty() {
                config.instance_name = name;
            }
        }

        if config.history_limit == 0 {
            tracing::warn!("HISTORY_LIMIT must be positive, using default");
            config.history_limit = RELAY_HISTORY_CAP;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    let Some(raw) = lookup(name) else { return };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(variable = name, value = %raw, "Invalid value, using default"),
    }
}

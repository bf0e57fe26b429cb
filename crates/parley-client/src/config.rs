use std::time::Duration;

use parley_shared::constants::{DEFAULT_HTTP_PORT, LOCAL_HISTORY_CAP, TYPING_EXPIRY_SECS};

/// Client tunables. Start from [`ClientConfig::default`] and override
/// fields with the `with_*` helpers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the relay.
    pub relay_url: String,
    /// Messages kept per conversation.
    pub retention_cap: usize,
    /// Quiet period after which a typing indicator expires.
    pub typing_expiry: Duration,
    /// How long a direct session may take to come up.
    pub connect_timeout: Duration,
    /// How long to wait for a relay reply.
    pub request_timeout: Duration,
    /// Poll window of the shared signal table.
    pub signal_window: Duration,
    /// Buffer of each event subscription.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: format!("ws://127.0.0.1:{DEFAULT_HTTP_PORT}/ws"),
            retention_cap: LOCAL_HISTORY_CAP,
            typing_expiry: Duration::from_secs(TYPING_EXPIRY_SECS),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            signal_window: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_retention_cap(mut self, cap: usize) -> Self {
        self.retention_cap = cap;
        self
    }

    pub fn with_typing_expiry(mut self, expiry: Duration) -> Self {
        self.typing_expiry = expiry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_signal_window(mut self, window: Duration) -> Self {
        self.signal_window = window;
        self
    }

    /// Settings for the direct connection manager.
    pub fn connection(&self) -> parley_net::ConnectionConfig {
        parley_net::ConnectionConfig {
            connect_timeout: self.connect_timeout,
            event_capacity: self.event_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.retention_cap, 1_000);
        assert_eq!(config.typing_expiry, Duration::from_secs(5));
        assert!(config.relay_url.ends_with("/ws"));
    }

    #[test]
    fn builders_override() {
        let config = ClientConfig::default()
            .with_relay_url("ws://relay.example/ws")
            .with_request_timeout(Duration::from_millis(200));
        assert_eq!(config.relay_url, "ws://relay.example/ws");
        assert_eq!(config.connection().connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_millis(200));
    }
}

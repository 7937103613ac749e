//! Connection configuration supplied by the embedding application.
//!
//! Loading these values (from files, environment, flags) is the caller's
//! concern; the SDK only consumes the assembled struct when constructing a
//! transport.

use std::time::Duration;

use crate::backoff::{self, Strategy};

/// Which wire protocol a client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Stateless HTTPS request/response.
    #[default]
    Https,
    /// Persistent WebSocket session.
    Ws,
    /// MQTT publish/subscribe broker session.
    Mqtt,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Selected wire protocol.
    pub transport: TransportKind,
    /// Platform endpoint host, optionally with a port (`host[:port]`).
    pub host: String,
    /// Minimum reconnect delay.
    pub retry_min: Duration,
    /// Maximum reconnect delay.
    pub retry_max: Duration,
    /// Retry count after which the backoff resets (0 = unlimited).
    pub retry_max_count: u32,
    /// Reconnect delay strategy.
    pub retry_strategy: Strategy,
    /// Idle window after which the WebSocket transport sends a keepalive ping.
    pub keepalive: Duration,
    /// MQTT keep-alive interval in seconds.
    pub mqtt_keep_alive_secs: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            host: String::new(),
            retry_min: backoff::DEFAULT_MIN,
            retry_max: backoff::DEFAULT_MAX,
            retry_max_count: 0,
            retry_strategy: Strategy::default(),
            keepalive: Duration::from_secs(30 * 60),
            mqtt_keep_alive_secs: 60,
        }
    }
}

impl Config {
    /// Creates a configuration for `host` with defaults for everything else.
    pub fn for_host(transport: TransportKind, host: &str) -> Self {
        Self {
            transport,
            host: host.to_string(),
            ..Self::default()
        }
    }

    /// Builds the reconnect calculator described by this configuration.
    pub(crate) fn backoff(&self) -> crate::backoff::Backoff {
        crate::backoff::Backoff::new()
            .min(self.retry_min)
            .max(self.retry_max)
            .max_retry_cnt(self.retry_max_count)
            .strategy(self.retry_strategy)
    }
}

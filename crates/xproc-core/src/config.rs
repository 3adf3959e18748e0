//! Centralized configuration for xproc.
//!
//! Constants live on marker structs grouped by concern. The runtime option
//! structs take their defaults from those constants and can be deserialized
//! from a config file by the hosting application.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport-level limits.
pub struct TransportConfig;

impl TransportConfig {
    /// Largest frame either side will read or write (binder-style 1 MiB cap).
    pub const MAX_FRAME_SIZE: usize = 1_048_576;
    pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const MAX_HOST_CONNECTIONS: usize = 64;
    pub const MEMORY_CHANNEL_CAPACITY: usize = 256;
}

/// Call and dispatch defaults.
pub struct CallConfig;

impl CallConfig {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_DISPATCH_WORKERS: usize = 4;
}

/// Caller-side options for a connection and the proxies built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// How long a proxy call waits for its response.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
    /// How long binding (transport bind plus handshake) may take.
    #[serde(with = "millis")]
    pub bind_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            call_timeout: CallConfig::DEFAULT_CALL_TIMEOUT,
            bind_timeout: CallConfig::DEFAULT_BIND_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout = timeout;
        self
    }
}

/// Callee-side options for a stub dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherOptions {
    /// Number of requests one channel may have executing at once.
    /// `1` processes requests strictly in receipt order.
    pub workers: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workers: CallConfig::DEFAULT_DISPATCH_WORKERS,
        }
    }
}

impl DispatcherOptions {
    pub fn serial() -> Self {
        Self { workers: 1 }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Socket and retry settings shared by every network channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Per read/write call; zero disables the timeout.
    pub io_timeout_ms: u64,
    /// Total connection attempts before giving up.
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            io_timeout_ms: 60_000,
            retries: 3,
            retry_backoff_ms: 250,
            retry_backoff_max_ms: 5_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries,
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_millis(self.retry_backoff_max_ms),
        )
    }
}

/// Certificate validation settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Disable only for private networks with self-signed endpoints.
    pub verify: bool,
    /// PEM bundle replacing the built-in trust roots.
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM files replacing the built-in trust roots.
    pub ca_path: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_file: None,
            ca_path: None,
        }
    }
}

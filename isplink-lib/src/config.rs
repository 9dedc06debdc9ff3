use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{DEFAULT_FIRMWARE_CHUNK, DEFAULT_READ_CHUNK, DEFAULT_WRITE_CHUNK};
use crate::error::{IspError, Result};

/// Serialize durations as integer milliseconds.
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

/// Event wait budgets, one per class of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Opportunistic check for an unsolicited notification.
    #[serde(with = "millis")]
    pub peek: Duration,
    /// Ordinary parameter set/query.
    #[serde(with = "millis")]
    pub short: Duration,
    /// Liveview-prepare, flash-write, script and batch requests.
    #[serde(with = "millis")]
    pub medium: Duration,
    /// Boot and firmware requests.
    #[serde(with = "millis")]
    pub long: Duration,
    /// Final "update complete" event while the peer programs its flash.
    #[serde(with = "millis")]
    pub update_complete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            peek: Duration::from_millis(10),
            short: Duration::from_millis(200),
            medium: Duration::from_secs(2),
            long: Duration::from_secs(30),
            update_complete: Duration::from_secs(240),
        }
    }
}

/// Bounds of the pre-send busy wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Hard cap on line samples before giving up.
    pub max_attempts: u32,
    /// Attempts that use `short_interval` before switching to `long_interval`.
    pub short_attempts: u32,
    #[serde(with = "millis")]
    pub short_interval: Duration,
    #[serde(with = "millis")]
    pub long_interval: Duration,
    /// Attempt count at which a pending unread frame is drained.
    pub drain_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            short_attempts: 10,
            short_interval: Duration::from_millis(1),
            long_interval: Duration::from_millis(5),
            drain_after: 50,
        }
    }
}

/// Bus transaction sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub write_chunk: usize,
    pub read_chunk: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            write_chunk: DEFAULT_WRITE_CHUNK,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

/// Everything tunable about one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub transport: TransportConfig,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    /// Treat a response checksum mismatch as a failed exchange.
    pub strict_checksum: bool,
    /// Chunk size used by firmware transfers.
    pub firmware_chunk: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            strict_checksum: false,
            firmware_chunk: DEFAULT_FIRMWARE_CHUNK,
        }
    }
}

impl LinkConfig {
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_strict_checksum(mut self, strict: bool) -> Self {
        self.strict_checksum = strict;
        self
    }

    pub fn with_firmware_chunk(mut self, chunk: usize) -> Self {
        self.firmware_chunk = chunk;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.write_chunk == 0 || self.transport.read_chunk == 0 {
            return Err(IspError::Config("transport chunk sizes must be non-zero".to_string()));
        }
        if self.firmware_chunk == 0 {
            return Err(IspError::Config("firmware_chunk must be non-zero".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IspError::Config("retry.max_attempts must be non-zero".to_string()));
        }
        if self.retry.short_attempts > self.retry.max_attempts {
            return Err(IspError::Config(format!(
                "retry.short_attempts ({}) exceeds retry.max_attempts ({})",
                self.retry.short_attempts, self.retry.max_attempts
            )));
        }
        Ok(())
    }
}

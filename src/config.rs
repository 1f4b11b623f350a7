use std::time::Duration;

use crate::error::{Error, Result};

/// Write survivability requested from the store, traded against latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Not logged; lost if the serving process fails.
    None,
    /// Logged, log buffered in memory.
    Log,
    /// Log flushed to the OS; survives a single server failure.
    #[default]
    Flush,
    /// Log synced to disk.
    Sync,
}

/// Configuration for a mutation batcher and the write channel behind it
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum age of the oldest pending mutation before a flush (default: 1s)
    pub max_latency: Duration,

    /// Pending bytes that trigger a flush (default: 10KB)
    pub max_memory_bytes: usize,

    /// Threads the store may use to deliver one flush (default: 10)
    pub max_write_threads: usize,

    /// Pending mutation count that triggers a flush (default: 1000)
    pub max_batch_size: usize,

    pub durability: Durability,

    /// Upper bound on a single flush; always finite (default: 30s)
    pub timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_latency: Duration::from_secs(1),
            max_memory_bytes: 10 * 1024,
            max_write_threads: 10,
            max_batch_size: 1000,
            durability: Durability::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl WriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_latency(mut self, latency: Duration) -> Self {
        self.max_latency = latency;
        self
    }

    pub fn max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn max_write_threads(mut self, threads: usize) -> Self {
        self.max_write_threads = threads;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_latency.is_zero() {
            return Err(Error::InvalidConfig("max_latency must be > 0".to_string()));
        }
        if self.max_memory_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_memory_bytes must be > 0".to_string(),
            ));
        }
        if self.max_write_threads == 0 {
            return Err(Error::InvalidConfig(
                "max_write_threads must be > 0".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig("max_batch_size must be > 0".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Configuration for scans and batch scans
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Ranges scanned concurrently by a batch scan (default: 10)
    pub parallelism: usize,

    /// Longest wait for the next cell (default: 30s)
    pub timeout: Duration,

    /// Cells buffered between producers and the consumer (default: 256)
    pub channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            timeout: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

impl ScanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::InvalidConfig("parallelism must be > 0".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("timeout must be > 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "channel_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for resubmitting transiently failed batches.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Resubmissions allowed after the first attempt (default: 5)
    pub max_retries: usize,

    /// Wait before the first resubmission (default: 100ms)
    pub initial_backoff: Duration,

    /// Cap on any single wait (default: 30s)
    pub max_backoff: Duration,

    /// Growth factor between waits (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Wait before resubmission number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }
}

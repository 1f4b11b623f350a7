//! Bucketed row keys for time-ordered data.
//!
//! Rows whose keys grow monotonically (timestamps) all land at the tail of
//! the key space. Prefixing each row with one of `N` bucket ids spreads them
//! over `N` sub-ranges:
//!
//! ```text
//! 00003 ‖ enc(2024-01-01T00:00:00Z)
//! 00017 ‖ enc(2024-01-01T00:00:01Z)
//! ```
//!
//! The bucket is chosen at random, independent of the key, so a read of a
//! logical range has to cover every bucket.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::batch::MutationBatcher;
use crate::config::ScanConfig;
use crate::data::{Mutation, Range};
use crate::encoding::{EncodingError, Lexicode};
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// Decimal digits in a bucket id.
pub const BUCKET_WIDTH: usize = 5;

/// Largest bucket count a 5-digit id can address.
pub const MAX_BUCKETS: u32 = 100_000;

pub struct BucketStrategy {
    buckets: u32,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl BucketStrategy {
    pub fn new(buckets: u32) -> Result<Self> {
        Self::with_rng(buckets, Box::new(StdRng::from_entropy()))
    }

    /// Uses `rng` to pick buckets; seeded sources make placement repeatable.
    pub fn with_rng(buckets: u32, rng: Box<dyn RngCore + Send>) -> Result<Self> {
        if buckets == 0 || buckets > MAX_BUCKETS {
            return Err(Error::InvalidConfig(format!(
                "bucket count must be in 1..={}, got {}",
                MAX_BUCKETS, buckets
            )));
        }
        Ok(Self {
            buckets,
            rng: Mutex::new(rng),
        })
    }

    pub fn buckets(&self) -> u32 {
        self.buckets
    }

    /// Stored row for `logical` in a randomly chosen bucket.
    pub fn assign_bucket(&self, logical: &[u8]) -> Result<Vec<u8>> {
        let bucket = self.rng.lock()?.gen_range(0..self.buckets);
        Ok(bucket_row(bucket, logical))
    }

    /// One range per bucket covering `[start, stop)` in logical keys.
    pub fn expand_for_scan(&self, start: &[u8], stop: &[u8]) -> Vec<Range> {
        (0..self.buckets)
            .map(|bucket| Range::half_open(bucket_row(bucket, start), bucket_row(bucket, stop)))
            .collect()
    }
}

impl std::fmt::Debug for BucketStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStrategy")
            .field("buckets", &self.buckets)
            .finish()
    }
}

/// `bucket` as zero-padded decimal, followed by `logical`.
pub fn bucket_row(bucket: u32, logical: &[u8]) -> Vec<u8> {
    let mut row = format!("{:0width$}", bucket, width = BUCKET_WIDTH).into_bytes();
    row.extend_from_slice(logical);
    row
}

/// The bucket id of a stored row.
pub fn bucket_of(bucketed: &[u8]) -> Result<u32> {
    let prefix = bucketed.get(..BUCKET_WIDTH).ok_or(EncodingError::TruncatedData)?;
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(EncodingError::InvalidFormat(format!("bucket prefix {:?}", prefix)).into());
    }
    Ok(prefix
        .iter()
        .fold(0u32, |acc, digit| acc * 10 + u32::from(digit - b'0')))
}

/// The logical key of a stored row.
pub fn recover_logical_key(bucketed: &[u8]) -> Result<Vec<u8>> {
    bucket_of(bucketed)?;
    Ok(bucketed[BUCKET_WIDTH..].to_vec())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeValue {
    pub time: DateTime<Utc>,
    pub value: Vec<u8>,
}

/// Writes `value` at `time` into a random bucket.
pub fn write_time_value(
    batcher: &MutationBatcher,
    strategy: &BucketStrategy,
    time: &DateTime<Utc>,
    value: impl Into<Vec<u8>>,
) -> Result<()> {
    let row = strategy.assign_bucket(&time.encode())?;
    batcher.add(Mutation::new(row).put("", "", value))
}

/// Every value in `[start, stop)` across all buckets, in time order.
pub async fn read_time_range(
    store: &dyn KeyValueStore,
    table: &str,
    strategy: &BucketStrategy,
    start: &DateTime<Utc>,
    stop: &DateTime<Utc>,
    config: &ScanConfig,
) -> Result<Vec<TimeValue>> {
    let ranges = strategy.expand_for_scan(&start.encode(), &stop.encode());
    let mut cells = store.batch_scan(table, ranges, config).await?;

    let mut values = Vec::new();
    let mut skipped = 0usize;
    while let Some(cell) = cells.next().await {
        let cell = cell?;
        let time = match recover_logical_key(cell.row()).and_then(|key| DateTime::<Utc>::decode(&key)) {
            Ok(time) => time,
            Err(Error::Format(e)) => {
                skipped += 1;
                warn!(table, row = ?cell.row(), error = %e, "Skipping malformed time row");
                continue;
            }
            Err(e) => return Err(e),
        };
        values.push(TimeValue {
            time,
            value: cell.value,
        });
    }
    values.sort_by(|a, b| a.time.cmp(&b.time));
    debug!(table, values = values.len(), skipped, "Merged bucketed time range");
    Ok(values)
}

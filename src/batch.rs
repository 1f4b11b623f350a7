//! Client-side mutation batching.
//!
//! Producers append mutations with [`MutationBatcher::add`], which never
//! blocks on I/O. Pending mutations are written to the store when a count,
//! byte or age threshold is crossed (implicit flush, driven by a background
//! task) or when the caller asks with [`MutationBatcher::flush`]. Each flush
//! takes the whole pending batch as an immutable snapshot, so producers keep
//! appending to a fresh batch while the snapshot is in flight.
//!
//! The batcher never retries. A rejected flush hands the batch back in
//! [`FlushResult::Rejected`] and the write channel is discarded, so any
//! resubmission goes out on a fresh one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::config::WriterConfig;
use crate::data::Mutation;
use crate::error::{Error, Result, TransientWriteError};
use crate::retry::FailureReport;
use crate::scheduler::{BackgroundTask, Context, Scheduler};
use crate::store::{KeyValueStore, TableWriter};

/// Shortest interval between latency checks.
const MIN_LATENCY_CHECK: Duration = Duration::from_millis(1);

/// Mutations waiting for the next flush.
#[derive(Debug, Default)]
pub struct PendingBatch {
    mutations: Vec<Mutation>,
    size_bytes: usize,
    oldest: Option<Instant>,
}

impl PendingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.size_bytes += mutation.estimated_size();
        self.oldest.get_or_insert_with(Instant::now);
        self.mutations.push(mutation);
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Time since the oldest pending mutation was appended.
    pub fn age(&self) -> Option<Duration> {
        self.oldest.map(|oldest| oldest.elapsed())
    }

    /// Count or byte threshold reached.
    pub fn is_full(&self, config: &WriterConfig) -> bool {
        self.mutations.len() >= config.max_batch_size || self.size_bytes >= config.max_memory_bytes
    }

    pub fn should_flush(&self, config: &WriterConfig) -> bool {
        if self.is_empty() {
            return false;
        }
        self.is_full(config) || self.age().is_some_and(|age| age >= config.max_latency)
    }

    /// Takes every pending mutation, leaving the batch empty.
    pub fn drain(&mut self) -> Vec<Mutation> {
        self.size_bytes = 0;
        self.oldest = None;
        std::mem::take(&mut self.mutations)
    }

    /// Puts `batch` back in front of anything appended since it was drained.
    fn restore(&mut self, mut batch: Vec<Mutation>) {
        self.size_bytes += batch.iter().map(Mutation::estimated_size).sum::<usize>();
        self.oldest = Some(self.oldest.unwrap_or_else(Instant::now));
        batch.append(&mut self.mutations);
        self.mutations = batch;
    }
}

/// A batch the store refused, returned intact so the caller can decide what
/// to do with it.
#[derive(Debug, Clone)]
pub struct FailedFlush {
    pub report: FailureReport,
    pub mutations: Vec<Mutation>,
    /// Mutations from the same flush call that were applied.
    pub applied: usize,
}

#[derive(Debug, Clone)]
pub enum FlushResult {
    Applied(usize),
    Rejected(FailedFlush),
}

impl FlushResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, FlushResult::Applied(_))
    }

    pub fn applied(&self) -> usize {
        match self {
            FlushResult::Applied(count) => *count,
            FlushResult::Rejected(failed) => failed.applied,
        }
    }
}

type WriteOutcome = std::result::Result<usize, FailedFlush>;

struct BatcherCore {
    table: String,
    config: WriterConfig,
    store: Arc<dyn KeyValueStore>,
    pending: Mutex<PendingBatch>,
    /// Held across the store flush; serializes flushes.
    channel: tokio::sync::Mutex<Option<Box<dyn TableWriter>>>,
    /// Rejections from implicit flushes not yet reported to a caller.
    failures: Mutex<Vec<FailedFlush>>,
    flush_signal: Arc<Notify>,
    applied: AtomicU64,
}

impl BatcherCore {
    async fn write_locked(
        &self,
        channel: &mut Option<Box<dyn TableWriter>>,
        batch: Vec<Mutation>,
    ) -> Result<WriteOutcome> {
        if batch.is_empty() {
            return Ok(Ok(0));
        }

        if channel.is_none() {
            match self.store.open_writer(&self.table, &self.config).await {
                Ok(writer) => *channel = Some(writer),
                Err(e) => {
                    self.pending.lock()?.restore(batch);
                    return Err(e);
                }
            }
        }
        let Some(writer) = channel.as_mut() else {
            return Err(Error::InvalidState("write channel missing".to_string()));
        };

        let count = batch.len();
        let start = Instant::now();
        match self.deliver(writer, &batch).await {
            Ok(()) => {
                self.applied.fetch_add(count as u64, Ordering::Relaxed);
                debug!(
                    table = %self.table,
                    mutations = count,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Flushed batch"
                );
                Ok(Ok(count))
            }
            Err(report) => {
                warn!(
                    table = %self.table,
                    mutations = count,
                    report = ?report,
                    "Flush rejected, discarding write channel"
                );
                if let Some(stale) = channel.take() {
                    tokio::spawn(discard(stale, self.config.timeout));
                }
                Ok(Err(FailedFlush {
                    report,
                    mutations: batch,
                    applied: 0,
                }))
            }
        }
    }

    async fn deliver(
        &self,
        writer: &mut Box<dyn TableWriter>,
        batch: &[Mutation],
    ) -> std::result::Result<(), FailureReport> {
        for mutation in batch {
            writer.add(mutation.clone())?;
        }
        match tokio::time::timeout(self.config.timeout, writer.flush()).await {
            Ok(result) => result,
            Err(_) => Err(FailureReport::timed_out(self.config.timeout)),
        }
    }

    async fn flush_in_background(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;
        let batch = self.pending.lock()?.drain();
        if let Err(failed) = self.write_locked(&mut channel, batch).await? {
            self.failures.lock()?.push(failed);
        }
        Ok(())
    }
}

async fn discard(writer: Box<dyn TableWriter>, timeout: Duration) {
    match tokio::time::timeout(timeout, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(report)) => debug!(report = ?report, "Discarded channel reported failures on close"),
        Err(_) => debug!("Timed out closing discarded channel"),
    }
}

/// Flushes when a threshold is signalled by `add`, or when the oldest
/// pending mutation exceeds the configured latency.
struct FlushTask {
    core: Arc<BatcherCore>,
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "batch-flush"
    }

    fn interval(&self) -> Duration {
        (self.core.config.max_latency / 4).max(MIN_LATENCY_CHECK)
    }

    fn trigger(&self) -> Option<Arc<Notify>> {
        Some(self.core.flush_signal.clone())
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if !self.core.pending.lock()?.should_flush(&self.core.config) {
            return Ok(());
        }
        self.core.flush_in_background().await
    }
}

/// Buffers mutations for one table and writes them in batches.
pub struct MutationBatcher {
    core: Arc<BatcherCore>,
    scheduler: Mutex<Option<Scheduler>>,
    closed: AtomicBool,
}

impl MutationBatcher {
    /// Creates a batcher for `table`. Must be called within a Tokio runtime.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        table: impl Into<String>,
        config: WriterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(BatcherCore {
            table: table.into(),
            config,
            store,
            pending: Mutex::new(PendingBatch::new()),
            channel: tokio::sync::Mutex::new(None),
            failures: Mutex::new(Vec::new()),
            flush_signal: Arc::new(Notify::new()),
            applied: AtomicU64::new(0),
        });

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(FlushTask { core: core.clone() }))?;

        Ok(Self {
            core,
            scheduler: Mutex::new(Some(scheduler)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn table(&self) -> &str {
        &self.core.table
    }

    pub fn config(&self) -> &WriterConfig {
        &self.core.config
    }

    /// Appends a mutation to the pending batch.
    pub fn add(&self, mutation: Mutation) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!(
                "batcher for {} is closed",
                self.core.table
            )));
        }
        if mutation.is_empty() {
            return Err(Error::InvalidMutation(format!(
                "mutation for row {:?} has no updates",
                String::from_utf8_lossy(mutation.row())
            )));
        }

        let uncollected = !self.core.failures.lock()?.is_empty();
        let mut pending = self.core.pending.lock()?;
        let size = mutation.estimated_size();
        if uncollected && pending.size_bytes() + size >= self.core.config.max_memory_bytes {
            return Err(TransientWriteError::ResourceExhausted {
                pending_bytes: pending.size_bytes() + size,
            }
            .into());
        }

        pending.push(mutation);
        trace!(
            table = %self.core.table,
            pending = pending.len(),
            bytes = pending.size_bytes(),
            "Appended mutation"
        );
        let full = pending.is_full(&self.core.config);
        drop(pending);

        if full {
            self.core.flush_signal.notify_one();
        }
        Ok(())
    }

    pub fn add_all<I>(&self, mutations: I) -> Result<()>
    where
        I: IntoIterator<Item = Mutation>,
    {
        for mutation in mutations {
            self.add(mutation)?;
        }
        Ok(())
    }

    /// Writes the pending batch and reports it together with any rejections
    /// from earlier implicit flushes.
    pub async fn flush(&self) -> Result<FlushResult> {
        let mut channel = self.core.channel.lock().await;
        let batch = self.core.pending.lock()?.drain();
        let outcome = self.core.write_locked(&mut channel, batch).await?;
        let earlier = std::mem::take(&mut *self.core.failures.lock()?);
        drop(channel);

        Ok(fold(outcome, earlier))
    }

    /// Writes `batch` as is on the current channel, opening a fresh one if
    /// the last flush was rejected. Pending mutations are left alone.
    pub async fn resubmit(&self, batch: Vec<Mutation>) -> Result<FlushResult> {
        let mut channel = self.core.channel.lock().await;
        let outcome = self.core.write_locked(&mut channel, batch).await?;
        Ok(fold(outcome, Vec::new()))
    }

    /// True when an implicit flush was rejected and nobody has collected it.
    pub fn has_failures(&self) -> Result<bool> {
        Ok(!self.core.failures.lock()?.is_empty())
    }

    /// Mutations durably applied by this batcher so far.
    pub fn applied_total(&self) -> u64 {
        self.core.applied.load(Ordering::Relaxed)
    }

    pub fn pending_len(&self) -> Result<usize> {
        Ok(self.core.pending.lock()?.len())
    }

    pub fn pending_bytes(&self) -> Result<usize> {
        Ok(self.core.pending.lock()?.size_bytes())
    }

    /// Stops the background flusher, flushes what is pending and closes the
    /// channel. Further `add` calls fail.
    pub async fn close(&self) -> Result<FlushResult> {
        self.closed.store(true, Ordering::Release);
        let scheduler = self.scheduler.lock()?.take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await?;
        }

        let result = self.flush().await?;
        let writer = self.core.channel.lock().await.take();
        let Some(writer) = writer else {
            return Ok(result);
        };
        match writer.close().await {
            Ok(()) => Ok(result),
            Err(report) => Ok(match result {
                FlushResult::Applied(applied) => FlushResult::Rejected(FailedFlush {
                    report,
                    mutations: Vec::new(),
                    applied,
                }),
                FlushResult::Rejected(mut failed) => {
                    failed.report.merge(report);
                    FlushResult::Rejected(failed)
                }
            }),
        }
    }
}

impl Drop for MutationBatcher {
    fn drop(&mut self) {
        if let Ok(pending) = self.core.pending.lock() {
            if !pending.is_empty() {
                warn!(
                    table = %self.core.table,
                    pending = pending.len(),
                    "Batcher dropped with unflushed mutations"
                );
            }
        }
    }
}

impl std::fmt::Debug for MutationBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationBatcher")
            .field("table", &self.core.table)
            .field("config", &self.core.config)
            .field("applied", &self.applied_total())
            .finish()
    }
}

fn fold(outcome: WriteOutcome, mut failures: Vec<FailedFlush>) -> FlushResult {
    let applied = match outcome {
        Ok(count) => count,
        Err(failed) => {
            failures.push(failed);
            0
        }
    };
    if failures.is_empty() {
        return FlushResult::Applied(applied);
    }

    let mut merged = FailedFlush {
        report: FailureReport::new(),
        mutations: Vec::new(),
        applied,
    };
    for failed in failures {
        merged.report.merge(failed.report);
        merged.mutations.extend(failed.mutations);
    }
    FlushResult::Rejected(merged)
}

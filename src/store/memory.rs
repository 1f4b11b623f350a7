//! In-process store engine backed by concurrent skip lists.
//!
//! Each table is a `SkipMap<CellKey, StoredValue>`, so cells come back in
//! store order without extra sorting. Writers apply a flushed batch on up to
//! `max_write_threads` blocking tasks, sharding by row so that updates to one
//! row keep their order.
//!
//! The engine also records what it was asked to do in a [`StoreProbe`] and
//! can be told to fail or stall flushes, which makes it usable as a test
//! double for the layers above.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{CellStream, KeyValueStore, TableWriter};
use crate::config::{ScanConfig, WriterConfig};
use crate::data::{Cell, CellKey, ColumnUpdate, Mutation, Range};
use crate::error::{Error, Result};
use crate::retry::FailureReport;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    timestamp: Option<u64>,
}

type Table = SkipMap<CellKey, StoredValue>;

/// Counters describing the requests a [`MemoryStore`] has served.
#[derive(Debug, Default)]
pub struct StoreProbe {
    writers_opened: AtomicUsize,
    flushes: AtomicUsize,
    scans: AtomicUsize,
    batch_scans: AtomicUsize,
    open_scans: AtomicUsize,
    mutations_applied: AtomicU64,
}

impl StoreProbe {
    pub fn writers_opened(&self) -> usize {
        self.writers_opened.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn batch_scans(&self) -> usize {
        self.batch_scans.load(Ordering::SeqCst)
    }

    /// Scan producers still running.
    pub fn open_scans(&self) -> usize {
        self.open_scans.load(Ordering::SeqCst)
    }

    pub fn mutations_applied(&self) -> u64 {
        self.mutations_applied.load(Ordering::SeqCst)
    }
}

/// Counts one running scan producer for as long as it lives.
struct ScanHandle {
    probe: Arc<StoreProbe>,
}

impl ScanHandle {
    fn open(probe: &Arc<StoreProbe>) -> Self {
        probe.open_scans.fetch_add(1, Ordering::SeqCst);
        Self {
            probe: probe.clone(),
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.probe.open_scans.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted outcomes for upcoming flushes.
#[derive(Debug, Default)]
struct FaultPlan {
    /// `None` lets a flush through, `Some` fails it with that report.
    queue: Mutex<VecDeque<Option<FailureReport>>>,
    flush_delay: Mutex<Duration>,
}

impl FaultPlan {
    fn next_fault(&self) -> Option<FailureReport> {
        self.queue.lock().ok()?.pop_front().flatten()
    }

    fn flush_delay(&self) -> Duration {
        self.flush_delay
            .lock()
            .map(|delay| *delay)
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    faults: Arc<FaultPlan>,
    probe: Arc<StoreProbe>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> &StoreProbe {
        &self.probe
    }

    /// Fails the next flush that is not already scripted.
    pub fn inject_failure(&self, report: FailureReport) {
        if let Ok(mut queue) = self.faults.queue.lock() {
            queue.push_back(Some(report));
        }
    }

    /// Lets `successes` flushes through, then fails one with `report`.
    pub fn skip_then_fail(&self, successes: usize, report: FailureReport) {
        if let Ok(mut queue) = self.faults.queue.lock() {
            queue.extend(std::iter::repeat(None).take(successes));
            queue.push_back(Some(report));
        }
    }

    /// Stalls every flush by `delay`. Zero disables the stall.
    pub fn set_flush_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.faults.flush_delay.lock() {
            *current = delay;
        }
    }

    /// Number of live cells in `table`.
    pub fn cell_count(&self, table: &str) -> Result<usize> {
        Ok(self.table(table)?.len())
    }

    fn table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn create_table_if_absent(&self, table: &str) -> Result<bool> {
        let mut tables = self.tables.write()?;
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(table.to_string(), Arc::new(SkipMap::new()));
        debug!(table, "Created table");
        Ok(true)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.read()?.contains_key(table))
    }

    async fn open_writer(
        &self,
        table: &str,
        config: &WriterConfig,
    ) -> Result<Box<dyn TableWriter>> {
        config.validate()?;
        let data = self.table(table)?;
        self.probe.writers_opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            table,
            durability = ?config.durability,
            threads = config.max_write_threads,
            "Opened writer"
        );
        Ok(Box::new(MemoryWriter {
            table: data,
            pending: Vec::new(),
            threads: config.max_write_threads,
            faults: self.faults.clone(),
            probe: self.probe.clone(),
        }))
    }

    async fn scan(&self, table: &str, range: Range, config: &ScanConfig) -> Result<CellStream> {
        config.validate()?;
        let data = self.table(table)?;
        self.probe.scans.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let handle = ScanHandle::open(&self.probe);
        tokio::spawn(async move {
            let _handle = handle;
            send_range(TableCursor::new(data, range), &tx).await;
        });
        Ok(CellStream::new(rx, config.timeout))
    }

    async fn batch_scan(
        &self,
        table: &str,
        ranges: Vec<Range>,
        config: &ScanConfig,
    ) -> Result<CellStream> {
        config.validate()?;
        let data = self.table(table)?;
        self.probe.batch_scans.fetch_add(1, Ordering::SeqCst);

        let workers = config.parallelism.min(ranges.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(ranges)));
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        trace!(table, workers, "Starting batch scan");

        for worker in 0..workers {
            let handle = ScanHandle::open(&self.probe);
            let queue = queue.clone();
            let data = data.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _handle = handle;
                loop {
                    let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                    let Some(range) = next else {
                        break;
                    };
                    if !send_range(TableCursor::new(data.clone(), range), &tx).await {
                        trace!(worker, "Consumer went away, stopping");
                        break;
                    }
                }
            });
        }
        Ok(CellStream::new(rx, config.timeout))
    }
}

/// Sends every cell of `cursor`. Returns false once the receiver is gone.
async fn send_range(cursor: TableCursor, tx: &mpsc::Sender<Result<Cell>>) -> bool {
    for cell in cursor {
        if tx.send(Ok(cell)).await.is_err() {
            return false;
        }
    }
    true
}

/// Walks one range of a table, re-seeking after the last returned key so no
/// skip-list borrow outlives a single step.
struct TableCursor {
    table: Arc<Table>,
    range: Range,
    next: Bound<CellKey>,
    exhausted: bool,
}

impl TableCursor {
    fn new(table: Arc<Table>, range: Range) -> Self {
        let next = range.seek_key();
        Self {
            table,
            range,
            next,
            exhausted: false,
        }
    }
}

impl Iterator for TableCursor {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        while !self.exhausted {
            let entry = self
                .table
                .range((self.next.clone(), Bound::Unbounded))
                .next()
                .map(|entry| (entry.key().clone(), entry.value().clone()));

            let Some((key, stored)) = entry else {
                self.exhausted = true;
                break;
            };
            self.next = Bound::Excluded(key.clone());

            if self.range.is_beyond(&key.row) {
                self.exhausted = true;
                break;
            }
            if self.range.contains(&key) {
                return Some(Cell {
                    key,
                    value: stored.value,
                    timestamp: stored.timestamp,
                });
            }
        }
        None
    }
}

struct MemoryWriter {
    table: Arc<Table>,
    pending: Vec<Mutation>,
    threads: usize,
    faults: Arc<FaultPlan>,
    probe: Arc<StoreProbe>,
}

impl MemoryWriter {
    async fn apply(&self, batch: Vec<Mutation>) -> std::result::Result<(), FailureReport> {
        let count = batch.len();
        let shards = self.threads.clamp(1, count.max(1));
        let mut groups: Vec<Vec<Mutation>> = vec![Vec::new(); shards];
        for mutation in batch {
            groups[shard_of(mutation.row(), shards)].push(mutation);
        }

        let handles: Vec<_> = groups
            .into_iter()
            .filter(|group| !group.is_empty())
            .map(|group| {
                let table = self.table.clone();
                tokio::task::spawn_blocking(move || {
                    for mutation in &group {
                        apply_mutation(&table, mutation);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.map_err(|_| FailureReport::new().unknown(1))?;
        }
        self.probe
            .mutations_applied
            .fetch_add(count as u64, Ordering::SeqCst);
        Ok(())
    }
}

fn shard_of(row: &[u8], shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    row.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

fn apply_mutation(table: &Table, mutation: &Mutation) {
    for update in mutation.updates() {
        match update {
            ColumnUpdate::Put {
                column,
                value,
                timestamp,
            } => {
                table.insert(
                    CellKey::new(mutation.row(), column.clone()),
                    StoredValue {
                        value: value.clone(),
                        timestamp: *timestamp,
                    },
                );
            }
            ColumnUpdate::Delete { column, .. } => {
                table.remove(&CellKey::new(mutation.row(), column.clone()));
            }
        }
    }
}

#[async_trait::async_trait]
impl TableWriter for MemoryWriter {
    fn add(&mut self, mutation: Mutation) -> std::result::Result<(), FailureReport> {
        self.pending.push(mutation);
        Ok(())
    }

    async fn flush(&mut self) -> std::result::Result<(), FailureReport> {
        let batch = std::mem::take(&mut self.pending);
        self.probe.flushes.fetch_add(1, Ordering::SeqCst);

        let delay = self.faults.flush_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(report) = self.faults.next_fault() {
            return Err(report);
        }
        self.apply(batch).await
    }

    async fn close(mut self: Box<Self>) -> std::result::Result<(), FailureReport> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Column, ColumnFilter};

    async fn store_with(rows: &[(&str, &str, &str, &str)]) -> Result<MemoryStore> {
        let store = MemoryStore::new();
        store.create_table_if_absent("t").await?;
        let mut writer = store.open_writer("t", &WriterConfig::default()).await?;
        for (row, family, qualifier, value) in rows {
            writer
                .add(Mutation::new(*row).put(*family, *qualifier, *value))
                .map_err(|_| Error::InvalidState("add failed".to_string()))?;
        }
        writer
            .flush()
            .await
            .map_err(|_| Error::InvalidState("flush failed".to_string()))?;
        Ok(store)
    }

    fn rows(cells: &[Cell]) -> Vec<String> {
        cells
            .iter()
            .map(|cell| {
                format!(
                    "{}/{}/{}",
                    String::from_utf8_lossy(cell.row()),
                    String::from_utf8_lossy(cell.family()),
                    String::from_utf8_lossy(cell.qualifier())
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_table_is_idempotent() -> Result<()> {
        let store = MemoryStore::new();
        assert!(!store.table_exists("t").await?);
        assert!(store.create_table_if_absent("t").await?);
        assert!(!store.create_table_if_absent("t").await?);
        assert!(store.table_exists("t").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_returns_cells_in_key_order() -> Result<()> {
        let store = store_with(&[
            ("b", "f", "2", "x"),
            ("a", "f", "1", "x"),
            ("b", "f", "1", "x"),
            ("c", "f", "1", "x"),
        ])
        .await?;

        let cells = store
            .scan("t", Range::new("a", "b"), &ScanConfig::default())
            .await?
            .try_collect()
            .await?;
        assert_eq!(rows(&cells), vec!["a/f/1", "b/f/1", "b/f/2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_with_column_filters() -> Result<()> {
        let store = store_with(&[
            ("r", "Coal", "1990", "1"),
            ("r", "Coal", "1991", "2"),
            ("r", "Oil", "1990", "3"),
        ])
        .await?;
        let config = ScanConfig::default();

        let family = store
            .scan(
                "t",
                Range::exact("r").fetch(ColumnFilter::Family(b"Coal".to_vec())),
                &config,
            )
            .await?
            .try_collect()
            .await?;
        assert_eq!(rows(&family), vec!["r/Coal/1990", "r/Coal/1991"]);

        let exact = store
            .scan("t", Range::exact_cell("r", Column::new("Oil", "1990")), &config)
            .await?
            .try_collect()
            .await?;
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].value, b"3");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_then_delete_in_one_batch() -> Result<()> {
        let store = store_with(&[("r", "f", "q", "old")]).await?;
        let mut writer = store
            .open_writer("t", &WriterConfig::default().max_write_threads(4))
            .await?;
        writer
            .add(Mutation::new("r").put("f", "q2", "new"))
            .map_err(|_| Error::InvalidState("add failed".to_string()))?;
        writer
            .add(Mutation::new("r").put_delete("f", "q"))
            .map_err(|_| Error::InvalidState("add failed".to_string()))?;
        writer
            .close()
            .await
            .map_err(|_| Error::InvalidState("close failed".to_string()))?;

        let cells = store
            .scan("t", Range::all(), &ScanConfig::default())
            .await?
            .try_collect()
            .await?;
        assert_eq!(rows(&cells), vec!["r/f/q2"]);
        assert_eq!(store.probe().mutations_applied(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batch_scan_covers_all_ranges() -> Result<()> {
        let store = store_with(&[
            ("a", "f", "q", "1"),
            ("b", "f", "q", "2"),
            ("c", "f", "q", "3"),
            ("d", "f", "q", "4"),
        ])
        .await?;

        let ranges = vec![Range::exact("a"), Range::exact("c"), Range::new("d", "z")];
        let mut cells = store
            .batch_scan("t", ranges, &ScanConfig::default().parallelism(2))
            .await?
            .try_collect()
            .await?;
        cells.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(rows(&cells), vec!["a/f/q", "c/f/q", "d/f/q"]);
        assert_eq!(store.probe().batch_scans(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_stream_releases_handles() -> Result<()> {
        let store = MemoryStore::new();
        store.create_table_if_absent("t").await?;
        let mut writer = store.open_writer("t", &WriterConfig::default()).await?;
        for i in 0..2000 {
            writer
                .add(Mutation::new(format!("{:05}", i)).put("f", "q", "v"))
                .map_err(|_| Error::InvalidState("add failed".to_string()))?;
        }
        writer
            .flush()
            .await
            .map_err(|_| Error::InvalidState("flush failed".to_string()))?;

        let ranges = (0..20)
            .map(|i| Range::prefix(format!("{:03}", i).as_bytes()))
            .collect();
        let config = ScanConfig::default().parallelism(4).channel_capacity(2);
        let mut stream = store.batch_scan("t", ranges, &config).await?;
        assert!(stream.next().await.is_some());
        assert!(store.probe().open_scans() > 0);
        drop(stream);

        for _ in 0..200 {
            if store.probe().open_scans() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.probe().open_scans(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() -> Result<()> {
        let store = MemoryStore::new();
        store.create_table_if_absent("t").await?;
        store.skip_then_fail(1, FailureReport::new().unknown(2));

        let mut writer = store.open_writer("t", &WriterConfig::default()).await?;
        writer.add(Mutation::new("a").put("f", "q", "v")).ok();
        assert!(writer.flush().await.is_ok());
        writer.add(Mutation::new("b").put("f", "q", "v")).ok();
        let report = writer.flush().await.unwrap_err();
        assert_eq!(report.unknown_failures, 2);
        writer.add(Mutation::new("c").put("f", "q", "v")).ok();
        assert!(writer.flush().await.is_ok());

        assert_eq!(store.cell_count("t")?, 2);
        assert_eq!(store.probe().flushes(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_table() -> Result<()> {
        let store = MemoryStore::new();
        assert!(matches!(
            store.scan("nope", Range::all(), &ScanConfig::default()).await,
            Err(Error::TableNotFound(_))
        ));
        assert!(matches!(
            store.open_writer("nope", &WriterConfig::default()).await,
            Err(Error::TableNotFound(_))
        ));
        Ok(())
    }
}

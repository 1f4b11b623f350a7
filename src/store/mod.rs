//! The sorted key-value store this crate orchestrates.
//!
//! Stores are reached through [`KeyValueStore`]: tables of cells kept in
//! `(row, family, qualifier)` order, written through batching
//! [`TableWriter`] channels and read through [`CellStream`]s.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{ScanConfig, WriterConfig};
use crate::data::{Cell, Mutation, Range};
use crate::error::{Error, Result, TransientWriteError};
use crate::retry::FailureReport;

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Creates `table` unless it exists. Returns whether it was created.
    async fn create_table_if_absent(&self, table: &str) -> Result<bool>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Opens a write channel to `table`.
    async fn open_writer(
        &self,
        table: &str,
        config: &WriterConfig,
    ) -> Result<Box<dyn TableWriter>>;

    /// Streams the cells of one range in key order.
    async fn scan(&self, table: &str, range: Range, config: &ScanConfig) -> Result<CellStream>;

    /// Streams the cells of many ranges, read in parallel. Cells of different
    /// ranges arrive in no particular order.
    async fn batch_scan(
        &self,
        table: &str,
        ranges: Vec<Range>,
        config: &ScanConfig,
    ) -> Result<CellStream>;
}

/// A write channel. Mutations are buffered by `add` and sent by `flush`.
#[async_trait::async_trait]
pub trait TableWriter: Send {
    fn add(&mut self, mutation: Mutation) -> std::result::Result<(), FailureReport>;

    async fn flush(&mut self) -> std::result::Result<(), FailureReport>;

    /// Flushes anything still buffered and releases the channel.
    async fn close(self: Box<Self>) -> std::result::Result<(), FailureReport>;
}

type CellFilter = Arc<dyn Fn(&Cell) -> bool + Send + Sync>;

/// Lazy, finite stream of scanned cells.
///
/// Once exhausted it stays exhausted. Dropping the stream, or reaching its
/// limit, closes the channel and stops the producers behind it.
pub struct CellStream {
    rx: Option<mpsc::Receiver<Result<Cell>>>,
    remaining: Option<usize>,
    timeout: Duration,
    filter: Option<CellFilter>,
}

impl CellStream {
    pub fn new(rx: mpsc::Receiver<Result<Cell>>, timeout: Duration) -> Self {
        Self {
            rx: Some(rx),
            remaining: None,
            timeout,
            filter: None,
        }
    }

    /// A stream that yields nothing.
    pub fn empty() -> Self {
        Self {
            rx: None,
            remaining: None,
            timeout: Duration::ZERO,
            filter: None,
        }
    }

    /// Stops after `limit` cells.
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            self.remaining = Some(self.remaining.map_or(limit, |r| r.min(limit)));
        }
        self
    }

    /// Yields only cells matching `predicate`. Skipped cells do not count
    /// towards the limit.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Cell) -> bool + Send + Sync + 'static,
    {
        let combined: CellFilter = match self.filter.take() {
            Some(existing) => Arc::new(move |cell: &Cell| existing(cell) && predicate(cell)),
            None => Arc::new(predicate),
        };
        self.filter = Some(combined);
        self
    }

    /// Next cell, or `None` when the stream is done. Waiting longer than the
    /// scan timeout for a cell yields a timeout error and ends the stream.
    pub async fn next(&mut self) -> Option<Result<Cell>> {
        loop {
            if self.remaining == Some(0) {
                self.close();
                return None;
            }
            let rx = self.rx.as_mut()?;

            let received = tokio::time::timeout(self.timeout, rx.recv()).await;
            let item = match received {
                Ok(Some(item)) => item,
                Ok(None) => {
                    self.close();
                    return None;
                }
                Err(_) => {
                    self.close();
                    return Some(Err(Error::Transient(TransientWriteError::Timeout(
                        self.timeout,
                    ))));
                }
            };

            let cell = match item {
                Ok(cell) => cell,
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
            };
            if let Some(filter) = &self.filter {
                if !filter(&cell) {
                    continue;
                }
            }
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            return Some(Ok(cell));
        }
    }

    /// Drains the stream into a vector, stopping at the first error.
    pub async fn try_collect(mut self) -> Result<Vec<Cell>> {
        let mut cells = Vec::new();
        while let Some(cell) = self.next().await {
            cells.push(cell?);
        }
        Ok(cells)
    }

    /// Releases the channel; producers stop on their next send.
    pub fn close(&mut self) {
        self.rx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }
}

impl std::fmt::Debug for CellStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStream")
            .field("closed", &self.is_closed())
            .field("remaining", &self.remaining)
            .field("timeout", &self.timeout)
            .finish()
    }
}

use std::fmt::Debug;
use std::sync::Arc;

use tracing::error;

use crate::batch::{FlushResult, MutationBatcher};
use crate::config::WriterConfig;
use crate::data::Mutation;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// A write group spanning several tables, flushed together.
///
/// Each target table has its own batcher. Flushing the group flushes every
/// target; the targets are not written atomically with respect to each other.
pub struct MultiWriter {
    writers: Vec<(String, Arc<MutationBatcher>)>,
}

impl Debug for MultiWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiWriter")
            .field(
                "tables",
                &self.writers.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MultiWriter {
    /// Opens one batcher per table, all sharing `config`.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        tables: &[&str],
        config: WriterConfig,
    ) -> Result<Self> {
        let mut writers = Vec::with_capacity(tables.len());
        for table in tables {
            let batcher = MutationBatcher::open(store.clone(), *table, config.clone())?;
            writers.push((table.to_string(), Arc::new(batcher)));
        }
        Ok(Self { writers })
    }

    /// Returns the batcher for `table`.
    pub fn get(&self, table: &str) -> Option<&Arc<MutationBatcher>> {
        self.writers
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, batcher)| batcher)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.writers.iter().map(|(name, _)| name.as_str())
    }

    /// Appends `mutation` to the batcher for `table`.
    pub fn add(&self, table: &str, mutation: Mutation) -> Result<()> {
        self.get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?
            .add(mutation)
    }

    /// Flushes every target, in order, and reports each outcome. A target
    /// that errors does not stop the others; the first error is returned once
    /// all of them have been flushed.
    pub async fn flush(&self) -> Result<Vec<(String, FlushResult)>> {
        let mut outcomes = Vec::with_capacity(self.writers.len());
        for (i, (table, batcher)) in self.writers.iter().enumerate() {
            let outcome = batcher.flush().await;
            if let Err(e) = &outcome {
                error!(writer = i, table = %table, error = %e, "Writer failed to flush");
            }
            outcomes.push((table.clone(), outcome));
        }
        collect_outcomes(outcomes)
    }

    /// Closes every target, flushing what is pending. Like [`flush`], every
    /// target is closed before the first error is returned.
    ///
    /// [`flush`]: MultiWriter::flush
    pub async fn close(&self) -> Result<Vec<(String, FlushResult)>> {
        let mut outcomes = Vec::with_capacity(self.writers.len());
        for (i, (table, batcher)) in self.writers.iter().enumerate() {
            let outcome = batcher.close().await;
            if let Err(e) = &outcome {
                error!(writer = i, table = %table, error = %e, "Writer failed to close");
            }
            outcomes.push((table.clone(), outcome));
        }
        collect_outcomes(outcomes)
    }
}

fn collect_outcomes(
    outcomes: Vec<(String, Result<FlushResult>)>,
) -> Result<Vec<(String, FlushResult)>> {
    outcomes
        .into_iter()
        .map(|(table, outcome)| outcome.map(|result| (table, result)))
        .collect()
}

//! Range joins: find primary cells by a range of indexed values.
//!
//! A query reads the index rows in `[encode(start), encode(stop)]`, turns
//! every index cell into an exact-cell range over the primary table, and
//! reads all of those ranges with one parallel batch scan.

use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::data::{Cell, Range};
use crate::encoding::Lexicode;
use crate::error::{Error, Result};
use crate::index::{IndexEntryCodec, QualifierCodec, Transform};
use crate::store::{CellStream, KeyValueStore};

type Translation = Arc<dyn for<'a> Transform<&'a Cell, Result<Range>>>;
type Confirmation = Arc<dyn for<'a> Transform<&'a Cell, bool>>;

pub struct RangeJoin {
    store: Arc<dyn KeyValueStore>,
    index_table: String,
    primary_table: String,
    config: ScanConfig,
    translate: Translation,
    confirm: Option<Confirmation>,
}

impl RangeJoin {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        index_table: impl Into<String>,
        primary_table: impl Into<String>,
        config: ScanConfig,
    ) -> Self {
        Self {
            store,
            index_table: index_table.into(),
            primary_table: primary_table.into(),
            config,
            translate: translation_for(Arc::new(QualifierCodec)),
            confirm: None,
        }
    }

    /// Reads index cells with `codec` instead of the default layout.
    pub fn with_codec(mut self, codec: Arc<dyn IndexEntryCodec>) -> Self {
        self.translate = translation_for(codec);
        self
    }

    /// Replaces the index-cell to primary-range mapping outright.
    pub fn with_translation<T>(mut self, translate: T) -> Self
    where
        T: for<'a> Transform<&'a Cell, Result<Range>> + 'static,
    {
        self.translate = Arc::new(translate);
        self
    }

    /// Drops primary cells for which `confirm` returns false, such as cells
    /// whose current value has left the queried range since they were
    /// indexed.
    pub fn with_confirm<T>(mut self, confirm: T) -> Self
    where
        T: for<'a> Transform<&'a Cell, bool> + 'static,
    {
        self.confirm = Some(Arc::new(confirm));
        self
    }

    /// Primary ranges referenced by index rows in `[start, stop]`, without
    /// duplicates, in the order first seen.
    pub async fn primary_ranges<V>(&self, start: &V, stop: &V) -> Result<Vec<Range>>
    where
        V: Lexicode + ?Sized,
    {
        let bounds = Range::new(start.encode(), stop.encode());
        let mut entries = self
            .store
            .scan(&self.index_table, bounds, &self.config)
            .await?;

        let mut ranges = Vec::new();
        let mut skipped = 0usize;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            match self.translate.apply(&entry) {
                Ok(range) => ranges.push(range),
                Err(Error::Format(e)) => {
                    skipped += 1;
                    warn!(
                        table = %self.index_table,
                        row = ?entry.row(),
                        error = %e,
                        "Skipping malformed index entry"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let found = ranges.len();
        let ranges: Vec<Range> = ranges.into_iter().unique().collect();
        debug!(
            table = %self.index_table,
            entries = found,
            ranges = ranges.len(),
            skipped,
            "Translated index entries"
        );
        Ok(ranges)
    }

    /// Primary cells whose indexed value lies in `[start, stop]`, at most
    /// `limit` of them. Order is unspecified.
    pub async fn range_query<V>(&self, start: &V, stop: &V, limit: Option<usize>) -> Result<CellStream>
    where
        V: Lexicode + ?Sized,
    {
        self.config.validate()?;
        if limit == Some(0) {
            return Ok(CellStream::empty());
        }

        let ranges = self.primary_ranges(start, stop).await?;
        if ranges.is_empty() {
            debug!(table = %self.index_table, "No index entries in range");
            return Ok(CellStream::empty());
        }

        let mut stream = self
            .store
            .batch_scan(&self.primary_table, ranges, &self.config)
            .await?
            .limit(limit);
        if let Some(confirm) = &self.confirm {
            let confirm = confirm.clone();
            stream = stream.filter(move |cell: &Cell| confirm.apply(cell));
        }
        Ok(stream)
    }
}

fn translation_for(codec: Arc<dyn IndexEntryCodec>) -> Translation {
    Arc::new(move |entry: &Cell| codec.primary_range(entry))
}

impl std::fmt::Debug for RangeJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeJoin")
            .field("index_table", &self.index_table)
            .field("primary_table", &self.primary_table)
            .field("config", &self.config)
            .field("confirm", &self.confirm.is_some())
            .finish()
    }
}

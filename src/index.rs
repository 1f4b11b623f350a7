//! Secondary index maintenance.
//!
//! An index table maps a derived value back to the primary cells it was
//! derived from. The index row is the order-preserving encoding of the value,
//! so a row range over the index is a value range over the primary data:
//!
//! ```text
//! primary:  US      Coal:1990   = 100
//! index:    enc(100) Coal:[len("US")]US1990 = ""
//! ```
//!
//! Primary and index mutations travel through separate batchers of one
//! [`MultiWriter`]. They are flushed together but not atomically, so the
//! index may briefly point at cells that are missing or changed; readers
//! re-read the primary cell and drop anything that no longer matches.

use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::trace;

use crate::batch::FlushResult;
use crate::config::WriterConfig;
use crate::data::{Cell, Column, ColumnUpdate, Mutation, Range};
use crate::encoding::{EncodingError, Lexicode};
use crate::error::{Error, Result};
use crate::multi_writer::MultiWriter;
use crate::store::KeyValueStore;

/// A pure mapping from one value to another, supplied by the caller.
pub trait Transform<In, Out>: Send + Sync {
    fn apply(&self, input: In) -> Out;
}

impl<F, In, Out> Transform<In, Out> for F
where
    F: Fn(In) -> Out + Send + Sync,
{
    fn apply(&self, input: In) -> Out {
        self(input)
    }
}

/// Lays out the column of an index cell so that it points back at one
/// primary cell.
pub trait IndexEntryCodec: Send + Sync {
    /// Column of the index cell for primary cell `(row, column)`.
    fn entry_column(&self, row: &[u8], column: &Column) -> Result<Column>;

    /// The primary `(row, column)` an index cell points at.
    fn primary_cell(&self, entry: &Cell) -> Result<(Vec<u8>, Column)>;

    /// Exact range reading the primary cell behind `entry`.
    fn primary_range(&self, entry: &Cell) -> Result<Range> {
        let (row, column) = self.primary_cell(entry)?;
        Ok(Range::exact_cell(row, column))
    }
}

/// Keeps the primary family and packs `(row, qualifier)` into the index
/// qualifier as `u32 BE row length ‖ row ‖ qualifier`.
#[derive(Debug, Default, Clone, Copy)]
pub struct QualifierCodec;

impl IndexEntryCodec for QualifierCodec {
    fn entry_column(&self, row: &[u8], column: &Column) -> Result<Column> {
        let len = u32::try_from(row.len())
            .map_err(|_| EncodingError::OutOfRange(format!("row of {} bytes", row.len())))?;
        let mut qualifier = Vec::with_capacity(4 + row.len() + column.qualifier.len());
        qualifier.write_u32::<BigEndian>(len)?;
        qualifier.extend_from_slice(row);
        qualifier.extend_from_slice(&column.qualifier);
        Ok(Column::new(column.family.clone(), qualifier))
    }

    fn primary_cell(&self, entry: &Cell) -> Result<(Vec<u8>, Column)> {
        let mut rest = entry.qualifier();
        let len = rest
            .read_u32::<BigEndian>()
            .map_err(|_| EncodingError::TruncatedData)? as usize;
        if rest.len() < len {
            return Err(EncodingError::TruncatedData.into());
        }
        let (row, qualifier) = rest.split_at(len);
        Ok((row.to_vec(), Column::new(entry.family(), qualifier)))
    }
}

pub struct SecondaryIndex {
    writer: MultiWriter,
    primary_table: String,
    index_table: String,
    codec: Arc<dyn IndexEntryCodec>,
}

impl SecondaryIndex {
    /// Wraps a write group that already has batchers for both tables.
    pub fn new(
        writer: MultiWriter,
        primary_table: impl Into<String>,
        index_table: impl Into<String>,
    ) -> Result<Self> {
        let primary_table = primary_table.into();
        let index_table = index_table.into();
        for table in [&primary_table, &index_table] {
            if writer.get(table).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "write group has no batcher for {}",
                    table
                )));
            }
        }
        Ok(Self {
            writer,
            primary_table,
            index_table,
            codec: Arc::new(QualifierCodec),
        })
    }

    /// Creates both tables if needed and opens a write group over them.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        primary_table: &str,
        index_table: &str,
        config: WriterConfig,
    ) -> Result<Self> {
        store.create_table_if_absent(primary_table).await?;
        store.create_table_if_absent(index_table).await?;
        let writer = MultiWriter::open(store, &[primary_table, index_table], config)?;
        Self::new(writer, primary_table, index_table)
    }

    pub fn with_codec(mut self, codec: Arc<dyn IndexEntryCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn codec(&self) -> Arc<dyn IndexEntryCodec> {
        self.codec.clone()
    }

    pub fn primary_table(&self) -> &str {
        &self.primary_table
    }

    pub fn index_table(&self) -> &str {
        &self.index_table
    }

    /// The index mutation for `primary` under `derived`: one cell per put.
    /// `None` when `primary` has no puts.
    pub fn index_entry<V>(&self, primary: &Mutation, derived: &V) -> Result<Option<Mutation>>
    where
        V: Lexicode + ?Sized,
    {
        let mut entry = Mutation::new(derived.encode());
        for update in primary.updates() {
            if let ColumnUpdate::Put { column, .. } = update {
                let pointer = self.codec.entry_column(primary.row(), column)?;
                entry = entry.put(pointer.family, pointer.qualifier, Vec::new());
            }
        }
        Ok((!entry.is_empty()).then_some(entry))
    }

    /// Writes `primary` and an index entry keyed by `derived`.
    pub fn index_and_write<V>(&self, primary: Mutation, derived: &V) -> Result<()>
    where
        V: Lexicode + ?Sized,
    {
        let entry = self.index_entry(&primary, derived)?;
        self.writer.add(&self.primary_table, primary)?;
        if let Some(entry) = entry {
            trace!(index = %self.index_table, cells = entry.updates().len(), "Queued index entry");
            self.writer.add(&self.index_table, entry)?;
        }
        Ok(())
    }

    /// Writes `primary`, indexing it under whatever `derive` extracts from
    /// it. Returns whether an index entry was written.
    pub fn index_with<V, T>(&self, primary: Mutation, derive: &T) -> Result<bool>
    where
        V: Lexicode,
        T: for<'a> Transform<&'a Mutation, Option<V>>,
    {
        match derive.apply(&primary) {
            Some(derived) => {
                self.index_and_write(primary, &derived)?;
                Ok(true)
            }
            None => {
                self.writer.add(&self.primary_table, primary)?;
                Ok(false)
            }
        }
    }

    /// Deletes a primary cell and the index cell that pointed at it under
    /// `old_value`.
    pub fn remove<V>(&self, row: &[u8], column: Column, old_value: &V) -> Result<()>
    where
        V: Lexicode + ?Sized,
    {
        let pointer = self.codec.entry_column(row, &column)?;
        self.writer.add(
            &self.primary_table,
            Mutation::new(row).put_delete(column.family, column.qualifier),
        )?;
        self.writer.add(
            &self.index_table,
            Mutation::new(old_value.encode()).put_delete(pointer.family, pointer.qualifier),
        )
    }

    /// Flushes primary then index under one call.
    pub async fn flush(&self) -> Result<Vec<(String, FlushResult)>> {
        self.writer.flush().await
    }

    pub async fn close(&self) -> Result<Vec<(String, FlushResult)>> {
        self.writer.close().await
    }
}

impl std::fmt::Debug for SecondaryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryIndex")
            .field("primary_table", &self.primary_table)
            .field("index_table", &self.index_table)
            .field("writer", &self.writer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::data::CellKey;
    use crate::encoding;
    use crate::store::memory::MemoryStore;
    use std::time::Duration;

    async fn setup() -> Result<(Arc<MemoryStore>, SecondaryIndex)> {
        let store = Arc::new(MemoryStore::new());
        let config = WriterConfig::new().max_latency(Duration::from_secs(60));
        let index = SecondaryIndex::open(store.clone(), "energy", "energy_idx", config).await?;
        Ok((store, index))
    }

    async fn all_cells(store: &MemoryStore, table: &str) -> Result<Vec<Cell>> {
        store
            .scan(table, Range::all(), &ScanConfig::default())
            .await?
            .try_collect()
            .await
    }

    #[test]
    fn test_qualifier_codec_points_back() -> Result<()> {
        let codec = QualifierCodec;
        let column = Column::new("Coal", "1991");
        let pointer = codec.entry_column(b"US", &column)?;
        assert_eq!(pointer.family, b"Coal");
        assert_eq!(pointer.qualifier, b"\x00\x00\x00\x02US1991");

        let entry = Cell {
            key: CellKey::new(encoding::encode(&200.0f64), pointer),
            value: Vec::new(),
            timestamp: None,
        };
        let (row, decoded) = codec.primary_cell(&entry)?;
        assert_eq!(row, b"US");
        assert_eq!(decoded, column);
        assert_eq!(codec.primary_range(&entry)?, Range::exact_cell("US", column));
        Ok(())
    }

    #[test]
    fn test_qualifier_codec_rejects_truncated_entries() {
        let codec = QualifierCodec;
        for qualifier in [&b""[..], b"\x00\x00", b"\x00\x00\x00\x09US"] {
            let entry = Cell {
                key: CellKey::new("x", Column::new("f", qualifier)),
                value: Vec::new(),
                timestamp: None,
            };
            assert!(matches!(codec.primary_cell(&entry), Err(Error::Format(_))));
        }
    }

    #[tokio::test]
    async fn test_index_and_write() -> Result<()> {
        let (store, index) = setup().await?;

        index.index_and_write(Mutation::new("US").put("Coal", "1990", "100"), &100.0f64)?;
        let results = index.flush().await?;
        assert!(results.iter().all(|(_, result)| result.is_applied()));

        let primary = all_cells(&store, "energy").await?;
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].value, b"100");

        let entries = all_cells(&store, "energy_idx").await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(encoding::decode::<f64>(entries[0].row())?, 100.0);
        assert!(entries[0].value.is_empty());
        assert_eq!(
            QualifierCodec.primary_cell(&entries[0])?,
            (b"US".to_vec(), Column::new("Coal", "1990"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_one_index_cell_per_put() -> Result<()> {
        let (_store, index) = setup().await?;
        let primary = Mutation::new("US")
            .put("Coal", "1990", "100")
            .put("Oil", "1990", "100")
            .put_delete("Gas", "1990");

        let entry = index.index_entry(&primary, &100i64)?.unwrap();
        assert_eq!(entry.row(), encoding::encode(&100i64).as_slice());
        assert_eq!(entry.updates().len(), 2);
        assert!(entry.updates().iter().all(|update| !update.is_delete()));

        let deletes_only = Mutation::new("US").put_delete("Coal", "1990");
        assert!(index.index_entry(&deletes_only, &100i64)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_index_with_derived_value() -> Result<()> {
        let (store, index) = setup().await?;
        let quantity = |mutation: &Mutation| -> Option<f64> {
            mutation.updates().iter().find_map(|update| match update {
                ColumnUpdate::Put { value, .. } => std::str::from_utf8(value).ok()?.parse().ok(),
                ColumnUpdate::Delete { .. } => None,
            })
        };

        assert!(index.index_with(Mutation::new("US").put("Coal", "1990", "12.5"), &quantity)?);
        assert!(!index.index_with(Mutation::new("FR").put("Coal", "1990", "n/a"), &quantity)?);
        index.flush().await?;

        assert_eq!(store.cell_count("energy")?, 2);
        let entries = all_cells(&store, "energy_idx").await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(encoding::decode::<f64>(entries[0].row())?, 12.5);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_deletes_primary_and_entry() -> Result<()> {
        let (store, index) = setup().await?;
        index.index_and_write(Mutation::new("US").put("Coal", "1990", "100"), &100.0f64)?;
        index.index_and_write(Mutation::new("US").put("Coal", "1991", "200"), &200.0f64)?;
        index.flush().await?;

        index.remove(b"US", Column::new("Coal", "1990"), &100.0f64)?;
        index.flush().await?;

        let primary = all_cells(&store, "energy").await?;
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].qualifier(), b"1991");
        let entries = all_cells(&store, "energy_idx").await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(encoding::decode::<f64>(entries[0].row())?, 200.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_new_requires_both_targets() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let writer = MultiWriter::open(store, &["energy"], WriterConfig::default())?;
        assert!(matches!(
            SecondaryIndex::new(writer, "energy", "energy_idx"),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }
}

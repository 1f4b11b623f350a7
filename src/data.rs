//! Cells, mutations and row ranges.
//!
//! The store orders cells by `(row, family, qualifier)`, each component
//! compared byte-lexicographically. A [`Mutation`] always targets exactly one
//! row; the store applies it atomically to that row and to nothing else.

use std::ops::Bound;

/// Per-cell overhead used in memory accounting (timestamp and framing).
const CELL_OVERHEAD: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column {
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
}

impl Column {
    pub fn new(family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }
}

/// Full sort key of a stored cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
}

impl CellKey {
    pub fn new(row: impl Into<Vec<u8>>, column: Column) -> Self {
        Self {
            row: row.into(),
            family: column.family,
            qualifier: column.qualifier,
        }
    }

    /// Smallest key of `row`.
    pub fn row_start(row: &[u8]) -> Self {
        Self {
            row: row.to_vec(),
            family: Vec::new(),
            qualifier: Vec::new(),
        }
    }

    pub fn column(&self) -> Column {
        Column::new(self.family.clone(), self.qualifier.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub key: CellKey,
    pub value: Vec<u8>,
    pub timestamp: Option<u64>,
}

impl Cell {
    pub fn row(&self) -> &[u8] {
        &self.key.row
    }

    pub fn family(&self) -> &[u8] {
        &self.key.family
    }

    pub fn qualifier(&self) -> &[u8] {
        &self.key.qualifier
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnUpdate {
    Put {
        column: Column,
        value: Vec<u8>,
        timestamp: Option<u64>,
    },
    Delete {
        column: Column,
        timestamp: Option<u64>,
    },
}

impl ColumnUpdate {
    pub fn column(&self) -> &Column {
        match self {
            ColumnUpdate::Put { column, .. } | ColumnUpdate::Delete { column, .. } => column,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ColumnUpdate::Delete { .. })
    }
}

/// Ordered set of column updates against a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    row: Vec<u8>,
    updates: Vec<ColumnUpdate>,
}

impl Mutation {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    pub fn put(
        mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.updates.push(ColumnUpdate::Put {
            column: Column::new(family, qualifier),
            value: value.into(),
            timestamp: None,
        });
        self
    }

    pub fn put_at(mut self, column: Column, value: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        self.updates.push(ColumnUpdate::Put {
            column,
            value: value.into(),
            timestamp: Some(timestamp),
        });
        self
    }

    pub fn put_delete(mut self, family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.updates.push(ColumnUpdate::Delete {
            column: Column::new(family, qualifier),
            timestamp: None,
        });
        self
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn updates(&self) -> &[ColumnUpdate] {
        &self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Approximate in-memory footprint, used for batch memory limits.
    pub fn estimated_size(&self) -> usize {
        self.updates.iter().fold(self.row.len(), |acc, update| {
            let column = update.column();
            let value = match update {
                ColumnUpdate::Put { value, .. } => value.len(),
                ColumnUpdate::Delete { .. } => 0,
            };
            acc + column.family.len() + column.qualifier.len() + value + CELL_OVERHEAD
        })
    }
}

/// Restricts a scan to one column family or one exact column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ColumnFilter {
    #[default]
    All,
    Family(Vec<u8>),
    Column(Column),
}

impl ColumnFilter {
    pub fn matches(&self, key: &CellKey) -> bool {
        match self {
            ColumnFilter::All => true,
            ColumnFilter::Family(family) => key.family == *family,
            ColumnFilter::Column(column) => {
                key.family == column.family && key.qualifier == column.qualifier
            }
        }
    }
}

/// Interval over row keys, optionally narrowed to a set of columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub columns: ColumnFilter,
}

impl Range {
    /// Rows in `[start, stop]`.
    pub fn new(start: impl Into<Vec<u8>>, stop: impl Into<Vec<u8>>) -> Self {
        Self::from_bounds(Bound::Included(start.into()), Bound::Included(stop.into()))
    }

    /// Rows in `[start, stop)`.
    pub fn half_open(start: impl Into<Vec<u8>>, stop: impl Into<Vec<u8>>) -> Self {
        Self::from_bounds(Bound::Included(start.into()), Bound::Excluded(stop.into()))
    }

    pub fn from_bounds(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self {
            start,
            end,
            columns: ColumnFilter::All,
        }
    }

    pub fn all() -> Self {
        Self::from_bounds(Bound::Unbounded, Bound::Unbounded)
    }

    /// Every cell of a single row.
    pub fn exact(row: impl Into<Vec<u8>>) -> Self {
        let row = row.into();
        Self::from_bounds(Bound::Included(row.clone()), Bound::Included(row))
    }

    /// A single cell.
    pub fn exact_cell(row: impl Into<Vec<u8>>, column: Column) -> Self {
        Self::exact(row).fetch(ColumnFilter::Column(column))
    }

    /// All rows starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let start = Bound::Included(prefix.to_vec());
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => Bound::Excluded(
                prefix[..i]
                    .iter()
                    .chain(std::iter::once(&(prefix[i] + 1)))
                    .copied()
                    .collect::<Vec<u8>>(),
            ),
            None => Bound::Unbounded,
        };
        Self::from_bounds(start, end)
    }

    pub fn fetch(mut self, columns: ColumnFilter) -> Self {
        self.columns = columns;
        self
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(start) => row >= start.as_slice(),
            Bound::Excluded(start) => row > start.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && !self.is_beyond(row)
    }

    /// True once `row` sorts past the end bound; scans stop here.
    pub fn is_beyond(&self, row: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => row > end.as_slice(),
            Bound::Excluded(end) => row >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }

    pub fn contains(&self, key: &CellKey) -> bool {
        self.contains_row(&key.row) && self.columns.matches(key)
    }

    /// First cell key a scan of this range needs to look at.
    pub fn seek_key(&self) -> Bound<CellKey> {
        match &self.start {
            Bound::Included(row) | Bound::Excluded(row) => {
                Bound::Included(CellKey::row_start(row))
            }
            Bound::Unbounded => Bound::Unbounded,
        }
    }
}

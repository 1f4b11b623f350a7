pub mod batch;
pub mod bucket;
pub mod config;
pub mod data;
pub mod encoding;
pub mod error;
pub mod graph;
pub mod index;
pub mod multi_writer;
pub mod query;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use batch::{FailedFlush, FlushResult, MutationBatcher};
pub use bucket::BucketStrategy;
pub use config::{Durability, RetryPolicy, ScanConfig, WriterConfig};
pub use data::{Cell, CellKey, Column, ColumnFilter, ColumnUpdate, Mutation, Range};
pub use encoding::Lexicode;
pub use error::{Error, FatalWriteError, Result, TransientWriteError};
pub use index::{IndexEntryCodec, QualifierCodec, SecondaryIndex, Transform};
pub use multi_writer::MultiWriter;
pub use query::RangeJoin;
pub use retry::{Classification, Decision, FailureReport, Ingestor, RetryController};
pub use store::{CellStream, KeyValueStore, TableWriter};

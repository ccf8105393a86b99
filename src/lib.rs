//! Tablebase Core Storage Engine
//!
//! A self-describing columnar table store for scientific pipelines.
//! A table holds a fixed schema of typed columns and a growing/shrinking
//! set of rows; each column is handled by a pluggable storage manager
//! (SM) that chooses an on-disk layout optimized for its access pattern.
//! Tables are persistent, endian-tagged, and support concurrent readers
//! with lock-coordinated writers.

pub mod cache;
pub mod data;
pub mod io;
pub mod sm;
pub mod store;
pub mod table;

// Re-export main types
pub use data::{Complex32, Complex64, DataType, Endian, Shape, Slicer, Value};
pub use sm::{SmType, StorageManager};
pub use table::{
    ColumnDesc, ColumnKind, KeywordRecord, LockKind, LockMode, OpenMode, Table, TableDesc,
    TableInfo,
};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Storage manager not found: {0}")]
    ManagerNotFound(String),

    #[error("Keyword not found: {0}")]
    KeywordNotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Duplicate name: {0}")]
    Duplicate(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Row {row} out of range (row count {nrow})")]
    RowOutOfRange { row: u64, nrow: u64 },

    #[error("Lock not granted within the wait limit")]
    WouldBlock,

    #[error("Table is not writable: {0}")]
    ReadOnly(String),

    #[error("Corrupt table data: {0}")]
    Corrupt(String),

    #[error("Invalid operation {op}: Table object is empty")]
    NullTable { op: &'static str },

    #[error("Version mismatch: expected <= {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
}

pub type Result<T> = std::result::Result<T, TableError>;

pub(crate) fn check_row(row: u64, nrow: u64) -> Result<()> {
    if row >= nrow {
        Err(TableError::RowOutOfRange { row, nrow })
    } else {
        Ok(())
    }
}

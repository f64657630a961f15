//! Error types for the rowset engine.

use crate::{ColumnName, RowIndex, TableName};
use thiserror::Error;

/// All possible errors from the rowset engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("table already exists: {0}")]
    DuplicateTable(TableName),

    #[error("column not found: {table}.{column}")]
    ColumnNotFound { table: TableName, column: ColumnName },

    #[error("column already exists: {table}.{column}")]
    DuplicateColumn { table: TableName, column: ColumnName },

    #[error(
        "column type conflict on {table}.{column}: current is {current}, refreshed is {refreshed}"
    )]
    ColumnTypeConflict {
        table: TableName,
        column: ColumnName,
        current: String,
        refreshed: String,
    },

    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: ColumnName,
        expected: String,
        got: String,
    },

    #[error("null value in non-nullable column: {0}")]
    NullViolation(ColumnName),

    #[error("invalid relation '{name}': {reason}")]
    InvalidRelation { name: String, reason: String },

    // Identity errors
    #[error("table has no primary key: {0}")]
    NoPrimaryKey(TableName),

    #[error("row {row} of table {table} has no resolvable primary key")]
    MissingKey { table: TableName, row: RowIndex },

    #[error("duplicate primary key in table {table}: {key}")]
    DuplicateKey { table: TableName, key: String },

    #[error("client key column missing from table: {0}")]
    ClientKeyColumnMissing(TableName),

    #[error("row {row} of table {table} has no client key")]
    MissingClientKey { table: TableName, row: RowIndex },

    #[error("table {table} has {count} pending change(s)")]
    PendingChanges { table: TableName, count: usize },

    #[error("field not present in row: {0}")]
    FieldNotFound(ColumnName),

    // Misuse errors
    #[error("operation on deleted row")]
    RowDeleted,

    #[error("deleted rows must be committed through their table")]
    DeletedRowCommit,

    #[error("added rows must be reverted through their table")]
    AddedRowRevert,

    #[error("row is already attached to a table")]
    RowAttached,

    #[error("row is not attached to a table")]
    RowDetached,

    #[error("row index {index} out of range for table {table}")]
    RowIndexOutOfRange { table: TableName, index: RowIndex },

    #[error("operation requires a sparse row")]
    NotSparse,

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("integrity violation on relation '{relation}': {detail}")]
    IntegrityViolation { relation: String, detail: String },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

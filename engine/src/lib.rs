//! # Rowset Engine
//!
//! An in-memory, schema-aware tabular data engine for client applications
//! that work against a remote data service.
//!
//! The engine keeps local tables of rows, tracks every edit against a
//! baseline, hands pending changes to a persistence layer, and merges the
//! server's answer back in without losing local work or duplicating rows.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never talks to a network or a disk
//! - **Deterministic**: the same inputs always produce the same dataset
//! - **Atomic merges**: a merge that fails validation leaves the data untouched
//! - **Single-threaded**: a dataset is owned by one logical thread of control
//!
//! ## Core Concepts
//!
//! ### Rows and States
//!
//! A [`Row`] is either *full* (one field per table column) or *sparse*
//! (only some fields, used for partial refreshes). Each row has a
//! [`RowState`]: `Detached`, `Added`, `Modified`, `Unchanged` or `Deleted`.
//! The first edit of an unchanged row captures its original values, so the
//! edit can be reverted or sent to the server as a field-level change.
//!
//! ### Tables and Datasets
//!
//! A [`Table`] holds ordered rows and [`ColumnDef`]s. Columns flagged as
//! primary key define each row's identity. A [`Dataset`] is a set of named
//! tables plus [`Relation`]s between them.
//!
//! ### Merging
//!
//! [`merge_dataset`] reconciles a refreshed dataset with the current one
//! using a [`MergeMode`]:
//! - [`MergeMode::Replace`] - refreshed rows replace current ones
//! - [`MergeMode::RefreshIfNoChangesExist`] - refresh only clean tables
//! - [`MergeMode::RefreshPreservingLocalChanges`] - refresh, keep pending rows
//! - [`MergeMode::PostSave`] - finalize a save using the server's echo
//!
//! Rows are matched by primary key; rows the server has not seen yet can be
//! matched through the reserved [`CLIENT_KEY_COLUMN`].
//!
//! ## Quick Start
//!
//! ```rust
//! use rowset_engine::{
//!     merge_dataset, ColumnDef, Dataset, FieldType, MergeMode, MergeOptions, Row, RowState,
//!     Table,
//! };
//!
//! // 1. Define a table and load it
//! let people = Table::new("People")
//!     .with_column(ColumnDef::key("Id", FieldType::Int))
//!     .with_column(ColumnDef::new("Name", FieldType::String));
//! let mut ds = Dataset::new("crm").with_table(people);
//! let table = ds.table_mut("People").unwrap();
//! table.load_row(Row::sparse().with("Id", 1).with("Name", "Ann")).unwrap();
//!
//! // 2. Edit locally
//! table.set_value(0, "Name", "Anna").unwrap();
//! assert_eq!(table.rows()[0].state(), RowState::Modified);
//!
//! // 3. Hand the pending changes to a persistence layer
//! let changes = ds.get_changes();
//! assert_eq!(ds.changeset().len(), 1);
//!
//! // 4. Merge the server's echo back
//! let result = merge_dataset(&mut ds, &changes, MergeMode::PostSave, &MergeOptions::new())
//!     .unwrap();
//! assert_eq!(result.updated.len(), 1);
//! assert!(!ds.has_changes());
//! ```
//!
//! ## Observing Changes
//!
//! Wrap a dataset in an [`ObservableDataset`] to receive a [`Notification`]
//! after each successful mutation, for example to drive a UI.
//!
//! ## Persistence
//!
//! Use [`Dataset::export_snapshot`] and [`Dataset::import_snapshot`] with
//! [`DatasetSnapshot`]. Snapshots keep row states and original values, so
//! pending work survives a restart.

pub mod changeset;
pub mod dataset;
pub mod error;
pub mod identity;
pub mod merge;
pub mod notify;
pub mod observable;
pub mod row;
pub mod schema;
pub mod snapshot;
pub mod table;
pub mod value;

// Re-export main types at crate root
pub use changeset::{ChangeSet, DeleteChange, InsertChange, RowChange, TableChanges, UpdateChange};
pub use dataset::Dataset;
pub use error::Error;
pub use identity::{client_key_identity, fields_identity, primary_key_identity, KeyIndex};
pub use merge::{
    merge_dataset, merge_table, DefaultValueProvider, MergeMode, MergeOptions, MergeResult,
    MergedRow, PrunePredicate,
};
pub use notify::{CollectionChange, Notification, Observer};
pub use observable::{ObservableDataset, ObservableRow, ObservableTable, SubscriptionId};
pub use row::{Fields, Row, RowKind, RowState};
pub use schema::{ColumnDef, FieldType, Relation, CLIENT_KEY_COLUMN};
pub use snapshot::{DatasetSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use table::{RowQuery, Table};
pub use value::{values_equal, Value};

/// Type aliases for clarity
pub type TableName = String;
pub type ColumnName = String;
pub type RowIndex = usize;

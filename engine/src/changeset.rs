//! Field-level view of pending changes.
//!
//! A [`ChangeSet`] describes what a persistence adapter has to do to bring
//! the server in line with a dataset: which rows to insert, which fields to
//! update and which rows to delete. Keys of updates and deletes are taken
//! from the row's original values, so a row whose key was edited locally is
//! still addressed by the key the server knows.

use crate::{
    identity, ColumnName, Dataset, Fields, Row, RowIndex, RowState, Table, TableName, Value,
    CLIENT_KEY_COLUMN,
};
use serde::{Deserialize, Serialize};

/// An inserted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertChange {
    /// Table the row belongs to
    pub table: TableName,
    /// Position of the row in its table
    pub index: RowIndex,
    /// Primary key identity of the new row, if resolvable
    pub key: Option<String>,
    /// Client correlation key, if assigned
    pub client_key: Option<String>,
    /// All field values
    pub values: Fields,
}

/// A modified row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChange {
    pub table: TableName,
    pub index: RowIndex,
    /// Primary key identity as the server knows it
    pub key: Option<String>,
    /// Current field values
    pub values: Fields,
    /// Field values as last loaded or committed
    pub original: Fields,
    /// Columns whose value differs from the original
    pub changed: Vec<ColumnName>,
}

/// A deleted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteChange {
    pub table: TableName,
    pub index: RowIndex,
    pub key: Option<String>,
    /// Field values as last loaded or committed
    pub original: Fields,
}

/// One pending row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RowChange {
    Insert(InsertChange),
    Update(UpdateChange),
    Delete(DeleteChange),
}

impl RowChange {
    /// Describe a pending row, or `None` for rows without pending changes.
    pub fn from_row(table: &str, keys: &[ColumnName], index: RowIndex, row: &Row) -> Option<Self> {
        let table = table.to_string();
        let original = || row.original_values().cloned().unwrap_or_else(|| row.fields().clone());
        let change = match row.state() {
            RowState::Added => RowChange::Insert(InsertChange {
                table,
                index,
                key: identity::primary_key_identity(keys, row),
                client_key: identity::client_key_identity(row),
                values: row.fields().clone(),
            }),
            RowState::Modified => {
                let original = original();
                RowChange::Update(UpdateChange {
                    table,
                    index,
                    key: identity::fields_identity(keys, &original),
                    values: row.fields().clone(),
                    changed: row.changed_fields(),
                    original,
                })
            }
            RowState::Deleted => {
                let original = original();
                RowChange::Delete(DeleteChange {
                    table,
                    index,
                    key: identity::fields_identity(keys, &original),
                    original,
                })
            }
            RowState::Unchanged | RowState::Detached => return None,
        };
        Some(change)
    }

    pub fn table(&self) -> &str {
        match self {
            RowChange::Insert(c) => &c.table,
            RowChange::Update(c) => &c.table,
            RowChange::Delete(c) => &c.table,
        }
    }

    pub fn index(&self) -> RowIndex {
        match self {
            RowChange::Insert(c) => c.index,
            RowChange::Update(c) => c.index,
            RowChange::Delete(c) => c.index,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            RowChange::Insert(c) => c.key.as_deref(),
            RowChange::Update(c) => c.key.as_deref(),
            RowChange::Delete(c) => c.key.as_deref(),
        }
    }

    /// Row state the change stems from.
    pub fn state(&self) -> RowState {
        match self {
            RowChange::Insert(_) => RowState::Added,
            RowChange::Update(_) => RowState::Modified,
            RowChange::Delete(_) => RowState::Deleted,
        }
    }

    /// Values to write to storage: the client key column is local only.
    /// Deletes carry no values.
    pub fn persisted_values(&self) -> Fields {
        let values = match self {
            RowChange::Insert(c) => &c.values,
            RowChange::Update(c) => &c.values,
            RowChange::Delete(_) => return Fields::new(),
        };
        values
            .iter()
            .filter(|(column, _)| column.as_str() != CLIENT_KEY_COLUMN)
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }

    /// Value of `column` before the change.
    pub fn original_value(&self, column: &str) -> Option<&Value> {
        match self {
            RowChange::Insert(_) => None,
            RowChange::Update(c) => c.original.get(column),
            RowChange::Delete(c) => c.original.get(column),
        }
    }
}

/// Pending changes of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChanges {
    pub table: TableName,
    pub primary_key: Vec<ColumnName>,
    pub changes: Vec<RowChange>,
}

impl TableChanges {
    /// Collect the pending rows of `table` in row order.
    pub fn from_table(table: &Table) -> Self {
        let primary_key = table.primary_key();
        let changes = table
            .rows()
            .iter()
            .enumerate()
            .filter_map(|(index, row)| RowChange::from_row(table.name(), &primary_key, index, row))
            .collect();
        Self {
            table: table.name().to_string(),
            primary_key,
            changes,
        }
    }

    pub fn inserts(&self) -> impl Iterator<Item = &InsertChange> {
        self.changes.iter().filter_map(|c| match c {
            RowChange::Insert(insert) => Some(insert),
            _ => None,
        })
    }

    pub fn updates(&self) -> impl Iterator<Item = &UpdateChange> {
        self.changes.iter().filter_map(|c| match c {
            RowChange::Update(update) => Some(update),
            _ => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &DeleteChange> {
        self.changes.iter().filter_map(|c| match c {
            RowChange::Delete(delete) => Some(delete),
            _ => None,
        })
    }
}

/// Pending changes of a dataset, grouped by table. Tables without changes
/// are left out.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub tables: Vec<TableChanges>,
}

impl ChangeSet {
    pub fn from_dataset(dataset: &Dataset) -> Self {
        let tables = dataset
            .tables()
            .map(TableChanges::from_table)
            .filter(|t| !t.changes.is_empty())
            .collect();
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Number of changed rows.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.changes.len()).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableChanges> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// All changes in table order.
    pub fn changes(&self) -> impl Iterator<Item = &RowChange> {
        self.tables.iter().flat_map(|t| t.changes.iter())
    }
}

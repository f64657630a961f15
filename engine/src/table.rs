//! Tables: ordered rows plus column metadata.
//!
//! A table owns its rows. Rows enter through [`Table::add_row`] or
//! [`Table::load_row`] and leave through commit of a deletion, revert of an
//! insertion, [`Table::detach_row`], or a merge.

use crate::{
    error::Result,
    identity,
    notify::{CollectionChange, Silent, Sink},
    values_equal, ColumnDef, ColumnName, Error, Row, RowIndex, RowState, TableName, Value,
    CLIENT_KEY_COLUMN,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, ordered collection of rows sharing one set of columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    name: TableName,
    columns: Vec<ColumnDef>,
    rows: Vec<Row>,
}

impl Table {
    /// Create an empty table without columns.
    pub fn new(name: impl Into<TableName>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Builder-style column definition. A column with the same name is
    /// replaced.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => {
                let _ = self.add_column(column);
            }
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Get a column definition by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Mutable column access, for metadata edits such as captions.
    ///
    /// Key membership should go through [`Table::set_column_primary_key`].
    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDef> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Add a column. Existing full rows get a null field for it.
    pub fn add_column(&mut self, column: ColumnDef) -> Result<()> {
        if self.has_column(&column.name) {
            return Err(Error::DuplicateColumn {
                table: self.name.clone(),
                column: column.name,
            });
        }
        for row in &mut self.rows {
            row.extend_column(&column.name, Value::Null);
        }
        self.columns.push(column);
        Ok(())
    }

    /// Primary key column names, in column order.
    ///
    /// Derived from the `is_primary_key` flags, so it can never disagree
    /// with the column metadata.
    pub fn primary_key(&self) -> Vec<ColumnName> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Make exactly `columns` the primary key.
    pub fn set_primary_key(&mut self, columns: &[&str]) -> Result<()> {
        if let Some(missing) = columns.iter().find(|name| !self.has_column(name)) {
            return Err(self.column_not_found(missing));
        }
        for column in &mut self.columns {
            column.is_primary_key = columns.contains(&column.name.as_str());
        }
        Ok(())
    }

    /// Add or remove a single column from the primary key.
    pub fn set_column_primary_key(&mut self, name: &str, is_key: bool) -> Result<()> {
        let table = self.name.clone();
        let column = self
            .column_mut(name)
            .ok_or_else(|| Error::ColumnNotFound {
                table,
                column: name.to_string(),
            })?;
        column.is_primary_key = is_key;
        Ok(())
    }

    pub fn has_client_key_column(&self) -> bool {
        self.has_column(CLIENT_KEY_COLUMN)
    }

    /// Add the reserved client correlation column if it is missing.
    pub fn ensure_client_key_column(&mut self) {
        if !self.has_client_key_column() {
            self.columns.push(ColumnDef::client_key());
            for row in &mut self.rows {
                row.extend_column(CLIENT_KEY_COLUMN, Value::Null);
            }
        }
    }

    /// A detached full row shaped like this table, all fields null.
    pub fn new_row(&self) -> Row {
        Row::full(&self.columns)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, index: RowIndex) -> Option<&Row> {
        self.rows.get(index)
    }

    /// Direct row access. Writes through it skip the table's type checks.
    pub fn row_mut(&mut self, index: RowIndex) -> Option<&mut Row> {
        self.rows.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert a detached row as `Added`.
    pub fn add_row(&mut self, row: Row) -> Result<RowIndex> {
        self.add_row_in(row, &mut Silent)
    }

    /// Insert a detached row as `Unchanged`, as loaders do.
    pub fn load_row(&mut self, row: Row) -> Result<RowIndex> {
        self.load_row_in(row, &mut Silent)
    }

    /// Write a field after checking the column and the value type.
    pub fn set_value(
        &mut self,
        index: RowIndex,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<bool> {
        self.set_value_in(index, column, value.into(), &mut Silent)
    }

    /// Delete a row. Added rows are removed outright, others soft-deleted.
    pub fn delete_row(&mut self, index: RowIndex) -> Result<()> {
        self.delete_row_in(index, &mut Silent)
    }

    /// Commit a single row. Deleted rows are removed.
    pub fn accept_row(&mut self, index: RowIndex) -> Result<()> {
        self.accept_row_in(index, &mut Silent)
    }

    /// Revert a single row. Added rows are removed.
    pub fn reject_row(&mut self, index: RowIndex) -> Result<()> {
        self.reject_row_in(index, &mut Silent)
    }

    /// Commit every pending change in the table.
    pub fn accept_changes(&mut self) {
        self.accept_changes_in(&mut Silent)
    }

    /// Revert every pending change in the table.
    pub fn reject_changes(&mut self) {
        self.reject_changes_in(&mut Silent)
    }

    /// Remove every row.
    pub fn clear(&mut self) {
        self.clear_in(&mut Silent)
    }

    /// Remove a row and hand it back detached, without pending state, so it
    /// can be added to another table.
    pub fn detach_row(&mut self, index: RowIndex) -> Result<Row> {
        self.detach_row_in(index, &mut Silent)
    }

    pub fn has_changes(&self) -> bool {
        self.rows.iter().any(|r| r.state().is_pending())
    }

    /// Number of rows with pending changes.
    pub fn pending_count(&self) -> usize {
        self.rows.iter().filter(|r| r.state().is_pending()).count()
    }

    /// Find a non-deleted row by primary key values, given in key order.
    pub fn find(&self, key: &[Value]) -> Option<RowIndex> {
        let pk = self.primary_key();
        if pk.is_empty() || pk.len() != key.len() {
            return None;
        }
        self.rows.iter().position(|row| {
            row.state() != RowState::Deleted
                && pk
                    .iter()
                    .zip(key)
                    .all(|(column, value)| values_equal(row.get(column), Some(value)))
        })
    }

    /// Start a query over the rows.
    pub fn query(&self) -> RowQuery<'_> {
        RowQuery::new(&self.rows)
    }

    /// Give every added row without a client key a fresh one.
    ///
    /// Returns the number of keys generated.
    pub fn assign_client_keys(&mut self) -> Result<usize> {
        if !self.has_client_key_column() {
            return Err(Error::ClientKeyColumnMissing(self.name.clone()));
        }
        let mut assigned = 0;
        for row in &mut self.rows {
            if row.state() == RowState::Added && identity::client_key_identity(row).is_none() {
                row.store(CLIENT_KEY_COLUMN, Value::Guid(Uuid::new_v4()));
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    /// Check a row's fields against the column definitions.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if let Some(unknown) = row.columns().find(|name| !self.has_column(name)) {
            return Err(self.column_not_found(unknown));
        }
        for column in &self.columns {
            column.validate(row.get(&column.name))?;
        }
        Ok(())
    }

    pub(crate) fn column_not_found(&self, column: &str) -> Error {
        Error::ColumnNotFound {
            table: self.name.clone(),
            column: column.to_string(),
        }
    }

    fn out_of_range(&self, index: RowIndex) -> Error {
        Error::RowIndexOutOfRange {
            table: self.name.clone(),
            index,
        }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<Row> {
        &mut self.rows
    }

    /// Shape a row to this table's columns and type-check it.
    pub(crate) fn conform(&self, row: &mut Row) -> Result<()> {
        if row.state() != RowState::Detached {
            return Err(Error::RowAttached);
        }
        row.materialize(&self.columns, |_| Value::Null)
            .map_err(|e| match e {
                Error::FieldNotFound(column) => self.column_not_found(&column),
                other => other,
            })?;
        for column in &self.columns {
            if let Some(value) = row.get(&column.name) {
                column.check_type(value)?;
            }
        }
        Ok(())
    }

    /// Append a prepared row in `state` and report it.
    pub(crate) fn push_row_in(&mut self, mut row: Row, state: RowState, sink: &mut dyn Sink) -> RowIndex {
        row.set_state(state);
        let index = self.rows.len();
        self.rows.push(row);
        sink.collection_changed(&self.name, CollectionChange::Added { index });
        sink.state_changed(&self.name, index, RowState::Detached, state);
        index
    }

    /// Remove a row and report it.
    pub(crate) fn remove_row_in(&mut self, index: RowIndex, sink: &mut dyn Sink) -> Row {
        let mut row = self.rows.remove(index);
        let old = row.state();
        row.set_state(RowState::Detached);
        sink.state_changed(&self.name, index, old, RowState::Detached);
        sink.collection_changed(&self.name, CollectionChange::Removed { index });
        row
    }

    pub(crate) fn add_row_in(&mut self, mut row: Row, sink: &mut dyn Sink) -> Result<RowIndex> {
        self.conform(&mut row)?;
        Ok(self.push_row_in(row, RowState::Added, sink))
    }

    pub(crate) fn load_row_in(&mut self, mut row: Row, sink: &mut dyn Sink) -> Result<RowIndex> {
        self.conform(&mut row)?;
        row.settle();
        Ok(self.push_row_in(row, RowState::Unchanged, sink))
    }

    pub(crate) fn set_value_in(
        &mut self,
        index: RowIndex,
        column: &str,
        value: Value,
        sink: &mut dyn Sink,
    ) -> Result<bool> {
        let def = self.column(column).ok_or_else(|| self.column_not_found(column))?;
        def.check_type(&value)?;
        let out_of_range = self.out_of_range(index);
        let row = self.rows.get_mut(index).ok_or(out_of_range)?;

        let old_state = row.state();
        let (old_value, new_value) = if sink.is_active() {
            (row.get(column).cloned().unwrap_or_default(), value.clone())
        } else {
            (Value::Null, Value::Null)
        };
        if !row.set(column, value)? {
            return Ok(false);
        }
        let new_state = row.state();
        sink.value_changed(&self.name, index, column, old_value, new_value);
        sink.state_changed(&self.name, index, old_state, new_state);
        Ok(true)
    }

    pub(crate) fn delete_row_in(&mut self, index: RowIndex, sink: &mut dyn Sink) -> Result<()> {
        let out_of_range = self.out_of_range(index);
        let row = self.rows.get_mut(index).ok_or(out_of_range)?;
        let old = row.state();
        if old == RowState::Added {
            self.remove_row_in(index, sink);
            return Ok(());
        }
        row.delete()?;
        sink.state_changed(&self.name, index, old, RowState::Deleted);
        Ok(())
    }

    pub(crate) fn accept_row_in(&mut self, index: RowIndex, sink: &mut dyn Sink) -> Result<()> {
        let out_of_range = self.out_of_range(index);
        let row = self.rows.get_mut(index).ok_or(out_of_range)?;
        let old = row.state();
        if old == RowState::Deleted {
            self.remove_row_in(index, sink);
            return Ok(());
        }
        row.accept()?;
        let new = row.state();
        sink.state_changed(&self.name, index, old, new);
        Ok(())
    }

    pub(crate) fn reject_row_in(&mut self, index: RowIndex, sink: &mut dyn Sink) -> Result<()> {
        let out_of_range = self.out_of_range(index);
        let row = self.rows.get_mut(index).ok_or(out_of_range)?;
        let old = row.state();
        if old == RowState::Added {
            self.remove_row_in(index, sink);
            return Ok(());
        }
        let restored = row.changed_fields();
        row.revert()?;
        let new = row.state();
        sink.values_changed(&self.name, index, restored);
        sink.state_changed(&self.name, index, old, new);
        Ok(())
    }

    pub(crate) fn accept_changes_in(&mut self, sink: &mut dyn Sink) {
        // Walk backwards so removals do not shift rows still to be visited
        for index in (0..self.rows.len()).rev() {
            if self.rows[index].state().is_pending() {
                // Pending rows always commit: deleted ones are removed here
                let committed = self.accept_row_in(index, sink);
                debug_assert!(committed.is_ok());
            }
        }
        tracing::trace!(table = %self.name, rows = self.rows.len(), "accepted changes");
    }

    pub(crate) fn reject_changes_in(&mut self, sink: &mut dyn Sink) {
        for index in (0..self.rows.len()).rev() {
            if self.rows[index].state().is_pending() {
                // Pending rows always revert: added ones are removed here
                let reverted = self.reject_row_in(index, sink);
                debug_assert!(reverted.is_ok());
            }
        }
        tracing::trace!(table = %self.name, rows = self.rows.len(), "rejected changes");
    }

    pub(crate) fn clear_in(&mut self, sink: &mut dyn Sink) {
        if self.rows.is_empty() {
            return;
        }
        self.rows.clear();
        sink.collection_changed(&self.name, CollectionChange::Reset);
    }

    pub(crate) fn detach_row_in(&mut self, index: RowIndex, sink: &mut dyn Sink) -> Result<Row> {
        if index >= self.rows.len() {
            return Err(self.out_of_range(index));
        }
        let mut row = self.remove_row_in(index, sink);
        row.settle();
        row.set_state(RowState::Detached);
        Ok(row)
    }
}

/// Builder for querying rows in a table.
///
/// Deleted rows are excluded unless asked for. Predicates are the hook
/// external filter languages compile to.
pub struct RowQuery<'a> {
    rows: &'a [Row],
    include_deleted: bool,
    state: Option<RowState>,
    predicates: Vec<Box<dyn Fn(&Row) -> bool + 'a>>,
}

impl<'a> RowQuery<'a> {
    fn new(rows: &'a [Row]) -> Self {
        Self {
            rows,
            include_deleted: false,
            state: None,
            predicates: Vec::new(),
        }
    }

    /// Include deleted rows in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Only rows in the given state. Asking for `Deleted` includes them.
    pub fn state(mut self, state: RowState) -> Self {
        self.state = Some(state);
        if state == RowState::Deleted {
            self.include_deleted = true;
        }
        self
    }

    /// Add a row predicate; all predicates must hold.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Row) -> bool + 'a,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    fn matches(&self, row: &Row) -> bool {
        if !self.include_deleted && row.state() == RowState::Deleted {
            return false;
        }
        if self.state.is_some_and(|s| s != row.state()) {
            return false;
        }
        self.predicates.iter().all(|p| p(row))
    }

    /// Get all matching rows.
    pub fn all(self) -> Vec<&'a Row> {
        let rows = self.rows;
        rows.iter().filter(|r| self.matches(r)).collect()
    }

    /// Positions of all matching rows.
    pub fn indices(self) -> Vec<RowIndex> {
        let rows = self.rows;
        rows.iter()
            .enumerate()
            .filter(|(_, r)| self.matches(r))
            .map(|(i, _)| i)
            .collect()
    }

    /// Get the first matching row.
    pub fn first(self) -> Option<&'a Row> {
        let rows = self.rows;
        rows.iter().find(|r| self.matches(r))
    }

    /// Count matching rows.
    pub fn count(self) -> usize {
        let rows = self.rows;
        rows.iter().filter(|r| self.matches(r)).count()
    }
}

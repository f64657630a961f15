//! Rows and the per-row edit state machine.

use crate::{error::Result, values_equal, ColumnDef, ColumnName, Error, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered column name to value mapping.
pub type Fields = IndexMap<ColumnName, Value>;

/// Edit state of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowState {
    /// Constructed but not part of any table
    Detached,
    /// Inserted locally, unknown to the server
    Added,
    /// Changed locally since the last commit
    Modified,
    /// No pending changes
    Unchanged,
    /// Soft-deleted, removed on commit
    Deleted,
}

impl RowState {
    /// Whether the state represents outbound local work.
    pub fn is_pending(self) -> bool {
        matches!(self, RowState::Added | RowState::Modified | RowState::Deleted)
    }
}

/// Distinguishes rows materialized with every table column from rows that
/// only carry explicitly assigned fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Full,
    /// Floating row; a missing field is distinct from an explicit null
    Sparse,
}

/// A single row: field values, edit state and the baseline snapshot taken
/// when the row first left the unchanged state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    kind: RowKind,
    state: RowState,
    #[serde(skip)]
    selected: bool,
    fields: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original: Option<Fields>,
}

impl Row {
    /// Create a detached sparse row with no fields.
    pub fn sparse() -> Self {
        Self {
            kind: RowKind::Sparse,
            state: RowState::Detached,
            selected: false,
            fields: Fields::new(),
            original: None,
        }
    }

    /// Create a detached full row with every column set to null.
    pub(crate) fn full<'c>(columns: impl IntoIterator<Item = &'c ColumnDef>) -> Self {
        Self {
            kind: RowKind::Full,
            state: RowState::Detached,
            selected: false,
            fields: columns
                .into_iter()
                .map(|c| (c.name.clone(), Value::Null))
                .collect(),
            original: None,
        }
    }

    /// Builder-style field assignment for rows that are still detached.
    ///
    /// Unknown column names are kept and rejected when the row is added
    /// to a table.
    pub fn with(mut self, column: impl Into<ColumnName>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    /// Builder-style state override, used to build changesets and snapshots.
    pub fn with_state(mut self, state: RowState) -> Self {
        if state == RowState::Modified || state == RowState::Deleted {
            self.original.get_or_insert_with(|| self.fields.clone());
        }
        self.state = state;
        self
    }

    pub fn kind(&self) -> RowKind {
        self.kind
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Transient bookkeeping flag, not serialized.
    pub fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }

    /// Get a field. `None` means the field is absent, which for full rows
    /// only happens for unknown columns.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Check if the field is present (possibly holding null).
    pub fn contains(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }

    /// Ordered list of present field names.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Ordered field values.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Number of present fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether a baseline snapshot has been captured.
    pub fn has_original_values(&self) -> bool {
        self.original.is_some()
    }

    /// Baseline value of a column, if a baseline exists.
    pub fn original(&self, column: &str) -> Option<&Value> {
        self.original.as_ref()?.get(column)
    }

    /// The baseline snapshot, if any.
    pub fn original_values(&self) -> Option<&Fields> {
        self.original.as_ref()
    }

    /// Columns with pending changes.
    ///
    /// Added rows report every present field. Modified rows report fields
    /// that differ from the baseline. Other states report nothing.
    pub fn changed_fields(&self) -> Vec<ColumnName> {
        match (self.state, &self.original) {
            (RowState::Added, _) => self.fields.keys().cloned().collect(),
            (RowState::Modified, Some(original)) => {
                let mut changed: Vec<ColumnName> = self
                    .fields
                    .iter()
                    .filter(|(name, value)| !values_equal(original.get(*name), Some(value)))
                    .map(|(name, _)| name.clone())
                    .collect();
                // Fields removed from a sparse row since the baseline
                changed.extend(
                    original
                        .keys()
                        .filter(|name| !self.fields.contains_key(*name))
                        .cloned(),
                );
                changed
            }
            _ => Vec::new(),
        }
    }

    /// Write a field.
    ///
    /// Returns `Ok(false)` when the field already holds an equal value. The
    /// first effective write on an unchanged row captures the baseline and
    /// moves the row to `Modified`.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        if self.state == RowState::Deleted {
            return Err(Error::RowDeleted);
        }
        match self.fields.get(column) {
            None if self.kind == RowKind::Full => {
                return Err(Error::FieldNotFound(column.to_string()));
            }
            Some(current) if values_equal(Some(current), Some(&value)) => return Ok(false),
            _ => {}
        }
        self.begin_edit();
        self.fields.insert(column.to_string(), value);
        Ok(true)
    }

    /// Remove a field from a sparse row, returning it to the absent state.
    pub fn remove(&mut self, column: &str) -> Result<Option<Value>> {
        if self.kind != RowKind::Sparse {
            return Err(Error::NotSparse);
        }
        if self.state == RowState::Deleted {
            return Err(Error::RowDeleted);
        }
        if !self.fields.contains_key(column) {
            return Ok(None);
        }
        self.begin_edit();
        Ok(self.fields.shift_remove(column))
    }

    /// Soft-delete the row.
    ///
    /// Added rows are removed by their table instead, see
    /// [`crate::Table::delete_row`].
    pub fn delete(&mut self) -> Result<()> {
        match self.state {
            RowState::Deleted => Err(Error::RowDeleted),
            RowState::Added => Err(Error::AddedRowRevert),
            RowState::Detached => Err(Error::RowDetached),
            RowState::Unchanged | RowState::Modified => {
                self.original.get_or_insert_with(|| self.fields.clone());
                self.state = RowState::Deleted;
                Ok(())
            }
        }
    }

    /// Commit pending changes on this row.
    ///
    /// Deleted rows must be committed by their table, which removes them.
    pub fn accept(&mut self) -> Result<()> {
        match self.state {
            RowState::Deleted => Err(Error::DeletedRowCommit),
            RowState::Added | RowState::Modified => {
                self.state = RowState::Unchanged;
                self.original = None;
                Ok(())
            }
            RowState::Unchanged | RowState::Detached => Ok(()),
        }
    }

    /// Revert pending changes on this row, restoring the baseline.
    ///
    /// Added rows must be reverted by their table, which removes them.
    pub fn revert(&mut self) -> Result<()> {
        match self.state {
            RowState::Added => Err(Error::AddedRowRevert),
            RowState::Modified | RowState::Deleted => {
                if let Some(original) = self.original.take() {
                    self.fields = original;
                }
                self.state = RowState::Unchanged;
                Ok(())
            }
            RowState::Unchanged | RowState::Detached => Ok(()),
        }
    }

    fn begin_edit(&mut self) {
        if self.state == RowState::Unchanged {
            self.original = Some(self.fields.clone());
            self.state = RowState::Modified;
        }
    }

    /// Raw write used by merges: no state transition, no baseline capture.
    /// Returns whether the stored value changed.
    pub(crate) fn store(&mut self, column: &str, value: Value) -> bool {
        if let Some(current) = self.fields.get(column) {
            if values_equal(Some(current), Some(&value)) {
                return false;
            }
        }
        self.fields.insert(column.to_string(), value);
        true
    }

    /// Add a newly defined column to a full row and its baseline.
    pub(crate) fn extend_column(&mut self, column: &str, value: Value) {
        if self.kind != RowKind::Full {
            return;
        }
        if let Some(original) = &mut self.original {
            original.insert(column.to_string(), value.clone());
        }
        self.fields.insert(column.to_string(), value);
    }

    pub(crate) fn set_state(&mut self, state: RowState) {
        self.state = state;
    }

    /// Drop pending changes without restoring the baseline.
    pub(crate) fn settle(&mut self) {
        self.state = RowState::Unchanged;
        self.original = None;
    }

    /// Turn the row into a full row with exactly `columns`, in column order.
    /// Missing fields are filled by `fill`. Fields outside `columns` are
    /// rejected.
    pub(crate) fn materialize<'c>(
        &mut self,
        columns: &'c [ColumnDef],
        mut fill: impl FnMut(&'c ColumnDef) -> Value,
    ) -> Result<()> {
        if let Some(unknown) = self
            .fields
            .keys()
            .find(|name| !columns.iter().any(|c| &c.name == *name))
        {
            return Err(Error::FieldNotFound(unknown.clone()));
        }
        let mut fields = Fields::with_capacity(columns.len());
        for column in columns {
            let value = match self.fields.shift_remove(&column.name) {
                Some(v) => v,
                None => fill(column),
            };
            fields.insert(column.name.clone(), value);
        }
        self.fields = fields;
        self.kind = RowKind::Full;
        Ok(())
    }
}

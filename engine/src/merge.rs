//! Merge engine: reconciles a current dataset with a refreshed one.
//!
//! # Algorithm
//!
//! 1. Plan every table: check column compatibility, resolve key columns,
//!    index the refreshed rows by identity and decide, row by row, what
//!    happens to each current and refreshed row
//! 2. If any table fails to plan, stop; nothing has been touched yet
//! 3. Apply the plans: in-place updates, then pruning, then removals
//!    (highest position first), then inserts
//! 4. Return what was added, updated and deleted
//!
//! Field merges only write values that differ, so merging the same data
//! twice is a no-op and produces no notifications.

use crate::{
    error::Result,
    identity::{self, KeyIndex},
    notify::{CollectionChange, Silent, Sink},
    ColumnDef, ColumnName, Dataset, Error, Row, RowIndex, RowState, Table, TableName, Value,
    CLIENT_KEY_COLUMN,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// How refreshed data is reconciled with the current data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeMode {
    /// Refreshed data replaces the current rows; the current schema wins
    Replace,
    /// Refresh, but only when the table has no pending changes at all
    RefreshIfNoChangesExist,
    /// Refresh unchanged rows, keep every row with pending changes
    RefreshPreservingLocalChanges,
    /// Apply the server's echo of a saved changeset
    PostSave,
}

impl std::fmt::Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeMode::Replace => write!(f, "Replace"),
            MergeMode::RefreshIfNoChangesExist => write!(f, "RefreshIfNoChangesExist"),
            MergeMode::RefreshPreservingLocalChanges => write!(f, "RefreshPreservingLocalChanges"),
            MergeMode::PostSave => write!(f, "PostSave"),
        }
    }
}

/// Supplies values for columns a refreshed row does not carry.
pub type DefaultValueProvider = Box<dyn Fn(&str, &ColumnDef) -> Value>;

/// Decides whether an unchanged row should be dropped after a merge.
pub type PrunePredicate = Box<dyn Fn(&Row) -> bool>;

/// Configuration for a merge call.
#[derive(Default)]
pub struct MergeOptions {
    excluded_tables: HashSet<TableName>,
    excluded_from_deletion: HashSet<TableName>,
    primary_key_overrides: HashMap<TableName, Vec<ColumnName>>,
    prune: HashMap<TableName, PrunePredicate>,
    default_values: Option<DefaultValueProvider>,
    client_key_correlation: bool,
}

impl MergeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip a table entirely.
    pub fn exclude_table(mut self, table: impl Into<TableName>) -> Self {
        self.excluded_tables.insert(table.into());
        self
    }

    /// Never remove rows of this table during a refresh or post-save merge.
    pub fn exclude_from_deletion(mut self, table: impl Into<TableName>) -> Self {
        self.excluded_from_deletion.insert(table.into());
        self
    }

    /// Use these key columns for a table instead of its key flags.
    pub fn with_primary_key<I>(mut self, table: impl Into<TableName>, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ColumnName>,
    {
        self.primary_key_overrides
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    /// Drop unchanged rows of a table that match `predicate` after merging.
    pub fn with_prune<F>(mut self, table: impl Into<TableName>, predicate: F) -> Self
    where
        F: Fn(&Row) -> bool + 'static,
    {
        self.prune.insert(table.into(), Box::new(predicate));
        self
    }

    /// Provide values for newly materialized columns (default is null).
    pub fn with_default_values<F>(mut self, provider: F) -> Self
    where
        F: Fn(&str, &ColumnDef) -> Value + 'static,
    {
        self.default_values = Some(Box::new(provider));
        self
    }

    /// Let post-save merges fall back to the client key for added rows.
    pub fn with_client_key_correlation(mut self) -> Self {
        self.client_key_correlation = true;
        self
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        self.excluded_tables.contains(table)
    }

    pub fn is_excluded_from_deletion(&self, table: &str) -> bool {
        self.excluded_from_deletion.contains(table)
    }

    pub fn client_key_correlation(&self) -> bool {
        self.client_key_correlation
    }

    fn key_columns(&self, table: &Table) -> Result<Vec<ColumnName>> {
        match self.primary_key_overrides.get(table.name()) {
            Some(columns) => {
                if let Some(missing) = columns.iter().find(|c| !table.has_column(c)) {
                    return Err(table.column_not_found(missing));
                }
                Ok(columns.clone())
            }
            None => Ok(table.primary_key()),
        }
    }

    fn default_value(&self, table: &str, column: &ColumnDef) -> Value {
        self.default_values
            .as_ref()
            .map_or(Value::Null, |provider| provider(table, column))
    }

    fn prunes(&self, table: &str, row: &Row) -> bool {
        self.prune.get(table).is_some_and(|predicate| predicate(row))
    }
}

impl std::fmt::Debug for MergeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeOptions")
            .field("excluded_tables", &self.excluded_tables)
            .field("excluded_from_deletion", &self.excluded_from_deletion)
            .field("primary_key_overrides", &self.primary_key_overrides)
            .field("prune", &self.prune.keys().collect::<Vec<_>>())
            .field("default_values", &self.default_values.is_some())
            .field("client_key_correlation", &self.client_key_correlation)
            .finish()
    }
}

/// A row touched by a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedRow {
    /// Table the row belongs (or belonged) to
    pub table: TableName,
    /// Primary key identity, when the table has a key
    pub key: Option<String>,
    /// Row content after the merge; removed rows are detached
    pub row: Row,
}

/// Rows added, updated and deleted by a merge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub added: Vec<MergedRow>,
    pub updated: Vec<MergedRow>,
    pub deleted: Vec<MergedRow>,
}

impl MergeResult {
    /// Whether the merge changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of touched rows.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }

    /// Append another result.
    pub fn extend(&mut self, other: MergeResult) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
    }
}

/// Merge every table of `refreshed` into the table of the same name in
/// `current`.
///
/// Tables missing from `current` are ignored. Either every table merges or
/// none is modified.
pub fn merge_dataset(
    current: &mut Dataset,
    refreshed: &Dataset,
    mode: MergeMode,
    options: &MergeOptions,
) -> Result<MergeResult> {
    merge_dataset_in(current, refreshed, mode, options, &mut Silent)
}

/// Merge a single table.
pub fn merge_table(
    current: &mut Table,
    refreshed: &Table,
    mode: MergeMode,
    options: &MergeOptions,
) -> Result<MergeResult> {
    merge_table_in(current, refreshed, mode, options, &mut Silent)
}

pub(crate) fn merge_dataset_in(
    current: &mut Dataset,
    refreshed: &Dataset,
    mode: MergeMode,
    options: &MergeOptions,
    sink: &mut dyn Sink,
) -> Result<MergeResult> {
    let mut plans = Vec::new();
    for source in refreshed.tables() {
        if options.is_excluded(source.name()) {
            continue;
        }
        let Some(target) = current.table(source.name()) else {
            tracing::debug!(table = %source.name(), "refreshed table not in current dataset, skipped");
            continue;
        };
        let plan = plan_table(target, source, mode, options).inspect_err(|e| {
            tracing::warn!("Merge of dataset '{}' rejected: {}", current.name(), e);
        })?;
        plans.push((plan, source));
    }

    let mut result = MergeResult::default();
    for (plan, source) in plans {
        if let Some(target) = current.table_mut(&plan.table) {
            apply_plan(target, source, plan, options, sink, &mut result);
        }
    }

    tracing::info!(
        "Merged dataset '{}' ({}): {} added, {} updated, {} deleted",
        current.name(),
        mode,
        result.added.len(),
        result.updated.len(),
        result.deleted.len()
    );
    Ok(result)
}

pub(crate) fn merge_table_in(
    current: &mut Table,
    refreshed: &Table,
    mode: MergeMode,
    options: &MergeOptions,
    sink: &mut dyn Sink,
) -> Result<MergeResult> {
    let mut result = MergeResult::default();
    if options.is_excluded(current.name()) {
        return Ok(result);
    }
    let plan = plan_table(current, refreshed, mode, options).inspect_err(|e| {
        tracing::warn!("Merge of table '{}' rejected: {}", current.name(), e);
    })?;
    apply_plan(current, refreshed, plan, options, sink, &mut result);
    Ok(result)
}

/// What a merge will do to one table. Positions refer to rows before the
/// merge starts.
#[derive(Debug)]
struct TablePlan {
    table: TableName,
    mode: MergeMode,
    keys: Vec<ColumnName>,
    /// Columns present on both sides, in current column order
    shared: Vec<ColumnName>,
    /// Rebuild the table from scratch
    reset: bool,
    updates: Vec<Update>,
    removals: BTreeSet<RowIndex>,
    /// Positions in the refreshed table
    inserts: Vec<RowIndex>,
}

#[derive(Debug, Clone, Copy)]
struct Update {
    current: RowIndex,
    refreshed: RowIndex,
    /// Drop local pending state and commit the merged values
    commit: bool,
}

impl TablePlan {
    fn new(table: &Table, mode: MergeMode, keys: Vec<ColumnName>, shared: Vec<ColumnName>) -> Self {
        Self {
            table: table.name().to_string(),
            mode,
            keys,
            shared,
            reset: false,
            updates: Vec::new(),
            removals: BTreeSet::new(),
            inserts: Vec::new(),
        }
    }
}

/// Columns present in both tables, failing on a type conflict.
fn shared_columns(current: &Table, refreshed: &Table) -> Result<Vec<ColumnName>> {
    let mut shared = Vec::new();
    for column in current.columns() {
        if let Some(other) = refreshed.column(&column.name) {
            if other.field_type != column.field_type {
                return Err(Error::ColumnTypeConflict {
                    table: current.name().to_string(),
                    column: column.name.clone(),
                    current: column.field_type.to_string(),
                    refreshed: other.field_type.to_string(),
                });
            }
            shared.push(column.name.clone());
        }
    }
    Ok(shared)
}

fn plan_table(
    current: &Table,
    refreshed: &Table,
    mode: MergeMode,
    options: &MergeOptions,
) -> Result<TablePlan> {
    let shared = shared_columns(current, refreshed)?;
    let keys = options.key_columns(current)?;
    let mut plan = TablePlan::new(current, mode, keys, shared);

    match mode {
        MergeMode::Replace => plan_replace(&mut plan, current, refreshed)?,
        MergeMode::RefreshIfNoChangesExist | MergeMode::RefreshPreservingLocalChanges => {
            plan_refresh(&mut plan, current, refreshed, options)?
        }
        MergeMode::PostSave => plan_post_save(&mut plan, current, refreshed, options)?,
    }
    Ok(plan)
}

/// Index refreshed rows selected by `include` by primary key.
fn index_refreshed(
    plan: &TablePlan,
    refreshed: &Table,
    include: impl Fn(&Row) -> bool,
) -> Result<KeyIndex> {
    KeyIndex::by_primary_key(
        &plan.table,
        &plan.keys,
        refreshed
            .rows()
            .iter()
            .enumerate()
            .filter(|(_, row)| include(row)),
    )
}

/// Find the unconsumed refreshed row matching `row` by primary key.
fn match_key(
    plan: &TablePlan,
    index: &KeyIndex,
    consumed: &[bool],
    row: &Row,
) -> Option<RowIndex> {
    let identity = identity::primary_key_identity(&plan.keys, row)?;
    index.get(&identity).filter(|&r| !consumed[r])
}

fn require_key(plan: &TablePlan) -> Result<()> {
    if plan.keys.is_empty() {
        return Err(Error::NoPrimaryKey(plan.table.clone()));
    }
    Ok(())
}

fn plan_replace(plan: &mut TablePlan, current: &Table, refreshed: &Table) -> Result<()> {
    let live = |row: &Row| row.state() != RowState::Deleted;
    let keyed = !plan.keys.is_empty() && plan.keys.iter().all(|k| refreshed.has_column(k));

    if !keyed {
        plan.reset = true;
        plan.inserts = refreshed
            .rows()
            .iter()
            .enumerate()
            .filter(|(_, row)| live(row))
            .map(|(i, _)| i)
            .collect();
        return Ok(());
    }

    let index = index_refreshed(plan, refreshed, live)?;
    let mut consumed = vec![false; refreshed.len()];
    for (position, row) in current.rows().iter().enumerate() {
        match match_key(plan, &index, &consumed, row) {
            Some(r) => {
                consumed[r] = true;
                plan.updates.push(Update {
                    current: position,
                    refreshed: r,
                    commit: true,
                });
            }
            None => {
                plan.removals.insert(position);
            }
        }
    }
    plan.inserts = unconsumed(refreshed, &consumed, live);
    Ok(())
}

fn plan_refresh(
    plan: &mut TablePlan,
    current: &Table,
    refreshed: &Table,
    options: &MergeOptions,
) -> Result<()> {
    require_key(plan)?;
    if plan.mode == MergeMode::RefreshIfNoChangesExist {
        let pending = current.pending_count();
        if pending > 0 {
            return Err(Error::PendingChanges {
                table: plan.table.clone(),
                count: pending,
            });
        }
    }

    let live = |row: &Row| row.state() != RowState::Deleted;
    let index = index_refreshed(plan, refreshed, live)?;
    let keep_unmatched = options.is_excluded_from_deletion(&plan.table);
    let mut consumed = vec![false; refreshed.len()];

    for (position, row) in current.rows().iter().enumerate() {
        let matched = match_key(plan, &index, &consumed, row);
        if let Some(r) = matched {
            // The counterpart of a pending row is claimed but not applied,
            // so it is neither merged in nor inserted as a duplicate
            consumed[r] = true;
        }
        match (row.state(), matched) {
            (RowState::Unchanged, Some(r)) => plan.updates.push(Update {
                current: position,
                refreshed: r,
                commit: false,
            }),
            (RowState::Unchanged, None) if !keep_unmatched => {
                plan.removals.insert(position);
            }
            _ => {}
        }
    }
    plan.inserts = unconsumed(refreshed, &consumed, live);
    Ok(())
}

fn plan_post_save(
    plan: &mut TablePlan,
    current: &Table,
    refreshed: &Table,
    options: &MergeOptions,
) -> Result<()> {
    require_key(plan)?;

    // Unchanged rows in a changeset carry no work
    let pending = |row: &Row| row.state().is_pending();
    let index = index_refreshed(plan, refreshed, pending)?;

    let client_index = if options.client_key_correlation() {
        for table in [current, refreshed] {
            if !table.has_column(CLIENT_KEY_COLUMN) {
                return Err(Error::ClientKeyColumnMissing(table.name().to_string()));
            }
        }
        Some(KeyIndex::by_client_key(
            &plan.table,
            refreshed
                .rows()
                .iter()
                .enumerate()
                .filter(|(_, row)| pending(row)),
        )?)
    } else {
        None
    };

    let keep_deleted_by_server = options.is_excluded_from_deletion(&plan.table);
    let mut consumed = vec![false; refreshed.len()];
    for (position, row) in current.rows().iter().enumerate() {
        let by_key = match_key(plan, &index, &consumed, row);

        if row.state() == RowState::Deleted {
            // The delete is final whatever the server echoed
            if let Some(r) = by_key {
                consumed[r] = true;
            }
            plan.removals.insert(position);
            continue;
        }

        let matched = match (by_key, &client_index) {
            (Some(r), _) => Some(r),
            (None, Some(client_index)) if row.state() == RowState::Added => {
                let client_key =
                    identity::client_key_identity(row).ok_or_else(|| Error::MissingClientKey {
                        table: plan.table.clone(),
                        row: position,
                    })?;
                client_index.get(&client_key).filter(|&r| !consumed[r])
            }
            _ => None,
        };

        if let Some(r) = matched {
            consumed[r] = true;
            if refreshed.rows()[r].state() == RowState::Deleted && !keep_deleted_by_server {
                plan.removals.insert(position);
            } else {
                plan.updates.push(Update {
                    current: position,
                    refreshed: r,
                    commit: true,
                });
            }
        }
    }

    // Rows the server created on its own; modified rows nobody here holds
    // any more are not resurrected
    plan.inserts = unconsumed(refreshed, &consumed, |row| row.state() == RowState::Added);
    Ok(())
}

fn unconsumed(refreshed: &Table, consumed: &[bool], include: impl Fn(&Row) -> bool) -> Vec<RowIndex> {
    refreshed
        .rows()
        .iter()
        .enumerate()
        .filter(|(i, row)| !consumed[*i] && include(row))
        .map(|(i, _)| i)
        .collect()
}

/// Build a full unchanged-to-be row shaped like `target` from `source`.
fn project(target: &Table, source: &Row, options: &MergeOptions) -> Row {
    let mut row = target.new_row();
    for column in target.columns() {
        let value = match source.get(&column.name) {
            Some(value) => value.clone(),
            None => options.default_value(target.name(), column),
        };
        row.store(&column.name, value);
    }
    row
}

fn merged(plan: &TablePlan, row: &Row) -> MergedRow {
    MergedRow {
        table: plan.table.clone(),
        key: identity::primary_key_identity(&plan.keys, row),
        row: row.clone(),
    }
}

fn apply_plan(
    target: &mut Table,
    source: &Table,
    plan: TablePlan,
    options: &MergeOptions,
    sink: &mut dyn Sink,
    result: &mut MergeResult,
) {
    let (added, updated, deleted) = (result.added.len(), result.updated.len(), result.deleted.len());
    for row in target.rows_mut() {
        row.set_selected(false);
    }

    if plan.reset {
        apply_reset(target, source, &plan, options, sink, result);
    } else {
        apply_incremental(target, source, &plan, options, sink, result);
    }

    tracing::debug!(
        table = %plan.table,
        mode = %plan.mode,
        added = result.added.len() - added,
        updated = result.updated.len() - updated,
        deleted = result.deleted.len() - deleted,
        "merged table"
    );
}

fn apply_reset(
    target: &mut Table,
    source: &Table,
    plan: &TablePlan,
    options: &MergeOptions,
    sink: &mut dyn Sink,
    result: &mut MergeResult,
) {
    let replaced = std::mem::take(target.rows_mut());
    let mut rows = Vec::with_capacity(plan.inserts.len());
    for &r in &plan.inserts {
        let mut row = project(target, &source.rows()[r], options);
        if options.prunes(&plan.table, &row) {
            continue;
        }
        row.set_state(RowState::Unchanged);
        row.set_selected(true);
        result.added.push(merged(plan, &row));
        rows.push(row);
    }
    for mut row in replaced {
        row.settle();
        row.set_state(RowState::Detached);
        result.deleted.push(merged(plan, &row));
    }
    *target.rows_mut() = rows;
    sink.collection_changed(&plan.table, CollectionChange::Reset);
}

fn apply_incremental(
    target: &mut Table,
    source: &Table,
    plan: &TablePlan,
    options: &MergeOptions,
    sink: &mut dyn Sink,
    result: &mut MergeResult,
) {
    let mut removals = plan.removals.clone();

    for update in &plan.updates {
        let incoming = &source.rows()[update.refreshed];
        // Replaced rows take every column from the server or the defaults
        let replacement =
            (plan.mode == MergeMode::Replace).then(|| project(target, incoming, options));
        let row = &mut target.rows_mut()[update.current];
        let old_state = row.state();
        if update.commit {
            row.settle();
        }
        let changed: Vec<ColumnName> = match &replacement {
            Some(replacement) => replacement
                .fields()
                .iter()
                .filter(|(column, value)| row.store(column, (*value).clone()))
                .map(|(column, _)| column.clone())
                .collect(),
            None => plan
                .shared
                .iter()
                .filter(|column| match incoming.get(column) {
                    Some(value) => row.store(column, value.clone()),
                    None => false,
                })
                .cloned()
                .collect(),
        };
        row.set_selected(true);

        let new_state = row.state();
        if !changed.is_empty() || old_state != new_state {
            result.updated.push(merged(plan, row));
        }
        sink.values_changed(&plan.table, update.current, changed);
        sink.state_changed(&plan.table, update.current, old_state, new_state);
    }

    if !options.is_excluded_from_deletion(&plan.table) {
        for (position, row) in target.rows().iter().enumerate() {
            if row.state() == RowState::Unchanged && options.prunes(&plan.table, row) {
                removals.insert(position);
            }
        }
    }

    for &position in removals.iter().rev() {
        let row = target.remove_row_in(position, sink);
        result.deleted.push(merged(plan, &row));
    }

    for &r in &plan.inserts {
        let mut row = project(target, &source.rows()[r], options);
        if options.prunes(&plan.table, &row) {
            continue;
        }
        row.set_selected(true);
        let position = target.push_row_in(row, RowState::Unchanged, sink);
        result.added.push(merged(plan, &target.rows()[position]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{notify::Recorder, FieldType, Notification};

    fn schema(name: &str) -> Table {
        Table::new(name)
            .with_column(ColumnDef::key("Id", FieldType::Int))
            .with_column(ColumnDef::new("Name", FieldType::String))
    }

    fn loaded(name: &str, rows: &[(i64, &str)]) -> Table {
        let mut table = schema(name);
        for (id, text) in rows {
            table
                .load_row(Row::sparse().with("Id", *id).with("Name", *text))
                .unwrap();
        }
        table
    }

    fn names(table: &Table) -> Vec<(i64, String)> {
        table
            .rows()
            .iter()
            .map(|r| {
                (
                    r.get("Id").and_then(Value::as_i64).unwrap_or_default(),
                    r.get("Name").and_then(Value::as_str).unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn merge_result_counts() {
        let mut result = MergeResult::default();
        assert!(result.is_empty());
        result.extend(MergeResult {
            added: vec![MergedRow {
                table: "T".into(),
                key: None,
                row: Row::sparse(),
            }],
            ..Default::default()
        });
        assert_eq!(result.len(), 1);
        assert!(!result.is_empty());
    }

    #[test]
    fn replace_matches_by_key_in_place() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        current.set_value(0, "Name", "Annie").unwrap();
        let refreshed = loaded("People", &[(1, "Anne"), (3, "Cy")]);

        let result =
            merge_table(&mut current, &refreshed, MergeMode::Replace, &MergeOptions::new()).unwrap();

        assert_eq!(names(&current), vec![(1, "Anne".into()), (3, "Cy".into())]);
        assert!(!current.has_changes());
        assert_eq!(result.updated.len(), 1);
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(result.deleted[0].key.as_deref(), Some("1#2"));
        assert_eq!(result.added.len(), 1);
        assert_eq!(result.added[0].row.state(), RowState::Unchanged);
    }

    #[test]
    fn replace_keeps_current_schema() {
        let mut current =
            loaded("People", &[(1, "Ann")]).with_column(ColumnDef::new("Note", FieldType::String));
        let mut refreshed = schema("People").with_column(ColumnDef::new("Extra", FieldType::Int));
        refreshed
            .load_row(Row::sparse().with("Id", 1).with("Name", "Ann").with("Extra", 5))
            .unwrap();
        refreshed
            .load_row(Row::sparse().with("Id", 2).with("Name", "Bob"))
            .unwrap();

        let options = MergeOptions::new().with_default_values(|_, column| {
            if column.name == "Note" {
                Value::from("n/a")
            } else {
                Value::Null
            }
        });
        merge_table(&mut current, &refreshed, MergeMode::Replace, &options).unwrap();

        assert!(!current.has_column("Extra"));
        assert_eq!(current.len(), 2);
        assert!(current.rows().iter().all(|r| !r.contains("Extra")));
        assert_eq!(current.rows()[0].get("Note"), Some(&Value::from("n/a")));
        assert_eq!(current.rows()[1].get("Note"), Some(&Value::from("n/a")));
    }

    #[test]
    fn replace_discards_local_edit_in_current_only_column() {
        let mut current =
            loaded("People", &[(1, "Ann")]).with_column(ColumnDef::new("Note", FieldType::String));
        current.rows_mut()[0].store("Note", Value::from("server-old"));
        current.set_value(0, "Note", "local-edit").unwrap();
        let refreshed = loaded("People", &[(1, "Anne")]);
        let options = MergeOptions::new().with_default_values(|_, _| Value::from("DEFAULT"));

        let mut recorder = Recorder::default();
        let result =
            merge_table_in(&mut current, &refreshed, MergeMode::Replace, &options, &mut recorder)
                .unwrap();

        let row = &current.rows()[0];
        assert_eq!(row.state(), RowState::Unchanged);
        assert!(!row.has_original_values());
        assert_eq!(row.get("Name"), Some(&Value::from("Anne")));
        assert_eq!(row.get("Note"), Some(&Value::from("DEFAULT")));
        assert_eq!(result.updated.len(), 1);
        assert_eq!(
            recorder.0[0],
            Notification::RowValuesChanged {
                table: "People".into(),
                row: 0,
                columns: vec!["Name".into(), "Note".into()],
            }
        );
    }

    #[test]
    fn replace_fills_fields_missing_from_sparse_rows() {
        let mut current = loaded("People", &[(1, "Ann")]);
        let mut refreshed = schema("People");
        refreshed
            .rows_mut()
            .push(Row::sparse().with("Id", 1).with_state(RowState::Unchanged));

        merge_table(&mut current, &refreshed, MergeMode::Replace, &MergeOptions::new()).unwrap();
        assert_eq!(current.rows()[0].get("Name"), Some(&Value::Null));
        assert_eq!(current.rows()[0].get("Id"), Some(&Value::from(1)));
    }

    #[test]
    fn replace_without_key_resets() {
        let mut current = Table::new("Log").with_column(ColumnDef::new("Line", FieldType::String));
        current.load_row(Row::sparse().with("Line", "old")).unwrap();
        let mut refreshed = current.clone();
        refreshed.clear();
        refreshed.load_row(Row::sparse().with("Line", "a")).unwrap();
        refreshed.load_row(Row::sparse().with("Line", "b")).unwrap();

        let mut recorder = Recorder::default();
        let result = merge_table_in(
            &mut current,
            &refreshed,
            MergeMode::Replace,
            &MergeOptions::new(),
            &mut recorder,
        )
        .unwrap();

        assert_eq!(current.len(), 2);
        assert_eq!(result.added.len(), 2);
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(
            recorder.0,
            vec![Notification::CollectionChanged {
                table: "Log".into(),
                change: CollectionChange::Reset,
            }]
        );
    }

    #[test]
    fn replace_skips_deleted_refreshed_rows() {
        let mut current = loaded("People", &[]);
        let mut refreshed = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        refreshed.delete_row(1).unwrap();

        merge_table(&mut current, &refreshed, MergeMode::Replace, &MergeOptions::new()).unwrap();
        assert_eq!(names(&current), vec![(1, "Ann".into())]);
    }

    #[test]
    fn type_conflict_fails_before_any_change() {
        let mut current = loaded("People", &[(1, "Ann")]);
        let before = current.clone();
        let refreshed = Table::new("People")
            .with_column(ColumnDef::key("Id", FieldType::Int))
            .with_column(ColumnDef::new("Name", FieldType::Int));

        for mode in [
            MergeMode::Replace,
            MergeMode::RefreshIfNoChangesExist,
            MergeMode::RefreshPreservingLocalChanges,
            MergeMode::PostSave,
        ] {
            let result = merge_table(&mut current, &refreshed, mode, &MergeOptions::new());
            assert!(matches!(result, Err(Error::ColumnTypeConflict { ref column, .. }) if column == "Name"));
            assert_eq!(current, before);
        }
    }

    #[test]
    fn refresh_requires_primary_key() {
        let mut current = Table::new("Log").with_column(ColumnDef::new("Line", FieldType::String));
        let refreshed = current.clone();
        let result = merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshIfNoChangesExist,
            &MergeOptions::new(),
        );
        assert_eq!(result, Err(Error::NoPrimaryKey("Log".into())));
    }

    #[test]
    fn refresh_rejects_pending_changes() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        current.set_value(1, "Name", "Bobby").unwrap();
        let before = current.clone();
        let refreshed = loaded("People", &[(1, "Anne")]);

        let result = merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshIfNoChangesExist,
            &MergeOptions::new(),
        );
        assert_eq!(
            result,
            Err(Error::PendingChanges {
                table: "People".into(),
                count: 1
            })
        );
        assert_eq!(current, before);
    }

    #[test]
    fn refresh_replaces_clean_table() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        let refreshed = loaded("People", &[(1, "Anne"), (3, "Cy")]);

        let result = merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshIfNoChangesExist,
            &MergeOptions::new(),
        )
        .unwrap();

        assert_eq!(names(&current), vec![(1, "Anne".into()), (3, "Cy".into())]);
        assert!(current.rows().iter().all(|r| r.state() == RowState::Unchanged));
        assert_eq!((result.added.len(), result.updated.len(), result.deleted.len()), (1, 1, 1));
    }

    #[test]
    fn refresh_honors_deletion_exclusion() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        let refreshed = loaded("People", &[(1, "Ann")]);
        let options = MergeOptions::new().exclude_from_deletion("People");

        let result =
            merge_table(&mut current, &refreshed, MergeMode::RefreshIfNoChangesExist, &options)
                .unwrap();
        assert_eq!(current.len(), 2);
        assert!(result.is_empty());
    }

    #[test]
    fn preserving_refresh_honors_deletion_exclusion() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        current.set_value(0, "Name", "Annie").unwrap();
        let refreshed = loaded("People", &[(3, "Cy")]);
        let options = MergeOptions::new().exclude_from_deletion("People");

        let result = merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshPreservingLocalChanges,
            &options,
        )
        .unwrap();

        assert_eq!(
            names(&current),
            vec![(1, "Annie".into()), (2, "Bob".into()), (3, "Cy".into())]
        );
        assert_eq!(current.rows()[1].state(), RowState::Unchanged);
        assert!(result.deleted.is_empty());
        assert_eq!(result.added.len(), 1);

        // Without the exclusion the stale unchanged row goes
        let mut plain = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        plain.set_value(0, "Name", "Annie").unwrap();
        merge_table(
            &mut plain,
            &refreshed,
            MergeMode::RefreshPreservingLocalChanges,
            &MergeOptions::new(),
        )
        .unwrap();
        assert_eq!(names(&plain), vec![(1, "Annie".into()), (3, "Cy".into())]);
    }

    #[test]
    fn refresh_preserves_local_changes() {
        let mut current = loaded("People", &[(1, "A"), (2, "B"), (3, "C"), (6, "F")]);
        current.set_value(1, "Name", "B-local").unwrap();
        current.delete_row(2).unwrap();
        current
            .add_row(Row::sparse().with("Id", 4).with("Name", "D-local"))
            .unwrap();
        let refreshed = loaded(
            "People",
            &[(1, "A2"), (2, "B2"), (3, "C2"), (4, "D2"), (5, "E")],
        );

        merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshPreservingLocalChanges,
            &MergeOptions::new(),
        )
        .unwrap();

        assert_eq!(
            names(&current),
            vec![
                (1, "A2".into()),
                (2, "B-local".into()),
                (3, "C".into()),
                (4, "D-local".into()),
                (5, "E".into()),
            ]
        );
        let states: Vec<RowState> = current.rows().iter().map(Row::state).collect();
        assert_eq!(
            states,
            vec![
                RowState::Unchanged,
                RowState::Modified,
                RowState::Deleted,
                RowState::Added,
                RowState::Unchanged,
            ]
        );
        assert_eq!(current.rows()[1].original("Name"), Some(&Value::from("B")));
    }

    #[test]
    fn duplicate_refreshed_keys_rejected() {
        let mut current = loaded("People", &[(1, "Ann")]);
        let before = current.clone();
        let mut refreshed = schema("People");
        refreshed.rows_mut().push(
            Row::sparse()
                .with("Id", 1)
                .with("Name", "x")
                .with_state(RowState::Unchanged),
        );
        refreshed.rows_mut().push(
            Row::sparse()
                .with("Id", 1)
                .with("Name", "y")
                .with_state(RowState::Unchanged),
        );

        let result = merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshIfNoChangesExist,
            &MergeOptions::new(),
        );
        assert!(matches!(result, Err(Error::DuplicateKey { .. })));
        assert_eq!(current, before);
    }

    #[test]
    fn sparse_refreshed_rows_update_only_their_fields() {
        let mut current = loaded("People", &[(1, "Ann")])
            .with_column(ColumnDef::new("Age", FieldType::Int));
        current.rows_mut()[0].store("Age", Value::from(30));
        let mut refreshed = current.clone();
        refreshed.rows_mut()[0] = Row::sparse()
            .with("Id", 1)
            .with("Age", 31)
            .with_state(RowState::Unchanged);

        let mut recorder = Recorder::default();
        merge_table_in(
            &mut current,
            &refreshed,
            MergeMode::RefreshIfNoChangesExist,
            &MergeOptions::new(),
            &mut recorder,
        )
        .unwrap();

        assert_eq!(current.rows()[0].get("Name"), Some(&Value::from("Ann")));
        assert_eq!(current.rows()[0].get("Age"), Some(&Value::from(31)));
        assert_eq!(
            recorder.0,
            vec![Notification::RowValuesChanged {
                table: "People".into(),
                row: 0,
                columns: vec!["Age".into()],
            }]
        );
    }

    #[test]
    fn update_notifications_are_coalesced() {
        let mut current = loaded("People", &[(1, "Ann")])
            .with_column(ColumnDef::new("Age", FieldType::Int));
        let mut refreshed = current.clone();
        refreshed.rows_mut()[0].store("Name", Value::from("Anne"));
        refreshed.rows_mut()[0].store("Age", Value::from(40));

        let mut recorder = Recorder::default();
        merge_table_in(
            &mut current,
            &refreshed,
            MergeMode::RefreshIfNoChangesExist,
            &MergeOptions::new(),
            &mut recorder,
        )
        .unwrap();

        assert_eq!(recorder.0.len(), 1);
        assert!(matches!(
            &recorder.0[0],
            Notification::RowValuesChanged { columns, .. } if columns.len() == 2
        ));
    }

    fn with_client_keys(table: Table) -> Table {
        let mut table = table;
        table.ensure_client_key_column();
        table
    }

    #[test]
    fn post_save_finalizes_changes() {
        let mut current = with_client_keys(loaded("People", &[(1, "Ann"), (2, "Bob")]));
        current.set_value(0, "Name", "Anna").unwrap();
        current.delete_row(1).unwrap();
        current
            .add_row(Row::sparse().with("Id", -1).with("Name", "New"))
            .unwrap();
        assert_eq!(current.assign_client_keys().unwrap(), 1);

        // Server normalizes a name and assigns a real key
        let mut echoed = current.clone();
        echoed.set_value(0, "Name", "ANNA").unwrap();
        echoed.set_value(2, "Id", 100).unwrap();

        let options = MergeOptions::new().with_client_key_correlation();
        let result = merge_table(&mut current, &echoed, MergeMode::PostSave, &options).unwrap();

        assert_eq!(names(&current), vec![(1, "ANNA".into()), (100, "New".into())]);
        assert!(!current.has_changes());
        assert!(current.rows().iter().all(|r| !r.has_original_values()));
        assert_eq!(result.updated.len(), 2);
        assert_eq!(result.deleted.len(), 1);
        assert!(result.added.is_empty());

        let again = merge_table(&mut current, &echoed, MergeMode::PostSave, &options).unwrap();
        assert!(again.is_empty());
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn post_save_inserts_server_created_rows() {
        let mut current = loaded("People", &[(1, "Ann")]);
        let mut echoed = schema("People");
        echoed
            .add_row(Row::sparse().with("Id", 7).with("Name", "Audit"))
            .unwrap();
        echoed
            .load_row(Row::sparse().with("Id", 8).with("Name", "Gone"))
            .unwrap();
        echoed.set_value(1, "Name", "Changed").unwrap();

        let result =
            merge_table(&mut current, &echoed, MergeMode::PostSave, &MergeOptions::new()).unwrap();

        assert_eq!(names(&current), vec![(1, "Ann".into()), (7, "Audit".into())]);
        assert_eq!(current.rows()[1].state(), RowState::Unchanged);
        assert_eq!(result.added.len(), 1);
    }

    #[test]
    fn post_save_removes_rows_deleted_by_server() {
        let mut current = loaded("People", &[(1, "Ann")]);
        current.set_value(0, "Name", "Anna").unwrap();
        let mut echoed = loaded("People", &[(1, "Ann")]);
        echoed.delete_row(0).unwrap();

        let result =
            merge_table(&mut current, &echoed, MergeMode::PostSave, &MergeOptions::new()).unwrap();
        assert!(current.is_empty());
        assert_eq!(result.deleted.len(), 1);
    }

    #[test]
    fn post_save_client_key_errors() {
        let mut current = loaded("People", &[]);
        current
            .add_row(Row::sparse().with("Id", -1).with("Name", "New"))
            .unwrap();
        let echoed = current.clone();
        let options = MergeOptions::new().with_client_key_correlation();

        let result = merge_table(&mut current, &echoed, MergeMode::PostSave, &options);
        assert_eq!(result, Err(Error::ClientKeyColumnMissing("People".into())));

        current.ensure_client_key_column();
        let mut echoed = current.clone();
        echoed.set_value(0, "Id", 100).unwrap();
        let result = merge_table(&mut current, &echoed, MergeMode::PostSave, &options);
        assert_eq!(
            result,
            Err(Error::MissingClientKey {
                table: "People".into(),
                row: 0
            })
        );
    }

    #[test]
    fn primary_key_override() {
        let mut current = Table::new("Tags").with_column(ColumnDef::new("Code", FieldType::String));
        current.load_row(Row::sparse().with("Code", "a")).unwrap();
        let mut refreshed = current.clone();
        refreshed.load_row(Row::sparse().with("Code", "b")).unwrap();

        let options = MergeOptions::new().with_primary_key("Tags", ["Code"]);
        let result =
            merge_table(&mut current, &refreshed, MergeMode::RefreshIfNoChangesExist, &options)
                .unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(result.added[0].key.as_deref(), Some("1#b"));

        let bad = MergeOptions::new().with_primary_key("Tags", ["Nope"]);
        let result = merge_table(&mut current, &refreshed, MergeMode::Replace, &bad);
        assert!(matches!(result, Err(Error::ColumnNotFound { .. })));
    }

    #[test]
    fn prune_drops_matching_unchanged_rows() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "tmp")]);
        current.set_value(0, "Name", "tmp").unwrap();
        let refreshed = loaded("People", &[(2, "tmp"), (3, "tmp")]);

        let options = MergeOptions::new()
            .with_prune("People", |row| row.get("Name") == Some(&Value::from("tmp")));
        merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshPreservingLocalChanges,
            &options,
        )
        .unwrap();

        // Only the locally modified row survives
        assert_eq!(names(&current), vec![(1, "tmp".into())]);
        assert_eq!(current.rows()[0].state(), RowState::Modified);
    }

    #[test]
    fn prune_does_not_delete_from_excluded_table() {
        let mut current = loaded("People", &[(1, "tmp"), (2, "Bob")]);
        let refreshed = loaded("People", &[(1, "tmp"), (2, "Bob")]);
        let options = MergeOptions::new()
            .exclude_from_deletion("People")
            .with_prune("People", |row| row.get("Name") == Some(&Value::from("tmp")));

        let result = merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshPreservingLocalChanges,
            &options,
        )
        .unwrap();

        assert_eq!(current.len(), 2);
        assert!(result.deleted.is_empty());
    }

    #[test]
    fn post_save_keeps_server_deleted_row_in_excluded_table() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        current.set_value(0, "Name", "Anna").unwrap();
        current.delete_row(1).unwrap();
        let mut echoed = current.clone();
        echoed.delete_row(0).unwrap();
        let options = MergeOptions::new().exclude_from_deletion("People");

        let result = merge_table(&mut current, &echoed, MergeMode::PostSave, &options).unwrap();

        // The local delete is final, the server's delete is not applied
        assert_eq!(names(&current), vec![(1, "Anna".into())]);
        assert_eq!(current.rows()[0].state(), RowState::Unchanged);
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(result.updated.len(), 1);
    }

    #[test]
    fn excluded_table_untouched() {
        let mut current = loaded("People", &[(1, "Ann")]);
        let before = current.clone();
        let refreshed = loaded("People", &[]);
        let options = MergeOptions::new().exclude_table("People");

        let result = merge_table(&mut current, &refreshed, MergeMode::Replace, &options).unwrap();
        assert!(result.is_empty());
        assert_eq!(current, before);
    }

    #[test]
    fn dataset_merge_is_atomic() {
        let mut current = Dataset::new("shop")
            .with_table(loaded("People", &[(1, "Ann")]))
            .with_table(loaded("Pets", &[(1, "Rex")]));
        let before = current.clone();
        let refreshed = Dataset::new("shop")
            .with_table(loaded("People", &[(1, "Anne")]))
            .with_table(
                Table::new("Pets")
                    .with_column(ColumnDef::key("Id", FieldType::String)),
            );

        let result = merge_dataset(&mut current, &refreshed, MergeMode::Replace, &MergeOptions::new());
        assert!(matches!(result, Err(Error::ColumnTypeConflict { .. })));
        assert_eq!(current, before);
    }

    #[test]
    fn dataset_merge_ignores_unknown_tables() {
        let mut current = Dataset::new("shop").with_table(loaded("People", &[(1, "Ann")]));
        let refreshed = Dataset::new("shop")
            .with_table(loaded("People", &[(1, "Anne")]))
            .with_table(loaded("Unknown", &[(1, "x")]));

        let result = merge_dataset(
            &mut current,
            &refreshed,
            MergeMode::RefreshIfNoChangesExist,
            &MergeOptions::new(),
        )
        .unwrap();
        assert_eq!(result.updated.len(), 1);
        assert!(current.table("Unknown").is_none());
    }

    #[test]
    fn merged_rows_are_selected() {
        let mut current = loaded("People", &[(1, "Ann"), (2, "Bob")]);
        current.set_value(1, "Name", "Bobby").unwrap();
        let refreshed = loaded("People", &[(1, "Anne")]);

        merge_table(
            &mut current,
            &refreshed,
            MergeMode::RefreshPreservingLocalChanges,
            &MergeOptions::new(),
        )
        .unwrap();
        assert!(current.rows()[0].is_selected());
        assert!(!current.rows()[1].is_selected());
    }

    #[test]
    fn merge_mode_display() {
        assert_eq!(MergeMode::PostSave.to_string(), "PostSave");
        assert_eq!(
            serde_json::to_string(&MergeMode::RefreshIfNoChangesExist).unwrap(),
            "\"refreshIfNoChangesExist\""
        );
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        fn arb_rows() -> impl Strategy<Value = BTreeMap<i64, String>> {
            prop::collection::btree_map(0i64..40, "[a-z]{0,4}", 0..20)
        }

        fn table_of(rows: &BTreeMap<i64, String>) -> Table {
            let rows: Vec<(i64, &str)> = rows.iter().map(|(k, v)| (*k, v.as_str())).collect();
            loaded("People", &rows)
        }

        proptest! {
            #[test]
            fn prop_refresh_mirrors_server(current in arb_rows(), server in arb_rows()) {
                let mut table = table_of(&current);
                let refreshed = table_of(&server);
                merge_table(
                    &mut table,
                    &refreshed,
                    MergeMode::RefreshIfNoChangesExist,
                    &MergeOptions::new(),
                )
                .unwrap();

                let mut merged: Vec<(i64, String)> = names(&table);
                merged.sort();
                let expected: Vec<(i64, String)> = server.into_iter().collect();
                prop_assert_eq!(merged, expected);
                prop_assert!(!table.has_changes());
            }

            #[test]
            fn prop_merge_twice_is_noop(current in arb_rows(), server in arb_rows()) {
                let refreshed = table_of(&server);
                for mode in [
                    MergeMode::Replace,
                    MergeMode::RefreshIfNoChangesExist,
                    MergeMode::RefreshPreservingLocalChanges,
                ] {
                    let mut table = table_of(&current);
                    merge_table(&mut table, &refreshed, mode, &MergeOptions::new()).unwrap();
                    let snapshot = table.clone();
                    let again = merge_table(&mut table, &refreshed, mode, &MergeOptions::new()).unwrap();
                    prop_assert!(again.is_empty());
                    prop_assert_eq!(&table, &snapshot);
                }
            }

            #[test]
            fn prop_preserving_never_loses_local_edits(
                current in arb_rows(),
                server in arb_rows(),
                edit in 0usize..20,
            ) {
                prop_assume!(!current.is_empty());
                let mut table = table_of(&current);
                let position = edit % table.len();
                table.set_value(position, "Name", "local").unwrap();
                let id = table.rows()[position].get("Id").cloned();

                merge_table(
                    &mut table,
                    &table_of(&server),
                    MergeMode::RefreshPreservingLocalChanges,
                    &MergeOptions::new(),
                )
                .unwrap();

                let kept = table
                    .rows()
                    .iter()
                    .find(|r| r.get("Id").cloned() == id)
                    .unwrap();
                prop_assert_eq!(kept.state(), RowState::Modified);
                prop_assert_eq!(kept.get("Name"), Some(&Value::from("local")));
            }
        }
    }
}

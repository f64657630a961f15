//! Datasets: named tables plus the relations between them.

use crate::{
    error::Result,
    identity,
    notify::{Silent, Sink},
    ChangeSet, Error, Relation, Row, RowState, Table, TableName,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A named collection of tables and relations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    name: String,
    tables: IndexMap<TableName, Table>,
    #[serde(default)]
    relations: Vec<Relation>,
}

impl Dataset {
    /// Create an empty dataset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: IndexMap::new(),
            relations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a table.
    pub fn add_table(&mut self, table: Table) -> Result<&mut Table> {
        if self.tables.contains_key(table.name()) {
            return Err(Error::DuplicateTable(table.name().to_string()));
        }
        let name = table.name().to_string();
        Ok(self.tables.entry(name).or_insert(table))
    }

    /// Builder-style method to add a table. A table with the same name is
    /// replaced.
    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.insert(table.name().to_string(), table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Like [`Dataset::table`], but a missing table is an error.
    pub fn require_table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Like [`Dataset::table_mut`], but a missing table is an error.
    pub fn require_table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Tables in insertion order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Remove a table and every relation that touches it.
    pub fn remove_table(&mut self, name: &str) -> Option<Table> {
        let table = self.tables.shift_remove(name)?;
        self.relations.retain(|r| !r.involves(name));
        Some(table)
    }

    /// Add a relation after checking that both ends exist.
    pub fn add_relation(&mut self, relation: Relation) -> Result<()> {
        let invalid = |reason: String| Error::InvalidRelation {
            name: relation.name.clone(),
            reason,
        };
        if self.relations.iter().any(|r| r.name == relation.name) {
            return Err(invalid("name already in use".into()));
        }
        if relation.parent_columns.is_empty()
            || relation.parent_columns.len() != relation.child_columns.len()
        {
            return Err(invalid("column lists must be non-empty and equally long".into()));
        }
        for (table, columns) in [
            (&relation.parent_table, &relation.parent_columns),
            (&relation.child_table, &relation.child_columns),
        ] {
            let table = self.require_table(table)?;
            if let Some(missing) = columns.iter().find(|c| !table.has_column(c)) {
                return Err(table.column_not_found(missing));
            }
        }
        self.relations.push(relation);
        Ok(())
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Relations where `table` is the parent or the child.
    pub fn relations_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Relation> {
        self.relations.iter().filter(move |r| r.involves(table))
    }

    pub fn has_changes(&self) -> bool {
        self.tables.values().any(Table::has_changes)
    }

    /// Commit all pending changes in every table.
    pub fn accept_changes(&mut self) {
        self.accept_changes_in(&mut Silent)
    }

    /// Revert all pending changes in every table.
    pub fn reject_changes(&mut self) {
        self.reject_changes_in(&mut Silent)
    }

    pub(crate) fn accept_changes_in(&mut self, sink: &mut dyn Sink) {
        for table in self.tables.values_mut() {
            table.accept_changes_in(sink);
        }
    }

    pub(crate) fn reject_changes_in(&mut self, sink: &mut dyn Sink) {
        for table in self.tables.values_mut() {
            table.reject_changes_in(sink);
        }
    }

    /// Copy of this dataset holding only rows with pending changes.
    ///
    /// Rows keep their state and baseline, so the copy can be handed to a
    /// persistence adapter and echoed back for a post-save merge.
    pub fn get_changes(&self) -> Dataset {
        let mut changes = Dataset::new(self.name.clone());
        changes.relations = self.relations.clone();
        for table in self.tables.values() {
            let mut copy = Table::new(table.name());
            for column in table.columns() {
                copy = copy.with_column(column.clone());
            }
            copy.rows_mut().extend(
                table
                    .rows()
                    .iter()
                    .filter(|r| r.state().is_pending())
                    .cloned(),
            );
            changes.tables.insert(table.name().to_string(), copy);
        }
        changes
    }

    /// Field-level view of pending changes.
    pub fn changeset(&self) -> ChangeSet {
        ChangeSet::from_dataset(self)
    }

    /// Check every relation: each live child row with a complete foreign
    /// key must reference a live parent row.
    pub fn check_integrity(&self) -> Result<()> {
        for relation in &self.relations {
            let parent = self.require_table(&relation.parent_table)?;
            let child = self.require_table(&relation.child_table)?;

            let parents: HashSet<String> = parent
                .rows()
                .iter()
                .filter(|r| r.state() != RowState::Deleted)
                .filter_map(|r| identity::primary_key_identity(&relation.parent_columns, r))
                .collect();

            for (position, row) in child.rows().iter().enumerate() {
                if row.state() == RowState::Deleted || has_null(row, &relation.child_columns) {
                    continue;
                }
                let reference = identity::primary_key_identity(&relation.child_columns, row);
                if !reference.is_some_and(|r| parents.contains(&r)) {
                    return Err(Error::IntegrityViolation {
                        relation: relation.name.clone(),
                        detail: format!(
                            "row {} of {} has no parent in {}",
                            position, relation.child_table, relation.parent_table
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn has_null(row: &Row, columns: &[String]) -> bool {
    columns
        .iter()
        .any(|c| row.get(c).map_or(true, |v| v.is_null()))
}

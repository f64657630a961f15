//! Snapshot types for persisting and restoring datasets.
//!
//! A snapshot carries the full dataset: schema, rows with their states and
//! baselines, and relations. Restoring a snapshot therefore restores pending
//! changes too, so an offline session can resume where it stopped.
//!
//! Tables and columns keep their insertion order, which makes serialization
//! deterministic.

use crate::{error::Result, Dataset, Error, RowKind, RowState};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// The captured dataset
    pub dataset: Dataset,
}

impl DatasetSnapshot {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            dataset,
        }
    }

    /// Count rows across all tables.
    pub fn row_count(&self) -> usize {
        self.dataset.tables().map(|t| t.len()).sum()
    }

    /// Count rows with pending changes.
    pub fn pending_count(&self) -> usize {
        self.dataset.tables().map(|t| t.pending_count()).sum()
    }

    /// Check that the captured rows fit their tables.
    ///
    /// Rows must be full, attached, shaped exactly like their table and
    /// type-correct. Relations must point at existing tables and columns.
    pub fn validate(&self) -> Result<()> {
        for table in self.dataset.tables() {
            for (index, row) in table.rows().iter().enumerate() {
                let invalid = |detail: &str| {
                    Error::InvalidSnapshot(format!(
                        "row {} of table '{}': {}",
                        index,
                        table.name(),
                        detail
                    ))
                };
                if row.kind() != RowKind::Full {
                    return Err(invalid("row is sparse"));
                }
                if row.state() == RowState::Detached {
                    return Err(invalid("row is detached"));
                }
                let shaped = row.len() == table.columns().len()
                    && row
                        .columns()
                        .zip(table.columns())
                        .all(|(field, column)| field == column.name);
                if !shaped {
                    return Err(invalid("fields do not match the table columns"));
                }
                for column in table.columns() {
                    if let Some(value) = row.get(&column.name) {
                        column.check_type(value)?;
                    }
                }
            }
        }

        for relation in self.dataset.relations() {
            for (name, columns) in [
                (&relation.parent_table, &relation.parent_columns),
                (&relation.child_table, &relation.child_columns),
            ] {
                let table = self.dataset.table(name).ok_or_else(|| {
                    Error::InvalidSnapshot(format!(
                        "relation '{}' references unknown table '{}'",
                        relation.name, name
                    ))
                })?;
                if let Some(missing) = columns.iter().find(|c| !table.has_column(c)) {
                    return Err(Error::InvalidSnapshot(format!(
                        "relation '{}' references unknown column '{}.{}'",
                        relation.name, name, missing
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate and unwrap the dataset.
    pub fn into_dataset(self) -> Result<Dataset> {
        self.validate()?;
        Ok(self.dataset)
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

impl Dataset {
    /// Capture the dataset, pending changes included.
    pub fn export_snapshot(&self) -> DatasetSnapshot {
        tracing::debug!(dataset = %self.name(), "exporting snapshot");
        DatasetSnapshot::new(self.clone())
    }

    /// Restore a dataset from a snapshot.
    pub fn import_snapshot(snapshot: DatasetSnapshot) -> Result<Dataset> {
        let dataset = snapshot.into_dataset()?;
        tracing::debug!(dataset = %dataset.name(), "imported snapshot");
        Ok(dataset)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Snapshot format version
    pub format_version: u32,
    /// Dataset name
    pub dataset: String,
    pub table_count: usize,
    /// Total row count
    pub row_count: usize,
    /// Rows with pending changes
    pub pending_count: usize,
}

impl From<&DatasetSnapshot> for SnapshotMetadata {
    fn from(snapshot: &DatasetSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            dataset: snapshot.dataset.name().to_string(),
            table_count: snapshot.dataset.tables().count(),
            row_count: snapshot.row_count(),
            pending_count: snapshot.pending_count(),
        }
    }
}

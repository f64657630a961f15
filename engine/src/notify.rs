//! Change notifications.
//!
//! Core mutations report what they did to a [`Sink`]. Plain calls use a
//! silent sink; the observable wrappers in [`crate::observable`] forward to
//! registered [`Observer`]s.

use crate::{ColumnName, RowIndex, RowState, TableName, Value};
use serde::{Deserialize, Serialize};

/// How a table's row collection changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum CollectionChange {
    /// A row was inserted at `index`
    Added { index: RowIndex },
    /// The row at `index` was removed
    Removed { index: RowIndex },
    /// The collection was rebuilt wholesale
    Reset,
}

/// A change notification raised after a successful mutation.
///
/// Row positions are the positions at the time the notification fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// Row added to or removed from a table
    #[serde(rename_all = "camelCase")]
    CollectionChanged {
        table: TableName,
        change: CollectionChange,
    },
    /// A single field write changed a value
    #[serde(rename_all = "camelCase")]
    ValueChanged {
        table: TableName,
        row: RowIndex,
        column: ColumnName,
        old: Value,
        new: Value,
    },
    /// Several fields changed at once (merges, reverts)
    #[serde(rename_all = "camelCase")]
    RowValuesChanged {
        table: TableName,
        row: RowIndex,
        columns: Vec<ColumnName>,
    },
    /// A row moved between edit states
    #[serde(rename_all = "camelCase")]
    RowStateChanged {
        table: TableName,
        row: RowIndex,
        old: RowState,
        new: RowState,
    },
}

impl Notification {
    /// Name of the table the notification refers to.
    pub fn table(&self) -> &str {
        match self {
            Notification::CollectionChanged { table, .. }
            | Notification::ValueChanged { table, .. }
            | Notification::RowValuesChanged { table, .. }
            | Notification::RowStateChanged { table, .. } => table,
        }
    }
}

/// Receives notifications from an observable dataset.
pub trait Observer {
    fn on_notification(&mut self, notification: &Notification);
}

impl<F> Observer for F
where
    F: FnMut(&Notification),
{
    fn on_notification(&mut self, notification: &Notification) {
        self(notification)
    }
}

/// Destination for notifications produced by core mutations.
pub(crate) trait Sink {
    /// Whether anyone listens; lets callers skip building notifications.
    fn is_active(&self) -> bool;

    fn emit(&mut self, notification: Notification);
}

/// Sink that drops everything.
pub(crate) struct Silent;

impl Sink for Silent {
    fn is_active(&self) -> bool {
        false
    }

    fn emit(&mut self, _notification: Notification) {}
}

impl<'s> dyn Sink + 's {
    pub(crate) fn collection_changed(&mut self, table: &str, change: CollectionChange) {
        if self.is_active() {
            self.emit(Notification::CollectionChanged {
                table: table.to_string(),
                change,
            });
        }
    }

    pub(crate) fn value_changed(
        &mut self,
        table: &str,
        row: RowIndex,
        column: &str,
        old: Value,
        new: Value,
    ) {
        if self.is_active() {
            self.emit(Notification::ValueChanged {
                table: table.to_string(),
                row,
                column: column.to_string(),
                old,
                new,
            });
        }
    }

    pub(crate) fn values_changed(&mut self, table: &str, row: RowIndex, columns: Vec<ColumnName>) {
        if self.is_active() && !columns.is_empty() {
            self.emit(Notification::RowValuesChanged {
                table: table.to_string(),
                row,
                columns,
            });
        }
    }

    pub(crate) fn state_changed(&mut self, table: &str, row: RowIndex, old: RowState, new: RowState) {
        if self.is_active() && old != new {
            self.emit(Notification::RowStateChanged {
                table: table.to_string(),
                row,
                old,
                new,
            });
        }
    }
}

/// Sink that records notifications, used in tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct Recorder(pub Vec<Notification>);

#[cfg(test)]
impl Sink for Recorder {
    fn is_active(&self) -> bool {
        true
    }

    fn emit(&mut self, notification: Notification) {
        self.0.push(notification);
    }
}

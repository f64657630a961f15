//! Observable wrappers for data binding.
//!
//! [`ObservableDataset`] borrows a dataset and forwards every change made
//! through it to subscribed [`Observer`]s. Notifications fire after the
//! mutation has fully succeeded; a failed operation reports nothing.
//!
//! The wrapper cannot outlive the dataset it wraps. Mutations made on the
//! dataset directly, outside the wrapper, are not observed.

use crate::{
    error::Result,
    merge::{self, MergeMode, MergeOptions, MergeResult},
    notify::{Notification, Observer, Sink},
    Dataset, Row, RowIndex, RowState, Table, Value,
};
use std::sync::mpsc::Sender;

/// Handle returned by [`ObservableDataset::subscribe`].
pub type SubscriptionId = u64;

/// Registered observers. Acts as the sink for wrapped mutations.
#[derive(Default)]
struct ObserverHub {
    next_id: SubscriptionId,
    observers: Vec<(SubscriptionId, Box<dyn Observer>)>,
}

impl Sink for ObserverHub {
    fn is_active(&self) -> bool {
        !self.observers.is_empty()
    }

    fn emit(&mut self, notification: Notification) {
        for (_, observer) in &mut self.observers {
            observer.on_notification(&notification);
        }
    }
}

/// A view of a dataset whose changes are reported to observers.
pub struct ObservableDataset<'d> {
    dataset: &'d mut Dataset,
    hub: ObserverHub,
}

impl<'d> ObservableDataset<'d> {
    pub fn new(dataset: &'d mut Dataset) -> Self {
        Self {
            dataset,
            hub: ObserverHub::default(),
        }
    }

    /// Read access to the wrapped dataset.
    pub fn dataset(&self) -> &Dataset {
        &*self.dataset
    }

    /// Register an observer.
    pub fn subscribe(&mut self, observer: impl Observer + 'static) -> SubscriptionId {
        self.hub.next_id += 1;
        let id = self.hub.next_id;
        self.hub.observers.push((id, Box::new(observer)));
        id
    }

    /// Forward notifications into a channel. Once the receiver is gone,
    /// notifications are dropped.
    pub fn subscribe_channel(&mut self, sender: Sender<Notification>) -> SubscriptionId {
        self.subscribe(move |notification: &Notification| {
            if sender.send(notification.clone()).is_err() {
                tracing::trace!("notification receiver dropped");
            }
        })
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.hub.observers.len();
        self.hub.observers.retain(|(registered, _)| *registered != id);
        self.hub.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.hub.observers.len()
    }

    /// Observed access to one table.
    pub fn table(&mut self, name: &str) -> Result<ObservableTable<'_>> {
        let table = self.dataset.require_table_mut(name)?;
        Ok(ObservableTable {
            table,
            sink: &mut self.hub,
        })
    }

    pub fn accept_changes(&mut self) {
        self.dataset.accept_changes_in(&mut self.hub)
    }

    pub fn reject_changes(&mut self) {
        self.dataset.reject_changes_in(&mut self.hub)
    }

    /// Merge a refreshed dataset, see [`merge::merge_dataset`].
    pub fn merge(
        &mut self,
        refreshed: &Dataset,
        mode: MergeMode,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        merge::merge_dataset_in(&mut *self.dataset, refreshed, mode, options, &mut self.hub)
    }

    /// Merge a refreshed table into the table of the same name.
    pub fn merge_table(
        &mut self,
        refreshed: &Table,
        mode: MergeMode,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let current = self.dataset.require_table_mut(refreshed.name())?;
        merge::merge_table_in(current, refreshed, mode, options, &mut self.hub)
    }
}

impl std::fmt::Debug for ObservableDataset<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableDataset")
            .field("dataset", &self.dataset)
            .field("observers", &self.hub.observers.len())
            .finish()
    }
}

/// Observed access to one table of an [`ObservableDataset`].
pub struct ObservableTable<'a> {
    table: &'a mut Table,
    sink: &'a mut ObserverHub,
}

impl ObservableTable<'_> {
    /// Read access to the table.
    pub fn table(&self) -> &Table {
        &*self.table
    }

    pub fn add_row(&mut self, row: Row) -> Result<RowIndex> {
        self.table.add_row_in(row, &mut *self.sink)
    }

    pub fn load_row(&mut self, row: Row) -> Result<RowIndex> {
        self.table.load_row_in(row, &mut *self.sink)
    }

    pub fn set_value(
        &mut self,
        index: RowIndex,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<bool> {
        self.table.set_value_in(index, column, value.into(), &mut *self.sink)
    }

    pub fn delete_row(&mut self, index: RowIndex) -> Result<()> {
        self.table.delete_row_in(index, &mut *self.sink)
    }

    pub fn accept_row(&mut self, index: RowIndex) -> Result<()> {
        self.table.accept_row_in(index, &mut *self.sink)
    }

    pub fn reject_row(&mut self, index: RowIndex) -> Result<()> {
        self.table.reject_row_in(index, &mut *self.sink)
    }

    pub fn accept_changes(&mut self) {
        self.table.accept_changes_in(&mut *self.sink)
    }

    pub fn reject_changes(&mut self) {
        self.table.reject_changes_in(&mut *self.sink)
    }

    pub fn clear(&mut self) {
        self.table.clear_in(&mut *self.sink)
    }

    pub fn detach_row(&mut self, index: RowIndex) -> Result<Row> {
        self.table.detach_row_in(index, &mut *self.sink)
    }

    /// Observed access to one row.
    pub fn row(&mut self, index: RowIndex) -> Option<ObservableRow<'_>> {
        if index >= self.table.len() {
            return None;
        }
        Some(ObservableRow {
            table: &mut *self.table,
            index,
            sink: &mut *self.sink,
        })
    }
}

/// Observed access to one row of an [`ObservableTable`].
pub struct ObservableRow<'a> {
    table: &'a mut Table,
    index: RowIndex,
    sink: &'a mut ObserverHub,
}

impl ObservableRow<'_> {
    pub fn index(&self) -> RowIndex {
        self.index
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.table.row(self.index)?.get(column)
    }

    pub fn state(&self) -> RowState {
        self.table
            .row(self.index)
            .map_or(RowState::Detached, Row::state)
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<bool> {
        self.table
            .set_value_in(self.index, column, value.into(), &mut *self.sink)
    }

    /// Delete the row; an added row is removed from its table.
    pub fn delete(self) -> Result<()> {
        self.table.delete_row_in(self.index, &mut *self.sink)
    }

    /// Commit the row; a deleted row is removed from its table.
    pub fn accept(self) -> Result<()> {
        self.table.accept_row_in(self.index, &mut *self.sink)
    }

    /// Revert the row; an added row is removed from its table.
    pub fn revert(self) -> Result<()> {
        self.table.reject_row_in(self.index, &mut *self.sink)
    }
}

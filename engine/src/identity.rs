//! Row identity resolution.
//!
//! Rows are correlated across datasets by a canonical string built from
//! their primary key values. Each key value is written as
//! `<char-length>#<invariant-text>` and the parts are joined with `|`, so
//! `("1", "23")` and `("12", "3")` never collide.
//!
//! Rows that the server has not seen yet are correlated by the reserved
//! client key column instead.

use crate::{error::Result, ColumnName, Error, Fields, Row, RowIndex, Value, CLIENT_KEY_COLUMN};
use std::collections::HashMap;

/// Canonical identity of `row` under the key columns `keys`.
///
/// Returns `None` when there are no key columns or when the row lacks one of
/// them. A null key value is usable and renders as `0#`.
pub fn primary_key_identity<S: AsRef<str>>(keys: &[S], row: &Row) -> Option<String> {
    fields_identity(keys, row.fields())
}

/// Identity of a bare field map, such as a row's original values.
pub fn fields_identity<S: AsRef<str>>(keys: &[S], fields: &Fields) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let mut identity = String::new();
    for (i, key) in keys.iter().enumerate() {
        let value = fields.get(key.as_ref())?;
        if i > 0 {
            identity.push('|');
        }
        push_token(&mut identity, value);
    }
    Some(identity)
}

fn push_token(out: &mut String, value: &Value) {
    let text = value.to_invariant_string();
    out.push_str(&text.chars().count().to_string());
    out.push('#');
    out.push_str(&text);
}

/// Client correlation key of `row`.
///
/// Returns `None` when the column is absent, null, or empty text.
pub fn client_key_identity(row: &Row) -> Option<String> {
    match row.get(CLIENT_KEY_COLUMN)? {
        Value::Null => None,
        Value::Text(s) if s.is_empty() => None,
        other => Some(other.to_invariant_string()),
    }
}

/// Identity to row position lookup with duplicate detection.
#[derive(Debug, Default)]
pub struct KeyIndex {
    positions: HashMap<String, RowIndex>,
}

impl KeyIndex {
    /// Index rows by primary key.
    ///
    /// Every row must resolve to an identity and identities must be unique.
    pub fn by_primary_key<'r>(
        table: &str,
        keys: &[ColumnName],
        rows: impl IntoIterator<Item = (RowIndex, &'r Row)>,
    ) -> Result<Self> {
        let mut index = Self::default();
        for (position, row) in rows {
            let identity = primary_key_identity(keys, row).ok_or_else(|| Error::MissingKey {
                table: table.to_string(),
                row: position,
            })?;
            index.insert(table, identity, position)?;
        }
        Ok(index)
    }

    /// Index rows by client key. Rows without one are skipped.
    pub fn by_client_key<'r>(
        table: &str,
        rows: impl IntoIterator<Item = (RowIndex, &'r Row)>,
    ) -> Result<Self> {
        let mut index = Self::default();
        for (position, row) in rows {
            if let Some(identity) = client_key_identity(row) {
                index.insert(table, identity, position)?;
            }
        }
        Ok(index)
    }

    fn insert(&mut self, table: &str, identity: String, position: RowIndex) -> Result<()> {
        if self.positions.contains_key(&identity) {
            return Err(Error::DuplicateKey {
                table: table.to_string(),
                key: identity,
            });
        }
        self.positions.insert(identity, position);
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<RowIndex> {
        self.positions.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

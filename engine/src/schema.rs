//! Schema definition and validation.
//!
//! Column and relation metadata describe the shape of tables. They carry no
//! behavior beyond the validation helpers used when writing values.

use crate::{error::Result, ColumnName, Error, TableName, Value};
use serde::{Deserialize, Serialize};

/// Name of the reserved client-only correlation column.
///
/// Holds a GUID generated on the client so that a locally added row can be
/// matched with its server-assigned counterpart after a save. It is never
/// persisted to a backing store.
pub const CLIENT_KEY_COLUMN: &str = "__client_key";

/// Logical type tags supported by columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Bytes,
    Guid,
    Timestamp,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Bytes => write!(f, "Bytes"),
            FieldType::Guid => write!(f, "Guid"),
            FieldType::Timestamp => write!(f, "Timestamp"),
        }
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column name
    pub name: ColumnName,
    /// Column type
    pub field_type: FieldType,
    /// Whether null is accepted
    pub nullable: bool,
    /// Primary key membership; the table's key list is derived from this flag
    pub is_primary_key: bool,
    /// Whether this column references another table
    pub is_foreign_key: bool,
    /// Referenced table, for foreign keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_table: Option<TableName>,
    /// Referenced column, for foreign keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_column: Option<ColumnName>,
    /// Display caption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Display description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnDef {
    /// Create a new nullable, non-key column.
    pub fn new(name: impl Into<ColumnName>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            is_primary_key: false,
            is_foreign_key: false,
            referenced_table: None,
            referenced_column: None,
            caption: None,
            description: None,
        }
    }

    /// Create a non-nullable primary key column.
    pub fn key(name: impl Into<ColumnName>, field_type: FieldType) -> Self {
        Self {
            nullable: false,
            is_primary_key: true,
            ..Self::new(name, field_type)
        }
    }

    /// The reserved client correlation column.
    pub fn client_key() -> Self {
        Self::new(CLIENT_KEY_COLUMN, FieldType::Guid)
    }

    /// Builder-style: reject nulls.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Builder-style: mark as a foreign key to `table.column`.
    pub fn references(mut self, table: impl Into<TableName>, column: impl Into<ColumnName>) -> Self {
        self.is_foreign_key = true;
        self.referenced_table = Some(table.into());
        self.referenced_column = Some(column.into());
        self
    }

    /// Builder-style: set the display caption.
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Builder-style: set the display description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this is the reserved client correlation column.
    pub fn is_client_key(&self) -> bool {
        self.name == CLIENT_KEY_COLUMN
    }

    /// Check that a value's type matches this column. Null always passes.
    pub fn check_type(&self, value: &Value) -> Result<()> {
        match value.field_type() {
            None => Ok(()),
            Some(t) if t == self.field_type => Ok(()),
            Some(_) => Err(Error::TypeMismatch {
                column: self.name.clone(),
                expected: self.field_type.to_string(),
                got: value.type_name().to_string(),
            }),
        }
    }

    /// Validate a field against this column definition.
    ///
    /// An absent field counts as null.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if !self.nullable => {
                Err(Error::NullViolation(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.check_type(v),
        }
    }
}

/// A declarative foreign key edge between two tables.
///
/// Relations are only checked on request, see [`crate::Dataset::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Relation name
    pub name: String,
    /// Referenced (parent) table
    pub parent_table: TableName,
    /// Referenced columns in the parent table
    pub parent_columns: Vec<ColumnName>,
    /// Referencing (child) table
    pub child_table: TableName,
    /// Referencing columns in the child table
    pub child_columns: Vec<ColumnName>,
}

impl Relation {
    /// Create a new relation.
    pub fn new<P, C>(
        name: impl Into<String>,
        parent_table: impl Into<TableName>,
        parent_columns: P,
        child_table: impl Into<TableName>,
        child_columns: C,
    ) -> Self
    where
        P: IntoIterator,
        P::Item: Into<ColumnName>,
        C: IntoIterator,
        C::Item: Into<ColumnName>,
    {
        Self {
            name: name.into(),
            parent_table: parent_table.into(),
            parent_columns: parent_columns.into_iter().map(Into::into).collect(),
            child_table: child_table.into(),
            child_columns: child_columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the relation touches the given table on either side.
    pub fn involves(&self, table: &str) -> bool {
        self.parent_table == table || self.child_table == table
    }
}

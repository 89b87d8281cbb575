//! Table rows and primary-key schemas.

use crate::error::{ProtocolError, ProtocolResult};
use crate::identity::{generate_id, RowId};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A row type that can be mirrored.
///
/// Implement this for a statically typed row struct to mirror it directly;
/// [`Row`] is the dynamic implementation used when the shape is only known
/// at runtime.
pub trait TableRow: Clone + Send + Sync + 'static {
    /// Returns the value of `name`, or `None` if the row has no such column.
    fn column(&self, name: &str) -> Option<Value>;
}

/// A dynamically shaped row: column name to scalar value.
///
/// Columns are kept sorted by name, so two rows built from the same fields
/// in different orders compare equal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    fields: BTreeMap<String, Value>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a row from column/value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Sets a column and returns the row.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a column, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Gets a column value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Iterates over columns in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl TableRow for Row {
    fn column(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }
}

/// Column/value pairs that select one row by primary key.
///
/// This is what a remote delete is matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMatch {
    /// Key columns in schema order.
    pub columns: Vec<(String, Value)>,
}

impl KeyMatch {
    /// Returns true if `row` carries the same key values.
    pub fn matches<R: TableRow>(&self, row: &R) -> bool {
        self.columns.iter().all(|(name, expected)| {
            row.column(name)
                .unwrap_or(Value::Null)
                .loosely_equals(expected)
        })
    }
}

/// The ordered primary-key columns of a table.
///
/// A schema is built once per table and shared by reference between the
/// table and its cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    columns: Vec<String>,
}

impl KeySchema {
    /// Creates a key schema.
    ///
    /// # Errors
    ///
    /// Returns an error if no columns are given or a column repeats.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> ProtocolResult<Self> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(ProtocolError::InvalidKeySchema(
                "at least one key column is required".into(),
            ));
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].contains(column) {
                return Err(ProtocolError::InvalidKeySchema(format!(
                    "duplicate key column {column:?}"
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Returns the key columns in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Derives the identity of `row`.
    pub fn identity<R: TableRow>(&self, row: &R) -> RowId {
        generate_id(row, self)
    }

    /// Builds the key match that selects `row` remotely.
    pub fn matcher<R: TableRow>(&self, row: &R) -> KeyMatch {
        KeyMatch {
            columns: self
                .columns
                .iter()
                .map(|c| (c.clone(), row.column(c).unwrap_or(Value::Null)))
                .collect(),
        }
    }
}

//! A module containing types related to the decoded binlog stream.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Represents the kind of row change carried by a rows event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Action::Insert),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(SyncError::MalformedEvent(format!(
                "unknown row action `{other}`"
            ))),
        }
    }
}

/// A single column value as decoded from a rows event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Reads the value as an unsigned 32-bit integer.
    /// Textual values are parsed, which is how status result sets
    /// usually deliver numeric columns.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Int(x) => u32::try_from(*x).ok(),
            Value::UInt(x) => u32::try_from(*x).ok(),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(x) => write!(f, "{x}"),
            Value::UInt(x) => write!(f, "{x}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// One row-value tuple, ordered like the columns of the table schema.
pub type Row = Vec<Value>;

/// Read-only description of the table a rows event belongs to.
/// Shared between every handler invoked for the event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableSchema {
        TableSchema {
            schema: schema.into(),
            name: name.into(),
            columns: vec![],
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> TableSchema
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the index of the column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// `schema.table`, or just the table name when the schema is unknown.
    pub fn qualified_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

/// A decoded row change event.
/// For [`Action::Update`] the rows come in `[before, after]` pairs.
#[derive(Clone, Debug, PartialEq)]
pub struct RowsEvent {
    action: Action,
    table: Arc<TableSchema>,
    rows: Vec<Row>,
}

impl RowsEvent {
    pub fn new(
        action: Action,
        table: Arc<TableSchema>,
        rows: Vec<Row>,
    ) -> Result<RowsEvent, SyncError> {
        if action == Action::Update && rows.len() % 2 != 0 {
            return Err(SyncError::MalformedEvent(format!(
                "update event for table `{}` carries {} rows, expected before/after pairs",
                table.name,
                rows.len()
            )));
        }

        Ok(RowsEvent {
            action,
            table,
            rows,
        })
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn table(&self) -> &Arc<TableSchema> {
        &self.table
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Iterates over `(before, after)` pairs of an update event.
    /// Yields nothing for inserts and deletes.
    pub fn update_pairs(&self) -> impl Iterator<Item = (&Row, &Row)> {
        let rows: &[Row] = match self.action {
            Action::Update => &self.rows,
            _ => &[],
        };
        rows.chunks_exact(2).map(|pair| (&pair[0], &pair[1]))
    }
}

/// An item yielded by a binlog subscription, in log order.
#[derive(Clone, Debug, PartialEq)]
pub enum BinlogEvent {
    /// A row change. `log_pos` is the offset right after the event
    /// within the current log file.
    Rows { event: RowsEvent, log_pos: u32 },
    /// The upstream switched to a new log file.
    Rotate { next_name: String, offset: u32 },
}

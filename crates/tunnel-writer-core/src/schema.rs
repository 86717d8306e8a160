//! Table metadata and row representation.

use crate::partition::PartitionSpec;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical column type of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bigint,
    Double,
    Boolean,
    String,
    Datetime,
    Decimal,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Bigint => "bigint",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
            ColumnType::Datetime => "datetime",
            ColumnType::Decimal => "decimal",
        }
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bigint" => Ok(ColumnType::Bigint),
            "double" => Ok(ColumnType::Double),
            "boolean" => Ok(ColumnType::Boolean),
            "string" => Ok(ColumnType::String),
            "datetime" => Ok(ColumnType::Datetime),
            "decimal" => Ok(ColumnType::Decimal),
            other => Err(Error::Config(format!("Unsupported column type: [{}]", other))),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Schema and kind of a remote table, fetched once before writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    /// Project (catalog) the table lives in
    pub project: String,
    /// Table name
    pub name: String,
    /// Data columns in physical order
    pub columns: Vec<Column>,
    /// Partition key column names in order
    pub partition_keys: Vec<String>,
    /// Whether the table is a view backed by a query
    pub is_virtual_view: bool,
}

impl TableDescriptor {
    pub fn is_partitioned(&self) -> bool {
        !self.partition_keys.is_empty()
    }

    /// Column names in physical order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.project, self.name)
    }
}

/// A single cell of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bigint(i64),
    Double(f64),
    Boolean(bool),
    String(String),
    Datetime(DateTime<Utc>),
    /// Decimal kept in its textual form
    Decimal(String),
}

impl Value {
    /// Whether the value can be stored in a column of the given type.
    /// `Null` fits every column.
    pub fn fits(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::Null, _)
                | (Value::Bigint(_), ColumnType::Bigint)
                | (Value::Double(_), ColumnType::Double)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::String(_), ColumnType::String)
                | (Value::Datetime(_), ColumnType::Datetime)
                | (Value::Decimal(_), ColumnType::Decimal)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bigint(_) => "bigint",
            Value::Double(_) => "double",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::Datetime(_) => "datetime",
            Value::Decimal(_) => "decimal",
        }
    }
}

/// A row of cells.
pub type Record = Vec<Value>;

/// Coordinate an upload session is bound to.
///
/// Slave sessions must present exactly the coordinate the master session was
/// created with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadTarget {
    pub project: String,
    pub table: String,
    pub partition: Option<PartitionSpec>,
}

impl UploadTarget {
    pub fn new(
        project: impl Into<String>,
        table: impl Into<String>,
        partition: Option<PartitionSpec>,
    ) -> Self {
        Self {
            project: project.into(),
            table: table.into(),
            partition,
        }
    }
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition {
            Some(partition) => write!(
                f,
                "table [{}.{}] partition [{}]",
                self.project, self.table, partition
            ),
            None => write!(f, "table [{}.{}]", self.project, self.table),
        }
    }
}

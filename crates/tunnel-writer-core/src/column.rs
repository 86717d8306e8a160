//! Mapping of configured column names onto physical column positions.

use crate::config::ColumnResolutionMode;
use crate::{Error, Result};
use std::collections::HashSet;
use tracing::warn;

/// Outcome of resolving configured column names against a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnResolution {
    /// Physical index of each resolved column, in request order
    pub positions: Vec<usize>,
    /// Requested names with no matching column, in request order
    pub unresolved: Vec<String>,
}

impl ColumnResolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Positions, or an error naming every unresolved column.
    pub fn into_strict(self, table: &str) -> Result<Vec<usize>> {
        if self.unresolved.is_empty() {
            Ok(self.positions)
        } else {
            Err(Error::UnresolvedColumns {
                table: table.to_string(),
                columns: self.unresolved,
            })
        }
    }

    /// Positions, dropping unresolved columns with a warning.
    pub fn into_lenient(self, table: &str) -> Vec<usize> {
        if !self.unresolved.is_empty() {
            warn!(
                table = %table,
                columns = ?self.unresolved,
                "Configured columns not found in table, ignoring them"
            );
        }
        self.positions
    }

    pub fn into_positions(self, table: &str, mode: ColumnResolutionMode) -> Result<Vec<usize>> {
        match mode {
            ColumnResolutionMode::Strict => self.into_strict(table),
            ColumnResolutionMode::Lenient => Ok(self.into_lenient(table)),
        }
    }
}

/// Find each requested column's first case-insensitive match in `all`.
pub fn resolve_positions<S: AsRef<str>, T: AsRef<str>>(
    user_columns: &[S],
    all_columns: &[T],
) -> ColumnResolution {
    let mut positions = Vec::with_capacity(user_columns.len());
    let mut unresolved = Vec::new();

    for column in user_columns {
        let column = column.as_ref();
        match all_columns
            .iter()
            .position(|c| c.as_ref().eq_ignore_ascii_case(column))
        {
            Some(index) => positions.push(index),
            None => unresolved.push(column.to_string()),
        }
    }

    ColumnResolution {
        positions,
        unresolved,
    }
}

/// Expand `["*"]` to every table column and reject duplicates.
pub fn expand_user_columns<S: AsRef<str>>(
    user_columns: &[S],
    all_columns: &[String],
) -> Result<Vec<String>> {
    if user_columns.len() == 1 && user_columns[0].as_ref().trim() == "*" {
        return Ok(all_columns.to_vec());
    }

    let mut seen = HashSet::new();
    let mut columns = Vec::with_capacity(user_columns.len());
    for column in user_columns {
        let column = column.as_ref().trim();
        if column == "*" {
            return Err(Error::Config(
                "`*` cannot be combined with named columns".into(),
            ));
        }
        if !seen.insert(column.to_ascii_lowercase()) {
            return Err(Error::Config(format!(
                "Column [{}] is configured more than once",
                column
            )));
        }
        columns.push(column.to_string());
    }
    Ok(columns)
}

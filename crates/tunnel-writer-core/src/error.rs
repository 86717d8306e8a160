//! Error types for the tunnel writer.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern:
//! remote collaborators report [`ServiceError`], and every writer stage wraps
//! it into a top-level [`Error`] variant that names the operation and target.

use thiserror::Error;

/// Result type alias for writer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the tunnel writer.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid required setting
    #[error("Configuration error: {0}")]
    Config(String),

    /// Account type tag is not one of the supported signing schemes
    #[error("Unsupported account type: [{0}]")]
    UnsupportedAccountType(String),

    /// Target table is a virtual view and cannot accept direct writes
    #[error("Table [{table}] is a virtual view and does not accept writes")]
    UnsupportedTableKind { table: String },

    /// Table lookup failed
    #[error("Failed to resolve table [{table}]: {source}")]
    Catalog {
        table: String,
        #[source]
        source: ServiceError,
    },

    /// Partition listing failed after retries
    #[error("Failed to list partitions of table [{table}] after {attempts} attempt(s): {source}")]
    PartitionList {
        table: String,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    /// Partition creation failed
    #[error("Failed to create partition [{partition}] in table [{table}]: {source}")]
    CreatePartition {
        table: String,
        partition: String,
        #[source]
        source: ServiceError,
    },

    /// Partition deletion failed
    #[error("Failed to delete partition [{partition}] in table [{table}]: {source}")]
    DeletePartition {
        table: String,
        partition: String,
        #[source]
        source: ServiceError,
    },

    /// Table truncation failed
    #[error("Failed to truncate table, SQL [{sql}]: {source}")]
    Truncate {
        sql: String,
        #[source]
        source: ServiceError,
    },

    /// Master upload session could not be created
    #[error("Failed to create upload session for {target}: {message}")]
    MasterSession {
        target: String,
        message: String,
        #[source]
        source: Option<ServiceError>,
    },

    /// Slave upload session could not be attached
    #[error("Failed to attach upload session [{session_id}] for {target}: {message}")]
    SlaveSession {
        session_id: String,
        target: String,
        message: String,
        #[source]
        source: Option<ServiceError>,
    },

    /// Block write or close failed
    #[error("Block {block} of session [{session_id}] failed: {message}")]
    Block {
        session_id: String,
        block: u64,
        message: String,
        #[source]
        source: Option<ServiceError>,
    },

    /// Session commit failed
    #[error("Failed to commit session [{session_id}]: {message}")]
    Commit {
        session_id: String,
        message: String,
        #[source]
        source: Option<ServiceError>,
    },

    /// Commit was withheld because not every task succeeded
    #[error("Session [{session_id}] aborted, failed tasks: {failed_tasks:?}")]
    Aborted {
        session_id: String,
        failed_tasks: Vec<usize>,
    },

    /// A task ended without reporting an outcome
    #[error("Task {task_id} did not report: {message}")]
    TaskLost { task_id: usize, message: String },

    /// Requested columns not present in the table
    #[error("Columns {columns:?} do not exist in table [{table}]")]
    UnresolvedColumns { table: String, columns: Vec<String> },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Classification of a failure reported by a remote collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// Connection reset, DNS failure and similar
    Transport,
    /// Request exceeded its deadline
    Timeout,
    /// Service asked the caller to slow down
    Throttled,
    /// Object does not exist
    NotFound,
    /// Object already exists
    AlreadyExists,
    /// Request violated the service protocol
    Rejected,
    /// Unclassified service-side failure
    Internal,
}

/// Failure reported by the catalog, SQL or tunnel service.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Transport, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Rejected, message)
    }

    /// Whether the failure is worth retrying.
    ///
    /// Only transport-level failures are whitelisted.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::Transport | ServiceErrorKind::Timeout | ServiceErrorKind::Throttled
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("table is required".into());
        assert_eq!(err.to_string(), "Configuration error: table is required");

        let err = Error::DeletePartition {
            table: "orders".into(),
            partition: "pt=1".into(),
            source: ServiceError::transport("connection reset"),
        };
        assert!(err.to_string().contains("pt=1"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_transient_whitelist() {
        assert!(ServiceError::transport("reset").is_transient());
        assert!(ServiceError::new(ServiceErrorKind::Timeout, "slow").is_transient());
        assert!(ServiceError::new(ServiceErrorKind::Throttled, "busy").is_transient());
        assert!(!ServiceError::not_found("no table").is_transient());
        assert!(!ServiceError::rejected("bad block").is_transient());
        assert!(!ServiceError::new(ServiceErrorKind::Internal, "oops").is_transient());
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error as _;

        let err = Error::Catalog {
            table: "t".into(),
            source: ServiceError::not_found("table t"),
        };
        let source = err.source().unwrap();
        assert!(source.to_string().contains("table t"));
    }
}

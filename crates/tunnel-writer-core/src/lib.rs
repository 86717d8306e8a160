//! Tunnel Writer Core - partitioned bulk upload through upload sessions
//!
//! This library loads rows into a remote columnar table through a
//! session-based bulk upload service:
//!
//! - One master upload session per job, re-attached by id from every task
//! - Disjoint block id ranges per task, committed together or not at all
//! - Partition creation and truncation ahead of the upload
//! - Bounded exponential-backoff retry for setup-phase metadata calls
//! - Case-insensitive mapping of configured columns onto table positions
//!
//! Remote collaborators are reached through the traits in [`service`];
//! [`service::memory::MemoryService`] implements all of them in process.

pub mod column;
pub mod config;
pub mod connection;
pub mod error;
pub mod job;
pub mod metadata;
pub mod partition;
pub mod retry;
pub mod schema;
pub mod service;
pub mod session;
pub mod task;

// Re-export commonly used types
pub use config::WriterConfig;
pub use connection::Connection;
pub use error::{Error, Result, ServiceError, ServiceErrorKind};
pub use job::WriterJob;
pub use partition::PartitionSpec;
pub use schema::{Record, UploadTarget, Value};
pub use session::{CommitSummary, SessionState, UploadCoordinator};

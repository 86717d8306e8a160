//! Remote collaborators the writer drives.
//!
//! The catalog, SQL and tunnel services are external state. The writer only
//! talks to them through these traits, so a deployment plugs in a real client
//! and tests plug in [`memory::MemoryService`].

pub mod memory;

use crate::connection::Connection;
use crate::error::ServiceError;
use crate::partition::PartitionSpec;
use crate::schema::{Record, TableDescriptor, UploadTarget};
use async_trait::async_trait;
use std::sync::Arc;

/// Result type for remote calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Block identifier inside one upload session.
pub type BlockId = u64;

/// Table and partition metadata operations.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Fetch the table schema and kind.
    async fn get_table(
        &self,
        conn: &Connection,
        project: &str,
        table: &str,
    ) -> ServiceResult<TableDescriptor>;

    /// List every existing partition of a table.
    async fn list_partitions(
        &self,
        conn: &Connection,
        table: &TableDescriptor,
    ) -> ServiceResult<Vec<PartitionSpec>>;

    /// Create a partition.
    async fn create_partition(
        &self,
        conn: &Connection,
        table: &TableDescriptor,
        spec: &PartitionSpec,
    ) -> ServiceResult<()>;

    /// Delete a partition and its data.
    async fn delete_partition(
        &self,
        conn: &Connection,
        table: &TableDescriptor,
        spec: &PartitionSpec,
    ) -> ServiceResult<()>;
}

/// Synchronous SQL execution: returns once the statement has finished.
#[async_trait]
pub trait SqlService: Send + Sync {
    async fn run_statement(&self, conn: &Connection, sql: &str) -> ServiceResult<()>;
}

/// Upload session factory.
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Open a fresh session scoped to the target.
    async fn create_upload_session(
        &self,
        conn: &Connection,
        target: &UploadTarget,
    ) -> ServiceResult<Arc<dyn UploadSession>>;

    /// Re-attach to an existing session by id. The target must equal the one
    /// used at creation.
    async fn get_upload_session(
        &self,
        conn: &Connection,
        target: &UploadTarget,
        session_id: &str,
    ) -> ServiceResult<Arc<dyn UploadSession>>;
}

/// Handle to an in-flight upload transaction.
#[async_trait]
pub trait UploadSession: Send + Sync {
    /// Session id assigned by the service.
    fn id(&self) -> &str;

    /// Coordinate the session is bound to.
    fn target(&self) -> &UploadTarget;

    /// Open a writer for one block. Reusing a block id is a protocol
    /// violation reported by the service.
    async fn open_block(&self, block: BlockId) -> ServiceResult<Box<dyn BlockWriter>>;

    /// Blocks closed so far under this session, across all attached handles.
    async fn block_list(&self) -> ServiceResult<Vec<BlockId>>;

    /// Make the given blocks visible atomically.
    async fn commit(&self, blocks: &[BlockId]) -> ServiceResult<()>;
}

/// Streams the rows of one block.
#[async_trait]
pub trait BlockWriter: Send {
    async fn write(&mut self, record: Record) -> ServiceResult<()>;

    /// Flush buffered rows and register the block with its session. The
    /// writer accepts no further rows afterwards.
    async fn close(&mut self) -> ServiceResult<()>;
}

/// The three services a job needs, bundled for passing around.
#[derive(Clone)]
pub struct ServiceHandles {
    pub catalog: Arc<dyn CatalogService>,
    pub sql: Arc<dyn SqlService>,
    pub tunnel: Arc<dyn TunnelService>,
}

impl ServiceHandles {
    pub fn new(
        catalog: Arc<dyn CatalogService>,
        sql: Arc<dyn SqlService>,
        tunnel: Arc<dyn TunnelService>,
    ) -> Self {
        Self {
            catalog,
            sql,
            tunnel,
        }
    }

    /// Use one object for all three services.
    pub fn from_shared<S>(service: Arc<S>) -> Self
    where
        S: CatalogService + SqlService + TunnelService + 'static,
    {
        Self {
            catalog: service.clone(),
            sql: service.clone(),
            tunnel: service,
        }
    }
}

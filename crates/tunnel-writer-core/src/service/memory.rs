//! In-memory implementation of the catalog, SQL and tunnel services.
//!
//! Enforces the same protocol rules the remote service does (session targets
//! must match on re-attach, block ids are single-use, only closed blocks can
//! be committed, commit happens once) and keeps an ordered log of every call
//! so callers can assert on ordering. Failures can be scripted per operation.

use super::{
    BlockId, BlockWriter, CatalogService, ServiceResult, SqlService, TunnelService, UploadSession,
};
use crate::connection::Connection;
use crate::error::{ServiceError, ServiceErrorKind};
use crate::partition::PartitionSpec;
use crate::schema::{Record, TableDescriptor, UploadTarget};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Remote operations the service records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceOp {
    GetTable,
    ListPartitions,
    CreatePartition,
    DeletePartition,
    RunStatement,
    CreateUploadSession,
    GetUploadSession,
    OpenBlock,
    CloseBlock,
    Commit,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    pub op: ServiceOp,
    pub detail: String,
}

#[derive(Debug)]
struct ScriptedFailure {
    remaining: u32,
    kind: ServiceErrorKind,
}

struct MemoryTable {
    descriptor: TableDescriptor,
    partitions: BTreeSet<PartitionSpec>,
    rows: HashMap<Option<PartitionSpec>, Vec<Record>>,
}

struct SessionShared {
    id: String,
    target: UploadTarget,
    state: Mutex<SessionData>,
}

#[derive(Default)]
struct SessionData {
    open_blocks: HashSet<BlockId>,
    closed_blocks: BTreeMap<BlockId, Vec<u8>>,
    committed: bool,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<(String, String), MemoryTable>>,
    sessions: Mutex<HashMap<String, Arc<SessionShared>>>,
    calls: Mutex<Vec<ServiceCall>>,
    failures: Mutex<HashMap<ServiceOp, ScriptedFailure>>,
}

impl Inner {
    /// Record the call, then fail it if a failure is scripted for the op.
    fn enter(&self, op: ServiceOp, detail: String) -> ServiceResult<()> {
        debug!(op = ?op, detail = %detail, "In-memory service call");
        self.calls.lock().push(ServiceCall { op, detail });

        let mut failures = self.failures.lock();
        if let Some(failure) = failures.get_mut(&op) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                let kind = failure.kind;
                if failure.remaining == 0 {
                    failures.remove(&op);
                }
                return Err(ServiceError::new(kind, format!("scripted {:?} failure", op)));
            }
        }
        Ok(())
    }
}

fn table_key(project: &str, table: &str) -> (String, String) {
    (project.to_ascii_lowercase(), table.to_ascii_lowercase())
}

/// In-memory catalog, SQL and tunnel service.
#[derive(Clone, Default)]
pub struct MemoryService {
    inner: Arc<Inner>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table.
    pub fn add_table(&self, descriptor: TableDescriptor) {
        let key = table_key(&descriptor.project, &descriptor.name);
        self.inner.tables.lock().insert(
            key,
            MemoryTable {
                descriptor,
                partitions: BTreeSet::new(),
                rows: HashMap::new(),
            },
        );
    }

    /// Register an existing partition holding `rows`.
    pub fn add_partition(&self, project: &str, table: &str, spec: PartitionSpec, rows: Vec<Record>) {
        let mut tables = self.inner.tables.lock();
        if let Some(t) = tables.get_mut(&table_key(project, table)) {
            t.partitions.insert(spec.clone());
            t.rows.insert(Some(spec), rows);
        }
    }

    /// Seed rows into a non-partitioned table.
    pub fn add_rows(&self, project: &str, table: &str, rows: Vec<Record>) {
        let mut tables = self.inner.tables.lock();
        if let Some(t) = tables.get_mut(&table_key(project, table)) {
            t.rows.entry(None).or_default().extend(rows);
        }
    }

    /// Make the next `times` calls of `op` fail with `kind`.
    pub fn fail_next(&self, op: ServiceOp, times: u32, kind: ServiceErrorKind) {
        self.inner.failures.lock().insert(
            op,
            ScriptedFailure {
                remaining: times,
                kind,
            },
        );
    }

    /// Make every call of `op` fail with `kind`.
    pub fn fail_always(&self, op: ServiceOp, kind: ServiceErrorKind) {
        self.fail_next(op, u32::MAX, kind);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.inner.calls.lock().clone()
    }

    /// Operations made so far, in order.
    pub fn ops(&self) -> Vec<ServiceOp> {
        self.inner.calls.lock().iter().map(|c| c.op).collect()
    }

    pub fn call_count(&self, op: ServiceOp) -> usize {
        self.inner.calls.lock().iter().filter(|c| c.op == op).count()
    }

    /// Rows visible in the target after commits.
    pub fn committed_rows(&self, target: &UploadTarget) -> Vec<Record> {
        let tables = self.inner.tables.lock();
        tables
            .get(&table_key(&target.project, &target.table))
            .and_then(|t| t.rows.get(&target.partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Existing partitions of a table.
    pub fn partitions(&self, project: &str, table: &str) -> Vec<PartitionSpec> {
        let tables = self.inner.tables.lock();
        tables
            .get(&table_key(project, table))
            .map(|t| t.partitions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_committed(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.state.lock().committed)
            .unwrap_or(false)
    }

    fn with_table<T>(
        &self,
        project: &str,
        table: &str,
        f: impl FnOnce(&mut MemoryTable) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let mut tables = self.inner.tables.lock();
        let t = tables
            .get_mut(&table_key(project, table))
            .ok_or_else(|| ServiceError::not_found(format!("table {}.{}", project, table)))?;
        f(t)
    }

    fn check_target(&self, target: &UploadTarget) -> ServiceResult<()> {
        self.with_table(&target.project, &target.table, |t| {
            if t.descriptor.is_virtual_view {
                return Err(ServiceError::rejected(format!(
                    "{} is a virtual view",
                    target
                )));
            }
            match (&target.partition, t.descriptor.is_partitioned()) {
                (None, true) => Err(ServiceError::rejected(format!(
                    "{} is partitioned, a partition is required",
                    target
                ))),
                (Some(_), false) => Err(ServiceError::rejected(format!(
                    "{} is not partitioned",
                    target
                ))),
                (Some(spec), true) if !t.partitions.contains(spec) => Err(
                    ServiceError::not_found(format!("partition {} does not exist", spec)),
                ),
                _ => Ok(()),
            }
        })
    }

    fn publish(&self, target: &UploadTarget, rows: Vec<Record>) -> ServiceResult<()> {
        self.with_table(&target.project, &target.table, |t| {
            t.rows
                .entry(target.partition.clone())
                .or_default()
                .extend(rows);
            Ok(())
        })
    }
}

#[async_trait]
impl CatalogService for MemoryService {
    async fn get_table(
        &self,
        _conn: &Connection,
        project: &str,
        table: &str,
    ) -> ServiceResult<TableDescriptor> {
        self.inner
            .enter(ServiceOp::GetTable, format!("{}.{}", project, table))?;
        self.with_table(project, table, |t| Ok(t.descriptor.clone()))
    }

    async fn list_partitions(
        &self,
        _conn: &Connection,
        table: &TableDescriptor,
    ) -> ServiceResult<Vec<PartitionSpec>> {
        self.inner
            .enter(ServiceOp::ListPartitions, table.full_name())?;
        self.with_table(&table.project, &table.name, |t| {
            Ok(t.partitions.iter().cloned().collect())
        })
    }

    async fn create_partition(
        &self,
        _conn: &Connection,
        table: &TableDescriptor,
        spec: &PartitionSpec,
    ) -> ServiceResult<()> {
        self.inner.enter(
            ServiceOp::CreatePartition,
            format!("{}/{}", table.full_name(), spec),
        )?;
        self.with_table(&table.project, &table.name, |t| {
            if !t.partitions.insert(spec.clone()) {
                return Err(ServiceError::new(
                    ServiceErrorKind::AlreadyExists,
                    format!("partition {} already exists", spec),
                ));
            }
            t.rows.insert(Some(spec.clone()), Vec::new());
            Ok(())
        })
    }

    async fn delete_partition(
        &self,
        _conn: &Connection,
        table: &TableDescriptor,
        spec: &PartitionSpec,
    ) -> ServiceResult<()> {
        self.inner.enter(
            ServiceOp::DeletePartition,
            format!("{}/{}", table.full_name(), spec),
        )?;
        self.with_table(&table.project, &table.name, |t| {
            if !t.partitions.remove(spec) {
                return Err(ServiceError::not_found(format!(
                    "partition {} does not exist",
                    spec
                )));
            }
            t.rows.remove(&Some(spec.clone()));
            Ok(())
        })
    }
}

#[async_trait]
impl SqlService for MemoryService {
    /// Understands `TRUNCATE TABLE [project.]name;` only.
    async fn run_statement(&self, conn: &Connection, sql: &str) -> ServiceResult<()> {
        self.inner.enter(ServiceOp::RunStatement, sql.to_string())?;

        let statement = sql.trim().trim_end_matches(';').trim();
        let prefix = "truncate table ";
        let name = match statement.get(..prefix.len()) {
            Some(head) if head.eq_ignore_ascii_case(prefix) => statement[prefix.len()..].trim(),
            _ => {
                return Err(ServiceError::rejected(format!(
                    "unsupported statement: {}",
                    sql
                )))
            }
        };
        if name.is_empty() {
            return Err(ServiceError::rejected("missing table name"));
        }
        let (project, table) = match name.split_once('.') {
            Some((project, table)) => (project, table),
            None => (conn.default_project(), name),
        };

        self.with_table(project, table, |t| {
            for rows in t.rows.values_mut() {
                rows.clear();
            }
            Ok(())
        })
    }
}

#[async_trait]
impl TunnelService for MemoryService {
    async fn create_upload_session(
        &self,
        _conn: &Connection,
        target: &UploadTarget,
    ) -> ServiceResult<Arc<dyn UploadSession>> {
        self.inner
            .enter(ServiceOp::CreateUploadSession, target.to_string())?;
        self.check_target(target)?;

        let shared = Arc::new(SessionShared {
            id: uuid::Uuid::new_v4().simple().to_string(),
            target: target.clone(),
            state: Mutex::new(SessionData::default()),
        });
        self.inner
            .sessions
            .lock()
            .insert(shared.id.clone(), shared.clone());

        Ok(Arc::new(MemorySession {
            shared,
            service: self.clone(),
        }))
    }

    async fn get_upload_session(
        &self,
        _conn: &Connection,
        target: &UploadTarget,
        session_id: &str,
    ) -> ServiceResult<Arc<dyn UploadSession>> {
        self.inner.enter(
            ServiceOp::GetUploadSession,
            format!("{} {}", session_id, target),
        )?;

        let shared = self
            .inner
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("upload session {}", session_id)))?;

        if &shared.target != target {
            return Err(ServiceError::rejected(format!(
                "upload session {} belongs to {}, not {}",
                session_id, shared.target, target
            )));
        }

        Ok(Arc::new(MemorySession {
            shared,
            service: self.clone(),
        }))
    }
}

/// Handle onto a session; many handles may share one session.
struct MemorySession {
    shared: Arc<SessionShared>,
    service: MemoryService,
}

#[async_trait]
impl UploadSession for MemorySession {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn target(&self) -> &UploadTarget {
        &self.shared.target
    }

    async fn open_block(&self, block: BlockId) -> ServiceResult<Box<dyn BlockWriter>> {
        self.service
            .inner
            .enter(ServiceOp::OpenBlock, format!("{} {}", self.shared.id, block))?;

        let mut state = self.shared.state.lock();
        if state.committed {
            return Err(ServiceError::rejected(format!(
                "upload session {} is already committed",
                self.shared.id
            )));
        }
        if state.closed_blocks.contains_key(&block) || !state.open_blocks.insert(block) {
            return Err(ServiceError::rejected(format!(
                "block {} already used in session {}",
                block, self.shared.id
            )));
        }

        Ok(Box::new(MemoryBlockWriter {
            shared: self.shared.clone(),
            service: self.service.clone(),
            block,
            buffer: Vec::new(),
            closed: false,
        }))
    }

    async fn block_list(&self) -> ServiceResult<Vec<BlockId>> {
        Ok(self
            .shared
            .state
            .lock()
            .closed_blocks
            .keys()
            .copied()
            .collect())
    }

    async fn commit(&self, blocks: &[BlockId]) -> ServiceResult<()> {
        self.service.inner.enter(
            ServiceOp::Commit,
            format!("{} {:?}", self.shared.id, blocks),
        )?;

        let mut rows = Vec::new();
        {
            let mut state = self.shared.state.lock();
            if state.committed {
                return Err(ServiceError::rejected(format!(
                    "upload session {} is already committed",
                    self.shared.id
                )));
            }

            let mut seen = HashSet::new();
            for block in blocks {
                if !seen.insert(*block) {
                    return Err(ServiceError::rejected(format!(
                        "block {} listed twice",
                        block
                    )));
                }
                let bytes = state.closed_blocks.get(block).ok_or_else(|| {
                    ServiceError::rejected(format!("block {} was not uploaded", block))
                })?;
                let decoded: Vec<Record> = serde_json::from_slice(bytes).map_err(|e| {
                    ServiceError::new(ServiceErrorKind::Internal, e.to_string())
                })?;
                rows.extend(decoded);
            }
            state.committed = true;
        }

        self.service.publish(&self.shared.target, rows)
    }
}

struct MemoryBlockWriter {
    shared: Arc<SessionShared>,
    service: MemoryService,
    block: BlockId,
    buffer: Vec<Record>,
    closed: bool,
}

#[async_trait]
impl BlockWriter for MemoryBlockWriter {
    async fn write(&mut self, record: Record) -> ServiceResult<()> {
        if self.closed {
            return Err(ServiceError::rejected(format!(
                "block {} is closed",
                self.block
            )));
        }
        self.buffer.push(record);
        Ok(())
    }

    async fn close(&mut self) -> ServiceResult<()> {
        self.service.inner.enter(
            ServiceOp::CloseBlock,
            format!("{} {}", self.shared.id, self.block),
        )?;
        if self.closed {
            return Err(ServiceError::rejected(format!(
                "block {} is already closed",
                self.block
            )));
        }

        let bytes = serde_json::to_vec(&self.buffer)
            .map_err(|e| ServiceError::new(ServiceErrorKind::Internal, e.to_string()))?;
        let mut state = self.shared.state.lock();
        state.open_blocks.remove(&self.block);
        state.closed_blocks.insert(self.block, bytes);
        self.closed = true;
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, Value};

    fn conn() -> Connection {
        Connection::builder()
            .endpoint("http://memory")
            .access_id("id")
            .access_key("key")
            .default_project("p")
            .build()
            .unwrap()
    }

    fn table(partitioned: bool) -> TableDescriptor {
        TableDescriptor {
            project: "p".into(),
            name: "t".into(),
            columns: vec![Column::new("id", ColumnType::Bigint)],
            partition_keys: if partitioned { vec!["pt".into()] } else { vec![] },
            is_virtual_view: false,
        }
    }

    #[tokio::test]
    async fn test_get_missing_table() {
        let service = MemoryService::new();
        let err = service.get_table(&conn(), "p", "nope").await.unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_scripted_failures_run_out() {
        let service = MemoryService::new();
        service.add_table(table(false));
        service.fail_next(ServiceOp::GetTable, 2, ServiceErrorKind::Transport);

        assert!(service.get_table(&conn(), "p", "t").await.is_err());
        assert!(service.get_table(&conn(), "p", "t").await.is_err());
        assert!(service.get_table(&conn(), "p", "t").await.is_ok());
        assert_eq!(service.call_count(ServiceOp::GetTable), 3);
    }

    #[tokio::test]
    async fn test_duplicate_block_rejected() {
        let service = MemoryService::new();
        service.add_table(table(false));
        let target = UploadTarget::new("p", "t", None);

        let session = service.create_upload_session(&conn(), &target).await.unwrap();
        let mut writer = session.open_block(7).await.unwrap();
        writer.write(vec![Value::Bigint(1)]).await.unwrap();
        writer.close().await.unwrap();

        let err = session.open_block(7).await.err().unwrap();
        assert_eq!(err.kind, ServiceErrorKind::Rejected);
    }

    #[tokio::test]
    async fn test_rows_visible_only_after_commit() {
        let service = MemoryService::new();
        service.add_table(table(false));
        let target = UploadTarget::new("p", "t", None);

        let session = service.create_upload_session(&conn(), &target).await.unwrap();
        let mut writer = session.open_block(0).await.unwrap();
        writer.write(vec![Value::Bigint(1)]).await.unwrap();
        writer.close().await.unwrap();
        assert!(service.committed_rows(&target).is_empty());

        session.commit(&[0]).await.unwrap();
        assert_eq!(service.committed_rows(&target), vec![vec![Value::Bigint(1)]]);
        assert!(service.is_committed(session.id()));
        assert!(session.commit(&[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_unknown_block_rejected() {
        let service = MemoryService::new();
        service.add_table(table(false));
        let target = UploadTarget::new("p", "t", None);

        let session = service.create_upload_session(&conn(), &target).await.unwrap();
        let err = session.commit(&[3]).await.unwrap_err();
        assert!(err.message.contains("not uploaded"));
        assert!(!service.is_committed(session.id()));
    }

    #[tokio::test]
    async fn test_reattach_requires_same_target() {
        let service = MemoryService::new();
        service.add_table(table(true));
        let spec = PartitionSpec::parse("pt=1").unwrap();
        service.add_partition("p", "t", spec.clone(), vec![]);
        let target = UploadTarget::new("p", "t", Some(spec));

        let session = service.create_upload_session(&conn(), &target).await.unwrap();

        let other = UploadTarget::new("p", "t", Some(PartitionSpec::parse("pt=2").unwrap()));
        let err = service
            .get_upload_session(&conn(), &other, session.id())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ServiceErrorKind::Rejected);

        let again = service
            .get_upload_session(&conn(), &target, session.id())
            .await
            .unwrap();
        assert_eq!(again.id(), session.id());
    }

    #[tokio::test]
    async fn test_partitioned_table_requires_partition() {
        let service = MemoryService::new();
        service.add_table(table(true));
        let err = service
            .create_upload_session(&conn(), &UploadTarget::new("p", "t", None))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ServiceErrorKind::Rejected);
    }

    #[tokio::test]
    async fn test_truncate_statement() {
        let service = MemoryService::new();
        service.add_table(table(false));
        service.add_rows("p", "t", vec![vec![Value::Bigint(1)]]);

        service
            .run_statement(&conn(), "TRUNCATE TABLE p.t;")
            .await
            .unwrap();
        assert!(service
            .committed_rows(&UploadTarget::new("p", "t", None))
            .is_empty());

        assert!(service.run_statement(&conn(), "DROP TABLE t").await.is_err());
    }
}

//! Partition specs and target preparation.
//!
//! The service has no atomic "truncate partition" primitive, so emptying a
//! partition is done by deleting it and creating it again. Whole tables are
//! emptied with a `TRUNCATE TABLE` statement.

use crate::connection::Connection;
use crate::metadata::MetadataResolver;
use crate::retry::RetryPolicy;
use crate::schema::{TableDescriptor, UploadTarget};
use crate::service::{CatalogService, SqlService};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Normalized partition spec, `key1=val1,key2=val2`.
///
/// Construction always normalizes: surrounding whitespace is trimmed, whitespace
/// around `=`, `/` and `,` is dropped, `/` becomes `,` and single quotes are
/// removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionSpec(String);

impl PartitionSpec {
    /// Normalize a user-supplied spec. Blank input is a configuration error.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("Bad partition which is blank".into()));
        }

        let normalized = trimmed
            .split([',', '/'])
            .map(|segment| {
                segment
                    .split('=')
                    .map(str::trim)
                    .collect::<Vec<_>>()
                    .join("=")
            })
            .collect::<Vec<_>>()
            .join(",")
            .replace('\'', "");

        Ok(PartitionSpec(normalized))
    }

    /// Normalize a list of specs.
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Self>> {
        raw.iter().map(|s| PartitionSpec::parse(s.as_ref())).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(key, value)` pairs in spec order.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.0
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|kv| kv.split_once('=').unwrap_or((kv, "")))
            .collect()
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates, recreates and truncates write targets.
pub struct PartitionManager {
    catalog: Arc<dyn CatalogService>,
    sql: Arc<dyn SqlService>,
}

impl PartitionManager {
    pub fn new(catalog: Arc<dyn CatalogService>, sql: Arc<dyn SqlService>) -> Self {
        Self { catalog, sql }
    }

    /// Leave `spec` existing and empty.
    ///
    /// When `exists` is true the partition is deleted first; it is then
    /// created in every case.
    pub async fn ensure_partition(
        &self,
        conn: &Connection,
        table: &TableDescriptor,
        spec: &PartitionSpec,
        exists: bool,
    ) -> Result<()> {
        if exists {
            if let Err(source) = self.catalog.delete_partition(conn, table, spec).await {
                error!(table = %table.name, partition = %spec, error = %source, "Failed to delete partition");
                return Err(Error::DeletePartition {
                    table: table.name.clone(),
                    partition: spec.to_string(),
                    source,
                });
            }
            info!(table = %table.name, partition = %spec, "Deleted existing partition");
        }

        self.create_partition(conn, table, spec).await
    }

    /// Create a partition that does not exist yet.
    pub async fn create_partition(
        &self,
        conn: &Connection,
        table: &TableDescriptor,
        spec: &PartitionSpec,
    ) -> Result<()> {
        if let Err(source) = self.catalog.create_partition(conn, table, spec).await {
            error!(table = %table.name, partition = %spec, error = %source, "Failed to create partition");
            return Err(Error::CreatePartition {
                table: table.name.clone(),
                partition: spec.to_string(),
                source,
            });
        }
        info!(table = %table.name, partition = %spec, "Created partition");
        Ok(())
    }

    /// Remove every row of a non-partitioned table.
    // TODO: quote the table name once identifier escaping rules are settled.
    pub async fn truncate_table(&self, conn: &Connection, table: &TableDescriptor) -> Result<()> {
        let sql = format!("TRUNCATE TABLE {}.{};", table.project, table.name);
        if let Err(source) = self.sql.run_statement(conn, &sql).await {
            error!(sql = %sql, error = %source, "Failed to truncate table");
            return Err(Error::Truncate { sql, source });
        }
        info!(table = %table.full_name(), "Truncated table");
        Ok(())
    }

    /// Make the write target ready and return its coordinate.
    ///
    /// | partitioned | truncate | action                               |
    /// |-------------|----------|--------------------------------------|
    /// | yes         | yes      | delete (if present) and recreate     |
    /// | yes         | no       | create if missing                    |
    /// | no          | yes      | `TRUNCATE TABLE`                     |
    /// | no          | no       | nothing                              |
    pub async fn prepare_target(
        &self,
        conn: &Connection,
        resolver: &MetadataResolver,
        table: &TableDescriptor,
        partition: Option<&PartitionSpec>,
        truncate: bool,
        policy: &RetryPolicy,
    ) -> Result<UploadTarget> {
        match (table.is_partitioned(), partition) {
            (true, None) => Err(Error::Config(format!(
                "Table [{}] is partitioned, a partition must be configured",
                table.full_name()
            ))),
            (false, Some(spec)) => Err(Error::Config(format!(
                "Table [{}] is not partitioned, but partition [{}] was configured",
                table.full_name(),
                spec
            ))),
            (true, Some(spec)) => {
                let exists = resolver
                    .list_partitions(conn, table, policy)
                    .await?
                    .contains(spec);

                if truncate {
                    info!(table = %table.full_name(), partition = %spec, exists, "Truncating partition");
                    self.ensure_partition(conn, table, spec, exists).await?;
                } else if !exists {
                    self.create_partition(conn, table, spec).await?;
                }

                Ok(UploadTarget::new(
                    &table.project,
                    &table.name,
                    Some(spec.clone()),
                ))
            }
            (false, None) => {
                if truncate {
                    self.truncate_table(conn, table).await?;
                }
                Ok(UploadTarget::new(&table.project, &table.name, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceErrorKind;
    use crate::schema::{Column, ColumnType, Value};
    use crate::service::memory::{MemoryService, ServiceOp};

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

    fn setup(partitioned: bool) -> (MemoryService, PartitionManager, MetadataResolver) {
        let service = MemoryService::new();
        service.add_table(table(partitioned));
        let shared = Arc::new(service.clone());
        let manager = PartitionManager::new(shared.clone(), shared.clone());
        let resolver = MetadataResolver::new(shared);
        (service, manager, resolver)
    }

    fn spec(raw: &str) -> PartitionSpec {
        PartitionSpec::parse(raw).unwrap()
    }

    #[test]
    fn test_normalize_whitespace_and_separators() {
        assert_eq!(spec("pt=1").as_str(), "pt=1");
        assert_eq!(spec("  pt = 1 , ds = 2 ").as_str(), "pt=1,ds=2");
        assert_eq!(spec("pt = 1 / ds = 2").as_str(), "pt=1,ds=2");
        assert_eq!(spec("pt='20240101',hour = '08'").as_str(), "pt=20240101,hour=08");
        assert_eq!(spec("a=1/b=2,c=3").as_str(), "a=1,b=2,c=3");
    }

    #[test]
    fn test_normalize_tabs_and_newlines() {
        assert_eq!(spec("pt\t=\t1").as_str(), "pt=1");
        assert_eq!(spec(" ds =\t1 /\thh = 2 ").as_str(), "ds=1,hh=2");
        assert_eq!(spec("ds=1,\nhh=2\r\n").as_str(), "ds=1,hh=2");
        assert_eq!(spec("pt\t=\t1"), spec("pt=1"));
    }

    #[test]
    fn test_blank_spec_rejected() {
        assert!(matches!(PartitionSpec::parse(""), Err(Error::Config(_))));
        assert!(matches!(PartitionSpec::parse(" \t "), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_all() {
        let specs = PartitionSpec::parse_all(&["pt = 1", "pt=2 "]).unwrap();
        assert_eq!(specs, vec![spec("pt=1"), spec("pt=2")]);
        assert!(PartitionSpec::parse_all(&["pt=1", ""]).is_err());
    }

    #[test]
    fn test_pairs() {
        assert_eq!(spec("pt=1, ds = x").pairs(), vec![("pt", "1"), ("ds", "x")]);
    }

    #[tokio::test]
    async fn test_ensure_existing_partition_deletes_then_creates() {
        let (service, manager, _) = setup(true);
        service.add_partition("p", "t", spec("pt=1"), vec![vec![Value::Bigint(1)]]);

        manager
            .ensure_partition(&conn(), &table(true), &spec("pt=1"), true)
            .await
            .unwrap();

        assert_eq!(
            service.ops(),
            vec![ServiceOp::DeletePartition, ServiceOp::CreatePartition]
        );
        let target = UploadTarget::new("p", "t", Some(spec("pt=1")));
        assert!(service.committed_rows(&target).is_empty());
    }

    #[tokio::test]
    async fn test_ensure_missing_partition_only_creates() {
        let (service, manager, _) = setup(true);

        manager
            .ensure_partition(&conn(), &table(true), &spec("pt=1"), false)
            .await
            .unwrap();

        assert_eq!(service.ops(), vec![ServiceOp::CreatePartition]);
        assert_eq!(service.partitions("p", "t"), vec![spec("pt=1")]);
    }

    #[tokio::test]
    async fn test_delete_failure_skips_create() {
        let (service, manager, _) = setup(true);
        service.add_partition("p", "t", spec("pt=1"), vec![]);
        service.fail_next(ServiceOp::DeletePartition, 1, ServiceErrorKind::Internal);

        let err = manager
            .ensure_partition(&conn(), &table(true), &spec("pt=1"), true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeletePartition { .. }));
        assert_eq!(service.call_count(ServiceOp::CreatePartition), 0);
    }

    #[tokio::test]
    async fn test_create_failure_surfaces_cause() {
        let (service, manager, _) = setup(true);
        service.fail_next(ServiceOp::CreatePartition, 1, ServiceErrorKind::Internal);

        let err = manager
            .ensure_partition(&conn(), &table(true), &spec("pt=1"), false)
            .await
            .unwrap_err();

        match err {
            Error::CreatePartition {
                partition, source, ..
            } => {
                assert_eq!(partition, "pt=1");
                assert_eq!(source.kind, ServiceErrorKind::Internal);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_truncate_table_runs_statement() {
        let (service, manager, _) = setup(false);
        service.add_rows("p", "t", vec![vec![Value::Bigint(1)]]);

        manager.truncate_table(&conn(), &table(false)).await.unwrap();

        let calls = service.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].detail, "TRUNCATE TABLE p.t;");
        assert!(service
            .committed_rows(&UploadTarget::new("p", "t", None))
            .is_empty());
    }

    #[tokio::test]
    async fn test_truncate_failure() {
        let (service, manager, _) = setup(false);
        service.fail_next(ServiceOp::RunStatement, 1, ServiceErrorKind::Internal);

        let err = manager.truncate_table(&conn(), &table(false)).await.unwrap_err();
        assert!(matches!(err, Error::Truncate { sql, .. } if sql == "TRUNCATE TABLE p.t;"));
    }

    #[tokio::test]
    async fn test_prepare_partitioned_without_partition() {
        let (_, manager, resolver) = setup(true);
        let err = manager
            .prepare_target(&conn(), &resolver, &table(true), None, false, &RetryPolicy::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_prepare_unpartitioned_with_partition() {
        let (_, manager, resolver) = setup(false);
        let err = manager
            .prepare_target(
                &conn(),
                &resolver,
                &table(false),
                Some(&spec("pt=1")),
                false,
                &RetryPolicy::new(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_prepare_creates_missing_partition_without_truncate() {
        let (service, manager, resolver) = setup(true);

        let target = manager
            .prepare_target(
                &conn(),
                &resolver,
                &table(true),
                Some(&spec("pt=1")),
                false,
                &RetryPolicy::new(1),
            )
            .await
            .unwrap();

        assert_eq!(target.partition, Some(spec("pt=1")));
        assert_eq!(
            service.ops(),
            vec![ServiceOp::ListPartitions, ServiceOp::CreatePartition]
        );
    }

    #[tokio::test]
    async fn test_prepare_keeps_existing_partition_without_truncate() {
        let (service, manager, resolver) = setup(true);
        service.add_partition("p", "t", spec("pt=1"), vec![vec![Value::Bigint(9)]]);

        let target = manager
            .prepare_target(
                &conn(),
                &resolver,
                &table(true),
                Some(&spec("pt=1")),
                false,
                &RetryPolicy::new(1),
            )
            .await
            .unwrap();

        assert_eq!(service.ops(), vec![ServiceOp::ListPartitions]);
        assert_eq!(service.committed_rows(&target).len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_truncates_existing_partition() {
        let (service, manager, resolver) = setup(true);
        service.add_partition("p", "t", spec("pt=1"), vec![vec![Value::Bigint(9)]]);

        let target = manager
            .prepare_target(
                &conn(),
                &resolver,
                &table(true),
                Some(&spec("pt=1")),
                true,
                &RetryPolicy::new(1),
            )
            .await
            .unwrap();

        assert_eq!(
            service.ops(),
            vec![
                ServiceOp::ListPartitions,
                ServiceOp::DeletePartition,
                ServiceOp::CreatePartition
            ]
        );
        assert!(service.committed_rows(&target).is_empty());
    }

    #[tokio::test]
    async fn test_prepare_truncates_unpartitioned_table() {
        let (service, manager, resolver) = setup(false);

        manager
            .prepare_target(&conn(), &resolver, &table(false), None, true, &RetryPolicy::new(1))
            .await
            .unwrap();

        assert_eq!(service.ops(), vec![ServiceOp::RunStatement]);
    }
}

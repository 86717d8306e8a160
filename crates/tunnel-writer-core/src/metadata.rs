//! Table metadata resolution.
//!
//! Fetches the target table's schema once before writing, refuses virtual
//! views, and lists existing partitions with bounded retry.

use crate::connection::Connection;
use crate::error::ServiceError;
use crate::partition::PartitionSpec;
use crate::retry::{self, RetryPolicy};
use crate::schema::TableDescriptor;
use crate::service::CatalogService;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Decides whether a failed catalog call is worth retrying.
pub type ErrorClassifier = Arc<dyn Fn(&ServiceError) -> bool + Send + Sync>;

/// Resolves table metadata through the catalog service.
pub struct MetadataResolver {
    catalog: Arc<dyn CatalogService>,
    classifier: ErrorClassifier,
}

impl MetadataResolver {
    /// Resolver that retries only transient transport failures.
    pub fn new(catalog: Arc<dyn CatalogService>) -> Self {
        Self {
            catalog,
            classifier: Arc::new(retry::transient),
        }
    }

    /// Replace the retry classifier.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Fetch the schema of `name` in the connection's default project,
    /// retrying per `policy`.
    #[instrument(skip(self, conn, policy), fields(project = %conn.default_project()))]
    pub async fn resolve_table(
        &self,
        conn: &Connection,
        name: &str,
        policy: &RetryPolicy,
    ) -> Result<TableDescriptor> {
        let classifier = self.classifier.clone();
        let table = retry::retry(
            policy,
            move |e: &ServiceError| classifier(e),
            "get_table",
            || self.catalog.get_table(conn, conn.default_project(), name),
        )
        .await
        .map_err(|e| {
            error!(table = %name, attempts = e.attempts, error = %e.last, "Failed to resolve table");
            Error::Catalog {
                table: name.to_string(),
                source: e.last,
            }
        })?;

        info!(
            table = %table.full_name(),
            columns = table.columns.len(),
            partitioned = table.is_partitioned(),
            "Resolved table"
        );
        Ok(table)
    }

    /// Views cannot accept direct writes.
    pub fn reject_virtual_table(table: &TableDescriptor) -> Result<()> {
        if table.is_virtual_view {
            return Err(Error::UnsupportedTableKind {
                table: table.full_name(),
            });
        }
        Ok(())
    }

    /// List the table's partitions, retrying per `policy`.
    pub async fn list_partitions(
        &self,
        conn: &Connection,
        table: &TableDescriptor,
        policy: &RetryPolicy,
    ) -> Result<Vec<PartitionSpec>> {
        let classifier = self.classifier.clone();
        let partitions = retry::retry(
            policy,
            move |e: &ServiceError| classifier(e),
            "list_partitions",
            || self.catalog.list_partitions(conn, table),
        )
        .await
        .map_err(|e| {
            error!(
                table = %table.full_name(),
                attempts = e.attempts,
                error = %e.last,
                "Failed to list partitions"
            );
            Error::PartitionList {
                table: table.full_name(),
                attempts: e.attempts,
                source: e.last,
            }
        })?;

        debug!(
            table = %table.full_name(),
            count = partitions.len(),
            "Listed partitions"
        );
        Ok(partitions)
    }

    /// Whether `spec` currently exists.
    pub async fn partition_exists(
        &self,
        conn: &Connection,
        table: &TableDescriptor,
        spec: &PartitionSpec,
        policy: &RetryPolicy,
    ) -> Result<bool> {
        Ok(self
            .list_partitions(conn, table, policy)
            .await?
            .contains(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceErrorKind;
    use crate::schema::{Column, ColumnType};
    use crate::service::memory::{MemoryService, ServiceOp};
    use std::time::Duration;
    use tokio::time::Instant;

    fn conn() -> Connection {
        Connection::builder()
            .endpoint("http://memory")
            .access_id("id")
            .access_key("key")
            .default_project("p")
            .build()
            .unwrap()
    }

    fn table(is_virtual_view: bool) -> TableDescriptor {
        TableDescriptor {
            project: "p".into(),
            name: "t".into(),
            columns: vec![
                Column::new("id", ColumnType::Bigint),
                Column::new("name", ColumnType::String),
            ],
            partition_keys: vec!["pt".into()],
            is_virtual_view,
        }
    }

    fn setup() -> (MemoryService, MetadataResolver) {
        let service = MemoryService::new();
        service.add_table(table(false));
        let resolver = MetadataResolver::new(Arc::new(service.clone()));
        (service, resolver)
    }

    #[tokio::test]
    async fn test_resolve_table() {
        let (_, resolver) = setup();
        let resolved = resolver
            .resolve_table(&conn(), "t", &RetryPolicy::new(1))
            .await
            .unwrap();
        assert_eq!(resolved.column_names(), vec!["id", "name"]);
        assert!(resolved.is_partitioned());
    }

    #[tokio::test]
    async fn test_resolve_missing_table() {
        let (service, resolver) = setup();
        let err = resolver
            .resolve_table(&conn(), "missing", &RetryPolicy::new(3))
            .await
            .unwrap_err();
        match err {
            Error::Catalog { table, source } => {
                assert_eq!(table, "missing");
                assert_eq!(source.kind, ServiceErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(service.call_count(ServiceOp::GetTable), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_table_recovers_from_transport_failure() {
        let (service, resolver) = setup();
        service.fail_next(ServiceOp::GetTable, 2, ServiceErrorKind::Transport);

        let started = Instant::now();
        let resolved = resolver
            .resolve_table(&conn(), "t", &RetryPolicy::new(3))
            .await
            .unwrap();

        assert_eq!(resolved.name, "t");
        assert_eq!(service.call_count(ServiceOp::GetTable), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_table_exhausted() {
        let (service, resolver) = setup();
        service.fail_always(ServiceOp::GetTable, ServiceErrorKind::Timeout);

        let err = resolver
            .resolve_table(&conn(), "t", &RetryPolicy::new(2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Catalog { ref source, .. } if source.kind == ServiceErrorKind::Timeout));
        assert_eq!(service.call_count(ServiceOp::GetTable), 2);
    }

    #[test]
    fn test_reject_virtual_table() {
        assert!(MetadataResolver::reject_virtual_table(&table(false)).is_ok());
        let err = MetadataResolver::reject_virtual_table(&table(true)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTableKind { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_partitions_recovers_on_third_attempt() {
        let (service, resolver) = setup();
        service.add_partition("p", "t", PartitionSpec::parse("pt=1").unwrap(), vec![]);
        service.fail_next(ServiceOp::ListPartitions, 2, ServiceErrorKind::Transport);

        let started = Instant::now();
        let partitions = resolver
            .list_partitions(&conn(), &table(false), &RetryPolicy::new(3))
            .await
            .unwrap();

        assert_eq!(partitions, vec![PartitionSpec::parse("pt=1").unwrap()]);
        assert_eq!(service.call_count(ServiceOp::ListPartitions), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_partitions_exhausted() {
        let (service, resolver) = setup();
        service.fail_always(ServiceOp::ListPartitions, ServiceErrorKind::Transport);

        let err = resolver
            .list_partitions(&conn(), &table(false), &RetryPolicy::new(2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PartitionList { attempts: 2, .. }));
        assert_eq!(service.call_count(ServiceOp::ListPartitions), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_partitions_permanent_failure_not_retried() {
        let (service, resolver) = setup();
        service.fail_always(ServiceOp::ListPartitions, ServiceErrorKind::Rejected);

        let err = resolver
            .list_partitions(&conn(), &table(false), &RetryPolicy::new(5))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PartitionList { attempts: 1, .. }));
        assert_eq!(service.call_count(ServiceOp::ListPartitions), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier_retries_everything() {
        let (service, resolver) = setup();
        let resolver = resolver.with_classifier(Arc::new(|_: &ServiceError| true));
        service.fail_next(ServiceOp::ListPartitions, 1, ServiceErrorKind::Internal);

        let partitions = resolver
            .list_partitions(&conn(), &table(false), &RetryPolicy::new(2))
            .await
            .unwrap();

        assert!(partitions.is_empty());
        assert_eq!(service.call_count(ServiceOp::ListPartitions), 2);
    }

    #[tokio::test]
    async fn test_partition_exists() {
        let (service, resolver) = setup();
        let spec = PartitionSpec::parse("pt=1").unwrap();
        assert!(!resolver
            .partition_exists(&conn(), &table(false), &spec, &RetryPolicy::new(1))
            .await
            .unwrap());

        service.add_partition("p", "t", spec.clone(), vec![]);
        assert!(resolver
            .partition_exists(&conn(), &table(false), &spec, &RetryPolicy::new(1))
            .await
            .unwrap());
    }
}

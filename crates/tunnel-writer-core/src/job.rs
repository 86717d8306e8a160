//! Job lifecycle: prepare, open the session, fan out, commit.
//!
//! Everything up to [`WriterJob::init_session`] runs on a single task. Tasks
//! then run concurrently on a [`JoinSet`] and share only the session id, the
//! target and the service handles. The commit happens once, after every task
//! has been joined.

use crate::column::{expand_user_columns, resolve_positions};
use crate::config::WriterConfig;
use crate::connection::Connection;
use crate::metadata::MetadataResolver;
use crate::partition::{PartitionManager, PartitionSpec};
use crate::schema::{Record, TableDescriptor, UploadTarget};
use crate::service::ServiceHandles;
use crate::session::{CommitSummary, SessionId, UploadCoordinator};
use crate::task::{TaskOutcome, TaskPlan, TaskWriter};
use crate::{Error, Result};
use std::collections::BTreeSet;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

/// A prepared write job bound to one target.
pub struct WriterJob {
    config: WriterConfig,
    conn: Connection,
    services: ServiceHandles,
    table: TableDescriptor,
    target: UploadTarget,
    columns: Vec<String>,
    column_positions: Vec<usize>,
    coordinator: UploadCoordinator,
}

impl WriterJob {
    /// Resolve the table and make the target ready for writing.
    ///
    /// Rejects views, normalizes the partition, applies truncation and maps
    /// the configured columns onto table positions.
    #[instrument(skip(config, services), fields(project = %config.project, table = %config.table))]
    pub async fn prepare(config: WriterConfig, services: ServiceHandles) -> Result<Self> {
        config.validate()?;
        let conn = Connection::from_config(&config)?;
        let policy = config.retry_policy();

        let resolver = MetadataResolver::new(services.catalog.clone());
        let table = resolver
            .resolve_table(&conn, &config.table, &policy)
            .await?;
        MetadataResolver::reject_virtual_table(&table)?;

        let partition = config
            .partition
            .as_deref()
            .map(PartitionSpec::parse)
            .transpose()?;

        let manager = PartitionManager::new(services.catalog.clone(), services.sql.clone());
        let target = manager
            .prepare_target(
                &conn,
                &resolver,
                &table,
                partition.as_ref(),
                config.truncate,
                &policy,
            )
            .await?;

        let table_columns = table.column_names();
        let requested = expand_user_columns(&config.columns, &table_columns)?;
        let column_positions = resolve_positions(&requested, &table_columns)
            .into_positions(&table.full_name(), config.column_resolution)?;
        let columns = column_positions
            .iter()
            .map(|&p| table_columns[p].clone())
            .collect();

        info!(
            target = %target,
            columns = ?column_positions,
            "Prepared write job"
        );

        Ok(Self {
            coordinator: UploadCoordinator::new(services.tunnel.clone()),
            config,
            conn,
            services,
            table,
            target,
            columns,
            column_positions,
        })
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    /// Table columns each source cell maps to, in source order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_positions(&self) -> &[usize] {
        &self.column_positions
    }

    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.coordinator
    }

    /// Create the master session. Called once, before any task starts.
    pub async fn init_session(&self) -> Result<SessionId> {
        self.coordinator
            .create_master_session(&self.conn, &self.target)
            .await
    }

    /// Plans for `n` tasks with disjoint block id ranges
    /// `[i * max_blocks_per_task, (i + 1) * max_blocks_per_task)`.
    pub fn split(&self, n: usize) -> Result<Vec<TaskPlan>> {
        let session_id = self.coordinator.session_id().ok_or_else(|| Error::MasterSession {
            target: self.target.to_string(),
            message: "session must be created before splitting".into(),
            source: None,
        })?;
        if n == 0 {
            return Err(Error::Config("At least one task is required".into()));
        }

        let per_task = self.config.max_blocks_per_task;
        (0..n)
            .map(|i| {
                let start = (i as u64).checked_mul(per_task);
                let end = start.and_then(|s| s.checked_add(per_task));
                let (start, end) = start.zip(end).ok_or_else(|| {
                    Error::Config(format!(
                        "{} tasks of {} blocks overflow the block id space",
                        n, per_task
                    ))
                })?;

                Ok(TaskPlan {
                    task_id: i,
                    session_id: session_id.clone(),
                    target: self.target.clone(),
                    block_range: start..end,
                    table_columns: self.table.columns.clone(),
                    column_positions: self.column_positions.clone(),
                    block_max_rows: self.config.block_max_rows,
                    block_timeout: self.config.block_timeout(),
                })
            })
            .collect()
    }

    /// Run one task per shard and wait for all of them.
    ///
    /// A task that panics or is cancelled is reported as failed.
    pub async fn run_tasks(&self, shards: Vec<Vec<Record>>) -> Result<Vec<TaskOutcome>> {
        let plans = self.split(shards.len())?;
        let expected: BTreeSet<usize> = plans.iter().map(|p| p.task_id).collect();

        let mut join_set = JoinSet::new();
        for (plan, shard) in plans.into_iter().zip(shards) {
            let writer = TaskWriter::new(self.conn.clone(), self.services.tunnel.clone(), plan);
            join_set.spawn(writer.run(shard));
        }

        let mut outcomes = Vec::with_capacity(expected.len());
        let mut join_failure = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    error!(error = %join_err, "Task panicked");
                    join_failure.get_or_insert_with(|| join_err.to_string());
                }
            }
        }

        let reported: BTreeSet<usize> = outcomes.iter().map(|o| o.task_id).collect();
        for task_id in expected.difference(&reported) {
            outcomes.push(TaskOutcome::lost(
                *task_id,
                Error::TaskLost {
                    task_id: *task_id,
                    message: join_failure
                        .clone()
                        .unwrap_or_else(|| "no outcome".to_string()),
                },
            ));
        }

        outcomes.sort_by_key(|o| o.task_id);
        Ok(outcomes)
    }

    /// Commit if every task succeeded, otherwise abort.
    pub async fn finish(&self, outcomes: Vec<TaskOutcome>) -> Result<CommitSummary> {
        self.coordinator.finish(outcomes).await
    }

    /// Prepare, write `shards` with one task each, and commit.
    pub async fn run(
        config: WriterConfig,
        services: ServiceHandles,
        shards: Vec<Vec<Record>>,
    ) -> Result<CommitSummary> {
        let job = Self::prepare(config, services).await?;
        job.init_session().await?;
        let outcomes = job.run_tasks(shards).await?;
        let summary = job.finish(outcomes).await?;

        info!(
            target = %job.target,
            session_id = %summary.session_id,
            blocks = summary.blocks,
            rows = summary.rows,
            "Write job committed"
        );
        Ok(summary)
    }
}

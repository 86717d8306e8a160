//! Per-task writing.
//!
//! Every task attaches to the job's session as a slave, converts its share of
//! the source records into table column order and streams them as blocks
//! drawn from a block id range no other task touches.

use crate::connection::Connection;
use crate::schema::{Column, Record, UploadTarget, Value};
use crate::service::{BlockId, TunnelService};
use crate::session::{open_slave_session, SessionId, SlaveSession};
use crate::{Error, Result};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// What one task is allowed to do, handed out by the job.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub task_id: usize,
    pub session_id: SessionId,
    pub target: UploadTarget,
    /// Block ids reserved for this task
    pub block_range: Range<BlockId>,
    /// Table columns, in physical order
    pub table_columns: Vec<Column>,
    /// Table position of each source cell
    pub column_positions: Vec<usize>,
    pub block_max_rows: usize,
    pub block_timeout: Option<Duration>,
}

/// Report a task hands back to the barrier.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: usize,
    /// Blocks closed by the task, ascending
    pub blocks: Vec<BlockId>,
    /// Rows inside closed blocks
    pub rows_written: u64,
    pub error: Option<Error>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Outcome for a task that died before reporting.
    pub fn lost(task_id: usize, error: Error) -> Self {
        Self {
            task_id,
            blocks: Vec::new(),
            rows_written: 0,
            error: Some(error),
        }
    }
}

/// Writes one task's records into the shared session.
pub struct TaskWriter {
    conn: Connection,
    tunnel: Arc<dyn TunnelService>,
    plan: TaskPlan,
}

impl TaskWriter {
    pub fn new(conn: Connection, tunnel: Arc<dyn TunnelService>, plan: TaskPlan) -> Self {
        Self { conn, tunnel, plan }
    }

    pub fn plan(&self) -> &TaskPlan {
        &self.plan
    }

    /// Write `rows` and report. Never returns early with an error: failures
    /// are carried in the outcome so the barrier sees every task.
    pub async fn run<I>(self, rows: I) -> TaskOutcome
    where
        I: IntoIterator<Item = Record>,
    {
        let task_id = self.plan.task_id;
        info!(
            task_id,
            session_id = %self.plan.session_id,
            blocks = ?self.plan.block_range,
            "Starting task"
        );

        let mut slave = match open_slave_session(
            &self.conn,
            self.tunnel.as_ref(),
            &self.plan.target,
            &self.plan.session_id,
        )
        .await
        {
            Ok(slave) => slave.with_block_timeout(self.plan.block_timeout),
            Err(e) => {
                error!(task_id, error = %e, "Task could not attach to upload session");
                return TaskOutcome::lost(task_id, e);
            }
        };

        let mut rows_written = 0;
        let result = self.write_all(&mut slave, rows, &mut rows_written).await;
        let blocks = slave.closed_blocks();

        match &result {
            Ok(()) => info!(task_id, blocks = blocks.len(), rows = rows_written, "Task finished"),
            Err(e) => error!(task_id, blocks = blocks.len(), error = %e, "Task failed"),
        }

        TaskOutcome {
            task_id,
            blocks,
            rows_written,
            error: result.err(),
        }
    }

    async fn write_all<I>(
        &self,
        slave: &mut SlaveSession,
        rows: I,
        rows_written: &mut u64,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        let block_max_rows = self.plan.block_max_rows.max(1);
        let mut next_block = self.plan.block_range.start;
        let mut pending = Vec::with_capacity(block_max_rows);

        for record in rows {
            pending.push(self.to_table_order(record, slave.id(), next_block)?);
            if pending.len() >= block_max_rows {
                *rows_written += self.flush(slave, &mut next_block, &mut pending).await?;
            }
        }
        if !pending.is_empty() {
            *rows_written += self.flush(slave, &mut next_block, &mut pending).await?;
        }
        Ok(())
    }

    async fn flush(
        &self,
        slave: &mut SlaveSession,
        next_block: &mut BlockId,
        pending: &mut Vec<Record>,
    ) -> Result<u64> {
        let block = *next_block;
        if !self.plan.block_range.contains(&block) {
            return Err(Error::Block {
                session_id: slave.id().to_string(),
                block,
                message: format!(
                    "task {} exhausted its block range {:?}",
                    self.plan.task_id, self.plan.block_range
                ),
                source: None,
            });
        }

        let rows = std::mem::take(pending);
        let written = slave.write_block(block, rows).await?;
        *next_block += 1;
        debug!(task_id = self.plan.task_id, block, rows = written, "Flushed block");
        Ok(written)
    }

    /// Place each source cell at its table position; unmapped columns stay
    /// null.
    fn to_table_order(&self, record: Record, session_id: &str, block: BlockId) -> Result<Record> {
        let positions = &self.plan.column_positions;
        let block_error = |message: String| Error::Block {
            session_id: session_id.to_string(),
            block,
            message,
            source: None,
        };

        if record.len() != positions.len() {
            return Err(block_error(format!(
                "record has {} cells but {} columns are mapped",
                record.len(),
                positions.len()
            )));
        }

        let mut row = vec![Value::Null; self.plan.table_columns.len()];
        for (cell, &position) in record.into_iter().zip(positions) {
            let column = self.plan.table_columns.get(position).ok_or_else(|| {
                block_error(format!("column position {} is out of range", position))
            })?;
            if let Value::Double(v) = &cell {
                if !v.is_finite() {
                    return Err(block_error(format!(
                        "column [{}] cannot hold non-finite double {}",
                        column.name, v
                    )));
                }
            }
            if !cell.fits(column.column_type) {
                return Err(block_error(format!(
                    "column [{}] of type {} cannot hold a {} value",
                    column.name,
                    column.column_type,
                    cell.type_name()
                )));
            }
            row[position] = cell;
        }
        Ok(row)
    }
}

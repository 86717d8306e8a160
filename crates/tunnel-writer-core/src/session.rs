//! Upload session coordination.
//!
//! A job owns one [`UploadCoordinator`], which creates the single master
//! session for its target before tasks fan out. Each task then re-attaches to
//! that session by id through [`open_slave_session`] and writes its own
//! disjoint blocks. Once every task has reported back, [`UploadCoordinator::finish`]
//! commits all blocks in one call, or withholds the commit if any task failed
//! and leaves the session for the service to expire.
//!
//! ```text
//! Uncreated -> Creating -> MasterOpen -> Committed
//!                  \            \
//!                   `------------`-----> Aborted
//! ```

use crate::connection::Connection;
use crate::schema::{Record, UploadTarget, Value};
use crate::service::{BlockId, TunnelService, UploadSession};
use crate::task::TaskOutcome;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Session id assigned by the tunnel service.
pub type SessionId = String;

/// Lifecycle of the master session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session yet
    Uncreated,
    /// Master session creation in flight
    Creating,
    /// Session open, tasks may attach and write
    MasterOpen,
    /// All blocks made visible
    Committed,
    /// Given up; the session is left to expire
    Aborted,
}

/// Counters for the coordinator.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Commit calls made against the service
    pub commits_attempted: AtomicU64,
    /// Commit calls that succeeded
    pub commits_succeeded: AtomicU64,
    /// Commit calls that failed
    pub commits_failed: AtomicU64,
    /// Blocks made visible
    pub blocks_committed: AtomicU64,
    /// Times the barrier withheld a commit
    pub aborts: AtomicU64,
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub session_id: SessionId,
    pub blocks: usize,
    /// Rows reported by the tasks, zero when `commit` is called directly
    pub rows: u64,
    pub committed_at: DateTime<Utc>,
}

/// Owns the master session of one job.
pub struct UploadCoordinator {
    tunnel: Arc<dyn TunnelService>,
    state: Mutex<SessionState>,
    session: Mutex<Option<Arc<dyn UploadSession>>>,
    registered: Mutex<BTreeSet<BlockId>>,
    stats: SessionStats,
}

impl UploadCoordinator {
    pub fn new(tunnel: Arc<dyn TunnelService>) -> Self {
        Self {
            tunnel,
            state: Mutex::new(SessionState::Uncreated),
            session: Mutex::new(None),
            registered: Mutex::new(BTreeSet::new()),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().as_ref().map(|s| s.id().to_string())
    }

    /// Open the one master session for `target`.
    ///
    /// A partitioned table's target must carry its partition; the session is
    /// then bound to exactly that partition. The slot is claimed before the
    /// service call, so concurrent callers get at most one session.
    #[instrument(skip(self, conn), fields(target = %target))]
    pub async fn create_master_session(
        &self,
        conn: &Connection,
        target: &UploadTarget,
    ) -> Result<SessionId> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Uncreated {
                return Err(Error::MasterSession {
                    target: target.to_string(),
                    message: format!("session already in state {:?}", *state),
                    source: None,
                });
            }
            *state = SessionState::Creating;
        }

        let session = match self.tunnel.create_upload_session(conn, target).await {
            Ok(session) => session,
            Err(source) => {
                error!(target = %target, error = %source, "Failed to create upload session");
                *self.state.lock() = SessionState::Aborted;
                return Err(Error::MasterSession {
                    target: target.to_string(),
                    message: source.message.clone(),
                    source: Some(source),
                });
            }
        };

        let id = session.id().to_string();
        {
            let mut state = self.state.lock();
            if *state != SessionState::Creating {
                warn!(
                    session_id = %id,
                    state = ?*state,
                    "Coordinator left creating state, dropping new session"
                );
                return Err(Error::MasterSession {
                    target: target.to_string(),
                    message: format!(
                        "session {} created after coordinator became {:?}",
                        id, *state
                    ),
                    source: None,
                });
            }
            *self.session.lock() = Some(session);
            *state = SessionState::MasterOpen;
        }

        info!(session_id = %id, target = %target, "Created master upload session");
        Ok(id)
    }

    /// Record blocks a task closed. Blocks must be disjoint across tasks.
    pub fn register_blocks(&self, task_id: usize, blocks: &[BlockId]) -> Result<()> {
        let mut registered = self.registered.lock();
        if let Some(dup) = blocks.iter().find(|b| registered.contains(*b)) {
            return Err(Error::Commit {
                session_id: self.session_id().unwrap_or_default(),
                message: format!("task {} reported block {} already registered", task_id, dup),
                source: None,
            });
        }
        registered.extend(blocks.iter().copied());
        debug!(task_id, blocks = blocks.len(), "Registered task blocks");
        Ok(())
    }

    pub fn registered_blocks(&self) -> Vec<BlockId> {
        self.registered.lock().iter().copied().collect()
    }

    /// Commit `blocks`, which must be exactly the registered blocks and all
    /// closed on the service side.
    pub async fn commit(&self, blocks: &[BlockId]) -> Result<CommitSummary> {
        let session = self.open_session()?;
        let session_id = session.id().to_string();

        let requested: BTreeSet<BlockId> = blocks.iter().copied().collect();
        if requested.len() != blocks.len() {
            return Err(self.commit_error(&session_id, "block list contains duplicates", None));
        }
        let registered: BTreeSet<BlockId> = self.registered.lock().clone();
        if requested != registered {
            let missing: Vec<_> = registered.difference(&requested).collect();
            let unknown: Vec<_> = requested.difference(&registered).collect();
            return Err(self.commit_error(
                &session_id,
                &format!(
                    "block list does not match registered blocks, missing {:?}, unregistered {:?}",
                    missing, unknown
                ),
                None,
            ));
        }

        let uploaded: HashSet<BlockId> = session
            .block_list()
            .await
            .map_err(|e| self.commit_error(&session_id, "failed to fetch block list", Some(e)))?
            .into_iter()
            .collect();
        if let Some(block) = blocks.iter().find(|b| !uploaded.contains(*b)) {
            return Err(self.commit_error(
                &session_id,
                &format!("block {} was registered but never closed", block),
                None,
            ));
        }

        self.stats.commits_attempted.fetch_add(1, Ordering::Relaxed);
        if let Err(source) = session.commit(blocks).await {
            self.stats.commits_failed.fetch_add(1, Ordering::Relaxed);
            *self.state.lock() = SessionState::Aborted;
            error!(session_id = %session_id, error = %source, "Commit failed");
            return Err(self.commit_error(&session_id, "service rejected commit", Some(source)));
        }

        self.stats.commits_succeeded.fetch_add(1, Ordering::Relaxed);
        self.stats
            .blocks_committed
            .fetch_add(blocks.len() as u64, Ordering::Relaxed);
        *self.state.lock() = SessionState::Committed;

        info!(session_id = %session_id, blocks = blocks.len(), "Committed upload session");
        Ok(CommitSummary {
            session_id,
            blocks: blocks.len(),
            rows: 0,
            committed_at: Utc::now(),
        })
    }

    /// Barrier commit: commit every task's blocks only if every task
    /// succeeded; otherwise abort without calling commit.
    pub async fn finish(&self, outcomes: Vec<TaskOutcome>) -> Result<CommitSummary> {
        let session_id = self.open_session()?.id().to_string();

        let failed: Vec<usize> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.task_id)
            .collect();
        if !failed.is_empty() {
            for outcome in outcomes.iter().filter(|o| !o.is_success()) {
                if let Some(err) = &outcome.error {
                    warn!(task_id = outcome.task_id, error = %err, "Task failed");
                }
            }
            self.abort();
            return Err(Error::Aborted {
                session_id,
                failed_tasks: failed,
            });
        }

        let mut blocks = Vec::new();
        let mut rows = 0;
        for outcome in &outcomes {
            if let Err(e) = self.register_blocks(outcome.task_id, &outcome.blocks) {
                self.abort();
                return Err(e);
            }
            blocks.extend_from_slice(&outcome.blocks);
            rows += outcome.rows_written;
        }
        blocks.sort_unstable();

        match self.commit(&blocks).await {
            Ok(mut summary) => {
                summary.rows = rows;
                Ok(summary)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Give up on the session. The service expires it; nothing becomes visible.
    ///
    /// A no-op once the session is committed or already aborted.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::Committed | SessionState::Aborted) {
            return;
        }
        *state = SessionState::Aborted;
        drop(state);
        self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        warn!(session_id = ?self.session_id(), "Upload session aborted, commit withheld");
    }

    fn open_session(&self) -> Result<Arc<dyn UploadSession>> {
        let state = self.state();
        let session = self.session.lock().clone();
        match (state, session) {
            (SessionState::MasterOpen, Some(session)) => Ok(session),
            (state, session) => Err(Error::Commit {
                session_id: session.map(|s| s.id().to_string()).unwrap_or_default(),
                message: format!("session is {:?}, not open", state),
                source: None,
            }),
        }
    }

    fn commit_error(
        &self,
        session_id: &str,
        message: &str,
        source: Option<crate::error::ServiceError>,
    ) -> Error {
        Error::Commit {
            session_id: session_id.to_string(),
            message: message.to_string(),
            source,
        }
    }
}

/// A task's handle onto the shared session.
pub struct SlaveSession {
    session: Arc<dyn UploadSession>,
    closed: BTreeSet<BlockId>,
    block_timeout: Option<Duration>,
}

/// Re-attach to the master session by id.
///
/// Always asks the service rather than reusing a handle, and checks that the
/// service returned the requested session bound to the same target.
#[instrument(skip(conn, tunnel), fields(target = %target))]
pub async fn open_slave_session(
    conn: &Connection,
    tunnel: &dyn TunnelService,
    target: &UploadTarget,
    session_id: &str,
) -> Result<SlaveSession> {
    let slave_error = |message: String, source| Error::SlaveSession {
        session_id: session_id.to_string(),
        target: target.to_string(),
        message,
        source,
    };

    let session = match tunnel.get_upload_session(conn, target, session_id).await {
        Ok(session) => session,
        Err(source) => {
            error!(session_id = %session_id, error = %source, "Failed to attach upload session");
            return Err(slave_error(source.message.clone(), Some(source)));
        }
    };

    if session.id() != session_id {
        return Err(slave_error(
            format!("service returned session {}", session.id()),
            None,
        ));
    }
    if session.target() != target {
        return Err(slave_error(
            format!("session is bound to {}", session.target()),
            None,
        ));
    }

    debug!(session_id = %session_id, "Attached slave session");
    Ok(SlaveSession {
        session,
        closed: BTreeSet::new(),
        block_timeout: None,
    })
}

impl SlaveSession {
    /// Bound the time a single block may take.
    pub fn with_block_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        self.session.id()
    }

    pub fn target(&self) -> &UploadTarget {
        self.session.target()
    }

    /// Blocks this handle closed, ascending.
    pub fn closed_blocks(&self) -> Vec<BlockId> {
        self.closed.iter().copied().collect()
    }

    /// Stream `rows` as block `block` and close it. Rows holding a NaN or
    /// infinite double are refused before the block is opened.
    pub async fn write_block(&mut self, block: BlockId, rows: Vec<Record>) -> Result<u64> {
        if self.closed.contains(&block) {
            return Err(self.block_error(block, "block already written by this task".into(), None));
        }
        let non_finite = rows.iter().flatten().find_map(|cell| match cell {
            Value::Double(v) if !v.is_finite() => Some(*v),
            _ => None,
        });
        if let Some(v) = non_finite {
            let message = format!("cannot write non-finite double {}", v);
            return Err(self.block_error(block, message, None));
        }

        let written = match self.block_timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream_block(block, rows))
                .await
                .map_err(|_| {
                    self.block_error(block, format!("timed out after {:?}", limit), None)
                })??,
            None => self.stream_block(block, rows).await?,
        };

        self.closed.insert(block);
        debug!(session_id = %self.id(), block, rows = written, "Closed block");
        Ok(written)
    }

    async fn stream_block(&self, block: BlockId, rows: Vec<Record>) -> Result<u64> {
        let mut writer = self
            .session
            .open_block(block)
            .await
            .map_err(|e| self.block_error(block, "failed to open block".into(), Some(e)))?;

        let mut written = 0;
        for row in rows {
            writer
                .write(row)
                .await
                .map_err(|e| self.block_error(block, "failed to write row".into(), Some(e)))?;
            written += 1;
        }

        writer
            .close()
            .await
            .map_err(|e| self.block_error(block, "failed to close block".into(), Some(e)))?;
        Ok(written)
    }

    fn block_error(
        &self,
        block: BlockId,
        message: String,
        source: Option<crate::error::ServiceError>,
    ) -> Error {
        Error::Block {
            session_id: self.id().to_string(),
            block,
            message,
            source,
        }
    }
}

//! Single-writer persistence pipeline
//!
//! SQLite permits one writer transaction at a time, so every mutation in
//! the engine funnels through the one task spawned here. Producers submit
//! [`WriteOp`]s on a bounded channel and receive per-op outcomes through
//! oneshot completions; the writer coalesces ops into micro-batched
//! transactions (up to `batch_size` ops or `batch_window`, whichever
//! fills first).
//!
//! Contention (`busy`/`locked`) is retried per op with exponential
//! backoff. With one writer it can only come from an external process on
//! the same file, so exhausting retries is logged at error as a
//! reliability bug. Constraint errors fail only the offending op; the
//! batch continues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::manifest::RepoSpec;
use crate::schema::{
    AnalysisContext, CallEdge, ContextFileState, ContextStatus, IncludeDep, JobQueue, JobStatus,
    OverlayMode, ParseRun, Reference, Symbol, SyncJob, TrackedFile, Workspace,
};

/// Everything persisted for one parsed file, atomically
#[derive(Debug, Clone)]
pub struct FileFacts {
    pub context_id: String,
    pub tracked: TrackedFile,
    pub symbols: Vec<Symbol>,
    pub references: Vec<Reference>,
    pub call_edges: Vec<CallEdge>,
    pub include_deps: Vec<IncludeDep>,

    /// Space-separated terms for the FTS recall table
    pub fts_terms: String,
}

impl FileFacts {
    /// Number of fact rows this payload persists (excluding the tracked row)
    pub fn row_count(&self) -> u64 {
        (self.symbols.len()
            + self.references.len()
            + self.call_edges.len()
            + self.include_deps.len()) as u64
    }
}

/// One mutation of the store
#[derive(Debug)]
pub enum WriteOp {
    UpsertFileFacts(Box<FileFacts>),
    Invalidate {
        context_id: String,
        file_keys: Option<Vec<String>>,
    },
    UpsertContext(AnalysisContext),
    TouchContext {
        context_id: String,
        at: String,
        expires_at: Option<String>,
    },
    PutFileStates {
        context_id: String,
        states: Vec<ContextFileState>,
    },
    SetContextStatus {
        context_id: String,
        status: ContextStatus,
    },
    SetOverlayMode {
        context_id: String,
        mode: OverlayMode,
    },
    /// Reclaim all rows of an (expired) context; the context row itself
    /// survives as an audit stub
    DeleteContextRows {
        context_id: String,
    },
    RecordParseRun(ParseRun),
    UpsertWorkspace(Workspace),
    ReplaceRepos {
        workspace_id: String,
        repos: Vec<RepoSpec>,
    },
    UpsertRepoSyncState {
        workspace_id: String,
        repo_id: String,
        sha: String,
        at: String,
    },
    InsertDiffSummary {
        workspace_id: String,
        repo_id: String,
        event_sha: String,
        summary: String,
        at: String,
    },
    InsertJob {
        queue: JobQueue,
        job: SyncJob,
    },
    ClaimJob {
        queue: JobQueue,
        now: String,
        lease_until: String,
    },
    HeartbeatJob {
        queue: JobQueue,
        id: String,
        lease_until: String,
    },
    FinishJob {
        queue: JobQueue,
        id: String,
        error: Option<String>,
        now: String,
    },
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            Self::UpsertFileFacts(_) => "upsert_file_facts",
            Self::Invalidate { .. } => "invalidate",
            Self::UpsertContext(_) => "upsert_context",
            Self::TouchContext { .. } => "touch_context",
            Self::PutFileStates { .. } => "put_file_states",
            Self::SetContextStatus { .. } => "set_context_status",
            Self::SetOverlayMode { .. } => "set_overlay_mode",
            Self::DeleteContextRows { .. } => "delete_context_rows",
            Self::RecordParseRun(_) => "record_parse_run",
            Self::UpsertWorkspace(_) => "upsert_workspace",
            Self::ReplaceRepos { .. } => "replace_repos",
            Self::UpsertRepoSyncState { .. } => "upsert_repo_sync_state",
            Self::InsertDiffSummary { .. } => "insert_diff_summary",
            Self::InsertJob { .. } => "insert_job",
            Self::ClaimJob { .. } => "claim_job",
            Self::HeartbeatJob { .. } => "heartbeat_job",
            Self::FinishJob { .. } => "finish_job",
        }
    }
}

/// Per-op result payload
#[derive(Debug)]
pub enum WriteOutcome {
    Unit,
    /// Rows affected (invalidate, delete)
    Count(u64),
    /// Claimed or deduplicated job
    Job(Option<SyncJob>),
}

struct Envelope {
    op: WriteOp,
    done: oneshot::Sender<Result<WriteOutcome>>,
}

/// Cloneable producer handle to the single writer
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Envelope>,
    capacity: usize,
    depth: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Submit an op and await its outcome; waits when the queue is full
    /// (the pipeline's natural backpressure)
    pub async fn submit(&self, op: WriteOp) -> Result<WriteOutcome> {
        let (done, rx) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Envelope { op, done })
            .await
            .map_err(|_| EngineError::internal("writer task is gone"))?;
        rx.await
            .map_err(|_| EngineError::internal("writer dropped op"))?
    }

    /// Non-blocking submit; hands the op back when the queue is full
    pub fn try_submit(
        &self,
        op: WriteOp,
    ) -> std::result::Result<oneshot::Receiver<Result<WriteOutcome>>, WriteOp> {
        let (done, rx) = oneshot::channel();
        match self.tx.try_send(Envelope { op, done }) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(rx)
            }
            Err(mpsc::error::TrySendError::Full(env))
            | Err(mpsc::error::TrySendError::Closed(env)) => Err(env.op),
        }
    }

    /// Ops submitted but not yet applied (health surface)
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Channel capacity (for health reporting)
    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }
}

/// Spawn the writer task over its own connection
pub fn spawn_writer(
    conn: Connection,
    config: &EngineConfig,
) -> (WriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.write_queue_capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    let handle = WriterHandle {
        tx,
        capacity: config.write_queue_capacity,
        depth: depth.clone(),
    };
    let cfg = config.clone();
    let join = tokio::spawn(run_writer(conn, rx, cfg, depth));
    (handle, join)
}

async fn run_writer(
    conn: Connection,
    mut rx: mpsc::Receiver<Envelope>,
    cfg: EngineConfig,
    depth: Arc<AtomicUsize>,
) {
    tracing::debug!("writer task started");
    let mut conn = conn;
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + cfg.write_batch_window;
        while batch.len() < cfg.write_batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(env)) => batch.push(env),
                Ok(None) | Err(_) => break,
            }
        }
        depth.fetch_sub(batch.len(), Ordering::Relaxed);

        let cfg_batch = cfg.clone();
        match tokio::task::spawn_blocking(move || {
            apply_batch(&conn, &cfg_batch, batch);
            conn
        })
        .await
        {
            Ok(returned) => conn = returned,
            Err(e) => {
                tracing::error!("writer batch task failed: {}", e);
                return;
            }
        }
    }
    tracing::debug!("writer task stopped");
}

/// Apply one micro-batch inside a single transaction
fn apply_batch(conn: &Connection, cfg: &EngineConfig, batch: Vec<Envelope>) {
    let size = batch.len();
    let started = std::time::Instant::now();

    let mut tx = match begin_with_retry(conn, cfg.write_max_retries) {
        Ok(tx) => tx,
        Err(e) => {
            let message = e.to_string();
            tracing::error!("writer cannot open transaction: {}", message);
            for env in batch {
                let _ = env.done.send(Err(EngineError::WriteContention {
                    message: message.clone(),
                }));
            }
            return;
        }
    };

    let mut results = Vec::with_capacity(size);
    for env in &batch {
        results.push(apply_envelope(&mut tx, cfg, &env.op));
    }

    match commit_tx(tx) {
        Ok(()) => {
            for (env, result) in batch.into_iter().zip(results) {
                let _ = env.done.send(result);
            }
            tracing::debug!(
                "writer committed batch of {} in {}ms",
                size,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            // The whole batch rolled back; every op fails
            let message = e.to_string();
            tracing::error!("writer commit failed after retries: {}", message);
            for env in batch {
                let _ = env.done.send(Err(EngineError::WriteContention {
                    message: message.clone(),
                }));
            }
        }
    }
}

fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::DatabaseBusy
                || code.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(10u64.saturating_mul(1 << attempt.min(8)))
}

fn begin_with_retry(conn: &Connection, max_retries: u32) -> Result<Transaction<'_>> {
    let mut attempt = 0;
    loop {
        match conn.unchecked_transaction() {
            Ok(tx) => return Ok(tx),
            Err(e) if is_contention(&e) && attempt < max_retries => {
                tracing::error!(
                    "database is locked; retrying writer BEGIN (attempt {})",
                    attempt + 1
                );
                std::thread::sleep(backoff_delay(attempt));
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn commit_tx(tx: Transaction<'_>) -> Result<()> {
    tx.commit().map_err(|e| {
        if is_contention(&e) {
            EngineError::WriteContention {
                message: e.to_string(),
            }
        } else {
            e.into()
        }
    })
}

/// Apply one op with per-op retry and savepoint isolation
fn apply_envelope(tx: &mut Transaction<'_>, cfg: &EngineConfig, op: &WriteOp) -> Result<WriteOutcome> {
    // Cap enforcement happens outside the savepoint so a refused op still
    // persists the mode flip
    if let WriteOp::UpsertFileFacts(facts) = op {
        check_overlay_caps(tx, cfg, facts)?;
    }

    let mut attempt = 0;
    loop {
        let result = {
            let sp = tx.savepoint().map_err(EngineError::from)?;
            match apply_op(&sp, op) {
                Ok(out) => {
                    sp.commit().map_err(EngineError::from)?;
                    Ok(out)
                }
                Err(e) => Err(e), // savepoint rolls back on drop
            }
        };
        match result {
            Err(EngineError::WriteContention { message }) if attempt < cfg.write_max_retries => {
                tracing::error!(
                    "database is locked applying {} (attempt {}): {}",
                    op.name(),
                    attempt + 1,
                    message
                );
                std::thread::sleep(backoff_delay(attempt));
                attempt += 1;
            }
            Err(EngineError::WriteContention { message }) => {
                tracing::error!(
                    "writer op {} failed after {} retries: {}",
                    op.name(),
                    cfg.write_max_retries,
                    message
                );
                return Err(EngineError::WriteContention { message });
            }
            other => {
                if let Err(ref e) = other {
                    tracing::warn!("writer op {} failed: {}", op.name(), e);
                }
                // Post-step: file-state loads can flip a sparse overlay
                // into partial mode without failing the op
                if let (Ok(_), WriteOp::PutFileStates { context_id, .. }) = (&other, op) {
                    flip_if_states_exceed_cap(tx, cfg, context_id)?;
                }
                return other;
            }
        }
    }
}

/// Refuse fact persists that would push a sparse overlay past its caps,
/// flipping the context to `partial_overlay`
fn check_overlay_caps(tx: &Transaction<'_>, cfg: &EngineConfig, facts: &FileFacts) -> Result<()> {
    let row: Option<(String, String, i64, i64)> = tx
        .query_row(
            "SELECT mode, overlay_mode, overlay_file_count, overlay_row_count
             FROM analysis_contexts WHERE context_id = ?1",
            [&facts.context_id],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            },
        )
        .optional()
        .map_err(EngineError::from)?;

    let Some((mode, overlay_mode, file_count, row_count)) = row else {
        return Err(EngineError::NotFound {
            what: format!("context {}", facts.context_id),
        });
    };
    if mode != "pr" {
        return Ok(());
    }
    if overlay_mode == OverlayMode::PartialOverlay.as_str() {
        return Err(EngineError::OverlayCapExceeded {
            context_id: facts.context_id.clone(),
            message: "overlay is in partial mode; bulk persistence disabled".into(),
        });
    }

    let existing: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM tracked_files WHERE context_id = ?1 AND file_key = ?2",
            params![facts.context_id, facts.tracked.file_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(EngineError::from)?;

    let old_rows: i64 = if existing.is_some() {
        count_file_rows(tx, &facts.context_id, &facts.tracked.file_key)?
    } else {
        0
    };

    let new_files = file_count + if existing.is_some() { 0 } else { 1 };
    let new_rows = row_count - old_rows + facts.row_count() as i64;

    if new_files > cfg.max_overlay_files as i64 || new_rows > cfg.max_overlay_rows as i64 {
        tx.execute(
            "UPDATE analysis_contexts SET overlay_mode = 'partial_overlay' WHERE context_id = ?1",
            [&facts.context_id],
        )
        .map_err(EngineError::from)?;
        tracing::warn!(
            "overlay {} exceeded caps ({} files / {} rows); switching to partial_overlay",
            facts.context_id,
            new_files,
            new_rows
        );
        return Err(EngineError::OverlayCapExceeded {
            context_id: facts.context_id.clone(),
            message: format!("{} files / {} rows", new_files, new_rows),
        });
    }
    Ok(())
}

fn count_file_rows(conn: &Connection, context_id: &str, file_key: &str) -> Result<i64> {
    let count: i64 = conn
        .query_row(
            "SELECT
                (SELECT count(*) FROM symbols WHERE context_id = ?1 AND file_key = ?2) +
                (SELECT count(*) FROM references_ WHERE context_id = ?1 AND file_key = ?2) +
                (SELECT count(*) FROM call_edges WHERE context_id = ?1 AND file_key = ?2) +
                (SELECT count(*) FROM include_deps WHERE context_id = ?1 AND file_key = ?2)",
            params![context_id, file_key],
            |row| row.get(0),
        )
        .map_err(EngineError::from)?;
    Ok(count)
}

fn flip_if_states_exceed_cap(
    tx: &Transaction<'_>,
    cfg: &EngineConfig,
    context_id: &str,
) -> Result<()> {
    let carrying: i64 = tx
        .query_row(
            "SELECT count(*) FROM context_file_states
             WHERE context_id = ?1 AND state IN ('added','modified','renamed')",
            [context_id],
            |row| row.get(0),
        )
        .map_err(EngineError::from)?;
    if carrying > cfg.max_overlay_files as i64 {
        let changed = tx
            .execute(
                "UPDATE analysis_contexts SET overlay_mode = 'partial_overlay'
                 WHERE context_id = ?1 AND mode = 'pr' AND overlay_mode = 'sparse'",
                [context_id],
            )
            .map_err(EngineError::from)?;
        if changed > 0 {
            tracing::warn!(
                "overlay {} declares {} changed files (cap {}); switching to partial_overlay",
                context_id,
                carrying,
                cfg.max_overlay_files
            );
        }
    }
    Ok(())
}

/// Apply one op against the current savepoint
fn apply_op(conn: &Connection, op: &WriteOp) -> Result<WriteOutcome> {
    match op {
        WriteOp::UpsertFileFacts(facts) => {
            upsert_file_facts(conn, facts)?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::Invalidate {
            context_id,
            file_keys,
        } => {
            let deleted = match file_keys {
                Some(keys) => {
                    let mut total = 0u64;
                    let mut stmt = conn
                        .prepare(
                            "DELETE FROM tracked_files WHERE context_id = ?1 AND file_key = ?2",
                        )?;
                    let mut fts = conn
                        .prepare("DELETE FROM recall_fts WHERE context_id = ?1 AND file_key = ?2")?;
                    for key in keys {
                        total += stmt.execute(params![context_id, key])? as u64;
                        fts.execute(params![context_id, key])?;
                    }
                    total
                }
                None => {
                    conn.execute(
                        "DELETE FROM recall_fts WHERE context_id = ?1",
                        [context_id],
                    )?;
                    conn.execute(
                        "DELETE FROM tracked_files WHERE context_id = ?1",
                        [context_id],
                    )? as u64
                }
            };
            refresh_overlay_counts(conn, context_id)?;
            Ok(WriteOutcome::Count(deleted))
        }

        WriteOp::UpsertContext(ctx) => {
            conn.execute(
                "INSERT INTO analysis_contexts
                     (context_id, workspace_id, mode, base_context_id, overlay_mode,
                      overlay_file_count, overlay_row_count, status, created_at,
                      last_accessed_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(context_id) DO UPDATE SET
                     overlay_mode = excluded.overlay_mode,
                     status = excluded.status,
                     last_accessed_at = excluded.last_accessed_at,
                     expires_at = excluded.expires_at",
                params![
                    ctx.context_id,
                    ctx.workspace_id,
                    ctx.mode.as_str(),
                    ctx.base_context_id,
                    ctx.overlay_mode.as_str(),
                    ctx.overlay_file_count as i64,
                    ctx.overlay_row_count as i64,
                    ctx.status.as_str(),
                    ctx.created_at,
                    ctx.last_accessed_at,
                    ctx.expires_at,
                ],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::TouchContext {
            context_id,
            at,
            expires_at,
        } => {
            conn.execute(
                "UPDATE analysis_contexts
                 SET last_accessed_at = ?2,
                     expires_at = CASE WHEN ?3 IS NULL THEN expires_at ELSE ?3 END
                 WHERE context_id = ?1",
                params![context_id, at, expires_at],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::PutFileStates { context_id, states } => {
            let mut stmt = conn
                .prepare(
                    "INSERT INTO context_file_states
                         (context_id, file_key, state, replaced_from_file_key)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(context_id, file_key) DO UPDATE SET
                         state = excluded.state,
                         replaced_from_file_key = excluded.replaced_from_file_key",
                )?;
            for state in states {
                stmt.execute(params![
                    context_id,
                    state.file_key,
                    state.state.as_str(),
                    state.replaced_from_file_key,
                ])?;
            }
            Ok(WriteOutcome::Count(states.len() as u64))
        }

        WriteOp::SetContextStatus { context_id, status } => {
            conn.execute(
                "UPDATE analysis_contexts SET status = ?2 WHERE context_id = ?1",
                params![context_id, status.as_str()],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::SetOverlayMode { context_id, mode } => {
            conn.execute(
                "UPDATE analysis_contexts SET overlay_mode = ?2 WHERE context_id = ?1",
                params![context_id, mode.as_str()],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::DeleteContextRows { context_id } => {
            conn.execute("DELETE FROM recall_fts WHERE context_id = ?1", [context_id])?;
            conn.execute(
                "DELETE FROM context_file_states WHERE context_id = ?1",
                [context_id],
            )?;
            let deleted = conn
                .execute(
                    "DELETE FROM tracked_files WHERE context_id = ?1",
                    [context_id],
                )? as u64;
            conn.execute(
                "UPDATE analysis_contexts
                 SET overlay_file_count = 0, overlay_row_count = 0
                 WHERE context_id = ?1",
                [context_id],
            )?;
            Ok(WriteOutcome::Count(deleted))
        }

        WriteOp::RecordParseRun(run) => {
            conn.execute(
                "INSERT INTO parse_runs
                     (context_id, file_key, started_at, duration_ms, success,
                      diagnostic_count, symbol_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.context_id,
                    run.file_key,
                    run.started_at,
                    run.duration_ms as i64,
                    run.success as i64,
                    run.diagnostic_count as i64,
                    run.symbol_count as i64,
                ],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::UpsertWorkspace(ws) => {
            conn.execute(
                "INSERT INTO workspaces
                     (workspace_id, root_path, manifest_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(workspace_id) DO UPDATE SET
                     root_path = excluded.root_path,
                     manifest_path = excluded.manifest_path,
                     updated_at = excluded.updated_at",
                params![
                    ws.workspace_id,
                    ws.root_path,
                    ws.manifest_path,
                    ws.created_at,
                    ws.updated_at,
                ],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::ReplaceRepos {
            workspace_id,
            repos,
        } => {
            conn.execute("DELETE FROM repos WHERE workspace_id = ?1", [workspace_id])?;
            let mut stmt = conn
                .prepare(
                    "INSERT INTO repos
                         (workspace_id, repo_id, root, compile_commands_path,
                          default_branch, depends_on, remote_url, commit_sha)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
            for repo in repos {
                stmt.execute(params![
                    workspace_id,
                    repo.repo_id,
                    repo.root,
                    repo.compile_commands,
                    repo.default_branch,
                    serde_json::to_string(&repo.depends_on)?,
                    repo.remote_url,
                    repo.commit_sha,
                ])?;
            }
            Ok(WriteOutcome::Count(repos.len() as u64))
        }

        WriteOp::UpsertRepoSyncState {
            workspace_id,
            repo_id,
            sha,
            at,
        } => {
            conn.execute(
                "INSERT INTO repo_sync_state
                     (workspace_id, repo_id, last_synced_sha, last_synced_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id, repo_id) DO UPDATE SET
                     last_synced_sha = excluded.last_synced_sha,
                     last_synced_at = excluded.last_synced_at",
                params![workspace_id, repo_id, sha, at],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::InsertDiffSummary {
            workspace_id,
            repo_id,
            event_sha,
            summary,
            at,
        } => {
            conn.execute(
                "INSERT INTO commit_diff_summaries
                     (workspace_id, repo_id, event_sha, summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![workspace_id, repo_id, event_sha, summary, at],
            )?;
            Ok(WriteOutcome::Unit)
        }

        WriteOp::InsertJob { queue, job } => {
            let inserted = conn
                .execute(
                    &format!(
                        "INSERT INTO {}
                             (id, workspace_id, repo_id, ref_name, context_id, event_type,
                              event_sha, status, attempts, max_attempts, lease_until,
                              last_error, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                         ON CONFLICT(workspace_id, repo_id, ref_name, context_id, event_sha)
                         DO NOTHING",
                        queue.table()
                    ),
                    params![
                        job.id,
                        job.workspace_id,
                        job.repo_id,
                        job.ref_name,
                        job.context_id.clone().unwrap_or_default(),
                        job.event_type,
                        job.event_sha,
                        job.status.as_str(),
                        job.attempts as i64,
                        job.max_attempts as i64,
                        job.lease_until,
                        job.last_error,
                        job.created_at,
                        job.updated_at,
                    ],
                )?;
            if inserted == 0 {
                tracing::debug!(
                    "job for {}/{}@{} deduplicated by idempotency key",
                    job.workspace_id,
                    job.repo_id,
                    job.event_sha
                );
            }
            let effective = select_job(
                conn,
                *queue,
                "workspace_id = ?1 AND repo_id = ?2 AND ref_name = ?3
                 AND context_id = ?4 AND event_sha = ?5",
                params![
                    job.workspace_id,
                    job.repo_id,
                    job.ref_name,
                    job.context_id.clone().unwrap_or_default(),
                    job.event_sha
                ],
            )?;
            Ok(WriteOutcome::Job(effective))
        }

        WriteOp::ClaimJob {
            queue,
            now,
            lease_until,
        } => {
            let candidate: Option<String> = conn
                .query_row(
                    &format!(
                        "SELECT id FROM {}
                         WHERE status = 'pending'
                            OR (status = 'running' AND lease_until IS NOT NULL
                                AND lease_until < ?1)
                         ORDER BY created_at LIMIT 1",
                        queue.table()
                    ),
                    [now],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = candidate else {
                return Ok(WriteOutcome::Job(None));
            };
            conn.execute(
                &format!(
                    "UPDATE {} SET status = 'running', lease_until = ?2, updated_at = ?3
                     WHERE id = ?1",
                    queue.table()
                ),
                params![id, lease_until, now],
            )?;
            let job = select_job(conn, *queue, "id = ?1", params![id])?;
            Ok(WriteOutcome::Job(job))
        }

        WriteOp::HeartbeatJob {
            queue,
            id,
            lease_until,
        } => {
            let updated = conn
                .execute(
                    &format!(
                        "UPDATE {} SET lease_until = ?2 WHERE id = ?1 AND status = 'running'",
                        queue.table()
                    ),
                    params![id, lease_until],
                )?;
            Ok(WriteOutcome::Count(updated as u64))
        }

        WriteOp::FinishJob {
            queue,
            id,
            error,
            now,
        } => {
            let job = select_job(conn, *queue, "id = ?1", params![id])?.ok_or_else(|| {
                EngineError::NotFound {
                    what: format!("job {}", id),
                }
            })?;
            match error {
                None => {
                    conn.execute(
                        &format!(
                            "UPDATE {} SET status = 'done', lease_until = NULL,
                                 last_error = NULL, updated_at = ?2
                             WHERE id = ?1",
                            queue.table()
                        ),
                        params![id, now],
                    )?;
                }
                Some(message) => {
                    let attempts = job.attempts + 1;
                    let status = if attempts >= job.max_attempts {
                        JobStatus::DeadLetter
                    } else {
                        JobStatus::Pending
                    };
                    if status == JobStatus::DeadLetter {
                        tracing::warn!(
                            "job {} dead-lettered after {} attempts: {}",
                            id,
                            attempts,
                            message
                        );
                    }
                    conn.execute(
                        &format!(
                            "UPDATE {} SET status = ?2, attempts = ?3, lease_until = NULL,
                                 last_error = ?4, updated_at = ?5
                             WHERE id = ?1",
                            queue.table()
                        ),
                        params![id, status.as_str(), attempts as i64, message, now],
                    )?;
                }
            }
            let updated = select_job(conn, *queue, "id = ?1", params![id])?;
            Ok(WriteOutcome::Job(updated))
        }
    }
}

fn upsert_file_facts(conn: &Connection, facts: &FileFacts) -> Result<()> {
    let t = &facts.tracked;
    // REPLACE deletes any previous row, which cascades the old facts away
    conn.execute(
        "INSERT OR REPLACE INTO tracked_files
             (context_id, file_key, repo_id, rel_path, abs_path, content_hash,
              flags_hash, includes_hash, composite_hash, last_parsed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            facts.context_id,
            t.file_key,
            t.repo_id,
            t.rel_path,
            t.abs_path,
            t.content_hash,
            t.flags_hash,
            t.includes_hash,
            t.composite_hash,
            t.last_parsed_at,
        ],
    )?;

    let mut sym_stmt = conn.prepare_cached(
        "INSERT INTO symbols
             (context_id, file_key, name, qualified_name, kind, line, col, extent_end_line)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for sym in &facts.symbols {
        sym_stmt.execute(params![
            facts.context_id,
            sym.file_key,
            sym.name,
            sym.qualified_name,
            sym.kind.as_str(),
            sym.line,
            sym.col,
            sym.extent_end_line,
        ])?;
    }

    let mut ref_stmt = conn.prepare_cached(
        "INSERT INTO references_
             (context_id, file_key, symbol_qualified_name, line, col, ref_kind)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for reference in &facts.references {
        ref_stmt.execute(params![
            facts.context_id,
            reference.file_key,
            reference.symbol_qualified_name,
            reference.line,
            reference.col,
            reference.ref_kind.as_str(),
        ])?;
    }

    let mut edge_stmt = conn.prepare_cached(
        "INSERT INTO call_edges
             (context_id, file_key, caller_qualified_name, callee_qualified_name, line)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for edge in &facts.call_edges {
        edge_stmt.execute(params![
            facts.context_id,
            edge.file_key,
            edge.caller_qualified_name,
            edge.callee_qualified_name,
            edge.line,
        ])?;
    }

    let mut dep_stmt = conn.prepare_cached(
        "INSERT INTO include_deps
             (context_id, file_key, included_file_key, included_abs_path, raw_path, depth)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for dep in &facts.include_deps {
        dep_stmt.execute(params![
            facts.context_id,
            dep.file_key,
            dep.included_file_key,
            dep.included_abs_path,
            dep.raw_path,
            dep.depth,
        ])?;
    }

    conn.execute(
        "DELETE FROM recall_fts WHERE context_id = ?1 AND file_key = ?2",
        params![facts.context_id, t.file_key],
    )?;
    if !facts.fts_terms.is_empty() {
        conn.execute(
            "INSERT INTO recall_fts (terms, context_id, file_key, repo_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![facts.fts_terms, facts.context_id, t.file_key, t.repo_id],
        )?;
    }

    refresh_overlay_counts(conn, &facts.context_id)?;
    Ok(())
}

/// Recompute the overlay bookkeeping columns for a PR context
fn refresh_overlay_counts(conn: &Connection, context_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE analysis_contexts SET
             overlay_file_count =
                 (SELECT count(*) FROM tracked_files WHERE context_id = ?1),
             overlay_row_count =
                 (SELECT count(*) FROM symbols WHERE context_id = ?1) +
                 (SELECT count(*) FROM references_ WHERE context_id = ?1) +
                 (SELECT count(*) FROM call_edges WHERE context_id = ?1) +
                 (SELECT count(*) FROM include_deps WHERE context_id = ?1)
         WHERE context_id = ?1 AND mode = 'pr'",
        [context_id],
    )?;
    Ok(())
}

fn select_job(
    conn: &Connection,
    queue: JobQueue,
    where_clause: &str,
    args: impl rusqlite::Params,
) -> Result<Option<SyncJob>> {
    conn.query_row(
        &format!(
            "SELECT id, workspace_id, repo_id, ref_name, context_id, event_type,
                    event_sha, status, attempts, max_attempts, lease_until,
                    last_error, created_at, updated_at
             FROM {} WHERE {}",
            queue.table(),
            where_clause
        ),
        args,
        |row| {
            let status: String = row.get(7)?;
            let context_id: String = row.get(4)?;
            Ok(SyncJob {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                repo_id: row.get(2)?,
                ref_name: row.get(3)?,
                context_id: (!context_id.is_empty()).then_some(context_id),
                event_type: row.get(5)?,
                event_sha: row.get(6)?,
                status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
                attempts: row.get::<_, i64>(8)? as u32,
                max_attempts: row.get::<_, i64>(9)? as u32,
                lease_until: row.get(10)?,
                last_error: row.get(11)?,
                created_at: row.get(12)?,
                updated_at: row.get(13)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ContextMode, ContextStatus, OverlayMode};

    fn test_context(context_id: &str) -> AnalysisContext {
        AnalysisContext {
            context_id: context_id.to_string(),
            workspace_id: "ws1".into(),
            mode: ContextMode::Baseline,
            base_context_id: None,
            overlay_mode: OverlayMode::Full,
            overlay_file_count: 0,
            overlay_row_count: 0,
            status: ContextStatus::Active,
            created_at: "2026-01-01T00:00:00.000000Z".into(),
            last_accessed_at: "2026-01-01T00:00:00.000000Z".into(),
            expires_at: None,
        }
    }

    fn open_test_store(dir: &std::path::Path) -> (crate::store::FactStore, Connection) {
        let store = crate::store::FactStore::open(dir).unwrap();
        let conn = store.writer_connection().unwrap();
        (store, conn)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_returns_per_op_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, conn) = open_test_store(dir.path());
        let (writer, _task) = spawn_writer(conn, &EngineConfig::default());

        writer
            .submit(WriteOp::UpsertContext(test_context("c1")))
            .await
            .unwrap();
        writer
            .submit(WriteOp::TouchContext {
                context_id: "c1".into(),
                at: "2026-01-02T00:00:00.000000Z".into(),
                expires_at: None,
            })
            .await
            .unwrap();

        let ctx = store.get_context("c1").unwrap().unwrap();
        assert_eq!(ctx.last_accessed_at, "2026-01-02T00:00:00.000000Z");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn try_submit_hands_receiver_back() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, conn) = open_test_store(dir.path());
        let (writer, _task) = spawn_writer(conn, &EngineConfig::default());

        let rx = writer
            .try_submit(WriteOp::UpsertContext(test_context("c2")))
            .expect("queue has room");
        let outcome = rx.await.unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn constraint_error_fails_only_the_offending_op() {
        let dir = tempfile::tempdir().unwrap();
        let (store, conn) = open_test_store(dir.path());
        let (writer, _task) = spawn_writer(conn, &EngineConfig::default());

        // Facts for a context that does not exist: refused up front
        let orphan = FileFacts {
            context_id: "missing-context".into(),
            tracked: TrackedFile {
                file_key: "repoA:src/a.cpp".into(),
                repo_id: "repoA".into(),
                rel_path: "src/a.cpp".into(),
                abs_path: "/ws/repoA/src/a.cpp".into(),
                content_hash: "c".into(),
                flags_hash: "f".into(),
                includes_hash: "i".into(),
                composite_hash: "x".into(),
                last_parsed_at: "2026-01-01T00:00:00.000000Z".into(),
            },
            symbols: Vec::new(),
            references: Vec::new(),
            call_edges: Vec::new(),
            include_deps: Vec::new(),
            fts_terms: String::new(),
        };
        let err = writer
            .submit(WriteOp::UpsertFileFacts(Box::new(orphan)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        // A well-formed op in the same stream still succeeds
        writer
            .submit(WriteOp::UpsertContext(test_context("c3")))
            .await
            .unwrap();
        assert!(store.get_context("c3").unwrap().is_some());
    }
}

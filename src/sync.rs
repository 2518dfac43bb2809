//! Sync job engine: durable, leased jobs driven by webhooks
//!
//! Two queues share one machine: `repo_sync_jobs` (fetch + detached
//! checkout at an exact commit) and `index_jobs` (reparse what changed).
//! Jobs are idempotent on `(workspace, repo, ref, context, event_sha)`,
//! claimed with a lease, heartbeated while running, retried with
//! exponential backoff, and dead-lettered after `max_attempts` failures.
//! Stale leases are reclaimable by any worker, so a crashed worker's job
//! is re-run rather than lost.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compile_commands::CompileDbCache;
use crate::config::EngineConfig;
use crate::context::{now_rfc3339, ContextManager};
use crate::error::{EngineError, Result};
use crate::extractor::{ExtractAction, ExtractorDriver, ParseResult};
use crate::git;
use crate::paths::FileKey;
use crate::schema::{Freshness, JobQueue, JobStatus, SyncJob};
use crate::store::writer::{WriteOp, WriteOutcome, WriterHandle};
use crate::store::FactStore;
use crate::workspace::WorkspaceHandle;

/// A normalised sync event extracted from a webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub repo_id: String,
    pub ref_name: String,
    pub event_type: String,
    pub event_sha: String,
}

/// Summary of changed paths recorded per processed event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSummary {
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
}

pub struct SyncEngine {
    store: Arc<FactStore>,
    writer: WriterHandle,
    contexts: Arc<ContextManager>,
    driver: Arc<ExtractorDriver>,
    compile_dbs: Arc<CompileDbCache>,
    workspace: WorkspaceHandle,
    config: EngineConfig,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<FactStore>,
        writer: WriterHandle,
        contexts: Arc<ContextManager>,
        driver: Arc<ExtractorDriver>,
        compile_dbs: Arc<CompileDbCache>,
        workspace: WorkspaceHandle,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            writer,
            contexts,
            driver,
            compile_dbs,
            workspace,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Insert a repo-sync job; duplicates collapse on the idempotency key
    pub async fn enqueue_repo_sync(&self, event: &SyncEvent) -> Result<SyncJob> {
        self.enqueue(JobQueue::RepoSync, event, None).await
    }

    /// Insert an index job for a repo at a commit
    pub async fn enqueue_index(
        &self,
        event: &SyncEvent,
        context_id: Option<String>,
    ) -> Result<SyncJob> {
        self.enqueue(JobQueue::Index, event, context_id).await
    }

    async fn enqueue(
        &self,
        queue: JobQueue,
        event: &SyncEvent,
        context_id: Option<String>,
    ) -> Result<SyncJob> {
        if self.workspace.manifest.repo(&event.repo_id).is_none() {
            return Err(EngineError::NotFound {
                what: format!("repo {}", event.repo_id),
            });
        }
        let now = now_rfc3339();
        let job = SyncJob {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: self.workspace.workspace_id.clone(),
            repo_id: event.repo_id.clone(),
            ref_name: event.ref_name.clone(),
            context_id,
            event_type: event.event_type.clone(),
            event_sha: event.event_sha.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.config.sync_max_attempts,
            lease_until: None,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        };
        match self.writer.submit(WriteOp::InsertJob { queue, job }).await? {
            WriteOutcome::Job(Some(job)) => Ok(job),
            _ => Err(EngineError::internal("job insert returned no row")),
        }
    }

    /// Normalise a GitLab webhook body into sync jobs
    ///
    /// Supports `push` and `merge_request` events; anything else is a
    /// validation error. The repo is matched by `path_with_namespace`
    /// against manifest remote URLs, falling back to the project name.
    pub async fn ingest_gitlab_webhook(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Vec<SyncJob>> {
        let object_kind = payload
            .get("object_kind")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let event = match object_kind {
            "push" => {
                let ref_name = payload
                    .get("ref")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .trim_start_matches("refs/heads/")
                    .to_string();
                let sha = payload
                    .get("after")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if ref_name.is_empty() || sha.is_empty() {
                    return Err(EngineError::Validation {
                        message: "push webhook missing ref or after".into(),
                    });
                }
                SyncEvent {
                    repo_id: self.match_webhook_repo(payload)?,
                    ref_name,
                    event_type: "push".into(),
                    event_sha: sha,
                }
            }
            "merge_request" => {
                let attrs = payload
                    .get("object_attributes")
                    .ok_or_else(|| EngineError::Validation {
                        message: "merge_request webhook missing object_attributes".into(),
                    })?;
                let sha = attrs
                    .get("last_commit")
                    .and_then(|c| c.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let source_branch = attrs
                    .get("source_branch")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if sha.is_empty() || source_branch.is_empty() {
                    return Err(EngineError::Validation {
                        message: "merge_request webhook missing last_commit or source_branch"
                            .into(),
                    });
                }
                SyncEvent {
                    repo_id: self.match_webhook_repo(payload)?,
                    ref_name: source_branch,
                    event_type: "merge_request".into(),
                    event_sha: sha,
                }
            }
            other => {
                return Err(EngineError::Validation {
                    message: format!("unsupported webhook object_kind: {}", other),
                })
            }
        };

        let job = self.enqueue_repo_sync(&event).await?;
        tracing::info!(
            "webhook {} for {}@{} -> job {} ({})",
            event.event_type,
            event.repo_id,
            &event.event_sha[..event.event_sha.len().min(12)],
            job.id,
            job.status.as_str()
        );
        Ok(vec![job])
    }

    fn match_webhook_repo(&self, payload: &serde_json::Value) -> Result<String> {
        let project = payload.get("project");
        let path_with_namespace = project
            .and_then(|p| p.get("path_with_namespace"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let name = project
            .and_then(|p| p.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        for repo in &self.workspace.manifest.repos {
            if let Some(ref url) = repo.remote_url {
                if !path_with_namespace.is_empty() && url.contains(path_with_namespace) {
                    return Ok(repo.repo_id.clone());
                }
            }
        }
        if let Some(repo) = self.workspace.manifest.repo(name) {
            return Ok(repo.repo_id.clone());
        }
        Err(EngineError::Validation {
            message: format!(
                "webhook project {} does not match any manifest repo",
                if path_with_namespace.is_empty() {
                    name
                } else {
                    path_with_namespace
                }
            ),
        })
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Spawn the fixed worker pool
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.sync_workers.max(1))
            .map(|i| {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.run_worker(i).await })
            })
            .collect()
    }

    /// Poll both queues until the runtime shuts down
    pub async fn run_worker(&self, worker_id: usize) {
        tracing::debug!("sync worker {} started", worker_id);
        let mut idle = tokio::time::interval(std::time::Duration::from_millis(500));
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            idle.tick().await;
            for queue in [JobQueue::RepoSync, JobQueue::Index] {
                match self.claim(queue).await {
                    Ok(Some(job)) => {
                        self.run_job(queue, job).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("worker {} claim failed: {}", worker_id, e);
                    }
                }
            }
        }
    }

    async fn claim(&self, queue: JobQueue) -> Result<Option<SyncJob>> {
        let now = now_rfc3339();
        let lease_until = crate::context::rfc3339_after(self.config.lease_ttl);
        match self
            .writer
            .submit(WriteOp::ClaimJob {
                queue,
                now,
                lease_until,
            })
            .await?
        {
            WriteOutcome::Job(job) => Ok(job),
            _ => Ok(None),
        }
    }

    /// Run one claimed job under a heartbeat, then settle its status
    async fn run_job(&self, queue: JobQueue, job: SyncJob) {
        tracing::info!(
            "running {} job {} for {}@{}",
            job.event_type,
            job.id,
            job.repo_id,
            &job.event_sha[..job.event_sha.len().min(12)]
        );

        let heartbeat = self.spawn_heartbeat(queue, job.id.clone());
        let result = match queue {
            JobQueue::RepoSync => self.process_repo_sync(&job).await,
            JobQueue::Index => self.process_index(&job).await,
        };
        heartbeat.abort();

        let error = result.err().map(|e| e.to_string());
        let failed = error.is_some();
        let finish = self
            .writer
            .submit(WriteOp::FinishJob {
                queue,
                id: job.id.clone(),
                error,
                now: now_rfc3339(),
            })
            .await;
        if let Err(e) = finish {
            tracing::error!("could not settle job {}: {}", job.id, e);
        }
        if failed {
            // Worker-side exponential backoff between attempts
            let delay = std::time::Duration::from_millis(
                250u64.saturating_mul(1 << job.attempts.min(8)),
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn spawn_heartbeat(&self, queue: JobQueue, job_id: String) -> tokio::task::JoinHandle<()> {
        let writer = self.writer.clone();
        let lease_ttl = self.config.lease_ttl;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease_ttl / 3);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let lease_until = crate::context::rfc3339_after(lease_ttl);
                let _ = writer
                    .submit(WriteOp::HeartbeatJob {
                        queue,
                        id: job_id.clone(),
                        lease_until,
                    })
                    .await;
            }
        })
    }

    /// Fetch, detached-checkout, refresh compile commands, chain an index
    /// job for the same event
    async fn process_repo_sync(&self, job: &SyncJob) -> Result<()> {
        let repo = self
            .workspace
            .manifest
            .repo(&job.repo_id)
            .ok_or_else(|| EngineError::NotFound {
                what: format!("repo {}", job.repo_id),
            })?
            .clone();
        let repo_root = self
            .workspace
            .repo_root(&job.repo_id)
            .ok_or_else(|| EngineError::NotFound {
                what: format!("repo root for {}", job.repo_id),
            })?;

        let previous_sha = git::head_sha(&repo_root).ok();

        // Blocking git work off the async workers
        let repo_id = job.repo_id.clone();
        let sha = job.event_sha.clone();
        let root = repo_root.clone();
        let remote = repo.remote_url.clone();
        let token = repo
            .token_env_var
            .as_ref()
            .map(|var| {
                std::env::var(var).map_err(|_| EngineError::SyncAuthFailed {
                    repo_id: repo_id.clone(),
                    message: format!("token env var {} is not set", var),
                })
            })
            .transpose()?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(url) = remote {
                git::fetch(&root, &url, token.as_deref()).map_err(|e| {
                    EngineError::SyncCheckoutFailed {
                        repo_id: repo_id.clone(),
                        message: e.to_string(),
                    }
                })?;
            }
            git::checkout_detached(&root, &sha).map_err(|e| EngineError::SyncCheckoutFailed {
                repo_id: repo_id.clone(),
                message: e.to_string(),
            })
        })
        .await
        .map_err(|e| EngineError::internal(format!("sync task panicked: {}", e)))??;

        // Compile commands may have changed with the checkout
        self.compile_dbs
            .invalidate_workspace(&self.workspace.workspace_id);

        self.writer
            .submit(WriteOp::UpsertRepoSyncState {
                workspace_id: self.workspace.workspace_id.clone(),
                repo_id: job.repo_id.clone(),
                sha: job.event_sha.clone(),
                at: now_rfc3339(),
            })
            .await?;

        // Record what changed for overlay building and observability
        if let Some(prev) = previous_sha {
            if prev != job.event_sha {
                if let Ok(changed) = git::changed_files(&repo_root, &prev, &job.event_sha) {
                    let summary = DiffSummary {
                        changed: changed
                            .iter()
                            .filter(|f| f.state != crate::schema::FileState::Deleted)
                            .map(|f| f.path.clone())
                            .collect(),
                        deleted: changed
                            .iter()
                            .filter(|f| f.state == crate::schema::FileState::Deleted)
                            .map(|f| f.path.clone())
                            .collect(),
                    };
                    self.writer
                        .submit(WriteOp::InsertDiffSummary {
                            workspace_id: self.workspace.workspace_id.clone(),
                            repo_id: job.repo_id.clone(),
                            event_sha: job.event_sha.clone(),
                            summary: serde_json::to_string(&summary)?,
                            at: now_rfc3339(),
                        })
                        .await?;
                    if !summary.deleted.is_empty() {
                        let dropped = self
                            .invalidate_deleted(&job.repo_id, &summary.deleted)
                            .await?;
                        tracing::debug!(
                            "dropped {} baseline rows for files deleted in {}",
                            dropped,
                            job.repo_id
                        );
                    }
                }
            }
        }

        let event = SyncEvent {
            repo_id: job.repo_id.clone(),
            ref_name: job.ref_name.clone(),
            event_type: job.event_type.clone(),
            event_sha: job.event_sha.clone(),
        };
        self.enqueue_index(&event, job.context_id.clone()).await?;
        Ok(())
    }

    async fn process_index(&self, job: &SyncJob) -> Result<()> {
        let (parsed, failed) = self.index_repo(&job.repo_id).await?;
        tracing::info!(
            "index job {} for {}: {} parsed, {} failed",
            job.id,
            job.repo_id,
            parsed,
            failed
        );
        Ok(())
    }

    /// Reparse every stale or unparsed file of a repo into the baseline
    ///
    /// Returns `(parsed, failed)`. Fresh files and files without compile
    /// flags are skipped.
    pub async fn index_repo(&self, repo_id: &str) -> Result<(usize, usize)> {
        let baseline = self
            .contexts
            .ensure_baseline(&self.workspace.workspace_id)
            .await?;
        let chain = self.store.context_chain(&baseline.context_id)?;

        let keys = self.workspace.list_repo_files(repo_id)?;
        let mut parsed = 0usize;
        let mut failed = 0usize;
        for key in keys {
            let (freshness, _, _) =
                self.driver
                    .classify(&self.workspace, &self.store, &chain, &key)?;
            match freshness {
                Freshness::Fresh | Freshness::MissingFlags => continue,
                Freshness::Stale | Freshness::Unparsed => {}
            }
            match self
                .driver
                .parse_file(&self.workspace, &baseline.context_id, &key, ExtractAction::All)
                .await?
            {
                ParseResult::Parsed(result) => {
                    let result = *result;
                    self.writer
                        .submit(WriteOp::UpsertFileFacts(Box::new(result.facts)))
                        .await?;
                    let _ = self
                        .writer
                        .submit(WriteOp::RecordParseRun(result.run))
                        .await;
                    parsed += 1;
                }
                ParseResult::MissingFlags => {}
                ParseResult::Timeout | ParseResult::Failed { .. } => {
                    failed += 1;
                }
            }
        }
        Ok((parsed, failed))
    }

    /// Remove deleted file_keys from the baseline after a sync
    pub async fn invalidate_deleted(&self, repo_id: &str, deleted_paths: &[String]) -> Result<u64> {
        let baseline_id =
            crate::schema::AnalysisContext::baseline_id(&self.workspace.workspace_id);
        let keys: Vec<String> = deleted_paths
            .iter()
            .map(|p| FileKey::new(repo_id, p).display_key())
            .collect();
        match self
            .writer
            .submit(WriteOp::Invalidate {
                context_id: baseline_id,
                file_keys: Some(keys),
            })
            .await?
        {
            WriteOutcome::Count(n) => Ok(n),
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_summary_round_trips() {
        let summary = DiffSummary {
            changed: vec!["src/a.cpp".into()],
            deleted: vec!["src/b.cpp".into()],
        };
        let json = serde_json::to_string(&summary).unwrap();
        let back: DiffSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.changed, summary.changed);
        assert_eq!(back.deleted, summary.deleted);
    }
}

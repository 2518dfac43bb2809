//! Typed service surface
//!
//! The transport (socket daemon, future HTTP frontends) is a thin shell;
//! every operation of the query/command surface lives here as a typed
//! request/response pair over the [`Engine`] facade. Input validation
//! happens at this boundary, including the hard rejection of legacy
//! single-repo fields (`repo_root`, `file_path`, `file_paths`).

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compile_commands::CompileDbCache;
use crate::config::EngineConfig;
use crate::context::{ContextManager, ContextSelector};
use crate::error::{EngineError, Result};
use crate::extractor::{ExtractAction, ExtractorDriver, ParseResult};
use crate::orchestrator::{Orchestrator, QueryOutcome, QueryScope};
use crate::paths::FileKey;
use crate::recall::{CompositeRecaller, LexicalRecaller, Recaller, RecallHit, SearchMatch};
use crate::schema::{
    AnalysisContext, CallDirection, CallEdge, ContextFileState, ContextMode, FileState, Freshness,
    JobQueue, Reference, Symbol, SyncJob, Workspace,
};
use crate::store::writer::{spawn_writer, WriteOp, WriteOutcome, WriterHandle};
use crate::store::FactStore;
use crate::sync::{SyncEngine, SyncEvent};
use crate::workspace::{register_workspace, WorkspaceHandle};

/// Field names rejected everywhere (single-repo era)
const LEGACY_FIELDS: &[&str] = &["repo_root", "file_path", "file_paths"];

/// Reject requests still carrying single-repo era fields
pub fn reject_legacy_fields(params: &serde_json::Value) -> Result<()> {
    if let Some(map) = params.as_object() {
        for field in LEGACY_FIELDS {
            if map.contains_key(*field) {
                return Err(EngineError::Validation {
                    message: format!(
                        "legacy field {} is not supported; use workspace_id + file_key",
                        field
                    ),
                });
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Request/response shapes
// ----------------------------------------------------------------------

/// How a request names its analysis context
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AnalysisContextParam {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub base_ref: Option<String>,
    #[serde(default)]
    pub head_ref: Option<String>,
}

impl AnalysisContextParam {
    pub fn to_selector(&self) -> Result<ContextSelector> {
        let mode = match self.mode.as_deref() {
            None => None,
            Some(raw) => Some(ContextMode::parse(raw).ok_or_else(|| EngineError::Validation {
                message: format!("unknown context mode: {}", raw),
            })?),
        };
        Ok(ContextSelector {
            mode,
            context_id: self.context_id.clone(),
            base_ref: self.base_ref.clone(),
            head_ref: self.head_ref.clone(),
        })
    }
}

/// Optional repo/file scope
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScopeParam {
    #[serde(default)]
    pub entry_repos: Vec<String>,
    #[serde(default)]
    pub file_keys: Option<Vec<String>>,
}

impl ScopeParam {
    fn to_scope(&self) -> QueryScope {
        QueryScope {
            entry_repos: self.entry_repos.clone(),
            file_keys: self.file_keys.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SymbolQueryRequest {
    pub workspace_id: String,
    pub symbol: String,
    #[serde(default)]
    pub analysis_context: Option<AnalysisContextParam>,
    #[serde(default)]
    pub scope: Option<ScopeParam>,
    /// Call-graph direction; ignored by other queries
    #[serde(default)]
    pub direction: Option<CallDirection>,
}

#[derive(Debug, Deserialize)]
pub struct FileSymbolsRequest {
    pub workspace_id: String,
    pub file_key: String,
    #[serde(default)]
    pub analysis_context: Option<AnalysisContextParam>,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub file_keys: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOverlayRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub base_ref: Option<String>,
    #[serde(default)]
    pub head_ref: Option<String>,
    /// Explicit changed-file list, bypassing the git diff
    #[serde(default)]
    pub changed_files: Option<Vec<ChangedFileParam>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangedFileParam {
    pub file_key: String,
    pub state: FileState,
    #[serde(default)]
    pub replaced_from_file_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyncRepoRequest {
    pub workspace_id: String,
    pub repo_id: String,
    #[serde(default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub writer_queue_depth: usize,
    pub writer_queue_capacity: usize,
    pub oldest_pending_job_age_seconds: Option<i64>,
    pub contexts_active: u64,
    pub contexts_expired: u64,
    pub overlay_disk_usage_bytes: u64,
}

// ----------------------------------------------------------------------
// Engine facade
// ----------------------------------------------------------------------

/// One workspace's fully wired engine
pub struct Engine {
    pub config: EngineConfig,
    pub workspace: WorkspaceHandle,
    pub store: Arc<FactStore>,
    pub writer: WriterHandle,
    pub contexts: Arc<ContextManager>,
    pub driver: Arc<ExtractorDriver>,
    pub sync: Arc<SyncEngine>,
    orchestrator: Orchestrator,
    lexical: LexicalRecaller,
}

impl Engine {
    /// Wire every component over the workspace at `root` and register it
    pub async fn bootstrap(root: &Path, config: EngineConfig) -> Result<Self> {
        let workspace = WorkspaceHandle::load(root)?;
        let store = Arc::new(FactStore::open(root)?);
        let (writer, _writer_task) = spawn_writer(store.writer_connection()?, &config);

        let contexts = Arc::new(ContextManager::new(
            store.clone(),
            writer.clone(),
            config.clone(),
        ));
        let compile_dbs = Arc::new(CompileDbCache::new());
        let driver = Arc::new(ExtractorDriver::new(config.clone(), compile_dbs.clone()));
        let recaller: Arc<dyn Recaller> =
            Arc::new(CompositeRecaller::new(store.clone(), workspace.clone()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            writer.clone(),
            contexts.clone(),
            driver.clone(),
            recaller,
            workspace.clone(),
            config.clone(),
        );
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            writer.clone(),
            contexts.clone(),
            driver.clone(),
            compile_dbs,
            workspace.clone(),
            config.clone(),
        ));

        register_workspace(&store, &writer, &workspace).await?;
        contexts.ensure_baseline(&workspace.workspace_id).await?;

        let lexical = LexicalRecaller::new(workspace.clone());
        Ok(Self {
            config,
            workspace,
            store,
            writer,
            contexts,
            driver,
            sync,
            orchestrator,
            lexical,
        })
    }

    fn check_workspace(&self, workspace_id: &str) -> Result<()> {
        if workspace_id != self.workspace.workspace_id {
            return Err(EngineError::NotFound {
                what: format!("workspace {}", workspace_id),
            });
        }
        Ok(())
    }

    fn selector(param: &Option<AnalysisContextParam>) -> Result<ContextSelector> {
        match param {
            Some(p) => p.to_selector(),
            None => Ok(ContextSelector::default()),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn query_references(
        &self,
        req: &SymbolQueryRequest,
    ) -> Result<QueryOutcome<Vec<Reference>>> {
        self.check_workspace(&req.workspace_id)?;
        let selector = Self::selector(&req.analysis_context)?;
        let scope = req.scope.clone().unwrap_or_default().to_scope();
        self.orchestrator
            .references(&req.workspace_id, &req.symbol, &selector, &scope)
            .await
    }

    pub async fn query_definition(
        &self,
        req: &SymbolQueryRequest,
    ) -> Result<QueryOutcome<Vec<Symbol>>> {
        self.check_workspace(&req.workspace_id)?;
        let selector = Self::selector(&req.analysis_context)?;
        let scope = req.scope.clone().unwrap_or_default().to_scope();
        self.orchestrator
            .definition(&req.workspace_id, &req.symbol, &selector, &scope)
            .await
    }

    pub async fn query_call_graph(
        &self,
        req: &SymbolQueryRequest,
    ) -> Result<QueryOutcome<Vec<CallEdge>>> {
        self.check_workspace(&req.workspace_id)?;
        let selector = Self::selector(&req.analysis_context)?;
        let scope = req.scope.clone().unwrap_or_default().to_scope();
        self.orchestrator
            .call_graph(
                &req.workspace_id,
                &req.symbol,
                req.direction.unwrap_or_default(),
                &selector,
                &scope,
            )
            .await
    }

    pub async fn query_file_symbols(
        &self,
        req: &FileSymbolsRequest,
    ) -> Result<QueryOutcome<Vec<Symbol>>> {
        self.check_workspace(&req.workspace_id)?;
        let selector = Self::selector(&req.analysis_context)?;
        self.orchestrator
            .file_symbols(&req.workspace_id, &req.file_key, &selector)
            .await
    }

    // ------------------------------------------------------------------
    // Exploration tools
    // ------------------------------------------------------------------

    /// Recall candidates without classification or parsing
    pub async fn explore_list_candidates(
        &self,
        workspace_id: &str,
        symbol: &str,
        context: &Option<AnalysisContextParam>,
        entry_repos: &[String],
    ) -> Result<Vec<RecallHit>> {
        self.check_workspace(workspace_id)?;
        let selector = Self::selector(context)?;
        let chain = self.contexts.resolve(workspace_id, &selector).await?;
        let repos = if entry_repos.is_empty() {
            self.workspace.manifest.repo_ids()
        } else {
            self.workspace
                .manifest
                .close_over_deps(entry_repos, self.config.max_repo_hops)
        };
        let recaller = CompositeRecaller::new(self.store.clone(), self.workspace.clone());
        recaller.recall(&chain, symbol, &repos, 512)
    }

    pub async fn explore_classify_freshness(
        &self,
        workspace_id: &str,
        context: &Option<AnalysisContextParam>,
        file_keys: Vec<String>,
    ) -> Result<Vec<(String, Freshness)>> {
        self.check_workspace(workspace_id)?;
        let selector = Self::selector(context)?;
        self.orchestrator
            .classify_candidates(workspace_id, &selector, file_keys)
            .await
    }

    /// Parse one file immediately and persist its facts
    pub async fn explore_parse_file(
        &self,
        workspace_id: &str,
        context: &Option<AnalysisContextParam>,
        file_key: &str,
    ) -> Result<serde_json::Value> {
        self.check_workspace(workspace_id)?;
        let selector = Self::selector(context)?;
        let chain = self.contexts.resolve(workspace_id, &selector).await?;
        let key = FileKey::parse(file_key)?;
        let result = self
            .driver
            .parse_file(
                &self.workspace,
                &chain.context.context_id,
                &key,
                ExtractAction::All,
            )
            .await?;
        match result {
            ParseResult::Parsed(parsed) => {
                let parsed = *parsed;
                let symbol_count = parsed.facts.symbols.len();
                let reference_count = parsed.facts.references.len();
                self.writer
                    .submit(WriteOp::UpsertFileFacts(Box::new(parsed.facts)))
                    .await?;
                let _ = self
                    .writer
                    .submit(WriteOp::RecordParseRun(parsed.run))
                    .await;
                Ok(serde_json::json!({
                    "parsed": true,
                    "symbols": symbol_count,
                    "references": reference_count,
                    "warnings": parsed.warnings,
                    "diagnostics": parsed.diagnostics,
                }))
            }
            ParseResult::MissingFlags => Err(EngineError::MissingFlags {
                file_key: file_key.to_string(),
            }),
            ParseResult::Timeout => Err(EngineError::ExtractorTimeout {
                file_key: file_key.to_string(),
                seconds: self.config.parse_timeout.as_secs(),
            }),
            ParseResult::Failed { message } => Err(EngineError::ParseFailed {
                file_key: file_key.to_string(),
                message,
            }),
        }
    }

    pub async fn explore_fetch_symbols(
        &self,
        workspace_id: &str,
        context: &Option<AnalysisContextParam>,
        file_keys: Vec<String>,
    ) -> Result<Vec<Symbol>> {
        self.check_workspace(workspace_id)?;
        let selector = Self::selector(context)?;
        let chain = self.contexts.resolve(workspace_id, &selector).await?;
        self.store.get_symbols_for_files(&chain, &file_keys)
    }

    pub async fn explore_fetch_references(
        &self,
        workspace_id: &str,
        context: &Option<AnalysisContextParam>,
        symbol: &str,
        scope_file_keys: Option<Vec<String>>,
    ) -> Result<Vec<Reference>> {
        self.check_workspace(workspace_id)?;
        let selector = Self::selector(context)?;
        let chain = self.contexts.resolve(workspace_id, &selector).await?;
        self.store
            .get_references(&chain, symbol, scope_file_keys.as_deref())
    }

    pub async fn explore_fetch_call_edges(
        &self,
        workspace_id: &str,
        context: &Option<AnalysisContextParam>,
        symbol: &str,
        direction: CallDirection,
    ) -> Result<Vec<CallEdge>> {
        self.check_workspace(workspace_id)?;
        let selector = Self::selector(context)?;
        let chain = self.contexts.resolve(workspace_id, &selector).await?;
        self.store.get_call_edges(&chain, symbol, direction)
    }

    /// Read file bytes by file_key (UTF-8 lossy)
    pub fn explore_read_file(&self, workspace_id: &str, file_key: &str) -> Result<String> {
        self.check_workspace(workspace_id)?;
        let key = FileKey::parse(file_key)?;
        let abs = self
            .workspace
            .abs_for_key(&key)
            .ok_or_else(|| EngineError::NotFound {
                what: format!("repo {}", key.repo_id),
            })?;
        let bytes = std::fs::read(&abs).map_err(|e| EngineError::NotFound {
            what: format!("{}: {}", file_key, e),
        })?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Raw lexical search (the `rg-search` tool)
    pub fn explore_rg_search(
        &self,
        workspace_id: &str,
        pattern: &str,
        entry_repos: &[String],
        limit: usize,
    ) -> Result<Vec<SearchMatch>> {
        self.check_workspace(workspace_id)?;
        let repos = if entry_repos.is_empty() {
            self.workspace.manifest.repo_ids()
        } else {
            entry_repos.to_vec()
        };
        self.lexical
            .search_matches(&repos, pattern, limit.clamp(1, 1000))
    }

    /// Envelope for an explicit candidate set, classification only
    pub async fn explore_get_confidence(
        &self,
        workspace_id: &str,
        context: &Option<AnalysisContextParam>,
        file_keys: Vec<String>,
    ) -> Result<crate::schema::ConfidenceEnvelope> {
        self.check_workspace(workspace_id)?;
        let selector = Self::selector(context)?;
        let chain = {
            let selector = selector.clone();
            self.contexts.resolve(workspace_id, &selector).await?
        };
        let classified = self
            .orchestrator
            .classify_candidates(workspace_id, &selector, file_keys)
            .await?;

        let mut envelope = crate::schema::ConfidenceEnvelope {
            overlay_mode: chain.context.overlay_mode.as_str().to_string(),
            ..Default::default()
        };
        let mut per_repo: std::collections::BTreeMap<String, (u64, u64)> = Default::default();
        for (key, freshness) in classified {
            let repo = FileKey::parse(&key).map(|k| k.repo_id).unwrap_or_default();
            let entry = per_repo.entry(repo).or_insert((0, 0));
            entry.1 += 1;
            match freshness {
                Freshness::Fresh => {
                    entry.0 += 1;
                    envelope.verified_files.push(key);
                }
                Freshness::Stale => envelope.stale_files.push(key),
                Freshness::Unparsed => envelope.unparsed_files.push(key),
                Freshness::MissingFlags => {
                    envelope.warn(format!("missing_flags: {}", key));
                    envelope.unparsed_files.push(key);
                }
            }
        }
        for (repo, (ok, total)) in per_repo {
            if total > 0 && !repo.is_empty() {
                envelope.repo_coverage.insert(repo, ok as f64 / total as f64);
            }
        }
        if envelope.verified_files.is_empty()
            && envelope.stale_files.is_empty()
            && envelope.unparsed_files.is_empty()
        {
            envelope.warn("no_candidates");
        }
        Ok(envelope)
    }

    /// Sanitised, remapped compile command for a file
    pub fn explore_get_compile_command(
        &self,
        workspace_id: &str,
        file_key: &str,
    ) -> Result<Option<Vec<String>>> {
        self.check_workspace(workspace_id)?;
        let key = FileKey::parse(file_key)?;
        let abs = self
            .workspace
            .abs_for_key(&key)
            .ok_or_else(|| EngineError::NotFound {
                what: format!("repo {}", key.repo_id),
            })?;
        self.driver.compile_args(&self.workspace, &key, &abs)
    }

    // ------------------------------------------------------------------
    // Cache & context lifecycle
    // ------------------------------------------------------------------

    pub async fn cache_invalidate(&self, req: &InvalidateRequest) -> Result<u64> {
        self.check_workspace(&req.workspace_id)?;
        let context_id = req
            .context_id
            .clone()
            .unwrap_or_else(|| AnalysisContext::baseline_id(&req.workspace_id));
        match self
            .writer
            .submit(WriteOp::Invalidate {
                context_id,
                file_keys: req.file_keys.clone(),
            })
            .await?
        {
            WriteOutcome::Count(n) => Ok(n),
            _ => Ok(0),
        }
    }

    pub async fn context_create_pr_overlay(
        &self,
        req: &CreateOverlayRequest,
    ) -> Result<AnalysisContext> {
        self.check_workspace(&req.workspace_id)?;
        match (&req.changed_files, &req.base_ref, &req.head_ref) {
            (Some(files), _, _) => {
                let states: Vec<ContextFileState> = files
                    .iter()
                    .map(|f| {
                        let key = FileKey::parse(&f.file_key)?;
                        Ok(ContextFileState {
                            file_key: key.display_key(),
                            state: f.state,
                            replaced_from_file_key: f.replaced_from_file_key.clone(),
                        })
                    })
                    .collect::<Result<_>>()?;
                self.contexts
                    .create_pr_overlay(&req.workspace_id, states)
                    .await
            }
            (None, Some(base_ref), Some(head_ref)) => {
                self.contexts
                    .materialize_pr_overlay(
                        &req.workspace_id,
                        &self.workspace.root,
                        &self.workspace.manifest,
                        base_ref,
                        head_ref,
                    )
                    .await
            }
            _ => Err(EngineError::Validation {
                message: "provide changed_files or base_ref + head_ref".into(),
            }),
        }
    }

    pub async fn context_expire(&self, context_id: &str) -> Result<u64> {
        self.contexts.expire(context_id).await
    }

    // ------------------------------------------------------------------
    // Workspace lifecycle
    // ------------------------------------------------------------------

    pub fn workspace_get(&self, workspace_id: &str) -> Result<Workspace> {
        self.check_workspace(workspace_id)?;
        self.store
            .get_workspace(workspace_id)?
            .ok_or_else(|| EngineError::NotFound {
                what: format!("workspace {}", workspace_id),
            })
    }

    /// Reload the manifest from disk and re-register
    pub async fn workspace_refresh_manifest(&mut self) -> Result<Workspace> {
        let reloaded = WorkspaceHandle::load(&self.workspace.root)?;
        let workspace = register_workspace(&self.store, &self.writer, &reloaded).await?;
        self.workspace = reloaded;
        Ok(workspace)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    pub async fn sync_repo(&self, req: &SyncRepoRequest) -> Result<SyncJob> {
        self.check_workspace(&req.workspace_id)?;
        let repo = self
            .workspace
            .manifest
            .repo(&req.repo_id)
            .ok_or_else(|| EngineError::NotFound {
                what: format!("repo {}", req.repo_id),
            })?;
        let sha = match (&req.commit_sha, &repo.commit_sha) {
            (Some(sha), _) => sha.clone(),
            (None, Some(pinned)) => pinned.clone(),
            (None, None) => {
                let root =
                    self.workspace
                        .repo_root(&req.repo_id)
                        .ok_or_else(|| EngineError::NotFound {
                            what: format!("repo root for {}", req.repo_id),
                        })?;
                crate::git::head_sha(&root).map_err(|e| EngineError::SyncCheckoutFailed {
                    repo_id: req.repo_id.clone(),
                    message: format!("cannot resolve HEAD: {}", e),
                })?
            }
        };
        let event = SyncEvent {
            repo_id: repo.repo_id.clone(),
            ref_name: req
                .ref_name
                .clone()
                .unwrap_or_else(|| repo.default_branch.clone()),
            event_type: "manual".into(),
            event_sha: sha,
        };
        self.sync.enqueue_repo_sync(&event).await
    }

    /// Enqueue several repo syncs in one call
    pub async fn sync_batch(&self, requests: &[SyncRepoRequest]) -> Result<Vec<SyncJob>> {
        let mut jobs = Vec::with_capacity(requests.len());
        for req in requests {
            jobs.push(self.sync_repo(req).await?);
        }
        Ok(jobs)
    }

    pub async fn sync_all_repos(&self, workspace_id: &str) -> Result<Vec<SyncJob>> {
        self.check_workspace(workspace_id)?;
        let mut jobs = Vec::new();
        for repo_id in self.workspace.manifest.repo_ids() {
            let req = SyncRepoRequest {
                workspace_id: workspace_id.to_string(),
                repo_id,
                ref_name: None,
                commit_sha: None,
            };
            match self.sync_repo(&req).await {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("sync_all: {}", e),
            }
        }
        Ok(jobs)
    }

    pub fn sync_job_status(&self, job_id: &str) -> Result<SyncJob> {
        for queue in [JobQueue::RepoSync, JobQueue::Index] {
            if let Some(job) = self.store.get_job(queue, job_id)? {
                return Ok(job);
            }
        }
        Err(EngineError::NotFound {
            what: format!("job {}", job_id),
        })
    }

    pub async fn webhook_gitlab(&self, payload: &serde_json::Value) -> Result<Vec<SyncJob>> {
        self.sync.ingest_gitlab_webhook(payload).await
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn health(&self) -> Result<HealthReport> {
        let (active, expired) = self.store.context_counts(&self.workspace.workspace_id)?;
        let oldest = self.store.oldest_pending_job()?;
        let oldest_age = oldest.and_then(|created| {
            chrono::DateTime::parse_from_rfc3339(&created)
                .ok()
                .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds())
        });
        Ok(HealthReport {
            writer_queue_depth: self.writer.queue_depth(),
            writer_queue_capacity: self.writer.queue_capacity(),
            oldest_pending_job_age_seconds: oldest_age,
            contexts_active: active,
            contexts_expired: expired,
            overlay_disk_usage_bytes: self.store.disk_usage_bytes(),
        })
    }

    /// Spawn the long-running background tasks (GC, sync workers)
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = vec![self.contexts.spawn_gc()];
        tasks.extend(self.sync.spawn_workers());
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_fields_are_rejected() {
        let params = serde_json::json!({
            "workspace_id": "ws1",
            "repo_root": "/old/way",
            "symbol": "foo"
        });
        let err = reject_legacy_fields(&params).unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let clean = serde_json::json!({"workspace_id": "ws1", "symbol": "foo"});
        assert!(reject_legacy_fields(&clean).is_ok());
    }

    #[test]
    fn context_param_validates_mode() {
        let param = AnalysisContextParam {
            mode: Some("pr".into()),
            context_id: Some("abc".into()),
            ..Default::default()
        };
        let selector = param.to_selector().unwrap();
        assert_eq!(selector.mode, Some(ContextMode::Pr));

        let bad = AnalysisContextParam {
            mode: Some("nonsense".into()),
            ..Default::default()
        };
        assert!(bad.to_selector().is_err());
    }
}

//! Context manager: baselines, PR overlays, TTL and caps
//!
//! Baseline contexts are created at workspace registration and live with
//! the workspace's default branches. PR contexts are sparse overlays over
//! one baseline, created on demand from a changed-file list (or a
//! `base_ref..head_ref` diff), touched on every query resolve, and
//! reclaimed by the GC task once their TTL lapses.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::git;
use crate::manifest::Manifest;
use crate::paths::FileKey;
use crate::schema::{
    AnalysisContext, ContextFileState, ContextMode, ContextStatus, FileState, OverlayMode,
};
use crate::store::writer::{WriteOp, WriterHandle};
use crate::store::{ContextChain, FactStore};

/// RFC 3339 timestamp for `now`
///
/// Fixed microsecond precision keeps stored timestamps lexicographically
/// ordered, which the TTL and lease comparisons rely on.
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// RFC 3339 timestamp `duration` from now
pub fn rfc3339_after(duration: std::time::Duration) -> String {
    (chrono::Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default())
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// How a query names the context it wants
#[derive(Debug, Clone, Default)]
pub struct ContextSelector {
    pub mode: Option<ContextMode>,
    pub context_id: Option<String>,
    pub base_ref: Option<String>,
    pub head_ref: Option<String>,
}

/// Owner of context lifecycles
pub struct ContextManager {
    store: Arc<FactStore>,
    writer: WriterHandle,
    config: EngineConfig,

    /// In-memory index of recently resolved contexts
    index: RwLock<AHashMap<String, AnalysisContext>>,
}

impl ContextManager {
    pub fn new(store: Arc<FactStore>, writer: WriterHandle, config: EngineConfig) -> Self {
        Self {
            store,
            writer,
            config,
            index: RwLock::new(AHashMap::new()),
        }
    }

    /// Create (or fetch) the baseline context for a workspace
    pub async fn ensure_baseline(&self, workspace_id: &str) -> Result<AnalysisContext> {
        let baseline_id = AnalysisContext::baseline_id(workspace_id);
        if let Some(existing) = self.store.get_context(&baseline_id)? {
            self.remember(&existing);
            return Ok(existing);
        }
        let now = now_rfc3339();
        let context = AnalysisContext {
            context_id: baseline_id,
            workspace_id: workspace_id.to_string(),
            mode: ContextMode::Baseline,
            base_context_id: None,
            overlay_mode: OverlayMode::Full,
            overlay_file_count: 0,
            overlay_row_count: 0,
            status: ContextStatus::Active,
            created_at: now.clone(),
            last_accessed_at: now,
            expires_at: None,
        };
        self.writer
            .submit(WriteOp::UpsertContext(context.clone()))
            .await?;
        tracing::info!("created baseline context for workspace {}", workspace_id);
        self.remember(&context);
        Ok(context)
    }

    /// Create a sparse PR overlay from an explicit changed-file list
    ///
    /// `renamed` entries lacking a `replaced_from_file_key` degrade to
    /// `added`, since there is no old key to suppress.
    pub async fn create_pr_overlay(
        &self,
        workspace_id: &str,
        mut states: Vec<ContextFileState>,
    ) -> Result<AnalysisContext> {
        let base = self.ensure_baseline(workspace_id).await?;

        for state in &mut states {
            if state.state == FileState::Renamed && state.replaced_from_file_key.is_none() {
                state.state = FileState::Added;
            }
        }

        let carrying = states
            .iter()
            .filter(|s| s.state.carries_overlay_rows())
            .count();
        let overlay_mode = if carrying > self.config.max_overlay_files {
            tracing::warn!(
                "overlay for {} declares {} changed files (cap {}); creating in partial mode",
                workspace_id,
                carrying,
                self.config.max_overlay_files
            );
            OverlayMode::PartialOverlay
        } else {
            OverlayMode::Sparse
        };

        let now = now_rfc3339();
        let context = AnalysisContext {
            context_id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            mode: ContextMode::Pr,
            base_context_id: Some(base.context_id),
            overlay_mode,
            overlay_file_count: 0,
            overlay_row_count: 0,
            status: ContextStatus::Active,
            created_at: now.clone(),
            last_accessed_at: now,
            expires_at: Some(rfc3339_after(self.config.context_ttl)),
        };
        self.writer
            .submit(WriteOp::UpsertContext(context.clone()))
            .await?;
        self.writer
            .submit(WriteOp::PutFileStates {
                context_id: context.context_id.clone(),
                states,
            })
            .await?;

        // The writer may have flipped the mode on state load; re-read
        let context = self
            .store
            .get_context(&context.context_id)?
            .unwrap_or(context);
        self.remember(&context);
        tracing::info!(
            "created pr overlay {} over {} ({} changed files, mode {})",
            context.context_id,
            context.base_context_id.as_deref().unwrap_or("?"),
            carrying,
            context.overlay_mode.as_str()
        );
        Ok(context)
    }

    /// Materialise a PR overlay by diffing each repo between two refs
    pub async fn materialize_pr_overlay(
        &self,
        workspace_id: &str,
        workspace_root: &std::path::Path,
        manifest: &Manifest,
        base_ref: &str,
        head_ref: &str,
    ) -> Result<AnalysisContext> {
        let mut states = Vec::new();
        for repo in &manifest.repos {
            let repo_root = workspace_root.join(&repo.root);
            if !git::is_git_repo(&repo_root) {
                continue;
            }
            let changed = match git::changed_files(&repo_root, base_ref, head_ref) {
                Ok(files) => files,
                Err(e) => {
                    tracing::debug!(
                        "no diff for repo {} between {}..{}: {}",
                        repo.repo_id,
                        base_ref,
                        head_ref,
                        e
                    );
                    continue;
                }
            };
            for file in changed {
                let key = FileKey::new(&repo.repo_id, &file.path);
                states.push(ContextFileState {
                    file_key: key.display_key(),
                    state: file.state,
                    replaced_from_file_key: file
                        .old_path
                        .map(|old| FileKey::new(&repo.repo_id, old).display_key()),
                });
            }
        }
        self.create_pr_overlay(workspace_id, states).await
    }

    /// Resolve a context selector into a chain, touching access time
    pub async fn resolve(
        &self,
        workspace_id: &str,
        selector: &ContextSelector,
    ) -> Result<ContextChain> {
        let chain = match (selector.mode, &selector.context_id) {
            (Some(ContextMode::Pr), Some(context_id)) => {
                let chain = self.store.context_chain(context_id)?;
                if chain.context.status == ContextStatus::Expired {
                    return Err(EngineError::NotFound {
                        what: format!("context {} (expired)", context_id),
                    });
                }
                if chain.context.workspace_id != workspace_id {
                    return Err(EngineError::Validation {
                        message: format!(
                            "context {} belongs to workspace {}",
                            context_id, chain.context.workspace_id
                        ),
                    });
                }
                chain
            }
            (Some(ContextMode::Pr), None) => {
                let (Some(base_ref), Some(head_ref)) =
                    (&selector.base_ref, &selector.head_ref)
                else {
                    return Err(EngineError::Validation {
                        message: "pr context requires context_id or base_ref/head_ref".into(),
                    });
                };
                let workspace =
                    self.store
                        .get_workspace(workspace_id)?
                        .ok_or_else(|| EngineError::NotFound {
                            what: format!("workspace {}", workspace_id),
                        })?;
                let manifest = Manifest::load(std::path::Path::new(&workspace.manifest_path))?;
                let context = self
                    .materialize_pr_overlay(
                        workspace_id,
                        std::path::Path::new(&workspace.root_path),
                        &manifest,
                        base_ref,
                        head_ref,
                    )
                    .await?;
                self.store.context_chain(&context.context_id)?
            }
            _ => {
                let baseline = self.ensure_baseline(workspace_id).await?;
                self.store.context_chain(&baseline.context_id)?
            }
        };

        self.touch(&chain.context).await?;
        self.remember(&chain.context);
        Ok(chain)
    }

    /// Touch last-access and extend PR expiry to `last_access + TTL`
    async fn touch(&self, context: &AnalysisContext) -> Result<()> {
        let expires_at = match context.mode {
            ContextMode::Pr => Some(rfc3339_after(self.config.context_ttl)),
            ContextMode::Baseline => None,
        };
        self.writer
            .submit(WriteOp::TouchContext {
                context_id: context.context_id.clone(),
                at: now_rfc3339(),
                expires_at,
            })
            .await?;
        Ok(())
    }

    /// Expire a context and reclaim its rows
    pub async fn expire(&self, context_id: &str) -> Result<u64> {
        let context = self
            .store
            .get_context(context_id)?
            .ok_or_else(|| EngineError::NotFound {
                what: format!("context {}", context_id),
            })?;
        if context.mode == ContextMode::Baseline {
            return Err(EngineError::Validation {
                message: "baseline contexts cannot be expired".into(),
            });
        }
        self.writer
            .submit(WriteOp::SetContextStatus {
                context_id: context_id.to_string(),
                status: ContextStatus::Expired,
            })
            .await?;
        let outcome = self
            .writer
            .submit(WriteOp::DeleteContextRows {
                context_id: context_id.to_string(),
            })
            .await?;
        self.index.write().remove(context_id);
        let reclaimed = match outcome {
            crate::store::writer::WriteOutcome::Count(n) => n,
            _ => 0,
        };
        tracing::info!("expired context {} ({} tracked rows reclaimed)", context_id, reclaimed);
        Ok(reclaimed)
    }

    /// One GC sweep: expire every PR context past its TTL
    pub async fn gc_sweep(&self) -> Result<usize> {
        let now = now_rfc3339();
        let expired = self.store.expired_contexts(&now)?;
        let count = expired.len();
        for context in expired {
            if let Err(e) = self.expire(&context.context_id).await {
                tracing::warn!("gc failed to expire {}: {}", context.context_id, e);
            }
        }
        if count > 0 {
            tracing::info!("gc sweep expired {} contexts", count);
        }
        Ok(count)
    }

    /// Spawn the periodic GC task
    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.gc_sweep().await {
                    tracing::warn!("gc sweep failed: {}", e);
                }
            }
        })
    }

    /// Contexts currently held in the in-memory index
    pub fn cached_contexts(&self) -> Vec<AnalysisContext> {
        self.index.read().values().cloned().collect()
    }

    fn remember(&self, context: &AnalysisContext) {
        self.index
            .write()
            .insert(context.context_id.clone(), context.clone());
    }
}

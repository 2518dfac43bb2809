//! Query orchestrator: the five-stage answer pipeline
//!
//! 1. **Resolve**: turn `(workspace_id, analysis_context)` into a
//!    context chain (materialising a PR overlay if needed)
//! 2. **Recall**: candidate file_keys for the symbol over the repo scope
//! 3. **Classify**: live composite hash vs stored per candidate
//! 4. **Parse fan-out**: up to `max_parse_budget` stale/unparsed files
//!    through the extractor, persisted via the single writer
//! 5. **Read & assemble**: overlay-merged facts plus the confidence
//!    envelope
//!
//! Per-file failures never abort a query; they land in the envelope's
//! `unparsed_files` and `warnings`. When a sparse overlay has degraded to
//! `partial_overlay`, freshly parsed facts are refused by the writer and
//! served from memory instead (lazy parse).

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::context::{ContextManager, ContextSelector};
use crate::error::{EngineError, Result};
use crate::extractor::{ExtractAction, ExtractorDriver, ParseResult};
use crate::paths::{lookup_key, FileKey};
use crate::recall::Recaller;
use crate::schema::{
    CallDirection, CallEdge, ConfidenceEnvelope, FileState, Freshness, Reference, Symbol,
};
use crate::store::merge;
use crate::store::writer::{FileFacts, WriteOp, WriterHandle};
use crate::store::{ContextChain, FactStore};
use crate::workspace::WorkspaceHandle;

/// Cap on candidates taken from recall before classification
const RECALL_LIMIT: usize = 512;

/// A query answer plus its confidence envelope
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryOutcome<T> {
    pub results: T,
    pub confidence: ConfidenceEnvelope,
}

/// Optional scope restriction for a query
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    /// Entry repos, closed over `depends_on` up to `max_repo_hops`;
    /// empty means every repo in the manifest
    pub entry_repos: Vec<String>,

    /// Explicit file restriction (reference queries)
    pub file_keys: Option<Vec<String>>,
}

/// Glues recall, hashing, parsing, and the store into answers
pub struct Orchestrator {
    store: Arc<FactStore>,
    writer: WriterHandle,
    contexts: Arc<ContextManager>,
    driver: Arc<ExtractorDriver>,
    recaller: Arc<dyn Recaller>,
    workspace: WorkspaceHandle,
    config: EngineConfig,
}

/// Classification and parse bookkeeping shared by every query shape
struct Pipeline {
    chain: ContextChain,
    /// Candidates still visible through the overlay
    live: Vec<String>,
    /// Candidates verified absent via tombstones
    tombstoned: Vec<String>,
    fresh: Vec<String>,
    stale: Vec<String>,
    unparsed: Vec<String>,
    missing_flags: Vec<String>,
    /// Parsed this query and persisted
    reparsed: Vec<String>,
    /// Parsed this query but kept in memory (partial overlay)
    ephemeral: Vec<FileFacts>,
    envelope: ConfidenceEnvelope,
}

impl Orchestrator {
    pub fn new(
        store: Arc<FactStore>,
        writer: WriterHandle,
        contexts: Arc<ContextManager>,
        driver: Arc<ExtractorDriver>,
        recaller: Arc<dyn Recaller>,
        workspace: WorkspaceHandle,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            writer,
            contexts,
            driver,
            recaller,
            workspace,
            config,
        }
    }

    /// `POST /query/references`
    pub async fn references(
        &self,
        workspace_id: &str,
        symbol: &str,
        selector: &ContextSelector,
        scope: &QueryScope,
    ) -> Result<QueryOutcome<Vec<Reference>>> {
        let pipeline = self
            .run_pipeline(workspace_id, symbol, selector, scope)
            .await?;
        let mut results = self.store.get_references(
            &pipeline.chain,
            symbol,
            scope.file_keys.as_deref(),
        )?;
        for facts in &pipeline.ephemeral {
            results.extend(
                facts
                    .references
                    .iter()
                    .filter(|r| r.symbol_qualified_name == symbol)
                    .cloned(),
            );
        }
        let mut seen = ahash::AHashSet::new();
        results.retain(|r| seen.insert(r.clone()));
        Ok(self.finish(pipeline, results))
    }

    /// `POST /query/definition`
    pub async fn definition(
        &self,
        workspace_id: &str,
        symbol: &str,
        selector: &ContextSelector,
        scope: &QueryScope,
    ) -> Result<QueryOutcome<Vec<Symbol>>> {
        let pipeline = self
            .run_pipeline(workspace_id, symbol, selector, scope)
            .await?;
        let mut results = self.store.get_definitions(&pipeline.chain, symbol)?;
        for facts in &pipeline.ephemeral {
            results.extend(
                facts
                    .symbols
                    .iter()
                    .filter(|s| s.qualified_name == symbol)
                    .cloned(),
            );
        }
        results = merge::dedupe_symbols(results);
        Ok(self.finish(pipeline, results))
    }

    /// `POST /query/call-graph`
    pub async fn call_graph(
        &self,
        workspace_id: &str,
        symbol: &str,
        direction: CallDirection,
        selector: &ContextSelector,
        scope: &QueryScope,
    ) -> Result<QueryOutcome<Vec<CallEdge>>> {
        let pipeline = self
            .run_pipeline(workspace_id, symbol, selector, scope)
            .await?;
        let mut results =
            self.store
                .get_call_edges(&pipeline.chain, symbol, direction)?;
        for facts in &pipeline.ephemeral {
            results.extend(
                facts
                    .call_edges
                    .iter()
                    .filter(|e| match direction {
                        CallDirection::In => e.callee_qualified_name == symbol,
                        CallDirection::Out => e.caller_qualified_name == symbol,
                        CallDirection::Both => {
                            e.caller_qualified_name == symbol
                                || e.callee_qualified_name == symbol
                        }
                    })
                    .cloned(),
            );
        }
        let mut seen = ahash::AHashSet::new();
        results.retain(|e| seen.insert(e.clone()));
        Ok(self.finish(pipeline, results))
    }

    /// `POST /query/file-symbols`
    pub async fn file_symbols(
        &self,
        workspace_id: &str,
        file_key: &str,
        selector: &ContextSelector,
    ) -> Result<QueryOutcome<Vec<Symbol>>> {
        let key = FileKey::parse(file_key)?;
        let chain = self.contexts.resolve(workspace_id, selector).await?;
        let pipeline = self
            .classify_and_parse(chain, vec![key.display_key()], Vec::new())
            .await?;
        let mut results = self
            .store
            .get_file_symbols(&pipeline.chain, &key.display_key())?;
        for facts in &pipeline.ephemeral {
            if lookup_key(&facts.tracked.file_key) == key.lookup_key() {
                results.extend(facts.symbols.iter().cloned());
            }
        }
        results = merge::dedupe_symbols(results);
        Ok(self.finish(pipeline, results))
    }

    /// Stages 1–4 for symbol-shaped queries
    async fn run_pipeline(
        &self,
        workspace_id: &str,
        symbol: &str,
        selector: &ContextSelector,
        scope: &QueryScope,
    ) -> Result<Pipeline> {
        if symbol.trim().is_empty() {
            return Err(EngineError::Validation {
                message: "symbol must not be empty".into(),
            });
        }

        // Stage 1: resolve context
        let chain = self.contexts.resolve(workspace_id, selector).await?;

        // Stage 2: recall over the dependency-closed repo scope
        let repos = self.scope_repos(scope);
        let hits = self
            .recaller
            .recall(&chain, symbol, &repos, RECALL_LIMIT)?;
        let mut candidates: Vec<String> = hits.into_iter().map(|h| h.file_key).collect();
        if let Some(ref explicit) = scope.file_keys {
            let allowed: ahash::AHashSet<String> =
                explicit.iter().map(|k| lookup_key(k)).collect();
            candidates.retain(|k| allowed.contains(&lookup_key(k)));
        }

        self.classify_and_parse(chain, candidates, Vec::new()).await
    }

    /// Stages 3–4 over an explicit candidate list
    async fn classify_and_parse(
        &self,
        chain: ContextChain,
        candidates: Vec<String>,
        mut warnings: Vec<String>,
    ) -> Result<Pipeline> {
        let started = Instant::now();
        let states = chain.state_index();

        // Tombstoned candidates are verified-absent; the rest stay live
        let mut tombstoned = Vec::new();
        let mut seen = ahash::AHashSet::new();
        let mut live = Vec::new();
        for key in candidates {
            if !seen.insert(lookup_key(&key)) {
                continue;
            }
            if states.state_of(&key) == Some(FileState::Deleted) {
                tombstoned.push(key);
            } else {
                live.push(key);
            }
        }

        // Stage 3: freshness classification (parallel hash sweep)
        let classified = {
            let driver = self.driver.clone();
            let store = self.store.clone();
            let workspace = self.workspace.clone();
            let chain_cl = chain.clone();
            let keys = live.clone();
            tokio::task::spawn_blocking(move || {
                keys.par_iter()
                    .map(|display| {
                        let key = match FileKey::parse(display) {
                            Ok(k) => k,
                            Err(_) => {
                                return (display.clone(), Freshness::Unparsed, Vec::new())
                            }
                        };
                        match driver.classify(&workspace, &store, &chain_cl, &key) {
                            Ok((freshness, _, warnings)) => {
                                (display.clone(), freshness, warnings)
                            }
                            Err(e) => (
                                display.clone(),
                                Freshness::Unparsed,
                                vec![format!("classification failed: {}", e)],
                            ),
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .await
            .map_err(|e| EngineError::internal(format!("classification panicked: {}", e)))?
        };

        let mut pipeline = Pipeline {
            chain,
            live,
            tombstoned,
            fresh: Vec::new(),
            stale: Vec::new(),
            unparsed: Vec::new(),
            missing_flags: Vec::new(),
            reparsed: Vec::new(),
            ephemeral: Vec::new(),
            envelope: ConfidenceEnvelope::default(),
        };
        for warning in warnings.drain(..) {
            pipeline.envelope.warn(warning);
        }
        for (key, freshness, extra) in classified {
            for warning in extra {
                pipeline.envelope.warn(warning);
            }
            match freshness {
                Freshness::Fresh => pipeline.fresh.push(key),
                Freshness::Stale => pipeline.stale.push(key),
                Freshness::Unparsed => pipeline.unparsed.push(key),
                Freshness::MissingFlags => pipeline.missing_flags.push(key),
            }
        }

        // Stage 4: bounded parse fan-out under the query deadline
        let mut to_parse: Vec<String> = pipeline
            .stale
            .iter()
            .chain(pipeline.unparsed.iter())
            .cloned()
            .collect();
        if to_parse.len() > self.config.max_parse_budget {
            pipeline.envelope.warn("budget_exceeded");
            // Files past the budget stay unverified this query and are
            // reported as unparsed, whatever their classification said
            let excess = to_parse.split_off(self.config.max_parse_budget);
            pipeline.unparsed.extend(excess);
        }

        if !to_parse.is_empty() {
            let remaining = self
                .config
                .query_deadline
                .saturating_sub(started.elapsed());
            self.parse_fanout(&mut pipeline, to_parse.clone(), remaining)
                .await;

            // Selected files that never made it into the store (failed,
            // timed out, or cancelled at the deadline) are unverified too
            let reparsed: ahash::AHashSet<String> =
                pipeline.reparsed.iter().map(|k| lookup_key(k)).collect();
            pipeline.unparsed.extend(
                to_parse
                    .into_iter()
                    .filter(|k| !reparsed.contains(&lookup_key(k))),
            );
        }
        Ok(pipeline)
    }

    async fn parse_fanout(
        &self,
        pipeline: &mut Pipeline,
        to_parse: Vec<String>,
        deadline: std::time::Duration,
    ) {
        let context_id = pipeline.chain.context.context_id.clone();
        // Sparse overlays hold rows only for changed files; an unchanged
        // file going stale (header drift) reparses into the baseline
        let states = pipeline.chain.state_index();
        let target_for = |key: &str| -> String {
            if pipeline.chain.overlay_id().is_some() && states.overlay_visible(key) {
                context_id.clone()
            } else {
                pipeline.chain.baseline_id().to_string()
            }
        };

        let parses = to_parse.iter().map(|display| {
            let driver = self.driver.clone();
            let workspace = self.workspace.clone();
            let ctx = target_for(display);
            let display = display.clone();
            async move {
                let key = FileKey::parse(&display)?;
                let result = driver
                    .parse_file(&workspace, &ctx, &key, ExtractAction::All)
                    .await?;
                Ok::<(String, ParseResult), EngineError>((display, result))
            }
        });

        let all = futures_util::future::join_all(parses);
        let outcomes = match tokio::time::timeout(deadline, all).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                // Outstanding subprocesses die with their dropped futures;
                // whatever persisted before the deadline stays cached
                tracing::warn!(
                    "query deadline hit; cancelled parses for context {}",
                    context_id
                );
                pipeline.envelope.warn("budget_exceeded");
                return;
            }
        };

        for outcome in outcomes {
            match outcome {
                Ok((display, ParseResult::Parsed(parsed))) => {
                    let parsed = *parsed;
                    for warning in parsed.warnings {
                        pipeline.envelope.warn(warning);
                    }
                    let run = parsed.run;
                    let facts = parsed.facts;
                    match self
                        .writer
                        .submit(WriteOp::UpsertFileFacts(Box::new(facts.clone())))
                        .await
                    {
                        Ok(_) => {
                            pipeline.reparsed.push(display);
                        }
                        Err(EngineError::OverlayCapExceeded { .. }) => {
                            tracing::debug!(
                                "overlay cap: serving {} from memory",
                                facts.tracked.file_key
                            );
                            pipeline.reparsed.push(display);
                            pipeline.ephemeral.push(facts);
                        }
                        Err(e) => {
                            pipeline.envelope.warn(format!("persist failed: {}", e));
                            pipeline.unparsed.push(display);
                        }
                    }
                    let _ = self.writer.submit(WriteOp::RecordParseRun(run)).await;
                }
                Ok((display, ParseResult::MissingFlags)) => {
                    pipeline.missing_flags.push(display);
                }
                Ok((display, ParseResult::Timeout)) => {
                    pipeline
                        .envelope
                        .warn(format!("parse_timeout: {}", display));
                    pipeline.unparsed.push(display);
                }
                Ok((display, ParseResult::Failed { message })) => {
                    pipeline
                        .envelope
                        .warn(format!("parse_failed: {}: {}", display, message));
                    pipeline.unparsed.push(display);
                }
                Err(e) => {
                    pipeline.envelope.warn(format!("parse error: {}", e));
                }
            }
        }
    }

    /// Stage 5: fold the pipeline into the confidence envelope
    fn finish<T>(&self, mut pipeline: Pipeline, results: T) -> QueryOutcome<T> {
        let mut envelope = std::mem::take(&mut pipeline.envelope);

        let mut verified = pipeline.fresh.clone();
        verified.extend(pipeline.reparsed.iter().cloned());
        verified.extend(pipeline.tombstoned.iter().cloned());
        let mut unparsed = pipeline.unparsed.clone();
        for key in &pipeline.missing_flags {
            envelope.warn(format!("missing_flags: {}", key));
            unparsed.push(key.clone());
        }

        // Canonicalise the buckets: each file lands in exactly one list.
        // Verified wins, then unparsed (budget and parse casualties),
        // then stale, so a stale file demoted by the budget reports as
        // unparsed rather than showing up twice.
        let verified = dedupe_sorted(verified);
        let verified_set: ahash::AHashSet<String> =
            verified.iter().map(|k| lookup_key(k)).collect();
        unparsed.retain(|k| !verified_set.contains(&lookup_key(k)));
        let unparsed = dedupe_sorted(unparsed);
        let unparsed_set: ahash::AHashSet<String> =
            unparsed.iter().map(|k| lookup_key(k)).collect();
        let stale = dedupe_sorted(
            pipeline
                .stale
                .iter()
                .filter(|k| {
                    !verified_set.contains(&lookup_key(k))
                        && !unparsed_set.contains(&lookup_key(k))
                })
                .cloned()
                .collect(),
        );

        if pipeline.live.is_empty() && pipeline.tombstoned.is_empty() {
            envelope.warn("no_candidates");
        }

        // Per-repo coverage over this query's candidates
        let mut per_repo: std::collections::BTreeMap<String, (u64, u64)> =
            std::collections::BTreeMap::new();
        let mut bump = |key: &str, verified: bool| {
            if let Ok(parsed) = FileKey::parse(key) {
                let entry = per_repo.entry(parsed.repo_id).or_insert((0, 0));
                entry.1 += 1;
                if verified {
                    entry.0 += 1;
                }
            }
        };
        for key in &verified {
            bump(key, true);
        }
        for key in stale.iter().chain(unparsed.iter()) {
            bump(key, false);
        }
        for (repo, (ok, total)) in per_repo {
            if total > 0 {
                envelope.repo_coverage.insert(repo, ok as f64 / total as f64);
            }
        }

        // Overlay mode may have flipped mid-query (cap breach)
        let overlay_mode = self
            .store
            .get_context(&pipeline.chain.context.context_id)
            .ok()
            .flatten()
            .map(|c| c.overlay_mode)
            .unwrap_or(pipeline.chain.context.overlay_mode);
        envelope.overlay_mode = overlay_mode.as_str().to_string();

        envelope.verified_files = verified;
        envelope.stale_files = stale;
        envelope.unparsed_files = unparsed;

        QueryOutcome {
            results,
            confidence: envelope,
        }
    }

    /// Entry repos closed over `depends_on`
    fn scope_repos(&self, scope: &QueryScope) -> Vec<String> {
        let manifest = &self.workspace.manifest;
        if scope.entry_repos.is_empty() {
            manifest.repo_ids()
        } else {
            manifest.close_over_deps(&scope.entry_repos, self.config.max_repo_hops)
        }
    }

    /// Classification-only view for the exploration surface
    pub async fn classify_candidates(
        &self,
        workspace_id: &str,
        selector: &ContextSelector,
        file_keys: Vec<String>,
    ) -> Result<Vec<(String, Freshness)>> {
        let chain = self.contexts.resolve(workspace_id, selector).await?;
        let driver = self.driver.clone();
        let store = self.store.clone();
        let workspace = self.workspace.clone();
        tokio::task::spawn_blocking(move || {
            file_keys
                .par_iter()
                .map(|display| {
                    let freshness = FileKey::parse(display)
                        .ok()
                        .and_then(|key| {
                            driver
                                .classify(&workspace, &store, &chain, &key)
                                .ok()
                                .map(|(f, _, _)| f)
                        })
                        .unwrap_or(Freshness::Unparsed);
                    (display.clone(), freshness)
                })
                .collect()
        })
        .await
        .map_err(|e| EngineError::internal(format!("classification panicked: {}", e)))
    }
}

fn dedupe_sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys.dedup_by(|a, b| lookup_key(a) == lookup_key(b));
    keys
}

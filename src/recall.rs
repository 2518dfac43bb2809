//! Candidate recall for symbol queries
//!
//! Recall produces candidate file_keys that *might* mention a symbol;
//! precision comes later from parsed facts. Two backends sit behind the
//! [`Recaller`] trait:
//!
//! 1. **FTS**: the `recall_fts` table, populated at fact-persist time
//! 2. **Lexical scan**: a ripgrep-style sweep over the repo worktree,
//!    used for repos that have no FTS snapshot yet
//!
//! The composite recaller merges FTS hits first, then lexical hits,
//! deduplicated by case-folded file_key.

use std::sync::Arc;

use grep_matcher::Matcher;
use grep_regex::RegexMatcher;
use grep_searcher::sinks::UTF8;
use grep_searcher::{BinaryDetection, SearcherBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::paths::{self, FileKey};
use crate::store::{ContextChain, FactStore};
use crate::workspace::{is_cxx_file, WorkspaceHandle};

/// Where a recall hit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallSource {
    Fts,
    Lexical,
}

/// One candidate file for a symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallHit {
    pub file_key: String,
    pub repo_id: String,
    pub source: RecallSource,
}

/// Produces candidate file_keys for a symbol within a repo scope
pub trait Recaller: Send + Sync {
    fn recall(
        &self,
        chain: &ContextChain,
        symbol: &str,
        repos: &[String],
        limit: usize,
    ) -> Result<Vec<RecallHit>>;
}

/// The unqualified search term of a possibly-qualified symbol
pub fn symbol_term(symbol: &str) -> &str {
    symbol.rsplit("::").next().unwrap_or(symbol).trim()
}

// ----------------------------------------------------------------------
// FTS backend
// ----------------------------------------------------------------------

/// Recall over the store's FTS snapshot
pub struct FtsRecaller {
    store: Arc<FactStore>,
}

impl FtsRecaller {
    pub fn new(store: Arc<FactStore>) -> Self {
        Self { store }
    }
}

impl Recaller for FtsRecaller {
    fn recall(
        &self,
        chain: &ContextChain,
        symbol: &str,
        repos: &[String],
        limit: usize,
    ) -> Result<Vec<RecallHit>> {
        let term = symbol_term(symbol);
        let mut context_ids = vec![chain.baseline_id().to_string()];
        if let Some(overlay) = chain.overlay_id() {
            context_ids.push(overlay.to_string());
        }
        let keys = self
            .store
            .fts_candidates(&context_ids, term, repos, limit)?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                let parsed = FileKey::parse(&key).ok()?;
                Some(RecallHit {
                    file_key: key,
                    repo_id: parsed.repo_id,
                    source: RecallSource::Fts,
                })
            })
            .collect())
    }
}

// ----------------------------------------------------------------------
// Lexical backend
// ----------------------------------------------------------------------

/// Word-boundary lexical sweep over repo worktrees
///
/// Respects `.gitignore` automatically via the `ignore` crate and stops
/// per file at the first match; recall only needs the file set.
pub struct LexicalRecaller {
    workspace: WorkspaceHandle,
}

impl LexicalRecaller {
    pub fn new(workspace: WorkspaceHandle) -> Self {
        Self { workspace }
    }

    fn search_repo(&self, repo_id: &str, term: &str, limit: usize) -> Result<Vec<RecallHit>> {
        let Some(root) = self.workspace.repo_root(repo_id) else {
            return Ok(Vec::new());
        };
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!(r"\b{}\b", regex::escape(term));
        let matcher = RegexMatcher::new(&pattern).map_err(|e| EngineError::Validation {
            message: format!("bad symbol pattern: {}", e),
        })?;
        let mut searcher = SearcherBuilder::new()
            .binary_detection(BinaryDetection::quit(b'\x00'))
            .line_number(false)
            .build();

        let mut hits = Vec::new();
        for entry in WalkBuilder::new(&root).hidden(true).build() {
            if hits.len() >= limit {
                break;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().map_or(false, |t| t.is_file()) {
                continue;
            }
            if !is_cxx_file(entry.path()) {
                continue;
            }
            let mut matched = false;
            let result = searcher.search_path(
                &matcher,
                entry.path(),
                UTF8(|_lnum, _line| {
                    matched = true;
                    // First hit per file is enough
                    Ok(false)
                }),
            );
            if result.is_err() {
                continue;
            }
            if matched {
                if let Some(rel) = paths::rel_path_under(&root, entry.path()) {
                    let key = FileKey::new(repo_id, rel);
                    hits.push(RecallHit {
                        file_key: key.display_key(),
                        repo_id: repo_id.to_string(),
                        source: RecallSource::Lexical,
                    });
                }
            }
        }
        Ok(hits)
    }
}

/// A single lexical match with its location, for the exploration surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub file_key: String,

    /// Line number (1-indexed)
    pub line: u64,

    /// Column number (1-indexed, byte offset)
    pub column: u64,

    /// Content of the matching line
    pub content: String,
}

impl LexicalRecaller {
    /// Full match listing for a raw pattern (the `rg-search` tool)
    pub fn search_matches(
        &self,
        repos: &[String],
        pattern: &str,
        limit: usize,
    ) -> Result<Vec<SearchMatch>> {
        let matcher = RegexMatcher::new(pattern).map_err(|e| EngineError::Validation {
            message: format!("bad search pattern: {}", e),
        })?;
        let mut searcher = SearcherBuilder::new()
            .binary_detection(BinaryDetection::quit(b'\x00'))
            .line_number(true)
            .build();

        let mut matches = Vec::new();
        for repo_id in repos {
            let Some(root) = self.workspace.repo_root(repo_id) else {
                continue;
            };
            for entry in WalkBuilder::new(&root).hidden(true).build() {
                if matches.len() >= limit {
                    return Ok(matches);
                }
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if !entry.file_type().map_or(false, |t| t.is_file())
                    || !is_cxx_file(entry.path())
                {
                    continue;
                }
                let Some(rel) = paths::rel_path_under(&root, entry.path()) else {
                    continue;
                };
                let file_key = FileKey::new(repo_id, rel).display_key();
                let remaining = limit - matches.len();
                let collected: std::cell::RefCell<Vec<SearchMatch>> =
                    std::cell::RefCell::new(Vec::new());
                let _ = searcher.search_path(
                    &matcher,
                    entry.path(),
                    UTF8(|lnum, line| {
                        let column = matcher
                            .find(line.as_bytes())
                            .ok()
                            .flatten()
                            .map(|m| m.start() as u64 + 1)
                            .unwrap_or(1);
                        let mut out = collected.borrow_mut();
                        out.push(SearchMatch {
                            file_key: file_key.clone(),
                            line: lnum,
                            column,
                            content: line.trim_end().to_string(),
                        });
                        Ok(out.len() < remaining)
                    }),
                );
                matches.extend(collected.into_inner());
            }
        }
        Ok(matches)
    }
}

impl Recaller for LexicalRecaller {
    fn recall(
        &self,
        _chain: &ContextChain,
        symbol: &str,
        repos: &[String],
        limit: usize,
    ) -> Result<Vec<RecallHit>> {
        let term = symbol_term(symbol);
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits = Vec::new();
        for repo_id in repos {
            if hits.len() >= limit {
                break;
            }
            hits.extend(self.search_repo(repo_id, term, limit - hits.len())?);
        }
        Ok(hits)
    }
}

// ----------------------------------------------------------------------
// Composite
// ----------------------------------------------------------------------

/// FTS-first recall with lexical fallback per repo
pub struct CompositeRecaller {
    store: Arc<FactStore>,
    fts: FtsRecaller,
    lexical: LexicalRecaller,
}

impl CompositeRecaller {
    pub fn new(store: Arc<FactStore>, workspace: WorkspaceHandle) -> Self {
        Self {
            fts: FtsRecaller::new(store.clone()),
            lexical: LexicalRecaller::new(workspace),
            store,
        }
    }
}

impl Recaller for CompositeRecaller {
    fn recall(
        &self,
        chain: &ContextChain,
        symbol: &str,
        repos: &[String],
        limit: usize,
    ) -> Result<Vec<RecallHit>> {
        let mut hits = self.fts.recall(chain, symbol, repos, limit)?;

        // Repos without an FTS snapshot fall back to the lexical sweep
        let mut fallback_repos = Vec::new();
        for repo_id in repos {
            if !self.store.fts_has_snapshot(chain.baseline_id(), repo_id)? {
                fallback_repos.push(repo_id.clone());
            }
        }
        if !fallback_repos.is_empty() {
            tracing::debug!(
                "lexical recall fallback for repos without FTS snapshot: {:?}",
                fallback_repos
            );
            hits.extend(
                self.lexical
                    .recall(chain, symbol, &fallback_repos, limit)?,
            );
        }

        let mut seen = ahash::AHashSet::new();
        hits.retain(|hit| seen.insert(paths::lookup_key(&hit.file_key)));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_term_takes_last_segment() {
        assert_eq!(symbol_term("repoB::util::foo"), "foo");
        assert_eq!(symbol_term("bare_name"), "bare_name");
        assert_eq!(symbol_term("ns::"), "");
    }

    #[test]
    fn lexical_recall_finds_word_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("repoA/src")).unwrap();
        std::fs::write(
            dir.path().join(crate::workspace::MANIFEST_FILE),
            "workspace_id: ws1\nrepos:\n  - repo_id: repoA\n    root: repoA\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("repoA/src/x.cpp"),
            "int call_site() { return frobnicate(); }\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("repoA/src/other.cpp"),
            "int unrelated() { return frobnicated_not_a_word_match; }\n",
        )
        .unwrap();

        let workspace = WorkspaceHandle::load(dir.path()).unwrap();
        let recaller = LexicalRecaller::new(workspace);
        let hits = recaller
            .search_repo("repoA", "frobnicate", 100)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_key, "repoA:src/x.cpp");
        assert_eq!(hits[0].source, RecallSource::Lexical);
    }
}

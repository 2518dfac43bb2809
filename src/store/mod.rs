//! Fact store: persistence and overlay-aware reads
//!
//! The store owns one SQLite file per workspace. Reads go through this
//! module; every mutation goes through the single writer in
//! [`writer`]. Overlay-aware reads resolve a context chain (PR overlay
//! over baseline), load rows from both, and merge in memory per the rules
//! in [`merge`].

pub mod merge;
pub mod schema;
pub mod writer;

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{EngineError, Result};
use crate::schema::{
    AnalysisContext, CallDirection, CallEdge, ContextFileState, ContextMode, ContextStatus,
    FileState, IncludeDep, JobQueue, JobStatus, OverlayMode, Reference, Symbol, SyncJob,
    TrackedFile, Workspace,
};

use merge::StateIndex;

/// Subdirectory of the workspace root holding the store
pub const STORE_DIR: &str = ".symdex";

/// Database file name inside [`STORE_DIR`]
pub const STORE_FILE: &str = "index.db";

/// A resolved context chain: the queried context plus its baseline
///
/// For baseline queries `base` is `None` and `states` is empty.
#[derive(Debug, Clone)]
pub struct ContextChain {
    pub context: AnalysisContext,
    pub base: Option<AnalysisContext>,
    pub states: Vec<ContextFileState>,
}

impl ContextChain {
    /// The context whose rows shadow the baseline (the overlay), if any
    pub fn overlay_id(&self) -> Option<&str> {
        self.base.as_ref().map(|_| self.context.context_id.as_str())
    }

    /// The context that serves fall-through reads
    pub fn baseline_id(&self) -> &str {
        self.base
            .as_ref()
            .map(|b| b.context_id.as_str())
            .unwrap_or(self.context.context_id.as_str())
    }

    /// Build the in-memory state index for merging
    pub fn state_index(&self) -> StateIndex {
        StateIndex::new(&self.states)
    }
}

/// Read handle over the workspace store
///
/// Reads share one connection behind a mutex; WAL mode keeps them from
/// blocking the writer's transactions.
pub struct FactStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl FactStore {
    /// Open (creating if necessary) the store under a workspace root
    pub fn open(workspace_root: &Path) -> Result<Self> {
        let dir = workspace_root.join(STORE_DIR);
        std::fs::create_dir_all(&dir)?;
        Self::open_at(&dir.join(STORE_FILE))
    }

    /// Open a store at an explicit database path
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::configure_connection(&conn)?;
        schema::init_schema(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a second connection for the writer task
    pub fn writer_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        schema::configure_connection(&conn)?;
        Ok(conn)
    }

    /// Total on-disk size of the store (db + WAL)
    pub fn disk_usage_bytes(&self) -> u64 {
        let mut total = 0;
        for suffix in ["", "-wal", "-shm"] {
            let p = PathBuf::from(format!("{}{}", self.path.display(), suffix));
            if let Ok(meta) = std::fs::metadata(&p) {
                total += meta.len();
            }
        }
        total
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    pub fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT workspace_id, root_path, manifest_path, created_at, updated_at
                 FROM workspaces WHERE workspace_id = ?1",
                [workspace_id],
                |row| {
                    Ok(Workspace {
                        workspace_id: row.get(0)?,
                        root_path: row.get(1)?,
                        manifest_path: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    pub fn get_context(&self, context_id: &str) -> Result<Option<AnalysisContext>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT context_id, workspace_id, mode, base_context_id, overlay_mode,
                        overlay_file_count, overlay_row_count, status, created_at,
                        last_accessed_at, expires_at
                 FROM analysis_contexts WHERE context_id = ?1",
                [context_id],
                row_to_context,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Resolve a context chain for overlay-aware reads
    ///
    /// Expired contexts resolve like active ones; the context manager is
    /// responsible for refusing them upstream.
    pub fn context_chain(&self, context_id: &str) -> Result<ContextChain> {
        let context = self.get_context(context_id)?.ok_or_else(|| EngineError::NotFound {
            what: format!("context {}", context_id),
        })?;
        let base = match (context.mode, &context.base_context_id) {
            (ContextMode::Pr, Some(base_id)) => {
                Some(self.get_context(base_id)?.ok_or_else(|| EngineError::StoreCorrupt {
                    message: format!(
                        "context {} chains to missing baseline {}",
                        context_id, base_id
                    ),
                })?)
            }
            _ => None,
        };
        let states = if base.is_some() {
            self.get_file_states(context_id)?
        } else {
            Vec::new()
        };
        Ok(ContextChain {
            context,
            base,
            states,
        })
    }

    pub fn list_contexts(&self, workspace_id: &str) -> Result<Vec<AnalysisContext>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT context_id, workspace_id, mode, base_context_id, overlay_mode,
                        overlay_file_count, overlay_row_count, status, created_at,
                        last_accessed_at, expires_at
                 FROM analysis_contexts WHERE workspace_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map([workspace_id], row_to_context)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// Active PR contexts whose expiry has passed
    pub fn expired_contexts(&self, now: &str) -> Result<Vec<AnalysisContext>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT context_id, workspace_id, mode, base_context_id, overlay_mode,
                        overlay_file_count, overlay_row_count, status, created_at,
                        last_accessed_at, expires_at
                 FROM analysis_contexts
                 WHERE status = 'active' AND mode = 'pr'
                   AND expires_at IS NOT NULL AND expires_at < ?1",
            )?;
            let rows = stmt.query_map([now], row_to_context)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    pub fn get_file_states(&self, context_id: &str) -> Result<Vec<ContextFileState>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_key, state, replaced_from_file_key
                 FROM context_file_states WHERE context_id = ?1",
            )?;
            let rows = stmt.query_map([context_id], |row| {
                let state: String = row.get(1)?;
                Ok(ContextFileState {
                    file_key: row.get(0)?,
                    state: FileState::parse(&state).unwrap_or(FileState::Unchanged),
                    replaced_from_file_key: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    // ------------------------------------------------------------------
    // Tracked files & facts (overlay-aware)
    // ------------------------------------------------------------------

    /// Overlay-aware single tracked-file lookup
    pub fn get_tracked(&self, chain: &ContextChain, file_key: &str) -> Result<Option<TrackedFile>> {
        let states = chain.state_index();
        if let Some(overlay_id) = chain.overlay_id() {
            match states.state_of(file_key) {
                Some(FileState::Deleted) => return Ok(None),
                Some(s) if s.carries_overlay_rows() => {
                    return self.tracked_row(overlay_id, file_key);
                }
                _ => {}
            }
            if !states.baseline_visible(file_key) {
                return Ok(None);
            }
        }
        self.tracked_row(chain.baseline_id(), file_key)
    }

    fn tracked_row(&self, context_id: &str, file_key: &str) -> Result<Option<TrackedFile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT file_key, repo_id, rel_path, abs_path, content_hash, flags_hash,
                        includes_hash, composite_hash, last_parsed_at
                 FROM tracked_files WHERE context_id = ?1 AND file_key = ?2",
                params![context_id, file_key],
                row_to_tracked,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Overlay-aware bulk tracked-file lookup
    pub fn get_tracked_many(
        &self,
        chain: &ContextChain,
        file_keys: &[String],
    ) -> Result<Vec<TrackedFile>> {
        let baseline = self.tracked_rows_in(chain.baseline_id(), file_keys)?;
        let overlay = match chain.overlay_id() {
            Some(id) => self.tracked_rows_in(id, file_keys)?,
            None => Vec::new(),
        };
        Ok(merge::merge_tracked(baseline, overlay, &chain.state_index()))
    }

    fn tracked_rows_in(&self, context_id: &str, file_keys: &[String]) -> Result<Vec<TrackedFile>> {
        if file_keys.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT file_key, repo_id, rel_path, abs_path, content_hash, flags_hash,
                        includes_hash, composite_hash, last_parsed_at
                 FROM tracked_files WHERE context_id = ?1 AND file_key IN ({})",
                placeholders(file_keys.len(), 2)
            );
            let mut stmt = conn.prepare(&sql)?;
            let params = string_params(context_id, file_keys);
            let rows = stmt.query_map(rusqlite::params_from_iter(params), row_to_tracked)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// Symbols for a set of candidate files, overlay-merged
    pub fn get_symbols_for_files(
        &self,
        chain: &ContextChain,
        file_keys: &[String],
    ) -> Result<Vec<Symbol>> {
        let baseline = self.symbols_in(chain.baseline_id(), Some(file_keys), None)?;
        let overlay = match chain.overlay_id() {
            Some(id) => self.symbols_in(id, Some(file_keys), None)?,
            None => Vec::new(),
        };
        Ok(merge::merge_symbols(baseline, overlay, &chain.state_index()))
    }

    /// All symbols of a single file, overlay-merged
    pub fn get_file_symbols(&self, chain: &ContextChain, file_key: &str) -> Result<Vec<Symbol>> {
        let keys = [file_key.to_string()];
        self.get_symbols_for_files(chain, &keys)
    }

    /// Definitions of a qualified name, overlay-merged
    pub fn get_definitions(
        &self,
        chain: &ContextChain,
        qualified_name: &str,
    ) -> Result<Vec<Symbol>> {
        let baseline = self.symbols_in(chain.baseline_id(), None, Some(qualified_name))?;
        let overlay = match chain.overlay_id() {
            Some(id) => self.symbols_in(id, None, Some(qualified_name))?,
            None => Vec::new(),
        };
        Ok(merge::merge_symbols(baseline, overlay, &chain.state_index()))
    }

    fn symbols_in(
        &self,
        context_id: &str,
        file_keys: Option<&[String]>,
        qualified_name: Option<&str>,
    ) -> Result<Vec<Symbol>> {
        if matches!(file_keys, Some(keys) if keys.is_empty()) {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT file_key, name, qualified_name, kind, line, col, extent_end_line
                 FROM symbols WHERE context_id = ?1",
            );
            let mut args: Vec<String> = vec![context_id.to_string()];
            if let Some(qname) = qualified_name {
                sql.push_str(&format!(" AND qualified_name = ?{}", args.len() + 1));
                args.push(qname.to_string());
            }
            if let Some(keys) = file_keys {
                sql.push_str(&format!(
                    " AND file_key IN ({})",
                    placeholders(keys.len(), args.len() + 1)
                ));
                args.extend(keys.iter().cloned());
            }
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_symbol)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// References to a qualified name, optionally restricted to a scope
    pub fn get_references(
        &self,
        chain: &ContextChain,
        qualified_name: &str,
        scope_file_keys: Option<&[String]>,
    ) -> Result<Vec<Reference>> {
        let baseline =
            self.references_in(chain.baseline_id(), qualified_name, scope_file_keys)?;
        let overlay = match chain.overlay_id() {
            Some(id) => self.references_in(id, qualified_name, scope_file_keys)?,
            None => Vec::new(),
        };
        Ok(merge::merge_references(
            baseline,
            overlay,
            &chain.state_index(),
        ))
    }

    fn references_in(
        &self,
        context_id: &str,
        qualified_name: &str,
        scope: Option<&[String]>,
    ) -> Result<Vec<Reference>> {
        if matches!(scope, Some(keys) if keys.is_empty()) {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT file_key, symbol_qualified_name, line, col, ref_kind
                 FROM references_ WHERE context_id = ?1 AND symbol_qualified_name = ?2",
            );
            let mut args: Vec<String> =
                vec![context_id.to_string(), qualified_name.to_string()];
            if let Some(keys) = scope {
                sql.push_str(&format!(
                    " AND file_key IN ({})",
                    placeholders(keys.len(), args.len() + 1)
                ));
                args.extend(keys.iter().cloned());
            }
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
                let kind: String = row.get(4)?;
                Ok(Reference {
                    file_key: row.get(0)?,
                    symbol_qualified_name: row.get(1)?,
                    line: row.get(2)?,
                    col: row.get(3)?,
                    ref_kind: crate::schema::RefKind::parse(&kind),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// Call edges touching a qualified name, overlay-merged
    pub fn get_call_edges(
        &self,
        chain: &ContextChain,
        qualified_name: &str,
        direction: CallDirection,
    ) -> Result<Vec<CallEdge>> {
        let baseline = self.call_edges_in(chain.baseline_id(), qualified_name, direction)?;
        let overlay = match chain.overlay_id() {
            Some(id) => self.call_edges_in(id, qualified_name, direction)?,
            None => Vec::new(),
        };
        Ok(merge::merge_call_edges(
            baseline,
            overlay,
            &chain.state_index(),
        ))
    }

    fn call_edges_in(
        &self,
        context_id: &str,
        qualified_name: &str,
        direction: CallDirection,
    ) -> Result<Vec<CallEdge>> {
        self.with_conn(|conn| {
            let clause = match direction {
                CallDirection::In => "callee_qualified_name = ?2",
                CallDirection::Out => "caller_qualified_name = ?2",
                CallDirection::Both => {
                    "(caller_qualified_name = ?2 OR callee_qualified_name = ?2)"
                }
            };
            let sql = format!(
                "SELECT file_key, caller_qualified_name, callee_qualified_name, line
                 FROM call_edges WHERE context_id = ?1 AND {}",
                clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![context_id, qualified_name], |row| {
                Ok(CallEdge {
                    file_key: row.get(0)?,
                    caller_qualified_name: row.get(1)?,
                    callee_qualified_name: row.get(2)?,
                    line: row.get(3)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// Include deps recorded for a file, overlay-merged
    pub fn get_include_deps(
        &self,
        chain: &ContextChain,
        file_key: &str,
    ) -> Result<Vec<IncludeDep>> {
        let baseline = self.include_deps_in(chain.baseline_id(), file_key)?;
        let overlay = match chain.overlay_id() {
            Some(id) => self.include_deps_in(id, file_key)?,
            None => Vec::new(),
        };
        Ok(merge::merge_include_deps(
            baseline,
            overlay,
            &chain.state_index(),
        ))
    }

    fn include_deps_in(&self, context_id: &str, file_key: &str) -> Result<Vec<IncludeDep>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT file_key, included_file_key, included_abs_path, raw_path, depth
                 FROM include_deps WHERE context_id = ?1 AND file_key = ?2",
            )?;
            let rows = stmt.query_map(params![context_id, file_key], |row| {
                Ok(IncludeDep {
                    file_key: row.get(0)?,
                    included_file_key: row.get(1)?,
                    included_abs_path: row.get(2)?,
                    raw_path: row.get(3)?,
                    depth: row.get(4)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    // ------------------------------------------------------------------
    // FTS recall
    // ------------------------------------------------------------------

    /// Candidate file_keys whose indexed terms match the symbol
    pub fn fts_candidates(
        &self,
        context_ids: &[String],
        term: &str,
        repos: &[String],
        limit: usize,
    ) -> Result<Vec<String>> {
        if context_ids.is_empty() || term.trim().is_empty() {
            return Ok(Vec::new());
        }
        // FTS5 syntax is hostile to raw identifiers; quote a cleaned term
        let cleaned = term.replace('"', " ");
        let match_expr = format!("\"{}\"", cleaned.trim());

        self.with_conn(|conn| {
            let mut sql = format!(
                "SELECT DISTINCT file_key FROM recall_fts
                 WHERE recall_fts MATCH ?1 AND context_id IN ({})",
                placeholders(context_ids.len(), 2)
            );
            let mut args: Vec<String> = vec![match_expr.clone()];
            args.extend(context_ids.iter().cloned());
            if !repos.is_empty() {
                sql.push_str(&format!(
                    " AND repo_id IN ({})",
                    placeholders(repos.len(), args.len() + 1)
                ));
                args.extend(repos.iter().cloned());
            }
            sql.push_str(&format!(" LIMIT {}", limit));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// Whether any FTS rows exist for a repo in a context
    pub fn fts_has_snapshot(&self, context_id: &str, repo_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM recall_fts WHERE context_id = ?1 AND repo_id = ?2 LIMIT 1",
                params![context_id, repo_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // ------------------------------------------------------------------
    // Jobs (reads; mutations go through the writer)
    // ------------------------------------------------------------------

    pub fn get_job(&self, queue: JobQueue, id: &str) -> Result<Option<SyncJob>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT id, workspace_id, repo_id, ref_name, context_id, event_type,
                            event_sha, status, attempts, max_attempts, lease_until,
                            last_error, created_at, updated_at
                     FROM {} WHERE id = ?1",
                    queue.table()
                ),
                [id],
                row_to_job,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Creation time of the oldest pending job across both queues
    pub fn oldest_pending_job(&self) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT min(created_at) FROM (
                     SELECT created_at FROM index_jobs WHERE status = 'pending'
                     UNION ALL
                     SELECT created_at FROM repo_sync_jobs WHERE status = 'pending')",
                [],
                |row| row.get::<_, Option<String>>(0),
            )
            .map_err(Into::into)
        })
    }

    /// Count contexts by status for the health surface
    pub fn context_counts(&self, workspace_id: &str) -> Result<(u64, u64)> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT
                     sum(CASE WHEN status = 'active' THEN 1 ELSE 0 END),
                     sum(CASE WHEN status = 'expired' THEN 1 ELSE 0 END)
                 FROM analysis_contexts WHERE workspace_id = ?1",
                [workspace_id],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?.unwrap_or(0) as u64,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    ))
                },
            )
            .map_err(Into::into)
        })
    }
}

// ----------------------------------------------------------------------
// Row mappers & SQL helpers
// ----------------------------------------------------------------------

fn row_to_context(row: &Row<'_>) -> rusqlite::Result<AnalysisContext> {
    let mode: String = row.get(2)?;
    let overlay_mode: String = row.get(4)?;
    let status: String = row.get(7)?;
    Ok(AnalysisContext {
        context_id: row.get(0)?,
        workspace_id: row.get(1)?,
        mode: ContextMode::parse(&mode).unwrap_or(ContextMode::Baseline),
        base_context_id: row.get(3)?,
        overlay_mode: OverlayMode::parse(&overlay_mode).unwrap_or(OverlayMode::Full),
        overlay_file_count: row.get::<_, i64>(5)? as u64,
        overlay_row_count: row.get::<_, i64>(6)? as u64,
        status: ContextStatus::parse(&status).unwrap_or(ContextStatus::Active),
        created_at: row.get(8)?,
        last_accessed_at: row.get(9)?,
        expires_at: row.get(10)?,
    })
}

fn row_to_tracked(row: &Row<'_>) -> rusqlite::Result<TrackedFile> {
    Ok(TrackedFile {
        file_key: row.get(0)?,
        repo_id: row.get(1)?,
        rel_path: row.get(2)?,
        abs_path: row.get(3)?,
        content_hash: row.get(4)?,
        flags_hash: row.get(5)?,
        includes_hash: row.get(6)?,
        composite_hash: row.get(7)?,
        last_parsed_at: row.get(8)?,
    })
}

fn row_to_symbol(row: &Row<'_>) -> rusqlite::Result<Symbol> {
    let kind: String = row.get(3)?;
    Ok(Symbol {
        file_key: row.get(0)?,
        name: row.get(1)?,
        qualified_name: row.get(2)?,
        kind: crate::schema::SymbolKind::parse(&kind),
        line: row.get(4)?,
        col: row.get(5)?,
        extent_end_line: row.get(6)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
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
}

/// `?n, ?n+1, …` placeholder list starting at `first`
fn placeholders(count: usize, first: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", first + i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn string_params(first: &str, rest: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(first.to_string());
    out.extend(rest.iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_numbering() {
        assert_eq!(placeholders(3, 2), "?2, ?3, ?4");
        assert_eq!(placeholders(1, 1), "?1");
    }

    #[test]
    fn open_initializes_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        assert!(store.path().exists());
        assert!(store.get_context("missing").unwrap().is_none());
    }
}

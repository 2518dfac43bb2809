//! Store layout and connection configuration
//!
//! One embedded SQLite file per workspace, living at
//! `<workspace_root>/.symdex/index.db`. Every fact table is keyed by
//! `(context_id, file_key)` and cascades from `tracked_files`, so
//! invalidating a tracked file removes its facts in one delete.
//!
//! `file_key` columns use `COLLATE NOCASE` so lookups are
//! case-insensitive while rows preserve original case for display.

use rusqlite::Connection;

use crate::error::Result;

/// Schema DDL, applied idempotently at open
const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workspaces (
    workspace_id TEXT PRIMARY KEY,
    root_path TEXT NOT NULL,
    manifest_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repos (
    workspace_id TEXT NOT NULL REFERENCES workspaces(workspace_id) ON DELETE CASCADE,
    repo_id TEXT NOT NULL COLLATE NOCASE,
    root TEXT NOT NULL,
    compile_commands_path TEXT NOT NULL,
    default_branch TEXT NOT NULL,
    depends_on TEXT NOT NULL DEFAULT '[]',
    remote_url TEXT,
    commit_sha TEXT,
    PRIMARY KEY (workspace_id, repo_id)
);

CREATE TABLE IF NOT EXISTS analysis_contexts (
    context_id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    base_context_id TEXT,
    overlay_mode TEXT NOT NULL,
    overlay_file_count INTEGER NOT NULL DEFAULT 0,
    overlay_row_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_contexts_workspace
    ON analysis_contexts(workspace_id, status);

CREATE TABLE IF NOT EXISTS context_file_states (
    context_id TEXT NOT NULL REFERENCES analysis_contexts(context_id) ON DELETE CASCADE,
    file_key TEXT NOT NULL COLLATE NOCASE,
    state TEXT NOT NULL,
    replaced_from_file_key TEXT COLLATE NOCASE,
    PRIMARY KEY (context_id, file_key)
);

CREATE TABLE IF NOT EXISTS tracked_files (
    context_id TEXT NOT NULL REFERENCES analysis_contexts(context_id) ON DELETE CASCADE,
    file_key TEXT NOT NULL COLLATE NOCASE,
    repo_id TEXT NOT NULL COLLATE NOCASE,
    rel_path TEXT NOT NULL,
    abs_path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    flags_hash TEXT NOT NULL,
    includes_hash TEXT NOT NULL,
    composite_hash TEXT NOT NULL,
    last_parsed_at TEXT NOT NULL,
    PRIMARY KEY (context_id, file_key)
);

CREATE INDEX IF NOT EXISTS idx_tracked_repo
    ON tracked_files(context_id, repo_id);

CREATE TABLE IF NOT EXISTS symbols (
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL COLLATE NOCASE,
    name TEXT NOT NULL,
    qualified_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL,
    extent_end_line INTEGER NOT NULL,
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_symbols_file
    ON symbols(context_id, file_key);
CREATE INDEX IF NOT EXISTS idx_symbols_qname
    ON symbols(context_id, qualified_name);

CREATE TABLE IF NOT EXISTS references_ (
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL COLLATE NOCASE,
    symbol_qualified_name TEXT NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL,
    ref_kind TEXT NOT NULL,
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_references_qname
    ON references_(context_id, symbol_qualified_name);
CREATE INDEX IF NOT EXISTS idx_references_file
    ON references_(context_id, file_key);

CREATE TABLE IF NOT EXISTS call_edges (
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL COLLATE NOCASE,
    caller_qualified_name TEXT NOT NULL,
    callee_qualified_name TEXT NOT NULL,
    line INTEGER NOT NULL,
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_call_edges_caller
    ON call_edges(context_id, caller_qualified_name);
CREATE INDEX IF NOT EXISTS idx_call_edges_callee
    ON call_edges(context_id, callee_qualified_name);

CREATE TABLE IF NOT EXISTS include_deps (
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL COLLATE NOCASE,
    included_file_key TEXT NOT NULL COLLATE NOCASE,
    included_abs_path TEXT NOT NULL,
    raw_path TEXT NOT NULL,
    depth INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (context_id, file_key)
        REFERENCES tracked_files(context_id, file_key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_include_deps_file
    ON include_deps(context_id, file_key);
CREATE INDEX IF NOT EXISTS idx_include_deps_included
    ON include_deps(context_id, included_file_key);

CREATE TABLE IF NOT EXISTS parse_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    context_id TEXT NOT NULL,
    file_key TEXT NOT NULL COLLATE NOCASE,
    started_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    success INTEGER NOT NULL,
    diagnostic_count INTEGER NOT NULL DEFAULT 0,
    symbol_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS index_jobs (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL COLLATE NOCASE,
    ref_name TEXT NOT NULL,
    context_id TEXT NOT NULL DEFAULT '',
    event_type TEXT NOT NULL,
    event_sha TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    lease_until TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_index_jobs_idem
    ON index_jobs(workspace_id, repo_id, ref_name, context_id, event_sha);
CREATE INDEX IF NOT EXISTS idx_index_jobs_pending
    ON index_jobs(status, created_at);

CREATE TABLE IF NOT EXISTS repo_sync_jobs (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL COLLATE NOCASE,
    ref_name TEXT NOT NULL,
    context_id TEXT NOT NULL DEFAULT '',
    event_type TEXT NOT NULL,
    event_sha TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    lease_until TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_repo_sync_jobs_idem
    ON repo_sync_jobs(workspace_id, repo_id, ref_name, context_id, event_sha);
CREATE INDEX IF NOT EXISTS idx_repo_sync_jobs_pending
    ON repo_sync_jobs(status, created_at);

CREATE TABLE IF NOT EXISTS repo_sync_state (
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL COLLATE NOCASE,
    last_synced_sha TEXT NOT NULL,
    last_synced_at TEXT NOT NULL,
    PRIMARY KEY (workspace_id, repo_id)
);

CREATE TABLE IF NOT EXISTS commit_diff_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id TEXT NOT NULL,
    repo_id TEXT NOT NULL COLLATE NOCASE,
    event_sha TEXT NOT NULL,
    summary TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// FTS virtual table for symbol-name recall, created separately because
/// `CREATE VIRTUAL TABLE` has no `IF NOT EXISTS` on older SQLite builds
const FTS_DDL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS recall_fts USING fts5(
    terms,
    context_id UNINDEXED,
    file_key UNINDEXED,
    repo_id UNINDEXED
);
"#;

/// Apply connection pragmas: WAL journaling, foreign keys, busy timeout
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns the resulting mode as a row, so plain
    // pragma_update would report ExecuteReturnedResults
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(250))?;
    Ok(())
}

/// Create all tables and indexes if missing, and stamp the schema version
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(DDL)?;
    conn.execute_batch(FTS_DDL)?;
    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [crate::schema::SCHEMA_VERSION],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_cleanly_twice() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='tracked_files'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn cascade_from_tracked_files() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO analysis_contexts(context_id, workspace_id, mode, overlay_mode,
             created_at, last_accessed_at) VALUES('c1','ws','baseline','full','t','t')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO tracked_files VALUES('c1','repoA:src/a.cpp','repoA','src/a.cpp',
             '/ws/repoA/src/a.cpp','c','f','i','comp','t')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO symbols VALUES('c1','repoA:src/a.cpp','foo','ns::foo','function',1,1,3)",
            [],
        )
        .unwrap();

        conn.execute(
            "DELETE FROM tracked_files WHERE context_id='c1' AND file_key='repoA:src/a.cpp'",
            [],
        )
        .unwrap();
        let left: i64 = conn
            .query_row("SELECT count(*) FROM symbols", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}

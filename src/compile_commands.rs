//! Compile-commands database loading and caching
//!
//! Each repo carries a `compile_commands.json` (CMake/ninja style). The
//! engine needs per-file argument lists for both hashing and extractor
//! launches, so parsed databases are cached per
//! `(workspace_id, repo_id, db_path)` and invalidated when the database
//! file's mtime changes or the manifest is refreshed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::paths::normalize_rel_path;

/// One entry of `compile_commands.json`
///
/// Either `command` (single shell string) or `arguments` (pre-split) is
/// present; `arguments` wins when both are.
#[derive(Debug, Clone, Deserialize)]
pub struct CompileCommand {
    pub directory: String,
    pub file: String,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub arguments: Option<Vec<String>>,
}

impl CompileCommand {
    /// The argument list with the compiler executable and the input file
    /// name removed
    pub fn args(&self) -> Vec<String> {
        let raw = match (&self.arguments, &self.command) {
            (Some(args), _) => args.clone(),
            (None, Some(cmd)) => split_command_line(cmd),
            (None, None) => Vec::new(),
        };
        let abs_file = normalize_lookup(&self.abs_file());

        raw.into_iter()
            .skip(1) // compiler executable
            .filter(|arg| {
                let p = Path::new(arg);
                let candidate = if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    Path::new(&self.directory).join(p)
                };
                normalize_lookup(&candidate) != abs_file
            })
            .collect()
    }

    /// Absolute path of the compiled file
    pub fn abs_file(&self) -> PathBuf {
        let file = Path::new(&self.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            Path::new(&self.directory).join(file)
        }
    }
}

/// A parsed database with a lookup index by normalised absolute path
#[derive(Debug, Clone)]
pub struct CompileDb {
    entries: ahash::AHashMap<String, CompileCommand>,
    loaded_mtime: Option<SystemTime>,
    pub db_path: PathBuf,
}

impl CompileDb {
    /// Load a database from disk
    pub fn load(db_path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(db_path).map_err(|e| EngineError::Manifest {
            message: format!("cannot read {}: {}", db_path.display(), e),
        })?;
        let commands: Vec<CompileCommand> =
            serde_json::from_str(&raw).map_err(|e| EngineError::Manifest {
                message: format!("invalid compile db {}: {}", db_path.display(), e),
            })?;

        let mut entries = ahash::AHashMap::with_capacity(commands.len());
        for cmd in commands {
            let key = normalize_lookup(&cmd.abs_file());
            // Last entry wins for duplicate files (matches ninja behaviour)
            entries.insert(key, cmd);
        }
        let loaded_mtime = fs::metadata(db_path).and_then(|m| m.modified()).ok();
        Ok(Self {
            entries,
            loaded_mtime,
            db_path: db_path.to_path_buf(),
        })
    }

    /// Look up the compile command for an absolute file path
    pub fn command_for(&self, abs_path: &Path) -> Option<&CompileCommand> {
        self.entries.get(&normalize_lookup(abs_path))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the on-disk database changed since this load
    pub fn is_stale(&self) -> bool {
        let current = fs::metadata(&self.db_path).and_then(|m| m.modified()).ok();
        current != self.loaded_mtime
    }
}

fn normalize_lookup(path: &Path) -> String {
    normalize_rel_path(&path.to_string_lossy()).to_lowercase()
}

/// Split a shell command string into arguments
///
/// Handles double and single quotes and backslash escapes; enough for the
/// strings CMake and ninja emit.
pub fn split_command_line(cmd: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = cmd.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '\\' if !in_single => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Cache key for one repo's database
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DbKey {
    workspace_id: String,
    repo_id: String,
    db_path: String,
}

/// Read-mostly cache of parsed databases
///
/// `get` reloads transparently when the underlying file's mtime moved;
/// `invalidate_workspace` is called on manifest refresh.
#[derive(Default)]
pub struct CompileDbCache {
    dbs: RwLock<ahash::AHashMap<DbKey, std::sync::Arc<CompileDb>>>,
}

impl CompileDbCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (and load or reload if needed) the database for a repo
    pub fn get(
        &self,
        workspace_id: &str,
        repo_id: &str,
        db_path: &Path,
    ) -> Result<std::sync::Arc<CompileDb>> {
        let key = DbKey {
            workspace_id: workspace_id.to_string(),
            repo_id: repo_id.to_string(),
            db_path: db_path.to_string_lossy().to_string(),
        };

        if let Some(db) = self.dbs.read().get(&key) {
            if !db.is_stale() {
                return Ok(db.clone());
            }
        }

        let db = std::sync::Arc::new(CompileDb::load(db_path)?);
        tracing::debug!(
            "Loaded compile db for {}:{} ({} entries)",
            workspace_id,
            repo_id,
            db.len()
        );
        self.dbs.write().insert(key, db.clone());
        Ok(db)
    }

    /// Drop all cached databases for a workspace
    pub fn invalidate_workspace(&self, workspace_id: &str) {
        self.dbs
            .write()
            .retain(|key, _| key.workspace_id != workspace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn splits_quoted_command_lines() {
        let args = split_command_line(r#"clang++ -DNAME="my proj" -I"/opt/some dir" -c x.cpp"#);
        assert_eq!(
            args,
            vec!["clang++", "-DNAME=my proj", "-I/opt/some dir", "-c", "x.cpp"]
        );
    }

    #[test]
    fn entry_args_strip_compiler_and_input() {
        let cmd = CompileCommand {
            directory: "/ws/repoA".into(),
            file: "/ws/repoA/src/x.cpp".into(),
            command: Some("clang++ -DFOO -Iinclude -c /ws/repoA/src/x.cpp".into()),
            arguments: None,
        };
        assert_eq!(cmd.args(), vec!["-DFOO", "-Iinclude", "-c"]);
    }

    #[test]
    fn cache_reloads_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("compile_commands.json");
        let mut f = fs::File::create(&db_path).unwrap();
        write!(
            f,
            r#"[{{"directory": "{0}", "file": "a.cpp", "arguments": ["c++", "-DX", "a.cpp"]}}]"#,
            dir.path().display()
        )
        .unwrap();
        drop(f);

        let cache = CompileDbCache::new();
        let db = cache.get("ws", "repoA", &db_path).unwrap();
        assert_eq!(db.len(), 1);

        let hit = cache.get("ws", "repoA", &db_path).unwrap();
        assert_eq!(hit.len(), 1);
    }

    #[test]
    fn lookup_is_case_and_separator_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("compile_commands.json");
        fs::write(
            &db_path,
            r#"[{"directory": "/ws/repoA", "file": "src/X.cpp", "arguments": ["c++", "src/X.cpp"]}]"#,
        )
        .unwrap();
        let db = CompileDb::load(&db_path).unwrap();
        assert!(db.command_for(Path::new("/ws/repoA/src/x.cpp")).is_some());
    }
}

//! Shared test infrastructure
//!
//! Tests build throwaway workspaces under tempdirs: a manifest, per-repo
//! source trees, compile-commands databases, and a stub extractor script
//! that replays JSON fixtures placed next to each source file (or emits
//! an empty successful parse when no fixture exists).

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use symdex_engine::api::Engine;
use symdex_engine::config::EngineConfig;
use symdex_engine::schema::{
    CallEdge, RefKind, Reference, Symbol, SymbolKind, TrackedFile,
};
use symdex_engine::store::writer::FileFacts;
use symdex_engine::FileKey;

/// Stub extractor: replays `<file>.facts.json` fixtures
const STUB_EXTRACTOR: &str = r#"#!/bin/sh
file=""
while [ $# -gt 0 ]; do
  case "$1" in
    --file) file="$2"; shift 2 ;;
    --) shift; break ;;
    *) shift ;;
  esac
done
if [ -f "$file.facts.json" ]; then
  cat "$file.facts.json"
else
  printf '{"file":"%s","success":true}' "$file"
fi
"#;

/// A two-repo workspace fixture: repoA depends on repoB
pub struct TestWorkspace {
    pub dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let ws = Self { dir };
        ws.write_manifest(
            r#"
workspace_id: ws1
repos:
  - repo_id: repoA
    root: repoA
    depends_on: [repoB]
  - repo_id: repoB
    root: libs/repoB
path_remaps:
  - from_prefix: /opt/vendor/repoB
    to_repo_id: repoB
    to_prefix: include
"#,
        );
        fs::create_dir_all(ws.root().join("repoA/src")).unwrap();
        fs::create_dir_all(ws.root().join("libs/repoB/src")).unwrap();
        fs::create_dir_all(ws.root().join("libs/repoB/include")).unwrap();
        ws.install_stub_extractor();
        ws
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_manifest(&self, yaml: &str) {
        fs::write(self.root().join("symdex.yaml"), yaml).unwrap();
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        match repo {
            "repoA" => self.root().join("repoA"),
            "repoB" => self.root().join("libs/repoB"),
            other => self.root().join(other),
        }
    }

    /// Write a source file, returning its absolute path
    pub fn add_file(&self, repo: &str, rel: &str, content: &str) -> PathBuf {
        let path = self.repo_dir(repo).join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    /// Absolute path of a repo-relative file
    pub fn abs(&self, repo: &str, rel: &str) -> PathBuf {
        self.repo_dir(repo).join(rel)
    }

    /// Write a compile-commands database covering the given files
    pub fn write_compile_db(&self, repo: &str, rel_files: &[&str]) {
        let repo_dir = self.repo_dir(repo);
        let entries: Vec<serde_json::Value> = rel_files
            .iter()
            .map(|rel| {
                let abs = repo_dir.join(rel);
                serde_json::json!({
                    "directory": repo_dir.display().to_string(),
                    "file": abs.display().to_string(),
                    "arguments": [
                        "c++", "-std=c++17", "-Iinclude", "-DTEST_BUILD",
                        abs.display().to_string()
                    ]
                })
            })
            .collect();
        fs::write(
            repo_dir.join("compile_commands.json"),
            serde_json::to_string_pretty(&entries).unwrap(),
        )
        .unwrap();
    }

    /// Place an extractor fixture next to a source file
    pub fn write_facts_fixture(&self, repo: &str, rel: &str, facts: serde_json::Value) {
        let abs = self.repo_dir(repo).join(rel);
        fs::write(
            PathBuf::from(format!("{}.facts.json", abs.display())),
            serde_json::to_string(&facts).unwrap(),
        )
        .unwrap();
    }

    fn install_stub_extractor(&self) -> PathBuf {
        let path = self.root().join("stub-extractor.sh");
        fs::write(&path, STUB_EXTRACTOR).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    pub fn stub_extractor_path(&self) -> PathBuf {
        self.root().join("stub-extractor.sh")
    }

    /// Engine config wired to the stub extractor with test-sized limits
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            extractor_path: Some(self.stub_extractor_path()),
            query_deadline: std::time::Duration::from_secs(30),
            ..EngineConfig::default()
        }
    }

    pub async fn engine(&self) -> Engine {
        self.engine_with(self.config()).await
    }

    pub async fn engine_with(&self, config: EngineConfig) -> Engine {
        Engine::bootstrap(self.root(), config)
            .await
            .expect("bootstrap engine")
    }
}

/// Extractor-output JSON for a fixture file
pub fn facts_json(
    file: &Path,
    symbols: &[(&str, &str, &str, u32, u32)],
    references: &[(&str, u32, u32, &str)],
    call_edges: &[(&str, &str, u32)],
    includes: &[&Path],
) -> serde_json::Value {
    serde_json::json!({
        "file": file.display().to_string(),
        "symbols": symbols.iter().map(|(name, qname, kind, line, extent)| {
            serde_json::json!({
                "name": name, "qualified_name": qname, "kind": kind,
                "line": line, "col": 1, "extent_end_line": extent
            })
        }).collect::<Vec<_>>(),
        "references": references.iter().map(|(qname, line, col, kind)| {
            serde_json::json!({
                "qualified_name": qname, "line": line, "col": col, "kind": kind
            })
        }).collect::<Vec<_>>(),
        "call_edges": call_edges.iter().map(|(caller, callee, line)| {
            serde_json::json!({"caller": caller, "callee": callee, "line": line})
        }).collect::<Vec<_>>(),
        "include_deps": includes.iter().map(|path| {
            serde_json::json!({
                "path": path.display().to_string(),
                "raw_path": path.file_name().unwrap().to_string_lossy(),
                "depth": 1
            })
        }).collect::<Vec<_>>(),
        "success": true,
        "diagnostics": []
    })
}

/// Build a FileFacts payload for direct writer submission
pub fn make_file_facts(
    context_id: &str,
    repo: &str,
    rel: &str,
    symbols: &[(&str, &str, u32, u32)],
    references: &[(&str, u32, u32)],
) -> FileFacts {
    let key = FileKey::new(repo, rel);
    let file_key = key.display_key();
    let now = chrono::Utc::now().to_rfc3339();
    FileFacts {
        context_id: context_id.to_string(),
        tracked: TrackedFile {
            file_key: file_key.clone(),
            repo_id: repo.to_string(),
            rel_path: rel.to_string(),
            abs_path: format!("/ws/{}/{}", repo, rel),
            content_hash: format!("content-{}", rel),
            flags_hash: "flags".into(),
            includes_hash: "includes".into(),
            composite_hash: format!("composite-{}", rel),
            last_parsed_at: now,
        },
        symbols: symbols
            .iter()
            .map(|(name, qname, line, extent)| Symbol {
                file_key: file_key.clone(),
                name: name.to_string(),
                qualified_name: qname.to_string(),
                kind: SymbolKind::Function,
                line: *line,
                col: 1,
                extent_end_line: *extent,
            })
            .collect(),
        references: references
            .iter()
            .map(|(qname, line, col)| Reference {
                file_key: file_key.clone(),
                symbol_qualified_name: qname.to_string(),
                line: *line,
                col: *col,
                ref_kind: RefKind::Call,
            })
            .collect(),
        call_edges: Vec::<CallEdge>::new(),
        include_deps: Vec::new(),
        fts_terms: symbols
            .iter()
            .flat_map(|(name, qname, _, _)| {
                let mut terms = vec![name.to_string()];
                terms.extend(qname.split("::").map(String::from));
                terms
            })
            .chain(
                references
                    .iter()
                    .flat_map(|(qname, _, _)| qname.split("::").map(String::from)),
            )
            .collect::<Vec<_>>()
            .join(" "),
    }
}

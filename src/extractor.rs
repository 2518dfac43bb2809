//! Extractor driver: native AST extractor subprocess management
//!
//! The extractor is an opaque subprocess invoked as
//! `extractor --action <a> --file <abs_path> -- <compile_args…>` printing
//! one JSON document on stdout. The driver resolves per-file compile
//! flags, applies the manifest's virtual-filesystem remaps to the
//! arguments before launch, normalises emitted include paths back to
//! canonical file_keys after parse, and assembles the in-memory
//! [`FileFacts`] payload. It never writes to the store itself.
//!
//! Concurrency is a semaphore-bounded worker pool of `max_parse_workers`;
//! each worker runs one subprocess per file under the per-file timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::compile_commands::CompileDbCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hashing;
use crate::paths::FileKey;
use crate::schema::{
    CallEdge, Freshness, IncludeDep, ParseRun, RefKind, Reference, Symbol, SymbolKind, TrackedFile,
};
use crate::store::writer::FileFacts;
use crate::store::{ContextChain, FactStore};
use crate::workspace::WorkspaceHandle;

/// Warning emitted when an include cannot be resolved to a repo file
pub const WARN_UNRESOLVED_INCLUDE: &str = "external_unresolved_include";

/// Extraction action passed to the subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractAction {
    #[default]
    All,
    Symbols,
    Refs,
}

impl ExtractAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "extract-all",
            Self::Symbols => "extract-symbols",
            Self::Refs => "extract-refs",
        }
    }
}

// ----------------------------------------------------------------------
// Subprocess JSON contract
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[allow(dead_code)]
    file: String,
    #[serde(default)]
    symbols: Vec<RawSymbol>,
    #[serde(default)]
    references: Vec<RawReference>,
    #[serde(default)]
    call_edges: Vec<RawCallEdge>,
    #[serde(default)]
    include_deps: Vec<RawIncludeDep>,
    success: bool,
    #[serde(default)]
    diagnostics: Vec<RawDiagnostic>,
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    name: String,
    qualified_name: String,
    kind: String,
    line: u32,
    #[serde(default)]
    col: u32,
    #[serde(default)]
    extent_end_line: u32,
}

#[derive(Debug, Deserialize)]
struct RawReference {
    qualified_name: String,
    line: u32,
    #[serde(default)]
    col: u32,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawCallEdge {
    caller: String,
    callee: String,
    line: u32,
}

#[derive(Debug, Deserialize)]
struct RawIncludeDep {
    path: String,
    #[serde(default)]
    raw_path: String,
    #[serde(default)]
    depth: u32,
}

#[derive(Debug, Deserialize)]
struct RawDiagnostic {
    #[serde(default)]
    severity: String,
    message: String,
}

// ----------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------

/// Outcome of one parse request
#[derive(Debug)]
pub enum ParseResult {
    Parsed(Box<ParsedFile>),
    /// No compile command for the file; cannot parse
    MissingFlags,
    /// Subprocess exceeded the per-file timeout and was killed
    Timeout,
    Failed {
        message: String,
    },
}

/// A successfully parsed file with its audit record
#[derive(Debug)]
pub struct ParsedFile {
    pub facts: FileFacts,
    pub run: ParseRun,
    pub warnings: Vec<String>,
    pub diagnostics: Vec<String>,
}

/// The three input hashes plus their composite, computed live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveHashes {
    pub content_hash: String,
    pub flags_hash: String,
    pub includes_hash: String,
    pub composite_hash: String,
}

pub struct ExtractorDriver {
    config: EngineConfig,
    compile_dbs: Arc<CompileDbCache>,
    pool: Arc<Semaphore>,
}

impl ExtractorDriver {
    pub fn new(config: EngineConfig, compile_dbs: Arc<CompileDbCache>) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_parse_workers.max(1)));
        Self {
            config,
            compile_dbs,
            pool,
        }
    }

    /// Locate the extractor binary (config override, then PATH)
    pub fn binary(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.config.extractor_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(EngineError::ExtractorUnavailable {
                message: format!("configured extractor {} does not exist", path.display()),
            });
        }
        which::which("symdex-extractor").map_err(|e| EngineError::ExtractorUnavailable {
            message: format!("symdex-extractor not on PATH: {}", e),
        })
    }

    /// Compile arguments for a file after sanitisation-independent remap
    ///
    /// Returns `None` when the repo has no compile command for the file.
    pub fn compile_args(
        &self,
        workspace: &WorkspaceHandle,
        key: &FileKey,
        abs_path: &Path,
    ) -> Result<Option<Vec<String>>> {
        let Some(db_path) = workspace.compile_db_path(&key.repo_id) else {
            return Ok(None);
        };
        if !db_path.exists() {
            return Ok(None);
        }
        let db = self
            .compile_dbs
            .get(&workspace.workspace_id, &key.repo_id, &db_path)?;
        let Some(cmd) = db.command_for(abs_path) else {
            return Ok(None);
        };
        Ok(Some(remap_compile_args(&cmd.args(), workspace)))
    }

    /// Parse one file through the subprocess pool
    pub async fn parse_file(
        &self,
        workspace: &WorkspaceHandle,
        context_id: &str,
        key: &FileKey,
        action: ExtractAction,
    ) -> Result<ParseResult> {
        let Some(abs_path) = workspace.abs_for_key(key) else {
            return Ok(ParseResult::Failed {
                message: format!("unknown repo {}", key.repo_id),
            });
        };
        let bytes = match std::fs::read(&abs_path) {
            Ok(b) => b,
            Err(e) => {
                return Ok(ParseResult::Failed {
                    message: format!("cannot read {}: {}", abs_path.display(), e),
                })
            }
        };
        let content_hash = hashing::content_hash(&bytes);

        let Some(args) = self.compile_args(workspace, key, &abs_path)? else {
            tracing::debug!("no compile flags for {}; skipping parse", key);
            return Ok(ParseResult::MissingFlags);
        };
        let flags_hash = hashing::flags_hash(&args);

        let binary = self.binary()?;
        let started_at = crate::context::now_rfc3339();
        let started = Instant::now();

        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| EngineError::internal("extractor pool closed"))?;

        let output = {
            let mut cmd = tokio::process::Command::new(&binary);
            cmd.arg("--action")
                .arg(action.as_str())
                .arg("--file")
                .arg(&abs_path)
                .arg("--")
                .args(&args)
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);

            let child = cmd.spawn().map_err(|e| EngineError::ExtractorUnavailable {
                message: format!("cannot spawn {}: {}", binary.display(), e),
            })?;
            match tokio::time::timeout(self.config.parse_timeout, child.wait_with_output()).await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Ok(ParseResult::Failed {
                        message: format!("extractor I/O failure: {}", e),
                    })
                }
                Err(_) => {
                    tracing::warn!(
                        "parse_timeout for {} after {}s",
                        key,
                        self.config.parse_timeout.as_secs()
                    );
                    return Ok(ParseResult::Timeout);
                }
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(ParseResult::Failed {
                message: format!(
                    "extractor exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }

        let raw: RawOutput = match serde_json::from_slice(&output.stdout) {
            Ok(raw) => raw,
            Err(e) => {
                return Ok(ParseResult::Failed {
                    message: format!("malformed extractor output: {}", e),
                })
            }
        };
        if !raw.success {
            let message = raw
                .diagnostics
                .iter()
                .map(|d| d.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(ParseResult::Failed {
                message: if message.is_empty() {
                    "extractor reported failure".into()
                } else {
                    message
                },
            });
        }

        let parsed = self.assemble_facts(
            workspace,
            context_id,
            key,
            &abs_path,
            content_hash,
            flags_hash,
            raw,
            started_at,
            started.elapsed().as_millis() as u64,
        );
        Ok(ParseResult::Parsed(Box::new(parsed)))
    }

    /// Normalise raw output into a [`FileFacts`] payload plus audit row
    #[allow(clippy::too_many_arguments)]
    fn assemble_facts(
        &self,
        workspace: &WorkspaceHandle,
        context_id: &str,
        key: &FileKey,
        abs_path: &Path,
        content_hash: String,
        flags_hash: String,
        raw: RawOutput,
        started_at: String,
        duration_ms: u64,
    ) -> ParsedFile {
        let file_key = key.display_key();
        let mut warnings = Vec::new();

        let mut include_deps = Vec::with_capacity(raw.include_deps.len());
        let mut include_pairs = Vec::new();
        for dep in raw.include_deps {
            let abs = PathBuf::from(&dep.path);
            match workspace.resolve_abs_path(&abs) {
                Some(included_key) => {
                    let canonical_abs = workspace
                        .abs_for_key(&included_key)
                        .unwrap_or_else(|| abs.clone());
                    match std::fs::read(&canonical_abs) {
                        Ok(bytes) => include_pairs.push((
                            included_key.display_key(),
                            hashing::content_hash(&bytes),
                        )),
                        Err(_) => warnings.push(format!(
                            "{}: {}",
                            WARN_UNRESOLVED_INCLUDE, dep.path
                        )),
                    }
                    include_deps.push(IncludeDep {
                        file_key: file_key.clone(),
                        included_file_key: included_key.display_key(),
                        included_abs_path: canonical_abs.display().to_string(),
                        raw_path: dep.raw_path,
                        depth: dep.depth,
                    });
                }
                None => {
                    warnings.push(format!("{}: {}", WARN_UNRESOLVED_INCLUDE, dep.path));
                    include_deps.push(IncludeDep {
                        file_key: file_key.clone(),
                        included_file_key: String::new(),
                        included_abs_path: dep.path.clone(),
                        raw_path: dep.raw_path,
                        depth: dep.depth,
                    });
                }
            }
        }
        let includes_hash = hashing::includes_hash(&include_pairs);
        let composite_hash =
            hashing::composite_hash(&content_hash, &flags_hash, &includes_hash);

        let symbols: Vec<Symbol> = raw
            .symbols
            .into_iter()
            .map(|s| Symbol {
                file_key: file_key.clone(),
                name: s.name,
                qualified_name: s.qualified_name,
                kind: SymbolKind::parse(&s.kind),
                line: s.line,
                col: s.col.max(1),
                extent_end_line: s.extent_end_line.max(s.line),
            })
            .collect();

        let references: Vec<Reference> = raw
            .references
            .into_iter()
            .map(|r| Reference {
                file_key: file_key.clone(),
                symbol_qualified_name: r.qualified_name,
                line: r.line,
                col: r.col.max(1),
                ref_kind: RefKind::parse(&r.kind),
            })
            .collect();

        let call_edges: Vec<CallEdge> = raw
            .call_edges
            .into_iter()
            .map(|e| CallEdge {
                file_key: file_key.clone(),
                caller_qualified_name: e.caller,
                callee_qualified_name: e.callee,
                line: e.line,
            })
            .collect();

        let fts_terms = fts_terms(key, &symbols, &references, &call_edges);
        let diagnostics: Vec<String> = raw
            .diagnostics
            .iter()
            .map(|d| {
                if d.severity.is_empty() {
                    d.message.clone()
                } else {
                    format!("{}: {}", d.severity, d.message)
                }
            })
            .collect();

        let run = ParseRun {
            context_id: context_id.to_string(),
            file_key: file_key.clone(),
            started_at,
            duration_ms,
            success: true,
            diagnostic_count: diagnostics.len(),
            symbol_count: symbols.len(),
        };

        ParsedFile {
            facts: FileFacts {
                context_id: context_id.to_string(),
                tracked: TrackedFile {
                    file_key,
                    repo_id: key.repo_id.clone(),
                    rel_path: key.rel_path.clone(),
                    abs_path: abs_path.display().to_string(),
                    content_hash,
                    flags_hash,
                    includes_hash,
                    composite_hash,
                    last_parsed_at: crate::context::now_rfc3339(),
                },
                symbols,
                references,
                call_edges,
                include_deps,
                fts_terms,
            },
            run,
            warnings,
            diagnostics,
        }
    }

    /// Classify a candidate against its stored hashes without parsing
    ///
    /// The live includes hash is recomputed from the *stored* include set
    /// with fresh content hashes, so a changed header flips its includers
    /// to stale even though their own bytes are untouched.
    pub fn classify(
        &self,
        workspace: &WorkspaceHandle,
        store: &FactStore,
        chain: &ContextChain,
        key: &FileKey,
    ) -> Result<(Freshness, Option<LiveHashes>, Vec<String>)> {
        let mut warnings = Vec::new();

        let Some(abs_path) = workspace.abs_for_key(key) else {
            return Ok((Freshness::Unparsed, None, warnings));
        };
        let bytes = match std::fs::read(&abs_path) {
            Ok(b) => b,
            Err(_) => return Ok((Freshness::Unparsed, None, warnings)),
        };
        let content_hash = hashing::content_hash(&bytes);

        let Some(args) = self.compile_args(workspace, key, &abs_path)? else {
            return Ok((Freshness::MissingFlags, None, warnings));
        };
        let flags_hash = hashing::flags_hash(&args);

        let display_key = key.display_key();
        let Some(stored) = store.get_tracked(chain, &display_key)? else {
            return Ok((Freshness::Unparsed, None, warnings));
        };

        let deps = store.get_include_deps(chain, &display_key)?;
        let mut pairs = Vec::with_capacity(deps.len());
        for dep in &deps {
            if !dep.is_resolved() {
                warnings.push(format!("{}: {}", WARN_UNRESOLVED_INCLUDE, dep.raw_path));
                continue;
            }
            let included = match FileKey::parse(&dep.included_file_key) {
                Ok(k) => k,
                Err(_) => continue,
            };
            let Some(included_abs) = workspace.abs_for_key(&included) else {
                continue;
            };
            match std::fs::read(&included_abs) {
                Ok(bytes) => pairs.push((
                    dep.included_file_key.clone(),
                    hashing::content_hash(&bytes),
                )),
                // A vanished header hashes as absent, which reads as stale
                Err(_) => {}
            }
        }
        let includes_hash = hashing::includes_hash(&pairs);
        let composite_hash =
            hashing::composite_hash(&content_hash, &flags_hash, &includes_hash);

        let live = LiveHashes {
            content_hash,
            flags_hash,
            includes_hash,
            composite_hash: composite_hash.clone(),
        };
        let freshness = if stored.composite_hash == composite_hash {
            Freshness::Fresh
        } else {
            Freshness::Stale
        };
        Ok((freshness, Some(live), warnings))
    }
}

/// Rewrite compile arguments whose paths reach external prefixes
///
/// Covers `-I`, `-isystem`, `-include`, and their MSVC spellings; the
/// remapped paths point at the workspace-canonical checkouts so the
/// extractor sees one consistent filesystem.
pub fn remap_compile_args(args: &[String], workspace: &WorkspaceHandle) -> Vec<String> {
    let remap_path = |path: &str| -> Option<String> {
        let (repo_id, rel) = workspace.manifest.remap_external_path(path)?;
        let root = workspace.repo_root(&repo_id)?;
        Some(crate::paths::abs_path_for(&root, &rel).display().to_string())
    };

    let mut out = Vec::with_capacity(args.len());
    let mut remap_next = false;
    for arg in args {
        if remap_next {
            remap_next = false;
            out.push(remap_path(arg).unwrap_or_else(|| arg.clone()));
            continue;
        }
        let remapped = if let Some(rest) = arg.strip_prefix("-I") {
            remap_path(rest).map(|p| format!("-I{}", p))
        } else if let Some(rest) = arg.strip_prefix("/I") {
            remap_path(rest).map(|p| format!("/I{}", p))
        } else if let Some(rest) = arg.strip_prefix("-isystem") {
            if rest.is_empty() {
                remap_next = true;
                out.push(arg.clone());
                continue;
            }
            remap_path(rest).map(|p| format!("-isystem{}", p))
        } else if let Some(rest) = arg.strip_prefix("-include") {
            if rest.is_empty() {
                remap_next = true;
                out.push(arg.clone());
                continue;
            }
            remap_path(rest).map(|p| format!("-include{}", p))
        } else if arg.starts_with('/') || arg.starts_with("\\") {
            remap_path(arg)
        } else {
            None
        };
        out.push(remapped.unwrap_or_else(|| arg.clone()));
    }
    out
}

/// Space-separated FTS terms for a parsed file
///
/// Covers defined symbols, referenced names, and callees so recall finds
/// referencing files as well as defining ones.
fn fts_terms(
    key: &FileKey,
    symbols: &[Symbol],
    references: &[Reference],
    call_edges: &[CallEdge],
) -> String {
    let mut seen = ahash::AHashSet::new();
    let mut terms: Vec<String> = Vec::new();
    let mut push = |term: &str| {
        if !term.is_empty() && seen.insert(term.to_string()) {
            terms.push(term.to_string());
        }
    };
    if let Some(stem) = Path::new(&key.rel_path).file_stem().and_then(|s| s.to_str()) {
        push(stem);
    }
    for sym in symbols {
        push(&sym.name);
        for segment in sym.qualified_name.split("::") {
            push(segment);
        }
    }
    for reference in references {
        for segment in reference.symbol_qualified_name.split("::") {
            push(segment);
        }
    }
    for edge in call_edges {
        for segment in edge.callee_qualified_name.split("::") {
            push(segment);
        }
    }
    terms.join(" ")
}

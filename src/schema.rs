//! Data model for the semantic fact store
//!
//! Every fact row is keyed by `(context_id, file_key)` where
//! `file_key = "{repo_id}:{rel_path}"` with forward slashes. Facts live in
//! either a long-lived baseline context or a sparse PR overlay chained to
//! one via `base_context_id`.

use serde::{Deserialize, Serialize};

/// Schema version written into new store files
pub const SCHEMA_VERSION: &str = "4";

/// Kind of a C++ symbol
///
/// Closed set; extractor strings outside it map to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    CxxMethod,
    Constructor,
    Destructor,
    FunctionTemplate,
    ClassTemplate,
    ClassDecl,
    StructDecl,
    EnumDecl,
    EnumConstant,
    VarDecl,
    FieldDecl,
    Typedef,
    TypeAlias,
    Namespace,
    Macro,
    #[default]
    Unknown,
}

impl SymbolKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::CxxMethod => "cxx_method",
            Self::Constructor => "constructor",
            Self::Destructor => "destructor",
            Self::FunctionTemplate => "function_template",
            Self::ClassTemplate => "class_template",
            Self::ClassDecl => "class_decl",
            Self::StructDecl => "struct_decl",
            Self::EnumDecl => "enum_decl",
            Self::EnumConstant => "enum_constant",
            Self::VarDecl => "var_decl",
            Self::FieldDecl => "field_decl",
            Self::Typedef => "typedef",
            Self::TypeAlias => "type_alias",
            Self::Namespace => "namespace",
            Self::Macro => "macro",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from the stored/extractor string, defaulting to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "function" | "Function" => Self::Function,
            "cxx_method" | "CXXMethod" => Self::CxxMethod,
            "constructor" | "Constructor" => Self::Constructor,
            "destructor" | "Destructor" => Self::Destructor,
            "function_template" | "FunctionTemplate" => Self::FunctionTemplate,
            "class_template" | "ClassTemplate" => Self::ClassTemplate,
            "class_decl" | "ClassDecl" => Self::ClassDecl,
            "struct_decl" | "StructDecl" => Self::StructDecl,
            "enum_decl" | "EnumDecl" => Self::EnumDecl,
            "enum_constant" | "EnumConstant" => Self::EnumConstant,
            "var_decl" | "VarDecl" => Self::VarDecl,
            "field_decl" | "FieldDecl" => Self::FieldDecl,
            "typedef" | "Typedef" => Self::Typedef,
            "type_alias" | "TypeAlias" => Self::TypeAlias,
            "namespace" | "Namespace" => Self::Namespace,
            "macro" | "Macro" => Self::Macro,
            _ => Self::Unknown,
        }
    }
}

/// Kind of a symbol reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Call,
    Read,
    Write,
    Addr,
    TypeRef,
    #[default]
    Unknown,
}

impl RefKind {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Read => "read",
            Self::Write => "write",
            Self::Addr => "addr",
            Self::TypeRef => "type_ref",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from the stored/extractor string, defaulting to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "call" => Self::Call,
            "read" => Self::Read,
            "write" => Self::Write,
            "addr" => Self::Addr,
            "type_ref" => Self::TypeRef,
            _ => Self::Unknown,
        }
    }
}

/// A symbol definition or declaration extracted from a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Canonical file identity (`repo_id:rel_path`)
    pub file_key: String,

    /// Unqualified name
    pub name: String,

    /// Fully qualified name (e.g. `ns::Class::method`)
    pub qualified_name: String,

    /// Symbol kind
    pub kind: SymbolKind,

    /// Start line (1-indexed)
    pub line: u32,

    /// Start column (1-indexed)
    pub col: u32,

    /// Last line of the symbol's extent; definitions span further than
    /// declarations, which is what makes this the duplicate tiebreaker
    pub extent_end_line: u32,
}

/// A reference to a symbol from some location
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// File the reference occurs in
    pub file_key: String,

    /// Qualified name of the referenced symbol
    pub symbol_qualified_name: String,

    /// Line of the reference (1-indexed)
    pub line: u32,

    /// Column of the reference (1-indexed)
    pub col: u32,

    /// How the symbol is used at this site
    pub ref_kind: RefKind,
}

/// A caller → callee edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallEdge {
    /// File containing the call site
    pub file_key: String,

    /// Qualified name of the calling function
    pub caller_qualified_name: String,

    /// Qualified name of the called function
    pub callee_qualified_name: String,

    /// Line of the call site (1-indexed)
    pub line: u32,
}

/// Direction selector for call-graph queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Edges whose callee is the symbol
    In,
    /// Edges whose caller is the symbol
    Out,
    #[default]
    Both,
}

/// An include dependency resolved by the extractor driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeDep {
    /// File containing the `#include`
    pub file_key: String,

    /// Canonical file_key of the included file; empty when the include
    /// does not resolve to a known repo file
    pub included_file_key: String,

    /// Absolute path the extractor resolved the include to
    pub included_abs_path: String,

    /// The literal path as written in the source
    pub raw_path: String,

    /// Include nesting depth reported by the extractor (advisory only)
    pub depth: u32,
}

impl IncludeDep {
    /// Whether this include resolved to a workspace file
    pub fn is_resolved(&self) -> bool {
        !self.included_file_key.is_empty()
    }
}

/// Per-context tracked file with the hashes that drive invalidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    /// Canonical file identity (`repo_id:rel_path`)
    pub file_key: String,

    /// Repo the file belongs to
    pub repo_id: String,

    /// Path relative to the repo root, forward slashes
    pub rel_path: String,

    /// Absolute path at index time (derived, never identity)
    pub abs_path: String,

    /// SHA-256 over the file bytes
    pub content_hash: String,

    /// SHA-256 over the sanitised, sorted compile flags
    pub flags_hash: String,

    /// SHA-256 over the transitive include content hashes
    pub includes_hash: String,

    /// The invalidation key: digest of the three hashes above
    pub composite_hash: String,

    /// When the file was last parsed (RFC 3339)
    pub last_parsed_at: String,
}

/// State of a file within a PR overlay context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Added,
    Modified,
    Deleted,
    Renamed,
    Unchanged,
}

impl FileState {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
            Self::Unchanged => "unchanged",
        }
    }

    /// Parse from the stored string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(Self::Added),
            "modified" => Some(Self::Modified),
            "deleted" => Some(Self::Deleted),
            "renamed" => Some(Self::Renamed),
            "unchanged" => Some(Self::Unchanged),
            _ => None,
        }
    }

    /// Whether facts for this state live in the overlay itself
    pub fn carries_overlay_rows(&self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Renamed)
    }
}

/// Overlay entry describing how a file differs from the baseline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFileState {
    pub file_key: String,
    pub state: FileState,

    /// For `renamed`: the baseline file_key this file replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_from_file_key: Option<String>,
}

/// A registered workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub root_path: String,
    pub manifest_path: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Mode of an analysis context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Long-lived context tracking the workspace default branches
    Baseline,
    /// Sparse overlay over a baseline for one merge request
    Pr,
}

impl ContextMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Pr => "pr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(Self::Baseline),
            "pr" => Some(Self::Pr),
            _ => None,
        }
    }
}

/// How much of the context's file set is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayMode {
    /// Every file of the workspace (baselines)
    Full,
    /// Only changed files (PR overlays)
    Sparse,
    /// Degraded: caps exceeded, bulk persistence disabled
    PartialOverlay,
}

impl OverlayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Sparse => "sparse",
            Self::PartialOverlay => "partial_overlay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "sparse" => Some(Self::Sparse),
            "partial_overlay" => Some(Self::PartialOverlay),
            _ => None,
        }
    }
}

/// Lifecycle status of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Active,
    Expired,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A named set of facts: either a baseline or a PR overlay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub context_id: String,
    pub workspace_id: String,
    pub mode: ContextMode,

    /// For `pr` contexts: the baseline this overlay chains to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_context_id: Option<String>,

    pub overlay_mode: OverlayMode,

    /// Persisted overlay bookkeeping; must reflect actual row counts
    pub overlay_file_count: u64,
    pub overlay_row_count: u64,

    pub status: ContextStatus,
    pub created_at: String,
    pub last_accessed_at: String,

    /// Absent for baselines, which never expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl AnalysisContext {
    /// The well-known id of a workspace's baseline context
    pub fn baseline_id(workspace_id: &str) -> String {
        format!("baseline:{}", workspace_id)
    }
}

/// Audit record for one extractor invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseRun {
    pub context_id: String,
    pub file_key: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub success: bool,
    pub diagnostic_count: usize,
    pub symbol_count: usize,
}

/// Which durable job queue a job lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobQueue {
    /// Parse/index work produced by sync events and bulk persists
    Index,
    /// Repo fetch + detached checkout work produced by webhooks
    RepoSync,
}

impl JobQueue {
    /// Store table backing this queue
    pub fn table(&self) -> &'static str {
        match self {
            Self::Index => "index_jobs",
            Self::RepoSync => "repo_sync_jobs",
        }
    }
}

/// Lifecycle status of a durable job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// A durable, leased job row
///
/// The idempotency key is
/// `(workspace_id, repo_id, ref_name, context_id, event_sha)`; inserting a
/// duplicate is a no-op returning the existing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub workspace_id: String,
    pub repo_id: String,

    /// Git ref the event targeted (branch or MR ref)
    pub ref_name: String,

    /// Context the job feeds, when known at enqueue time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Normalised webhook event type (`push`, `merge_request`, `manual`)
    pub event_type: String,

    /// Exact commit the event pinned
    pub event_sha: String,

    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,

    /// Lease expiry while `running` (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: String,
    pub updated_at: String,
}

/// Freshness of a candidate file relative to its stored hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Stored composite hash matches the live one
    Fresh,
    /// Stored row exists but the composite hash differs
    Stale,
    /// No stored row for this file
    Unparsed,
    /// No compile flags available; cannot hash or parse
    MissingFlags,
}

impl Freshness {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Unparsed => "unparsed",
            Self::MissingFlags => "missing_flags",
        }
    }
}

/// Response metadata enumerating what the answer is based on
///
/// Every query returns one of these, even when the result set is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceEnvelope {
    /// Files whose facts are verified fresh (or verified absent)
    pub verified_files: Vec<String>,

    /// Files with stale facts that were not reparsed
    pub stale_files: Vec<String>,

    /// Files with no usable facts
    pub unparsed_files: Vec<String>,

    /// Per-repo verified ratio; repos with zero candidates are absent
    pub repo_coverage: std::collections::BTreeMap<String, f64>,

    /// Overlay mode of the resolved context
    pub overlay_mode: String,

    /// Machine-readable warnings (`no_candidates`, `budget_exceeded`, ...)
    pub warnings: Vec<String>,
}

impl ConfidenceEnvelope {
    /// Add a warning once
    pub fn warn(&mut self, warning: impl Into<String>) {
        let w = warning.into();
        if !self.warnings.contains(&w) {
            self.warnings.push(w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_kind_round_trips_through_strings() {
        for kind in [
            SymbolKind::Function,
            SymbolKind::CxxMethod,
            SymbolKind::ClassTemplate,
            SymbolKind::Macro,
        ] {
            assert_eq!(SymbolKind::parse(kind.as_str()), kind);
        }
        assert_eq!(SymbolKind::parse("CXXMethod"), SymbolKind::CxxMethod);
        assert_eq!(SymbolKind::parse("garbage"), SymbolKind::Unknown);
    }

    #[test]
    fn overlay_row_states() {
        assert!(FileState::Added.carries_overlay_rows());
        assert!(FileState::Renamed.carries_overlay_rows());
        assert!(!FileState::Deleted.carries_overlay_rows());
        assert!(!FileState::Unchanged.carries_overlay_rows());
    }

    #[test]
    fn envelope_warns_once() {
        let mut env = ConfidenceEnvelope::default();
        env.warn("budget_exceeded");
        env.warn("budget_exceeded");
        assert_eq!(env.warnings.len(), 1);
    }
}

#![allow(clippy::type_complexity)]
#![allow(clippy::result_large_err)]
#![allow(clippy::too_many_arguments)]

//! Symdex Engine: workspace-scoped semantic indexing for C++ source trees
//!
//! The engine answers "where is this symbol defined / referenced /
//! called?" across multiple repos without parsing whole repositories. It
//! keeps a content-addressed cache of AST-derived facts (symbols,
//! references, call edges, include deps) in an embedded SQLite store,
//! invalidated by a composite hash over file content, sanitised compile
//! flags, and transitive include content. Sparse PR overlays layer on a
//! long-lived baseline so merge-request queries see exactly the files
//! that changed.
//!
//! # Architecture
//!
//! ```text
//! query ──► Orchestrator ──► ContextManager (baseline + PR overlays)
//!               │                  │
//!               ├──► Recaller (FTS │ ripgrep fallback)
//!               ├──► Hasher (content | flags | includes → composite)
//!               ├──► ExtractorDriver (subprocess pool, bounded fan-out)
//!               │          │
//!               │          ▼
//!               └──► FactStore ◄── SingleWriter (micro-batched mutations)
//!                                        ▲
//!                    SyncEngine ─────────┘ (webhooks → leased jobs)
//! ```
//!
//! All mutations funnel through the single writer; queries return a
//! confidence envelope describing exactly which files their answer is
//! based on.

pub mod api;
pub mod cli;
pub mod commands;
pub mod compile_commands;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod extractor;
pub mod git;
pub mod hashing;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod recall;
pub mod schema;
pub mod store;
pub mod sync;
pub mod workspace;

// Re-export commonly used types
pub use cli::{Cli, OutputFormat};
pub use config::EngineConfig;
pub use error::{EngineError, Result};

pub use schema::{
    AnalysisContext, CallDirection, CallEdge, ConfidenceEnvelope, ContextFileState, ContextMode,
    ContextStatus, FileState, Freshness, IncludeDep, JobQueue, JobStatus, OverlayMode, ParseRun,
    RefKind, Reference, Symbol, SymbolKind, SyncJob, TrackedFile, Workspace, SCHEMA_VERSION,
};

pub use paths::{lookup_key, normalize_rel_path, FileKey};

pub use hashing::{composite_hash, content_hash, flags_hash, includes_hash, sanitize_flags};

pub use manifest::{Manifest, PathRemap, RepoSpec};

pub use compile_commands::{CompileCommand, CompileDb, CompileDbCache};

pub use store::writer::{spawn_writer, FileFacts, WriteOp, WriteOutcome, WriterHandle};
pub use store::{ContextChain, FactStore};

pub use context::{ContextManager, ContextSelector};

pub use extractor::{ExtractAction, ExtractorDriver, LiveHashes, ParseResult, ParsedFile};

pub use recall::{
    CompositeRecaller, FtsRecaller, LexicalRecaller, RecallHit, RecallSource, Recaller,
    SearchMatch,
};

pub use orchestrator::{Orchestrator, QueryOutcome, QueryScope};

pub use sync::{DiffSummary, SyncEngine, SyncEvent};

pub use workspace::{is_cxx_file, register_workspace, WorkspaceHandle, MANIFEST_FILE};

pub use api::{Engine, HealthReport};

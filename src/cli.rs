//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::schema::CallDirection;

/// Workspace-scoped C++ semantic index engine
#[derive(Parser, Debug)]
#[command(name = "symdex")]
#[command(about = "Semantic indexing and query engine for C++ workspaces")]
#[command(version)]
pub struct Cli {
    /// Workspace root (contains symdex.yaml)
    #[arg(short, long, global = true, default_value = ".")]
    pub workspace: PathBuf,

    /// Output format
    #[arg(long, global = true, default_value = "json", value_enum)]
    pub format: OutputFormat,

    /// Extractor binary override
    #[arg(long, global = true, env = "SYMDEX_EXTRACTOR")]
    pub extractor: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    Compact,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register (or refresh) the workspace and create its baseline
    Register,

    /// Bulk-index one repo or the whole workspace into the baseline
    Index {
        /// Repo to index; all repos when omitted
        repo: Option<String>,
    },

    /// Symbol and file queries
    #[command(subcommand)]
    Query(QueryCommand),

    /// PR overlay lifecycle
    #[command(subcommand)]
    Overlay(OverlayCommand),

    /// Enqueue repo sync jobs
    Sync {
        /// Repo to sync; all repos when omitted
        repo: Option<String>,

        /// Exact commit to check out (defaults to the manifest pin or HEAD)
        #[arg(long)]
        sha: Option<String>,
    },

    /// Show a sync or index job
    Job {
        job_id: String,
    },

    /// Expire overdue PR contexts and reclaim their rows
    Gc,

    /// Engine health snapshot
    Health,
}

#[derive(Subcommand, Debug)]
pub enum QueryCommand {
    /// Where is this symbol referenced?
    References {
        symbol: String,

        /// PR context id to query through
        #[arg(long)]
        context: Option<String>,

        /// Entry repos (closed over depends_on)
        #[arg(long)]
        repo: Vec<String>,
    },

    /// Where is this symbol defined?
    Definition {
        symbol: String,

        #[arg(long)]
        context: Option<String>,

        #[arg(long)]
        repo: Vec<String>,
    },

    /// Callers/callees of a function
    CallGraph {
        symbol: String,

        #[arg(long, default_value = "both", value_enum)]
        direction: DirectionArg,

        #[arg(long)]
        context: Option<String>,
    },

    /// All symbols of one file
    FileSymbols {
        file_key: String,

        #[arg(long)]
        context: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    In,
    Out,
    Both,
}

impl From<DirectionArg> for CallDirection {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::In => CallDirection::In,
            DirectionArg::Out => CallDirection::Out,
            DirectionArg::Both => CallDirection::Both,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum OverlayCommand {
    /// Create a sparse PR overlay from a ref range
    Create {
        #[arg(long)]
        base_ref: String,

        #[arg(long)]
        head_ref: String,
    },

    /// Expire an overlay and reclaim its rows
    Expire {
        context_id: String,
    },
}

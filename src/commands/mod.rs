//! CLI command implementations
//!
//! Each command bootstraps the engine over the workspace, performs one
//! operation through the same facade the daemon uses, and prints the
//! result in the selected output format.

mod admin;
mod index;
mod query;
mod sync;

pub use admin::{run_gc, run_health, run_overlay, run_register};
pub use index::run_index;
pub use query::run_query;
pub use sync::{run_job, run_sync};

use crate::cli::OutputFormat;
use crate::error::Result;

/// Serialise a command result per the requested format
pub fn render<T: serde::Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    let out = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Compact => serde_json::to_string(value)?,
    };
    Ok(out)
}

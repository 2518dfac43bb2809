//! `symdex index`: bulk indexing into the baseline

use serde::Serialize;

use crate::api::Engine;
use crate::cli::OutputFormat;
use crate::commands::render;
use crate::error::Result;

#[derive(Debug, Serialize)]
struct RepoIndexStats {
    repo_id: String,
    parsed: usize,
    failed: usize,
}

pub async fn run_index(
    engine: &Engine,
    repo: &Option<String>,
    format: OutputFormat,
) -> Result<String> {
    let repos = match repo {
        Some(repo_id) => vec![repo_id.clone()],
        None => engine.workspace.manifest.repo_ids(),
    };

    let mut stats = Vec::with_capacity(repos.len());
    for repo_id in repos {
        tracing::info!("indexing {}", repo_id);
        let (parsed, failed) = engine.sync.index_repo(&repo_id).await?;
        stats.push(RepoIndexStats {
            repo_id,
            parsed,
            failed,
        });
    }
    render(&stats, format)
}

//! `symdex sync` and `symdex job`: sync job management

use crate::api::{Engine, SyncRepoRequest};
use crate::cli::OutputFormat;
use crate::commands::render;
use crate::error::Result;

pub async fn run_sync(
    engine: &Engine,
    repo: &Option<String>,
    sha: &Option<String>,
    format: OutputFormat,
) -> Result<String> {
    let workspace_id = engine.workspace.workspace_id.clone();
    match repo {
        Some(repo_id) => {
            let req = SyncRepoRequest {
                workspace_id,
                repo_id: repo_id.clone(),
                ref_name: None,
                commit_sha: sha.clone(),
            };
            render(&engine.sync_repo(&req).await?, format)
        }
        None => render(&engine.sync_all_repos(&workspace_id).await?, format),
    }
}

pub fn run_job(engine: &Engine, job_id: &str, format: OutputFormat) -> Result<String> {
    render(&engine.sync_job_status(job_id)?, format)
}

//! `symdex register` / `overlay` / `gc` / `health`

use crate::api::{CreateOverlayRequest, Engine};
use crate::cli::{OutputFormat, OverlayCommand};
use crate::commands::render;
use crate::error::Result;

pub fn run_register(engine: &Engine, format: OutputFormat) -> Result<String> {
    // Bootstrap already registered the workspace and baseline; report it
    let workspace = engine.workspace_get(&engine.workspace.workspace_id)?;
    render(&workspace, format)
}

pub async fn run_overlay(
    engine: &Engine,
    command: &OverlayCommand,
    format: OutputFormat,
) -> Result<String> {
    match command {
        OverlayCommand::Create { base_ref, head_ref } => {
            let req = CreateOverlayRequest {
                workspace_id: engine.workspace.workspace_id.clone(),
                base_ref: Some(base_ref.clone()),
                head_ref: Some(head_ref.clone()),
                changed_files: None,
            };
            render(&engine.context_create_pr_overlay(&req).await?, format)
        }
        OverlayCommand::Expire { context_id } => {
            let reclaimed = engine.context_expire(context_id).await?;
            render(
                &serde_json::json!({"context_id": context_id, "reclaimed_rows": reclaimed}),
                format,
            )
        }
    }
}

pub async fn run_gc(engine: &Engine, format: OutputFormat) -> Result<String> {
    let expired = engine.contexts.gc_sweep().await?;
    render(&serde_json::json!({"expired_contexts": expired}), format)
}

pub fn run_health(engine: &Engine, format: OutputFormat) -> Result<String> {
    render(&engine.health()?, format)
}

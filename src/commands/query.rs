//! `symdex query` subcommands

use crate::api::{AnalysisContextParam, Engine, FileSymbolsRequest, SymbolQueryRequest};
use crate::cli::{OutputFormat, QueryCommand};
use crate::commands::render;
use crate::error::Result;

fn context_param(context: &Option<String>) -> Option<AnalysisContextParam> {
    context.as_ref().map(|id| AnalysisContextParam {
        mode: Some("pr".into()),
        context_id: Some(id.clone()),
        ..Default::default()
    })
}

fn scope_param(repos: &[String]) -> Option<crate::api::ScopeParam> {
    if repos.is_empty() {
        None
    } else {
        Some(crate::api::ScopeParam {
            entry_repos: repos.to_vec(),
            file_keys: None,
        })
    }
}

pub async fn run_query(
    engine: &Engine,
    command: &QueryCommand,
    format: OutputFormat,
) -> Result<String> {
    let workspace_id = engine.workspace.workspace_id.clone();
    match command {
        QueryCommand::References {
            symbol,
            context,
            repo,
        } => {
            let req = SymbolQueryRequest {
                workspace_id,
                symbol: symbol.clone(),
                analysis_context: context_param(context),
                scope: scope_param(repo),
                direction: None,
            };
            render(&engine.query_references(&req).await?, format)
        }
        QueryCommand::Definition {
            symbol,
            context,
            repo,
        } => {
            let req = SymbolQueryRequest {
                workspace_id,
                symbol: symbol.clone(),
                analysis_context: context_param(context),
                scope: scope_param(repo),
                direction: None,
            };
            render(&engine.query_definition(&req).await?, format)
        }
        QueryCommand::CallGraph {
            symbol,
            direction,
            context,
        } => {
            let req = SymbolQueryRequest {
                workspace_id,
                symbol: symbol.clone(),
                analysis_context: context_param(context),
                scope: None,
                direction: Some((*direction).into()),
            };
            render(&engine.query_call_graph(&req).await?, format)
        }
        QueryCommand::FileSymbols { file_key, context } => {
            let req = FileSymbolsRequest {
                workspace_id,
                file_key: file_key.clone(),
                analysis_context: context_param(context),
            };
            render(&engine.query_file_symbols(&req).await?, format)
        }
    }
}

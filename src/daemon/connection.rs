//! WebSocket connection handler
//!
//! Manages a single client connection: accepts the handshake, routes
//! `query` messages into the engine facade, and maps engine errors to
//! protocol error codes.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use crate::api::{
    reject_legacy_fields, AnalysisContextParam, CreateOverlayRequest, Engine, FileSymbolsRequest,
    InvalidateRequest, SymbolQueryRequest, SyncRepoRequest,
};
use crate::daemon::protocol::{ClientMessage, ConnectionInfo, ServerMessage};
use crate::error::{EngineError, Result};
use crate::schema::CallDirection;

/// Handle a single WebSocket connection
pub async fn handle_connection(stream: TcpStream, engine: Arc<RwLock<Engine>>) {
    let addr = stream.peer_addr().ok();
    tracing::info!("new connection from {:?}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let mut conn = ConnectionState::new(ws_stream, engine);
    conn.run().await;

    tracing::info!("connection closed from {:?}", addr);
}

struct ConnectionState {
    ws: WebSocketStream<TcpStream>,
    engine: Arc<RwLock<Engine>>,
    client_id: String,
}

impl ConnectionState {
    fn new(ws: WebSocketStream<TcpStream>, engine: Arc<RwLock<Engine>>) -> Self {
        let client_id = format!(
            "cli_{}",
            uuid::Uuid::new_v4()
                .to_string()
                .split('-')
                .next()
                .unwrap_or("anon")
        );
        Self {
            ws,
            engine,
            client_id,
        }
    }

    async fn run(&mut self) {
        let info = {
            let engine = self.engine.read().await;
            ConnectionInfo {
                client_id: self.client_id.clone(),
                workspace_id: engine.workspace.workspace_id.clone(),
                repo_count: engine.workspace.manifest.repos.len(),
            }
        };
        let _ = self.send(ServerMessage::Connected(info)).await;

        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_message(&text).await {
                        tracing::error!("error handling message: {}", e);
                        let _ = self
                            .send(ServerMessage::Error {
                                id: None,
                                code: e.kind().to_string(),
                                message: e.to_string(),
                            })
                            .await;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(data)) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("websocket error: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_message(&mut self, text: &str) -> Result<()> {
        let msg: ClientMessage =
            serde_json::from_str(text).map_err(|e| EngineError::Validation {
                message: format!("malformed message: {}", e),
            })?;
        match msg {
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
            ClientMessage::Query { id, method, params } => {
                let response = dispatch(&self.engine, &method, params).await;
                match response {
                    Ok(result) => self.send(ServerMessage::Response { id, result }).await,
                    Err(e) => {
                        self.send(ServerMessage::Error {
                            id: Some(id),
                            code: e.kind().to_string(),
                            message: e.to_string(),
                        })
                        .await
                    }
                }
            }
        }
    }

    async fn send(&mut self, msg: ServerMessage) -> Result<()> {
        let json = serde_json::to_string(&msg)?;
        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|e| EngineError::internal(format!("websocket send failed: {}", e)))
    }
}

// ----------------------------------------------------------------------
// Method dispatch
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExploreSymbolParams {
    workspace_id: String,
    symbol: String,
    #[serde(default)]
    analysis_context: Option<AnalysisContextParam>,
    #[serde(default)]
    entry_repos: Vec<String>,
    #[serde(default)]
    scope_file_keys: Option<Vec<String>>,
    #[serde(default)]
    direction: Option<CallDirection>,
}

#[derive(Debug, Deserialize)]
struct ExploreFileParams {
    workspace_id: String,
    #[serde(default)]
    analysis_context: Option<AnalysisContextParam>,
    #[serde(default)]
    file_key: Option<String>,
    #[serde(default)]
    file_keys: Option<Vec<String>>,
}

impl ExploreFileParams {
    fn one_key(&self) -> Result<&str> {
        self.file_key
            .as_deref()
            .ok_or_else(|| EngineError::Validation {
                message: "file_key is required".into(),
            })
    }

    fn many_keys(&self) -> Vec<String> {
        match (&self.file_keys, &self.file_key) {
            (Some(keys), _) => keys.clone(),
            (None, Some(key)) => vec![key.clone()],
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RgSearchParams {
    workspace_id: String,
    pattern: String,
    #[serde(default)]
    entry_repos: Vec<String>,
    #[serde(default = "default_rg_limit")]
    limit: usize,
}

fn default_rg_limit() -> usize {
    200
}

#[derive(Debug, Deserialize)]
struct ContextExpireParams {
    context_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusParams {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct WorkspaceParams {
    workspace_id: String,
}

#[derive(Debug, Deserialize)]
struct SyncBatchParams {
    requests: Vec<SyncRepoRequest>,
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(Into::into)
}

fn parse<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| EngineError::Validation {
        message: format!("invalid params: {}", e),
    })
}

/// Route one method invocation into the engine facade
pub async fn dispatch(
    engine: &Arc<RwLock<Engine>>,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    reject_legacy_fields(&params)?;

    match method {
        "query.references" => {
            let req: SymbolQueryRequest = parse(params)?;
            to_json(engine.read().await.query_references(&req).await?)
        }
        "query.definition" => {
            let req: SymbolQueryRequest = parse(params)?;
            to_json(engine.read().await.query_definition(&req).await?)
        }
        "query.call_graph" => {
            let req: SymbolQueryRequest = parse(params)?;
            to_json(engine.read().await.query_call_graph(&req).await?)
        }
        "query.file_symbols" => {
            let req: FileSymbolsRequest = parse(params)?;
            to_json(engine.read().await.query_file_symbols(&req).await?)
        }

        "explore.list_candidates" => {
            let p: ExploreSymbolParams = parse(params)?;
            let engine = engine.read().await;
            to_json(
                engine
                    .explore_list_candidates(
                        &p.workspace_id,
                        &p.symbol,
                        &p.analysis_context,
                        &p.entry_repos,
                    )
                    .await?,
            )
        }
        "explore.classify_freshness" => {
            let p: ExploreFileParams = parse(params)?;
            let engine = engine.read().await;
            to_json(
                engine
                    .explore_classify_freshness(
                        &p.workspace_id,
                        &p.analysis_context,
                        p.many_keys(),
                    )
                    .await?,
            )
        }
        "explore.parse_file" => {
            let p: ExploreFileParams = parse(params)?;
            let engine = engine.read().await;
            engine
                .explore_parse_file(&p.workspace_id, &p.analysis_context, p.one_key()?)
                .await
        }
        "explore.fetch_symbols" => {
            let p: ExploreFileParams = parse(params)?;
            let engine = engine.read().await;
            to_json(
                engine
                    .explore_fetch_symbols(&p.workspace_id, &p.analysis_context, p.many_keys())
                    .await?,
            )
        }
        "explore.fetch_references" => {
            let p: ExploreSymbolParams = parse(params)?;
            let engine = engine.read().await;
            to_json(
                engine
                    .explore_fetch_references(
                        &p.workspace_id,
                        &p.analysis_context,
                        &p.symbol,
                        p.scope_file_keys,
                    )
                    .await?,
            )
        }
        "explore.fetch_call_edges" => {
            let p: ExploreSymbolParams = parse(params)?;
            let engine = engine.read().await;
            to_json(
                engine
                    .explore_fetch_call_edges(
                        &p.workspace_id,
                        &p.analysis_context,
                        &p.symbol,
                        p.direction.unwrap_or_default(),
                    )
                    .await?,
            )
        }
        "explore.read_file" => {
            let p: ExploreFileParams = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.explore_read_file(&p.workspace_id, p.one_key()?)?)
        }
        "explore.rg_search" => {
            let p: RgSearchParams = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.explore_rg_search(
                &p.workspace_id,
                &p.pattern,
                &p.entry_repos,
                p.limit,
            )?)
        }
        "explore.get_compile_command" => {
            let p: ExploreFileParams = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.explore_get_compile_command(&p.workspace_id, p.one_key()?)?)
        }
        "explore.get_confidence" => {
            let p: ExploreFileParams = parse(params)?;
            let engine = engine.read().await;
            to_json(
                engine
                    .explore_get_confidence(
                        &p.workspace_id,
                        &p.analysis_context,
                        p.many_keys(),
                    )
                    .await?,
            )
        }

        "cache.invalidate" => {
            let req: InvalidateRequest = parse(params)?;
            let engine = engine.read().await;
            to_json(serde_json::json!({
                "invalidated": engine.cache_invalidate(&req).await?
            }))
        }

        "workspace.get" => {
            let p: WorkspaceParams = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.workspace_get(&p.workspace_id)?)
        }
        "workspace.register" | "workspace.refresh_manifest" => {
            let mut engine = engine.write().await;
            to_json(engine.workspace_refresh_manifest().await?)
        }

        "context.create_pr_overlay" => {
            let req: CreateOverlayRequest = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.context_create_pr_overlay(&req).await?)
        }
        "context.expire" => {
            let p: ContextExpireParams = parse(params)?;
            let engine = engine.read().await;
            to_json(serde_json::json!({
                "reclaimed_rows": engine.context_expire(&p.context_id).await?
            }))
        }

        "sync.repo" => {
            let req: SyncRepoRequest = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.sync_repo(&req).await?)
        }
        "sync.batch" => {
            let p: SyncBatchParams = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.sync_batch(&p.requests).await?)
        }
        "sync.all" => {
            let p: WorkspaceParams = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.sync_all_repos(&p.workspace_id).await?)
        }
        "sync.job_status" => {
            let p: JobStatusParams = parse(params)?;
            let engine = engine.read().await;
            to_json(engine.sync_job_status(&p.job_id)?)
        }

        "webhook.gitlab" => {
            let engine = engine.read().await;
            to_json(engine.webhook_gitlab(&params).await?)
        }

        "health" => {
            let engine = engine.read().await;
            to_json(engine.health()?)
        }

        other => Err(EngineError::NotFound {
            what: format!("method {}", other),
        }),
    }
}

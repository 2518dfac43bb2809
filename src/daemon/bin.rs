//! Symdex Daemon Binary
//!
//! A WebSocket server exposing the workspace query/command surface.
//!
//! # Usage
//!
//! ```bash
//! symdex-daemon --workspace /path/to/workspace --port 9848
//! symdex-daemon --workspace . --port 9848 --host 127.0.0.1
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use symdex_engine::api::Engine;
use symdex_engine::config::EngineConfig;
use symdex_engine::daemon::handle_connection;

/// Symdex workspace indexing daemon
#[derive(Parser, Debug)]
#[command(name = "symdex-daemon")]
#[command(about = "Workspace-scoped C++ semantic index daemon")]
struct Args {
    /// Workspace root (contains symdex.yaml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "9848")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Extractor binary override
    #[arg(long, env = "SYMDEX_EXTRACTOR")]
    extractor: Option<PathBuf>,

    /// Parse worker pool size (defaults to logical cores)
    #[arg(long)]
    parse_workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("symdex_engine=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let mut config = EngineConfig::default();
    if let Some(extractor) = args.extractor {
        config.extractor_path = Some(extractor);
    }
    if let Some(workers) = args.parse_workers {
        config.max_parse_workers = workers.max(1);
    }

    let workspace_root = args.workspace.canonicalize()?;
    let engine = Engine::bootstrap(&workspace_root, config).await?;
    let _background = engine.spawn_background_tasks();
    let engine = Arc::new(RwLock::new(engine));

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("symdex daemon listening on ws://{}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!("accepted connection from {}", peer);
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    handle_connection(stream, engine).await;
                });
            }
            Err(e) => {
                tracing::error!("failed to accept connection: {}", e);
            }
        }
    }
}

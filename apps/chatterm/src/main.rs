//! chatterm server.
//!
//! Run with: cargo run -p chatterm -- --config ~/.config/chatterm
//!
//! Clients connect to `ws://<listen>/ws` and authenticate with a `hello`
//! carrying their chat id and the configured token.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use axum::{Router, routing::get};
use chatterm_core::{ConfigStore, workdir};
use chatterm_executor::Registry;
use chatterm_session::{EventLoop, MessageSink};
use chatterm_transport::{Connections, websocket};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shell, pty and ssh executors driven from a chat
#[derive(Parser, Debug)]
#[command(name = "chatterm", version)]
struct Args {
    /// Directory holding config.json [default: ~/.config/chatterm]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long)]
    listen: Option<String>,
}

fn default_config_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine the home directory")?;
    Ok(home.join(".config").join("chatterm"))
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for ctrl-c: {e}");
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        }
        () = shutdown.cancelled() => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config_dir = match args.config {
        Some(dir) => dir,
        None => default_config_dir()?,
    };

    let store = Arc::new(ConfigStore::load(&config_dir).context("failed to load config")?);
    store.validate().with_context(|| {
        format!(
            "invalid config, edit {}",
            config_dir.join(chatterm_core::config::CONFIG_FILE).display()
        )
    })?;
    let home = workdir::chdir_home().context("failed to enter the home directory")?;
    tracing::info!(dir = %home.display(), "Working directory");

    let connections = Arc::new(Connections::new());
    let sink: Arc<dyn MessageSink> = connections.clone();
    let registry = Arc::new(Registry::with_builtin());
    let (event_loop, handle) = EventLoop::new(Arc::clone(&store), registry, sink)
        .await
        .context("failed to open the default executor")?;

    let shutdown = CancellationToken::new();
    let loop_task = tokio::spawn(event_loop.run(shutdown.clone()));

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(websocket::create_ws_router(handle, connections))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = args.listen.unwrap_or_else(|| store.listen());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on ws://{addr}/ws");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;
    shutdown.cancel();
    if let Err(e) = loop_task.await {
        tracing::error!("Event loop panicked: {e}");
    }
    served.context("server error")?;
    Ok(())
}

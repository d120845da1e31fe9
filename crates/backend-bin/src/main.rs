// ============================
// pika-backend-bin/src/main.rs
// ============================
//! Entry point for the Pika! live DJ server.
use anyhow::Context;
use backend_lib::{
    config::{Settings, StoreBackend},
    ws_router, AppState,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "pika-server")]
#[command(about = "Real-time DJ broadcast server")]
#[command(version)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, default_value = "pika.toml", env = "PIKA_CONFIG")]
    config: PathBuf,

    /// Override the bind address from the settings file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Keep everything in memory instead of the flat-file store
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("Failed to load settings from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if args.memory_store {
        settings.storage.backend = StoreBackend::Memory;
    }

    init_tracing(&settings.log_level, args.json_logs);

    info!(
        bind = %settings.bind_addr,
        backend = ?settings.storage.backend,
        path = %settings.storage.path.display(),
        "Starting Pika! server"
    );

    let bind_addr = settings.bind_addr;
    let heartbeat = Duration::from_secs(settings.heartbeat.interval_secs);
    let state = Arc::new(AppState::from_settings(settings).context("Failed to build app state")?);
    let heartbeat_task = state.coordinator.spawn_heartbeat(heartbeat);

    let app = ws_router::create_router(Arc::clone(&state));
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!("listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    heartbeat_task.abort();
    state.coordinator.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},tower_http=info")));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        () = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

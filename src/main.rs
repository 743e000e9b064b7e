use clap::Parser;
use scorecmp::comparison::ComparisonEngine;
use scorecmp::config::AppConfig;
use scorecmp::ingest::IngestState;
use scorecmp::store::{DuckDbStore, ScoreStore};
use scorecmp::{routes, storage};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

#[derive(Parser)]
#[command(name = "scorecmp", about = "Score comparison analytics service")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scorecmp=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        db = %config.database.path.display(),
        "starting scorecmp"
    );

    // SQLite write path
    let pool = storage::sqlite::create_pool(&config.database)?;
    storage::sqlite::init_pool(&pool).await?;
    tracing::info!("database initialized");

    // DuckDB read path over the same file
    let store: Arc<dyn ScoreStore> = Arc::new(DuckDbStore::attach_sqlite(&config.database.path)?);
    tracing::info!("analytics store attached (DuckDB)");

    let engine = Arc::new(ComparisonEngine::new(store, config.analytics.clone()));
    let ingest = Arc::new(IngestState {
        pool,
        config: config.ingest.clone(),
    });
    let app = routes::build_router(ingest, engine);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down...");
}

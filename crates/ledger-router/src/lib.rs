//! Claim Ledger Router
//!
//! HTTP delivery of the ledger facade. Every route translates one request
//! into one [`ledger_engine::Ledger`] call and answers with the wire envelope;
//! the janitor worker runs alongside the server.

#![warn(missing_docs)]

pub mod config;
pub mod envelope;
pub mod handlers;

use config::{RouterConfig, StorageConfig};
use handlers::{create_router, AppState};
use ledger_domain::traits::LedgerStore;
use ledger_domain::StoreError;
use ledger_engine::Ledger;
use ledger_janitor::{JanitorError, JanitorWorker};
use ledger_store::{MemoryStore, SqliteStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Router error
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Storage could not be opened
    #[error("Failed to open storage: {0}")]
    Store(#[from] StoreError),

    /// Server binding error
    #[error("Failed to bind server: {0}")]
    Bind(#[from] std::io::Error),

    /// Background maintenance failed
    #[error("Janitor error: {0}")]
    Janitor(#[from] JanitorError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A subscriber installed earlier (tests, embedding binaries) stays in place
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Open the configured store and build the ledger over it
pub fn build_ledger(config: &RouterConfig) -> Result<Ledger, RouterError> {
    let store: Arc<dyn LedgerStore> = match &config.storage {
        StorageConfig::Memory => Arc::new(MemoryStore::new()),
        StorageConfig::Sqlite { path } => {
            info!("Opening SQLite store at {}", path.display());
            Arc::new(SqliteStore::new(path)?)
        }
    };

    Ok(Ledger::new(store, config.ledger.clone()).with_evaluator(config.evaluator.clone()))
}

/// Start the Router HTTP server
///
/// Builds the ledger, spawns the janitor worker, and serves until Ctrl+C,
/// then stops the worker.
pub async fn start_server(config: RouterConfig) -> Result<(), RouterError> {
    info!("Starting Claim Ledger Router");
    info!("Bind address: {}", config.bind_addr());
    info!("Storage: {:?}", config.storage);

    let ledger = Arc::new(build_ledger(&config)?);
    let state = AppState::new(ledger.clone(), config.default_page_size);
    let app = create_router(state);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut worker = JanitorWorker::new(ledger, config.janitor.clone());
    let janitor = tokio::spawn(async move {
        worker
            .run(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    let listener = TcpListener::bind(&config.bind_addr()).await?;
    info!("Router listening on {}", config.bind_addr());

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RouterError::Server(e.to_string()));

    let _ = stop_tx.send(true);
    match janitor.await {
        Ok(result) => result?,
        Err(e) => return Err(RouterError::Server(format!("janitor task failed: {}", e))),
    }

    served?;
    info!("Router stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

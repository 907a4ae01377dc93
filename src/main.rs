//! Fraudlens backend entry point.
//!
//! Wires configuration, storage, the scoring pipeline, case service, event
//! bus, and the two periodic workers (pattern miner, retrain guardian),
//! then serves the HTTP adapter until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fraudlens_backend::api::{self, AppState};
use fraudlens_backend::cases::CaseService;
use fraudlens_backend::config::Config;
use fraudlens_backend::events::EventBus;
use fraudlens_backend::ingest::IngestionPipeline;
use fraudlens_backend::llm::OllamaClient;
use fraudlens_backend::patterns::miner::spawn_miner;
use fraudlens_backend::risk::guardian::{Guardian, GuardianConfig};
use fraudlens_backend::risk::registry::ModelRegistry;
use fraudlens_backend::risk::scorer::{CurrentModel, Scorer};
use fraudlens_backend::storage::Store;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fraudlens_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing();

    info!("fraudlens backend starting");

    let store = Arc::new(Store::new(&config.database_path)?);
    let registry = Arc::new(ModelRegistry::new(&config.models_dir)?);

    let current = Arc::new(CurrentModel::empty());
    match current.reload(&registry) {
        Ok(version) => info!(model_version = %version, "scoring model resolved"),
        Err(e) => warn!(error = %e, "model load failed, starting in rules mode"),
    }

    let bus = EventBus::new();
    let llm = OllamaClient::from_config(&config);
    let retrain_lock = Arc::new(tokio::sync::Mutex::new(()));

    let scorer = Arc::new(Scorer::new(current.clone()));
    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        scorer,
        bus.clone(),
        Some(llm.clone()),
    ));
    let cases = Arc::new(CaseService::new(
        store.clone(),
        registry.clone(),
        current.clone(),
        bus.clone(),
        Some(llm.clone()),
        retrain_lock.clone(),
    ));

    let guardian = Arc::new(Guardian::new(
        store.clone(),
        registry.clone(),
        current.clone(),
        bus.clone(),
        Some(llm),
        retrain_lock.clone(),
        GuardianConfig {
            check_interval: Duration::from_secs(config.guardian_check_interval_secs),
            warmup: Duration::from_secs(60),
            min_labels: config.guardian_min_labels as i64,
        },
    ));

    // Shutdown fan-out for the periodic workers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    workers.push(spawn_miner(
        store.clone(),
        bus.clone(),
        Duration::from_secs(config.miner_interval_secs),
        chrono::Duration::hours(config.miner_window_hours),
        shutdown_rx.clone(),
    ));
    if config.guardian_enabled {
        workers.push(guardian.clone().spawn(shutdown_rx.clone()));
    } else {
        info!("guardian disabled via configuration");
    }

    let state = AppState {
        store,
        pipeline,
        cases,
        bus,
        registry,
        current,
        guardian,
        retrain_lock,
        guardian_enabled: config.guardian_enabled,
        miner_window: chrono::Duration::hours(config.miner_window_hours),
        cors_origins: config.cors_origins.clone(),
    };
    let app = api::router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    // Stop periodic workers within the shutdown window.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        for worker in workers {
            let _ = worker.await;
        }
    })
    .await
    .is_err()
    {
        warn!("workers did not stop within the shutdown window");
    }

    info!("fraudlens backend stopped");
    Ok(())
}

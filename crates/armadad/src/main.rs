//! armadad — the Armada director daemon.
//!
//! Single process hosting the HTTP API, the task workers and the
//! reconciliation engine, wired from a TOML configuration file:
//!
//! ```text
//! armadad --config /etc/armada/director.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use armada_api::{auth, ApiState};
use armada_bus::{AgentClient, Bus, MemoryBus};
use armada_core::LocalBlobstore;
use armada_deploy::{register_handlers, DeployContext};
use armada_lock::LockOptions;
use armada_state::StateStore;
use armada_tasks::{TaskManager, TaskWorker};

use config::DirectorConfig;

#[derive(Parser)]
#[command(name = "armadad", about = "Armada deployment director")]
struct Cli {
    /// Path to the director configuration file.
    #[arg(long, default_value = "/etc/armada/director.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,armadad=debug,armada=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = DirectorConfig::from_file(&cli.config)?;
    info!(name = %config.name, port = config.port, "armada director starting");

    for dir in [
        config.data_dir.clone(),
        config.blobstore_dir(),
        config.task_log_dir(),
        config.spool_dir(),
    ] {
        std::fs::create_dir_all(&dir)?;
    }

    // ── State store ────────────────────────────────────────────────
    let store = StateStore::open(&config.db_path())?;
    info!(path = ?config.db_path(), "state store opened");

    // ── Message bus + agent client ─────────────────────────────────
    // In-process bus: the dummy cloud runs its agents here; an external
    // broker implementing `Bus` slots in without touching the engine.
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
    let agents = AgentClient::new(Arc::clone(&bus));

    // ── Cloud provider ─────────────────────────────────────────────
    let cloud = armada_cloud::from_config(&config.cloud, Arc::clone(&bus));
    info!("cloud provider configured");

    // ── Context for task bodies ────────────────────────────────────
    let ctx = DeployContext {
        store: store.clone(),
        agents,
        cloud,
        blobstore: Arc::new(LocalBlobstore::new(config.blobstore_dir())),
        locks: LockOptions::default(),
    };

    // Bootstrap operator account.
    if store.get_user(&config.auth.user)?.is_none() {
        store.put_user(&auth::new_user_record(&config.auth.user, &config.auth.password))?;
        info!(user = %config.auth.user, "bootstrap user created");
    }

    // ── Task workers ───────────────────────────────────────────────
    let manager = TaskManager::new(store.clone(), config.task_log_dir());
    let registry = Arc::new(register_handlers(ctx));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = Vec::new();
    for _ in 0..config.tasks.workers.max(1) {
        worker_handles.push(TaskWorker::spawn(
            manager.clone(),
            Arc::clone(&registry),
            shutdown_rx.clone(),
        ));
    }
    info!(workers = worker_handles.len(), "task workers started");

    // ── API server ─────────────────────────────────────────────────
    let router = armada_api::build_router(ApiState {
        store,
        tasks: manager,
        spool_dir: config.spool_dir(),
        director_name: config.name.clone(),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("armada director stopped");
    Ok(())
}

//! Cinder Dispatcher
//!
//! A polling job dispatcher with database-backed state.
//!
//! Architecture:
//! - Configuration: settings from environment variables
//! - Store: job records persisted in SQLite
//! - Worker: one isolated child process per job
//! - Scheduler: the dispatch loop advancing every in-flight job
//!
//! The dispatcher polls the store for submitted jobs, launches each one as
//! a worker process, and records exit codes and timestamps back to the
//! store when workers terminate.

mod config;
mod db;
mod scheduler;
mod store;
mod tracker;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::scheduler::Dispatcher;
use crate::store::SqliteJobStore;
use crate::worker::ProcessWorkerFactory;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder_dispatcher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Cinder Dispatcher");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!(
        "Loaded configuration: dispatcher_id={}, database_url={}",
        config.dispatcher_id, config.database_url
    );

    // Create database connection pool and ensure the schema exists
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Job store ready");

    let store = Arc::new(SqliteJobStore::new(pool));
    let factory = Arc::new(ProcessWorkerFactory::new(config.worker_program.clone()));

    // Ctrl-c flips the shutdown flag; the loop exits at its next suspension
    // and leaves in-flight workers running.
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        flag.store(true, Ordering::SeqCst);
    });

    let mut dispatcher = Dispatcher::new(config, store, factory, shutdown);

    info!("Starting dispatch loop");
    dispatcher.run().await
}

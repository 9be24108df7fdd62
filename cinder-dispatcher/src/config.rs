//! Dispatcher configuration
//!
//! Defines all configurable parameters for the dispatcher including the
//! poll interval, the worker entrypoint, and store connection settings.

use std::time::Duration;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this dispatcher instance, stamped on claimed jobs
    pub dispatcher_id: String,

    /// Job store connection string (e.g., "sqlite://cinder.db?mode=rwc")
    pub database_url: String,

    /// Program launched for each admitted job, receiving `<id> <path>`
    pub worker_program: String,

    /// Upper bound on the wait at the top of each dispatch iteration
    pub check_interval: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(database_url: String, worker_program: String) -> Self {
        Self {
            dispatcher_id: uuid::Uuid::new_v4().to_string(),
            database_url,
            worker_program,
            check_interval: Duration::from_secs(5),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_PROGRAM (required)
    /// - DATABASE_URL (optional, default: sqlite://cinder.db?mode=rwc)
    /// - DISPATCHER_ID (optional, default: random UUID)
    /// - CHECK_INTERVAL (optional, seconds, default: 5)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_program = std::env::var("WORKER_PROGRAM")
            .map_err(|_| anyhow::anyhow!("WORKER_PROGRAM environment variable not set"))?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://cinder.db?mode=rwc".to_string());

        let dispatcher_id = std::env::var("DISPATCHER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let check_interval = std::env::var("CHECK_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        Ok(Self {
            dispatcher_id,
            database_url,
            worker_program,
            check_interval,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatcher_id.is_empty() {
            anyhow::bail!("dispatcher_id cannot be empty");
        }

        if self.database_url.is_empty() {
            anyhow::bail!("database_url cannot be empty");
        }

        if self.worker_program.is_empty() {
            anyhow::bail!("worker_program cannot be empty");
        }

        if self.check_interval.is_zero() {
            anyhow::bail!("check_interval must be greater than 0");
        }

        Ok(())
    }
}

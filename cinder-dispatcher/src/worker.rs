//! Worker processes
//!
//! Each admitted job runs as one isolated child OS process. The dispatcher
//! never interprets the work; completion is observed only through the
//! process exit status. Worker output goes to `job.out` inside the job
//! directory.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Synthetic exit code recorded when a worker could not be spawned.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// Synthetic exit code for workers that died without an exit status.
pub const SIGNALED_EXIT_CODE: i32 = 128;

/// Handle to a single live worker
pub trait WorkerHandle: Send {
    /// Polls the worker without blocking. Returns false once it has exited.
    fn is_alive(&mut self) -> bool;

    /// Worker exit code, available after `is_alive` has returned false.
    fn exit_code(&self) -> Option<i32>;

    /// Releases resources held by the handle. Does not kill the worker.
    fn close(&mut self);
}

/// Spawns a worker for an admitted job
pub trait WorkerFactory: Send + Sync {
    /// Launches the worker for job `id` with working directory `path`.
    fn spawn(&self, id: i64, path: &Path) -> Result<Box<dyn WorkerHandle>>;
}

/// Worker running as a child OS process
pub struct ProcessWorker {
    child: Option<Child>,
    exit_code: Option<i32>,
}

impl WorkerHandle for ProcessWorker {
    fn is_alive(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }

        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.code().unwrap_or(SIGNALED_EXIT_CODE));
                false
            }
            Ok(None) => true,
            Err(e) => {
                // An unreadable child is treated as dead so it can be reaped.
                warn!("Failed to poll worker: {}", e);
                self.exit_code = Some(SIGNALED_EXIT_CODE);
                false
            }
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn close(&mut self) {
        self.child = None;
    }
}

/// Factory launching the configured worker program
///
/// The program receives the job id and path as arguments and runs with the
/// job directory as its working directory.
pub struct ProcessWorkerFactory {
    program: String,
}

impl ProcessWorkerFactory {
    /// Creates a new factory for the given worker program
    pub fn new(program: String) -> Self {
        Self { program }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn spawn(&self, id: i64, path: &Path) -> Result<Box<dyn WorkerHandle>> {
        let output = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.join("job.out"))
            .with_context(|| format!("Failed to open job.out in {}", path.display()))?;
        let errors = output
            .try_clone()
            .context("Failed to clone job.out handle")?;

        let child = Command::new(&self.program)
            .arg(id.to_string())
            .arg(path)
            .current_dir(path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output))
            .stderr(Stdio::from(errors))
            .spawn()
            .with_context(|| format!("Failed to spawn worker for job {}", id))?;

        debug!("Spawned worker for job {} in {}", id, path.display());

        Ok(Box::new(ProcessWorker {
            child: Some(child),
            exit_code: None,
        }))
    }
}

//! Task tracker
//!
//! Registry of live workers keyed by job id. Owned by the dispatch loop,
//! so no locking. At most one worker exists per job id at any instant.

use std::collections::HashMap;

use anyhow::{Result, bail};

use crate::worker::{SIGNALED_EXIT_CODE, WorkerHandle};

#[derive(Default)]
pub struct TaskTracker {
    workers: HashMap<i64, Box<dyn WorkerHandle>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Registers a worker for a job.
    pub fn track(&mut self, id: i64, handle: Box<dyn WorkerHandle>) -> Result<()> {
        if self.workers.contains_key(&id) {
            bail!("Job {} already has a tracked worker", id);
        }
        self.workers.insert(id, handle);
        Ok(())
    }

    /// Non-blocking sweep: true when at least one tracked worker has exited.
    pub fn any_finished(&mut self) -> bool {
        self.workers.values_mut().any(|w| !w.is_alive())
    }

    /// Removes exited workers, closes their handles, and returns their
    /// (job id, exit code) pairs. Live workers are left untouched.
    pub fn reap(&mut self) -> Vec<(i64, i32)> {
        let mut finished = Vec::new();
        for (id, worker) in self.workers.iter_mut() {
            if !worker.is_alive() {
                finished.push(*id);
            }
        }

        let mut reaped = Vec::with_capacity(finished.len());
        for id in finished {
            if let Some(mut handle) = self.workers.remove(&id) {
                let exit_code = handle.exit_code().unwrap_or(SIGNALED_EXIT_CODE);
                handle.close();
                reaped.push((id, exit_code));
            }
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

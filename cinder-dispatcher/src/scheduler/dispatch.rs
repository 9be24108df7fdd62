//! Dispatch loop
//!
//! Single cooperative loop that advances all in-flight jobs. Each cycle
//! reaps exited workers before admitting new jobs, so a finished job frees
//! its slot within the same cycle. Per-job errors are logged and never
//! abort the loop.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use cinder_core::domain::job::Job;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::store::JobStore;
use crate::tracker::TaskTracker;
use crate::worker::{SPAWN_FAILED_EXIT_CODE, WorkerFactory};

/// How often tracked workers are polled during the bounded wait.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Job dispatcher that continuously polls for and launches jobs
pub struct Dispatcher {
    config: Config,
    store: Arc<dyn JobStore>,
    factory: Arc<dyn WorkerFactory>,
    tracker: TaskTracker,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Creates a new dispatcher
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        factory: Arc<dyn WorkerFactory>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            store,
            factory,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Runs the dispatch loop until the shutdown flag is set.
    ///
    /// Live workers are not terminated on shutdown; their job records stay
    /// Running and are picked up by whoever inspects the store next.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Starting dispatch loop (interval: {:?})",
            self.config.check_interval
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            self.wait_for_activity().await;

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.run_cycle().await {
                error!("Error during dispatch cycle: {:#}", e);
            }
        }

        info!(
            "Shutdown requested, exiting dispatch loop ({} worker(s) still running)",
            self.tracker.len()
        );
        Ok(())
    }

    /// Bounded wait at the top of each iteration.
    ///
    /// With nothing tracked this is a plain cooperative sleep. With live
    /// workers it returns as soon as any of them exits. Either wait is cut
    /// short by the shutdown flag.
    async fn wait_for_activity(&mut self) {
        let deadline = Instant::now() + self.config.check_interval;

        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            if !self.tracker.is_empty() && self.tracker.any_finished() {
                return;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            time::sleep(WORKER_POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// Performs one reap-then-admit cycle.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.reap_finished().await;
        self.admit_submitted().await?;
        Ok(())
    }

    /// Records terminal state for every tracked worker that has exited.
    ///
    /// Zero exit codes map to Finished, nonzero to Failed.
    async fn reap_finished(&mut self) {
        for (id, exit_code) in self.tracker.reap() {
            let now = Utc::now();
            let result = if exit_code == 0 {
                self.store.mark_finished(id, now, exit_code).await
            } else {
                self.store.mark_failed(id, now, exit_code).await
            };

            match result {
                Ok(()) => info!("Job {} exited with code {}", id, exit_code),
                Err(e) => error!("Failed to record exit of job {}: {:#}", id, e),
            }
        }
    }

    /// Admits every submitted job the store returns.
    async fn admit_submitted(&mut self) -> Result<()> {
        let jobs = self
            .store
            .fetch_submitted()
            .await
            .context("Failed to fetch submitted jobs")?;

        if jobs.is_empty() {
            debug!("No submitted jobs");
            return Ok(());
        }

        info!("Found {} submitted job(s)", jobs.len());

        for job in jobs {
            if let Err(e) = self.admit(&job).await {
                error!("Failed to admit job {}: {:#}", job.id, e);
            }
        }

        Ok(())
    }

    /// Claims one job, spawns its worker, and tracks it.
    async fn admit(&mut self, job: &Job) -> Result<()> {
        let claimed = self
            .store
            .mark_running(job.id, &self.config.dispatcher_id, Utc::now())
            .await?;

        if !claimed {
            // Another dispatcher won the row; not ours to run.
            debug!("Job {} was claimed elsewhere, skipping", job.id);
            return Ok(());
        }

        match self.factory.spawn(job.id, Path::new(&job.path)) {
            Ok(handle) => {
                self.tracker.track(job.id, handle)?;
                info!("Started job {} in {}", job.id, job.path);
            }
            Err(e) => {
                warn!("Failed to spawn worker for job {}: {:#}", job.id, e);
                self.store
                    .mark_failed(job.id, Utc::now(), SPAWN_FAILED_EXIT_CODE)
                    .await
                    .context("Failed to record spawn failure")?;
            }
        }

        Ok(())
    }

    /// Number of live workers currently tracked.
    pub fn tracked_jobs(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use cinder_core::domain::job::JobStatus;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use crate::worker::WorkerHandle;

    // ---- mock store ----

    struct MockStore {
        jobs: Mutex<HashMap<i64, Job>>,
        claim_denied: HashSet<i64>,
        fail_fetch: AtomicBool,
        fail_finish: Mutex<HashSet<i64>>,
    }

    impl MockStore {
        fn with_submitted(paths: &[&str]) -> Arc<Self> {
            let mut jobs = HashMap::new();
            for (i, path) in paths.iter().enumerate() {
                let id = i as i64 + 1;
                jobs.insert(
                    id,
                    Job {
                        id,
                        path: path.to_string(),
                        status: JobStatus::Submitted,
                        submitted_at: Utc::now(),
                        started_at: None,
                        finished_at: None,
                        exit_code: None,
                        dispatcher_id: None,
                    },
                );
            }
            Arc::new(Self {
                jobs: Mutex::new(jobs),
                claim_denied: HashSet::new(),
                fail_fetch: AtomicBool::new(false),
                fail_finish: Mutex::new(HashSet::new()),
            })
        }

        fn deny_claim(mut self: Arc<Self>, id: i64) -> Arc<Self> {
            Arc::get_mut(&mut self).unwrap().claim_denied.insert(id);
            self
        }

        fn job(&self, id: i64) -> Job {
            self.jobs.lock().unwrap().get(&id).unwrap().clone()
        }
    }

    #[async_trait]
    impl JobStore for MockStore {
        async fn fetch_submitted(&self) -> Result<Vec<Job>> {
            if self.fail_fetch.load(Ordering::SeqCst) {
                bail!("store unavailable");
            }
            let jobs = self.jobs.lock().unwrap();
            let mut submitted: Vec<Job> = jobs
                .values()
                .filter(|j| j.status == JobStatus::Submitted)
                .cloned()
                .collect();
            submitted.sort_by_key(|j| j.id);
            Ok(submitted)
        }

        async fn mark_running(
            &self,
            id: i64,
            dispatcher_id: &str,
            ts: DateTime<Utc>,
        ) -> Result<bool> {
            if self.claim_denied.contains(&id) {
                return Ok(false);
            }
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&id).unwrap();
            if job.status != JobStatus::Submitted {
                return Ok(false);
            }
            job.status = JobStatus::Running;
            job.started_at = Some(ts);
            job.dispatcher_id = Some(dispatcher_id.to_string());
            Ok(true)
        }

        async fn mark_finished(&self, id: i64, ts: DateTime<Utc>, exit_code: i32) -> Result<()> {
            if self.fail_finish.lock().unwrap().contains(&id) {
                bail!("store unavailable");
            }
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Finished;
            job.finished_at = Some(ts);
            job.exit_code = Some(exit_code);
            Ok(())
        }

        async fn mark_failed(&self, id: i64, ts: DateTime<Utc>, exit_code: i32) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Failed;
            job.finished_at = Some(ts);
            job.exit_code = Some(exit_code);
            Ok(())
        }

        async fn find_by_id(&self, id: i64) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }
    }

    // ---- mock workers ----

    #[derive(Clone, Default)]
    struct WorkerProbe(Arc<Mutex<Option<i32>>>);

    impl WorkerProbe {
        fn exit_with(&self, code: i32) {
            *self.0.lock().unwrap() = Some(code);
        }
    }

    struct FakeWorker(WorkerProbe);

    impl WorkerHandle for FakeWorker {
        fn is_alive(&mut self) -> bool {
            self.0.0.lock().unwrap().is_none()
        }

        fn exit_code(&self) -> Option<i32> {
            *self.0.0.lock().unwrap()
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct MockFactory {
        probes: Mutex<HashMap<i64, WorkerProbe>>,
        spawned_paths: Mutex<Vec<String>>,
        fail_ids: HashSet<i64>,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing_for(id: i64) -> Arc<Self> {
            let mut factory = Self::default();
            factory.fail_ids.insert(id);
            Arc::new(factory)
        }

        fn probe(&self, id: i64) -> WorkerProbe {
            self.probes.lock().unwrap().get(&id).unwrap().clone()
        }
    }

    impl WorkerFactory for MockFactory {
        fn spawn(&self, id: i64, path: &Path) -> Result<Box<dyn WorkerHandle>> {
            if self.fail_ids.contains(&id) {
                bail!("spawn refused for job {}", id);
            }
            let probe = WorkerProbe::default();
            self.probes.lock().unwrap().insert(id, probe.clone());
            self.spawned_paths
                .lock()
                .unwrap()
                .push(path.display().to_string());
            Ok(Box::new(FakeWorker(probe)))
        }
    }

    fn dispatcher(
        store: Arc<MockStore>,
        factory: Arc<MockFactory>,
        shutdown: Arc<AtomicBool>,
    ) -> Dispatcher {
        let mut config = Config::new("sqlite::memory:".to_string(), "worker".to_string());
        config.check_interval = Duration::from_millis(50);
        Dispatcher::new(config, store, factory, shutdown)
    }

    #[tokio::test]
    async fn job_runs_to_finished_on_zero_exit() {
        let store = MockStore::with_submitted(&["/tmp/a"]);
        let factory = MockFactory::new();
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::new(AtomicBool::new(false)),
        );

        dispatcher.run_cycle().await.unwrap();

        let job = store.job(1);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
        assert_eq!(dispatcher.tracked_jobs(), 1);
        assert_eq!(
            factory.spawned_paths.lock().unwrap().as_slice(),
            &["/tmp/a".to_string()]
        );

        factory.probe(1).exit_with(0);
        dispatcher.run_cycle().await.unwrap();

        let job = store.job(1);
        assert_eq!(job.status, JobStatus::Finished);
        assert!(job.status.is_terminal());
        assert_eq!(job.exit_code, Some(0));
        assert!(job.finished_at.unwrap() >= job.started_at.unwrap());
        assert_eq!(dispatcher.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_failed() {
        let store = MockStore::with_submitted(&["/tmp/a"]);
        let factory = MockFactory::new();
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::new(AtomicBool::new(false)),
        );

        dispatcher.run_cycle().await.unwrap();
        factory.probe(1).exit_with(3);
        dispatcher.run_cycle().await.unwrap();

        let job = store.job(1);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(3));
    }

    #[tokio::test]
    async fn two_jobs_admitted_in_one_cycle() {
        let store = MockStore::with_submitted(&["/tmp/a", "/tmp/b"]);
        let factory = MockFactory::new();
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::new(AtomicBool::new(false)),
        );

        dispatcher.run_cycle().await.unwrap();

        assert_eq!(store.job(1).status, JobStatus::Running);
        assert_eq!(store.job(2).status, JobStatus::Running);
        assert_eq!(dispatcher.tracked_jobs(), 2);
    }

    #[tokio::test]
    async fn lost_claim_is_skipped_silently() {
        let store = MockStore::with_submitted(&["/tmp/a"]).deny_claim(1);
        let factory = MockFactory::new();
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::new(AtomicBool::new(false)),
        );

        dispatcher.run_cycle().await.unwrap();

        assert_eq!(store.job(1).status, JobStatus::Submitted);
        assert_eq!(dispatcher.tracked_jobs(), 0);
        assert!(factory.spawned_paths.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_marks_job_failed() {
        let store = MockStore::with_submitted(&["/tmp/a"]);
        let factory = MockFactory::failing_for(1);
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::new(AtomicBool::new(false)),
        );

        dispatcher.run_cycle().await.unwrap();

        let job = store.job(1);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(SPAWN_FAILED_EXIT_CODE));
        assert_eq!(dispatcher.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn store_error_is_contained_and_next_cycle_admits() {
        let store = MockStore::with_submitted(&["/tmp/a"]);
        let factory = MockFactory::new();
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::new(AtomicBool::new(false)),
        );

        store.fail_fetch.store(true, Ordering::SeqCst);
        assert!(dispatcher.run_cycle().await.is_err());
        assert_eq!(store.job(1).status, JobStatus::Submitted);

        // The store comes back; the next cycle admits as usual
        store.fail_fetch.store(false, Ordering::SeqCst);
        dispatcher.run_cycle().await.unwrap();
        assert_eq!(store.job(1).status, JobStatus::Running);
        assert_eq!(dispatcher.tracked_jobs(), 1);
    }

    #[tokio::test]
    async fn run_survives_persistent_store_errors() {
        let store = MockStore::with_submitted(&["/tmp/a"]);
        let factory = MockFactory::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::clone(&shutdown),
        );

        store.fail_fetch.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move { dispatcher.run().await });

        // Several failing cycles pass without the loop exiting
        time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        shutdown.store(true, Ordering::SeqCst);
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not exit after shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn finish_error_does_not_block_other_reaps() {
        let store = MockStore::with_submitted(&["/tmp/a", "/tmp/b"]);
        let factory = MockFactory::new();
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::new(AtomicBool::new(false)),
        );

        dispatcher.run_cycle().await.unwrap();
        assert_eq!(dispatcher.tracked_jobs(), 2);

        store.fail_finish.lock().unwrap().insert(1);
        factory.probe(1).exit_with(0);
        factory.probe(2).exit_with(0);

        dispatcher.run_cycle().await.unwrap();

        // Job 1's terminal update was lost but job 2's still landed,
        // and both workers were reaped.
        assert_eq!(store.job(1).status, JobStatus::Running);
        assert_eq!(store.job(2).status, JobStatus::Finished);
        assert_eq!(dispatcher.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn shutdown_leaves_live_worker_running() {
        let store = MockStore::with_submitted(&["/tmp/a"]);
        let factory = MockFactory::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut dispatcher = dispatcher(
            Arc::clone(&store),
            Arc::clone(&factory),
            Arc::clone(&shutdown),
        );

        dispatcher.run_cycle().await.unwrap();
        assert_eq!(store.job(1).status, JobStatus::Running);

        let handle = tokio::spawn(async move { dispatcher.run().await });

        time::sleep(Duration::from_millis(20)).await;
        shutdown.store(true, Ordering::SeqCst);

        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not exit after shutdown")
            .unwrap()
            .unwrap();

        // The worker was never reaped; its record stays Running.
        assert_eq!(store.job(1).status, JobStatus::Running);
    }
}

//! Engine runtime
//!
//! Wires the job store, task queue, coordinator, worker pool, re-scan loop and
//! reaper, all stopped by one `CancellationToken`.
//!
//! ```rust,ignore
//! let config = EngineConfig::load(Some(Path::new("stemflow.yaml")))?;
//! let store = Engine::open_store(&config)?;
//! let stages = command_stage_set(&config.stages)?;
//!
//! let mut engine = Engine::new(config, store, stages);
//! engine.start().await?;
//! let job_id = engine.coordinator().submit("/media/song.mp3", json!({})).await?;
//! // ...
//! engine.shutdown().await;
//! ```

use std::sync::Arc;

use stemflow_storage::{InMemoryJobStore, JobStore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::coordinator::{PipelineCoordinator, RescanReport};
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::pipeline::StageSet;
use crate::queue::{InMemoryTaskQueue, TaskQueue};
use crate::reaper::Reaper;
use crate::worker::WorkerPool;

pub struct Engine {
    coordinator: Arc<PipelineCoordinator>,
    queue: InMemoryTaskQueue,
    stages: StageSet,
    shutdown: CancellationToken,
    workers: Option<WorkerPool>,
    background: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>, stages: StageSet) -> Self {
        Self::with_metrics(config, store, stages, EngineMetrics::disabled())
    }

    pub fn with_metrics(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        stages: StageSet,
        metrics: EngineMetrics,
    ) -> Self {
        let queue = InMemoryTaskQueue::new();
        let coordinator =
            PipelineCoordinator::new(Arc::new(config), store, Arc::new(queue.clone())).with_metrics(metrics);
        Self {
            coordinator: Arc::new(coordinator),
            queue,
            stages,
            shutdown: CancellationToken::new(),
            workers: None,
            background: Vec::new(),
        }
    }

    /// SQLite store when `storage.database` is set, in-memory otherwise
    pub fn open_store(config: &EngineConfig) -> Result<Arc<dyn JobStore>> {
        match &config.storage.database {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let store = stemflow_storage::SqliteJobStore::open(path)?;
                info!(path = %path.display(), "using SQLite job store");
                Ok(Arc::new(store))
            }
            None => {
                warn!("no storage.database configured, jobs will not survive a restart");
                Ok(Arc::new(InMemoryJobStore::new()))
            }
        }
    }

    pub fn coordinator(&self) -> &Arc<PipelineCoordinator> {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    /// Recover from the store, then start workers, re-scan loop and reaper
    ///
    /// Returns the recovery pass report. Calling `start` twice is a no-op.
    pub async fn start(&mut self) -> Result<RescanReport> {
        if self.is_running() {
            return Ok(RescanReport::default());
        }
        let config = self.coordinator.config().clone();
        tokio::fs::create_dir_all(&config.storage.root).await?;

        let recovery = self.coordinator.rescan().await?;
        info!(
            adopted = recovery.adopted,
            dispatched = recovery.dispatched,
            admitted = recovery.admitted,
            "recovered job state"
        );

        let workers = WorkerPool::spawn(
            self.coordinator.clone(),
            self.stages.clone(),
            config.worker_count(),
            self.shutdown.clone(),
        );
        info!(
            workers = workers.len(),
            max_concurrent_jobs = config.engine.max_concurrent_jobs,
            dispatch = ?config.engine.dispatch,
            "engine started"
        );
        self.workers = Some(workers);

        self.background
            .push(spawn_rescan_loop(self.coordinator.clone(), self.shutdown.clone()));
        self.background
            .push(Reaper::new(self.coordinator.clone()).spawn(self.shutdown.clone()));
        Ok(recovery)
    }

    /// Stop everything and wait for it
    ///
    /// Running adapters see their cancellation check fire; their claims are
    /// released so the next start resumes the same attempt.
    pub async fn shutdown(mut self) {
        info!("engine shutting down");
        self.shutdown.cancel();
        if let Some(workers) = self.workers.take() {
            workers.join().await;
        }
        self.queue.close();
        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task failed");
            }
        }
        info!("engine stopped");
    }
}

fn spawn_rescan_loop(coordinator: Arc<PipelineCoordinator>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(coordinator.config().rescan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already ran a pass
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = coordinator.rescan().await {
                warn!(error = %e, "re-scan failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedStages;
    use stemflow_storage::JobStatus;

    #[tokio::test]
    async fn test_open_store_variants() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_tests(1);
        let memory = Engine::open_store(&config).unwrap();
        assert_eq!(memory.stats().await.unwrap().total, 0);

        config.storage.database = Some(dir.path().join("nested").join("jobs.db"));
        Engine::open_store(&config).unwrap();
        assert!(dir.path().join("nested").join("jobs.db").exists());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_tests(2);
        config.storage.root = dir.path().join("jobs");
        let input = dir.path().join("song.ogg");
        std::fs::write(&input, b"OggS").unwrap();

        let stages = ScriptedStages::succeeding();
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let mut engine = Engine::new(config, store, stages.stage_set());
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.start().await.unwrap(), RescanReport::default());

        let id = engine
            .coordinator()
            .submit(input.to_str().unwrap(), serde_json::json!({}))
            .await
            .unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                let status = engine.coordinator().status(&id).await.unwrap();
                if status.status.is_terminal() {
                    return status;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(status.status, JobStatus::Completed);

        engine.shutdown().await;
    }
}

//! Worker pool
//!
//! Each worker runs one stage at a time: dequeue → claim → run the adapter
//! with a cancellation watcher and a progress reporter → commit the staging
//! directory → report the outcome to the coordinator → acknowledge.
//!
//! A delivery is acknowledged only after the outcome is recorded, so a worker
//! torn down in between leaves the message to be redelivered. The claim taken
//! by the coordinator makes that redelivery a no-op if the attempt already ran.
//! An interrupted attempt is the exception: it is acknowledged before the claim
//! is released, since the release re-dispatches the same message. A worker lost
//! in that window leaves a claim for the reaper's stall check.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use stemflow_storage::{JobId, JobRecord, JobStore, StageId};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coordinator::{holds_claim, ClaimOutcome, PipelineCoordinator};
use crate::error::OrchestratorError;
use crate::pipeline::{CancellationCheck, StageContext, StageFailure, StageInput, StageResult, StageSet};
use crate::progress::{ProgressReporter, ProgressTarget};
use crate::queue::{Delivery, TaskMessage};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers; they stop once `shutdown` fires or the queue closes
    pub fn spawn(
        coordinator: Arc<PipelineCoordinator>,
        stages: StageSet,
        count: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let instance = Uuid::new_v4().simple().to_string();
        let handles = (0..count)
            .map(|index| {
                let worker = Worker {
                    id: format!("worker-{}-{}", &instance[..8], index),
                    coordinator: coordinator.clone(),
                    stages: stages.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}

struct Worker {
    id: String,
    coordinator: Arc<PipelineCoordinator>,
    stages: StageSet,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = %self.id, "worker started");
        let queue = self.coordinator.queue().clone();

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = queue.dequeue() => match next {
                    Ok(delivery) => delivery,
                    Err(OrchestratorError::QueueClosed) => break,
                    Err(e) => {
                        warn!(worker = %self.id, error = %e, "dequeue failed");
                        tokio::time::sleep(self.coordinator.config().rescan_interval()).await;
                        continue;
                    }
                },
            };
            self.handle(delivery).await;
        }

        debug!(worker = %self.id, "worker stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let message = *delivery.message();

        match self.coordinator.claim(&message, &self.id).await {
            Ok(ClaimOutcome::Acquired(record)) => self.execute(delivery, record).await,
            Ok(ClaimOutcome::Skip(reason)) => {
                debug!(job_id = %message.job_id, stage_index = message.stage_index, attempt = message.attempt, reason, "delivery skipped");
                delivery.ack();
            }
            Ok(ClaimOutcome::NotDue(delay)) => {
                delivery.requeue_after(delay);
            }
            Err(e) if e.is_store_failure() => {
                warn!(job_id = %message.job_id, error = %e, "claim failed, redelivering later");
                delivery.requeue_after(self.coordinator.config().rescan_interval());
            }
            Err(e) => {
                // Redelivery would hit the same error; the next rescan re-derives dispatch from the record
                error!(job_id = %message.job_id, stage_index = message.stage_index, attempt = message.attempt, error = %e, "claim rejected, delivery dropped");
                delivery.ack();
            }
        }
    }

    async fn execute(&self, delivery: Delivery, record: JobRecord) {
        let coordinator = &self.coordinator;
        let message = *delivery.message();
        let job_id = record.job_id;
        let Some(stage) = record.current_stage else {
            delivery.ack();
            return;
        };
        let attempt = message.attempt;

        info!(job_id = %job_id, stage = %stage, attempt, worker = %self.id, "stage started");

        let result = match coordinator
            .workspace()
            .prepare_staging(&job_id, stage, attempt)
            .await
        {
            Ok(output_dir) => {
                let input = StageInput {
                    job_id,
                    stage,
                    attempt,
                    input_ref: record.input_ref.clone(),
                    upstream: record.artifacts.clone(),
                    options: record.options.clone(),
                    output_dir,
                };
                self.run_adapter(input).await
            }
            Err(e) => Err(StageFailure::transient(format!("cannot prepare staging directory: {}", e))),
        };

        let failure = match result {
            Ok(success) => match coordinator.workspace().commit(&job_id, stage, attempt).await {
                Ok(artifact) => {
                    let outcome = coordinator
                        .on_stage_success(&message, artifact, success.timing)
                        .await;
                    delivery.ack();
                    log_outcome_error(outcome.err(), &message, stage);
                    return;
                }
                Err(e) => StageFailure::transient(format!("cannot commit stage output: {}", e)),
            },
            Err(failure) => failure,
        };

        if failure.is_cancelled() {
            // Releasing the claim re-dispatches this very message; settle it first
            // so the queue does not drop the re-dispatch as a duplicate
            delivery.ack();
            let outcome = coordinator.on_stage_failure(&message, &failure).await;
            log_outcome_error(outcome.err(), &message, stage);
        } else {
            let outcome = coordinator.on_stage_failure(&message, &failure).await;
            delivery.ack();
            log_outcome_error(outcome.err(), &message, stage);
        }
    }

    /// Run the adapter under a cancellation watcher and progress reporter
    async fn run_adapter(&self, input: StageInput) -> StageResult {
        let coordinator = &self.coordinator;
        let config = coordinator.config();
        let (job_id, stage, attempt) = (input.job_id, input.stage, input.attempt);

        let cancel = self.shutdown.child_token();
        let watcher_done = CancellationToken::new();
        let watcher = tokio::spawn(watch_cancellation(
            coordinator.store().clone(),
            job_id,
            stage,
            attempt,
            config.cancel_poll_interval(),
            cancel.clone(),
            watcher_done.clone(),
        ));

        let (progress, reporter) = ProgressReporter::spawn(
            coordinator.store().clone(),
            ProgressTarget { job_id, stage, attempt },
            coordinator.weights(),
            config.progress.clone(),
            config.engine.store_retry_attempts,
        );
        let ctx = StageContext::new(CancellationCheck::new(cancel), progress);

        let adapter = self.stages.adapter(stage).clone();
        let result = AssertUnwindSafe(adapter.execute(input, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(StageFailure::transient(format!(
                    "stage adapter panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        watcher_done.cancel();
        if let Err(e) = watcher.await {
            warn!(job_id = %job_id, error = %e, "cancellation watcher failed");
        }
        reporter.finish().await;
        result
    }
}

/// Poll the job record and fire `cancel` once the attempt should stop:
/// cancellation was requested, the job went terminal, or the claim moved on
async fn watch_cancellation(
    store: Arc<dyn JobStore>,
    job_id: JobId,
    stage: StageId,
    attempt: u32,
    interval: Duration,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => return,
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let reason = match store.read(&job_id).await {
            Ok(record) if record.cancelled => "cancellation requested",
            Ok(record) if !holds_claim(&record, stage, attempt) => "attempt no longer owns the job",
            Ok(_) => continue,
            Err(e) if e.is_not_found() => "job record gone",
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cancellation poll failed");
                continue;
            }
        };
        info!(job_id = %job_id, stage = %stage, attempt, reason, "stopping stage");
        cancel.cancel();
        return;
    }
}

fn log_outcome_error(error: Option<OrchestratorError>, message: &TaskMessage, stage: StageId) {
    if let Some(e) = error {
        // The claim stays in place; the reaper's stall check settles the job
        error!(job_id = %message.job_id, stage = %stage, attempt = message.attempt, error = %e, "failed to record stage outcome");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::queue::{InMemoryTaskQueue, TaskQueue};
    use crate::testing::{Behavior, ScriptedStage, ScriptedStages};
    use stemflow_storage::{ErrorKind, FailureKind, InMemoryJobStore, JobStats, JobStatus, StatusFilter, StorageError};

    struct Harness {
        coordinator: Arc<PipelineCoordinator>,
        queue: InMemoryTaskQueue,
        input: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_tests(2);
        config.storage.root = dir.path().join("jobs");
        let input = dir.path().join("song.mp3");
        std::fs::write(&input, b"ID3").unwrap();

        let queue = InMemoryTaskQueue::new();
        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::new(config),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(queue.clone()),
        ));
        Harness {
            coordinator,
            queue,
            input,
            _dir: dir,
        }
    }

    async fn wait_terminal(coordinator: &PipelineCoordinator, job_id: &JobId) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let record = coordinator.store().read(job_id).await.unwrap();
                if record.is_terminal() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_worker_runs_job_to_completion() {
        let h = harness();
        let stages = ScriptedStages::succeeding();
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(h.coordinator.clone(), stages.stage_set(), 2, shutdown.clone());

        let id = h.coordinator.submit(h.input.to_str().unwrap(), serde_json::json!({})).await.unwrap();
        let record = wait_terminal(&h.coordinator, &id).await;

        assert_eq!(record.status, JobStatus::Completed);
        for stage in StageId::ALL {
            let dir = h.coordinator.workspace().stage_dir(&id, stage);
            assert!(dir.join(format!("{}.out", stage)).exists());
            assert_eq!(stages.get(stage).invocations(), 1);
        }
        assert!(!h.coordinator.workspace().job_dir(&id).join("tmp").exists());

        shutdown.cancel();
        h.queue.close();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_panicking_adapter_is_transient() {
        let h = harness();
        let stages = ScriptedStages::new(
            ScriptedStage::new(StageId::Separation, Behavior::quick()).then(Behavior::Panic),
            ScriptedStage::new(StageId::Transcription, Behavior::quick()),
            ScriptedStage::new(StageId::BeatAnalysis, Behavior::quick()),
        );
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(h.coordinator.clone(), stages.stage_set(), 1, shutdown.clone());

        let id = h.coordinator.submit(h.input.to_str().unwrap(), serde_json::json!({})).await.unwrap();
        let record = wait_terminal(&h.coordinator, &id).await;

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempt(StageId::Separation), 1);
        assert_eq!(stages.separation.invocations(), 2);

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_fatal_failure_stops_pipeline() {
        let h = harness();
        let stages = ScriptedStages::new(
            ScriptedStage::new(StageId::Separation, Behavior::FailFatal("unsupported codec".into())),
            ScriptedStage::new(StageId::Transcription, Behavior::quick()),
            ScriptedStage::new(StageId::BeatAnalysis, Behavior::quick()),
        );
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(h.coordinator.clone(), stages.stage_set(), 1, shutdown.clone());

        let id = h.coordinator.submit(h.input.to_str().unwrap(), serde_json::json!({})).await.unwrap();
        let record = wait_terminal(&h.coordinator, &id).await;

        assert_eq!(record.status, JobStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, FailureKind::Fatal);
        assert_eq!(error.stage, Some(StageId::Separation));
        assert!(record.artifacts.is_empty());
        assert_eq!(stages.transcription.invocations(), 0);

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_claim() {
        let h = harness();
        let stages = ScriptedStages::new(
            ScriptedStage::new(StageId::Separation, Behavior::HangHonoringCancel),
            ScriptedStage::new(StageId::Transcription, Behavior::quick()),
            ScriptedStage::new(StageId::BeatAnalysis, Behavior::quick()),
        );
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(h.coordinator.clone(), stages.stage_set(), 1, shutdown.clone());

        let id = h.coordinator.submit(h.input.to_str().unwrap(), serde_json::json!({})).await.unwrap();
        while stages.separation.invocations() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.queue.close();
        shutdown.cancel();
        pool.join().await;

        let record = h.coordinator.store().read(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.claim.is_none());
        assert_eq!(record.attempt(StageId::Separation), 0);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_released_attempt_is_picked_up_by_another_pool() {
        let h = harness();
        let stages = ScriptedStages::new(
            ScriptedStage::new(StageId::Separation, Behavior::quick()).then(Behavior::HangHonoringCancel),
            ScriptedStage::new(StageId::Transcription, Behavior::quick()),
            ScriptedStage::new(StageId::BeatAnalysis, Behavior::quick()),
        );
        let draining = CancellationToken::new();
        let first = WorkerPool::spawn(h.coordinator.clone(), stages.stage_set(), 1, draining.clone());

        let id = h.coordinator.submit(h.input.to_str().unwrap(), serde_json::json!({})).await.unwrap();
        while stages.separation.invocations() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // No rescan loop runs here, so only the release's own re-dispatch can revive the job
        let shutdown = CancellationToken::new();
        let second = WorkerPool::spawn(h.coordinator.clone(), stages.stage_set(), 1, shutdown.clone());
        draining.cancel();
        first.join().await;

        let record = wait_terminal(&h.coordinator, &id).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempt(StageId::Separation), 0);
        assert_eq!(stages.separation.invocations(), 2);

        shutdown.cancel();
        h.queue.close();
        second.join().await;
    }

    /// Store whose CAS fails with an injected error once armed
    struct FaultyStore {
        inner: InMemoryJobStore,
        fault: parking_lot::Mutex<Option<ErrorKind>>,
    }

    #[async_trait::async_trait]
    impl JobStore for FaultyStore {
        async fn insert(&self, record: JobRecord) -> stemflow_storage::Result<()> {
            self.inner.insert(record).await
        }
        async fn read(&self, job_id: &JobId) -> stemflow_storage::Result<JobRecord> {
            self.inner.read(job_id).await
        }
        async fn compare_and_swap(
            &self,
            job_id: &JobId,
            expected_version: u64,
            next: JobRecord,
        ) -> stemflow_storage::Result<JobRecord> {
            let fault = *self.fault.lock();
            if let Some(kind) = fault {
                return Err(StorageError::new(kind, "injected fault"));
            }
            self.inner.compare_and_swap(job_id, expected_version, next).await
        }
        async fn list(&self, filter: StatusFilter) -> stemflow_storage::Result<Vec<JobId>> {
            self.inner.list(filter).await
        }
        async fn scan(&self, filter: StatusFilter) -> stemflow_storage::Result<Vec<JobRecord>> {
            self.inner.scan(filter).await
        }
        async fn delete(&self, job_id: &JobId) -> stemflow_storage::Result<bool> {
            self.inner.delete(job_id).await
        }
        async fn stats(&self) -> stemflow_storage::Result<JobStats> {
            self.inner.stats().await
        }
    }

    /// Submit one job, arm `fault`, and let a worker handle the dispatched delivery
    async fn handle_with_claim_fault(fault: ErrorKind) -> InMemoryTaskQueue {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_tests(1);
        config.storage.root = dir.path().join("jobs");
        let input = dir.path().join("song.mp3");
        std::fs::write(&input, b"ID3").unwrap();

        let store = Arc::new(FaultyStore {
            inner: InMemoryJobStore::new(),
            fault: parking_lot::Mutex::new(None),
        });
        let queue = InMemoryTaskQueue::new();
        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::new(config),
            store.clone(),
            Arc::new(queue.clone()),
        ));
        coordinator.submit(input.to_str().unwrap(), serde_json::json!({})).await.unwrap();

        *store.fault.lock() = Some(fault);
        let worker = Worker {
            id: "worker-test-0".to_string(),
            coordinator,
            stages: ScriptedStages::succeeding().stage_set(),
            shutdown: CancellationToken::new(),
        };
        let delivery = queue.dequeue().await.unwrap();
        worker.handle(delivery).await;
        queue
    }

    #[tokio::test]
    async fn test_store_failure_during_claim_is_redelivered() {
        let queue = handle_with_claim_fault(ErrorKind::Unavailable).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_claim_is_dropped() {
        let queue = handle_with_claim_fault(ErrorKind::Serialization).await;
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}

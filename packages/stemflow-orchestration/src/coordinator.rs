//! Pipeline coordinator
//!
//! Drives jobs through the state machine. Every decision re-reads the job
//! record and writes through `update_job` (compare-and-swap), so the same
//! logic can run concurrently from the submission path, any worker, the
//! re-scan loop and the reaper.
//!
//! Dispatch is event-driven by default: whoever performs a transition into
//! RUNNING(i) enqueues `{job_id, i, attempt}` right away. The periodic
//! `rescan` re-derives the same messages from the store, so a lost enqueue
//! (crash, closed queue) only delays a job. With `DispatchMode::Rescan` the
//! re-scan is the only dispatcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use stemflow_storage::{
    ArtifactRef, FailureKind, JobId, JobRecord, JobResultsView, JobStats, JobStatus,
    JobStatusView, JobStore, StageId, StageTiming, StatusFilter,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionControl;
use crate::config::{DispatchMode, EngineConfig};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::job::{check_delivery, DeliveryCheck, JobStateMachine, StageWeights};
use crate::metrics::EngineMetrics;
use crate::pipeline::StageFailure;
use crate::queue::{TaskMessage, TaskQueue};
use crate::retry::{update_job, BackoffPolicy};
use crate::validation::validate_input;
use crate::workspace::{ArtifactWorkspace, InputManifest};

/// Result of trying to claim a delivered task
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The attempt is ours; run the adapter
    Acquired(JobRecord),
    /// Duplicate, stale or already-finalized delivery; acknowledge it
    Skip(&'static str),
    /// Backoff has not elapsed; redeliver after the delay
    NotDue(Duration),
}

/// What one re-scan pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanReport {
    /// Permits returned for jobs no longer RUNNING
    pub released: usize,
    /// Permits taken for RUNNING jobs this process did not admit
    pub adopted: usize,
    /// Unclaimed jobs with the cancellation flag, finalized
    pub cancelled: usize,
    /// Unclaimed RUNNING stages enqueued
    pub dispatched: usize,
    pub admitted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FailureDecision {
    Stale,
    Cancelled,
    Released,
    Retry { attempt: u32, delay: Duration },
    Failed,
}

pub struct PipelineCoordinator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    admission: Arc<AdmissionControl>,
    workspace: ArtifactWorkspace,
    config: Arc<EngineConfig>,
    weights: StageWeights,
    backoff: BackoffPolicy,
    metrics: EngineMetrics,
    /// Serializes admission passes and permit reconciliation
    admit_lock: Mutex<()>,
    /// False for short-lived client processes that must not take permits
    admits: bool,
}

impl PipelineCoordinator {
    pub fn new(config: Arc<EngineConfig>, store: Arc<dyn JobStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            admission: Arc::new(AdmissionControl::new(config.engine.max_concurrent_jobs)),
            workspace: ArtifactWorkspace::new(config.storage.root.clone()),
            weights: StageWeights::from_config(&config.stages),
            backoff: BackoffPolicy::new(&config.backoff),
            metrics: EngineMetrics::disabled(),
            admit_lock: Mutex::new(()),
            admits: true,
            store,
            queue,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Leave admission to the engine process sharing the store
    ///
    /// Used by CLI commands that write to the store without running workers.
    pub fn without_admission(mut self) -> Self {
        self.admits = false;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    pub fn admission(&self) -> &Arc<AdmissionControl> {
        &self.admission
    }

    pub fn workspace(&self) -> &ArtifactWorkspace {
        &self.workspace
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn weights(&self) -> StageWeights {
        self.weights
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    fn attempts(&self) -> u32 {
        self.config.engine.store_retry_attempts
    }

    // ───────────────────────────────────────────────────────────────────────
    // Submission & admission
    // ───────────────────────────────────────────────────────────────────────

    /// Validate the input and write a QUEUED record; does not admit
    ///
    /// # Errors
    ///
    /// `Validation` for a bad input reference (no record is created)
    pub async fn create_job(&self, input_ref: &str, options: serde_json::Value) -> Result<JobId> {
        if !(options.is_null() || options.is_object()) {
            return Err(OrchestratorError::validation("options must be a JSON object"));
        }
        let path = validate_input(input_ref, &self.config.input).await?;

        let record = JobRecord::new(
            path.to_string_lossy().into_owned(),
            options,
            self.config.reaper.job_ttl(),
        )?;
        let job_id = record.job_id;
        let manifest = InputManifest {
            job_id,
            input_ref: record.input_ref.clone(),
            options: record.options.clone(),
            submitted_at: record.created_at,
        };

        self.workspace.prepare(&manifest).await?;
        if let Err(e) = self.store.insert(record).await {
            if let Err(cleanup) = self.workspace.remove_all(&job_id).await {
                warn!(job_id = %job_id, error = %cleanup, "failed to remove workspace of rejected job");
            }
            return Err(e.into());
        }

        self.metrics.job_submitted();
        info!(job_id = %job_id, input = %manifest.input_ref, "job created");
        Ok(job_id)
    }

    /// Create a job and admit whatever fits under the concurrency bound
    pub async fn submit(&self, input_ref: &str, options: serde_json::Value) -> Result<JobId> {
        let job_id = self.create_job(input_ref, options).await?;
        if let Err(e) = self.admit_pending().await {
            // The job is durably QUEUED; the next re-scan admits it
            warn!(job_id = %job_id, error = %e, "admission deferred");
        }
        Ok(job_id)
    }

    /// Admit QUEUED jobs, oldest first, while permits last
    ///
    /// Returns how many jobs moved to RUNNING(separation).
    pub async fn admit_pending(&self) -> Result<usize> {
        if !self.admits {
            return Ok(0);
        }
        let _guard = self.admit_lock.lock().await;

        let mut queued = self.store.scan(StatusFilter::Is(JobStatus::Queued)).await?;
        queued.sort_by_key(|r| (r.created_at, r.job_id));

        let now = Utc::now();
        let mut admitted = 0;
        for candidate in queued {
            let job_id = candidate.job_id;
            if candidate.cancelled {
                if let Err(e) = self.finalize_cancel(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "failed to finalize cancelled job");
                }
                continue;
            }
            if now > candidate.expires_at {
                // Left for the reaper to fail as Expired
                continue;
            }
            if !self.admission.try_acquire(job_id) {
                debug!(available = self.admission.available(), "admission bound reached");
                break;
            }

            let result = update_job(self.store.as_ref(), &job_id, self.attempts(), |record| {
                if record.status != JobStatus::Queued || record.cancelled {
                    return Ok(false);
                }
                JobStateMachine::new(record).admit(now)?;
                Ok(true)
            })
            .await;

            match result {
                Ok(Some(stored)) => {
                    admitted += 1;
                    self.metrics.job_admitted();
                    info!(job_id = %job_id, "job admitted");
                    if self.config.engine.dispatch == DispatchMode::Event {
                        if let Err(e) = self.dispatch(&stored).await {
                            warn!(job_id = %job_id, error = %e, "dispatch deferred to re-scan");
                        }
                    }
                }
                Ok(None) => {
                    self.admission.release(&job_id);
                }
                Err(OrchestratorError::JobNotFound(_)) => {
                    self.admission.release(&job_id);
                }
                Err(e) => {
                    self.admission.release(&job_id);
                    return Err(e);
                }
            }
        }
        Ok(admitted)
    }

    /// Enqueue the current attempt of a RUNNING job's stage
    ///
    /// Returns false when the job is not dispatchable or the message is
    /// already queued or in flight.
    pub async fn dispatch(&self, record: &JobRecord) -> Result<bool> {
        let stage = match (record.status, record.current_stage) {
            (JobStatus::Running, Some(stage)) if record.claim.is_none() => stage,
            _ => return Ok(false),
        };
        let message = TaskMessage {
            job_id: record.job_id,
            stage_index: stage.index(),
            attempt: record.attempt(stage),
        };
        let delay = record
            .next_attempt_at
            .and_then(|due| (due - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);

        let enqueued = self.queue.enqueue(message, delay).await?;
        if enqueued {
            debug!(
                job_id = %record.job_id,
                stage = %stage,
                attempt = message.attempt,
                delay_ms = delay.as_millis() as u64,
                "stage dispatched"
            );
        }
        Ok(enqueued)
    }

    async fn dispatch_event(&self, record: &JobRecord) {
        if self.config.engine.dispatch != DispatchMode::Event {
            return;
        }
        match self.dispatch(record).await {
            Ok(_) => {}
            Err(OrchestratorError::QueueClosed) => {
                debug!(job_id = %record.job_id, "queue closed, dispatch left to next start");
            }
            Err(e) => warn!(job_id = %record.job_id, error = %e, "dispatch deferred to re-scan"),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Worker callbacks
    // ───────────────────────────────────────────────────────────────────────

    /// Claim the attempt named by `message` for `worker`
    pub async fn claim(&self, message: &TaskMessage, worker: &str) -> Result<ClaimOutcome> {
        let stage = match StageId::from_index(message.stage_index) {
            Some(stage) => stage,
            None => return Ok(ClaimOutcome::Skip("unknown stage")),
        };
        let now = Utc::now();
        let mut check = DeliveryCheck::Execute;

        let result = update_job(self.store.as_ref(), &message.job_id, self.attempts(), |record| {
            check = check_delivery(record, message, now);
            if check != DeliveryCheck::Execute {
                return Ok(false);
            }
            JobStateMachine::new(record).claim(stage, message.attempt, worker, now)?;
            Ok(true)
        })
        .await;

        match result {
            Ok(Some(stored)) => {
                debug!(job_id = %message.job_id, stage = %stage, attempt = message.attempt, worker, "stage claimed");
                Ok(ClaimOutcome::Acquired(stored))
            }
            Ok(None) => match check {
                DeliveryCheck::Stale(reason) => Ok(ClaimOutcome::Skip(reason)),
                DeliveryCheck::NotDue(due) => Ok(ClaimOutcome::NotDue(
                    (due - now).to_std().unwrap_or(Duration::ZERO),
                )),
                DeliveryCheck::CancelBeforeStart => {
                    if self.finalize_cancel(&message.job_id).await?.is_some() {
                        self.after_terminal().await;
                    }
                    Ok(ClaimOutcome::Skip("cancelled before start"))
                }
                DeliveryCheck::Execute => Ok(ClaimOutcome::Skip("no change")),
            },
            Err(OrchestratorError::JobNotFound(_)) => Ok(ClaimOutcome::Skip("job not found")),
            Err(e) => Err(e),
        }
    }

    /// Record a successful attempt and advance the job
    ///
    /// If cancellation was requested while the adapter ran, the result is
    /// discarded and the job finalized CANCELLED.
    pub async fn on_stage_success(
        &self,
        message: &TaskMessage,
        artifact: ArtifactRef,
        timing: StageTiming,
    ) -> Result<Option<JobRecord>> {
        let stage = stage_of(message)?;
        let now = Utc::now();
        let retention = self.config.reaper.retention();
        let weights = self.weights;

        let stored = update_job(self.store.as_ref(), &message.job_id, self.attempts(), |record| {
            if !holds_claim(record, stage, message.attempt) {
                return Ok(false);
            }
            let mut sm = JobStateMachine::new(record);
            if sm.job().cancelled {
                sm.finalize_cancel(now, retention)?;
            } else {
                sm.complete_stage(stage, artifact.clone(), timing.clone(), &weights, now, retention)?;
            }
            Ok(true)
        })
        .await?;

        let stored = match stored {
            Some(stored) => stored,
            None => {
                warn!(job_id = %message.job_id, stage = %stage, attempt = message.attempt, "stale stage result discarded");
                return Ok(None);
            }
        };

        match stored.status {
            JobStatus::Running => {
                self.metrics.stage_finished(stage, timing.duration_ms);
                info!(
                    job_id = %stored.job_id,
                    stage = %stage,
                    duration_ms = timing.duration_ms,
                    overall_progress = stored.overall_progress,
                    "stage completed"
                );
                self.dispatch_event(&stored).await;
            }
            JobStatus::Completed => {
                self.metrics.stage_finished(stage, timing.duration_ms);
                info!(job_id = %stored.job_id, "job completed");
                self.job_finished(&stored).await;
                self.after_terminal().await;
            }
            _ => {
                info!(job_id = %stored.job_id, stage = %stage, "stage result discarded, job cancelled");
                self.job_finished(&stored).await;
                self.after_terminal().await;
            }
        }
        Ok(Some(stored))
    }

    /// Translate a classified adapter failure into a transition
    pub async fn on_stage_failure(&self, message: &TaskMessage, failure: &StageFailure) -> Result<Option<JobRecord>> {
        let stage = stage_of(message)?;
        let now = Utc::now();
        let retention = self.config.reaper.retention();
        let max_retries = self.config.stages.descriptor(stage).max_retries;
        let mut decision = FailureDecision::Stale;

        let stored = update_job(self.store.as_ref(), &message.job_id, self.attempts(), |record| {
            decision = FailureDecision::Stale;
            if !holds_claim(record, stage, message.attempt) {
                return Ok(false);
            }
            let mut sm = JobStateMachine::new(record);

            // A requested cancellation wins over whatever the adapter reported
            if sm.job().cancelled {
                sm.finalize_cancel(now, retention)?;
                decision = FailureDecision::Cancelled;
                return Ok(true);
            }

            match failure.category {
                ErrorCategory::Cancelled => {
                    sm.release_claim(stage)?;
                    decision = FailureDecision::Released;
                }
                ErrorCategory::Transient => {
                    let used = sm.job().attempt(stage);
                    if used < max_retries {
                        let delay = self.backoff.delay_for(used + 1);
                        let due = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                        let attempt = sm.schedule_retry(stage, due)?;
                        decision = FailureDecision::Retry { attempt, delay };
                    } else {
                        sm.fail(
                            FailureKind::Transient,
                            format!("{} (gave up after {} attempts)", failure.message, used + 1),
                            now,
                            retention,
                        )?;
                        decision = FailureDecision::Failed;
                    }
                }
                ErrorCategory::Fatal => {
                    sm.fail(FailureKind::Fatal, failure.message.clone(), now, retention)?;
                    decision = FailureDecision::Failed;
                }
            }
            Ok(true)
        })
        .await?;

        let stored = match stored {
            Some(stored) => stored,
            None => {
                warn!(job_id = %message.job_id, stage = %stage, attempt = message.attempt, "stale stage failure discarded");
                return Ok(None);
            }
        };

        match decision {
            FailureDecision::Retry { attempt, delay } => {
                self.metrics.stage_retried(stage);
                warn!(
                    job_id = %stored.job_id,
                    stage = %stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "transient stage failure, retry scheduled"
                );
                self.dispatch_event(&stored).await;
            }
            FailureDecision::Released => {
                info!(job_id = %stored.job_id, stage = %stage, "stage interrupted, claim released");
                self.dispatch_event(&stored).await;
            }
            FailureDecision::Failed => {
                error!(
                    job_id = %stored.job_id,
                    stage = %stage,
                    category = %failure.category,
                    error = %failure.message,
                    "job failed"
                );
                self.job_finished(&stored).await;
                self.after_terminal().await;
            }
            FailureDecision::Cancelled => {
                info!(job_id = %stored.job_id, stage = %stage, "job cancelled");
                self.job_finished(&stored).await;
                self.after_terminal().await;
            }
            FailureDecision::Stale => {}
        }
        Ok(Some(stored))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Cancellation
    // ───────────────────────────────────────────────────────────────────────

    /// Set the cancellation flag
    ///
    /// QUEUED jobs and RUNNING jobs whose stage is not claimed are finalized
    /// immediately; a claimed stage observes the flag cooperatively. Cancelling
    /// a terminal job is a no-op that reports its status.
    pub async fn request_cancel(&self, job_id: &JobId) -> Result<JobStatusView> {
        let now = Utc::now();
        let retention = self.config.reaper.retention();
        let mut finalized = false;

        let stored = update_job(self.store.as_ref(), job_id, self.attempts(), |record| {
            finalized = false;
            if record.is_terminal() {
                return Ok(false);
            }
            let mut sm = JobStateMachine::new(record);
            let first = sm.request_cancel()?;
            if sm.job().claim.is_none() {
                sm.finalize_cancel(now, retention)?;
                finalized = true;
                return Ok(true);
            }
            Ok(first)
        })
        .await?;

        let record = match stored {
            Some(record) => record,
            None => self.store.read(job_id).await?,
        };
        if finalized {
            info!(job_id = %job_id, "job cancelled");
            self.job_finished(&record).await;
            self.after_terminal().await;
        } else if !record.is_terminal() {
            info!(job_id = %job_id, "cancellation requested");
        }
        Ok(record.status_view())
    }

    /// CAS a non-terminal job into CANCELLED; no-op for terminal jobs
    async fn finalize_cancel(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let retention = self.config.reaper.retention();
        let stored = update_job(self.store.as_ref(), job_id, self.attempts(), |record| {
            if record.is_terminal() {
                return Ok(false);
            }
            JobStateMachine::new(record).finalize_cancel(now, retention)?;
            Ok(true)
        })
        .await?;

        if let Some(record) = &stored {
            info!(job_id = %job_id, "job cancelled");
            self.job_finished(record).await;
        }
        Ok(stored)
    }

    /// Bookkeeping after a job reached a terminal state
    pub(crate) async fn job_finished(&self, record: &JobRecord) {
        self.admission.release(&record.job_id);
        match record.status {
            JobStatus::Completed => self.metrics.job_completed(),
            JobStatus::Cancelled => self.metrics.job_cancelled(),
            JobStatus::Failed => {
                if let Some(error) = &record.error {
                    self.metrics.job_failed(error.kind);
                }
            }
            _ => {}
        }
        if let Err(e) = self.workspace.cleanup_temp(&record.job_id).await {
            warn!(job_id = %record.job_id, error = %e, "temp cleanup failed, reaper will retry");
        }
    }

    /// A slot may have opened up
    async fn after_terminal(&self) {
        if let Err(e) = self.admit_pending().await {
            warn!(error = %e, "admission after terminal transition failed");
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Re-scan
    // ───────────────────────────────────────────────────────────────────────

    /// Reconcile permits and dispatch with the store
    ///
    /// Runs at startup (recovery) and periodically. Claimed stages are left
    /// alone: a live worker owns them, or the reaper's stall check will.
    pub async fn rescan(&self) -> Result<RescanReport> {
        let mut report = RescanReport::default();

        let running = {
            let _guard = self.admit_lock.lock().await;
            let running = self.store.scan(StatusFilter::Is(JobStatus::Running)).await?;
            let live: HashSet<JobId> = running.iter().map(|r| r.job_id).collect();

            for job_id in self.admission.held_jobs() {
                if !live.contains(&job_id) && self.admission.release(&job_id) {
                    report.released += 1;
                }
            }
            for record in &running {
                if self.admission.holds(&record.job_id) {
                    continue;
                }
                if self.admission.try_acquire(record.job_id) {
                    report.adopted += 1;
                } else {
                    warn!(job_id = %record.job_id, "running job exceeds the admission bound");
                }
            }
            running
        };

        for record in running {
            if record.claim.is_some() {
                continue;
            }
            if record.cancelled {
                match self.finalize_cancel(&record.job_id).await {
                    Ok(Some(_)) => report.cancelled += 1,
                    Ok(None) => {}
                    Err(e) => warn!(job_id = %record.job_id, error = %e, "failed to finalize cancelled job"),
                }
                continue;
            }
            match self.dispatch(&record).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(OrchestratorError::QueueClosed) => break,
                Err(e) => warn!(job_id = %record.job_id, error = %e, "re-dispatch failed"),
            }
        }

        report.admitted = self.admit_pending().await?;
        if report != RescanReport::default() {
            debug!(?report, "re-scan pass");
        }
        Ok(report)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────────────────

    pub async fn status(&self, job_id: &JobId) -> Result<JobStatusView> {
        Ok(self.store.read(job_id).await?.status_view())
    }

    /// Artifact listing of a COMPLETED job
    ///
    /// # Errors
    ///
    /// `NotReady` for any other status
    pub async fn results(&self, job_id: &JobId) -> Result<JobResultsView> {
        let record = self.store.read(job_id).await?;
        record.results_view().ok_or_else(|| OrchestratorError::NotReady {
            job_id: job_id.to_string(),
            status: record.status.to_string(),
        })
    }

    /// Visible jobs matching `filter`, newest first
    pub async fn list_jobs(&self, filter: StatusFilter, limit: Option<usize>) -> Result<Vec<JobStatusView>> {
        let now = Utc::now();
        let mut records: Vec<JobRecord> = self
            .store
            .scan(filter)
            .await?
            .into_iter()
            .filter(|r| r.is_retained_at(now))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(records
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(JobRecord::status_view)
            .collect())
    }

    pub async fn stats(&self) -> Result<JobStats> {
        Ok(self.store.stats().await?)
    }
}

fn stage_of(message: &TaskMessage) -> Result<StageId> {
    StageId::from_index(message.stage_index).ok_or_else(|| {
        OrchestratorError::validation(format!("unknown stage index {}", message.stage_index))
    })
}

/// Whether the record still shows `attempt` of `stage` as claimed
pub(crate) fn holds_claim(record: &JobRecord, stage: StageId, attempt: u32) -> bool {
    record.status == JobStatus::Running
        && record.current_stage == Some(stage)
        && record.claim.as_ref().map(|c| c.attempt) == Some(attempt)
}

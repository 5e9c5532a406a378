use chrono::{DateTime, Duration, Utc};
use stemflow_storage::{
    ArtifactRef, FailureKind, JobError, JobRecord, JobStatus, StageClaim, StageId, StageTiming,
};

use crate::config::StagesSection;
use crate::error::{OrchestratorError, Result};
use crate::queue::TaskMessage;

/// Per-stage weights for overall progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageWeights([f64; 3]);

impl StageWeights {
    pub fn new(separation: f64, transcription: f64, beat_analysis: f64) -> Self {
        Self([separation, transcription, beat_analysis])
    }

    pub fn from_config(stages: &StagesSection) -> Self {
        Self::new(
            stages.separation.weight,
            stages.transcription.weight,
            stages.beat_analysis.weight,
        )
    }

    pub fn weight(&self, stage: StageId) -> f64 {
        self.0[stage.index()]
    }

    /// Sum of the weights of every stage before `stage`
    pub fn completed_before(&self, stage: StageId) -> f64 {
        self.0[..stage.index()].iter().sum()
    }

    /// `completed_stage_weights + current_stage_weight * fraction`
    pub fn overall(&self, stage: StageId, fraction: f64) -> f64 {
        let fraction = clamp_fraction(fraction);
        (self.completed_before(stage) + self.weight(stage) * fraction).min(1.0)
    }
}

impl Default for StageWeights {
    fn default() -> Self {
        Self::from_config(&StagesSection::default())
    }
}

/// Clamp into [0, 1]; NaN counts as no progress
pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

/// What a worker should do with a delivered task message
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryCheck {
    /// Claim the attempt and run the adapter
    Execute,
    /// Duplicate or stale delivery; acknowledge silently
    Stale(&'static str),
    /// A scheduled retry whose backoff has not elapsed
    NotDue(DateTime<Utc>),
    /// Cancellation was requested before the attempt started
    CancelBeforeStart,
}

/// Decide whether `message` may execute against `record`
///
/// A message executes only when it names the job's current stage and its
/// persisted attempt, and no worker has claimed that attempt yet.
pub fn check_delivery(record: &JobRecord, message: &TaskMessage, now: DateTime<Utc>) -> DeliveryCheck {
    if record.is_terminal() {
        return DeliveryCheck::Stale("job is terminal");
    }
    let current = match (record.status, record.current_stage) {
        (JobStatus::Running, Some(stage)) => stage,
        _ => return DeliveryCheck::Stale("job is not running"),
    };

    if current.index() > message.stage_index {
        return DeliveryCheck::Stale("job advanced past stage");
    }
    if current.index() < message.stage_index {
        return DeliveryCheck::Stale("stage not reached");
    }

    let attempt = record.attempt(current);
    if message.attempt < attempt {
        return DeliveryCheck::Stale("attempt superseded by retry");
    }
    if message.attempt > attempt {
        return DeliveryCheck::Stale("attempt not scheduled");
    }
    if record.claim.is_some() {
        return DeliveryCheck::Stale("attempt already claimed");
    }

    if record.cancelled {
        return DeliveryCheck::CancelBeforeStart;
    }
    match record.next_attempt_at {
        Some(due) if due > now => DeliveryCheck::NotDue(due),
        _ => DeliveryCheck::Execute,
    }
}

/// Job state machine for transitions
///
/// Operates on a working copy of the record inside a compare-and-swap; the
/// store bumps `version` and `updated_at` when the copy is written back.
///
/// ```text
/// QUEUED ─admit─▶ RUNNING(0) ─▶ RUNNING(1) ─▶ RUNNING(2) ─▶ COMPLETED
///    │                 │              │              │
///    └──────────┬──────┴──────────────┴──────────────┘
///               ▼
///       FAILED | CANCELLED
/// ```
pub struct JobStateMachine<'a> {
    job: &'a mut JobRecord,
}

impl<'a> JobStateMachine<'a> {
    pub fn new(job: &'a mut JobRecord) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &JobRecord {
        &*self.job
    }

    fn state_name(&self) -> String {
        match (self.job.status, self.job.current_stage) {
            (JobStatus::Running, Some(stage)) => format!("RUNNING({})", stage),
            (status, _) => status.to_string(),
        }
    }

    fn running_stage(&self, expected: StageId, to: &str) -> Result<()> {
        match (self.job.status, self.job.current_stage) {
            (JobStatus::Running, Some(stage)) if stage == expected => Ok(()),
            _ => Err(OrchestratorError::invalid_transition(self.state_name(), to)),
        }
    }

    /// Transition: QUEUED → RUNNING(0)
    pub fn admit(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.job.status != JobStatus::Queued || self.job.cancelled {
            return Err(OrchestratorError::invalid_transition(
                self.state_name(),
                "RUNNING(separation)",
            ));
        }
        self.job.status = JobStatus::Running;
        self.job.current_stage = Some(StageId::first());
        self.job.started_at = Some(now);
        self.job.claim = None;
        self.job.next_attempt_at = None;
        Ok(())
    }

    /// Take the single-executor claim on the current attempt
    pub fn claim(&mut self, stage: StageId, attempt: u32, worker: &str, now: DateTime<Utc>) -> Result<()> {
        self.running_stage(stage, "claimed")?;
        if self.job.claim.is_some() || self.job.attempt(stage) != attempt {
            return Err(OrchestratorError::invalid_transition(
                self.state_name(),
                format!("claimed (attempt {})", attempt),
            ));
        }
        self.job.claim = Some(StageClaim {
            attempt,
            worker: worker.to_string(),
            claimed_at: now,
        });
        self.job.next_attempt_at = None;
        Ok(())
    }

    /// Drop the claim without consuming an attempt (worker shut down mid-stage)
    pub fn release_claim(&mut self, stage: StageId) -> Result<()> {
        self.running_stage(stage, "unclaimed")?;
        self.job.claim = None;
        Ok(())
    }

    /// Record adapter progress; returns whether anything moved
    ///
    /// Both the stage fraction and overall progress only ever increase.
    pub fn record_progress(&mut self, stage: StageId, fraction: f64, weights: &StageWeights) -> Result<bool> {
        self.running_stage(stage, "progress")?;
        let fraction = clamp_fraction(fraction);
        let overall = weights.overall(stage, fraction);

        let mut changed = false;
        if fraction > self.job.stage_progress(stage) {
            self.job.stage_progress.insert(stage, fraction);
            changed = true;
        }
        if overall > self.job.overall_progress {
            self.job.overall_progress = overall;
            changed = true;
        }
        Ok(changed)
    }

    /// Transition: RUNNING(i) → RUNNING(i+1) | COMPLETED
    pub fn complete_stage(
        &mut self,
        stage: StageId,
        artifact: ArtifactRef,
        timing: StageTiming,
        weights: &StageWeights,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<()> {
        self.running_stage(stage, "stage complete")?;

        self.job.stage_progress.insert(stage, 1.0);
        self.job.artifacts.insert(stage, artifact);
        self.job.stage_timings.insert(stage, timing);
        self.job.claim = None;
        self.job.next_attempt_at = None;

        match stage.next() {
            Some(next) => {
                self.job.current_stage = Some(next);
                self.job.overall_progress =
                    self.job.overall_progress.max(weights.completed_before(next));
            }
            None => {
                self.job.status = JobStatus::Completed;
                self.job.current_stage = None;
                self.job.overall_progress = 1.0;
                self.finish(now, retention);
            }
        }
        Ok(())
    }

    /// Consume one retry of `stage` and schedule the next attempt
    pub fn schedule_retry(&mut self, stage: StageId, next_attempt_at: DateTime<Utc>) -> Result<u32> {
        self.running_stage(stage, "retry scheduled")?;
        let attempt = self.job.attempt(stage) + 1;
        self.job.retry_counts.insert(stage, attempt);
        self.job.claim = None;
        self.job.next_attempt_at = Some(next_attempt_at);
        Ok(attempt)
    }

    /// Transition: non-terminal → FAILED (progress freezes)
    pub fn fail(
        &mut self,
        kind: FailureKind,
        message: impl Into<String>,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<()> {
        if self.job.is_terminal() {
            return Err(OrchestratorError::invalid_transition(self.state_name(), "FAILED"));
        }
        let stage = self.job.current_stage;
        self.job.status = JobStatus::Failed;
        self.job.error = Some(JobError::new(kind, message, stage));
        self.job.claim = None;
        self.job.next_attempt_at = None;
        self.finish(now, retention);
        Ok(())
    }

    /// Set the cancellation flag on a non-terminal job
    pub fn request_cancel(&mut self) -> Result<bool> {
        if self.job.is_terminal() {
            return Err(OrchestratorError::invalid_transition(self.state_name(), "CANCELLED"));
        }
        let first = !self.job.cancelled;
        self.job.cancelled = true;
        Ok(first)
    }

    /// Transition: non-terminal → CANCELLED (progress freezes)
    pub fn finalize_cancel(&mut self, now: DateTime<Utc>, retention: Duration) -> Result<()> {
        if self.job.is_terminal() {
            return Err(OrchestratorError::invalid_transition(self.state_name(), "CANCELLED"));
        }
        self.job.status = JobStatus::Cancelled;
        self.job.cancelled = true;
        self.job.claim = None;
        self.job.next_attempt_at = None;
        self.finish(now, retention);
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>, retention: Duration) {
        self.job.finished_at = Some(now);
        // Retention is bounded by config validation; saturate rather than panic
        self.job.retain_until = Some(now.checked_add_signed(retention).unwrap_or(DateTime::<Utc>::MAX_UTC));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stemflow_storage::JobId;

    fn record() -> JobRecord {
        JobRecord::new("/in/song.mp3", serde_json::Value::Null, Duration::hours(1)).unwrap()
    }

    fn timing() -> StageTiming {
        let now = Utc::now();
        StageTiming::new(now, now)
    }

    fn message(job_id: JobId, stage_index: usize, attempt: u32) -> TaskMessage {
        TaskMessage {
            job_id,
            stage_index,
            attempt,
        }
    }

    #[test]
    fn test_weights() {
        let weights = StageWeights::default();
        assert_eq!(weights.completed_before(StageId::Separation), 0.0);
        assert!((weights.completed_before(StageId::BeatAnalysis) - 0.9).abs() < 1e-9);
        assert!((weights.overall(StageId::Transcription, 0.5) - 0.75).abs() < 1e-9);
        assert_eq!(weights.overall(StageId::Separation, 7.0), 0.6);
        assert_eq!(weights.overall(StageId::Separation, f64::NAN), 0.0);
    }

    #[test]
    fn test_full_path_to_completed() {
        let weights = StageWeights::default();
        let retention = Duration::days(1);
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);

        sm.admit(Utc::now()).unwrap();
        for stage in StageId::ALL {
            sm.claim(stage, 0, "worker-1", Utc::now()).unwrap();
            sm.complete_stage(stage, ArtifactRef::new(format!("/jobs/x/{}", stage)), timing(), &weights, Utc::now(), retention)
                .unwrap();
        }

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.overall_progress, 1.0);
        assert_eq!(job.artifacts.len(), 3);
        assert!(job.retain_until.is_some());
        assert!(job.claim.is_none());
    }

    #[test]
    fn test_cannot_skip_stage() {
        let weights = StageWeights::default();
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit(Utc::now()).unwrap();

        let err = sm
            .complete_stage(StageId::Transcription, ArtifactRef::new("x"), timing(), &weights, Utc::now(), Duration::days(1))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit(Utc::now()).unwrap();
        sm.fail(FailureKind::Fatal, "corrupt", Utc::now(), Duration::days(1)).unwrap();

        assert!(sm.fail(FailureKind::Fatal, "again", Utc::now(), Duration::days(1)).is_err());
        assert!(sm.request_cancel().is_err());
        assert!(sm.finalize_cancel(Utc::now(), Duration::days(1)).is_err());
        assert!(sm.admit(Utc::now()).is_err());
    }

    #[test]
    fn test_fail_records_stage() {
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit(Utc::now()).unwrap();
        sm.fail(FailureKind::Fatal, "unsupported codec", Utc::now(), Duration::days(1)).unwrap();

        let error = job.error.unwrap();
        assert_eq!(error.kind, FailureKind::Fatal);
        assert_eq!(error.stage, Some(StageId::Separation));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let weights = StageWeights::default();
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit(Utc::now()).unwrap();

        assert!(sm.record_progress(StageId::Separation, 0.5, &weights).unwrap());
        assert!(!sm.record_progress(StageId::Separation, 0.2, &weights).unwrap());
        assert!((sm.job().overall_progress - 0.3).abs() < 1e-9);
        assert!(sm.record_progress(StageId::Transcription, 0.1, &weights).is_err());
    }

    #[test]
    fn test_retry_increments_attempt() {
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit(Utc::now()).unwrap();
        sm.claim(StageId::Separation, 0, "w", Utc::now()).unwrap();

        let due = Utc::now() + Duration::seconds(2);
        assert_eq!(sm.schedule_retry(StageId::Separation, due).unwrap(), 1);
        assert_eq!(job.attempt(StageId::Separation), 1);
        assert_eq!(job.next_attempt_at, Some(due));
        assert!(job.claim.is_none());
    }

    #[test]
    fn test_cancel_from_queued() {
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        assert!(sm.request_cancel().unwrap());
        assert!(!sm.request_cancel().unwrap());
        sm.finalize_cancel(Utc::now(), Duration::days(1)).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_cancelled_job_cannot_be_admitted() {
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        sm.request_cancel().unwrap();
        assert!(sm.admit(Utc::now()).is_err());
    }

    #[test]
    fn test_double_claim_rejected() {
        let mut job = record();
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit(Utc::now()).unwrap();
        sm.claim(StageId::Separation, 0, "w1", Utc::now()).unwrap();
        assert!(sm.claim(StageId::Separation, 0, "w2", Utc::now()).is_err());
    }

    #[test]
    fn test_delivery_checks() {
        let now = Utc::now();
        let mut job = record();
        let id = job.job_id;

        assert_eq!(check_delivery(&job, &message(id, 0, 0), now), DeliveryCheck::Stale("job is not running"));

        JobStateMachine::new(&mut job).admit(now).unwrap();
        assert_eq!(check_delivery(&job, &message(id, 0, 0), now), DeliveryCheck::Execute);
        assert_eq!(check_delivery(&job, &message(id, 1, 0), now), DeliveryCheck::Stale("stage not reached"));

        JobStateMachine::new(&mut job).claim(StageId::Separation, 0, "w", now).unwrap();
        assert_eq!(check_delivery(&job, &message(id, 0, 0), now), DeliveryCheck::Stale("attempt already claimed"));

        let due = now + Duration::seconds(5);
        JobStateMachine::new(&mut job).schedule_retry(StageId::Separation, due).unwrap();
        assert_eq!(check_delivery(&job, &message(id, 0, 0), now), DeliveryCheck::Stale("attempt superseded by retry"));
        assert_eq!(check_delivery(&job, &message(id, 0, 1), now), DeliveryCheck::NotDue(due));
        assert_eq!(check_delivery(&job, &message(id, 0, 1), due), DeliveryCheck::Execute);

        job.cancelled = true;
        assert_eq!(check_delivery(&job, &message(id, 0, 1), due), DeliveryCheck::CancelBeforeStart);
    }

    #[test]
    fn test_delivery_after_advance_is_stale() {
        let now = Utc::now();
        let mut job = record();
        let id = job.job_id;
        let mut sm = JobStateMachine::new(&mut job);
        sm.admit(now).unwrap();
        sm.claim(StageId::Separation, 0, "w", now).unwrap();
        sm.complete_stage(StageId::Separation, ArtifactRef::new("a"), timing(), &StageWeights::default(), now, Duration::days(1))
            .unwrap();

        assert_eq!(check_delivery(&job, &message(id, 0, 0), now), DeliveryCheck::Stale("job advanced past stage"));
    }
}

//! Reaper
//!
//! Periodic sweep over every job record:
//!
//! | record                                   | action                                   |
//! |------------------------------------------|------------------------------------------|
//! | non-terminal, `now > expires_at`         | FAILED / `Expired`                        |
//! | RUNNING, silent longer than stall timeout| FAILED / `StallTimeout`                   |
//! | terminal, storage not reclaimed          | release slot, drop temp dirs, mark record |
//! | terminal, past `retain_until`            | delete job directory, then the record     |
//! | job directory without a record, older    | delete job directory                      |
//! | than the retention window                |                                           |
//!
//! Every action re-checks its condition inside the compare-and-swap and all
//! file removal is idempotent, so an interrupted sweep is simply redone on the
//! next period.

use std::collections::HashSet;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use stemflow_storage::{FailureKind, JobId, JobRecord, JobStatus, StatusFilter};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StagesSection;
use crate::coordinator::PipelineCoordinator;
use crate::error::Result;
use crate::job::JobStateMachine;
use crate::retry::update_job;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub stalled: usize,
    pub expired: usize,
    /// Terminal jobs whose slot and temp storage were reclaimed
    pub reclaimed: usize,
    /// Records deleted after their retention window
    pub purged: usize,
    /// Job directories removed because no record points to them
    pub orphans: usize,
    /// Records left for the next pass because of an error
    pub errors: usize,
}

/// Why a live job must be forced into FAILED, if it must
fn liveness_failure(record: &JobRecord, now: DateTime<Utc>, stages: &StagesSection) -> Option<(FailureKind, String)> {
    if record.is_terminal() {
        return None;
    }
    if now > record.expires_at {
        return Some((
            FailureKind::Expired,
            format!("job exceeded its deadline of {}", record.expires_at.to_rfc3339()),
        ));
    }
    match (record.status, record.current_stage) {
        (JobStatus::Running, Some(stage)) => {
            let timeout = stages.descriptor(stage).stall_timeout();
            let silent = now - record.updated_at;
            (silent > timeout).then(|| {
                (
                    FailureKind::StallTimeout,
                    format!(
                        "no progress from {} for {}s (timeout {}s)",
                        stage,
                        silent.num_seconds(),
                        timeout.num_seconds()
                    ),
                )
            })
        }
        _ => None,
    }
}

pub struct Reaper {
    coordinator: Arc<PipelineCoordinator>,
}

impl Reaper {
    pub fn new(coordinator: Arc<PipelineCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Sweep every `reaper.period_secs` until `shutdown` fires
    ///
    /// A failed or panicking sweep is logged and the loop carries on.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.coordinator.config().reaper.period());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match AssertUnwindSafe(self.sweep()).catch_unwind().await {
                    Ok(Ok(report)) => debug!(?report, "reaper sweep finished"),
                    Ok(Err(e)) => error!(error = %e, "reaper sweep failed"),
                    Err(_) => error!("reaper sweep panicked"),
                }
            }
            debug!("reaper stopped");
        })
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let records = self.coordinator.store().scan(StatusFilter::Any).await?;
        let mut report = SweepReport {
            scanned: records.len(),
            ..SweepReport::default()
        };

        for record in records {
            let result = if record.is_terminal() {
                self.retire(&record, now, &mut report).await
            } else {
                self.enforce_liveness(&record, now, &mut report).await
            };
            if let Err(e) = result {
                report.errors += 1;
                warn!(job_id = %record.job_id, error = %e, "reaper left job for next pass");
            }
        }

        if let Err(e) = self.remove_orphans(now, &mut report).await {
            report.errors += 1;
            warn!(error = %e, "orphan sweep left for next pass");
        }

        if report.stalled + report.expired > 0 {
            self.coordinator.admit_pending().await?;
        }
        if report.stalled + report.expired + report.purged + report.orphans > 0 {
            info!(
                stalled = report.stalled,
                expired = report.expired,
                purged = report.purged,
                orphans = report.orphans,
                "reaper sweep"
            );
        }
        Ok(report)
    }

    /// Delete job directories that no record points to
    ///
    /// Submission sets up the directory before inserting the record, so a
    /// failed insert or a crash in between leaves one behind. Directories
    /// younger than the retention window are kept, which covers submissions
    /// still in flight.
    async fn remove_orphans(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let coordinator = &self.coordinator;
        let workspace = coordinator.workspace();

        // Directories first: a job set up after this listing cannot be mistaken for an orphan
        let dirs = workspace.job_ids().await?;
        if dirs.is_empty() {
            return Ok(());
        }
        let known: HashSet<JobId> = coordinator.store().list(StatusFilter::Any).await?.into_iter().collect();
        let retention = coordinator.config().reaper.retention();

        for job_id in dirs.into_iter().filter(|id| !known.contains(id)) {
            let created = match workspace.created_at(&job_id).await {
                Ok(created) => created,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %job_id, error = %e, "cannot date job directory");
                    continue;
                }
            };
            if now - created <= retention {
                continue;
            }
            match workspace.remove_all(&job_id).await {
                Ok(()) => {
                    report.orphans += 1;
                    info!(job_id = %job_id, created_at = %created.to_rfc3339(), "orphaned job directory removed");
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %job_id, error = %e, "cannot remove orphaned job directory");
                }
            }
        }
        Ok(())
    }

    async fn enforce_liveness(&self, record: &JobRecord, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let coordinator = &self.coordinator;
        let stages = &coordinator.config().stages;
        if liveness_failure(record, now, stages).is_none() {
            return Ok(());
        }

        let retention = coordinator.config().reaper.retention();
        let mut verdict = None;
        let stored = update_job(
            coordinator.store().as_ref(),
            &record.job_id,
            coordinator.config().engine.store_retry_attempts,
            |fresh| {
                // The job may have moved on since the scan
                verdict = liveness_failure(fresh, now, stages);
                match &verdict {
                    Some((kind, message)) => {
                        JobStateMachine::new(fresh).fail(*kind, message.clone(), now, retention)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            },
        )
        .await?;

        if let (Some(stored), Some((kind, message))) = (stored, verdict) {
            match kind {
                FailureKind::Expired => report.expired += 1,
                _ => report.stalled += 1,
            }
            coordinator.metrics().job_reaped();
            error!(
                job_id = %stored.job_id,
                stage = ?stored.current_stage,
                kind = %kind,
                error = %message,
                "job failed by reaper"
            );
            coordinator.job_finished(&stored).await;
        }
        Ok(())
    }

    async fn retire(&self, record: &JobRecord, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let coordinator = &self.coordinator;
        let workspace = coordinator.workspace();

        if !record.is_retained_at(now) {
            workspace.remove_all(&record.job_id).await?;
            coordinator.admission().release(&record.job_id);
            if coordinator.store().delete(&record.job_id).await? {
                report.purged += 1;
                debug!(job_id = %record.job_id, "job purged");
            }
            return Ok(());
        }

        if !record.storage_reclaimed {
            coordinator.admission().release(&record.job_id);
            workspace.cleanup_temp(&record.job_id).await?;
            update_job(
                coordinator.store().as_ref(),
                &record.job_id,
                coordinator.config().engine.store_retry_attempts,
                |fresh| {
                    if fresh.storage_reclaimed {
                        return Ok(false);
                    }
                    fresh.storage_reclaimed = true;
                    Ok(true)
                },
            )
            .await?;
            report.reclaimed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::coordinator::ClaimOutcome;
    use crate::queue::{InMemoryTaskQueue, TaskQueue};
    use chrono::Duration;
    use crate::workspace::InputManifest;
    use stemflow_storage::{InMemoryJobStore, StageId};

    struct Fixture {
        coordinator: Arc<PipelineCoordinator>,
        reaper: Reaper,
        queue: InMemoryTaskQueue,
        input: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture(max_concurrent: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_tests(max_concurrent);
        config.storage.root = dir.path().join("jobs");
        let input = dir.path().join("song.flac");
        std::fs::write(&input, b"fLaC").unwrap();

        let queue = InMemoryTaskQueue::new();
        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::new(config),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(queue.clone()),
        ));
        Fixture {
            reaper: Reaper::new(coordinator.clone()),
            coordinator,
            queue,
            input,
            _dir: dir,
        }
    }

    impl Fixture {
        async fn submit(&self) -> JobId {
            self.coordinator
                .submit(self.input.to_str().unwrap(), serde_json::json!({}))
                .await
                .unwrap()
        }

        async fn claim_next(&self) -> JobId {
            let delivery = self.queue.dequeue().await.unwrap();
            let message = *delivery.message();
            delivery.ack();
            assert!(matches!(
                self.coordinator.claim(&message, "w").await.unwrap(),
                ClaimOutcome::Acquired(_)
            ));
            message.job_id
        }
    }

    #[tokio::test]
    async fn test_healthy_jobs_untouched() {
        let fx = fixture(1);
        let running = fx.submit().await;
        let queued = fx.submit().await;

        let report = fx.reaper.sweep().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.stalled + report.expired, 0);
        assert_eq!(fx.coordinator.status(&running).await.unwrap().status, JobStatus::Running);
        assert_eq!(fx.coordinator.status(&queued).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_stall_fails_job_and_frees_slot() {
        let fx = fixture(1);
        let stalled = fx.submit().await;
        let waiting = fx.submit().await;
        fx.claim_next().await;

        let later = Utc::now() + Duration::seconds(1_501);
        let report = fx.reaper.sweep_at(later).await.unwrap();
        assert_eq!(report.stalled, 1);

        let record = fx.coordinator.store().read(&stalled).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, FailureKind::StallTimeout);
        assert_eq!(error.stage, Some(StageId::Separation));

        assert_eq!(fx.coordinator.status(&waiting).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_expired_job_fails() {
        let fx = fixture(1);
        let id = fx.submit().await;

        let later = Utc::now() + Duration::seconds(3_601);
        let report = fx.reaper.sweep_at(later).await.unwrap();
        assert_eq!(report.expired, 1);
        let error = fx.coordinator.status(&id).await.unwrap().error.unwrap();
        assert_eq!(error.kind, FailureKind::Expired);
    }

    #[tokio::test]
    async fn test_terminal_jobs_reclaimed_then_purged() {
        let fx = fixture(1);
        let id = fx.submit().await;
        fx.coordinator.request_cancel(&id).await.unwrap();
        let staging = fx
            .coordinator
            .workspace()
            .prepare_staging(&id, StageId::Separation, 0)
            .await
            .unwrap();

        let report = fx.reaper.sweep().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert!(!staging.exists());
        assert!(fx.coordinator.store().read(&id).await.unwrap().storage_reclaimed);

        // Second pass is a no-op
        let report = fx.reaper.sweep().await.unwrap();
        assert_eq!(report.reclaimed, 0);

        let after_retention = Utc::now() + Duration::seconds(86_401);
        let report = fx.reaper.sweep_at(after_retention).await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(!fx.coordinator.workspace().job_dir(&id).exists());
        assert!(fx.coordinator.store().scan(StatusFilter::Any).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_job_dir_removed_after_retention() {
        let fx = fixture(1);
        let live = fx.submit().await;
        let workspace = fx.coordinator.workspace();

        // Set up as submission does, but the record never landed
        let orphan = JobId::new();
        workspace
            .prepare(&InputManifest {
                job_id: orphan,
                input_ref: "/media/lost.wav".to_string(),
                options: serde_json::Value::Null,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap();
        let foreign = workspace.root().join("lost+found");
        std::fs::create_dir_all(&foreign).unwrap();

        let report = fx.reaper.sweep().await.unwrap();
        assert_eq!(report.orphans, 0);
        assert!(workspace.job_dir(&orphan).exists());

        let after_retention = Utc::now() + Duration::seconds(86_401);
        let report = fx.reaper.sweep_at(after_retention).await.unwrap();
        assert_eq!(report.orphans, 1);
        assert_eq!(report.errors, 0);
        assert!(!workspace.job_dir(&orphan).exists());
        assert!(workspace.job_dir(&live).exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_liveness_rules() {
        let stages = StagesSection::default();
        let mut record = JobRecord::new("/in/a.wav", serde_json::Value::Null, Duration::hours(1)).unwrap();
        let now = Utc::now();

        // Waiting for admission is not a stall
        assert!(liveness_failure(&record, now + Duration::seconds(1_600), &stages).is_none());

        JobStateMachine::new(&mut record).admit(now).unwrap();
        record.updated_at = now;
        let (kind, _) = liveness_failure(&record, now + Duration::seconds(1_501), &stages).unwrap();
        assert_eq!(kind, FailureKind::StallTimeout);
        assert!(liveness_failure(&record, now + Duration::seconds(1_499), &stages).is_none());

        let (kind, _) = liveness_failure(&record, now + Duration::hours(2), &stages).unwrap();
        assert_eq!(kind, FailureKind::Expired);
    }
}

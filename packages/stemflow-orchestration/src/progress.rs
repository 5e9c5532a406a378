//! Progress reporter
//!
//! Adapters report fractional stage progress through a `ProgressHandle`. The
//! handle only publishes the latest value on a watch channel, so reporting
//! never blocks stage computation. A background task coalesces values into
//! compare-and-swap writes of the job record:
//!
//! - write when overall progress moved by at least `min_delta`, or
//! - when `min_interval` elapsed since the last write and it moved at all.
//!
//! Write failures are logged and never abort the stage.

use std::sync::Arc;

use stemflow_storage::{JobId, JobStore, StageId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProgressConfig;
use crate::coordinator::holds_claim;
use crate::job::{clamp_fraction, JobStateMachine, StageWeights};
use crate::retry::update_job;

/// Adapter-side progress handle (cheap to clone)
#[derive(Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<f64>>,
}

impl ProgressHandle {
    /// Report `fraction` of the current stage; values are clamped to [0, 1]
    /// and anything below the last reported value is ignored
    pub fn report(&self, fraction: f64) {
        let fraction = clamp_fraction(fraction);
        self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    /// Latest reported fraction
    pub fn current(&self) -> f64 {
        *self.tx.borrow()
    }

    /// A handle wired to nothing, for adapters run outside the engine
    pub fn detached() -> Self {
        let (tx, _rx) = watch::channel(0.0);
        Self { tx: Arc::new(tx) }
    }
}

/// Identity of the stage attempt whose progress is being written
#[derive(Debug, Clone, Copy)]
pub struct ProgressTarget {
    pub job_id: JobId,
    pub stage: StageId,
    pub attempt: u32,
}

/// Background writer for one stage attempt
pub struct ProgressReporter {
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(
        store: Arc<dyn JobStore>,
        target: ProgressTarget,
        weights: StageWeights,
        config: ProgressConfig,
        store_retry_attempts: u32,
    ) -> (ProgressHandle, ProgressReporter) {
        let (tx, rx) = watch::channel(0.0);
        let done = CancellationToken::new();
        let writer = Writer {
            store,
            target,
            weights,
            config,
            store_retry_attempts,
            last_written: (weights.completed_before(target.stage), Instant::now()),
        };
        let task = tokio::spawn(writer.run(rx, done.clone()));
        (
            ProgressHandle { tx: Arc::new(tx) },
            ProgressReporter { done, task },
        )
    }

    /// Flush the last reported value and stop
    pub async fn finish(self) {
        self.done.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "progress reporter task failed");
        }
    }
}

struct Writer {
    store: Arc<dyn JobStore>,
    target: ProgressTarget,
    weights: StageWeights,
    config: ProgressConfig,
    store_retry_attempts: u32,
    /// Overall progress of the last write and when it happened (stage start
    /// until the first write)
    last_written: (f64, Instant),
}

impl Writer {
    async fn run(mut self, mut rx: watch::Receiver<f64>, done: CancellationToken) {
        let mut pending: Option<f64> = None;

        loop {
            let deadline = self.last_written.1 + self.config.min_interval();

            tokio::select! {
                _ = done.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    pending = Some(*rx.borrow_and_update());
                }
                _ = tokio::time::sleep_until(deadline), if pending.is_some() => {}
            }

            if let Some(fraction) = pending {
                if self.delta(fraction) <= 0.0 {
                    pending = None;
                } else if self.due(fraction, Instant::now()) {
                    self.write(fraction).await;
                    pending = None;
                }
            }
        }

        // Final flush: whatever was reported last, if it moved at all
        let fraction = pending.unwrap_or(*rx.borrow());
        if self.delta(fraction) > 0.0 {
            self.write(fraction).await;
        }
    }

    fn delta(&self, fraction: f64) -> f64 {
        self.weights.overall(self.target.stage, fraction) - self.last_written.0
    }

    fn due(&self, fraction: f64, now: Instant) -> bool {
        let delta = self.delta(fraction);
        if delta <= 0.0 {
            return false;
        }
        delta >= self.config.min_delta
            || now.duration_since(self.last_written.1) >= self.config.min_interval()
    }

    async fn write(&mut self, fraction: f64) {
        let ProgressTarget {
            job_id,
            stage,
            attempt,
        } = self.target;
        let weights = self.weights;

        let result = update_job(
            self.store.as_ref(),
            &job_id,
            self.store_retry_attempts,
            |record| {
                // Only the claimed attempt of the running stage may write
                if !holds_claim(record, stage, attempt) {
                    return Ok(false);
                }
                JobStateMachine::new(record).record_progress(stage, fraction, &weights)
            },
        )
        .await;

        let overall = weights.overall(stage, fraction);
        match result {
            Ok(Some(stored)) => {
                debug!(
                    job_id = %job_id,
                    stage = %stage,
                    overall = stored.overall_progress,
                    "progress written"
                );
            }
            Ok(None) => {
                debug!(job_id = %job_id, stage = %stage, "progress write skipped");
            }
            Err(e) => {
                warn!(job_id = %job_id, stage = %stage, error = %e, "progress write failed");
            }
        }
        self.last_written = (overall, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use stemflow_storage::{InMemoryJobStore, JobRecord};

    async fn running_job(store: &InMemoryJobStore) -> JobId {
        let mut record = JobRecord::new("/in/a.wav", serde_json::Value::Null, Duration::hours(1)).unwrap();
        let id = record.job_id;
        let mut sm = JobStateMachine::new(&mut record);
        sm.admit(Utc::now()).unwrap();
        sm.claim(StageId::Separation, 0, "w", Utc::now()).unwrap();
        store.insert(record).await.unwrap();
        id
    }

    fn target(job_id: JobId) -> ProgressTarget {
        ProgressTarget {
            job_id,
            stage: StageId::Separation,
            attempt: 0,
        }
    }

    #[test]
    fn test_handle_is_monotonic_and_clamped() {
        let handle = ProgressHandle::detached();
        handle.report(0.4);
        handle.report(0.2);
        assert_eq!(handle.current(), 0.4);
        handle.report(3.0);
        assert_eq!(handle.current(), 1.0);
    }

    #[tokio::test]
    async fn test_final_value_is_flushed() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = running_job(&store).await;

        let (handle, reporter) = ProgressReporter::spawn(
            store.clone(),
            target(id),
            StageWeights::default(),
            ProgressConfig::default(),
            5,
        );
        handle.report(0.25);
        handle.report(0.5);
        reporter.finish().await;

        let record = store.read(&id).await.unwrap();
        assert_eq!(record.stage_progress(StageId::Separation), 0.5);
        assert!((record.overall_progress - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_small_steps_are_coalesced() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = running_job(&store).await;

        let config = ProgressConfig {
            min_delta: 0.5,
            min_interval_ms: 60_000,
        };
        let (handle, reporter) =
            ProgressReporter::spawn(store.clone(), target(id), StageWeights::default(), config, 5);

        for i in 1..=50 {
            handle.report(i as f64 / 100.0);
            tokio::task::yield_now().await;
        }
        // Every step stays below min_delta and the interval never elapses
        let mid = store.read(&id).await.unwrap();
        assert_eq!(mid.version, 0);

        reporter.finish().await;
        let record = store.read(&id).await.unwrap();
        assert_eq!(record.stage_progress(StageId::Separation), 0.5);
    }

    #[tokio::test]
    async fn test_no_write_for_other_attempt() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = running_job(&store).await;

        let stale = ProgressTarget {
            attempt: 3,
            ..target(id)
        };
        let (handle, reporter) = ProgressReporter::spawn(
            store.clone(),
            stale,
            StageWeights::default(),
            ProgressConfig::default(),
            5,
        );
        handle.report(0.9);
        reporter.finish().await;

        let record = store.read(&id).await.unwrap();
        assert_eq!(record.overall_progress, 0.0);
        assert_eq!(record.version, 0);
    }
}

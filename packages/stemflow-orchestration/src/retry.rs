//! Retry helpers
//!
//! - `BackoffPolicy`: delay before retry N of a transiently failed stage
//! - `update_job`: read → mutate → compare-and-swap, retried a bounded number
//!   of times on version conflicts

use std::time::Duration;

use stemflow_storage::{ErrorKind, JobId, JobRecord, JobStore, StorageError};
use tracing::warn;

use crate::config::BackoffConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial_delay_ms: u64,
    multiplier: f64,
    max_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_delay_ms,
            multiplier: config.multiplier,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Delay before `retry` (1-based): `initial * multiplier^(retry - 1)`, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay_ms as f64;
        for _ in 1..retry {
            delay *= self.multiplier;
            // Cap inside the loop so large retry numbers cannot overflow
            delay = delay.min(self.max_delay_ms as f64);
        }
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

/// Apply `mutate` to the latest record and write it back with compare-and-swap
///
/// `mutate` returns `Ok(false)` when no write is needed; the (unchanged)
/// record is then not written and `Ok(None)` is returned. Version conflicts
/// re-read and reapply up to `max_attempts` times before surfacing a store
/// error. Errors from `mutate` abort immediately.
pub async fn update_job<F>(
    store: &dyn JobStore,
    job_id: &JobId,
    max_attempts: u32,
    mut mutate: F,
) -> Result<Option<JobRecord>>
where
    F: FnMut(&mut JobRecord) -> Result<bool> + Send,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let mut record = store.read(job_id).await?;
        let expected = record.version;
        if !mutate(&mut record)? {
            return Ok(None);
        }
        match store.compare_and_swap(job_id, expected, record).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(e) if e.is_version_conflict() => {
                warn!(job_id = %job_id, attempt, "version conflict, re-reading job record");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StorageError::new(
        ErrorKind::Unavailable,
        format!(
            "Gave up updating job {} after {} conflicting writes",
            job_id, max_attempts
        ),
    )
    .into())
}

//! Admission control
//!
//! A fixed-size semaphore gates QUEUED → RUNNING. Permits are keyed by job id
//! so that releasing is idempotent: the worker, the reaper and the
//! coordinator's rescan may all try to release the same job.

use std::sync::Arc;

use dashmap::DashMap;
use stemflow_storage::JobId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    permits: DashMap<JobId, OwnedSemaphorePermit>,
    capacity: usize,
}

impl AdmissionControl {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            permits: DashMap::new(),
            capacity,
        }
    }

    /// Take a slot for `job_id` without waiting; true if the job holds one
    pub fn try_acquire(&self, job_id: JobId) -> bool {
        if self.permits.contains_key(&job_id) {
            return true;
        }
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.permits.insert(job_id, permit);
                true
            }
            Err(_) => false,
        }
    }

    /// Return the job's slot; false if it held none
    pub fn release(&self, job_id: &JobId) -> bool {
        self.permits.remove(job_id).is_some()
    }

    pub fn holds(&self, job_id: &JobId) -> bool {
        self.permits.contains_key(job_id)
    }

    pub fn held_jobs(&self) -> Vec<JobId> {
        self.permits.iter().map(|entry| *entry.key()).collect()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

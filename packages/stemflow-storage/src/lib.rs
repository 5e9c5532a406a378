//! stemflow-storage - Job Store for the stemflow audio pipeline
//!
//! > One versioned record per job; every writer goes through compare-and-swap.
//!
//! ## Core Principles
//!
//! 1. **Injected, never ambient**: components receive an `Arc<dyn JobStore>`
//! 2. **Optimistic concurrency**: `compare_and_swap(job_id, expected_version, next)`
//! 3. **Retention**: terminal records stay readable until `retain_until`, then
//!    the reaper deletes them
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stemflow_storage::{InMemoryJobStore, JobStore, StatusFilter};
//!
//! let store = InMemoryJobStore::new();
//! let job_id = store.create("/media/song.mp3", serde_json::json!({}), ttl).await?;
//!
//! // Read-modify-CAS
//! let mut record = store.read(&job_id).await?;
//! let expected = record.version;
//! record.cancelled = true;
//! store.compare_and_swap(&job_id, expected, record).await?;
//!
//! let queued = store.list(StatusFilter::NonTerminal).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    ArtifactRef, FailureKind, JobError, JobId, JobRecord, JobResultsView, JobStats, JobStatus,
    JobStatusView, JobStore, StageClaim, StageId, StageTiming, StatusFilter,
};
pub use infrastructure::InMemoryJobStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteJobStore;

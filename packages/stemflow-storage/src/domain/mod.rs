//! Domain layer for the job store
//!
//! # Core Principles
//!
//! 1. **Single Source of Truth**: the job record in the store is authoritative;
//!    every component re-reads it before acting.
//! 2. **Versioned Writes**: every successful write bumps `version`; writers
//!    supply the version they read and stale writers are rejected.
//! 3. **No In-place Replace**: mutation is read → modify copy → compare-and-swap.
//!
//! # Domain Models
//!
//! - `JobRecord`: one submitted media item and its pipeline state
//! - `StageId`: the closed, ordered set of pipeline stages
//! - `JobStatus`: coarse lifecycle status (RUNNING carries `current_stage`)
//! - `JobError`: failure descriptor (kind + message + stage)
//!
//! # Port Trait
//!
//! - `JobStore`: primary storage abstraction
//!
//! # Examples
//!
//! ```rust,ignore
//! use stemflow_storage::domain::{JobStore, StatusFilter};
//!
//! async fn example(store: impl JobStore) -> Result<()> {
//!     let job_id = store.create("/media/song.mp3", serde_json::json!({}), ttl).await?;
//!
//!     let mut record = store.read(&job_id).await?;
//!     let expected = record.version;
//!     record.cancelled = true;
//!     store.compare_and_swap(&job_id, expected, record).await?;
//!
//!     let running = store.list(StatusFilter::NonTerminal).await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════

/// Opaque job identifier, generated at creation and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| StorageError::serialization(format!("Invalid job id '{}': {}", s, e)))
    }
}

/// Pipeline stage identifier
///
/// Stages run strictly in declaration order: Separation → Transcription →
/// BeatAnalysis. The ordinal doubles as the task-queue `stage_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Separation,
    Transcription,
    BeatAnalysis,
}

impl StageId {
    pub const ALL: [StageId; 3] = [
        StageId::Separation,
        StageId::Transcription,
        StageId::BeatAnalysis,
    ];

    pub fn first() -> Self {
        StageId::Separation
    }

    pub fn index(&self) -> usize {
        match self {
            StageId::Separation => 0,
            StageId::Transcription => 1,
            StageId::BeatAnalysis => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn next(&self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Separation => "separation",
            StageId::Transcription => "transcription",
            StageId::BeatAnalysis => "beat_analysis",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "separation" => Ok(StageId::Separation),
            "transcription" => Ok(StageId::Transcription),
            "beat_analysis" => Ok(StageId::BeatAnalysis),
            _ => Err(StorageError::serialization(format!("Invalid stage: {}", s))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Status & Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Overall job status
///
/// RUNNING_STAGE(i) is represented as `Running` plus `JobRecord::current_stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            _ => Err(StorageError::serialization(format!("Invalid status: {}", s))),
        }
    }
}

/// Failure classification recorded on FAILED jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Bad input reference
    #[serde(rename = "ValidationError")]
    Validation,
    /// Retryable failure whose retry budget ran out
    #[serde(rename = "TransientError")]
    Transient,
    /// Corrupt/unsupported input detected mid-stage
    #[serde(rename = "FatalError")]
    Fatal,
    /// No progress for longer than the stage stall timeout
    StallTimeout,
    /// Job outlived its expiry deadline
    Expired,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "ValidationError",
            FailureKind::Transient => "TransientError",
            FailureKind::Fatal => "FatalError",
            FailureKind::StallTimeout => "StallTimeout",
            FailureKind::Expired => "Expired",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error descriptor, present only when status is FAILED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    pub stage: Option<StageId>,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>, stage: Option<StageId>) -> Self {
        Self {
            kind,
            message: message.into(),
            stage,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stage bookkeeping
// ═══════════════════════════════════════════════════════════════════════════

/// Reference to a committed stage output (directory or object URI)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn uri(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock timing of a successful stage invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StageTiming {
    pub fn new(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            started_at,
            finished_at,
            duration_ms,
        }
    }
}

/// Exclusive claim on the current stage attempt
///
/// Taken by compare-and-swap before an adapter runs, so a redelivered message
/// for the same attempt can never start a second execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageClaim {
    pub attempt: u32,
    pub worker: String,
    pub claimed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════

/// Persisted job record
///
/// # Invariants
///
/// - `version` increases strictly on every successful write (the store sets it)
/// - `artifacts[stage]` is present iff that stage completed
/// - `error` is present iff `status == Failed`
/// - `current_stage` is `Some` whenever `status == Running`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub current_stage: Option<StageId>,
    pub stage_progress: BTreeMap<StageId, f64>,
    pub overall_progress: f64,
    pub input_ref: String,
    /// Processing options handed verbatim to stage adapters
    #[serde(default)]
    pub options: serde_json::Value,
    pub artifacts: BTreeMap<StageId, ArtifactRef>,
    pub error: Option<JobError>,
    pub retry_counts: BTreeMap<StageId, u32>,
    #[serde(default)]
    pub stage_timings: BTreeMap<StageId, StageTiming>,
    #[serde(default)]
    pub claim: Option<StageClaim>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub expires_at: DateTime<Utc>,
    /// Hidden from reads after this instant; physically deleted by the reaper
    #[serde(default)]
    pub retain_until: Option<DateTime<Utc>>,
    pub cancelled: bool,
    #[serde(default)]
    pub storage_reclaimed: bool,
}

impl JobRecord {
    /// Create a fresh QUEUED record at version 0
    ///
    /// # Examples
    ///
    /// ```rust
    /// use stemflow_storage::domain::{JobRecord, JobStatus};
    ///
    /// let record = JobRecord::new("/media/song.mp3", serde_json::json!({}), chrono::Duration::hours(1)).unwrap();
    /// assert_eq!(record.status, JobStatus::Queued);
    /// assert_eq!(record.version, 0);
    /// ```
    ///
    /// # Errors
    ///
    /// `Config` if `ttl` is not positive or the deadline overflows the calendar
    pub fn new(input_ref: impl Into<String>, options: serde_json::Value, ttl: Duration) -> Result<Self> {
        let now = Utc::now();
        if ttl <= Duration::zero() {
            return Err(StorageError::config(format!("job ttl must be positive, got {}", ttl)));
        }
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| StorageError::config(format!("job ttl {} overflows the expiry deadline", ttl)))?;
        Ok(Self {
            job_id: JobId::new(),
            status: JobStatus::Queued,
            current_stage: None,
            stage_progress: StageId::ALL.iter().map(|s| (*s, 0.0)).collect(),
            overall_progress: 0.0,
            input_ref: input_ref.into(),
            options,
            artifacts: BTreeMap::new(),
            error: None,
            retry_counts: StageId::ALL.iter().map(|s| (*s, 0)).collect(),
            stage_timings: BTreeMap::new(),
            claim: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            version: 0,
            expires_at,
            retain_until: None,
            cancelled: false,
            storage_reclaimed: false,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Persisted attempt counter for a stage
    pub fn attempt(&self, stage: StageId) -> u32 {
        self.retry_counts.get(&stage).copied().unwrap_or(0)
    }

    pub fn stage_progress(&self, stage: StageId) -> f64 {
        self.stage_progress.get(&stage).copied().unwrap_or(0.0)
    }

    /// Whether the record is still visible to readers at `now`
    pub fn is_retained_at(&self, now: DateTime<Utc>) -> bool {
        self.retain_until.map_or(true, |until| now <= until)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.job_id,
            status: self.status,
            overall_progress: self.overall_progress,
            current_stage: self.current_stage,
            error: self.error.clone(),
        }
    }

    /// Artifact listing, only available once the job completed
    pub fn results_view(&self) -> Option<JobResultsView> {
        if self.status != JobStatus::Completed {
            return None;
        }
        Some(JobResultsView {
            job_id: self.job_id,
            artifacts: self
                .artifacts
                .iter()
                .map(|(stage, artifact)| (*stage, artifact.uri().to_string()))
                .collect(),
        })
    }
}

/// Status query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub overall_progress: f64,
    pub current_stage: Option<StageId>,
    pub error: Option<JobError>,
}

/// Results query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResultsView {
    pub job_id: JobId,
    pub artifacts: BTreeMap<StageId, String>,
}

/// Status predicate for listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Any,
    NonTerminal,
    Terminal,
    Is(JobStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: JobStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::NonTerminal => !status.is_terminal(),
            StatusFilter::Terminal => status.is_terminal(),
            StatusFilter::Is(expected) => *expected == status,
        }
    }
}

/// Job counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub by_status: BTreeMap<JobStatus, usize>,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.total += 1;
        *self.by_status.entry(status).or_insert(0) += 1;
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: JobStore
// ═══════════════════════════════════════════════════════════════════════════

/// Durable job storage with optimistic concurrency
///
/// # Core Operations
///
/// 1. **Creation**: `insert` / `create` write version 0 records
/// 2. **Reads**: `read` (hides records past retention), `list`/`scan` snapshots
/// 3. **Mutation**: `compare_and_swap` only, never blind overwrite
/// 4. **Retention**: `delete` removes records for good
///
/// # Implementations
///
/// - `InMemoryJobStore`: DashMap-backed, for tests and single-process runs
/// - `SqliteJobStore`: SQLite adapter (feature `sqlite`)
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record
    ///
    /// # Errors
    ///
    /// - `DuplicateJob` if the id already exists
    /// - `Database`/`Unavailable` if the backing store is unreachable
    async fn insert(&self, record: JobRecord) -> Result<()>;

    /// Allocate a fresh id and write the initial QUEUED record
    async fn create(
        &self,
        input_ref: &str,
        options: serde_json::Value,
        ttl: Duration,
    ) -> Result<JobId> {
        let record = JobRecord::new(input_ref, options, ttl)?;
        let job_id = record.job_id;
        self.insert(record).await?;
        Ok(job_id)
    }

    /// Read a record
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if absent or past its retention window
    async fn read(&self, job_id: &JobId) -> Result<JobRecord>;

    /// Replace the record with `next` iff the stored version equals `expected_version`
    ///
    /// On success the stored (and returned) record has `version =
    /// expected_version + 1` and a fresh `updated_at`.
    ///
    /// # Errors
    ///
    /// - `VersionConflict` if another writer got there first; re-read and reapply
    /// - `JobNotFound` if the record is gone
    async fn compare_and_swap(
        &self,
        job_id: &JobId,
        expected_version: u64,
        next: JobRecord,
    ) -> Result<JobRecord>;

    /// Snapshot of job ids whose status matches `filter`
    ///
    /// Not linearizable with concurrent writes.
    async fn list(&self, filter: StatusFilter) -> Result<Vec<JobId>>;

    /// Snapshot of full records whose status matches `filter`
    ///
    /// Includes records past retention so the reaper can purge them.
    async fn scan(&self, filter: StatusFilter) -> Result<Vec<JobRecord>>;

    /// Remove a record; returns whether anything was removed
    async fn delete(&self, job_id: &JobId) -> Result<bool>;

    /// Count records per status
    async fn stats(&self) -> Result<JobStats>;
}

/// Stamp the store-owned fields of a successful compare-and-swap
pub(crate) fn stamp_write(mut next: JobRecord, job_id: &JobId, expected_version: u64) -> JobRecord {
    next.job_id = *job_id;
    next.version = expected_version + 1;
    next.updated_at = Utc::now();
    next
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

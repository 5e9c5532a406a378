/*
 * stemflow Orchestration - Audio Job Pipeline Engine
 *
 * Runs each submitted media file through Separation -> Transcription ->
 * BeatAnalysis with at-least-once delivery and exactly-once completion.
 *
 * Architecture:
 * - Job Store with compare-and-swap (stemflow-storage)
 * - Pipeline Coordinator (state machine, admission, retries)
 * - Task Queue (at-least-once, delayed redelivery)
 * - Worker Pool + Progress Reporter
 * - Reaper (liveness, expiry, retention)
 * - Stage Adapters (pluggable, external commands by default)
 */

// Public modules
pub mod admission;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod stages;
pub mod validation;
pub mod worker;
pub mod workspace;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use admission::AdmissionControl;
pub use config::{ConfigError, DispatchMode, EngineConfig};
pub use coordinator::{ClaimOutcome, PipelineCoordinator, RescanReport};
pub use engine::Engine;
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use job::{check_delivery, DeliveryCheck, JobStateMachine, StageWeights};
pub use metrics::EngineMetrics;
pub use pipeline::{
    CancellationCheck, StageAdapter, StageClock, StageContext, StageFailure, StageInput, StageResult,
    StageSet, StageSuccess,
};
pub use progress::{ProgressHandle, ProgressReporter};
pub use queue::{Delivery, InMemoryTaskQueue, TaskMessage, TaskQueue};
pub use reaper::{Reaper, SweepReport};
pub use retry::BackoffPolicy;
pub use stages::{command_stage_set, BeatAnalysisStage, SeparationStage, TranscriptionStage};
pub use validation::validate_input;
pub use worker::WorkerPool;
pub use workspace::ArtifactWorkspace;

pub use stemflow_storage::{
    ArtifactRef, FailureKind, JobError, JobId, JobRecord, JobResultsView, JobStats, JobStatus, JobStatusView,
    JobStore, StageId, StatusFilter,
};

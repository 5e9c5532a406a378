//! Stage adapter interface
//!
//! Each pipeline stage is a `StageAdapter`. The engine hands it the input
//! reference, the artifacts of completed upstream stages, a staging directory
//! to write into, a cancellation check and a progress handle. The adapter
//! answers with a `StageSuccess` or a classified `StageFailure`; the engine
//! commits the staging directory only on success.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stemflow_storage::{ArtifactRef, JobId, StageId, StageTiming};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::progress::ProgressHandle;

/// Stage input
#[derive(Debug, Clone)]
pub struct StageInput {
    pub job_id: JobId,
    pub stage: StageId,
    pub attempt: u32,
    /// Source media reference as submitted
    pub input_ref: String,
    /// Committed artifacts of the stages before this one
    pub upstream: BTreeMap<StageId, ArtifactRef>,
    /// Per-job processing options, passed through verbatim
    pub options: serde_json::Value,
    /// Staging directory for this attempt; empty when the adapter starts
    pub output_dir: PathBuf,
}

/// Cooperative cancellation check
#[derive(Clone, Default)]
pub struct CancellationCheck {
    token: CancellationToken,
}

impl CancellationCheck {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Stage context passed to adapters
#[derive(Clone)]
pub struct StageContext {
    pub cancel: CancellationCheck,
    pub progress: ProgressHandle,
}

impl StageContext {
    pub fn new(cancel: CancellationCheck, progress: ProgressHandle) -> Self {
        Self { cancel, progress }
    }

    /// Context that is never cancelled and reports nowhere
    pub fn detached() -> Self {
        Self {
            cancel: CancellationCheck::default(),
            progress: ProgressHandle::detached(),
        }
    }
}

/// Successful stage result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSuccess {
    /// Files written, relative to the output directory
    pub outputs: Vec<PathBuf>,
    pub timing: StageTiming,
}

/// Classified stage failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl StageFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Fatal,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            category: ErrorCategory::Cancelled,
            message: "cancelled".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Cancelled
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

pub type StageResult = std::result::Result<StageSuccess, StageFailure>;

/// Stage adapter trait
#[async_trait]
pub trait StageAdapter: Send + Sync {
    /// Stage identifier
    fn stage_id(&self) -> StageId;

    /// Run one attempt of the stage
    ///
    /// Must poll `ctx.cancel` and return `StageFailure::cancelled()` promptly
    /// once it is set. Anything written outside `input.output_dir` is not
    /// cleaned up by the engine.
    async fn execute(&self, input: StageInput, ctx: StageContext) -> StageResult;
}

/// Timing helper for adapters
pub struct StageClock {
    started_at: chrono::DateTime<Utc>,
}

impl StageClock {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }

    pub fn stop(&self) -> StageTiming {
        StageTiming::new(self.started_at, Utc::now())
    }
}

/// The closed set of stage adapters, one per stage
#[derive(Clone)]
pub struct StageSet {
    separation: Arc<dyn StageAdapter>,
    transcription: Arc<dyn StageAdapter>,
    beat_analysis: Arc<dyn StageAdapter>,
}

impl StageSet {
    /// # Errors
    ///
    /// `Config` if an adapter is plugged into the wrong slot
    pub fn new(
        separation: Arc<dyn StageAdapter>,
        transcription: Arc<dyn StageAdapter>,
        beat_analysis: Arc<dyn StageAdapter>,
    ) -> Result<Self> {
        for (slot, adapter) in [
            (StageId::Separation, &separation),
            (StageId::Transcription, &transcription),
            (StageId::BeatAnalysis, &beat_analysis),
        ] {
            if adapter.stage_id() != slot {
                return Err(OrchestratorError::Config(crate::config::ConfigError::Custom(
                    format!(
                        "adapter for '{}' registered in the '{}' slot",
                        adapter.stage_id(),
                        slot
                    ),
                )));
            }
        }
        Ok(Self {
            separation,
            transcription,
            beat_analysis,
        })
    }

    /// Adapter for `stage`
    pub fn adapter(&self, stage: StageId) -> &Arc<dyn StageAdapter> {
        match stage {
            StageId::Separation => &self.separation,
            StageId::Transcription => &self.transcription,
            StageId::BeatAnalysis => &self.beat_analysis,
        }
    }
}

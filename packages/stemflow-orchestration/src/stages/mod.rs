// Stage implementations
pub mod beat_analysis;
pub mod command;
pub mod separation;
pub mod transcription;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use stemflow_storage::StageId;

use crate::config::{ConfigError, StagesSection};
use crate::error::Result;
use crate::pipeline::{StageFailure, StageSet};

// Re-exports
pub use beat_analysis::{BeatAnalysisStage, BeatGrid};
pub use command::CommandRunner;
pub use separation::{SeparationStage, STEMS};
pub use transcription::{Transcript, TranscriptSegment, TranscriptionStage, WordTiming};

/// Build the command-backed stage set from configuration
///
/// # Errors
///
/// `Config` if any stage has no `command`
pub fn command_stage_set(stages: &StagesSection) -> Result<StageSet> {
    let command = |stage: StageId| {
        stages.descriptor(stage).command.clone().ok_or_else(|| {
            ConfigError::Custom(format!("stages.{}.command is required to run the engine", stage))
        })
    };

    StageSet::new(
        Arc::new(SeparationStage::new(command(StageId::Separation)?)),
        Arc::new(TranscriptionStage::new(command(StageId::Transcription)?)),
        Arc::new(BeatAnalysisStage::new(command(StageId::BeatAnalysis)?)),
    )
}

/// Read a JSON document a stage tool wrote; missing or corrupt output is fatal
pub(crate) async fn load_json_output<T: DeserializeOwned>(path: &Path) -> std::result::Result<T, StageFailure> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StageFailure::fatal(format!("missing output {}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StageFailure::fatal(format!("corrupt output {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    #[test]
    fn test_command_stage_set_requires_commands() {
        let mut stages = StagesSection::default();
        assert!(command_stage_set(&stages).is_err());

        for stage in StageId::ALL {
            stages.descriptor_mut(stage).command = Some(CommandSpec::new("true", vec![]));
        }
        let set = command_stage_set(&stages).unwrap();
        assert_eq!(set.adapter(StageId::BeatAnalysis).stage_id(), StageId::BeatAnalysis);
    }
}

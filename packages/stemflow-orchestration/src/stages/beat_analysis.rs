use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stemflow_storage::StageId;
use tracing::info;

use crate::config::CommandSpec;
use crate::pipeline::{StageAdapter, StageClock, StageContext, StageFailure, StageInput, StageResult, StageSuccess};
use crate::stages::command::CommandRunner;
use crate::stages::load_json_output;

pub const BEATS_FILE: &str = "beats.json";

/// Beat grid written by the beat tracker (times in seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatGrid {
    pub tempo_bpm: f64,
    pub beats: Vec<f64>,
    #[serde(default)]
    pub downbeats: Vec<f64>,
    #[serde(default)]
    pub time_signature: Option<u32>,
}

impl BeatGrid {
    pub async fn load(path: &Path) -> Result<Self, StageFailure> {
        let grid: BeatGrid = load_json_output(path).await?;
        grid.validate().map_err(StageFailure::fatal)?;
        Ok(grid)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.tempo_bpm.is_finite() && self.tempo_bpm > 0.0) {
            return Err(format!("invalid tempo {}", self.tempo_bpm));
        }
        if let Some(0) = self.time_signature {
            return Err("time signature must be positive".to_string());
        }
        for (name, times) in [("beats", &self.beats), ("downbeats", &self.downbeats)] {
            if times.iter().any(|t| !t.is_finite() || *t < 0.0) {
                return Err(format!("{} contain invalid times", name));
            }
            if times.windows(2).any(|w| w[1] < w[0]) {
                return Err(format!("{} are not sorted", name));
            }
        }
        Ok(())
    }
}

/// Beat analysis (stage 2, last)
pub struct BeatAnalysisStage {
    runner: CommandRunner,
}

impl BeatAnalysisStage {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            runner: CommandRunner::new(StageId::BeatAnalysis, spec),
        }
    }
}

#[async_trait]
impl StageAdapter for BeatAnalysisStage {
    fn stage_id(&self) -> StageId {
        StageId::BeatAnalysis
    }

    async fn execute(&self, input: StageInput, ctx: StageContext) -> StageResult {
        let clock = StageClock::start();
        self.runner.run(&input, &ctx).await?;

        let grid = BeatGrid::load(&input.output_dir.join(BEATS_FILE)).await?;
        ctx.progress.report(1.0);
        info!(
            job_id = %input.job_id,
            tempo_bpm = grid.tempo_bpm,
            beats = grid.beats.len(),
            "beat analysis finished"
        );

        Ok(StageSuccess {
            outputs: vec![PathBuf::from(BEATS_FILE)],
            timing: clock.stop(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_grid() {
        let grid: BeatGrid = serde_json::from_str(r#"{"tempo_bpm": 120.0, "beats": [0.5, 1.0, 1.5]}"#).unwrap();
        grid.validate().unwrap();
        assert!(grid.downbeats.is_empty());
        assert_eq!(grid.time_signature, None);
    }

    #[test]
    fn test_invalid_grids() {
        let mut grid = BeatGrid {
            tempo_bpm: 0.0,
            beats: vec![],
            downbeats: vec![],
            time_signature: Some(4),
        };
        assert!(grid.validate().is_err());

        grid.tempo_bpm = 98.0;
        grid.beats = vec![1.0, 0.5];
        assert!(grid.validate().unwrap_err().contains("not sorted"));

        grid.beats = vec![0.5, 1.0];
        grid.time_signature = Some(0);
        assert!(grid.validate().is_err());
    }
}

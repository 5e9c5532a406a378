use std::path::PathBuf;

use async_trait::async_trait;
use stemflow_storage::StageId;
use tracing::info;

use crate::config::CommandSpec;
use crate::pipeline::{StageAdapter, StageClock, StageContext, StageFailure, StageInput, StageResult, StageSuccess};
use crate::stages::command::CommandRunner;

/// Stems every separation run must produce
pub const STEMS: [&str; 4] = ["vocals.wav", "drums.wav", "bass.wav", "other.wav"];

/// Source separation (stage 0) - splits the input into four stems
pub struct SeparationStage {
    runner: CommandRunner,
}

impl SeparationStage {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            runner: CommandRunner::new(StageId::Separation, spec),
        }
    }
}

#[async_trait]
impl StageAdapter for SeparationStage {
    fn stage_id(&self) -> StageId {
        StageId::Separation
    }

    async fn execute(&self, input: StageInput, ctx: StageContext) -> StageResult {
        let clock = StageClock::start();
        self.runner.run(&input, &ctx).await?;

        let mut outputs = Vec::with_capacity(STEMS.len());
        for stem in STEMS {
            let path = input.output_dir.join(stem);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => outputs.push(PathBuf::from(stem)),
                Ok(_) => return Err(StageFailure::fatal(format!("separator wrote an empty {}", stem))),
                Err(_) => return Err(StageFailure::fatal(format!("separator produced no {}", stem))),
            }
        }

        ctx.progress.report(1.0);
        info!(job_id = %input.job_id, stems = outputs.len(), "separation finished");
        Ok(StageSuccess {
            outputs,
            timing: clock.stop(),
        })
    }
}

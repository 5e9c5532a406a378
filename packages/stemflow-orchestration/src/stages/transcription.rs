use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stemflow_storage::StageId;
use tracing::info;

use crate::config::CommandSpec;
use crate::pipeline::{StageAdapter, StageClock, StageContext, StageFailure, StageInput, StageResult, StageSuccess};
use crate::stages::command::CommandRunner;
use crate::stages::load_json_output;

pub const TRANSCRIPT_FILE: &str = "transcript.json";

/// Transcript with timestamps, as written by the transcription tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub language: String,
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Seconds from the start of the track
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<WordTiming>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
}

impl Transcript {
    pub async fn load(path: &Path) -> Result<Self, StageFailure> {
        let transcript: Transcript = load_json_output(path).await?;
        transcript.validate().map_err(StageFailure::fatal)?;
        Ok(transcript)
    }

    /// Segments must have sane, ordered time ranges
    pub fn validate(&self) -> Result<(), String> {
        let mut previous_start = 0.0;
        for (i, segment) in self.segments.iter().enumerate() {
            if !(segment.start.is_finite() && segment.end.is_finite()) || segment.start < 0.0 {
                return Err(format!("segment {} has an invalid time range", i));
            }
            if segment.end < segment.start {
                return Err(format!("segment {} ends before it starts", i));
            }
            if segment.start < previous_start {
                return Err(format!("segment {} is out of order", i));
            }
            if segment.words.iter().any(|w| w.end < w.start) {
                return Err(format!("segment {} has a word ending before it starts", i));
            }
            previous_start = segment.start;
        }
        Ok(())
    }
}

/// Vocal transcription (stage 1) - usually fed the separated vocals stem
pub struct TranscriptionStage {
    runner: CommandRunner,
}

impl TranscriptionStage {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            runner: CommandRunner::new(StageId::Transcription, spec),
        }
    }
}

#[async_trait]
impl StageAdapter for TranscriptionStage {
    fn stage_id(&self) -> StageId {
        StageId::Transcription
    }

    async fn execute(&self, input: StageInput, ctx: StageContext) -> StageResult {
        let clock = StageClock::start();
        self.runner.run(&input, &ctx).await?;

        let transcript = Transcript::load(&input.output_dir.join(TRANSCRIPT_FILE)).await?;
        ctx.progress.report(1.0);
        info!(
            job_id = %input.job_id,
            language = %transcript.language,
            segments = transcript.segments.len(),
            "transcription finished"
        );

        Ok(StageSuccess {
            outputs: vec![PathBuf::from(TRANSCRIPT_FILE)],
            timing: clock.stop(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end,
            text: "la".to_string(),
            words: vec![],
        }
    }

    #[test]
    fn test_parse_transcript() {
        let json = r#"{
            "language": "en",
            "text": "hello world",
            "segments": [
                {"start": 0.0, "end": 1.2, "text": "hello",
                 "words": [{"word": "hello", "start": 0.1, "end": 0.9, "probability": 0.98}]},
                {"start": 1.2, "end": 2.0, "text": "world"}
            ]
        }"#;
        let transcript: Transcript = serde_json::from_str(json).unwrap();
        transcript.validate().unwrap();
        assert_eq!(transcript.segments[0].words.len(), 1);
        assert!(transcript.segments[1].words.is_empty());
    }

    #[test]
    fn test_invalid_segments() {
        let mut transcript = Transcript {
            language: "en".to_string(),
            text: String::new(),
            segments: vec![segment(1.0, 0.5)],
        };
        assert!(transcript.validate().is_err());

        transcript.segments = vec![segment(2.0, 3.0), segment(1.0, 1.5)];
        assert!(transcript.validate().unwrap_err().contains("out of order"));
    }
}

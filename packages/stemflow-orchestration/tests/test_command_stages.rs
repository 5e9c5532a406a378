//! Command-backed stages driven through the engine with `sh` stand-ins for
//! the separation, transcription and beat tracking tools
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use stemflow_orchestration::config::{CommandSpec, EngineConfig};
use stemflow_orchestration::stages::{BeatGrid, Transcript, STEMS};
use stemflow_orchestration::{command_stage_set, Engine, JobId, JobStatus, JobStatusView};
use stemflow_storage::{FailureKind, InMemoryJobStore, JobStore, StageId};

/// Write `script` next to the jobs and run it as `sh <script> <output_dir> <input> [upstream]`
fn sh(root: &Path, stage: StageId, script: &str) -> CommandSpec {
    let path = root.join(format!("{}.sh", stage));
    std::fs::write(&path, script).unwrap();

    let mut args = vec![
        path.to_string_lossy().into_owned(),
        "{output_dir}".to_string(),
        "{input}".to_string(),
    ];
    if stage == StageId::Transcription {
        args.push("{artifact:separation}".to_string());
    }
    CommandSpec::new("sh", args)
}

const SEPARATE: &str = r#"
echo progress=0.25
for stem in vocals drums bass other; do echo "$2" > "$1/$stem.wav"; done
echo progress=1
"#;

const TRANSCRIBE: &str = r#"
test -f "$3/vocals.wav" || exit 3
cat > "$1/transcript.json" <<EOF
{"language": "en", "text": "la la", "segments": [{"start": 0.0, "end": 1.5, "text": "la la"}]}
EOF
"#;

const BEATS: &str = r#"
echo '{"tempo_bpm": 120.0, "beats": [0.5, 1.0, 1.5, 2.0], "time_signature": 4}' > "$1/beats.json"
"#;

fn config(root: &Path, separation: &str, transcription: &str, beats: &str) -> EngineConfig {
    let mut config = EngineConfig::for_tests(1);
    config.storage.root = root.join("jobs");
    config.stages.separation.command = Some(sh(root, StageId::Separation, separation));
    config.stages.transcription.command = Some(sh(root, StageId::Transcription, transcription));
    config.stages.beat_analysis.command = Some(sh(root, StageId::BeatAnalysis, beats));
    config
}

async fn run_job(config: EngineConfig, input: &Path) -> (Engine, JobId, JobStatusView) {
    let stages = command_stage_set(&config.stages).unwrap();
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let mut engine = Engine::new(config, store, stages);
    engine.start().await.unwrap();

    let id = engine
        .coordinator()
        .submit(input.to_str().unwrap(), serde_json::json!({}))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let status = engine.coordinator().status(&id).await.unwrap();
            if status.status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish");
    (engine, id, status)
}

fn write_input(dir: &Path) -> std::path::PathBuf {
    let input = dir.join("track.wav");
    std::fs::write(&input, b"RIFF....WAVE").unwrap();
    input
}

#[tokio::test]
async fn test_command_pipeline_completes() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path());
    let (engine, id, status) = run_job(config(dir.path(), SEPARATE, TRANSCRIBE, BEATS), &input).await;

    assert_eq!(status.status, JobStatus::Completed);
    let results = engine.coordinator().results(&id).await.unwrap();
    let separation = Path::new(&results.artifacts[&StageId::Separation]).to_path_buf();
    for stem in STEMS {
        assert!(separation.join(stem).is_file(), "missing stem {}", stem);
    }

    let transcript = Transcript::load(&Path::new(&results.artifacts[&StageId::Transcription]).join("transcript.json"))
        .await
        .unwrap();
    assert_eq!(transcript.language, "en");
    assert_eq!(transcript.segments.len(), 1);

    let grid = BeatGrid::load(&Path::new(&results.artifacts[&StageId::BeatAnalysis]).join("beats.json"))
        .await
        .unwrap();
    assert_eq!(grid.tempo_bpm, 120.0);
    assert_eq!(grid.beats.len(), 4);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_tempfail_exit_code_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path());
    let marker = dir.path().join("beats-tried");
    let flaky_beats = format!(
        r#"
if [ ! -f "{marker}" ]; then touch "{marker}"; echo "tracker warming up" >&2; exit 75; fi
{BEATS}"#,
        marker = marker.display(),
        BEATS = BEATS
    );
    let (engine, id, status) = run_job(config(dir.path(), SEPARATE, TRANSCRIBE, &flaky_beats), &input).await;

    assert_eq!(status.status, JobStatus::Completed);
    let record = engine.coordinator().store().read(&id).await.unwrap();
    assert_eq!(record.attempt(StageId::BeatAnalysis), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_nonzero_exit_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path());
    let broken = r#"echo "CUDA out of memory" >&2; exit 2"#;
    let (engine, _id, status) = run_job(config(dir.path(), SEPARATE, broken, BEATS), &input).await;

    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, FailureKind::Fatal);
    assert_eq!(error.stage, Some(StageId::Transcription));
    assert!(error.message.contains("CUDA out of memory"), "{}", error.message);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_missing_output_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path());
    let lazy = "echo progress=1";
    let (engine, _id, status) = run_job(config(dir.path(), lazy, TRANSCRIBE, BEATS), &input).await;

    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert_eq!(error.kind, FailureKind::Fatal);
    assert_eq!(error.stage, Some(StageId::Separation));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_lingering_output_pipe_does_not_stall_stage() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path());
    // The background sleep inherits stdout and stderr, so neither reaches EOF at exit
    let lingering = format!("{}\nsleep 5 &\necho progress=1", BEATS);
    let started = std::time::Instant::now();
    let (engine, id, status) = run_job(config(dir.path(), SEPARATE, TRANSCRIBE, &lingering), &input).await;

    assert_eq!(status.status, JobStatus::Completed);
    assert!(started.elapsed() < Duration::from_secs(15));
    let record = engine.coordinator().store().read(&id).await.unwrap();
    assert_eq!(record.attempt(StageId::BeatAnalysis), 0);

    engine.shutdown().await;
}

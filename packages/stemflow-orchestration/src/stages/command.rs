//! Child-process runner shared by the command-backed stages
//!
//! The external inference tool is started with templated arguments:
//!
//! | placeholder          | value                                      |
//! |----------------------|--------------------------------------------|
//! | `{input}`            | submitted input reference                  |
//! | `{output_dir}`       | staging directory of this attempt          |
//! | `{job_id}`           | job id                                     |
//! | `{stage}`            | stage name                                 |
//! | `{artifact:<stage>}` | committed artifact of an upstream stage    |
//!
//! Lines `progress=<0..1>` on stdout are forwarded to the progress handle.
//! Exit 0 is success; a configured transient exit code or death by signal is
//! transient; anything else is fatal.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::CommandSpec;
use crate::pipeline::{StageContext, StageFailure, StageInput};
use stemflow_storage::StageId;

/// Lines of stderr kept for the failure message
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound for draining pipes after the child exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CommandRunner {
    stage: StageId,
    spec: CommandSpec,
}

impl CommandRunner {
    pub fn new(stage: StageId, spec: CommandSpec) -> Self {
        Self { stage, spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Expand argument templates for `input`
    pub fn render_args(&self, input: &StageInput) -> Result<Vec<String>, StageFailure> {
        self.spec
            .args
            .iter()
            .map(|template| render_template(template, input))
            .collect()
    }

    /// Run the tool to completion, honoring cancellation
    pub async fn run(&self, input: &StageInput, ctx: &StageContext) -> Result<(), StageFailure> {
        if ctx.cancel.is_cancelled() {
            return Err(StageFailure::cancelled());
        }
        let args = self.render_args(input)?;

        let mut command = Command::new(&self.spec.program);
        command
            .args(&args)
            .envs(&self.spec.env)
            .env("STEMFLOW_JOB_ID", input.job_id.to_string())
            .env("STEMFLOW_STAGE", self.stage.as_str())
            .env("STEMFLOW_ATTEMPT", input.attempt.to_string())
            .env("STEMFLOW_OPTIONS", input.options.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| self.spawn_failure(e))?;
        info!(
            job_id = %input.job_id,
            stage = %self.stage,
            attempt = input.attempt,
            program = %self.spec.program,
            "stage process started"
        );

        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(tail_lines(stderr, STDERR_TAIL_LINES)));
        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());

        let status = loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(stage = %self.stage, error = %e, "failed to kill stage process");
                    }
                    return Err(StageFailure::cancelled());
                }
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Ok(Some(line)) => self.forward_progress(&line, ctx),
                    Ok(None) | Err(_) => stdout = None,
                },
                status = child.wait() => {
                    break status.map_err(|e| StageFailure::transient(format!("waiting for {}: {}", self.spec.program, e)))?;
                }
            }
        };

        // Trailing progress lines written just before exit
        if stdout.is_some() {
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while let Ok(Some(line)) = next_line(&mut stdout).await {
                    self.forward_progress(&line, ctx);
                }
            })
            .await;
            if drained.is_err() {
                debug!(stage = %self.stage, timeout_ms = DRAIN_TIMEOUT.as_millis() as u64, "stdout drain timed out");
            }
        }

        let tail = match stderr_tail {
            Some(task) => match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(lines)) => lines,
                Ok(Err(e)) => {
                    debug!(stage = %self.stage, error = %e, "stderr reader failed");
                    Vec::new()
                }
                Err(_) => {
                    debug!(stage = %self.stage, timeout_ms = DRAIN_TIMEOUT.as_millis() as u64, "stderr drain timed out");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        self.classify_exit(status, &tail)
    }

    fn forward_progress(&self, line: &str, ctx: &StageContext) {
        match parse_progress(line) {
            Some(fraction) => ctx.progress.report(fraction),
            None => debug!(stage = %self.stage, line, "stage output"),
        }
    }

    fn spawn_failure(&self, err: io::Error) -> StageFailure {
        let message = format!("failed to start {}: {}", self.spec.program, err);
        match err.kind() {
            // Retrying cannot fix a missing or non-executable tool
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => StageFailure::fatal(message),
            _ => StageFailure::transient(message),
        }
    }

    fn classify_exit(&self, status: ExitStatus, stderr_tail: &[String]) -> Result<(), StageFailure> {
        let detail = if stderr_tail.is_empty() {
            String::new()
        } else {
            format!(": {}", stderr_tail.join("\n"))
        };

        match status.code() {
            Some(0) => Ok(()),
            Some(code) if self.spec.transient_exit_codes.contains(&code) => Err(StageFailure::transient(
                format!("{} exited with code {}{}", self.spec.program, code, detail),
            )),
            Some(code) => Err(StageFailure::fatal(format!(
                "{} exited with code {}{}",
                self.spec.program, code, detail
            ))),
            None => Err(StageFailure::transient(format!(
                "{} terminated by signal{}",
                self.spec.program, detail
            ))),
        }
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

async fn tail_lines<R: AsyncRead + Unpin>(reader: R, keep: usize) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(keep);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

/// Parse a `progress=<fraction>` line
pub fn parse_progress(line: &str) -> Option<f64> {
    let value = line.trim().strip_prefix("progress=")?;
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn render_template(template: &str, input: &StageInput) -> Result<String, StageFailure> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| StageFailure::fatal(format!("unterminated placeholder in '{}'", template)))?;
        let name = &after[..close];

        match name {
            "input" => out.push_str(&input.input_ref),
            "output_dir" => out.push_str(&input.output_dir.to_string_lossy()),
            "job_id" => out.push_str(&input.job_id.to_string()),
            "stage" => out.push_str(input.stage.as_str()),
            _ => match name.strip_prefix("artifact:") {
                Some(stage) => {
                    let stage: StageId = stage
                        .parse()
                        .map_err(|_| StageFailure::fatal(format!("unknown stage in placeholder {{{}}}", name)))?;
                    let artifact = input.upstream.get(&stage).ok_or_else(|| {
                        StageFailure::fatal(format!("no committed artifact for stage '{}'", stage))
                    })?;
                    out.push_str(artifact.uri());
                }
                None => {
                    return Err(StageFailure::fatal(format!("unknown placeholder {{{}}}", name)));
                }
            },
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use stemflow_storage::{ArtifactRef, JobId};

    fn input() -> StageInput {
        let mut upstream = BTreeMap::new();
        upstream.insert(StageId::Separation, ArtifactRef::new("/jobs/j1/separation"));
        StageInput {
            job_id: JobId::new(),
            stage: StageId::Transcription,
            attempt: 1,
            input_ref: "/media/song.mp3".to_string(),
            upstream,
            options: serde_json::json!({"model": "large-v3"}),
            output_dir: PathBuf::from("/jobs/j1/tmp/transcription-1"),
        }
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("progress=0.5"), Some(0.5));
        assert_eq!(parse_progress("  progress= 1 \n"), Some(1.0));
        assert_eq!(parse_progress("progress=NaN"), None);
        assert_eq!(parse_progress("loading model"), None);
    }

    #[test]
    fn test_render_args() {
        let spec = CommandSpec::new(
            "whisper-runner",
            vec![
                "--audio={artifact:separation}/vocals.wav".to_string(),
                "--out".to_string(),
                "{output_dir}".to_string(),
                "{stage}".to_string(),
            ],
        );
        let runner = CommandRunner::new(StageId::Transcription, spec);
        let args = runner.render_args(&input()).unwrap();
        assert_eq!(
            args,
            vec![
                "--audio=/jobs/j1/separation/vocals.wav",
                "--out",
                "/jobs/j1/tmp/transcription-1",
                "transcription",
            ]
        );
    }

    #[test]
    fn test_render_rejects_unknown_and_missing() {
        let input = input();
        let err = render_template("{nope}", &input).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Fatal);

        let err = render_template("{artifact:beat_analysis}", &input).unwrap_err();
        assert!(err.message.contains("beat_analysis"));

        assert!(render_template("{input", &input).is_err());
    }
}

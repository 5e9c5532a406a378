//! Scripted in-process stage adapters for tests and demos
//!
//! Each `ScriptedStage` plays back a queue of behaviors, one per invocation,
//! then repeats its default behavior.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stemflow_storage::StageId;

use crate::pipeline::{
    StageAdapter, StageClock, StageContext, StageFailure, StageInput, StageResult, StageSet, StageSuccess,
};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Report progress in `steps` equal increments, `step_delay` apart, then succeed
    Succeed { steps: u32, step_delay: Duration },
    FailTransient(String),
    FailFatal(String),
    /// Block without progress until cancelled
    HangHonoringCancel,
    /// Run for the given time without looking at the cancellation check, then succeed
    HangIgnoringCancel(Duration),
    Panic,
}

impl Behavior {
    pub fn quick() -> Self {
        Behavior::Succeed {
            steps: 4,
            step_delay: Duration::from_millis(2),
        }
    }
}

/// Tracks how many scripted invocations run at once, across stages
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ProbeGuard<'a>(&'a ConcurrencyProbe);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

pub struct ScriptedStage {
    stage: StageId,
    script: Mutex<VecDeque<Behavior>>,
    default: Behavior,
    invocations: AtomicUsize,
    probe: Arc<ConcurrencyProbe>,
}

impl ScriptedStage {
    pub fn new(stage: StageId, default: Behavior) -> Self {
        Self {
            stage,
            script: Mutex::new(VecDeque::new()),
            default,
            invocations: AtomicUsize::new(0),
            probe: Arc::new(ConcurrencyProbe::default()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Queue a behavior for the next not-yet-scripted invocation
    pub fn then(self, behavior: Behavior) -> Self {
        self.script.lock().push_back(behavior);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        self.script.lock().pop_front().unwrap_or_else(|| self.default.clone())
    }

    async fn succeed(&self, input: &StageInput, clock: StageClock) -> StageResult {
        let name = format!("{}.out", self.stage);
        tokio::fs::write(input.output_dir.join(&name), input.job_id.to_string())
            .await
            .map_err(|e| StageFailure::transient(e.to_string()))?;
        Ok(StageSuccess {
            outputs: vec![name.into()],
            timing: clock.stop(),
        })
    }
}

#[async_trait]
impl StageAdapter for ScriptedStage {
    fn stage_id(&self) -> StageId {
        self.stage
    }

    async fn execute(&self, input: StageInput, ctx: StageContext) -> StageResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.probe.enter();
        let _guard = ProbeGuard(&self.probe);
        let clock = StageClock::start();

        match self.next_behavior() {
            Behavior::Succeed { steps, step_delay } => {
                let steps = steps.max(1);
                for step in 1..=steps {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(StageFailure::cancelled()),
                        _ = tokio::time::sleep(step_delay) => {}
                    }
                    ctx.progress.report(step as f64 / steps as f64);
                }
                self.succeed(&input, clock).await
            }
            Behavior::FailTransient(message) => Err(StageFailure::transient(message)),
            Behavior::FailFatal(message) => Err(StageFailure::fatal(message)),
            Behavior::HangHonoringCancel => {
                ctx.cancel.cancelled().await;
                Err(StageFailure::cancelled())
            }
            Behavior::HangIgnoringCancel(duration) => {
                tokio::time::sleep(duration).await;
                ctx.progress.report(1.0);
                self.succeed(&input, clock).await
            }
            Behavior::Panic => panic!("scripted stage panic"),
        }
    }
}

/// Three scripted stages sharing one concurrency probe
pub struct ScriptedStages {
    pub separation: Arc<ScriptedStage>,
    pub transcription: Arc<ScriptedStage>,
    pub beat_analysis: Arc<ScriptedStage>,
    pub probe: Arc<ConcurrencyProbe>,
}

impl ScriptedStages {
    pub fn new(separation: ScriptedStage, transcription: ScriptedStage, beat_analysis: ScriptedStage) -> Self {
        let probe = Arc::new(ConcurrencyProbe::default());
        Self {
            separation: Arc::new(separation.with_probe(probe.clone())),
            transcription: Arc::new(transcription.with_probe(probe.clone())),
            beat_analysis: Arc::new(beat_analysis.with_probe(probe.clone())),
            probe,
        }
    }

    /// Every stage succeeds quickly
    pub fn succeeding() -> Self {
        Self::new(
            ScriptedStage::new(StageId::Separation, Behavior::quick()),
            ScriptedStage::new(StageId::Transcription, Behavior::quick()),
            ScriptedStage::new(StageId::BeatAnalysis, Behavior::quick()),
        )
    }

    pub fn stage_set(&self) -> StageSet {
        StageSet::new(
            self.separation.clone(),
            self.transcription.clone(),
            self.beat_analysis.clone(),
        )
        .unwrap_or_else(|e| panic!("scripted stages are registered in order: {}", e))
    }

    pub fn get(&self, stage: StageId) -> &Arc<ScriptedStage> {
        match stage {
            StageId::Separation => &self.separation,
            StageId::Transcription => &self.transcription,
            StageId::BeatAnalysis => &self.beat_analysis,
        }
    }
}

//! Engine configuration
//!
//! Loaded from a versioned YAML file (`version: 1`), then overridden by
//! `STEMFLOW_*` environment variables, then validated.
//!
//! ```yaml
//! version: 1
//! engine:
//!   max_concurrent_jobs: 2
//! stages:
//!   separation:
//!     weight: 0.6
//!     stall_timeout_secs: 1500
//!     max_retries: 2
//!     command:
//!       program: demucs-runner
//!       args: ["--in", "{input}", "--out", "{output_dir}"]
//! storage:
//!   root: /var/lib/stemflow/jobs
//!   database: /var/lib/stemflow/jobs.db
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stemflow_storage::StageId;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Upper bound for TTL, retention and stall timeouts (ten years)
pub const MAX_DEADLINE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn check_deadline_secs(field: String, value: u64) -> ConfigResult<()> {
    if !(1..=MAX_DEADLINE_SECS).contains(&value) {
        return Err(ConfigError::range_with_hint(
            field,
            value,
            1,
            MAX_DEADLINE_SECS,
            "Deadlines must be positive and at most ten years",
        ));
    }
    Ok(())
}

/// Seconds as a chrono duration, saturating at `MAX_DEADLINE_SECS`
fn chrono_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DEADLINE_SECS) as i64)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// Invalid value for an environment override
    #[error("Invalid value '{value}' for {var}: {reason}")]
    Env {
        var: String,
        value: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Custom(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    /// Create a range error with a hint
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSection {
    /// Admission bound: jobs in RUNNING at once
    pub max_concurrent_jobs: usize,
    /// Worker tasks pulling from the task queue (defaults to max_concurrent_jobs)
    pub workers: Option<usize>,
    /// Bounded compare-and-swap retries before surfacing a store error
    pub store_retry_attempts: u32,
    pub rescan_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
    pub dispatch: DispatchMode,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            workers: None,
            store_retry_attempts: 5,
            rescan_interval_ms: 5_000,
            cancel_poll_interval_ms: 500,
            dispatch: DispatchMode::Event,
        }
    }
}

/// Who enqueues the next stage task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// The writer of a transition enqueues immediately; re-scan is the backstop
    Event,
    /// Only the periodic re-scan enqueues
    Rescan,
}

/// External tool invocation for a command-backed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    /// Argument templates: `{input}`, `{output_dir}`, `{job_id}`, `{stage}`, `{artifact:<stage>}`
    #[serde(default)]
    pub args: Vec<String>,
    /// Exit codes classified as transient (default: 75, EX_TEMPFAIL)
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![75]
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            transient_exit_codes: default_transient_exit_codes(),
            env: BTreeMap::new(),
        }
    }
}

/// Static stage descriptor (not persisted per job)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDescriptor {
    /// Contribution to overall progress; all weights sum to 1.0
    pub weight: f64,
    pub stall_timeout_secs: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub command: Option<CommandSpec>,
}

impl StageDescriptor {
    fn new(weight: f64, stall_timeout_secs: u64) -> Self {
        Self {
            weight,
            stall_timeout_secs,
            max_retries: 2,
            command: None,
        }
    }

    pub fn stall_timeout(&self) -> chrono::Duration {
        chrono_seconds(self.stall_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagesSection {
    #[serde(default = "default_separation")]
    pub separation: StageDescriptor,
    #[serde(default = "default_transcription")]
    pub transcription: StageDescriptor,
    #[serde(default = "default_beat_analysis")]
    pub beat_analysis: StageDescriptor,
}

fn default_separation() -> StageDescriptor {
    StageDescriptor::new(0.6, 1500)
}

fn default_transcription() -> StageDescriptor {
    StageDescriptor::new(0.3, 600)
}

fn default_beat_analysis() -> StageDescriptor {
    StageDescriptor::new(0.1, 300)
}

impl Default for StagesSection {
    fn default() -> Self {
        Self {
            separation: default_separation(),
            transcription: default_transcription(),
            beat_analysis: default_beat_analysis(),
        }
    }
}

impl StagesSection {
    pub fn descriptor(&self, stage: StageId) -> &StageDescriptor {
        match stage {
            StageId::Separation => &self.separation,
            StageId::Transcription => &self.transcription,
            StageId::BeatAnalysis => &self.beat_analysis,
        }
    }

    pub fn descriptor_mut(&mut self, stage: StageId) -> &mut StageDescriptor {
        match stage {
            StageId::Separation => &mut self.separation,
            StageId::Transcription => &mut self.transcription,
            StageId::BeatAnalysis => &mut self.beat_analysis,
        }
    }
}

/// Retry backoff: `initial * multiplier^(retry - 1)`, capped at `max`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

/// Progress write coalescing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProgressConfig {
    /// Write when overall progress moved at least this much
    pub min_delta: f64,
    /// ...or when this long passed since the last write (and it moved at all)
    pub min_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_delta: 0.01,
            min_interval_ms: 1_000,
        }
    }
}

impl ProgressConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReaperConfig {
    pub period_secs: u64,
    /// Expiry deadline measured from creation
    pub job_ttl_secs: u64,
    /// How long terminal records stay readable
    pub retention_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            period_secs: 30,
            job_ttl_secs: 3_600,
            retention_secs: 86_400,
        }
    }
}

impl ReaperConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn job_ttl(&self) -> chrono::Duration {
        chrono_seconds(self.job_ttl_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono_seconds(self.retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Per-job artifact directories live under this root
    pub root: PathBuf,
    /// SQLite database file; in-memory store when absent
    pub database: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./stemflow-data/jobs"),
            database: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InputConfig {
    pub allowed_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: ["mp3", "wav", "m4a", "flac", "ogg", "aac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_file_size_bytes: 200 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// EnvFilter directive, e.g. `info` or `stemflow_orchestration=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EngineConfig
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub version: u32,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub stages: StagesSection,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            engine: EngineSection::default(),
            stages: StagesSection::default(),
            backoff: BackoffConfig::default(),
            progress: ProgressConfig::default(),
            reaper: ReaperConfig::default(),
            storage: StorageConfig::default(),
            input: InputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, or the YAML file if given; then env overrides; then validation
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse YAML (v1 schema); does not validate ranges
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;

        let version = value
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or(ConfigError::MissingVersion)? as u32;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        Ok(serde_yaml::from_value(value)?)
    }

    /// Apply `STEMFLOW_*` overrides from `lookup` (normally `std::env::var`)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> ConfigResult<T>
        where
            T::Err: std::fmt::Display,
        {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
                var: var.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
        }

        if let Some(v) = lookup("STEMFLOW_MAX_CONCURRENT_JOBS") {
            self.engine.max_concurrent_jobs = parse("STEMFLOW_MAX_CONCURRENT_JOBS", v)?;
        }
        if let Some(v) = lookup("STEMFLOW_WORKERS") {
            self.engine.workers = Some(parse("STEMFLOW_WORKERS", v)?);
        }
        if let Some(v) = lookup("STEMFLOW_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("STEMFLOW_DATABASE") {
            self.storage.database = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = lookup("STEMFLOW_JOB_TTL_SECS") {
            self.reaper.job_ttl_secs = parse("STEMFLOW_JOB_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("STEMFLOW_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("STEMFLOW_LOG_FORMAT") {
            self.logging.format = parse("STEMFLOW_LOG_FORMAT", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.max_concurrent_jobs < 1 {
            return Err(ConfigError::range_with_hint(
                "engine.max_concurrent_jobs",
                self.engine.max_concurrent_jobs,
                1,
                usize::MAX,
                "At least one job must be admitted at a time",
            ));
        }
        if let Some(workers) = self.engine.workers {
            if workers < 1 {
                return Err(ConfigError::range_with_hint(
                    "engine.workers",
                    workers,
                    1,
                    usize::MAX,
                    "Omit the field to use max_concurrent_jobs",
                ));
            }
        }
        if !(1..=32).contains(&self.engine.store_retry_attempts) {
            return Err(ConfigError::range_with_hint(
                "engine.store_retry_attempts",
                self.engine.store_retry_attempts,
                1,
                32,
                "Compare-and-swap retries must stay small and bounded",
            ));
        }
        for (field, value) in [
            ("engine.rescan_interval_ms", self.engine.rescan_interval_ms),
            ("engine.cancel_poll_interval_ms", self.engine.cancel_poll_interval_ms),
            ("backoff.initial_delay_ms", self.backoff.initial_delay_ms),
            ("reaper.period_secs", self.reaper.period_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::range_with_hint(
                    field,
                    value,
                    1,
                    u64::MAX,
                    "Timeouts and intervals must be positive",
                ));
            }
        }
        for (field, value) in [
            ("reaper.job_ttl_secs", self.reaper.job_ttl_secs),
            ("reaper.retention_secs", self.reaper.retention_secs),
        ] {
            check_deadline_secs(field.to_string(), value)?;
        }

        let mut total_weight = 0.0;
        for stage in StageId::ALL {
            let descriptor = self.stages.descriptor(stage);
            if !(descriptor.weight > 0.0 && descriptor.weight <= 1.0) {
                return Err(ConfigError::range_with_hint(
                    format!("stages.{}.weight", stage),
                    descriptor.weight,
                    "0 (exclusive)",
                    1.0,
                    "Every stage contributes to overall progress",
                ));
            }
            check_deadline_secs(
                format!("stages.{}.stall_timeout_secs", stage),
                descriptor.stall_timeout_secs,
            )?;
            total_weight += descriptor.weight;
        }
        if (total_weight - 1.0_f64).abs() > 1e-6 {
            return Err(ConfigError::Custom(format!(
                "Stage weights must sum to 1.0 (got {:.6})",
                total_weight
            )));
        }

        if !(self.progress.min_delta > 0.0 && self.progress.min_delta <= 1.0) {
            return Err(ConfigError::range_with_hint(
                "progress.min_delta",
                self.progress.min_delta,
                "0 (exclusive)",
                1.0,
                "Typical value: 0.01",
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::range_with_hint(
                "backoff.multiplier",
                self.backoff.multiplier,
                1.0,
                "inf",
                "Backoff must not shrink between retries",
            ));
        }
        if self.backoff.max_delay_ms < self.backoff.initial_delay_ms {
            return Err(ConfigError::range_with_hint(
                "backoff.max_delay_ms",
                self.backoff.max_delay_ms,
                self.backoff.initial_delay_ms,
                u64::MAX,
                "The cap must be at least the initial delay",
            ));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.engine.workers.unwrap_or(self.engine.max_concurrent_jobs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.engine.rescan_interval_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.engine.cancel_poll_interval_ms)
    }

    /// Test-friendly settings: short intervals, no backoff to speak of
    pub fn for_tests(max_concurrent_jobs: usize) -> Self {
        let mut config = Self::default();
        config.engine.max_concurrent_jobs = max_concurrent_jobs;
        config.engine.rescan_interval_ms = 50;
        config.engine.cancel_poll_interval_ms = 10;
        config.backoff.initial_delay_ms = 10;
        config.backoff.max_delay_ms = 50;
        config.progress.min_interval_ms = 10;
        config.reaper.period_secs = 1;
        config
    }
}

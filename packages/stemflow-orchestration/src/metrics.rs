//! Engine metrics
//!
//! With the `metrics` feature, counters and a stage-duration histogram are
//! registered in a Prometheus registry owned by `EngineMetrics`. Without it
//! every recording call is a no-op, so call sites never need `cfg`.

use stemflow_storage::{FailureKind, StageId};

#[cfg(feature = "metrics")]
mod enabled {
    use std::sync::Arc;

    use prometheus::{
        register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
        register_int_counter_with_registry, Encoder, HistogramOpts, HistogramVec, IntCounter,
        IntCounterVec, Opts, Registry, TextEncoder,
    };

    pub(super) struct Counters {
        pub registry: Registry,
        pub submitted: IntCounter,
        pub admitted: IntCounter,
        pub completed: IntCounter,
        pub failed: IntCounterVec,
        pub cancelled: IntCounter,
        pub retried: IntCounterVec,
        pub reaped: IntCounter,
        pub stage_duration: HistogramVec,
    }

    impl Counters {
        pub fn new() -> prometheus::Result<Arc<Self>> {
            let registry = Registry::new();
            Ok(Arc::new(Self {
                submitted: register_int_counter_with_registry!(
                    Opts::new("stemflow_jobs_submitted_total", "Jobs accepted at submission"),
                    registry
                )?,
                admitted: register_int_counter_with_registry!(
                    Opts::new("stemflow_jobs_admitted_total", "Jobs moved from QUEUED to RUNNING"),
                    registry
                )?,
                completed: register_int_counter_with_registry!(
                    Opts::new("stemflow_jobs_completed_total", "Jobs that finished every stage"),
                    registry
                )?,
                failed: register_int_counter_vec_with_registry!(
                    Opts::new("stemflow_jobs_failed_total", "Jobs that ended FAILED"),
                    &["kind"],
                    registry
                )?,
                cancelled: register_int_counter_with_registry!(
                    Opts::new("stemflow_jobs_cancelled_total", "Jobs that ended CANCELLED"),
                    registry
                )?,
                retried: register_int_counter_vec_with_registry!(
                    Opts::new("stemflow_stage_retries_total", "Transient stage failures retried"),
                    &["stage"],
                    registry
                )?,
                reaped: register_int_counter_with_registry!(
                    Opts::new("stemflow_jobs_reaped_total", "Jobs failed by the reaper"),
                    registry
                )?,
                stage_duration: register_histogram_vec_with_registry!(
                    HistogramOpts::new("stemflow_stage_duration_seconds", "Successful stage wall time")
                        .buckets(vec![1.0, 5.0, 15.0, 60.0, 180.0, 600.0, 1800.0]),
                    &["stage"],
                    registry
                )?,
                registry,
            }))
        }

        pub fn encode(&self) -> prometheus::Result<String> {
            let mut buffer = Vec::new();
            TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
            String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
        }
    }
}

/// Engine-wide counters (cheap to clone)
#[derive(Clone, Default)]
pub struct EngineMetrics {
    #[cfg(feature = "metrics")]
    counters: Option<std::sync::Arc<enabled::Counters>>,
}

impl EngineMetrics {
    /// Metrics that record nothing
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Metrics backed by a fresh Prometheus registry
    #[cfg(feature = "metrics")]
    pub fn prometheus() -> prometheus::Result<Self> {
        Ok(Self {
            counters: Some(enabled::Counters::new()?),
        })
    }

    /// Registry contents in the Prometheus text format
    #[cfg(feature = "metrics")]
    pub fn encode(&self) -> prometheus::Result<Option<String>> {
        self.counters.as_ref().map(|c| c.encode()).transpose()
    }

    #[cfg(feature = "metrics")]
    pub fn registry(&self) -> Option<&prometheus::Registry> {
        self.counters.as_ref().map(|c| &c.registry)
    }

    pub fn job_submitted(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.submitted.inc();
        }
    }

    pub fn job_admitted(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.admitted.inc();
        }
    }

    pub fn job_completed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.completed.inc();
        }
    }

    pub fn job_failed(&self, kind: FailureKind) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.failed.with_label_values(&[kind.as_str()]).inc();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }

    pub fn job_cancelled(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.cancelled.inc();
        }
    }

    pub fn stage_retried(&self, stage: StageId) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.retried.with_label_values(&[stage.as_str()]).inc();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = stage;
    }

    pub fn job_reaped(&self) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.reaped.inc();
        }
    }

    pub fn stage_finished(&self, stage: StageId, duration_ms: u64) {
        #[cfg(feature = "metrics")]
        if let Some(c) = &self.counters {
            c.stage_duration
                .with_label_values(&[stage.as_str()])
                .observe(duration_ms as f64 / 1000.0);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = (stage, duration_ms);
    }
}

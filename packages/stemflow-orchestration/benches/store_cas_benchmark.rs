//! Benchmarks for the job store write path
//!
//! Measures:
//! - Single progress write (read + compare-and-swap) per adapter
//! - Contended writers on one record (conflict retries)
//! - Full three-stage job through the engine with no-op stages

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stemflow_orchestration::config::EngineConfig;
use stemflow_orchestration::retry::update_job;
use stemflow_orchestration::testing::{Behavior, ScriptedStage, ScriptedStages};
use stemflow_orchestration::{Engine, JobStateMachine};
use stemflow_storage::{InMemoryJobStore, JobId, JobStatus, JobStore, SqliteJobStore, StageId};

fn running_job(store: &dyn JobStore, rt: &tokio::runtime::Runtime) -> JobId {
    rt.block_on(async {
        let id = store
            .create("/media/bench.wav", serde_json::json!({}), chrono::Duration::hours(1))
            .await
            .unwrap();
        update_job(store, &id, 5, |record| {
            JobStateMachine::new(record).admit(chrono::Utc::now())?;
            Ok(true)
        })
        .await
        .unwrap();
        id
    })
}

/// Benchmark 1: one progress write per adapter
fn bench_progress_write(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut group = c.benchmark_group("progress_write");

    let adapters: Vec<(&str, Arc<dyn JobStore>)> = vec![
        ("memory", Arc::new(InMemoryJobStore::new())),
        ("sqlite", Arc::new(SqliteJobStore::open(dir.path().join("bench.db")).unwrap())),
    ];

    for (name, store) in adapters {
        let id = running_job(store.as_ref(), &rt);
        let mut step = 0u64;
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| {
                step += 1;
                let fraction = (step % 1000) as f64 / 1000.0;
                let store = store.clone();
                async move {
                    black_box(
                        update_job(store.as_ref(), &id, 5, |record| {
                            record.stage_progress.insert(StageId::Separation, fraction);
                            record.overall_progress = fraction * 0.6;
                            Ok(true)
                        })
                        .await
                        .unwrap(),
                    )
                }
            });
        });
    }

    group.finish();
}

/// Benchmark 2: concurrent writers racing on one record
fn bench_contended_writers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("contended_cas");

    for writers in [1usize, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(writers), writers, |b, &writers| {
            b.to_async(&rt).iter(|| async move {
                let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
                let id = store
                    .create("/media/bench.wav", serde_json::json!({}), chrono::Duration::hours(1))
                    .await
                    .unwrap();

                let handles: Vec<_> = (0..writers)
                    .map(|_| {
                        let store = store.clone();
                        tokio::spawn(async move {
                            update_job(store.as_ref(), &id, 64, |record| {
                                record.overall_progress = (record.overall_progress + 0.01).min(1.0);
                                Ok(true)
                            })
                            .await
                            .is_ok()
                        })
                    })
                    .collect();
                for handle in handles {
                    black_box(handle.await.unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark 3: end-to-end job latency through workers and queue
fn bench_engine_job(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bench.wav");
    std::fs::write(&input, b"RIFF").unwrap();

    let mut config = EngineConfig::for_tests(4);
    config.storage.root = dir.path().join("jobs");
    let instant = || Behavior::Succeed {
        steps: 1,
        step_delay: Duration::ZERO,
    };
    let stages = ScriptedStages::new(
        ScriptedStage::new(StageId::Separation, instant()),
        ScriptedStage::new(StageId::Transcription, instant()),
        ScriptedStage::new(StageId::BeatAnalysis, instant()),
    );

    let mut engine = Engine::new(config, Arc::new(InMemoryJobStore::new()), stages.stage_set());
    rt.block_on(engine.start()).unwrap();
    let coordinator = engine.coordinator().clone();
    let input = input.to_string_lossy().into_owned();

    c.bench_function("engine_job_end_to_end", |b| {
        b.to_async(&rt).iter(|| {
            let coordinator = coordinator.clone();
            let input = input.clone();
            async move {
                let id = coordinator.submit(&input, serde_json::json!({})).await.unwrap();
                loop {
                    let status = coordinator.status(&id).await.unwrap();
                    if status.status == JobStatus::Completed {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        });
    });

    rt.block_on(engine.shutdown());
}

criterion_group!(benches, bench_progress_write, bench_contended_writers, bench_engine_job);
criterion_main!(benches);

//! Resource attribution and bottleneck identification benchmark
//!
//! Identification itself only builds descriptors; the summaries force the
//! per-timeslice sweeps over leaves and composite phases.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench bottleneck_sweep
//! ```

mod support;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use phaselens::attribution::{
    CacheSetting, DefaultSampling, ResourceAttribution, ResourceAttributionSettings,
};
use phaselens::bottleneck::{BottleneckIdentification, BottleneckIdentificationSettings};
use phaselens::job::LoadedJob;
use std::path::Path;
use support::staged_job;

fn settings(job: &LoadedJob) -> ResourceAttributionSettings {
    ResourceAttributionSettings {
        mapping: job.mapping.clone(),
        rules: Box::new(job.rules.clone()),
        sampling: Box::new(DefaultSampling),
        cache: CacheSetting::Disable,
    }
}

fn bench_attribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_attribution");

    for tasks in [10i64, 100] {
        let job = staged_job(10, tasks);
        let settings = settings(&job);

        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, _| {
            b.iter(|| {
                let attribution = ResourceAttribution::execute(
                    &job.execution,
                    &job.resources,
                    &settings,
                    Path::new("."),
                )
                .expect("attribution succeeds");
                black_box(attribution.leaf_phases().count())
            });
        });
    }

    group.finish();
}

fn bench_bottleneck_summaries(c: &mut Criterion) {
    let mut group = c.benchmark_group("bottleneck_summaries");

    for tasks in [10i64, 100] {
        let job = staged_job(10, tasks);
        let settings = settings(&job);
        let attribution =
            ResourceAttribution::execute(&job.execution, &job.resources, &settings, Path::new("."))
                .expect("attribution succeeds");
        let thresholds = BottleneckIdentificationSettings::default();

        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, _| {
            b.iter(|| {
                let result = BottleneckIdentification::execute(&attribution, &thresholds);
                let mut unbottlenecked = 0;
                for phase in job.execution.phases() {
                    unbottlenecked += result
                        .metric_type_bottlenecks(phase.id)
                        .time_not_bottlenecked()
                        .expect("summary exists");
                }
                black_box(unbottlenecked)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_attribution, bench_bottleneck_summaries);
criterion_main!(benches);

//! Phase execution simulator benchmark
//!
//! Measures one full simulation of a chain of constrained stages, the
//! operation every performance issue pass repeats once per candidate issue.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench simulation
//! ```

mod support;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use phaselens::simulation::{
    ConcurrencyConstraintRule, DefaultPhaseExecutionSimulator, PhaseExecutionSimulator,
};
use support::staged_job;

fn bench_simulate_constrained(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulate_constrained");

    for tasks in [10i64, 100, 1000] {
        let job = staged_job(10, tasks);
        let simulator = DefaultPhaseExecutionSimulator::new(&job.execution, &job.constraints)
            .expect("constraints resolve");
        let root = job.execution.root();
        let durations = simulator.new_duration_map(root);

        group.throughput(Throughput::Elements((10 * tasks) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, _| {
            b.iter(|| {
                let result = simulator
                    .simulate(black_box(root), black_box(&durations))
                    .expect("no deadlock");
                black_box(result.total_duration())
            });
        });
    }

    group.finish();
}

fn bench_simulate_unconstrained(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulate_unconstrained");

    for stages in [10i64, 100] {
        let job = staged_job(stages, 50);
        let simulator =
            DefaultPhaseExecutionSimulator::new::<ConcurrencyConstraintRule>(&job.execution, &[])
                .expect("no constraints");
        let root = job.execution.root();
        let durations = simulator.new_duration_map(root);

        group.bench_with_input(BenchmarkId::from_parameter(stages), &stages, |b, _| {
            b.iter(|| {
                let result = simulator
                    .simulate(black_box(root), black_box(&durations))
                    .expect("no deadlock");
                black_box(result.total_duration())
            });
        });
    }

    group.finish();
}

fn bench_simulator_setup(c: &mut Criterion) {
    let job = staged_job(10, 1000);

    c.bench_function("simulator_setup_10x1000", |b| {
        b.iter(|| {
            let simulator =
                DefaultPhaseExecutionSimulator::new(black_box(&job.execution), &job.constraints)
                    .expect("constraints resolve");
            black_box(simulator.constraints().len())
        });
    });
}

criterion_group!(
    benches,
    bench_simulate_constrained,
    bench_simulate_unconstrained,
    bench_simulator_setup
);
criterion_main!(benches);

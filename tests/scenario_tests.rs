//! End-to-end scenarios: simulation wiring, constraint backpressure and
//! unique-bottleneck accounting, driven through the public API

mod common;

use common::{flat_job, load};
use phaselens::attribution::{
    CacheSetting, DefaultSampling, ResourceAttribution, ResourceAttributionSettings,
};
use phaselens::bottleneck::{BottleneckIdentification, BottleneckIdentificationSettings};
use phaselens::model::{
    ExecutionModel, ExecutionModelBuilder, ExecutionModelSpecification, PhaseId, Repeatability,
};
use phaselens::simulation::{
    ConcurrencyConstraintRule, ConcurrencyLimit, DefaultPhaseExecutionSimulator,
    PhaseExecutionSimulator,
};
use phaselens::time::Time;
use std::path::Path;

/// Root with repeatable leaf tasks; `dependencies` are `(phase, dependency)` indexes
fn tasks(ranges: &[(i64, i64)], dependencies: &[(usize, usize)]) -> (ExecutionModel, Vec<PhaseId>) {
    let mut spec = ExecutionModelSpecification::new();
    let task = spec
        .add_phase_type(spec.root(), "task", Repeatability::repeatable("id", true))
        .unwrap();
    let first = ranges.iter().map(|r| r.0).min().unwrap();
    let last = ranges.iter().map(|r| r.1).max().unwrap();
    let mut builder = ExecutionModelBuilder::new(spec, Time::default(), first, last);
    let root = builder.root();
    let handles: Vec<_> = ranges
        .iter()
        .enumerate()
        .map(|(i, &(first, last))| builder.add_phase(root, task, i.to_string(), first, last))
        .collect();
    for &(phase, dependency) in dependencies {
        builder.add_dependency(handles[phase], handles[dependency]);
    }
    let execution = builder.build().unwrap();
    let ids = (0..ranges.len())
        .map(|i| execution.resolve_phase(&format!("/task[{i}]")).unwrap())
        .collect();
    (execution, ids)
}

#[test]
fn test_independent_siblings_run_in_parallel() {
    let (execution, ids) = tasks(&[(0, 49), (50, 99)], &[]);
    let simulator =
        DefaultPhaseExecutionSimulator::new::<ConcurrencyConstraintRule>(&execution, &[]).unwrap();
    let result = simulator
        .simulate(execution.root(), &simulator.new_duration_map(execution.root()))
        .unwrap();

    assert_eq!(result.total_duration(), 50.0);
    assert_eq!(result.start_time(ids[1]), Some(0.0));
    assert_eq!(result.end_time(ids[0]), Some(50.0));
    assert_eq!(result.end_time(ids[1]), Some(50.0));
}

#[test]
fn test_explicit_dependency_serializes_siblings() {
    let (execution, ids) = tasks(&[(0, 49), (50, 99)], &[(1, 0)]);
    let simulator =
        DefaultPhaseExecutionSimulator::new::<ConcurrencyConstraintRule>(&execution, &[]).unwrap();
    let result = simulator
        .simulate(execution.root(), &simulator.new_duration_map(execution.root()))
        .unwrap();

    assert_eq!(result.total_duration(), 100.0);
    assert_eq!(result.start_time(ids[0]), Some(0.0));
    assert_eq!(result.end_time(ids[0]), Some(50.0));
    assert_eq!(result.start_time(ids[1]), Some(50.0));
    assert_eq!(result.end_time(ids[1]), Some(100.0));
}

#[test]
fn test_limit_of_one_serializes_in_ready_order() {
    let (execution, ids) = tasks(&[(0, 9), (0, 19), (0, 29)], &[]);
    let rule = ConcurrencyConstraintRule {
        per_instance_type: execution.specification().root(),
        constrained_type: execution.phase(ids[0]).type_id,
        limit: ConcurrencyLimit::Fixed(1),
    };
    let simulator = DefaultPhaseExecutionSimulator::new(&execution, &[rule]).unwrap();
    let result = simulator
        .simulate(execution.root(), &simulator.new_duration_map(execution.root()))
        .unwrap();

    // Sum of the durations, not their maximum
    assert_eq!(result.total_duration(), 60.0);
    let ends: Vec<_> = ids.iter().map(|&id| result.end_time(id).unwrap()).collect();
    assert_eq!(ends, vec![10.0, 30.0, 60.0]);
}

#[test]
fn test_unique_bottleneck_accounting_on_disjoint_global_spans() {
    // cpu saturated in [0, 4], gc blocked in [5, 7], nothing in [8, 9]
    let job = load(flat_job(&[("a", 0, 9)], &[(0, 4, 9.6), (5, 9, 3.0)], &[(5, 7)]));
    let settings = ResourceAttributionSettings {
        mapping: job.mapping.clone(),
        rules: Box::new(job.rules.clone()),
        sampling: Box::new(DefaultSampling),
        cache: CacheSetting::Disable,
    };
    let attribution =
        ResourceAttribution::execute(&job.execution, &job.resources, &settings, Path::new("."))
            .unwrap();
    let thresholds = BottleneckIdentificationSettings::default();
    let bottlenecks = BottleneckIdentification::execute(&attribution, &thresholds);

    let a = job.execution.resolve_phase("/task[a]").unwrap();
    let cpu = job.resources.resolve_metric("/node/cpu").unwrap();
    let gc = job.resources.resolve_metric("/node/gc").unwrap();
    let view = bottlenecks.metric_bottlenecks(a);

    assert_eq!(view.time_uniquely_bottlenecked_on(cpu).unwrap(), 5);
    assert_eq!(view.time_uniquely_bottlenecked_on(gc).unwrap(), 3);
    assert_eq!(view.time_not_bottlenecked().unwrap(), 2);
}

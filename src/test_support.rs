//! Small job fixtures shared by unit tests

use crate::attribution::{
    BlockingAttributionRule, CacheSetting, ConsumableAttributionRule, DefaultSampling,
    ResourceAttributionSettings, RuleTable,
};
use crate::model::{
    ExecutionModel, ExecutionModelBuilder, ExecutionModelSpecification, MetricClass, MetricId,
    PhaseToResourceMapping, RateObservations, Repeatability, ResourceModel, ResourceModelBuilder,
};
use crate::time::{Period, PeriodList, Time};

/// Flat job: a root with repeatable leaf `task` phases, one cpu and one gc metric
pub(crate) struct Fixture {
    pub execution: ExecutionModel,
    pub resources: ResourceModel,
    pub rules: RuleTable,
    pub cpu: MetricId,
    pub gc: MetricId,
}

pub(crate) struct FixtureSpec<'a> {
    pub tasks: &'a [(&'a str, i64, i64)],
    pub cpu_boundaries: Vec<i64>,
    pub cpu_values: Vec<f64>,
    pub cpu_capacity: f64,
    pub cpu_rule: ConsumableAttributionRule,
    pub gc_blocked: &'a [(i64, i64)],
    pub gc_rule: BlockingAttributionRule,
}

impl Default for FixtureSpec<'_> {
    fn default() -> Self {
        Self {
            tasks: &[("a", 0, 9)],
            cpu_boundaries: vec![-1, 9],
            cpu_values: vec![5.0],
            cpu_capacity: 10.0,
            cpu_rule: ConsumableAttributionRule::Exact(4.0),
            gc_blocked: &[],
            gc_rule: BlockingAttributionRule::Full,
        }
    }
}

pub(crate) fn fixture(spec: FixtureSpec<'_>) -> Fixture {
    let time = Time::new(10).unwrap();

    let mut schema = ExecutionModelSpecification::new();
    let task = schema
        .add_phase_type(schema.root(), "task", Repeatability::repeatable("id", true))
        .unwrap();
    let first = spec.tasks.iter().map(|t| t.1).min().unwrap_or(0);
    let last = spec.tasks.iter().map(|t| t.2).max().unwrap_or(-1);
    let mut builder = ExecutionModelBuilder::new(schema, time, first, last);
    let root = builder.root();
    for &(name, first, last) in spec.tasks {
        builder.add_phase(root, task, name, first, last);
    }
    let execution = builder.build().unwrap();

    let mut resources = ResourceModelBuilder::new(time);
    let cpu_type = resources.metric_type("cpu", MetricClass::Consumable).unwrap();
    let gc_type = resources.metric_type("gc", MetricClass::Blocking).unwrap();
    let machine = resources.add_resource(resources.root(), "machine");
    let cpu = resources.add_consumable_metric(
        machine,
        "cpu",
        cpu_type,
        spec.cpu_capacity,
        RateObservations::new(spec.cpu_boundaries, spec.cpu_values).unwrap(),
    );
    let gc = resources.add_blocking_metric(
        machine,
        "gc",
        gc_type,
        PeriodList::new(spec.gc_blocked.iter().map(|&(s, e)| Period::new(s, e)).collect()),
    );
    let resources = resources.build().unwrap();

    let mut rules = RuleTable::new();
    rules.set_consumable(task, cpu_type, spec.cpu_rule);
    rules.set_blocking(task, gc_type, spec.gc_rule);

    Fixture {
        execution,
        resources,
        rules,
        cpu,
        gc,
    }
}

impl Fixture {
    pub fn settings(&self) -> ResourceAttributionSettings {
        ResourceAttributionSettings {
            mapping: PhaseToResourceMapping::everything(&self.execution, &self.resources),
            rules: Box::new(self.rules.clone()),
            sampling: Box::new(DefaultSampling),
            cache: CacheSetting::Disable,
        }
    }

    pub fn phase(&self, name: &str) -> crate::model::PhaseId {
        self.execution
            .resolve_phase(&format!("/task[id={name}]"))
            .unwrap()
    }
}

pub(crate) fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

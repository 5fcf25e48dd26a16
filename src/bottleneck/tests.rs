use super::*;
use crate::attribution::{
    BlockingAttributionRule, CacheSetting, ConsumableAttributionRule, DefaultSampling,
    ResourceAttribution, ResourceAttributionSettings, RuleTable,
};
use crate::model::{
    ExecutionModelBuilder, ExecutionModelSpecification, MetricClass, PhaseToResourceMapping,
    RateObservations, Repeatability, ResourceModelBuilder,
};
use crate::test_support::{fixture, Fixture, FixtureSpec};
use crate::time::Time;
use std::path::Path;

use super::BottleneckStatus::{Global, Local, None as Free};

fn statuses(view: &PhaseBottlenecks<'_, MetricId>, metric: MetricId) -> Vec<BottleneckStatus> {
    view.iter(metric).unwrap().collect()
}

fn attribute(f: &Fixture) -> ResourceAttributionResult<'_> {
    ResourceAttribution::execute(&f.execution, &f.resources, &f.settings(), Path::new(".")).unwrap()
}

#[test]
fn test_status_order_and_bytes() {
    assert!(Free < Local && Local < Global);
    for status in [Free, Local, Global] {
        assert_eq!(BottleneckStatus::from_byte(status.as_byte()), Some(status));
    }
    assert_eq!(Global.as_byte(), 2);
    assert_eq!(BottleneckStatus::from_byte(3), None);
}

#[test]
fn test_leaf_uses_full_share_is_local() {
    let f = fixture(FixtureSpec::default());
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);

    let view = result.metric_bottlenecks(f.phase("a"));
    assert_eq!(statuses(&view, f.cpu), vec![Local; 10]);
}

#[test]
fn test_saturated_sample_is_global_regardless_of_usage() {
    let f = fixture(FixtureSpec {
        cpu_values: vec![9.6],
        cpu_rule: ConsumableAttributionRule::Exact(1.0),
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let mut settings = BottleneckIdentificationSettings::default();
    // Even an unreachable local threshold does not hide a global bottleneck
    settings.local_threshold = 1e9;
    let result = BottleneckIdentification::execute(&attribution, &settings);

    let view = result.metric_bottlenecks(f.phase("a"));
    assert_eq!(statuses(&view, f.cpu), vec![Global; 10]);
}

#[test]
fn test_lowering_local_threshold_only_adds_bottlenecks() {
    let f = fixture(FixtureSpec {
        cpu_values: vec![3.0],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let a = f.phase("a");

    let strict = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &strict);
    assert_eq!(statuses(&result.metric_bottlenecks(a), f.cpu), vec![Free; 10]);

    let mut relaxed = BottleneckIdentificationSettings::default();
    relaxed.local_threshold = 0.5;
    let result = BottleneckIdentification::execute(&attribution, &relaxed);
    assert_eq!(statuses(&result.metric_bottlenecks(a), f.cpu), vec![Local; 10]);
}

#[test]
fn test_phase_type_override_wins_over_default() {
    let f = fixture(FixtureSpec {
        cpu_values: vec![3.0],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let a = f.execution.phase(f.phase("a"));
    let cpu = f.resources.metric(f.cpu);

    let mut settings = BottleneckIdentificationSettings::default();
    settings.metric_type_local.insert(cpu.type_id, 0.8);
    assert_eq!(settings.local_threshold_factor(cpu, a), 0.8);
    settings.phase_type_local.insert((a.type_id, cpu.type_id), 0.5);
    assert_eq!(settings.local_threshold_factor(cpu, a), 0.5);
    assert_eq!(settings.global_threshold_factor(cpu), DEFAULT_GLOBAL_THRESHOLD);

    let result = BottleneckIdentification::execute(&attribution, &settings);
    assert_eq!(statuses(&result.metric_bottlenecks(a.id), f.cpu), vec![Local; 10]);
}

#[test]
fn test_inactive_timeslices_are_never_bottlenecked() {
    let f = fixture(FixtureSpec {
        cpu_values: vec![9.6],
        gc_blocked: &[(3, 4)],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);
    let view = result.metric_bottlenecks(f.phase("a"));

    let cpu = statuses(&view, f.cpu);
    assert_eq!(cpu[2], Global);
    assert_eq!(cpu[3], Free);
    assert_eq!(cpu[4], Free);

    let gc = statuses(&view, f.gc);
    assert_eq!(gc.iter().filter(|s| **s == Global).count(), 2);
    assert_eq!(gc[3], Global);
}

#[test]
fn test_composite_of_tiling_children_follows_active_child() {
    let f = fixture(FixtureSpec {
        tasks: &[("a", 0, 4), ("b", 5, 9)],
        cpu_boundaries: vec![-1, 4, 9],
        cpu_values: vec![3.0, 9.6],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);

    let a = statuses(&result.metric_bottlenecks(f.phase("a")), f.cpu);
    let b = statuses(&result.metric_bottlenecks(f.phase("b")), f.cpu);
    assert_eq!(a, vec![Free; 5]);
    assert_eq!(b, vec![Global; 5]);

    let root = statuses(&result.metric_bottlenecks(f.execution.root()), f.cpu);
    let expected: Vec<_> = a.into_iter().chain(b).collect();
    assert_eq!(root, expected);
}

struct AnyLocal;

impl BottleneckPredicate for AnyLocal {
    fn combine(&self, _phase: &Phase, subphases: &[(PhaseId, BottleneckStatus)]) -> BottleneckStatus {
        if subphases.iter().any(|(_, s)| s.is_bottleneck()) {
            Local
        } else {
            Free
        }
    }
}

#[test]
fn test_composite_applies_configured_predicate() {
    let f = fixture(FixtureSpec {
        tasks: &[("a", 0, 9), ("b", 5, 9)],
        cpu_values: vec![9.6],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings {
        predicate: Box::new(AnyLocal),
        ..BottleneckIdentificationSettings::default()
    };
    let result = BottleneckIdentification::execute(&attribution, &settings);

    let root = statuses(&result.metric_bottlenecks(f.execution.root()), f.cpu);
    assert_eq!(root, vec![Local; 10]);
}

#[test]
fn test_composite_gap_combines_to_none() {
    let f = fixture(FixtureSpec {
        tasks: &[("a", 0, 2), ("b", 7, 9)],
        cpu_values: vec![9.6],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);

    let root = statuses(&result.metric_bottlenecks(f.execution.root()), f.cpu);
    assert_eq!(root.len(), 10);
    assert_eq!(&root[..3], &[Global; 3]);
    assert_eq!(&root[3..7], &[Free; 4]);
}

#[test]
fn test_unique_bottleneck_accounting() {
    let f = fixture(FixtureSpec {
        cpu_boundaries: vec![-1, 4, 9],
        cpu_values: vec![9.6, 3.0],
        gc_blocked: &[(5, 7)],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);
    let view = result.metric_bottlenecks(f.phase("a"));

    assert_eq!(view.time_bottlenecked_on(f.cpu).unwrap(), 5);
    assert_eq!(view.time_bottlenecked_on(f.gc).unwrap(), 3);
    assert_eq!(view.time_uniquely_bottlenecked_on(f.cpu).unwrap(), 5);
    assert_eq!(view.time_uniquely_bottlenecked_on(f.gc).unwrap(), 3);
    assert_eq!(view.time_not_bottlenecked().unwrap(), 2);

    let total: Vec<_> = view.total_iter().unwrap().collect();
    assert_eq!(total[0], Global);
    assert_eq!(total[6], Global);
    assert_eq!(total[9], Free);

    // Memoized: the same summary instance is returned
    assert!(std::ptr::eq(view.summary().unwrap(), view.summary().unwrap()));
}

#[test]
fn test_single_bottleneck_is_unique() {
    let f = fixture(FixtureSpec {
        cpu_values: vec![9.6],
        gc_rule: BlockingAttributionRule::Full,
        ..FixtureSpec::default()
    });
    // gc never blocks, so cpu is the only bottleneck
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);
    let view = result.metric_bottlenecks(f.phase("a"));
    assert_eq!(view.time_uniquely_bottlenecked_on(f.cpu).unwrap(), 10);
    assert_eq!(view.time_bottlenecked_on(f.gc).unwrap(), 0);
}

#[test]
fn test_summary_summed_over_composite_with_two_children() {
    let f = fixture(FixtureSpec {
        tasks: &[("a", 0, 9), ("b", 0, 9)],
        cpu_values: vec![9.6],
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);
    let root = result.metric_type_bottlenecks(f.execution.root());
    let cpu_type = f.resources.metric(f.cpu).type_id;
    let gc_type = f.resources.metric(f.gc).type_id;

    assert_eq!(root.keys().collect::<Vec<_>>(), vec![cpu_type, gc_type]);
    assert_eq!(root.time_uniquely_bottlenecked_on(cpu_type).unwrap(), 10);
    assert_eq!(root.time_not_bottlenecked().unwrap(), 0);
}

/// Leaf `task` sharing two cpu metrics of one type on two machines
fn two_cpu_job(values: [f64; 2]) -> (crate::model::ExecutionModel, crate::model::ResourceModel, RuleTable) {
    let time = Time::new(10).unwrap();
    let mut schema = ExecutionModelSpecification::new();
    let task = schema
        .add_phase_type(schema.root(), "task", Repeatability::Single)
        .unwrap();
    let mut builder = ExecutionModelBuilder::new(schema, time, 0, 3);
    let root = builder.root();
    builder.add_phase(root, task, "", 0, 3);
    let execution = builder.build().unwrap();

    let mut resources = ResourceModelBuilder::new(time);
    let cpu = resources.metric_type("cpu", MetricClass::Consumable).unwrap();
    for (i, value) in values.into_iter().enumerate() {
        let machine = resources.add_resource(resources.root(), &format!("machine{i}"));
        resources.add_consumable_metric(
            machine,
            "cpu",
            cpu,
            10.0,
            RateObservations::new(vec![-1, 3], vec![value]).unwrap(),
        );
    }
    let resources = resources.build().unwrap();

    let mut rules = RuleTable::new();
    rules.set_consumable(task, cpu, ConsumableAttributionRule::Variable(1.0));
    (execution, resources, rules)
}

#[test]
fn test_metric_type_aggregation_rule() {
    for (values, expected) in [
        ([9.6, 9.6], Global),
        ([9.6, 0.0], Local),
        ([0.0, 0.0], Free),
    ] {
        let (execution, resources, rules) = two_cpu_job(values);
        let settings = ResourceAttributionSettings {
            mapping: PhaseToResourceMapping::everything(&execution, &resources),
            rules: Box::new(rules),
            sampling: Box::new(DefaultSampling),
            cache: CacheSetting::Disable,
        };
        let attribution =
            ResourceAttribution::execute(&execution, &resources, &settings, Path::new(".")).unwrap();
        let mut bottlenecks = BottleneckIdentificationSettings::default();
        // An idle metric must not count as locally saturated
        bottlenecks.local_threshold = 2.0;
        let result = BottleneckIdentification::execute(&attribution, &bottlenecks);

        let task = execution.resolve_phase("/task").unwrap();
        let view = result.metric_type_bottlenecks(task);
        let cpu_type = resources.find_metric_type("cpu").unwrap();
        let got: Vec<_> = view.iter(cpu_type).unwrap().collect();
        assert_eq!(got, vec![expected; 4], "values {values:?}");
    }
}

#[test]
fn test_unused_blocking_metric_joins_metric_type() {
    let f = fixture(FixtureSpec {
        gc_blocked: &[(0, 9)],
        gc_rule: BlockingAttributionRule::None,
        ..FixtureSpec::default()
    });
    let attribution = attribute(&f);
    let settings = BottleneckIdentificationSettings::default();
    let result = BottleneckIdentification::execute(&attribution, &settings);
    let view = result.metric_type_bottlenecks(f.phase("a"));
    let gc_type = f.resources.metric(f.gc).type_id;
    // No used gc metric, so the type has no entry of its own
    assert!(!view.contains(gc_type));

    let metrics = result.metric_bottlenecks(f.phase("a"));
    assert!(matches!(
        metrics.time_bottlenecked_on(f.gc),
        Err(AnalysisError::NotFound { .. })
    ));
}

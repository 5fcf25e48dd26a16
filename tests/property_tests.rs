//! Property-based tests for period arithmetic, time conversion, resource
//! attribution and bottleneck classification
//!
//! Jobs are generated as flat lists of overlapping tasks sharing one cpu, so
//! every case exercises demand splitting between concurrent claimants.

mod common;

use common::{flat_job, load};
use phaselens::attribution::{
    CacheSetting, DefaultSampling, ResourceAttribution, ResourceAttributionResult,
    ResourceAttributionSettings,
};
use phaselens::bottleneck::{
    BottleneckIdentification, BottleneckIdentificationSettings, BottleneckStatus,
};
use phaselens::job::LoadedJob;
use phaselens::model::MetricId;
use phaselens::time::{Period, PeriodList, Time, Timeslices};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;

fn period_list() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((-20i64..60, -2i64..15), 0..8)
        .prop_map(|v| v.into_iter().map(|(s, len)| (s, s + len)).collect())
}

fn to_list(ranges: &[(i64, i64)]) -> PeriodList<Timeslices> {
    PeriodList::new(ranges.iter().map(|&(s, e)| Period::new(s, e)).collect())
}

fn covers(ranges: &[(i64, i64)], x: i64) -> bool {
    ranges.iter().any(|&(s, e)| s <= x && x <= e)
}

/// Tasks `t0, t1, ...` as `(first, last)` timeslice ranges
fn tasks() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..12, 0i64..10), 1..5)
        .prop_map(|v| v.into_iter().map(|(first, len)| (first, first + len)).collect())
}

fn task_job(tasks: &[(i64, i64)], cpu_value: f64) -> Value {
    let ids: Vec<String> = (0..tasks.len()).map(|i| format!("t{i}")).collect();
    let named: Vec<(&str, i64, i64)> = ids
        .iter()
        .zip(tasks)
        .map(|(id, &(first, last))| (id.as_str(), first, last))
        .collect();
    let first = tasks.iter().map(|t| t.0).min().unwrap_or(0);
    let last = tasks.iter().map(|t| t.1).max().unwrap_or(0);
    flat_job(&named, &[(first, last, cpu_value)], &[])
}

fn attribute(job: &LoadedJob) -> ResourceAttributionResult<'_> {
    let settings = ResourceAttributionSettings {
        mapping: job.mapping.clone(),
        rules: Box::new(job.rules.clone()),
        sampling: Box::new(DefaultSampling),
        cache: CacheSetting::Disable,
    };
    ResourceAttribution::execute(&job.execution, &job.resources, &settings, Path::new("."))
        .unwrap()
}

fn cpu(job: &LoadedJob) -> MetricId {
    job.resources.resolve_metric("/node/cpu").unwrap()
}

/// Sum of the usage attributed to all leaves per timeslice, and whether any leaf was active
fn attributed_totals(job: &LoadedJob, attribution: &ResourceAttributionResult<'_>) -> BTreeMap<i64, (f64, bool)> {
    let metric = cpu(job);
    let mut totals = BTreeMap::new();
    for leaf in job.execution.leaf_phases() {
        let usage = attribution.consumable_iter(leaf.id, metric).unwrap();
        let active = attribution.active_iter(leaf.id).unwrap();
        for (sample, is_active) in usage.zip(active) {
            let entry = totals.entry(sample.timeslice).or_insert((0.0, false));
            entry.0 += sample.usage;
            entry.1 |= is_active;
        }
    }
    totals
}

fn samples(job: &LoadedJob, attribution: &ResourceAttributionResult<'_>) -> BTreeMap<i64, f64> {
    let root = job.execution.phase(job.execution.root());
    attribution
        .sample_iter(cpu(job), root.first_timeslice, root.last_timeslice)
        .unwrap()
        .enumerate()
        .map(|(i, sample)| (root.first_timeslice + i as i64, sample))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_period_list_is_sorted_disjoint_and_non_adjacent(ranges in period_list()) {
        let list = to_list(&ranges);
        for p in list.periods() {
            prop_assert!(p.start <= p.end);
        }
        for w in list.periods().windows(2) {
            prop_assert!(w[0].end + 1 < w[1].start);
        }
        for x in -25..80 {
            let inside = list.periods().iter().any(|p| p.contains(x));
            prop_assert_eq!(inside, covers(&ranges, x));
        }
    }

    #[test]
    fn prop_subtract_is_set_difference(a in period_list(), b in period_list()) {
        let diff = to_list(&a).subtract(&to_list(&b));
        for w in diff.periods().windows(2) {
            prop_assert!(w[0].end + 1 < w[1].start);
        }
        let expected = (-25..80).filter(|&x| covers(&a, x) && !covers(&b, x)).count() as i64;
        prop_assert_eq!(diff.total_len(), expected);
        for x in -25..80 {
            let inside = diff.periods().iter().any(|p| p.contains(x));
            prop_assert_eq!(inside, covers(&a, x) && !covers(&b, x));
        }
    }

    #[test]
    fn prop_membership_matches_periods(ranges in period_list(), first in -25i64..40, len in 0i64..40) {
        let list = to_list(&ranges);
        let last = first + len;
        let members: Vec<bool> = list.membership(first, last).collect();
        prop_assert_eq!(members.len() as i64, len + 1);
        for (i, member) in members.into_iter().enumerate() {
            prop_assert_eq!(member, covers(&ranges, first + i as i64));
        }
    }

    #[test]
    fn prop_start_timestamp_round_trip(half in 1i64..500, t in -1_000_000i64..1_000_000) {
        let ns = half * 2;
        let time = Time::new(ns).unwrap();
        let start = time.start_of_timeslice(time.timeslice_for_start_timestamp(t));
        prop_assert!((start - t).abs() <= ns / 2);
    }

    #[test]
    fn prop_start_and_end_agree_on_slice_boundaries(ns in 2i64..1000, k in -1000i64..1000) {
        let time = Time::new(ns).unwrap();
        let t = k * ns;
        prop_assert_eq!(time.timeslice_for_start_timestamp(t), k);
        prop_assert_eq!(time.timeslice_for_end_timestamp(t), k - 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_exact_claimants_never_over_attribute(tasks in tasks(), value in 0.0f64..10.0) {
        let job = load(task_job(&tasks, value));
        let attribution = attribute(&job);
        let samples = samples(&job, &attribution);
        for (t, (total, _)) in attributed_totals(&job, &attribution) {
            prop_assert!(total <= samples[&t] + 1e-9, "timeslice {}: {} > {}", t, total, samples[&t]);
        }
    }

    #[test]
    fn prop_variable_claimants_share_the_whole_sample(tasks in tasks(), value in 0.0f64..10.0) {
        let mut description = task_job(&tasks, value);
        description["rules"][0]["consumable"] = json!({ "variable": 1.0 });
        let job = load(description);
        let attribution = attribute(&job);
        let samples = samples(&job, &attribution);
        for (t, (total, any_active)) in attributed_totals(&job, &attribution) {
            if any_active {
                prop_assert!((total - samples[&t]).abs() <= 1e-9, "timeslice {}: {} != {}", t, total, samples[&t]);
            }
        }
    }

    #[test]
    fn prop_lower_local_threshold_only_adds_bottlenecks(
        tasks in tasks(),
        value in 0.0f64..10.0,
        low in 0.05f64..1.0,
        raise in 0.0f64..0.5,
    ) {
        let job = load(task_job(&tasks, value));
        let attribution = attribute(&job);
        let metric = cpu(&job);

        let strict = BottleneckIdentificationSettings {
            local_threshold: low + raise,
            ..BottleneckIdentificationSettings::default()
        };
        let lenient = BottleneckIdentificationSettings {
            local_threshold: low,
            ..BottleneckIdentificationSettings::default()
        };
        let strict = BottleneckIdentification::execute(&attribution, &strict);
        let lenient = BottleneckIdentification::execute(&attribution, &lenient);

        for leaf in job.execution.leaf_phases() {
            let before: Vec<BottleneckStatus> =
                strict.metric_bottlenecks(leaf.id).iter(metric).unwrap().collect();
            let after: Vec<BottleneckStatus> =
                lenient.metric_bottlenecks(leaf.id).iter(metric).unwrap().collect();
            for (b, a) in before.into_iter().zip(after) {
                prop_assert!(a >= b);
                if b == BottleneckStatus::Global {
                    prop_assert_eq!(a, BottleneckStatus::Global);
                }
            }
        }
    }

    #[test]
    fn prop_saturated_sample_is_global(tasks in tasks(), value in 9.5f64..10.0, local in 0.05f64..1.0) {
        let job = load(task_job(&tasks, value));
        let attribution = attribute(&job);
        let metric = cpu(&job);
        let settings = BottleneckIdentificationSettings {
            local_threshold: local,
            ..BottleneckIdentificationSettings::default()
        };
        let result = BottleneckIdentification::execute(&attribution, &settings);

        for leaf in job.execution.leaf_phases() {
            let statuses = result.metric_bottlenecks(leaf.id).iter(metric).unwrap();
            let active = attribution.active_iter(leaf.id).unwrap();
            for (status, is_active) in statuses.zip(active) {
                if is_active {
                    prop_assert_eq!(status, BottleneckStatus::Global);
                }
            }
        }
    }
}

//! Impact of removing the bottlenecks on one metric or metric type

use super::{HierarchicalPass, IssueContext, PerformanceIssue, PerformanceIssueIdentificationPass};
use crate::bottleneck::{BottleneckKey, BottleneckSource, PhaseBottlenecks};
use crate::error::Result;
use crate::model::{ExecutionModel, MetricId, MetricTypeId, PhaseId, PhaseTypeId, ResourceModel};
use crate::simulation::PhaseDurationMap;
use crate::time::{FractionalTimesliceCount, TimesliceCount};
use std::collections::BTreeMap;

/// Bottleneck source removed from the phases of one type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BottleneckSpecification {
    pub source: BottleneckSource,
    pub target_type: PhaseTypeId,
}

/// Estimates, for every phase, how much shorter its simulated execution
/// would be if the phases of a type were never uniquely bottlenecked on a
/// metric type (and optionally a single metric)
#[derive(Debug, Clone, Default)]
pub struct BottleneckDurationPass {
    pub include_metric_bottlenecks: bool,
}

pub struct BottleneckDurationResult {
    simulated: FractionalTimesliceCount,
    durations: PhaseDurationMap,
    without: BTreeMap<BottleneckSpecification, (FractionalTimesliceCount, PhaseDurationMap)>,
}

impl BottleneckDurationPass {
    fn leaf_scenarios<K: BottleneckKey>(
        view: &PhaseBottlenecks<'_, K>,
        target_type: PhaseTypeId,
        simulated: FractionalTimesliceCount,
        durations: &PhaseDurationMap,
        out: &mut BTreeMap<BottleneckSpecification, (FractionalTimesliceCount, PhaseDurationMap)>,
    ) -> Result<()> {
        let leaf = view.phase();
        for key in view.keys() {
            let duration = simulated - view.time_uniquely_bottlenecked_on(key)? as f64;
            let mut map = durations.clone();
            map.set(leaf, duration);
            let spec = BottleneckSpecification {
                source: key.source(),
                target_type,
            };
            out.insert(spec, (duration, map));
        }
        Ok(())
    }
}

impl HierarchicalPass for BottleneckDurationPass {
    type PhaseResult = BottleneckDurationResult;

    fn analyze_leaf(&self, context: &IssueContext<'_>, leaf: PhaseId) -> Result<Self::PhaseResult> {
        let simulated = context.bottlenecked_duration(leaf)?;
        let mut durations = context.simulator.new_duration_map(leaf);
        durations.set(leaf, simulated);

        let target_type = context.execution.phase(leaf).type_id;
        let mut without = BTreeMap::new();
        Self::leaf_scenarios(
            &context.bottlenecks.metric_type_bottlenecks(leaf),
            target_type,
            simulated,
            &durations,
            &mut without,
        )?;
        if self.include_metric_bottlenecks {
            Self::leaf_scenarios(
                &context.bottlenecks.metric_bottlenecks(leaf),
                target_type,
                simulated,
                &durations,
                &mut without,
            )?;
        }

        Ok(BottleneckDurationResult {
            simulated,
            durations,
            without,
        })
    }

    fn combine(
        &self,
        context: &IssueContext<'_>,
        composite: PhaseId,
        subphases: Vec<(PhaseId, Self::PhaseResult)>,
    ) -> Result<Self::PhaseResult> {
        let mut durations = context.simulator.new_duration_map(composite);
        for (subphase, result) in &subphases {
            durations.copy_range_from(&result.durations, *subphase)?;
        }
        let simulated = context.simulate(composite, &durations)?;

        // Subphases without a scenario keep their baseline durations
        let mut maps: BTreeMap<BottleneckSpecification, PhaseDurationMap> = BTreeMap::new();
        for (subphase, result) in subphases {
            for (spec, (_, map)) in result.without {
                maps.entry(spec)
                    .or_insert_with(|| durations.clone())
                    .copy_range_from(&map, subphase)?;
            }
        }

        let mut without = BTreeMap::new();
        for (spec, map) in maps {
            let duration = context.simulate(composite, &map)?;
            without.insert(spec, (duration, map));
        }

        Ok(BottleneckDurationResult {
            simulated,
            durations,
            without,
        })
    }

    fn extract_issues(
        &self,
        context: &IssueContext<'_>,
        phase: PhaseId,
        result: &Self::PhaseResult,
    ) -> Vec<PerformanceIssue> {
        let real_duration = context.execution.phase(phase).duration();
        result
            .without
            .iter()
            .map(|(&spec, &(duration, _))| {
                PerformanceIssue::BottleneckDuration(BottleneckDurationIssue {
                    aggregate_phase: phase,
                    spec,
                    simulated_duration: result.simulated,
                    simulated_duration_without: duration,
                    real_duration,
                })
            })
            .collect()
    }
}

impl PerformanceIssueIdentificationPass for BottleneckDurationPass {
    fn name(&self) -> &'static str {
        "bottleneck-duration"
    }

    fn description(&self) -> &'static str {
        "Time saved by removing the bottlenecks on one resource"
    }

    fn execute(&self, context: &IssueContext<'_>) -> Result<Vec<PerformanceIssue>> {
        self.run(context)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BottleneckDurationIssue {
    pub aggregate_phase: PhaseId,
    pub spec: BottleneckSpecification,
    pub simulated_duration: FractionalTimesliceCount,
    pub simulated_duration_without: FractionalTimesliceCount,
    pub real_duration: TimesliceCount,
}

impl BottleneckDurationIssue {
    /// The aggregate phase and every phase of the target type within it
    pub fn affected_phases(&self, execution: &ExecutionModel) -> Vec<PhaseId> {
        let mut phases = vec![self.aggregate_phase];
        phases.extend(
            execution
                .find_phases_for_type(self.aggregate_phase, self.spec.target_type)
                .unwrap_or_default()
                .into_iter()
                .filter(|&p| p != self.aggregate_phase),
        );
        phases
    }

    pub(super) fn affects(&self, execution: &ExecutionModel, phase: PhaseId) -> bool {
        phase == self.aggregate_phase
            || (execution.phase(phase).type_id == self.spec.target_type
                && execution.is_ancestor_or_self(self.aggregate_phase, phase))
    }

    pub fn affected_metrics(&self) -> Option<Vec<MetricId>> {
        match self.spec.source {
            BottleneckSource::Metric(metric) => Some(vec![metric]),
            BottleneckSource::MetricType(_) => None,
        }
    }

    pub fn affected_metric_types(&self) -> Option<Vec<MetricTypeId>> {
        match self.spec.source {
            BottleneckSource::Metric(_) => None,
            BottleneckSource::MetricType(metric_type) => Some(vec![metric_type]),
        }
    }

    pub fn display(&self, execution: &ExecutionModel, resources: &ResourceModel) -> String {
        let source = match self.spec.source {
            BottleneckSource::Metric(m) => format!("metric \"{}\"", m.describe(resources)),
            BottleneckSource::MetricType(t) => format!("metric type \"{}\"", t.describe(resources)),
        };
        let phase = execution.phase(self.aggregate_phase);
        if self.spec.target_type == phase.type_id {
            format!(
                "Bottlenecks on {source} for simulated execution of phase \"{}\"",
                phase.path
            )
        } else {
            format!(
                "Bottlenecks on {source} in phases of type \"{}\" for simulated execution of phase \"{}\"",
                execution.specification().phase_type(self.spec.target_type).path,
                phase.path
            )
        }
    }
}

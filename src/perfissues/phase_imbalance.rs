//! Impact of uneven work among interchangeable phases

use super::{HierarchicalPass, IssueContext, PerformanceIssue, PerformanceIssueIdentificationPass};
use crate::error::Result;
use crate::model::{ExecutionModel, PhaseId, PhaseTypeId};
use crate::simulation::PhaseDurationMap;
use crate::time::{FractionalTimesliceCount, TimesliceCount};
use std::collections::{BTreeMap, BTreeSet};

/// Phases of `target_type` balanced within `pivot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImbalanceSpecification {
    pub pivot: PhaseId,
    pub target_type: PhaseTypeId,
}

/// Estimates how much shorter phases would run if every group of
/// interchangeable phases took its mean duration
///
/// Scenarios found below a phase are carried up to ancestors at most
/// `max_depth` levels above the pivot, or further while the pivot is the
/// only subphase of its type.
#[derive(Debug, Clone)]
pub struct PhaseImbalancePass {
    pub max_depth: usize,
}

impl Default for PhaseImbalancePass {
    fn default() -> Self {
        Self { max_depth: 1 }
    }
}

pub struct PhaseImbalanceResult {
    simulated: FractionalTimesliceCount,
    durations: PhaseDurationMap,
    without: BTreeMap<ImbalanceSpecification, (FractionalTimesliceCount, PhaseDurationMap)>,
}

fn depth(execution: &ExecutionModel, phase: PhaseId) -> usize {
    execution.ancestors(phase).count()
}

fn subphases_of_type(
    execution: &ExecutionModel,
    phase: PhaseId,
    phase_type: PhaseTypeId,
) -> impl Iterator<Item = PhaseId> + '_ {
    execution
        .phase(phase)
        .subphases
        .iter()
        .copied()
        .filter(move |&s| execution.phase(s).type_id == phase_type)
}

/// Types strictly between the type of `composite` and `target`, plus `target`
fn type_chain(
    execution: &ExecutionModel,
    composite: PhaseId,
    target: PhaseTypeId,
) -> Option<Vec<PhaseTypeId>> {
    let spec = execution.specification();
    let top = execution.phase(composite).type_id;
    let mut chain = Vec::new();
    let mut current = target;
    while current != top {
        chain.push(current);
        current = spec.phase_type(current).parent?;
    }
    chain.reverse();
    Some(chain)
}

/// Groups of phases of `target` under `composite` that should do equal work
///
/// Descending from `composite`, a repeatable level whose instances are not
/// interchangeable splits every group into one group per instance.
fn interchangeable_groups(
    execution: &ExecutionModel,
    composite: PhaseId,
    target: PhaseTypeId,
) -> Vec<Vec<PhaseId>> {
    let Some(chain) = type_chain(execution, composite, target) else {
        return Vec::new();
    };
    let spec = execution.specification();
    let mut groups = vec![vec![composite]];
    for level in chain {
        let repeatability = &spec.phase_type(level).repeatability;
        groups = if repeatability.is_repeatable() && !repeatability.is_interchangeable() {
            groups
                .iter()
                .flatten()
                .flat_map(|&p| subphases_of_type(execution, p, level))
                .map(|p| vec![p])
                .collect()
        } else {
            groups
                .iter()
                .map(|group| {
                    group
                        .iter()
                        .flat_map(|&p| subphases_of_type(execution, p, level))
                        .collect::<Vec<_>>()
                })
                .filter(|group| !group.is_empty())
                .collect()
        };
    }
    groups.retain(|group| group.len() > 1);
    groups
}

fn descendant_types(execution: &ExecutionModel, phase_type: PhaseTypeId) -> Vec<PhaseTypeId> {
    let spec = execution.specification();
    let mut types = Vec::new();
    let mut stack: Vec<PhaseTypeId> = spec.phase_type(phase_type).subtypes.iter().rev().copied().collect();
    while let Some(t) = stack.pop() {
        types.push(t);
        stack.extend(spec.phase_type(t).subtypes.iter().rev().copied());
    }
    types
}

impl PhaseImbalancePass {
    /// Scenario in which every group of interchangeable phases is balanced
    fn balance(
        execution: &ExecutionModel,
        composite: PhaseId,
        groups: &[Vec<PhaseId>],
        durations: &PhaseDurationMap,
        map: &mut PhaseDurationMap,
    ) {
        let mut parents_to_clear = BTreeSet::new();
        for group in groups {
            let values: Vec<f64> = group.iter().filter_map(|&p| durations.get(p)).collect();
            // Phases that must be derived from their subphases cannot be balanced
            if values.len() != group.len() || values.iter().any(|d| !d.is_finite()) {
                continue;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            for &phase in group {
                map.set(phase, mean);
                for parent in execution.ancestors(phase) {
                    if parent == composite || !parents_to_clear.insert(parent) {
                        break;
                    }
                }
            }
        }
        for parent in parents_to_clear {
            map.clear(parent);
        }
    }
}

impl HierarchicalPass for PhaseImbalancePass {
    type PhaseResult = PhaseImbalanceResult;

    fn analyze_leaf(&self, context: &IssueContext<'_>, leaf: PhaseId) -> Result<Self::PhaseResult> {
        let simulated = context.bottlenecked_duration(leaf)?;
        let mut durations = context.simulator.new_duration_map(leaf);
        durations.set(leaf, simulated);
        Ok(PhaseImbalanceResult {
            simulated,
            durations,
            without: BTreeMap::new(),
        })
    }

    fn combine(
        &self,
        context: &IssueContext<'_>,
        composite: PhaseId,
        subphases: Vec<(PhaseId, Self::PhaseResult)>,
    ) -> Result<Self::PhaseResult> {
        let execution = context.execution;
        let spec = execution.specification();
        let composite_type = execution.phase(composite).type_id;
        let composite_depth = depth(execution, composite);

        let mut durations = context.simulator.new_duration_map(composite);
        for (subphase, result) in &subphases {
            durations.copy_range_from(&result.durations, *subphase)?;
        }
        let simulated = context.simulate(composite, &durations)?;

        let mut without = BTreeMap::new();

        // Scenarios of subphases
        for (subphase, result) in &subphases {
            let subphase_type = execution.phase(*subphase).type_id;
            let unique_for_type = !spec.phase_type(subphase_type).repeatability.is_repeatable()
                || subphases_of_type(execution, composite, subphase_type).count() == 1;
            for (scenario, (_, overrides)) in &result.without {
                let pivot_is_unique = scenario.pivot == *subphase && unique_for_type;
                if !pivot_is_unique && depth(execution, scenario.pivot) - composite_depth > self.max_depth {
                    continue;
                }
                let mut map = durations.clone();
                map.copy_range_from(overrides, *subphase)?;
                let duration = context.simulate(composite, &map)?;
                let key = if pivot_is_unique {
                    ImbalanceSpecification {
                        pivot: composite,
                        target_type: scenario.target_type,
                    }
                } else {
                    *scenario
                };
                map.set(composite, duration);
                without.insert(key, (duration, map));
            }
        }

        // Scenarios pivoting on this phase
        for target_type in descendant_types(execution, composite_type) {
            let key = ImbalanceSpecification {
                pivot: composite,
                target_type,
            };
            if without.contains_key(&key) {
                continue;
            }
            let groups = interchangeable_groups(execution, composite, target_type);
            let Some(&direct_type) = type_chain(execution, composite, target_type)
                .as_ref()
                .and_then(|chain| chain.first())
            else {
                continue;
            };
            if groups.is_empty() {
                continue;
            }

            let mut map = durations.clone();
            let mut reused = false;
            if !spec.phase_type(direct_type).repeatability.is_interchangeable() {
                for (subphase, result) in &subphases {
                    let child_key = ImbalanceSpecification {
                        pivot: *subphase,
                        target_type,
                    };
                    if let Some((_, overrides)) = result.without.get(&child_key) {
                        map.copy_range_from(overrides, *subphase)?;
                        reused = true;
                    }
                }
            }
            if !reused {
                Self::balance(execution, composite, &groups, &durations, &mut map);
            }

            let duration = context.simulate(composite, &map)?;
            map.set(composite, duration);
            without.insert(key, (duration, map));
        }

        durations.set(composite, simulated);
        Ok(PhaseImbalanceResult {
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
            .map(|(scenario, &(duration, _))| {
                PerformanceIssue::PhaseImbalance(PhaseImbalanceIssue {
                    root_phase: phase,
                    pivot: scenario.pivot,
                    target_type: scenario.target_type,
                    simulated_duration: result.simulated,
                    simulated_duration_without: duration,
                    real_duration,
                })
            })
            .collect()
    }
}

impl PerformanceIssueIdentificationPass for PhaseImbalancePass {
    fn name(&self) -> &'static str {
        "phase-imbalance"
    }

    fn description(&self) -> &'static str {
        "Time saved by balancing work among interchangeable phases"
    }

    fn execute(&self, context: &IssueContext<'_>) -> Result<Vec<PerformanceIssue>> {
        self.run(context)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseImbalanceIssue {
    pub root_phase: PhaseId,
    pub pivot: PhaseId,
    pub target_type: PhaseTypeId,
    pub simulated_duration: FractionalTimesliceCount,
    pub simulated_duration_without: FractionalTimesliceCount,
    pub real_duration: TimesliceCount,
}

impl PhaseImbalanceIssue {
    pub fn display(&self, execution: &ExecutionModel) -> String {
        let target = &execution.specification().phase_type(self.target_type).path;
        let root = &execution.phase(self.root_phase).path;
        if self.pivot == self.root_phase {
            format!("Imbalance in \"{target}\" phases for simulated execution of phase \"{root}\"")
        } else {
            format!(
                "Imbalance in \"{target}\" phases within phase \"{}\" for simulated execution of phase \"{root}\"",
                execution.phase(self.pivot).path
            )
        }
    }
}

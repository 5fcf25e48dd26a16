//! Resource constraints on concurrently running phases

use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, PhaseId, PhaseTypeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A pool of `limit` units shared by a set of phases
///
/// A phase holds its requirement from its start until its end. Phases may
/// not be ancestors of each other, and a phase may be subject to at most one
/// constraint per simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingConstraint {
    pub limit: u64,
    pub requirements: Vec<(PhaseId, u64)>,
}

/// Produces the constraints that apply to one execution
pub trait SchedulingConstraintRule: Send + Sync {
    fn create_constraints(&self, execution: &ExecutionModel) -> Result<Vec<SchedulingConstraint>>;
}

/// Where the concurrency limit of a [`ConcurrencyConstraintRule`] comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyLimit {
    Fixed(u64),
    /// Unsigned integer annotation on each per-instance phase
    Annotation(String),
}

/// At most `limit` phases of `constrained_type` run at once within each
/// phase of `per_instance_type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConstraintRule {
    pub per_instance_type: PhaseTypeId,
    pub constrained_type: PhaseTypeId,
    pub limit: ConcurrencyLimit,
}

impl SchedulingConstraintRule for ConcurrencyConstraintRule {
    fn create_constraints(&self, execution: &ExecutionModel) -> Result<Vec<SchedulingConstraint>> {
        let instances = execution.find_phases_for_type(execution.root(), self.per_instance_type)?;
        instances
            .into_iter()
            .map(|instance| {
                let limit = match &self.limit {
                    ConcurrencyLimit::Fixed(limit) => *limit,
                    ConcurrencyLimit::Annotation(key) => execution
                        .phase(instance)
                        .annotation(key)
                        .and_then(serde_json::Value::as_u64)
                        .ok_or_else(|| {
                            AnalysisError::Configuration(format!(
                                "phase \"{}\" has no unsigned integer annotation \"{key}\"",
                                execution.phase(instance).path
                            ))
                        })?,
                };
                let requirements = execution
                    .find_phases_for_type(instance, self.constrained_type)?
                    .into_iter()
                    .map(|phase| (phase, 1))
                    .collect();
                Ok(SchedulingConstraint {
                    limit,
                    requirements,
                })
            })
            .collect()
    }
}

/// Phases whose duration may not be overridden
///
/// Overriding a phase that contains some, but not all, of a group of
/// constrained phases that may run concurrently would hide the contention
/// between them. For each constraint the phases are split into disjoint sets
/// that can run concurrently, and every phase strictly between a member and
/// its set's common ancestor is blocked.
pub(crate) fn blocked_overrides(
    execution: &ExecutionModel,
    constraints: &[SchedulingConstraint],
) -> Result<Vec<bool>> {
    let mut blocked = vec![false; execution.phase_count()];
    for constraint in constraints {
        let phases: Vec<PhaseId> = constraint.requirements.iter().map(|&(p, _)| p).collect();
        let Some(ancestor) = common_ancestor(execution, &phases) else {
            continue;
        };
        for set in disjoint_subsets(execution, &phases, ancestor)? {
            let Some(set_ancestor) = common_ancestor(execution, &set) else {
                continue;
            };
            for &phase in &set {
                if phase == set_ancestor {
                    continue;
                }
                for parent in execution.ancestors(phase) {
                    if parent == set_ancestor {
                        break;
                    }
                    blocked[parent.index()] = true;
                }
            }
        }
    }
    Ok(blocked)
}

fn common_ancestor(execution: &ExecutionModel, phases: &[PhaseId]) -> Option<PhaseId> {
    let (&first, rest) = phases.split_first()?;
    std::iter::once(first)
        .chain(execution.ancestors(first))
        .find(|&candidate| rest.iter().all(|&p| execution.is_ancestor_or_self(candidate, p)))
}

fn disjoint_subsets(
    execution: &ExecutionModel,
    phases: &[PhaseId],
    ancestor: PhaseId,
) -> Result<Vec<Vec<PhaseId>>> {
    if phases.len() <= 1 {
        return Ok(if phases.is_empty() {
            Vec::new()
        } else {
            vec![phases.to_vec()]
        });
    }

    // Group by the subphase of `ancestor` each phase lies in
    let mut groups: BTreeMap<PhaseId, Vec<PhaseId>> = BTreeMap::new();
    for &phase in phases {
        let child = std::iter::once(phase)
            .chain(execution.ancestors(phase))
            .find(|&p| execution.phase(p).parent == Some(ancestor))
            .ok_or_else(|| {
                AnalysisError::Configuration(format!(
                    "constrained phases \"{}\" and \"{}\" are in an ancestor relationship",
                    execution.phase(ancestor).path,
                    execution.phase(phase).path
                ))
            })?;
        groups.entry(child).or_default().push(phase);
    }

    let children: Vec<PhaseId> = groups.keys().copied().collect();
    let mut sets = Vec::new();
    for concurrent in concurrent_groups(execution, &children) {
        if let [child] = concurrent[..] {
            sets.extend(disjoint_subsets(execution, &groups[&child], child)?);
        } else {
            sets.push(concurrent.iter().flat_map(|c| groups[c].iter().copied()).collect());
        }
    }
    Ok(sets)
}

/// Split siblings into groups that may overlap in time
///
/// A sibling ordered (through dependencies) against every other sibling runs
/// alone. The others are grouped by which of those sequential siblings they
/// follow.
fn concurrent_groups(execution: &ExecutionModel, siblings: &[PhaseId]) -> Vec<Vec<PhaseId>> {
    let members: BTreeSet<PhaseId> = siblings.iter().copied().collect();
    let closures: Vec<BTreeSet<PhaseId>> = siblings
        .iter()
        .map(|&p| {
            dependency_closure(execution, p)
                .intersection(&members)
                .copied()
                .collect()
        })
        .collect();
    let reverse_counts: Vec<usize> = siblings
        .iter()
        .map(|p| closures.iter().filter(|c| c.contains(p)).count())
        .collect();

    let sequential: BTreeSet<PhaseId> = siblings
        .iter()
        .enumerate()
        .filter(|&(i, _)| closures[i].len() + reverse_counts[i] + 1 == siblings.len())
        .map(|(_, &p)| p)
        .collect();

    let mut groups: Vec<Vec<PhaseId>> = sequential.iter().map(|&p| vec![p]).collect();
    let mut by_predecessors: BTreeMap<Vec<PhaseId>, Vec<PhaseId>> = BTreeMap::new();
    for (i, &phase) in siblings.iter().enumerate() {
        if !sequential.contains(&phase) {
            let key = closures[i].intersection(&sequential).copied().collect();
            by_predecessors.entry(key).or_default().push(phase);
        }
    }
    groups.extend(by_predecessors.into_values());
    groups
}

fn dependency_closure(execution: &ExecutionModel, phase: PhaseId) -> BTreeSet<PhaseId> {
    let mut seen = BTreeSet::new();
    let mut stack = execution.phase(phase).dependencies.clone();
    while let Some(next) = stack.pop() {
        if seen.insert(next) {
            stack.extend(execution.phase(next).dependencies.iter().copied());
        }
    }
    seen
}

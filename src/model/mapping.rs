//! Declarative visibility of resource subtrees to phase subtrees

use super::execution::{ExecutionModel, PhaseId};
use super::resource::{MetricId, ResourceId, ResourceModel};
use std::collections::BTreeSet;

/// Which resources each part of the phase tree may use
///
/// Every entry grants the subtree of `phase` access to every metric in the
/// subtree of `resource`. A leaf phase sees the union of the grants of itself
/// and all of its ancestors.
#[derive(Debug, Clone, Default)]
pub struct PhaseToResourceMapping {
    entries: Vec<(PhaseId, ResourceId)>,
}

impl PhaseToResourceMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant all phases access to all resources
    pub fn everything(execution: &ExecutionModel, resources: &ResourceModel) -> Self {
        Self {
            entries: vec![(execution.root(), resources.root())],
        }
    }

    pub fn add(&mut self, phase: PhaseId, resource: ResourceId) {
        self.entries.push((phase, resource));
    }

    pub fn entries(&self) -> &[(PhaseId, ResourceId)] {
        &self.entries
    }

    /// Metrics visible to `phase`, sorted by id
    pub fn visible_metrics(
        &self,
        execution: &ExecutionModel,
        resources: &ResourceModel,
        phase: PhaseId,
    ) -> Vec<MetricId> {
        let mut visible = BTreeSet::new();
        for &(granted, resource) in &self.entries {
            if execution.is_ancestor_or_self(granted, phase) {
                visible.extend(resources.metrics_in_subtree(resource));
            }
        }
        visible.into_iter().collect()
    }
}

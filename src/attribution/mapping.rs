//! Precomputed leaf phase to metric visibility

use crate::model::{ExecutionModel, MetricClass, MetricId, PhaseId, PhaseToResourceMapping, ResourceModel};
use crate::time::TimesliceId;

/// Bidirectional visibility between leaf phases and metrics
#[derive(Debug, Clone)]
pub struct PhaseMetricMappingCache {
    leaf_phases: Vec<PhaseId>,
    consumable_metrics: Vec<MetricId>,
    blocking_metrics: Vec<MetricId>,
    /// Indexed by phase id; empty for composite phases
    leaf_to_metrics: Vec<Vec<MetricId>>,
    /// Indexed by metric id
    metric_to_leaves: Vec<Vec<PhaseId>>,
    first_timeslice: TimesliceId,
    last_timeslice: TimesliceId,
}

impl PhaseMetricMappingCache {
    pub fn build(
        execution: &ExecutionModel,
        resources: &ResourceModel,
        mapping: &PhaseToResourceMapping,
    ) -> Self {
        let leaf_phases: Vec<PhaseId> = execution.leaf_phases().map(|p| p.id).collect();

        let mut leaf_to_metrics = vec![Vec::new(); execution.phase_count()];
        let mut metric_to_leaves = vec![Vec::new(); resources.metric_count()];
        for &leaf in &leaf_phases {
            let visible = mapping.visible_metrics(execution, resources, leaf);
            for &metric in &visible {
                metric_to_leaves[metric.index()].push(leaf);
            }
            leaf_to_metrics[leaf.index()] = visible;
        }

        let (consumable_metrics, blocking_metrics) = resources
            .metrics()
            .map(|m| (m.id, m.class()))
            .partition::<Vec<_>, _>(|(_, class)| *class == MetricClass::Consumable);

        let first_timeslice = execution
            .phases()
            .map(|p| p.first_timeslice)
            .min()
            .unwrap_or(0);
        let last_timeslice = execution
            .phases()
            .map(|p| p.last_timeslice)
            .max()
            .unwrap_or(-1);

        Self {
            leaf_phases,
            consumable_metrics: consumable_metrics.into_iter().map(|(m, _)| m).collect(),
            blocking_metrics: blocking_metrics.into_iter().map(|(m, _)| m).collect(),
            leaf_to_metrics,
            metric_to_leaves,
            first_timeslice,
            last_timeslice,
        }
    }

    pub fn leaf_phases(&self) -> &[PhaseId] {
        &self.leaf_phases
    }

    pub fn consumable_metrics(&self) -> &[MetricId] {
        &self.consumable_metrics
    }

    pub fn blocking_metrics(&self) -> &[MetricId] {
        &self.blocking_metrics
    }

    /// Metrics visible to a leaf phase
    pub fn metrics_for_leaf(&self, phase: PhaseId) -> &[MetricId] {
        self.leaf_to_metrics
            .get(phase.index())
            .map_or(&[], Vec::as_slice)
    }

    /// Leaf phases allowed to claim a metric
    pub fn leaves_for_metric(&self, metric: MetricId) -> &[PhaseId] {
        self.metric_to_leaves
            .get(metric.index())
            .map_or(&[], Vec::as_slice)
    }

    /// First timeslice of the analysed range (earliest phase start)
    pub fn first_timeslice(&self) -> TimesliceId {
        self.first_timeslice
    }

    /// Last timeslice of the analysed range (latest phase end)
    pub fn last_timeslice(&self) -> TimesliceId {
        self.last_timeslice
    }
}

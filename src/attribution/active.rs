//! Active phase detection
//!
//! A leaf phase is active in every timeslice of its range except the ones in
//! which a visible blocking metric it is fully subject to (rule `Full`) is
//! blocked. Only leaf phases with at least one non-`None` rule get a result.

use super::mapping::PhaseMetricMappingCache;
use super::rules::{BlockingAttributionRule, ResourceAttributionRuleProvider};
use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, MetricKind, PhaseId, ResourceModel};
use crate::time::{Membership, PeriodList, TimesliceId, Timeslices};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivePhaseDetectionResult {
    active: BTreeMap<PhaseId, PeriodList<Timeslices>>,
}

impl ActivePhaseDetectionResult {
    pub fn execute(
        execution: &ExecutionModel,
        resources: &ResourceModel,
        cache: &PhaseMetricMappingCache,
        rules: &dyn ResourceAttributionRuleProvider,
    ) -> Self {
        let mut active = BTreeMap::new();
        for &leaf in cache.leaf_phases() {
            let phase = execution.phase(leaf);
            let mut has_rule = false;
            let mut blocked = Vec::new();

            for &metric_id in cache.metrics_for_leaf(leaf) {
                let metric = resources.metric(metric_id);
                match &metric.kind {
                    MetricKind::Consumable { .. } => {
                        has_rule |= !rules.consumable_rule(phase.type_id, metric.type_id).is_none();
                    }
                    MetricKind::Blocking { blocked: periods } => {
                        if rules.blocking_rule(phase.type_id, metric.type_id)
                            == BlockingAttributionRule::Full
                        {
                            has_rule = true;
                            blocked.extend_from_slice(periods.periods());
                        }
                    }
                }
            }

            if has_rule {
                let range = PeriodList::single(phase.timeslice_range());
                active.insert(leaf, range.subtract(&PeriodList::new(blocked)));
            }
        }
        Self { active }
    }

    pub fn phases(&self) -> impl Iterator<Item = PhaseId> + '_ {
        self.active.keys().copied()
    }

    pub fn active_periods(&self, phase: PhaseId) -> Result<&PeriodList<Timeslices>> {
        self.active
            .get(&phase)
            .ok_or_else(|| AnalysisError::not_found("active phase result", phase.to_string()))
    }

    /// One `bool` per timeslice in `[first, last]`
    pub fn active_iter(
        &self,
        phase: PhaseId,
        first: TimesliceId,
        last: TimesliceId,
    ) -> Result<Membership<'_, Timeslices>> {
        Ok(self.active_periods(phase)?.membership(first, last))
    }
}

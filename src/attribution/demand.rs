//! Resource demand estimation
//!
//! For every consumable metric, sums the exact demand and the variable weights
//! of all claimant leaf phases that are active in each timeslice. All arrays
//! span the same range: from the earliest phase start to the latest phase end.

use super::active::ActivePhaseDetectionResult;
use super::mapping::PhaseMetricMappingCache;
use super::rules::{ConsumableAttributionRule, ResourceAttributionRuleProvider};
use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, MetricId, ResourceModel};
use crate::time::TimesliceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricDemand {
    exact: Vec<f64>,
    variable: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDemandEstimationResult {
    first_timeslice: TimesliceId,
    last_timeslice: TimesliceId,
    demand: BTreeMap<MetricId, MetricDemand>,
}

/// Total demand on a metric in one timeslice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Demand {
    pub timeslice: TimesliceId,
    pub exact: f64,
    pub variable: f64,
}

impl ResourceDemandEstimationResult {
    /// # Errors
    ///
    /// Fails if a claimant phase with a non-`None` rule has no active-phase result.
    pub fn execute(
        execution: &ExecutionModel,
        resources: &ResourceModel,
        cache: &PhaseMetricMappingCache,
        rules: &dyn ResourceAttributionRuleProvider,
        active: &ActivePhaseDetectionResult,
    ) -> Result<Self> {
        let first_timeslice = cache.first_timeslice();
        let last_timeslice = cache.last_timeslice();
        let len = usize::try_from(last_timeslice - first_timeslice + 1).unwrap_or(0);

        let mut demand = BTreeMap::new();
        for &metric_id in cache.consumable_metrics() {
            let metric = resources.metric(metric_id);
            let mut exact = vec![0.0; len];
            let mut variable = vec![0.0; len];

            for &leaf in cache.leaves_for_metric(metric_id) {
                let phase = execution.phase(leaf);
                let (target, amount) = match rules.consumable_rule(phase.type_id, metric.type_id) {
                    ConsumableAttributionRule::Exact(d) => (&mut exact, d),
                    ConsumableAttributionRule::Variable(d) => (&mut variable, d),
                    ConsumableAttributionRule::None => continue,
                };
                let offset = (phase.first_timeslice - first_timeslice) as usize;
                let bits = active.active_iter(leaf, phase.first_timeslice, phase.last_timeslice)?;
                for (i, is_active) in bits.enumerate() {
                    if is_active {
                        target[offset + i] += amount;
                    }
                }
            }

            demand.insert(metric_id, MetricDemand { exact, variable });
        }

        Ok(Self {
            first_timeslice,
            last_timeslice,
            demand,
        })
    }

    pub fn first_timeslice(&self) -> TimesliceId {
        self.first_timeslice
    }

    pub fn last_timeslice(&self) -> TimesliceId {
        self.last_timeslice
    }

    pub fn metrics(&self) -> impl Iterator<Item = MetricId> + '_ {
        self.demand.keys().copied()
    }

    /// Demand on `metric` for each timeslice in `[first, last]`
    ///
    /// # Errors
    ///
    /// Fails for unknown metrics and ranges outside the estimated range.
    pub fn demand_iter(
        &self,
        metric: MetricId,
        first: TimesliceId,
        last: TimesliceId,
    ) -> Result<DemandIter<'_>> {
        let demand = self
            .demand
            .get(&metric)
            .ok_or_else(|| AnalysisError::not_found("demand for metric", metric.to_string()))?;
        if first <= last && (first < self.first_timeslice || last > self.last_timeslice) {
            return Err(AnalysisError::Inconsistency {
                message: format!(
                    "demand range [{first}, {last}] outside estimated range [{}, {}]",
                    self.first_timeslice, self.last_timeslice
                ),
                dump: format!("metric {metric}"),
            });
        }
        let start = (first - self.first_timeslice).max(0) as usize;
        let end = if first <= last {
            (last - self.first_timeslice + 1) as usize
        } else {
            start
        };
        Ok(DemandIter {
            exact: &demand.exact[start..end],
            variable: &demand.variable[start..end],
            next: 0,
            timeslice: first,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DemandIter<'a> {
    exact: &'a [f64],
    variable: &'a [f64],
    next: usize,
    timeslice: TimesliceId,
}

impl Iterator for DemandIter<'_> {
    type Item = Demand;

    fn next(&mut self) -> Option<Demand> {
        let i = self.next;
        let exact = *self.exact.get(i)?;
        self.next += 1;
        Some(Demand {
            timeslice: self.timeslice + i as TimesliceId,
            exact,
            variable: self.variable[i],
        })
    }
}

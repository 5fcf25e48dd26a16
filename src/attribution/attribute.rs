//! Per-phase attribution of consumable usage and blocking state
//!
//! Leaf phases get a result eagerly; composite results are assembled on first
//! request from the leaves in their subtree and cached.

use super::active::ActivePhaseDetectionResult;
use super::demand::{DemandIter, ResourceDemandEstimationResult};
use super::mapping::PhaseMetricMappingCache;
use super::rules::{BlockingAttributionRule, ConsumableAttributionRule, ResourceAttributionRuleProvider};
use super::sampling::{ResourceSamplingResult, SampleIter};
use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, MetricId, MetricKind, PhaseId, ResourceModel};
use crate::time::{Membership, TimesliceId, Timeslices};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Metrics a phase uses, split by class, plus visible metrics it does not use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub consumable: BTreeSet<MetricId>,
    pub blocking: BTreeSet<MetricId>,
    pub unused_consumable: BTreeSet<MetricId>,
    pub unused_blocking: BTreeSet<MetricId>,
}

impl PhaseMetrics {
    pub fn used(&self) -> impl Iterator<Item = MetricId> + '_ {
        self.consumable.iter().chain(self.blocking.iter()).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeafAttribution {
    pub(crate) metrics: PhaseMetrics,
    pub(crate) rules: BTreeMap<MetricId, ConsumableAttributionRule>,
}

#[derive(Debug, Clone)]
struct CompositeAttribution {
    metrics: PhaseMetrics,
    leaves: Vec<PhaseId>,
}

/// Attribution results for all phases
#[derive(Debug)]
pub struct ResourceAttributionStepResult {
    leaves: BTreeMap<PhaseId, LeafAttribution>,
    composites: Vec<OnceLock<Option<CompositeAttribution>>>,
}

impl ResourceAttributionStepResult {
    pub fn execute(
        execution: &ExecutionModel,
        resources: &ResourceModel,
        cache: &PhaseMetricMappingCache,
        rules: &dyn ResourceAttributionRuleProvider,
    ) -> Self {
        let mut leaves = BTreeMap::new();
        for &leaf in cache.leaf_phases() {
            let phase = execution.phase(leaf);
            let mut result = LeafAttribution {
                metrics: PhaseMetrics::default(),
                rules: BTreeMap::new(),
            };
            for &metric_id in cache.metrics_for_leaf(leaf) {
                let metric = resources.metric(metric_id);
                match metric.kind {
                    MetricKind::Consumable { .. } => {
                        let rule = rules.consumable_rule(phase.type_id, metric.type_id);
                        if rule.is_none() {
                            result.metrics.unused_consumable.insert(metric_id);
                        } else {
                            result.metrics.consumable.insert(metric_id);
                            result.rules.insert(metric_id, rule);
                        }
                    }
                    MetricKind::Blocking { .. } => {
                        match rules.blocking_rule(phase.type_id, metric.type_id) {
                            BlockingAttributionRule::Full => {
                                result.metrics.blocking.insert(metric_id)
                            }
                            BlockingAttributionRule::None => {
                                result.metrics.unused_blocking.insert(metric_id)
                            }
                        };
                    }
                }
            }
            leaves.insert(leaf, result);
        }
        Self::from_leaves(execution, leaves)
    }

    pub(crate) fn from_leaves(
        execution: &ExecutionModel,
        leaves: BTreeMap<PhaseId, LeafAttribution>,
    ) -> Self {
        Self {
            leaves,
            composites: (0..execution.phase_count()).map(|_| OnceLock::new()).collect(),
        }
    }

    pub(crate) fn leaf_results(&self) -> &BTreeMap<PhaseId, LeafAttribution> {
        &self.leaves
    }

    pub fn leaf_phases(&self) -> impl Iterator<Item = PhaseId> + '_ {
        self.leaves.keys().copied()
    }

    fn composite(&self, execution: &ExecutionModel, phase: PhaseId) -> Option<&CompositeAttribution> {
        self.composites.get(phase.index())?.get_or_init(|| {
            if execution.phase(phase).is_leaf() {
                return None;
            }
            let leaves: Vec<PhaseId> = execution
                .descendants(phase)
                .map(|p| p.id)
                .filter(|p| self.leaves.contains_key(p))
                .collect();
            if leaves.is_empty() {
                return None;
            }
            let mut metrics = PhaseMetrics::default();
            for leaf in &leaves {
                let m = &self.leaves[leaf].metrics;
                metrics.consumable.extend(&m.consumable);
                metrics.blocking.extend(&m.blocking);
                metrics.unused_consumable.extend(&m.unused_consumable);
                metrics.unused_blocking.extend(&m.unused_blocking);
            }
            metrics.unused_consumable = &metrics.unused_consumable - &metrics.consumable;
            metrics.unused_blocking = &metrics.unused_blocking - &metrics.blocking;
            Some(CompositeAttribution { metrics, leaves })
        })
        .as_ref()
    }

    /// # Errors
    ///
    /// Fails for phases without any attribution result.
    pub fn phase_metrics(&self, execution: &ExecutionModel, phase: PhaseId) -> Result<&PhaseMetrics> {
        if let Some(leaf) = self.leaves.get(&phase) {
            return Ok(&leaf.metrics);
        }
        self.composite(execution, phase)
            .map(|c| &c.metrics)
            .ok_or_else(|| AnalysisError::not_found("attribution result for phase", execution.phase(phase).path.clone()))
    }

    pub(crate) fn consumable_iter<'a>(
        &'a self,
        ctx: &AttributionContext<'a>,
        phase: PhaseId,
        metric: MetricId,
    ) -> Result<ConsumableAttributionIter<'a>> {
        let p = ctx.execution.phase(phase);
        let not_found = || {
            AnalysisError::not_found(
                "consumable attribution",
                format!("{} / {}", p.path, ctx.resources.metric(metric).path),
            )
        };

        if let Some(leaf) = self.leaves.get(&phase) {
            let (exact, demand) = match leaf.rules.get(&metric) {
                Some(ConsumableAttributionRule::Exact(d)) => (true, *d),
                Some(ConsumableAttributionRule::Variable(d)) => (false, *d),
                Some(ConsumableAttributionRule::None) | None => return Err(not_found()),
            };
            return Ok(ConsumableAttributionIter::Leaf(LeafConsumableIter {
                exact,
                own_demand: demand,
                demand: ctx.demand.demand_iter(metric, p.first_timeslice, p.last_timeslice)?,
                samples: ctx.sampling.sample_iter(metric, p.first_timeslice, p.last_timeslice)?,
                active: ctx.active.active_iter(phase, p.first_timeslice, p.last_timeslice)?,
            }));
        }

        let composite = self.composite(ctx.execution, phase).ok_or_else(not_found)?;
        if !composite.metrics.consumable.contains(&metric) {
            return Err(not_found());
        }
        let len = usize::try_from(p.duration()).unwrap_or(0);
        let mut usage = vec![0.0; len];
        let mut capacity = vec![0.0; len];
        for &leaf in &composite.leaves {
            if !self.leaves[&leaf].metrics.consumable.contains(&metric) {
                continue;
            }
            for sample in self.consumable_iter(ctx, leaf, metric)? {
                if sample.timeslice < p.first_timeslice {
                    continue;
                }
                let index = (sample.timeslice - p.first_timeslice) as usize;
                if index >= len {
                    break;
                }
                usage[index] += sample.usage;
                capacity[index] += sample.capacity;
            }
        }
        Ok(ConsumableAttributionIter::Buffered(BufferedConsumableIter {
            first_timeslice: p.first_timeslice,
            usage,
            capacity,
            next: 0,
        }))
    }

    pub(crate) fn blocking_iter<'a>(
        &'a self,
        ctx: &AttributionContext<'a>,
        phase: PhaseId,
        metric: MetricId,
    ) -> Result<BlockingAttributionIter<'a>> {
        let p = ctx.execution.phase(phase);
        let m = ctx.resources.metric(metric);
        let not_found = || {
            AnalysisError::not_found("blocking attribution", format!("{} / {}", p.path, m.path))
        };
        let MetricKind::Blocking { blocked } = &m.kind else {
            return Err(not_found());
        };

        if let Some(leaf) = self.leaves.get(&phase) {
            if !leaf.metrics.blocking.contains(&metric) {
                return Err(not_found());
            }
            return Ok(BlockingAttributionIter::Leaf(
                blocked.membership(p.first_timeslice, p.last_timeslice),
            ));
        }

        let composite = self.composite(ctx.execution, phase).ok_or_else(not_found)?;
        if !composite.metrics.blocking.contains(&metric) {
            return Err(not_found());
        }
        let len = usize::try_from(p.duration()).unwrap_or(0);
        let mut is_blocked = vec![false; len];
        for &leaf in &composite.leaves {
            if !self.leaves[&leaf].metrics.blocking.contains(&metric) {
                continue;
            }
            let leaf_first = ctx.execution.phase(leaf).first_timeslice;
            let bits = self.blocking_iter(ctx, leaf, metric)?;
            for (offset, bit) in bits.enumerate() {
                let timeslice = leaf_first + offset as TimesliceId;
                if timeslice < p.first_timeslice {
                    continue;
                }
                let index = (timeslice - p.first_timeslice) as usize;
                if index >= len {
                    break;
                }
                is_blocked[index] |= bit;
            }
        }
        Ok(BlockingAttributionIter::Buffered(is_blocked.into_iter()))
    }
}

/// Borrowed inputs needed to construct attribution iterators
#[derive(Clone, Copy)]
pub(crate) struct AttributionContext<'a> {
    pub(crate) execution: &'a ExecutionModel,
    pub(crate) resources: &'a ResourceModel,
    pub(crate) active: &'a ActivePhaseDetectionResult,
    pub(crate) demand: &'a ResourceDemandEstimationResult,
    pub(crate) sampling: &'a ResourceSamplingResult,
}

/// Usage attributed to a phase in one timeslice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttributedSample {
    pub timeslice: TimesliceId,
    pub usage: f64,
    pub capacity: f64,
}

/// Per-timeslice `(usage, capacity)` for one phase and one consumable metric
#[derive(Debug)]
pub enum ConsumableAttributionIter<'a> {
    Leaf(LeafConsumableIter<'a>),
    Buffered(BufferedConsumableIter),
}

impl Iterator for ConsumableAttributionIter<'_> {
    type Item = AttributedSample;

    fn next(&mut self) -> Option<AttributedSample> {
        match self {
            Self::Leaf(iter) => iter.next(),
            Self::Buffered(iter) => iter.next(),
        }
    }
}

#[derive(Debug)]
pub struct LeafConsumableIter<'a> {
    exact: bool,
    own_demand: f64,
    demand: DemandIter<'a>,
    samples: SampleIter<'a>,
    active: Membership<'a, Timeslices>,
}

impl Iterator for LeafConsumableIter<'_> {
    type Item = AttributedSample;

    fn next(&mut self) -> Option<AttributedSample> {
        let demand = self.demand.next()?;
        let sample = self.samples.next()?;
        let is_active = self.active.next()?;
        let capacity = self.samples.capacity();

        let total = if self.exact { demand.exact } else { demand.variable };
        // Rules built without validation may carry a zero or negative demand
        let (usage, available) = if !is_active || !(self.own_demand > 0.0 && total > 0.0) {
            (0.0, 0.0)
        } else if self.exact {
            let fraction = self.own_demand / total;
            (
                self.own_demand.min(sample * fraction),
                self.own_demand.min(capacity * fraction),
            )
        } else {
            let variable_sample = (sample - demand.exact).max(0.0);
            let variable_capacity = (capacity - demand.exact).max(0.0);
            let fraction = self.own_demand / total;
            (variable_sample * fraction, variable_capacity * fraction)
        };

        Some(AttributedSample {
            timeslice: demand.timeslice,
            usage,
            capacity: available,
        })
    }
}

#[derive(Debug)]
pub struct BufferedConsumableIter {
    first_timeslice: TimesliceId,
    usage: Vec<f64>,
    capacity: Vec<f64>,
    next: usize,
}

impl Iterator for BufferedConsumableIter {
    type Item = AttributedSample;

    fn next(&mut self) -> Option<AttributedSample> {
        let i = self.next;
        let usage = *self.usage.get(i)?;
        self.next += 1;
        Some(AttributedSample {
            timeslice: self.first_timeslice + i as TimesliceId,
            usage,
            capacity: self.capacity[i],
        })
    }
}

/// Per-timeslice "is blocked" for one phase and one blocking metric
#[derive(Debug)]
pub enum BlockingAttributionIter<'a> {
    Leaf(Membership<'a, Timeslices>),
    Buffered(std::vec::IntoIter<bool>),
}

impl Iterator for BlockingAttributionIter<'_> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        match self {
            Self::Leaf(iter) => iter.next(),
            Self::Buffered(iter) => iter.next(),
        }
    }
}

//! Declarative demand rules keyed by (phase type, metric type)

use crate::error::{AnalysisError, Result};
use crate::model::{MetricTypeId, PhaseTypeId};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

/// How a phase claims a consumable resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConsumableAttributionRule {
    /// Fixed absolute demand whenever the phase is active
    Exact(f64),
    /// Relative weight on the capacity left after all exact demand
    Variable(f64),
    None,
}

impl ConsumableAttributionRule {
    /// # Errors
    ///
    /// Demand must be positive and finite.
    pub fn exact(demand: f64) -> Result<Self> {
        Self::check_demand(demand).map(Self::Exact)
    }

    /// # Errors
    ///
    /// Demand must be positive and finite.
    pub fn variable(demand: f64) -> Result<Self> {
        Self::check_demand(demand).map(Self::Variable)
    }

    fn check_demand(demand: f64) -> Result<f64> {
        if demand > 0.0 && demand.is_finite() {
            Ok(demand)
        } else {
            Err(AnalysisError::Configuration(format!(
                "attribution demand must be positive and finite, got {demand}"
            )))
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Whether a phase is affected when a blocking resource blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingAttributionRule {
    Full,
    None,
}

/// Source of attribution rules
///
/// Rules are schema-level: every phase of a type sees the same rule for every
/// metric of a type.
pub trait ResourceAttributionRuleProvider: Send + Sync {
    fn consumable_rule(
        &self,
        phase_type: PhaseTypeId,
        metric_type: MetricTypeId,
    ) -> ConsumableAttributionRule;

    fn blocking_rule(&self, phase_type: PhaseTypeId, metric_type: MetricTypeId)
        -> BlockingAttributionRule;
}

/// Table-backed rule provider; pairs without an entry get the `None` rule
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    consumable: FnvHashMap<(PhaseTypeId, MetricTypeId), ConsumableAttributionRule>,
    blocking: FnvHashMap<(PhaseTypeId, MetricTypeId), BlockingAttributionRule>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_consumable(
        &mut self,
        phase_type: PhaseTypeId,
        metric_type: MetricTypeId,
        rule: ConsumableAttributionRule,
    ) {
        self.consumable.insert((phase_type, metric_type), rule);
    }

    pub fn set_blocking(
        &mut self,
        phase_type: PhaseTypeId,
        metric_type: MetricTypeId,
        rule: BlockingAttributionRule,
    ) {
        self.blocking.insert((phase_type, metric_type), rule);
    }
}

impl ResourceAttributionRuleProvider for RuleTable {
    fn consumable_rule(
        &self,
        phase_type: PhaseTypeId,
        metric_type: MetricTypeId,
    ) -> ConsumableAttributionRule {
        self.consumable
            .get(&(phase_type, metric_type))
            .copied()
            .unwrap_or(ConsumableAttributionRule::None)
    }

    fn blocking_rule(
        &self,
        phase_type: PhaseTypeId,
        metric_type: MetricTypeId,
    ) -> BlockingAttributionRule {
        self.blocking
            .get(&(phase_type, metric_type))
            .copied()
            .unwrap_or(BlockingAttributionRule::None)
    }
}

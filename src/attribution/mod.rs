//! Resource attribution engine
//!
//! Converts observed metric rates into per-phase, per-timeslice attributed
//! usage and available capacity.
//!
//! # Pipeline
//!
//! ```text
//! PhaseMetricMappingCache      leaf phase <-> visible metrics
//!   -> ActivePhaseDetection    per leaf: timeslices in which it executes
//!   -> DemandEstimation        per metric: sum of exact demand, sum of variable weights
//!   -> Sampling                per metric: dense usage samples (default or phase-aware)
//!   -> Attribution             per (phase, metric): (usage, capacity) iterators
//! ```
//!
//! Results can be cached on disk; see [`cache`] for the format and miss rules.
//!
//! # Example
//!
//! ```no_run
//! use phaselens::attribution::{CacheSetting, DefaultSampling, ResourceAttribution,
//!     ResourceAttributionSettings, RuleTable};
//! use phaselens::model::PhaseToResourceMapping;
//! # fn run(execution: &phaselens::model::ExecutionModel,
//! #        resources: &phaselens::model::ResourceModel) -> phaselens::Result<()> {
//! let settings = ResourceAttributionSettings {
//!     mapping: PhaseToResourceMapping::everything(execution, resources),
//!     rules: Box::new(RuleTable::new()),
//!     sampling: Box::new(DefaultSampling),
//!     cache: CacheSetting::Disable,
//! };
//! let result = ResourceAttribution::execute(execution, resources, &settings, "cache".as_ref())?;
//! for leaf in result.leaf_phases() {
//!     println!("{}", execution.phase(leaf).path);
//! }
//! # Ok(())
//! # }
//! ```

mod active;
mod attribute;
pub mod cache;
mod demand;
mod mapping;
mod rules;
mod sampling;

pub use active::ActivePhaseDetectionResult;
pub use attribute::{
    AttributedSample, BlockingAttributionIter, BufferedConsumableIter, ConsumableAttributionIter,
    LeafConsumableIter, PhaseMetrics, ResourceAttributionStepResult,
};
pub use demand::{Demand, DemandIter, ResourceDemandEstimationResult};
pub use mapping::PhaseMetricMappingCache;
pub use rules::{
    BlockingAttributionRule, ConsumableAttributionRule, ResourceAttributionRuleProvider, RuleTable,
};
pub use sampling::{
    DefaultSampling, PhaseAwareSampling, ResourceSamplingResult, ResourceSamplingStep, SampleIter,
};

use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, MetricId, PhaseId, PhaseToResourceMapping, ResourceModel};
use crate::time::{Membership, TimesliceId, Timeslices};
use attribute::AttributionContext;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How [`ResourceAttribution::execute`] uses the on-disk cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CacheSetting {
    /// Never read or write the cache
    Disable,
    /// Always recompute, then overwrite the cache
    Refresh,
    /// Use a matching cache, otherwise recompute and write it
    #[default]
    UseOrRefresh,
}

/// Sampling strategy selector used by configuration files and the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingMode {
    #[default]
    Default,
    PhaseAware,
}

impl SamplingMode {
    pub fn step(self) -> Box<dyn ResourceSamplingStep> {
        match self {
            Self::Default => Box::new(DefaultSampling),
            Self::PhaseAware => Box::new(PhaseAwareSampling),
        }
    }
}

pub struct ResourceAttributionSettings {
    pub mapping: PhaseToResourceMapping,
    pub rules: Box<dyn ResourceAttributionRuleProvider>,
    pub sampling: Box<dyn ResourceSamplingStep>,
    pub cache: CacheSetting,
}

/// Entry point of the attribution pipeline
pub struct ResourceAttribution;

impl ResourceAttribution {
    /// Attribute resource usage to every phase of `execution`
    ///
    /// # Errors
    ///
    /// Fails when the two models use different timeslice lengths. Cache
    /// problems are logged and never returned.
    pub fn execute<'m>(
        execution: &'m ExecutionModel,
        resources: &'m ResourceModel,
        settings: &ResourceAttributionSettings,
        cache_dir: &Path,
    ) -> Result<ResourceAttributionResult<'m>> {
        if execution.time() != resources.time() {
            return Err(AnalysisError::Configuration(format!(
                "resource attribution requires the execution and resource models to share a timeslice length ({}ns vs {}ns)",
                execution.time().nanoseconds_per_timeslice(),
                resources.time().nanoseconds_per_timeslice()
            )));
        }

        let mapping = PhaseMetricMappingCache::build(execution, resources, &settings.mapping);
        tracing::debug!(
            leaves = mapping.leaf_phases().len(),
            consumable = mapping.consumable_metrics().len(),
            blocking = mapping.blocking_metrics().len(),
            "Built phase/metric mapping"
        );

        let rules = settings.rules.as_ref();
        let inputs_digest = if settings.cache == CacheSetting::Disable {
            0
        } else {
            cache::inputs_digest(execution, resources, &mapping, rules)
        };

        if settings.cache == CacheSetting::UseOrRefresh {
            if let Some(result) =
                Self::try_load_cache(execution, resources, settings, inputs_digest, cache_dir)
            {
                tracing::info!(dir = %cache_dir.display(), "Loaded resource attribution from cache");
                return Ok(result);
            }
        }

        let active = ActivePhaseDetectionResult::execute(execution, resources, &mapping, rules);
        let demand =
            ResourceDemandEstimationResult::execute(execution, resources, &mapping, rules, &active)?;
        let sampling = ResourceSamplingResult::execute(
            settings.sampling.as_ref(),
            mapping
                .consumable_metrics()
                .iter()
                .map(|&m| resources.metric(m)),
            &demand,
        )?;
        let attribution = ResourceAttributionStepResult::execute(execution, resources, &mapping, rules);

        let result = ResourceAttributionResult {
            execution,
            resources,
            active,
            demand,
            sampling,
            attribution,
            from_cache: false,
        };

        if settings.cache != CacheSetting::Disable {
            if let Err(e) = result.write_cache(cache_dir, settings.sampling.name(), inputs_digest) {
                tracing::warn!(error = %e, "Failed to write resource attribution cache");
            }
        }

        Ok(result)
    }

    fn try_load_cache<'m>(
        execution: &'m ExecutionModel,
        resources: &'m ResourceModel,
        settings: &ResourceAttributionSettings,
        inputs_digest: u64,
        cache_dir: &Path,
    ) -> Option<ResourceAttributionResult<'m>> {
        let body = match cache::read(cache_dir) {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read resource attribution cache, recomputing");
                return None;
            }
        };
        if !cache::matches(&body, execution, resources, inputs_digest, settings.sampling.name()) {
            tracing::warn!("Resource attribution cache belongs to a different job or inputs, recomputing");
            return None;
        }
        Some(ResourceAttributionResult {
            execution,
            resources,
            active: body.active,
            demand: body.demand,
            sampling: body.sampling,
            attribution: ResourceAttributionStepResult::from_leaves(execution, body.leaves),
            from_cache: true,
        })
    }
}

/// Attribution results for one job, borrowing the models they were computed from
pub struct ResourceAttributionResult<'m> {
    execution: &'m ExecutionModel,
    resources: &'m ResourceModel,
    active: ActivePhaseDetectionResult,
    demand: ResourceDemandEstimationResult,
    sampling: ResourceSamplingResult,
    attribution: ResourceAttributionStepResult,
    from_cache: bool,
}

impl<'m> ResourceAttributionResult<'m> {
    pub fn execution(&self) -> &'m ExecutionModel {
        self.execution
    }

    pub fn resources(&self) -> &'m ResourceModel {
        self.resources
    }

    pub fn loaded_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn leaf_phases(&self) -> impl Iterator<Item = PhaseId> + '_ {
        self.attribution.leaf_phases()
    }

    pub fn active_phases(&self) -> &ActivePhaseDetectionResult {
        &self.active
    }

    pub fn demand(&self) -> &ResourceDemandEstimationResult {
        &self.demand
    }

    pub fn sampling(&self) -> &ResourceSamplingResult {
        &self.sampling
    }

    /// Used and unused metrics of a leaf or composite phase
    ///
    /// # Errors
    ///
    /// Fails for phases without leaves in the attribution result.
    pub fn phase_metrics(&self, phase: PhaseId) -> Result<&PhaseMetrics> {
        self.attribution.phase_metrics(self.execution, phase)
    }

    fn context(&self) -> AttributionContext<'_> {
        AttributionContext {
            execution: self.execution,
            resources: self.resources,
            active: &self.active,
            demand: &self.demand,
            sampling: &self.sampling,
        }
    }

    /// Attributed `(usage, capacity)` per timeslice of `phase`
    ///
    /// # Errors
    ///
    /// Fails if `phase` does not use `metric`.
    pub fn consumable_iter(
        &self,
        phase: PhaseId,
        metric: MetricId,
    ) -> Result<ConsumableAttributionIter<'_>> {
        self.attribution.consumable_iter(&self.context(), phase, metric)
    }

    /// "Is blocked" per timeslice of `phase`
    ///
    /// # Errors
    ///
    /// Fails if `phase` is not subject to `metric`.
    pub fn blocking_iter(&self, phase: PhaseId, metric: MetricId) -> Result<BlockingAttributionIter<'_>> {
        self.attribution.blocking_iter(&self.context(), phase, metric)
    }

    /// "Is active" per timeslice of a leaf phase
    pub fn active_iter(&self, phase: PhaseId) -> Result<Membership<'_, Timeslices>> {
        let p = self.execution.phase(phase);
        self.active.active_iter(phase, p.first_timeslice, p.last_timeslice)
    }

    pub fn sample_iter(
        &self,
        metric: MetricId,
        first: TimesliceId,
        last: TimesliceId,
    ) -> Result<SampleIter<'_>> {
        self.sampling.sample_iter(metric, first, last)
    }

    fn write_cache(&self, dir: &Path, sampling_step: &str, inputs_digest: u64) -> Result<()> {
        cache::write(
            dir,
            &cache::CacheBodyRef {
                time: self.execution.time(),
                sampling_step,
                phase_paths: cache::phase_paths(self.execution),
                phase_ranges: cache::phase_ranges(self.execution),
                metric_paths: cache::metric_paths(self.resources),
                inputs_digest,
                active: &self.active,
                demand: &self.demand,
                sampling: &self.sampling,
                leaves: self.attribution.leaf_results(),
            },
        )
    }
}

//! Resource sampling: dense per-timeslice usage samples per consumable metric
//!
//! Two strategies are provided:
//!
//! - [`DefaultSampling`] copies each observation to every timeslice it covers.
//! - [`PhaseAwareSampling`] redistributes the total usage of an observation
//!   period over its timeslices following the demand estimated for each slice:
//!   exact claimants first, then variable claimants, then a uniform background
//!   share, never exceeding the metric capacity in any slice.

use super::demand::ResourceDemandEstimationResult;
use crate::error::{AnalysisError, Result};
use crate::model::{Metric, MetricId, MetricKind};
use crate::time::TimesliceId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Strategy turning observed rates into per-timeslice samples
pub trait ResourceSamplingStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Samples of one consumable metric for every timeslice in `[first, last]`
    fn sample_metric(
        &self,
        metric: &Metric,
        demand: &ResourceDemandEstimationResult,
        first: TimesliceId,
        last: TimesliceId,
    ) -> Result<Vec<f64>>;
}

fn observations(metric: &Metric) -> Result<(f64, &crate::model::RateObservations)> {
    match &metric.kind {
        MetricKind::Consumable {
            capacity,
            observed_usage,
        } => Ok((*capacity, observed_usage)),
        MetricKind::Blocking { .. } => Err(AnalysisError::Configuration(format!(
            "cannot sample blocking {metric}"
        ))),
    }
}

fn slice_count(first: TimesliceId, last: TimesliceId) -> usize {
    usize::try_from(last - first + 1).unwrap_or(0)
}

/// Broadcast each observed value over its period
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSampling;

impl ResourceSamplingStep for DefaultSampling {
    fn name(&self) -> &'static str {
        "default"
    }

    fn sample_metric(
        &self,
        metric: &Metric,
        _demand: &ResourceDemandEstimationResult,
        first: TimesliceId,
        last: TimesliceId,
    ) -> Result<Vec<f64>> {
        let (_, observed) = observations(metric)?;
        let mut samples = vec![0.0; slice_count(first, last)];
        for period in observed.periods_between(first, last) {
            let from = (period.first_timeslice.max(first) - first) as usize;
            let to = (period.last_timeslice.min(last) - first) as usize;
            samples[from..=to].fill(period.value);
        }
        Ok(samples)
    }
}

/// Distribute each period's total usage according to estimated demand
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseAwareSampling;

impl PhaseAwareSampling {
    /// Hand out `remaining` over the slices in `order`, proportional to `weight`
    /// and capped at the remaining capacity of each slice
    fn assign_tier(
        remaining: &mut f64,
        weights: &[f64],
        capacity: &mut [f64],
        samples: &mut [f64],
    ) {
        if *remaining <= 0.0 {
            return;
        }
        let mut remaining_weight: f64 = weights
            .iter()
            .zip(capacity.iter())
            .filter(|(_, &c)| c > 0.0)
            .map(|(&w, _)| w)
            .sum();

        let mut order: Vec<usize> = (0..weights.len())
            .filter(|&i| weights[i] > 0.0 && capacity[i] > 0.0)
            .collect();
        // Densest demand relative to capacity first
        order.sort_by(|&a, &b| {
            (weights[b] / capacity[b])
                .partial_cmp(&(weights[a] / capacity[a]))
                .unwrap_or(Ordering::Equal)
        });

        for i in order {
            if remaining_weight <= 0.0 {
                break;
            }
            let delta = (*remaining * weights[i] / remaining_weight).min(capacity[i]);
            samples[i] += delta;
            capacity[i] -= delta;
            *remaining -= delta;
            remaining_weight -= weights[i];
        }
    }
}

impl ResourceSamplingStep for PhaseAwareSampling {
    fn name(&self) -> &'static str {
        "phase-aware"
    }

    fn sample_metric(
        &self,
        metric: &Metric,
        demand: &ResourceDemandEstimationResult,
        first: TimesliceId,
        last: TimesliceId,
    ) -> Result<Vec<f64>> {
        let (metric_capacity, observed) = observations(metric)?;
        let mut samples = vec![0.0; slice_count(first, last)];

        for period in observed.periods_between(first, last) {
            let from = period.first_timeslice.max(first);
            let to = period.last_timeslice.min(last);
            let offset = (from - first) as usize;
            let len = slice_count(from, to);

            let mut capacity = vec![metric_capacity; len];
            let mut exact = Vec::with_capacity(len);
            let mut variable = Vec::with_capacity(len);
            for d in demand.demand_iter(metric.id, from, to)? {
                exact.push(d.exact);
                variable.push(d.variable);
            }

            let window = &mut samples[offset..offset + len];
            let mut remaining = period.value * len as f64;
            Self::assign_tier(&mut remaining, &exact, &mut capacity, window);
            Self::assign_tier(&mut remaining, &variable, &mut capacity, window);
            let background = vec![1.0; len];
            Self::assign_tier(&mut remaining, &background, &mut capacity, window);
        }

        Ok(samples)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricSamples {
    capacity: f64,
    samples: Vec<f64>,
}

/// Dense samples for every consumable metric over the demand range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSamplingResult {
    first_timeslice: TimesliceId,
    last_timeslice: TimesliceId,
    metrics: BTreeMap<MetricId, MetricSamples>,
}

impl ResourceSamplingResult {
    pub fn execute<'a>(
        step: &dyn ResourceSamplingStep,
        metrics: impl IntoIterator<Item = &'a Metric>,
        demand: &ResourceDemandEstimationResult,
    ) -> Result<Self> {
        let first = demand.first_timeslice();
        let last = demand.last_timeslice();
        let mut result = BTreeMap::new();
        for metric in metrics {
            let (capacity, _) = observations(metric)?;
            let samples = step.sample_metric(metric, demand, first, last)?;
            result.insert(metric.id, MetricSamples { capacity, samples });
        }
        Ok(Self {
            first_timeslice: first,
            last_timeslice: last,
            metrics: result,
        })
    }

    pub fn first_timeslice(&self) -> TimesliceId {
        self.first_timeslice
    }

    pub fn last_timeslice(&self) -> TimesliceId {
        self.last_timeslice
    }

    /// Samples of `metric` for each timeslice in `[first, last]`
    ///
    /// # Errors
    ///
    /// Fails for metrics without samples and ranges outside the sampled range.
    pub fn sample_iter(
        &self,
        metric: MetricId,
        first: TimesliceId,
        last: TimesliceId,
    ) -> Result<SampleIter<'_>> {
        let entry = self
            .metrics
            .get(&metric)
            .ok_or_else(|| AnalysisError::not_found("samples for metric", metric.to_string()))?;
        if first > last {
            return Ok(SampleIter {
                capacity: entry.capacity,
                samples: &[],
                next: 0,
            });
        }
        if first < self.first_timeslice || last > self.last_timeslice {
            return Err(AnalysisError::Inconsistency {
                message: format!(
                    "sample range [{first}, {last}] outside sampled range [{}, {}]",
                    self.first_timeslice, self.last_timeslice
                ),
                dump: format!("metric {metric}"),
            });
        }
        let start = (first - self.first_timeslice) as usize;
        let end = (last - self.first_timeslice + 1) as usize;
        Ok(SampleIter {
            capacity: entry.capacity,
            samples: &entry.samples[start..end],
            next: 0,
        })
    }
}

/// Forward-only iterator over metric samples
#[derive(Debug, Clone)]
pub struct SampleIter<'a> {
    capacity: f64,
    samples: &'a [f64],
    next: usize,
}

impl SampleIter<'_> {
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

impl Iterator for SampleIter<'_> {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let sample = *self.samples.get(self.next)?;
        self.next += 1;
        Some(sample)
    }
}

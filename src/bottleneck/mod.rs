//! Bottleneck identification engine
//!
//! Classifies every timeslice of every phase as not bottlenecked, locally
//! bottlenecked (the phase uses its full attributed share) or globally
//! bottlenecked (the resource itself is saturated or blocked). Leaf phases are
//! classified from attribution results; composite phases sweep over their
//! subphases and combine the statuses of whichever subphases are running.
//!
//! Results exist at two granularities: per metric and per metric type. Both
//! are lazy: nothing is computed until an iterator or summary is requested.

mod composite;
mod summary;

pub use composite::CompositeSweep;
pub use summary::BottleneckSummary;

use crate::attribution::{BlockingAttributionIter, ResourceAttributionResult, SampleIter};
use crate::error::{AnalysisError, Result};
use crate::model::{
    Metric, MetricId, MetricKind, MetricTypeId, Phase, PhaseId, PhaseTypeId, ResourceModel,
};
use crate::time::TimesliceCount;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, OnceLock, PoisonError};

pub const DEFAULT_LOCAL_THRESHOLD: f64 = 0.95;
pub const DEFAULT_GLOBAL_THRESHOLD: f64 = 0.95;

/// Per-timeslice bottleneck classification
///
/// Ordered `None < Local < Global`; combining statuses prefers the larger one.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckStatus {
    #[default]
    None = 0,
    Local = 1,
    Global = 2,
}

impl BottleneckStatus {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Local),
            2 => Some(Self::Global),
            _ => None,
        }
    }

    pub fn is_bottleneck(self) -> bool {
        self != Self::None
    }
}

impl fmt::Display for BottleneckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Local => "local",
            Self::Global => "global",
        })
    }
}

/// Combines the statuses of the subphases running in one timeslice
pub trait BottleneckPredicate: Send + Sync {
    /// `subphases` may be empty when no subphase of `phase` runs in the timeslice
    fn combine(&self, phase: &Phase, subphases: &[(PhaseId, BottleneckStatus)]) -> BottleneckStatus;
}

/// Global if any subphase is global, else local if any is local
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxStatusPredicate;

impl BottleneckPredicate for MaxStatusPredicate {
    fn combine(&self, _phase: &Phase, subphases: &[(PhaseId, BottleneckStatus)]) -> BottleneckStatus {
        subphases
            .iter()
            .map(|&(_, status)| status)
            .max()
            .unwrap_or_default()
    }
}

/// Thresholds and the composite combination policy
pub struct BottleneckIdentificationSettings {
    /// Fraction of the attributed capacity a phase must use to be locally bottlenecked
    pub local_threshold: f64,
    /// Fraction of the metric capacity the raw sample must reach to be globally bottlenecked
    pub global_threshold: f64,
    pub metric_type_local: FnvHashMap<MetricTypeId, f64>,
    pub metric_type_global: FnvHashMap<MetricTypeId, f64>,
    pub phase_type_local: FnvHashMap<(PhaseTypeId, MetricTypeId), f64>,
    pub predicate: Box<dyn BottleneckPredicate>,
}

impl Default for BottleneckIdentificationSettings {
    fn default() -> Self {
        Self {
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            global_threshold: DEFAULT_GLOBAL_THRESHOLD,
            metric_type_local: FnvHashMap::default(),
            metric_type_global: FnvHashMap::default(),
            phase_type_local: FnvHashMap::default(),
            predicate: Box::new(MaxStatusPredicate),
        }
    }
}

impl BottleneckIdentificationSettings {
    /// Most specific local factor: phase type, then metric type, then default
    pub fn local_threshold_factor(&self, metric: &Metric, phase: &Phase) -> f64 {
        self.phase_type_local
            .get(&(phase.type_id, metric.type_id))
            .or_else(|| self.metric_type_local.get(&metric.type_id))
            .copied()
            .unwrap_or(self.local_threshold)
    }

    pub fn global_threshold_factor(&self, metric: &Metric) -> f64 {
        self.metric_type_global
            .get(&metric.type_id)
            .copied()
            .unwrap_or(self.global_threshold)
    }
}

/// Key of a bottleneck descriptor, used by composite sweeps to build child iterators
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BottleneckSource {
    Metric(MetricId),
    MetricType(MetricTypeId),
}

/// Metric or metric type: the two granularities results are keyed by
pub trait BottleneckKey: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    const KIND: &'static str;

    fn table<'r>(result: &'r BottleneckIdentificationResult<'_>) -> &'r PhaseTable<Self>;

    fn source(self) -> BottleneckSource;

    fn describe(self, resources: &ResourceModel) -> String;
}

impl BottleneckKey for MetricId {
    const KIND: &'static str = "metric bottlenecks";

    fn table<'r>(result: &'r BottleneckIdentificationResult<'_>) -> &'r PhaseTable<Self> {
        &result.metrics
    }

    fn source(self) -> BottleneckSource {
        BottleneckSource::Metric(self)
    }

    fn describe(self, resources: &ResourceModel) -> String {
        resources.metric(self).path.clone()
    }
}

impl BottleneckKey for MetricTypeId {
    const KIND: &'static str = "metric type bottlenecks";

    fn table<'r>(result: &'r BottleneckIdentificationResult<'_>) -> &'r PhaseTable<Self> {
        &result.metric_types
    }

    fn source(self) -> BottleneckSource {
        BottleneckSource::MetricType(self)
    }

    fn describe(self, resources: &ResourceModel) -> String {
        resources.metric_type(self).name.clone()
    }
}

/// How to produce the status iterator of one (phase, key) pair
#[derive(Debug, Clone)]
enum Descriptor {
    LeafConsumable(MetricId),
    LeafBlocking(MetricId),
    MetricTypeLeaf {
        used: Vec<MetricId>,
        unused_consumable: Vec<MetricId>,
        unused_blocking: Vec<MetricId>,
    },
    Composite(Vec<PhaseId>),
}

struct PhaseEntry<K> {
    descriptors: BTreeMap<K, Descriptor>,
    summary: OnceLock<BottleneckSummary<K>>,
    summary_lock: Mutex<()>,
}

impl<K> PhaseEntry<K> {
    fn new(descriptors: BTreeMap<K, Descriptor>) -> Self {
        Self {
            descriptors,
            summary: OnceLock::new(),
            summary_lock: Mutex::new(()),
        }
    }
}

/// Bottleneck descriptors for every phase, keyed by metric or metric type
pub struct PhaseTable<K> {
    entries: Vec<PhaseEntry<K>>,
}

impl<K: BottleneckKey> PhaseTable<K> {
    /// Build composite descriptors bottom-up from the leaf descriptors
    fn build(
        result: &ResourceAttributionResult<'_>,
        mut leaf: impl FnMut(PhaseId) -> BTreeMap<K, Descriptor>,
    ) -> Self {
        let execution = result.execution();
        let mut descriptors: Vec<BTreeMap<K, Descriptor>> =
            vec![BTreeMap::new(); execution.phase_count()];

        // Children always have larger pre-order ids than their parent
        for phase in execution.phases().collect::<Vec<_>>().into_iter().rev() {
            if phase.is_leaf() {
                descriptors[phase.id.index()] = leaf(phase.id);
                continue;
            }
            let mut by_key: BTreeMap<K, Vec<PhaseId>> = BTreeMap::new();
            for &sub in &phase.subphases {
                for &key in descriptors[sub.index()].keys() {
                    by_key.entry(key).or_default().push(sub);
                }
            }
            descriptors[phase.id.index()] = by_key
                .into_iter()
                .map(|(key, subphases)| (key, Descriptor::Composite(subphases)))
                .collect();
        }

        Self {
            entries: descriptors.into_iter().map(PhaseEntry::new).collect(),
        }
    }

    fn entry(&self, phase: PhaseId) -> &PhaseEntry<K> {
        &self.entries[phase.index()]
    }
}

/// Entry point of bottleneck identification
pub struct BottleneckIdentification;

impl BottleneckIdentification {
    /// Derive bottleneck descriptors for every phase
    ///
    /// Statuses themselves are computed on demand.
    pub fn execute<'a>(
        attribution: &'a ResourceAttributionResult<'a>,
        settings: &'a BottleneckIdentificationSettings,
    ) -> BottleneckIdentificationResult<'a> {
        let resources = attribution.resources();
        let leaves: BTreeSet<PhaseId> = attribution.leaf_phases().collect();

        let metrics = PhaseTable::build(attribution, |phase| {
            let mut map = BTreeMap::new();
            if !leaves.contains(&phase) {
                return map;
            }
            if let Ok(used) = attribution.phase_metrics(phase) {
                for &m in &used.consumable {
                    map.insert(m, Descriptor::LeafConsumable(m));
                }
                for &m in &used.blocking {
                    map.insert(m, Descriptor::LeafBlocking(m));
                }
            }
            map
        });

        let metric_types = PhaseTable::build(attribution, |phase| {
            let mut map = BTreeMap::new();
            if !leaves.contains(&phase) {
                return map;
            }
            let Ok(used) = attribution.phase_metrics(phase) else {
                return map;
            };
            let of_type = |set: &BTreeSet<MetricId>, t: MetricTypeId| -> Vec<MetricId> {
                set.iter()
                    .copied()
                    .filter(|&m| resources.metric(m).type_id == t)
                    .collect()
            };
            for m in used.used() {
                let t = resources.metric(m).type_id;
                if map.contains_key(&t) {
                    continue;
                }
                map.insert(
                    t,
                    Descriptor::MetricTypeLeaf {
                        used: used.used().filter(|&u| resources.metric(u).type_id == t).collect(),
                        unused_consumable: of_type(&used.unused_consumable, t),
                        unused_blocking: of_type(&used.unused_blocking, t),
                    },
                );
            }
            map
        });

        tracing::debug!(
            phases = attribution.execution().phase_count(),
            "Derived bottleneck descriptors"
        );

        BottleneckIdentificationResult {
            attribution,
            settings,
            metrics,
            metric_types,
        }
    }
}

/// Lazily evaluated bottleneck results for one job
pub struct BottleneckIdentificationResult<'a> {
    attribution: &'a ResourceAttributionResult<'a>,
    settings: &'a BottleneckIdentificationSettings,
    metrics: PhaseTable<MetricId>,
    metric_types: PhaseTable<MetricTypeId>,
}

impl<'a> BottleneckIdentificationResult<'a> {
    pub fn attribution(&self) -> &'a ResourceAttributionResult<'a> {
        self.attribution
    }

    pub fn settings(&self) -> &'a BottleneckIdentificationSettings {
        self.settings
    }

    /// Per-metric view of one phase
    pub fn metric_bottlenecks(&self, phase: PhaseId) -> PhaseBottlenecks<'_, MetricId> {
        PhaseBottlenecks {
            result: self,
            phase,
            _key: std::marker::PhantomData,
        }
    }

    /// Per-metric-type view of one phase
    pub fn metric_type_bottlenecks(&self, phase: PhaseId) -> PhaseBottlenecks<'_, MetricTypeId> {
        PhaseBottlenecks {
            result: self,
            phase,
            _key: std::marker::PhantomData,
        }
    }

    /// Status iterator for a key of either granularity
    ///
    /// # Errors
    ///
    /// Fails if `phase` has no result for `key`.
    pub fn iter_for(&self, phase: PhaseId, key: BottleneckSource) -> Result<BottleneckIter<'_>> {
        match key {
            BottleneckSource::Metric(m) => self.iter(phase, m),
            BottleneckSource::MetricType(t) => self.iter(phase, t),
        }
    }

    fn iter<K: BottleneckKey>(&self, phase: PhaseId, key: K) -> Result<BottleneckIter<'_>> {
        let descriptor = K::table(self)
            .entry(phase)
            .descriptors
            .get(&key)
            .ok_or_else(|| self.not_found::<K>(phase, key))?;
        self.make_iter(phase, key.source(), descriptor)
    }

    fn not_found<K: BottleneckKey>(&self, phase: PhaseId, key: K) -> AnalysisError {
        AnalysisError::not_found(
            K::KIND,
            format!(
                "{} / {}",
                self.attribution.execution().phase(phase).path,
                key.describe(self.attribution.resources())
            ),
        )
    }

    fn make_iter(
        &self,
        phase: PhaseId,
        key: BottleneckSource,
        descriptor: &Descriptor,
    ) -> Result<BottleneckIter<'_>> {
        let p = self.attribution.execution().phase(phase);
        match descriptor {
            Descriptor::LeafConsumable(metric) => Ok(BottleneckIter::Buffered(
                self.leaf_consumable(p, *metric)?.into_iter(),
            )),
            Descriptor::LeafBlocking(metric) => Ok(BottleneckIter::Blocking(
                self.attribution.blocking_iter(phase, *metric)?,
            )),
            Descriptor::MetricTypeLeaf {
                used,
                unused_consumable,
                unused_blocking,
            } => {
                let resources = self.attribution.resources();
                let mut members = Vec::with_capacity(
                    used.len() + unused_consumable.len() + unused_blocking.len(),
                );
                for &m in used {
                    members.push(self.iter(phase, m)?);
                }
                for &m in unused_consumable {
                    let metric = resources.metric(m);
                    let samples =
                        self.attribution
                            .sample_iter(m, p.first_timeslice, p.last_timeslice)?;
                    let threshold = self.settings.global_threshold_factor(metric) * samples.capacity();
                    members.push(BottleneckIter::GlobalSample { samples, threshold });
                }
                for &m in unused_blocking {
                    if let MetricKind::Blocking { blocked } = &resources.metric(m).kind {
                        members.push(BottleneckIter::Blocking(BlockingAttributionIter::Leaf(
                            blocked.membership(p.first_timeslice, p.last_timeslice),
                        )));
                    }
                }
                Ok(BottleneckIter::Aggregate(members))
            }
            Descriptor::Composite(subphases) => Ok(BottleneckIter::Composite(Box::new(
                CompositeSweep::new(self, phase, key, subphases)?,
            ))),
        }
    }

    /// Classify every timeslice of a leaf phase for one consumable metric
    fn leaf_consumable(&self, phase: &Phase, metric: MetricId) -> Result<Vec<BottleneckStatus>> {
        let m = self.attribution.resources().metric(metric);
        let capacity = m
            .capacity()
            .ok_or_else(|| AnalysisError::not_found("consumable metric", m.path.clone()))?;
        let local = self.settings.local_threshold_factor(m, phase);
        let global = self.settings.global_threshold_factor(m) * capacity;

        let attributed = self.attribution.consumable_iter(phase.id, metric)?;
        let samples =
            self.attribution
                .sample_iter(metric, phase.first_timeslice, phase.last_timeslice)?;
        let active = self.attribution.active_iter(phase.id)?;

        Ok(attributed
            .zip(samples)
            .zip(active)
            .map(|((attributed, sample), is_active)| {
                if !is_active {
                    BottleneckStatus::None
                } else if sample >= global {
                    BottleneckStatus::Global
                } else if attributed.usage >= attributed.capacity * local {
                    BottleneckStatus::Local
                } else {
                    BottleneckStatus::None
                }
            })
            .collect())
    }
}

/// Bottleneck results of one phase at one granularity
pub struct PhaseBottlenecks<'r, K> {
    result: &'r BottleneckIdentificationResult<'r>,
    phase: PhaseId,
    _key: std::marker::PhantomData<K>,
}

impl<'r, K: BottleneckKey> PhaseBottlenecks<'r, K> {
    pub fn phase(&self) -> PhaseId {
        self.phase
    }

    /// Metrics or metric types with a result for this phase
    pub fn keys(&self) -> impl Iterator<Item = K> + 'r {
        K::table(self.result)
            .entry(self.phase)
            .descriptors
            .keys()
            .copied()
    }

    pub fn contains(&self, key: K) -> bool {
        K::table(self.result)
            .entry(self.phase)
            .descriptors
            .contains_key(&key)
    }

    /// One-shot status iterator over the phase's timeslices
    ///
    /// # Errors
    ///
    /// Fails if the phase has no result for `key`.
    pub fn iter(&self, key: K) -> Result<BottleneckIter<'r>> {
        self.result.iter(self.phase, key)
    }

    /// Summary statistics, computed on first use and shared afterwards
    ///
    /// # Errors
    ///
    /// Fails when a status iterator cannot be built or ends early.
    pub fn summary(&self) -> Result<&'r BottleneckSummary<K>> {
        let entry = K::table(self.result).entry(self.phase);
        if let Some(summary) = entry.summary.get() {
            return Ok(summary);
        }
        let _guard = entry
            .summary_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(summary) = entry.summary.get() {
            return Ok(summary);
        }
        let summary = BottleneckSummary::compute(self)?;
        Ok(entry.summary.get_or_init(|| summary))
    }

    /// # Errors
    ///
    /// See [`PhaseBottlenecks::summary`].
    pub fn time_not_bottlenecked(&self) -> Result<TimesliceCount> {
        Ok(self.summary()?.time_not_bottlenecked())
    }

    /// # Errors
    ///
    /// Fails if the phase has no result for `key`.
    pub fn time_bottlenecked_on(&self, key: K) -> Result<TimesliceCount> {
        self.summary()?
            .time_bottlenecked(key)
            .ok_or_else(|| self.result.not_found(self.phase, key))
    }

    /// Timeslices in which `key` is the only bottleneck
    ///
    /// # Errors
    ///
    /// Fails if the phase has no result for `key`.
    pub fn time_uniquely_bottlenecked_on(&self, key: K) -> Result<TimesliceCount> {
        self.summary()?
            .time_uniquely_bottlenecked(key)
            .ok_or_else(|| self.result.not_found(self.phase, key))
    }

    /// Per-timeslice maximum status over all keys
    ///
    /// # Errors
    ///
    /// See [`PhaseBottlenecks::summary`].
    pub fn total_iter(&self) -> Result<impl Iterator<Item = BottleneckStatus> + 'r> {
        Ok(self.summary()?.total().iter().copied())
    }
}

/// One-shot, forward-only per-timeslice status stream
pub enum BottleneckIter<'a> {
    Buffered(std::vec::IntoIter<BottleneckStatus>),
    /// Blocked timeslices are global bottlenecks
    Blocking(BlockingAttributionIter<'a>),
    /// Raw samples compared against a global threshold
    GlobalSample { samples: SampleIter<'a>, threshold: f64 },
    /// Metrics of one type folded into a single status
    Aggregate(Vec<BottleneckIter<'a>>),
    Composite(Box<CompositeSweep<'a>>),
}

impl Iterator for BottleneckIter<'_> {
    type Item = BottleneckStatus;

    fn next(&mut self) -> Option<BottleneckStatus> {
        match self {
            Self::Buffered(iter) => iter.next(),
            Self::Blocking(iter) => iter.next().map(|blocked| {
                if blocked {
                    BottleneckStatus::Global
                } else {
                    BottleneckStatus::None
                }
            }),
            Self::GlobalSample { samples, threshold } => samples.next().map(|sample| {
                if sample >= *threshold {
                    BottleneckStatus::Global
                } else {
                    BottleneckStatus::None
                }
            }),
            Self::Aggregate(members) => {
                let mut all_global = true;
                let mut any_bottleneck = false;
                for member in members.iter_mut() {
                    match member.next()? {
                        BottleneckStatus::None => all_global = false,
                        BottleneckStatus::Local => {
                            any_bottleneck = true;
                            all_global = false;
                        }
                        BottleneckStatus::Global => any_bottleneck = true,
                    }
                }
                Some(if !any_bottleneck {
                    BottleneckStatus::None
                } else if all_global {
                    BottleneckStatus::Global
                } else {
                    BottleneckStatus::Local
                })
            }
            Self::Composite(sweep) => sweep.next(),
        }
    }
}

#[cfg(test)]
mod tests;

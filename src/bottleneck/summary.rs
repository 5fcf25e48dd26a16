//! Memoized per-phase bottleneck statistics

use super::{BottleneckKey, BottleneckStatus, PhaseBottlenecks};
use crate::error::{AnalysisError, Result};
use crate::time::TimesliceCount;

/// Durations a phase spends bottlenecked, per key and in total
#[derive(Debug, Clone)]
pub struct BottleneckSummary<K> {
    keys: Vec<K>,
    bottlenecked: Vec<TimesliceCount>,
    uniquely_bottlenecked: Vec<TimesliceCount>,
    not_bottlenecked: TimesliceCount,
    total: Vec<BottleneckStatus>,
}

impl<K: BottleneckKey> BottleneckSummary<K> {
    pub(super) fn compute(view: &PhaseBottlenecks<'_, K>) -> Result<Self> {
        let result = view.result;
        let phase = result.attribution().execution().phase(view.phase());
        let len = usize::try_from(phase.duration()).unwrap_or(0);

        let keys: Vec<K> = view.keys().collect();
        let mut iters = keys
            .iter()
            .map(|&k| view.iter(k))
            .collect::<Result<Vec<_>>>()?;

        let mut bottlenecked = vec![0; keys.len()];
        let mut uniquely_bottlenecked = vec![0; keys.len()];
        let mut not_bottlenecked = 0;
        let mut total = vec![BottleneckStatus::None; len];

        for (t, slot) in total.iter_mut().enumerate() {
            // None: no bottleneck yet, Some(Some(i)): only key i, Some(None): several
            let mut unique: Option<Option<usize>> = None;
            for (i, iter) in iters.iter_mut().enumerate() {
                let status = iter.next().ok_or_else(|| AnalysisError::Inconsistency {
                    message: format!(
                        "bottleneck iterator of {} ended after {t} of {len} timeslices",
                        phase.path
                    ),
                    dump: format!("key {:?}", keys[i]),
                })?;
                if status.is_bottleneck() {
                    *slot = (*slot).max(status);
                    bottlenecked[i] += 1;
                    unique = Some(if unique.is_none() { Some(i) } else { None });
                }
            }
            match unique {
                None => not_bottlenecked += 1,
                Some(Some(i)) => uniquely_bottlenecked[i] += 1,
                Some(None) => {}
            }
        }

        tracing::trace!(
            phase = %phase.path,
            keys = keys.len(),
            not_bottlenecked,
            "Computed bottleneck summary"
        );

        Ok(Self {
            keys,
            bottlenecked,
            uniquely_bottlenecked,
            not_bottlenecked,
            total,
        })
    }

    fn position(&self, key: K) -> Option<usize> {
        self.keys.binary_search(&key).ok()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Timeslices in which no key is a bottleneck
    pub fn time_not_bottlenecked(&self) -> TimesliceCount {
        self.not_bottlenecked
    }

    pub fn time_bottlenecked(&self, key: K) -> Option<TimesliceCount> {
        self.position(key).map(|i| self.bottlenecked[i])
    }

    pub fn time_uniquely_bottlenecked(&self, key: K) -> Option<TimesliceCount> {
        self.position(key).map(|i| self.uniquely_bottlenecked[i])
    }

    /// Maximum status over all keys, per timeslice
    pub fn total(&self) -> &[BottleneckStatus] {
        &self.total
    }
}

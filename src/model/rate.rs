//! Piecewise-constant rate series
//!
//! `N + 1` strictly increasing timeslice boundaries bracket `N` observed values.
//! Period `i` covers the timeslices `(boundaries[i], boundaries[i + 1]]`.

use crate::error::{AnalysisError, Result};
use crate::time::{TimesliceCount, TimesliceId};
use serde::{Deserialize, Serialize};

/// Observed rate of a consumable metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateObservations {
    boundaries: Vec<TimesliceId>,
    values: Vec<f64>,
}

/// One constant-rate period of a [`RateObservations`] series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationPeriod {
    pub first_timeslice: TimesliceId,
    pub last_timeslice: TimesliceId,
    pub value: f64,
}

impl ObservationPeriod {
    pub fn timeslice_count(&self) -> TimesliceCount {
        self.last_timeslice - self.first_timeslice + 1
    }
}

impl RateObservations {
    /// Build a series from period boundaries and per-period values
    ///
    /// Empty input yields a series without observations.
    ///
    /// # Errors
    ///
    /// Fails when `boundaries.len() != values.len() + 1` or boundaries are not
    /// strictly increasing.
    pub fn new(boundaries: Vec<TimesliceId>, values: Vec<f64>) -> Result<Self> {
        if boundaries.is_empty() && values.is_empty() {
            return Ok(Self::empty());
        }
        if boundaries.len() != values.len() + 1 {
            return Err(AnalysisError::InvalidModel(format!(
                "{} observation boundaries cannot bracket {} observations",
                boundaries.len(),
                values.len()
            )));
        }
        if let Some(w) = boundaries.windows(2).find(|w| w[0] >= w[1]) {
            return Err(AnalysisError::InvalidModel(format!(
                "observation periods must be at least one timeslice long ({} -> {})",
                w[0], w[1]
            )));
        }
        Ok(Self { boundaries, values })
    }

    pub fn empty() -> Self {
        Self {
            boundaries: vec![0],
            values: Vec::new(),
        }
    }

    pub fn first_timeslice(&self) -> TimesliceId {
        self.boundaries[0] + 1
    }

    pub fn last_timeslice(&self) -> TimesliceId {
        self.boundaries[self.boundaries.len() - 1]
    }

    pub fn observation_count(&self) -> usize {
        self.values.len()
    }

    pub fn periods(&self) -> ObservationPeriods<'_> {
        ObservationPeriods {
            observations: self,
            next: 0,
            end: self.values.len(),
        }
    }

    /// Periods overlapping `[first, last]`, clamped to the observed range
    pub fn periods_between(&self, first: TimesliceId, last: TimesliceId) -> ObservationPeriods<'_> {
        let first = first.max(self.first_timeslice());
        let last = last.min(self.last_timeslice());
        if first > last {
            return ObservationPeriods {
                observations: self,
                next: 0,
                end: 0,
            };
        }
        // A timeslice equal to boundary j closes period j - 1
        let period_of = |ts: TimesliceId| match self.boundaries.binary_search(&ts) {
            Ok(j) => j - 1,
            Err(j) => j - 1,
        };
        ObservationPeriods {
            observations: self,
            next: period_of(first),
            end: period_of(last) + 1,
        }
    }
}

/// Forward-only iterator over observation periods
#[derive(Debug, Clone)]
pub struct ObservationPeriods<'a> {
    observations: &'a RateObservations,
    next: usize,
    end: usize,
}

impl Iterator for ObservationPeriods<'_> {
    type Item = ObservationPeriod;

    fn next(&mut self) -> Option<ObservationPeriod> {
        if self.next >= self.end {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(ObservationPeriod {
            first_timeslice: self.observations.boundaries[i] + 1,
            last_timeslice: self.observations.boundaries[i + 1],
            value: self.observations.values[i],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_and_periods() {
        let obs = RateObservations::new(vec![0, 5, 10], vec![1.0, 2.0]).unwrap();
        assert_eq!(obs.first_timeslice(), 1);
        assert_eq!(obs.last_timeslice(), 10);
        let periods: Vec<_> = obs.periods().collect();
        assert_eq!(periods[0].first_timeslice, 1);
        assert_eq!(periods[0].last_timeslice, 5);
        assert_eq!(periods[1].timeslice_count(), 5);
    }

    #[test]
    fn test_periods_between_uses_boundary_ownership() {
        let obs = RateObservations::new(vec![0, 5, 10, 15], vec![1.0, 2.0, 3.0]).unwrap();
        let values: Vec<f64> = obs.periods_between(5, 6).map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
        let values: Vec<f64> = obs.periods_between(6, 10).map(|p| p.value).collect();
        assert_eq!(values, vec![2.0]);
        let values: Vec<f64> = obs.periods_between(-10, 100).map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(obs.periods_between(8, 7).count(), 0);
    }

    #[test]
    fn test_empty_and_invalid() {
        let empty = RateObservations::new(vec![], vec![]).unwrap();
        assert_eq!(empty.observation_count(), 0);
        assert_eq!(empty.periods().count(), 0);
        assert!(empty.first_timeslice() > empty.last_timeslice());
        assert!(RateObservations::new(vec![0, 5], vec![1.0, 2.0]).is_err());
        assert!(RateObservations::new(vec![0, 5, 5], vec![1.0, 2.0]).is_err());
    }
}

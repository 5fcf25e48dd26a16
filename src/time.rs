//! Discrete time primitives
//!
//! All analysis runs on fixed-length **timeslices**. [`Time`] converts nanosecond
//! timestamps to timeslice ids and back, and [`PeriodList`] is a sorted set of
//! disjoint inclusive ranges used for active, blocked and bottlenecked spans.
//!
//! # Boundary rounding
//!
//! ```text
//! start timestamp: round to nearest slice boundary, midpoint rounds up
//! end timestamp:   round to nearest slice boundary, midpoint rounds down, minus one
//!
//!   |----slice 0----|----slice 1----|
//!   0              10              20      (ns = 10)
//!   period [4, 15] -> slices [0, 1]
//!   period [5, 14] -> slices [1, 0]   (empty, duration 0)
//! ```
//!
//! A period ending at `t` and one starting at `t` therefore never share a slice
//! and never leave a gap between them.

use crate::error::{AnalysisError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Nanoseconds since an arbitrary epoch
pub type TimestampNs = i64;

/// Identifier of one timeslice
pub type TimesliceId = i64;

/// Number of timeslices
pub type TimesliceCount = i64;

/// Fractional number of timeslices, produced by the simulator
pub type FractionalTimesliceCount = f64;

/// Default to 10 millisecond timeslices
pub const DEFAULT_TIMESLICE_LENGTH_NS: i64 = 10_000_000;

/// Timeslice granularity shared by the execution and resource models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Time {
    nanoseconds_per_timeslice: i64,
}

impl Default for Time {
    fn default() -> Self {
        Self {
            nanoseconds_per_timeslice: DEFAULT_TIMESLICE_LENGTH_NS,
        }
    }
}

impl Time {
    /// Create a granularity of `nanoseconds_per_timeslice` ns per slice
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the slice length is not positive.
    pub fn new(nanoseconds_per_timeslice: i64) -> Result<Self> {
        if nanoseconds_per_timeslice <= 0 {
            return Err(AnalysisError::Configuration(format!(
                "timeslice length must be positive, got {nanoseconds_per_timeslice}ns"
            )));
        }
        Ok(Self {
            nanoseconds_per_timeslice,
        })
    }

    pub fn nanoseconds_per_timeslice(&self) -> i64 {
        self.nanoseconds_per_timeslice
    }

    fn timeslice_containing(&self, timestamp: TimestampNs) -> TimesliceId {
        timestamp.div_euclid(self.nanoseconds_per_timeslice)
    }

    /// First timeslice of a period starting at `timestamp`
    pub fn timeslice_for_start_timestamp(&self, timestamp: TimestampNs) -> TimesliceId {
        let slice = self.timeslice_containing(timestamp);
        let offset = timestamp - slice * self.nanoseconds_per_timeslice;
        if offset >= self.nanoseconds_per_timeslice / 2 {
            slice + 1
        } else {
            slice
        }
    }

    /// Last timeslice of a period ending at `timestamp`
    pub fn timeslice_for_end_timestamp(&self, timestamp: TimestampNs) -> TimesliceId {
        let slice = self.timeslice_containing(timestamp);
        let offset = timestamp - slice * self.nanoseconds_per_timeslice;
        if offset < self.nanoseconds_per_timeslice / 2 {
            slice - 1
        } else {
            slice
        }
    }

    pub fn start_of_timeslice(&self, timeslice: TimesliceId) -> TimestampNs {
        timeslice * self.nanoseconds_per_timeslice
    }

    pub fn end_of_timeslice(&self, timeslice: TimesliceId) -> TimestampNs {
        self.start_of_timeslice(timeslice + 1) - 1
    }

    /// Convert a nanosecond period to its inclusive timeslice range
    pub fn to_timeslice_period(&self, period: Period<Nanoseconds>) -> Period<Timeslices> {
        Period::new(
            self.timeslice_for_start_timestamp(period.start),
            self.timeslice_for_end_timestamp(period.end),
        )
    }
}

/// Unit tag for the values stored in a [`Period`]
pub trait PeriodUnit: Copy + fmt::Debug + PartialEq + Eq + Default {}

/// Periods measured in nanosecond timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nanoseconds;

/// Periods measured in timeslice ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeslices;

impl PeriodUnit for Nanoseconds {}
impl PeriodUnit for Timeslices {}

/// Inclusive integer range `[start, end]`; empty when `end < start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Period<U: PeriodUnit> {
    pub start: i64,
    pub end: i64,
    #[serde(skip)]
    unit: PhantomData<U>,
}

impl<U: PeriodUnit> Period<U> {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            unit: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn len(&self) -> i64 {
        (self.end - self.start + 1).max(0)
    }

    pub fn contains(&self, value: i64) -> bool {
        self.start <= value && value <= self.end
    }
}

impl<U: PeriodUnit> fmt::Display for Period<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Sorted list of disjoint, non-adjacent inclusive ranges
///
/// Construction sorts and merges its input: overlapping ranges and ranges whose
/// gap is zero (`next.start == end + 1`) collapse into one.
///
/// # Example
///
/// ```
/// use phaselens::time::{Period, PeriodList, Timeslices};
///
/// let a = PeriodList::<Timeslices>::new(vec![Period::new(0, 9), Period::new(10, 20)]);
/// let b = PeriodList::new(vec![Period::new(5, 7)]);
/// let diff = a.subtract(&b);
/// assert_eq!(diff.periods(), &[Period::new(0, 4), Period::new(8, 20)]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PeriodList<U: PeriodUnit> {
    periods: Vec<Period<U>>,
}

impl<U: PeriodUnit> PeriodList<U> {
    pub fn new(mut periods: Vec<Period<U>>) -> Self {
        periods.sort_by_key(|p| p.start);

        let mut merged: Vec<Period<U>> = Vec::with_capacity(periods.len());
        let mut i = 0;
        while i < periods.len() {
            let start = periods[i].start;
            let mut end = periods[i].end;
            i += 1;
            while i < periods.len() && periods[i].start <= end.saturating_add(1) {
                end = end.max(periods[i].end);
                i += 1;
            }
            if start <= end {
                merged.push(Period::new(start, end));
            }
        }

        Self { periods: merged }
    }

    pub fn single(period: Period<U>) -> Self {
        Self::new(vec![period])
    }

    pub fn empty() -> Self {
        Self {
            periods: Vec::new(),
        }
    }

    pub fn periods(&self) -> &[Period<U>] {
        &self.periods
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// Total number of values covered by all periods
    pub fn total_len(&self) -> i64 {
        self.periods.iter().map(Period::len).sum()
    }

    /// Set difference `self - other`
    pub fn subtract(&self, other: &PeriodList<U>) -> PeriodList<U> {
        let Some(first_other) = other.periods.first() else {
            return self.clone();
        };

        let mut result = Vec::with_capacity(self.periods.len());
        let mut current = *first_other;
        let mut next_other = 1;

        for period in &self.periods {
            let mut start = period.start;
            while start <= period.end {
                // Advance to the first subtracted period ending at or after `start`
                while current.end < start && next_other < other.periods.len() {
                    current = other.periods[next_other];
                    next_other += 1;
                }

                if current.end < start || current.start > period.end {
                    result.push(Period::new(start, period.end));
                    break;
                } else if current.start <= start {
                    start = current.end.saturating_add(1);
                } else {
                    result.push(Period::new(start, current.start - 1));
                    start = current.end.saturating_add(1);
                }
            }
        }

        PeriodList { periods: result }
    }

    /// Per-value membership over `[first, last]`, one `bool` per value
    pub fn membership(&self, first: i64, last: i64) -> Membership<'_, U> {
        let next_period = self.periods.partition_point(|p| p.end < first);
        Membership {
            periods: &self.periods,
            next_period,
            position: first,
            last,
        }
    }
}

impl PeriodList<Nanoseconds> {
    /// Convert every period to timeslices, dropping periods that round to nothing
    pub fn to_timeslices(&self, time: &Time) -> PeriodList<Timeslices> {
        PeriodList::new(
            self.periods
                .iter()
                .map(|p| time.to_timeslice_period(*p))
                .collect(),
        )
    }
}

/// Forward-only iterator produced by [`PeriodList::membership`]
#[derive(Debug, Clone)]
pub struct Membership<'a, U: PeriodUnit> {
    periods: &'a [Period<U>],
    next_period: usize,
    position: i64,
    last: i64,
}

impl<U: PeriodUnit> Iterator for Membership<'_, U> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.position > self.last {
            return None;
        }
        while self.next_period < self.periods.len()
            && self.periods[self.next_period].end < self.position
        {
            self.next_period += 1;
        }
        let inside = self
            .periods
            .get(self.next_period)
            .is_some_and(|p| p.start <= self.position);
        self.position += 1;
        Some(inside)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.last - self.position + 1).unwrap_or(0);
        (remaining, Some(remaining))
    }
}

impl<U: PeriodUnit> ExactSizeIterator for Membership<'_, U> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn slices(ranges: &[(i64, i64)]) -> PeriodList<Timeslices> {
        PeriodList::new(ranges.iter().map(|&(s, e)| Period::new(s, e)).collect())
    }

    #[test]
    fn test_merge_overlapping_and_adjacent() {
        let list = slices(&[(10, 12), (0, 3), (4, 6), (11, 15), (20, 19)]);
        assert_eq!(list.periods(), &[Period::new(0, 6), Period::new(10, 15)]);
    }

    #[test]
    fn test_subtract_splits_and_trims() {
        let a = slices(&[(0, 20), (30, 40)]);
        let b = slices(&[(0, 2), (5, 7), (18, 32), (40, 50)]);
        let diff = a.subtract(&b);
        assert_eq!(
            diff.periods(),
            &[
                Period::new(3, 4),
                Period::new(8, 17),
                Period::new(33, 39)
            ]
        );
    }

    #[test]
    fn test_subtract_empty_and_self() {
        let a = slices(&[(1, 5), (9, 9)]);
        assert_eq!(a.subtract(&PeriodList::empty()), a);
        assert!(a.subtract(&a).is_empty());
    }

    #[test]
    fn test_membership_window() {
        let list = slices(&[(2, 3), (6, 6)]);
        let bits: Vec<bool> = list.membership(1, 7).collect();
        assert_eq!(bits, vec![false, true, true, false, false, true, false]);
        assert_eq!(list.membership(5, 4).count(), 0);
    }

    #[test]
    fn test_time_rounding() {
        let time = Time::new(10).unwrap();
        assert_eq!(time.timeslice_for_start_timestamp(4), 0);
        assert_eq!(time.timeslice_for_start_timestamp(5), 1);
        assert_eq!(time.timeslice_for_end_timestamp(14), 0);
        assert_eq!(time.timeslice_for_end_timestamp(15), 1);
        assert_eq!(time.start_of_timeslice(3), 30);
        assert_eq!(time.end_of_timeslice(3), 39);
    }

    #[test]
    fn test_time_rejects_non_positive_length() {
        assert!(Time::new(0).is_err());
        assert!(Time::new(-5).is_err());
        assert_eq!(
            Time::default().nanoseconds_per_timeslice(),
            DEFAULT_TIMESLICE_LENGTH_NS
        );
    }

    #[test]
    fn test_nanosecond_periods_to_timeslices() {
        let time = Time::new(10).unwrap();
        let ns = PeriodList::<Nanoseconds>::new(vec![Period::new(4, 15), Period::new(40, 44)]);
        let ts = ns.to_timeslices(&time);
        // [40, 44] rounds to [4, 3] and disappears
        assert_eq!(ts.periods(), &[Period::new(0, 1)]);
    }
}

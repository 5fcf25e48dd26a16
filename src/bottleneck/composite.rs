//! Time sweep combining subphase statuses into a composite phase status

use super::{BottleneckIdentificationResult, BottleneckIter, BottleneckSource, BottleneckStatus};
use crate::error::Result;
use crate::model::{Phase, PhaseId};
use crate::time::TimesliceId;
use std::fmt::Write as _;

/// Status iterator of a composite phase for one metric or metric type
///
/// Subphase iterators are created when their phase starts and dropped when it
/// ends. The set of running subphases is a dense array with swap-delete
/// removal, so bookkeeping per timeslice is proportional to the number of
/// starting, ending and running subphases only.
pub struct CompositeSweep<'a> {
    result: &'a BottleneckIdentificationResult<'a>,
    phase: &'a Phase,
    key: BottleneckSource,
    subphases: Vec<&'a Phase>,
    by_start: Vec<usize>,
    by_end: Vec<usize>,
    started: usize,
    ended: usize,
    /// Subphase index to slot in the active arrays
    active_slot: Vec<Option<usize>>,
    active_phase: Vec<usize>,
    active_iters: Vec<BottleneckIter<'a>>,
    statuses: Vec<(PhaseId, BottleneckStatus)>,
    next_timeslice: TimesliceId,
    failed: bool,
}

impl<'a> CompositeSweep<'a> {
    pub(super) fn new(
        result: &'a BottleneckIdentificationResult<'a>,
        phase: PhaseId,
        key: BottleneckSource,
        subphases: &[PhaseId],
    ) -> Result<Self> {
        let execution = result.attribution().execution();
        let phase = execution.phase(phase);
        let subphases: Vec<&Phase> = subphases
            .iter()
            .map(|&id| execution.phase(id))
            .filter(|p| {
                p.first_timeslice <= phase.last_timeslice
                    && p.last_timeslice >= phase.first_timeslice
                    && p.duration() > 0
            })
            .collect();

        let mut by_start: Vec<usize> = (0..subphases.len()).collect();
        by_start.sort_by_key(|&i| subphases[i].first_timeslice);
        let mut by_end: Vec<usize> = (0..subphases.len()).collect();
        by_end.sort_by_key(|&i| subphases[i].last_timeslice);

        let mut sweep = Self {
            result,
            phase,
            key,
            active_slot: vec![None; subphases.len()],
            active_phase: Vec::with_capacity(subphases.len()),
            active_iters: Vec::with_capacity(subphases.len()),
            statuses: Vec::with_capacity(subphases.len()),
            subphases,
            by_start,
            by_end,
            started: 0,
            ended: 0,
            next_timeslice: phase.first_timeslice,
            failed: false,
        };

        // Subphases that began before the composite are fast-forwarded into it
        while let Some(&index) = sweep.by_start.get(sweep.started) {
            let first = sweep.subphases[index].first_timeslice;
            if first >= sweep.next_timeslice {
                break;
            }
            let mut iter = sweep.result.iter_for(sweep.subphases[index].id, key)?;
            for _ in first..sweep.next_timeslice {
                iter.next();
            }
            sweep.activate(index, iter);
        }
        Ok(sweep)
    }

    fn activate(&mut self, index: usize, iter: BottleneckIter<'a>) {
        self.active_slot[index] = Some(self.active_phase.len());
        self.active_phase.push(index);
        self.active_iters.push(iter);
        self.started += 1;
    }

    fn deactivate(&mut self, index: usize) -> bool {
        let Some(slot) = self.active_slot[index].take() else {
            return false;
        };
        self.active_phase.swap_remove(slot);
        self.active_iters.swap_remove(slot);
        if let Some(&moved) = self.active_phase.get(slot) {
            self.active_slot[moved] = Some(slot);
        }
        self.ended += 1;
        true
    }

    fn fail(&mut self, message: &str) {
        self.failed = true;
        tracing::error!(
            phase = %self.phase.path,
            key = ?self.key,
            dump = %self.dump(),
            "{message}"
        );
    }

    /// Internal state, logged when the sweep's bookkeeping breaks
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Phase: {} [{}, {}] => {}",
            self.phase.path,
            self.phase.first_timeslice,
            self.phase.last_timeslice,
            self.phase.duration()
        );
        let _ = writeln!(out, "Subphases:");
        for p in &self.subphases {
            let _ = writeln!(
                out,
                "\t{} [{}, {}] => {}",
                p.path,
                p.first_timeslice,
                p.last_timeslice,
                p.duration()
            );
        }
        let _ = writeln!(out, "active_slot: {:?}", self.active_slot);
        let _ = writeln!(out, "active_phase: {:?}", self.active_phase);
        let _ = writeln!(out, "by_start: {:?} (started {})", self.by_start, self.started);
        let _ = writeln!(out, "by_end: {:?} (ended {})", self.by_end, self.ended);
        let _ = write!(out, "next_timeslice: {}", self.next_timeslice);
        out
    }
}

impl Iterator for CompositeSweep<'_> {
    type Item = BottleneckStatus;

    fn next(&mut self) -> Option<BottleneckStatus> {
        if self.failed || self.next_timeslice > self.phase.last_timeslice {
            return None;
        }
        let now = self.next_timeslice;
        self.next_timeslice += 1;

        while let Some(&index) = self.by_start.get(self.started) {
            if self.subphases[index].first_timeslice > now {
                break;
            }
            match self.result.iter_for(self.subphases[index].id, self.key) {
                Ok(iter) => self.activate(index, iter),
                Err(e) => {
                    self.fail(&format!("Failed to create subphase bottleneck iterator: {e}"));
                    return None;
                }
            }
        }

        self.statuses.clear();
        for slot in 0..self.active_iters.len() {
            let Some(status) = self.active_iters[slot].next() else {
                self.fail("Subphase bottleneck iterator ended before its phase");
                return None;
            };
            let phase = self.subphases[self.active_phase[slot]].id;
            self.statuses.push((phase, status));
        }
        let combined = self
            .result
            .settings()
            .predicate
            .combine(self.phase, &self.statuses);

        while let Some(&index) = self.by_end.get(self.ended) {
            if self.subphases[index].last_timeslice > now {
                break;
            }
            if !self.deactivate(index) {
                self.fail("Ending subphase was never active");
                return None;
            }
        }

        Some(combined)
    }
}

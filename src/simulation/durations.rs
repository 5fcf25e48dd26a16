//! Per-phase duration overrides for what-if simulation

use crate::error::{AnalysisError, Result};
use crate::model::PhaseId;
use crate::time::FractionalTimesliceCount;
use std::sync::Arc;

/// Shape of the phase tree shared by every map a simulator hands out
#[derive(Debug)]
pub(crate) struct DurationLayout {
    pub(crate) subtree_sizes: Vec<usize>,
    /// Phases whose duration must always be derived from their subphases
    pub(crate) override_blocked: Vec<bool>,
}

impl DurationLayout {
    fn range(&self, phase: PhaseId) -> std::ops::Range<usize> {
        phase.index()..phase.index() + self.subtree_sizes[phase.index()]
    }
}

/// Durations of the phases in one subtree, indexed densely from its root
///
/// An infinite duration means "unknown": the simulator derives it from the
/// subphases. A finite duration makes the simulator skip the subtree.
#[derive(Debug, Clone)]
pub struct PhaseDurationMap {
    layout: Arc<DurationLayout>,
    root: PhaseId,
    durations: Vec<FractionalTimesliceCount>,
}

impl PhaseDurationMap {
    /// `durations` holds one entry per phase in the subtree of `root`
    pub(crate) fn new(
        layout: Arc<DurationLayout>,
        root: PhaseId,
        durations: Vec<FractionalTimesliceCount>,
    ) -> Self {
        debug_assert_eq!(durations.len(), layout.subtree_sizes[root.index()]);
        Self {
            layout,
            root,
            durations,
        }
    }

    pub(crate) fn shares_layout(&self, layout: &Arc<DurationLayout>) -> bool {
        Arc::ptr_eq(&self.layout, layout)
    }

    pub fn root(&self) -> PhaseId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Whether `phase` lies in the subtree this map covers
    pub fn contains(&self, phase: PhaseId) -> bool {
        self.offset(phase).is_some()
    }

    fn offset(&self, phase: PhaseId) -> Option<usize> {
        phase
            .index()
            .checked_sub(self.root.index())
            .filter(|&offset| offset < self.durations.len())
    }

    pub fn get(&self, phase: PhaseId) -> Option<FractionalTimesliceCount> {
        self.offset(phase).map(|offset| self.durations[offset])
    }

    pub(crate) fn get_at(&self, offset: usize) -> FractionalTimesliceCount {
        self.durations[offset]
    }

    pub fn can_override(&self, phase: PhaseId) -> bool {
        !self.layout.override_blocked[phase.index()]
    }

    /// Set the duration of `phase`
    ///
    /// Returns false, leaving the map unchanged, for phases outside the map
    /// and for phases whose duration may not be overridden.
    pub fn set(&mut self, phase: PhaseId, duration: FractionalTimesliceCount) -> bool {
        match self.offset(phase) {
            Some(offset) if self.can_override(phase) => {
                self.durations[offset] = duration;
                true
            }
            _ => false,
        }
    }

    /// Forget the duration of `phase` so it is simulated from its subphases
    pub fn clear(&mut self, phase: PhaseId) -> bool {
        self.set(phase, f64::INFINITY)
    }

    /// Copy the durations of the subtree of `phase` from `other`
    ///
    /// # Errors
    ///
    /// Both maps must come from the same simulator and contain that subtree.
    pub fn copy_range_from(&mut self, other: &PhaseDurationMap, phase: PhaseId) -> Result<()> {
        if !Arc::ptr_eq(&self.layout, &other.layout) {
            return Err(AnalysisError::Configuration(
                "duration maps belong to different execution models".to_string(),
            ));
        }
        let range = self.layout.range(phase);
        let (Some(dst), Some(src)) = (self.offset(phase), other.offset(phase)) else {
            return Err(AnalysisError::Configuration(format!(
                "phase {phase} is not covered by both duration maps"
            )));
        };
        let len = range.len();
        if dst + len > self.durations.len() || src + len > other.durations.len() {
            return Err(AnalysisError::Configuration(format!(
                "subtree of phase {phase} is not covered by both duration maps"
            )));
        }
        self.durations[dst..dst + len].copy_from_slice(&other.durations[src..src + len]);
        Ok(())
    }

    /// Map restricted to the subtree of `phase`
    pub fn subset(&self, phase: PhaseId) -> Result<PhaseDurationMap> {
        let start = self.offset(phase).ok_or_else(|| {
            AnalysisError::Configuration(format!("phase {phase} is not covered by the duration map"))
        })?;
        let len = self.layout.subtree_sizes[phase.index()];
        Ok(Self {
            layout: Arc::clone(&self.layout),
            root: phase,
            durations: self.durations[start..start + len].to_vec(),
        })
    }
}

//! What-if simulation of phase execution
//!
//! A simulator replays the dependency graph of an execution with a
//! [`PhaseDurationMap`] of known durations. Phases with a known duration
//! finish exactly that long after they start and their subphases are not
//! simulated; the others end when their subphases do. Changing entries of the
//! map answers questions like "how long would the job take if this phase were
//! never bottlenecked".
//!
//! # Example
//!
//! ```
//! use phaselens::model::{ExecutionModelBuilder, ExecutionModelSpecification, Repeatability};
//! use phaselens::simulation::{
//!     ConcurrencyConstraintRule, DefaultPhaseExecutionSimulator, PhaseExecutionSimulator,
//! };
//! use phaselens::time::Time;
//!
//! # fn main() -> phaselens::Result<()> {
//! let mut spec = ExecutionModelSpecification::new();
//! let task = spec.add_phase_type(spec.root(), "task", Repeatability::repeatable("id", true))?;
//! let mut builder = ExecutionModelBuilder::new(spec, Time::default(), 0, 99);
//! let root = builder.root();
//! builder.add_phase(root, task, "a", 0, 49);
//! builder.add_phase(root, task, "b", 50, 99);
//! let execution = builder.build()?;
//!
//! let simulator =
//!     DefaultPhaseExecutionSimulator::new::<ConcurrencyConstraintRule>(&execution, &[])?;
//! let durations = simulator.new_duration_map(execution.root());
//! let result = simulator.simulate(execution.root(), &durations)?;
//! // Without dependencies the two tasks overlap
//! assert_eq!(result.total_duration(), 50.0);
//! # Ok(())
//! # }
//! ```

mod constraints;
mod durations;
mod simulator;


pub use constraints::{
    ConcurrencyConstraintRule, ConcurrencyLimit, SchedulingConstraint, SchedulingConstraintRule,
};
pub use durations::PhaseDurationMap;
pub use simulator::DefaultPhaseExecutionSimulator;

use crate::error::Result;
use crate::model::{ExecutionModel, PhaseId};
use crate::time::FractionalTimesliceCount;
use serde::Serialize;

/// Simulates a subtree of the execution it was created for
pub trait PhaseExecutionSimulator: Send + Sync {
    /// Simulate the subtree of `root`
    ///
    /// `durations` must cover that subtree and come from
    /// [`new_duration_map`](Self::new_duration_map) of the same simulator.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::Deadlock`](crate::AnalysisError::Deadlock) when
    /// `root` never completes or a phase below it can never start.
    fn simulate(&self, root: PhaseId, durations: &PhaseDurationMap) -> Result<SimulationResult>;

    /// Map of the subtree of `root` with every leaf set to its measured duration
    fn new_duration_map(&self, root: PhaseId) -> PhaseDurationMap;
}

/// Builds the simulator used for one execution
pub type SimulatorFactory =
    Box<dyn Fn(&ExecutionModel) -> Result<Box<dyn PhaseExecutionSimulator>> + Send + Sync>;

/// Factory for unconstrained simulators, or simulators with the given rules
pub fn simulator_factory(rules: Vec<ConcurrencyConstraintRule>) -> SimulatorFactory {
    Box::new(move |execution| {
        let simulator = DefaultPhaseExecutionSimulator::new(execution, &rules)?;
        Ok(Box::new(simulator) as Box<dyn PhaseExecutionSimulator>)
    })
}

/// Simulated start and end times of every phase in a subtree
///
/// Times are fractional timeslices relative to the start of the root.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    root: PhaseId,
    start_times: Vec<FractionalTimesliceCount>,
    end_times: Vec<FractionalTimesliceCount>,
}

impl SimulationResult {
    pub(crate) fn new(
        root: PhaseId,
        start_times: Vec<FractionalTimesliceCount>,
        end_times: Vec<FractionalTimesliceCount>,
    ) -> Self {
        Self {
            root,
            start_times,
            end_times,
        }
    }

    pub fn root(&self) -> PhaseId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.start_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start_times.is_empty()
    }

    fn offset(&self, phase: PhaseId) -> Option<usize> {
        phase
            .index()
            .checked_sub(self.root.index())
            .filter(|&offset| offset < self.start_times.len())
    }

    /// Start of `phase`, infinite for phases inside a fast-forwarded subtree
    pub fn start_time(&self, phase: PhaseId) -> Option<FractionalTimesliceCount> {
        self.offset(phase).map(|o| self.start_times[o])
    }

    pub fn end_time(&self, phase: PhaseId) -> Option<FractionalTimesliceCount> {
        self.offset(phase).map(|o| self.end_times[o])
    }

    /// Start time by offset from the root in pre-order
    pub fn start_time_at(&self, offset: usize) -> FractionalTimesliceCount {
        self.start_times[offset]
    }

    pub fn end_time_at(&self, offset: usize) -> FractionalTimesliceCount {
        self.end_times[offset]
    }

    pub fn duration(&self, phase: PhaseId) -> Option<FractionalTimesliceCount> {
        self.offset(phase)
            .map(|o| self.end_times[o] - self.start_times[o])
    }

    pub fn total_duration(&self) -> FractionalTimesliceCount {
        self.end_times[0] - self.start_times[0]
    }
}

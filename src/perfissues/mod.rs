//! Performance issue identification
//!
//! The job is first simulated with every leaf phase shortened to the time it
//! spends bottlenecked, which removes the overhead of phases that were not
//! limited by any resource. Each pass then explores what-if scenarios on top
//! of that baseline and reports the estimated impact of one kind of issue.

mod bottleneck_duration;
mod phase_imbalance;


pub use bottleneck_duration::{
    BottleneckDurationIssue, BottleneckDurationPass, BottleneckSpecification,
};
pub use phase_imbalance::{ImbalanceSpecification, PhaseImbalanceIssue, PhaseImbalancePass};

use crate::bottleneck::BottleneckIdentificationResult;
use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, MetricId, MetricTypeId, PhaseId, ResourceModel};
use crate::simulation::{
    simulator_factory, PhaseDurationMap, PhaseExecutionSimulator, SimulationResult, SimulatorFactory,
};
use crate::time::{FractionalTimesliceCount, TimesliceCount};

/// Everything a pass may consult
pub struct IssueContext<'a> {
    pub execution: &'a ExecutionModel,
    pub resources: &'a ResourceModel,
    pub bottlenecks: &'a BottleneckIdentificationResult<'a>,
    pub simulator: &'a dyn PhaseExecutionSimulator,
    /// Baseline simulation of the whole job
    pub simulated: &'a SimulationResult,
}

impl IssueContext<'_> {
    /// See [`bottlenecked_duration`]
    pub fn bottlenecked_duration(&self, leaf: PhaseId) -> Result<FractionalTimesliceCount> {
        bottlenecked_duration(self.execution, self.bottlenecks, leaf)
    }

    /// Simulated duration of the subtree of `root`
    pub fn simulate(
        &self,
        root: PhaseId,
        durations: &PhaseDurationMap,
    ) -> Result<FractionalTimesliceCount> {
        Ok(self.simulator.simulate(root, durations)?.total_duration())
    }
}

/// Duration of a leaf without the timeslices in which nothing limited it
pub fn bottlenecked_duration(
    execution: &ExecutionModel,
    bottlenecks: &BottleneckIdentificationResult<'_>,
    leaf: PhaseId,
) -> Result<FractionalTimesliceCount> {
    let not_bottlenecked = bottlenecks.metric_type_bottlenecks(leaf).time_not_bottlenecked()?;
    Ok((execution.phase(leaf).duration() - not_bottlenecked) as f64)
}

pub trait PerformanceIssueIdentificationPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn execute(&self, context: &IssueContext<'_>) -> Result<Vec<PerformanceIssue>>;
}

/// Pass computed bottom-up over the phase tree
///
/// Each phase's result is derived from its subphases' results, and issues
/// are extracted at every phase once its result is known.
pub trait HierarchicalPass {
    type PhaseResult;

    fn analyze_leaf(&self, context: &IssueContext<'_>, leaf: PhaseId) -> Result<Self::PhaseResult>;

    fn combine(
        &self,
        context: &IssueContext<'_>,
        composite: PhaseId,
        subphases: Vec<(PhaseId, Self::PhaseResult)>,
    ) -> Result<Self::PhaseResult>;

    fn extract_issues(
        &self,
        context: &IssueContext<'_>,
        phase: PhaseId,
        result: &Self::PhaseResult,
    ) -> Vec<PerformanceIssue>;

    fn run(&self, context: &IssueContext<'_>) -> Result<Vec<PerformanceIssue>>
    where
        Self: Sized,
    {
        let mut issues = Vec::new();
        analyze_phase(self, context, context.execution.root(), &mut issues)?;
        Ok(issues)
    }
}

fn analyze_phase<P: HierarchicalPass>(
    pass: &P,
    context: &IssueContext<'_>,
    phase: PhaseId,
    issues: &mut Vec<PerformanceIssue>,
) -> Result<P::PhaseResult> {
    let node = context.execution.phase(phase);
    let result = if node.is_leaf() {
        pass.analyze_leaf(context, phase)?
    } else {
        let mut subphases = Vec::with_capacity(node.subphases.len());
        for &subphase in &node.subphases {
            subphases.push((subphase, analyze_phase(pass, context, subphase, issues)?));
        }
        pass.combine(context, phase, subphases)?
    };
    issues.extend(pass.extract_issues(context, phase, &result));
    Ok(result)
}

/// Issue reported by one of the built-in passes
#[derive(Debug, Clone, PartialEq)]
pub enum PerformanceIssue {
    BottleneckDuration(BottleneckDurationIssue),
    PhaseImbalance(PhaseImbalanceIssue),
}

impl PerformanceIssue {
    /// Phase whose simulated duration the issue affects
    pub fn phase(&self) -> PhaseId {
        match self {
            Self::BottleneckDuration(issue) => issue.aggregate_phase,
            Self::PhaseImbalance(issue) => issue.root_phase,
        }
    }

    /// Simulated duration with and without the issue, and the measured duration
    fn durations(&self) -> (FractionalTimesliceCount, FractionalTimesliceCount, TimesliceCount) {
        match self {
            Self::BottleneckDuration(i) => {
                (i.simulated_duration, i.simulated_duration_without, i.real_duration)
            }
            Self::PhaseImbalance(i) => {
                (i.simulated_duration, i.simulated_duration_without, i.real_duration)
            }
        }
    }

    /// Simulated time saved by resolving the issue
    pub fn estimated_impact(&self) -> FractionalTimesliceCount {
        let (simulated, without, _) = self.durations();
        simulated - without
    }

    /// Impact relative to the measured duration of the phase
    pub fn relative_real_impact(&self) -> f64 {
        let (_, _, real) = self.durations();
        ratio(self.estimated_impact(), real as f64)
    }

    /// Impact relative to the simulated duration of the phase
    pub fn relative_simulated_impact(&self) -> f64 {
        let (simulated, _, _) = self.durations();
        ratio(self.estimated_impact(), simulated)
    }

    pub fn affected_phases(&self, execution: &ExecutionModel) -> Vec<PhaseId> {
        match self {
            Self::BottleneckDuration(issue) => issue.affected_phases(execution),
            Self::PhaseImbalance(issue) => vec![issue.root_phase],
        }
    }

    pub fn affected_metrics(&self) -> Option<Vec<MetricId>> {
        match self {
            Self::BottleneckDuration(issue) => issue.affected_metrics(),
            Self::PhaseImbalance(_) => None,
        }
    }

    pub fn affected_metric_types(&self) -> Option<Vec<MetricTypeId>> {
        match self {
            Self::BottleneckDuration(issue) => issue.affected_metric_types(),
            Self::PhaseImbalance(_) => None,
        }
    }

    /// Whether a report should list the issue under `phase`
    pub fn should_display_at(&self, execution: &ExecutionModel, phase: PhaseId) -> bool {
        match self {
            Self::BottleneckDuration(issue) => issue.affects(execution, phase),
            Self::PhaseImbalance(issue) => issue.root_phase == phase,
        }
    }

    pub fn display(&self, execution: &ExecutionModel, resources: &ResourceModel) -> String {
        match self {
            Self::BottleneckDuration(issue) => issue.display(execution, resources),
            Self::PhaseImbalance(issue) => issue.display(execution),
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

pub struct PerformanceIssueIdentificationSettings {
    pub passes: Vec<Box<dyn PerformanceIssueIdentificationPass>>,
    pub simulator: SimulatorFactory,
}

impl Default for PerformanceIssueIdentificationSettings {
    fn default() -> Self {
        Self {
            passes: vec![
                Box::new(BottleneckDurationPass::default()),
                Box::new(PhaseImbalancePass::default()),
            ],
            simulator: simulator_factory(Vec::new()),
        }
    }
}

pub struct PerformanceIssueIdentification;

impl PerformanceIssueIdentification {
    /// Simulate the baseline and run every configured pass
    ///
    /// # Errors
    ///
    /// Fails when the simulator cannot be built, a simulation deadlocks, or
    /// bottleneck statistics cannot be computed.
    pub fn execute(
        execution: &ExecutionModel,
        resources: &ResourceModel,
        settings: &PerformanceIssueIdentificationSettings,
        bottlenecks: &BottleneckIdentificationResult<'_>,
    ) -> Result<PerformanceIssueIdentificationResult> {
        let simulator = (settings.simulator)(execution)?;

        let root = execution.root();
        let mut durations = simulator.new_duration_map(root);
        for leaf in execution.leaf_phases() {
            durations.set(leaf.id, bottlenecked_duration(execution, bottlenecks, leaf.id)?);
        }
        let simulated = simulator.simulate(root, &durations)?;
        tracing::info!(
            measured = execution.phase(root).duration(),
            simulated = simulated.total_duration(),
            "Simulated job without overhead"
        );

        let context = IssueContext {
            execution,
            resources,
            bottlenecks,
            simulator: simulator.as_ref(),
            simulated: &simulated,
        };
        let mut issues_by_pass = Vec::with_capacity(settings.passes.len());
        for pass in &settings.passes {
            let issues = pass.execute(&context)?;
            tracing::debug!(pass = pass.name(), issues = issues.len(), "Ran issue identification pass");
            issues_by_pass.push((pass.name(), issues));
        }

        Ok(PerformanceIssueIdentificationResult {
            issues_by_pass,
            simulation: simulated,
        })
    }
}

#[derive(Debug)]
pub struct PerformanceIssueIdentificationResult {
    issues_by_pass: Vec<(&'static str, Vec<PerformanceIssue>)>,
    simulation: SimulationResult,
}

impl PerformanceIssueIdentificationResult {
    pub fn passes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.issues_by_pass.iter().map(|(name, _)| *name)
    }

    /// Issues of every pass, in pass order
    pub fn issues(&self) -> impl Iterator<Item = &PerformanceIssue> {
        self.issues_by_pass.iter().flat_map(|(_, issues)| issues)
    }

    /// # Errors
    ///
    /// Fails if no pass named `pass` was run.
    pub fn get(&self, pass: &str) -> Result<&[PerformanceIssue]> {
        self.issues_by_pass
            .iter()
            .find(|(name, _)| *name == pass)
            .map(|(_, issues)| issues.as_slice())
            .ok_or_else(|| AnalysisError::not_found("pass", pass))
    }

    pub fn displayed_at<'s>(
        &'s self,
        execution: &'s ExecutionModel,
        phase: PhaseId,
    ) -> impl Iterator<Item = &'s PerformanceIssue> {
        self.issues()
            .filter(move |issue| issue.should_display_at(execution, phase))
    }

    /// Baseline simulation of the job
    pub fn simulation(&self) -> &SimulationResult {
        &self.simulation
    }
}

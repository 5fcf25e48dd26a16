//! Discrete-event simulation of the phase task graph

use super::constraints::{blocked_overrides, SchedulingConstraint, SchedulingConstraintRule};
use super::durations::{DurationLayout, PhaseDurationMap};
use super::{PhaseExecutionSimulator, SimulationResult};
use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, PhaseId};
use crate::time::FractionalTimesliceCount;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

/// Task ids: the start of phase `p` is `2p`, its end `2p + 1`
fn start_task(phase: usize) -> usize {
    2 * phase
}

fn end_task(phase: usize) -> usize {
    2 * phase + 1
}

fn is_start(task: usize) -> bool {
    task % 2 == 0
}

/// Simulator over the dependency graph of an [`ExecutionModel`]
///
/// Every phase contributes a start and an end task. Without explicit
/// dependencies a phase starts with its parent; with them it starts once all
/// of them have ended. A phase ends once all of its subphases have ended,
/// except subphases another phase depends on, since those end before that
/// phase starts. When every such dependent lies outside the simulated
/// subtree the dependency holds its parent open again.
#[derive(Debug)]
pub struct DefaultPhaseExecutionSimulator {
    layout: Arc<DurationLayout>,
    /// Leaf durations; composites are unknown
    default_durations: Vec<FractionalTimesliceCount>,
    parents: Vec<Option<usize>>,
    paths: Vec<String>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Phases some other phase declares as a dependency
    is_dependency: Vec<bool>,
    constraints: Vec<SchedulingConstraint>,
    /// Constraint index and requirement per phase
    constraint_of: Vec<Option<(usize, u64)>>,
}

impl DefaultPhaseExecutionSimulator {
    /// Simulator constrained by the constraints every rule creates
    pub fn new<R: SchedulingConstraintRule>(execution: &ExecutionModel, rules: &[R]) -> Result<Self> {
        let mut constraints = Vec::new();
        for rule in rules {
            constraints.extend(rule.create_constraints(execution)?);
        }
        Self::with_constraints(execution, constraints)
    }

    /// # Errors
    ///
    /// Fails when a phase is subject to more than one constraint or when
    /// phases of one constraint are ancestors of each other.
    pub fn with_constraints(
        execution: &ExecutionModel,
        constraints: Vec<SchedulingConstraint>,
    ) -> Result<Self> {
        let count = execution.phase_count();

        let mut constraint_of = vec![None; count];
        for (index, constraint) in constraints.iter().enumerate() {
            for &(phase, requirement) in &constraint.requirements {
                if constraint_of[phase.index()].replace((index, requirement)).is_some() {
                    return Err(AnalysisError::Configuration(format!(
                        "phase \"{}\" is subject to more than one scheduling constraint",
                        execution.phase(phase).path
                    )));
                }
            }
        }

        let layout = Arc::new(DurationLayout {
            subtree_sizes: execution.phases().map(|p| p.subtree_size).collect(),
            override_blocked: blocked_overrides(execution, &constraints)?,
        });

        // A phase another phase waits for no longer holds its parent open
        let mut is_dependency = vec![false; count];
        for phase in execution.phases() {
            for &dependency in &phase.dependencies {
                is_dependency[dependency.index()] = true;
            }
        }

        let mut dependencies = vec![Vec::new(); 2 * count];
        for phase in execution.phases() {
            let index = phase.id.index();
            dependencies[start_task(index)] = if !phase.dependencies.is_empty() {
                phase.dependencies.iter().map(|d| end_task(d.index())).collect()
            } else {
                phase.parent.map(|p| start_task(p.index())).into_iter().collect()
            };
            let ends: Vec<usize> = phase
                .subphases
                .iter()
                .filter(|s| !is_dependency[s.index()])
                .map(|s| end_task(s.index()))
                .collect();
            dependencies[end_task(index)] = if ends.is_empty() {
                vec![start_task(index)]
            } else {
                ends
            };
        }

        let mut dependents = vec![Vec::new(); 2 * count];
        for (task, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(task);
            }
        }
        for list in &mut dependents {
            list.sort_unstable();
        }

        tracing::debug!(
            phases = count,
            constraints = constraints.len(),
            blocked = layout.override_blocked.iter().filter(|&&b| b).count(),
            "Prepared phase execution simulator"
        );

        Ok(Self {
            layout,
            default_durations: execution
                .phases()
                .map(|p| {
                    if p.is_leaf() {
                        p.duration() as f64
                    } else {
                        f64::INFINITY
                    }
                })
                .collect(),
            parents: execution.phases().map(|p| p.parent.map(PhaseId::index)).collect(),
            paths: execution.phases().map(|p| p.path.clone()).collect(),
            dependencies,
            dependents,
            is_dependency,
            constraints,
            constraint_of,
        })
    }

    pub fn constraints(&self) -> &[SchedulingConstraint] {
        &self.constraints
    }
}

impl PhaseExecutionSimulator for DefaultPhaseExecutionSimulator {
    fn simulate(&self, root: PhaseId, durations: &PhaseDurationMap) -> Result<SimulationResult> {
        if !durations.shares_layout(&self.layout) {
            return Err(AnalysisError::Configuration(
                "duration map was not created by this simulator".to_string(),
            ));
        }
        let durations = if durations.root() == root {
            Cow::Borrowed(durations)
        } else {
            Cow::Owned(durations.subset(root)?)
        };
        Run::new(self, root.index(), &durations).execute()
    }

    fn new_duration_map(&self, root: PhaseId) -> PhaseDurationMap {
        let start = root.index();
        let end = start + self.layout.subtree_sizes[start];
        PhaseDurationMap::new(
            Arc::clone(&self.layout),
            root,
            self.default_durations[start..end].to_vec(),
        )
    }
}

/// Pending end of a phase with a known duration; min-heap on (time, task)
#[derive(Debug, Clone, Copy)]
struct Completion {
    time: FractionalTimesliceCount,
    task: usize,
}

impl Ord for Completion {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.task.cmp(&self.task))
    }
}

impl PartialOrd for Completion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Completion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Completion {}

/// State of one simulation of the subtree of `root`, indexed by offset
struct Run<'s> {
    simulator: &'s DefaultPhaseExecutionSimulator,
    durations: &'s PhaseDurationMap,
    root: usize,
    len: usize,
    now: FractionalTimesliceCount,
    start_times: Vec<FractionalTimesliceCount>,
    end_times: Vec<FractionalTimesliceCount>,
    remaining: Vec<usize>,
    /// Start tasks whose dependencies all lie outside the subtree
    started_by_parent: Vec<Vec<usize>>,
    /// Dependencies no phase in this run waits for; their parent does
    closes_parent: Vec<bool>,
    /// Phases below an ancestor with a known duration
    skipped: Vec<bool>,
    fast_forwarded: Vec<bool>,
    holding: Vec<bool>,
    headroom: Vec<u64>,
    waiting: Vec<VecDeque<usize>>,
    to_check: VecDeque<usize>,
    ready: VecDeque<usize>,
    completions: BinaryHeap<Completion>,
}

impl<'s> Run<'s> {
    fn new(
        simulator: &'s DefaultPhaseExecutionSimulator,
        root: usize,
        durations: &'s PhaseDurationMap,
    ) -> Self {
        let len = simulator.layout.subtree_sizes[root];
        let mut run = Self {
            simulator,
            durations,
            root,
            len,
            now: 0.0,
            start_times: vec![f64::INFINITY; len],
            end_times: vec![f64::INFINITY; len],
            remaining: vec![0; 2 * len],
            started_by_parent: vec![Vec::new(); len],
            closes_parent: vec![false; len],
            skipped: vec![false; len],
            fast_forwarded: vec![false; len],
            holding: vec![false; len],
            headroom: simulator.constraints.iter().map(|c| c.limit).collect(),
            waiting: vec![VecDeque::new(); simulator.constraints.len()],
            to_check: VecDeque::new(),
            ready: VecDeque::new(),
            completions: BinaryHeap::new(),
        };

        for offset in 0..2 * len {
            let task = start_task(root) + offset;
            let inside = simulator.dependencies[task]
                .iter()
                .filter(|&&dep| run.contains(dep))
                .count();
            run.remaining[offset] = inside;
            if inside == 0 && is_start(task) && offset > 0 {
                if let Some(parent) = simulator.parents[task / 2] {
                    run.started_by_parent[parent - root].push(task);
                    run.remaining[offset] = 1;
                }
            }
        }

        for offset in 0..len {
            if !run.skipped[offset] && durations.get_at(offset).is_finite() {
                let size = simulator.layout.subtree_sizes[root + offset];
                run.skipped[offset + 1..offset + size].fill(true);
            }
        }

        for offset in 1..len {
            let phase = root + offset;
            if !simulator.is_dependency[phase] || run.skipped[offset] {
                continue;
            }
            let awaited = simulator.dependents[end_task(phase)]
                .iter()
                .any(|&task| run.contains(task) && !run.skipped[task / 2 - root]);
            if awaited {
                continue;
            }
            if let Some(parent) = simulator.parents[phase] {
                run.closes_parent[offset] = true;
                run.remaining[end_task(parent) - start_task(root)] += 1;
            }
        }
        run
    }

    fn contains(&self, task: usize) -> bool {
        (start_task(self.root)..start_task(self.root + self.len)).contains(&task)
    }

    fn execute(mut self) -> Result<SimulationResult> {
        self.ready.push_back(start_task(self.root));

        while self.end_times[0].is_infinite()
            && !(self.ready.is_empty() && self.to_check.is_empty() && self.completions.is_empty())
        {
            loop {
                while let Some(task) = self.ready.pop_front() {
                    self.process(task);
                }
                while let Some(constraint) = self.to_check.pop_front() {
                    self.admit(constraint);
                }
                if self.ready.is_empty() {
                    break;
                }
            }

            if let Some(next) = self.completions.peek() {
                self.now = next.time;
                while self.completions.peek().is_some_and(|c| c.time == self.now) {
                    if let Some(completion) = self.completions.pop() {
                        self.try_queue(completion.task);
                    }
                }
            }
        }

        let stranded = self.never_started();
        if self.end_times[0].is_infinite() || stranded > 0 {
            let dump = self.dump();
            tracing::error!(
                root = %self.simulator.paths[self.root],
                stranded,
                dump = %dump,
                "Phase execution deadlocked"
            );
            return Err(AnalysisError::Deadlock { dump });
        }

        tracing::trace!(
            root = %self.simulator.paths[self.root],
            phases = self.len,
            duration = self.end_times[0],
            "Simulated phase"
        );
        Ok(SimulationResult::new(
            PhaseId::from_index(self.root),
            self.start_times,
            self.end_times,
        ))
    }

    fn process(&mut self, task: usize) {
        let phase = task / 2;
        if is_start(task) {
            self.start_phase(phase);
        } else {
            self.complete_phase(phase);
        }
    }

    fn start_phase(&mut self, phase: usize) {
        let offset = phase - self.root;
        self.start_times[offset] = self.now;
        let duration = self.durations.get_at(offset);
        if duration.is_finite() {
            self.fast_forwarded[offset] = true;
            self.completions.push(Completion {
                time: self.now + duration,
                task: end_task(phase),
            });
            return;
        }
        self.release_dependents(start_task(phase));
        for task in std::mem::take(&mut self.started_by_parent[offset]) {
            self.satisfy(task);
        }
    }

    fn complete_phase(&mut self, phase: usize) {
        let offset = phase - self.root;
        self.end_times[offset] = self.now;

        if std::mem::replace(&mut self.holding[offset], false) {
            if let Some((constraint, requirement)) = self.simulator.constraint_of[phase] {
                self.headroom[constraint] += requirement;
                if !self.waiting[constraint].is_empty() {
                    self.to_check.push_back(constraint);
                }
            }
        }

        if offset == 0 {
            return;
        }
        self.release_dependents(end_task(phase));
        if self.closes_parent[offset] {
            if let Some(parent) = self.simulator.parents[phase] {
                self.satisfy(end_task(parent));
            }
        }

        // Phases outside a skipped subtree may wait on the end of a phase inside it
        if self.fast_forwarded[offset] {
            let size = self.simulator.layout.subtree_sizes[phase];
            let skipped = start_task(phase)..start_task(phase + size);
            for descendant in phase + 1..phase + size {
                for i in 0..self.simulator.dependents[end_task(descendant)].len() {
                    let task = self.simulator.dependents[end_task(descendant)][i];
                    if !skipped.contains(&task) {
                        self.satisfy(task);
                    }
                }
            }
        }
    }

    fn release_dependents(&mut self, task: usize) {
        for i in 0..self.simulator.dependents[task].len() {
            let dependent = self.simulator.dependents[task][i];
            self.satisfy(dependent);
        }
    }

    fn satisfy(&mut self, task: usize) {
        if !self.contains(task) {
            return;
        }
        let offset = task - start_task(self.root);
        self.remaining[offset] -= 1;
        if self.remaining[offset] == 0 {
            self.try_queue(task);
        }
    }

    fn try_queue(&mut self, task: usize) {
        if is_start(task) {
            if let Some((constraint, requirement)) = self.simulator.constraint_of[task / 2] {
                if self.waiting[constraint].is_empty() && self.headroom[constraint] >= requirement {
                    self.acquire(task, constraint, requirement);
                } else {
                    self.waiting[constraint].push_back(task);
                }
                return;
            }
        }
        self.ready.push_back(task);
    }

    fn acquire(&mut self, task: usize, constraint: usize, requirement: u64) {
        self.headroom[constraint] -= requirement;
        self.holding[task / 2 - self.root] = true;
        self.ready.push_back(task);
    }

    /// Admit waiting phases in arrival order while headroom allows
    fn admit(&mut self, constraint: usize) {
        while let Some(&task) = self.waiting[constraint].front() {
            let Some((_, requirement)) = self.simulator.constraint_of[task / 2] else {
                self.waiting[constraint].pop_front();
                continue;
            };
            if self.headroom[constraint] < requirement {
                break;
            }
            self.waiting[constraint].pop_front();
            self.acquire(task, constraint, requirement);
        }
    }

    /// Phases that should have run but never started
    fn never_started(&self) -> usize {
        (0..self.len)
            .filter(|&o| !self.skipped[o] && self.start_times[o].is_infinite())
            .count()
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Time: {}", self.now);
        let started: Vec<usize> = (0..self.len)
            .filter(|&o| self.start_times[o].is_finite() && self.end_times[o].is_infinite())
            .collect();
        let pending = self.remaining.iter().filter(|&&r| r > 0).count();
        let _ = writeln!(
            out,
            "Phases: {} total, {} running, {} never started, {} tasks waiting on dependencies",
            self.len,
            started.len(),
            self.never_started(),
            pending
        );
        for &offset in started.iter().take(20) {
            let _ = writeln!(
                out,
                "\t{} started at {}",
                self.simulator.paths[self.root + offset],
                self.start_times[offset]
            );
        }
        for (index, queue) in self.waiting.iter().enumerate() {
            if !queue.is_empty() {
                let _ = writeln!(
                    out,
                    "Constraint {index}: headroom {}, {} waiting",
                    self.headroom[index],
                    queue.len()
                );
            }
        }
        let _ = write!(out, "Pending completions: {}", self.completions.len());
        out
    }
}

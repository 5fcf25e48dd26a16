//! Execution model: phase-type schema and the phase tree
//!
//! Phases live in an arena owned by [`ExecutionModel`] and are addressed by
//! [`PhaseId`]. Ids are assigned by a single pre-order traversal in which the
//! children of every phase are ordered by `(first_timeslice, last_timeslice, name)`,
//! so the subtree of any phase occupies the contiguous id range
//! `id..id + subtree_size`.
//!
//! Construction is two-phase: [`ExecutionModelBuilder`] records phases in any
//! order, then [`ExecutionModelBuilder::build`] validates the tree and assigns ids.
//!
//! # Example
//!
//! ```
//! use phaselens::model::{ExecutionModelBuilder, ExecutionModelSpecification, Repeatability};
//! use phaselens::time::Time;
//!
//! # fn main() -> phaselens::Result<()> {
//! let mut spec = ExecutionModelSpecification::new();
//! let task = spec.add_phase_type(spec.root(), "task", Repeatability::repeatable("id", true))?;
//!
//! let mut builder = ExecutionModelBuilder::new(spec, Time::default(), 0, 99);
//! let root = builder.root();
//! builder.add_phase(root, task, "1", 0, 49);
//! builder.add_phase(root, task, "2", 50, 99);
//! let model = builder.build()?;
//!
//! assert_eq!(model.phases().count(), 3);
//! assert!(model.resolve_phase("/task[id=2]").is_some());
//! # Ok(())
//! # }
//! ```

use crate::error::{AnalysisError, Result};
use crate::time::{Period, Time, TimesliceCount, TimesliceId, Timeslices};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

/// Dense index of a phase type in an [`ExecutionModelSpecification`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhaseTypeId(u32);

impl PhaseTypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense pre-order index of a phase in an [`ExecutionModel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhaseId(u32);

impl PhaseId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a phase type occurs once per parent or as many keyed instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Repeatability {
    Single,
    Repeatable {
        /// Key shown in phase names, as in `task[id=3]`
        instance_key: String,
        /// Instances are expected to do equivalent work
        interchangeable: bool,
    },
}

impl Repeatability {
    pub fn repeatable(instance_key: impl Into<String>, interchangeable: bool) -> Self {
        Self::Repeatable {
            instance_key: instance_key.into(),
            interchangeable,
        }
    }

    pub fn is_repeatable(&self) -> bool {
        matches!(self, Self::Repeatable { .. })
    }

    pub fn is_interchangeable(&self) -> bool {
        matches!(
            self,
            Self::Repeatable {
                interchangeable: true,
                ..
            }
        )
    }
}

/// Schema node describing one kind of phase
#[derive(Debug, Clone)]
pub struct PhaseType {
    pub name: String,
    pub parent: Option<PhaseTypeId>,
    pub repeatability: Repeatability,
    pub subtypes: Vec<PhaseTypeId>,
    pub path: String,
}

/// Tree of phase types rooted at an unnamed root type
#[derive(Debug, Clone)]
pub struct ExecutionModelSpecification {
    types: Vec<PhaseType>,
}

impl Default for ExecutionModelSpecification {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionModelSpecification {
    pub fn new() -> Self {
        Self {
            types: vec![PhaseType {
                name: String::new(),
                parent: None,
                repeatability: Repeatability::Single,
                subtypes: Vec::new(),
                path: "/".to_string(),
            }],
        }
    }

    pub fn root(&self) -> PhaseTypeId {
        PhaseTypeId(0)
    }

    pub fn phase_type(&self, id: PhaseTypeId) -> &PhaseType {
        &self.types[id.index()]
    }

    pub fn phase_types(&self) -> impl Iterator<Item = (PhaseTypeId, &PhaseType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (PhaseTypeId(i as u32), t))
    }

    /// Register a subtype of `parent`
    ///
    /// # Errors
    ///
    /// Fails for empty names, names containing `/`, `[`, `]` or `=`, and
    /// duplicate names under the same parent.
    pub fn add_phase_type(
        &mut self,
        parent: PhaseTypeId,
        name: &str,
        repeatability: Repeatability,
    ) -> Result<PhaseTypeId> {
        if name.is_empty() || name.contains(['/', '[', ']', '=']) {
            return Err(AnalysisError::InvalidModel(format!(
                "invalid phase type name \"{name}\""
            )));
        }
        if self.subtype(parent, name).is_some() {
            return Err(AnalysisError::InvalidModel(format!(
                "phase type \"{name}\" already exists under \"{}\"",
                self.phase_type(parent).path
            )));
        }

        let id = PhaseTypeId(self.types.len() as u32);
        let parent_path = &self.phase_type(parent).path;
        let path = if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        };
        self.types.push(PhaseType {
            name: name.to_string(),
            parent: Some(parent),
            repeatability,
            subtypes: Vec::new(),
            path,
        });
        self.types[parent.index()].subtypes.push(id);
        Ok(id)
    }

    /// Name of a non-root phase: `name` or `name[key=instance]`
    pub fn phase_name(&self, type_id: PhaseTypeId, instance_id: &str) -> String {
        let phase_type = self.phase_type(type_id);
        match &phase_type.repeatability {
            Repeatability::Single => phase_type.name.clone(),
            Repeatability::Repeatable { instance_key, .. } => {
                format!("{}[{}={}]", phase_type.name, instance_key, instance_id)
            }
        }
    }

    pub fn subtype(&self, parent: PhaseTypeId, name: &str) -> Option<PhaseTypeId> {
        self.phase_type(parent)
            .subtypes
            .iter()
            .copied()
            .find(|&t| self.phase_type(t).name == name)
    }

    /// Look up a phase type by its `/`-separated path
    pub fn resolve(&self, path: &str) -> Option<PhaseTypeId> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self.root(), |current, component| {
                self.subtype(current, component)
            })
    }

    /// True if `ancestor` is `descendant` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: PhaseTypeId, descendant: PhaseTypeId) -> bool {
        let mut current = Some(descendant);
        while let Some(t) = current {
            if t == ancestor {
                return true;
            }
            current = self.phase_type(t).parent;
        }
        false
    }
}

/// Analysis metadata attached to a phase after construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseAnnotation {
    pub key: String,
    pub value: serde_json::Value,
}

impl PhaseAnnotation {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// One node of the phase tree
#[derive(Debug, Clone)]
pub struct Phase {
    pub id: PhaseId,
    pub type_id: PhaseTypeId,
    pub parent: Option<PhaseId>,
    /// `type` or `type[key=instance]`; empty for the root
    pub name: String,
    pub instance_id: String,
    pub first_timeslice: TimesliceId,
    pub last_timeslice: TimesliceId,
    pub dependencies: Vec<PhaseId>,
    pub subphases: Vec<PhaseId>,
    pub subtree_size: usize,
    pub path: String,
    annotations: Vec<PhaseAnnotation>,
}

impl Phase {
    pub fn is_leaf(&self) -> bool {
        self.subphases.is_empty()
    }

    pub fn is_composite(&self) -> bool {
        !self.subphases.is_empty()
    }

    pub fn timeslice_range(&self) -> Period<Timeslices> {
        Period::new(self.first_timeslice, self.last_timeslice)
    }

    /// Number of timeslices covered; zero for phases shorter than one slice
    pub fn duration(&self) -> TimesliceCount {
        self.last_timeslice - self.first_timeslice + 1
    }

    pub fn annotations(&self) -> &[PhaseAnnotation] {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&serde_json::Value> {
        self.annotations
            .iter()
            .rev()
            .find(|a| a.key == key)
            .map(|a| &a.value)
    }

    /// Dense ids of this phase and all of its descendants
    pub fn subtree(&self) -> Range<usize> {
        self.id.index()..self.id.index() + self.subtree_size
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase(\"{}\")", self.path)
    }
}

/// Phase tree of a single job
#[derive(Debug, Clone)]
pub struct ExecutionModel {
    specification: ExecutionModelSpecification,
    phases: Vec<Phase>,
    time: Time,
}

impl ExecutionModel {
    pub fn specification(&self) -> &ExecutionModelSpecification {
        &self.specification
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn root(&self) -> PhaseId {
        PhaseId(0)
    }

    pub fn phase(&self, id: PhaseId) -> &Phase {
        &self.phases[id.index()]
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// All phases in pre-order
    pub fn phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter()
    }

    pub fn leaf_phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter().filter(|p| p.is_leaf())
    }

    /// Descendants of `id` (excluding itself) in pre-order
    pub fn descendants(&self, id: PhaseId) -> impl Iterator<Item = &Phase> {
        let range = self.phase(id).subtree();
        self.phases[range.start + 1..range.end].iter()
    }

    pub fn is_ancestor_or_self(&self, ancestor: PhaseId, descendant: PhaseId) -> bool {
        self.phase(ancestor).subtree().contains(&descendant.index())
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself
    pub fn ancestors(&self, id: PhaseId) -> impl Iterator<Item = PhaseId> + '_ {
        std::iter::successors(self.phase(id).parent, move |&p| self.phase(p).parent)
    }

    /// Look up a phase by path such as `/stage[id=1]/task[id=4]`
    ///
    /// Components of repeatable phases may omit the key: `/stage[1]/task[4]`.
    pub fn resolve_phase(&self, path: &str) -> Option<PhaseId> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self.root(), |current, component| {
                self.phase(current).subphases.iter().copied().find(|&child| {
                    let phase = self.phase(child);
                    phase.name == component || self.short_name(phase) == component
                })
            })
    }

    fn short_name(&self, phase: &Phase) -> String {
        let phase_type = self.specification.phase_type(phase.type_id);
        if phase_type.repeatability.is_repeatable() {
            format!("{}[{}]", phase_type.name, phase.instance_id)
        } else {
            phase_type.name.clone()
        }
    }

    /// All phases of `phase_type` within the subtree of `phase`
    ///
    /// # Errors
    ///
    /// Fails when `phase_type` is not a descendant of the type of `phase`.
    pub fn find_phases_for_type(
        &self,
        phase: PhaseId,
        phase_type: PhaseTypeId,
    ) -> Result<Vec<PhaseId>> {
        let own_type = self.phase(phase).type_id;
        if !self.specification.is_ancestor_or_self(own_type, phase_type) {
            return Err(AnalysisError::Configuration(format!(
                "phase type \"{}\" is not a descendant of \"{}\"",
                self.specification.phase_type(phase_type).path,
                self.specification.phase_type(own_type).path
            )));
        }
        Ok(self
            .phase(phase)
            .subtree()
            .map(PhaseId::from_index)
            .filter(|&p| self.phase(p).type_id == phase_type)
            .collect())
    }

    pub fn annotate(&mut self, id: PhaseId, annotation: PhaseAnnotation) {
        self.phases[id.index()].annotations.push(annotation);
    }
}

/// Handle to a phase recorded in an [`ExecutionModelBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseHandle(usize);

#[derive(Debug)]
struct PendingPhase {
    type_id: PhaseTypeId,
    parent: Option<PhaseHandle>,
    instance_id: String,
    first_timeslice: TimesliceId,
    last_timeslice: TimesliceId,
    dependencies: Vec<PhaseHandle>,
    annotations: Vec<PhaseAnnotation>,
    children: Vec<PhaseHandle>,
}

/// Two-phase builder for [`ExecutionModel`]
#[derive(Debug)]
pub struct ExecutionModelBuilder {
    specification: ExecutionModelSpecification,
    time: Time,
    pending: Vec<PendingPhase>,
}

impl ExecutionModelBuilder {
    /// Start a model whose root spans `[first_timeslice, last_timeslice]`
    pub fn new(
        specification: ExecutionModelSpecification,
        time: Time,
        first_timeslice: TimesliceId,
        last_timeslice: TimesliceId,
    ) -> Self {
        let root_type = specification.root();
        Self {
            specification,
            time,
            pending: vec![PendingPhase {
                type_id: root_type,
                parent: None,
                instance_id: String::new(),
                first_timeslice,
                last_timeslice,
                dependencies: Vec::new(),
                annotations: Vec::new(),
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> PhaseHandle {
        PhaseHandle(0)
    }

    pub fn specification(&self) -> &ExecutionModelSpecification {
        &self.specification
    }

    pub fn add_phase(
        &mut self,
        parent: PhaseHandle,
        type_id: PhaseTypeId,
        instance_id: impl Into<String>,
        first_timeslice: TimesliceId,
        last_timeslice: TimesliceId,
    ) -> PhaseHandle {
        let handle = PhaseHandle(self.pending.len());
        self.pending.push(PendingPhase {
            type_id,
            parent: Some(parent),
            instance_id: instance_id.into(),
            first_timeslice,
            last_timeslice,
            dependencies: Vec::new(),
            annotations: Vec::new(),
            children: Vec::new(),
        });
        self.pending[parent.0].children.push(handle);
        handle
    }

    /// Record that `phase` may only start after `dependency` has ended
    pub fn add_dependency(&mut self, phase: PhaseHandle, dependency: PhaseHandle) {
        self.pending[phase.0].dependencies.push(dependency);
    }

    pub fn annotate(&mut self, phase: PhaseHandle, annotation: PhaseAnnotation) {
        self.pending[phase.0].annotations.push(annotation);
    }

    fn derive_name(&self, pending: &PendingPhase) -> String {
        if pending.parent.is_none() {
            return String::new();
        }
        self.specification
            .phase_name(pending.type_id, &pending.instance_id)
    }

    fn validate(&self, names: &[String]) -> Result<()> {
        for (index, pending) in self.pending.iter().enumerate() {
            let describe = || format!("phase \"{}\" (#{index})", names[index]);
            let phase_type = self.specification.phase_type(pending.type_id);

            match pending.parent {
                None if phase_type.parent.is_some() => {
                    return Err(AnalysisError::InvalidModel(format!(
                        "the root phase must have the root phase type, got \"{}\"",
                        phase_type.path
                    )));
                }
                Some(parent) if phase_type.parent != Some(self.pending[parent.0].type_id) => {
                    return Err(AnalysisError::InvalidModel(format!(
                        "{}: type \"{}\" is not a subtype of its parent's type",
                        describe(),
                        phase_type.path
                    )));
                }
                _ => {}
            }

            if phase_type.repeatability.is_repeatable() {
                if !is_valid_instance_id(&pending.instance_id) {
                    return Err(AnalysisError::InvalidModel(format!(
                        "{}: invalid instance id \"{}\"",
                        describe(),
                        pending.instance_id
                    )));
                }
            } else if !pending.instance_id.is_empty() {
                return Err(AnalysisError::InvalidModel(format!(
                    "{}: instance id given for non-repeatable type \"{}\"",
                    describe(),
                    phase_type.path
                )));
            }

            if pending.last_timeslice < pending.first_timeslice - 1 {
                return Err(AnalysisError::InvalidModel(format!(
                    "{}: negative duration ({} to {})",
                    describe(),
                    pending.first_timeslice,
                    pending.last_timeslice
                )));
            }

            let mut seen = HashSet::new();
            for child in &pending.children {
                if !seen.insert(names[child.0].as_str()) {
                    return Err(AnalysisError::InvalidModel(format!(
                        "{}: duplicate subphase \"{}\"",
                        describe(),
                        names[child.0]
                    )));
                }
            }

            if pending.dependencies.iter().any(|d| d.0 == index) {
                return Err(AnalysisError::InvalidModel(format!(
                    "{}: a phase cannot depend on itself",
                    describe()
                )));
            }
        }
        Ok(())
    }

    /// Validate the recorded tree and freeze it into an [`ExecutionModel`]
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidModel`] on type/parent mismatch, invalid
    /// instance ids, negative durations, or duplicate subphase names.
    pub fn build(self) -> Result<ExecutionModel> {
        let names: Vec<String> = self.pending.iter().map(|p| self.derive_name(p)).collect();
        self.validate(&names)?;

        // Pre-order traversal with children sorted by (first, last, name)
        let mut order = Vec::with_capacity(self.pending.len());
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            order.push(index);
            let mut children: Vec<usize> =
                self.pending[index].children.iter().map(|c| c.0).collect();
            children.sort_by(|&a, &b| {
                let (pa, pb) = (&self.pending[a], &self.pending[b]);
                (pa.first_timeslice, pa.last_timeslice, &names[a]).cmp(&(
                    pb.first_timeslice,
                    pb.last_timeslice,
                    &names[b],
                ))
            });
            stack.extend(children.into_iter().rev());
        }

        let mut id_of = vec![PhaseId(0); self.pending.len()];
        for (dense, &index) in order.iter().enumerate() {
            id_of[index] = PhaseId::from_index(dense);
        }

        let ExecutionModelBuilder {
            specification,
            time,
            pending,
        } = self;
        let mut phases: Vec<Phase> = Vec::with_capacity(pending.len());
        let mut pending: Vec<Option<PendingPhase>> = pending.into_iter().map(Some).collect();
        for &index in &order {
            let Some(node) = pending[index].take() else {
                continue;
            };
            let parent = node.parent.map(|p| id_of[p.0]);
            let name = names[index].clone();
            let path = match parent {
                None => "/".to_string(),
                Some(p) if p.index() == 0 => format!("/{name}"),
                Some(p) => format!("{}/{name}", phases[p.index()].path),
            };
            let mut subphases: Vec<PhaseId> = node.children.iter().map(|c| id_of[c.0]).collect();
            subphases.sort();
            phases.push(Phase {
                id: id_of[index],
                type_id: node.type_id,
                parent,
                name,
                instance_id: node.instance_id,
                first_timeslice: node.first_timeslice,
                last_timeslice: node.last_timeslice,
                dependencies: node.dependencies.iter().map(|d| id_of[d.0]).collect(),
                subphases,
                subtree_size: 1,
                path,
                annotations: node.annotations,
            });
        }

        for index in (1..phases.len()).rev() {
            if let Some(parent) = phases[index].parent {
                phases[parent.index()].subtree_size += phases[index].subtree_size;
            }
        }

        Ok(ExecutionModel {
            specification,
            phases,
            time,
        })
    }
}

/// Instance ids may not contain whitespace, `=`, `[`, `]` or `/`
pub fn is_valid_instance_id(instance_id: &str) -> bool {
    instance_id
        .chars()
        .all(|c| !c.is_whitespace() && !matches!(c, '=' | '[' | ']' | '/'))
}

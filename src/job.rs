//! JSON job descriptions
//!
//! A job file carries everything one analysis needs: the phase type schema,
//! the phase tree with nanosecond timestamps, the resource tree with its
//! observations, and the rules relating the two.
//!
//! ```json
//! {
//!   "phase_types": [
//!     { "path": "/stage", "instance_key": "id" },
//!     { "path": "/stage/task", "instance_key": "id", "interchangeable": true }
//!   ],
//!   "execution": {
//!     "start_ns": 0, "end_ns": 100000000,
//!     "phases": [
//!       { "type": "stage", "instance": "1", "start_ns": 0, "end_ns": 100000000,
//!         "phases": [
//!           { "type": "task", "instance": "a", "start_ns": 0, "end_ns": 100000000 }
//!         ] }
//!     ]
//!   },
//!   "resources": [
//!     { "name": "node", "metrics": [
//!         { "name": "cpu", "type": "cpu", "class": "consumable", "capacity": 4.0,
//!           "boundaries_ns": [0, 100000000], "values": [3.9] }
//!     ] }
//!   ],
//!   "rules": [
//!     { "phase_type": "/stage/task", "metric_type": "cpu", "consumable": { "variable": 1.0 } }
//!   ]
//! }
//! ```
//!
//! Dependencies are phase paths. A path starting with `/` is absolute; any
//! other path names a sibling of the depending phase.

use crate::attribution::{BlockingAttributionRule, ConsumableAttributionRule, RuleTable};
use crate::model::{
    ExecutionModel, ExecutionModelBuilder, ExecutionModelSpecification, MetricClass,
    PhaseAnnotation, PhaseHandle, PhaseToResourceMapping, PhaseTypeId, RateObservations,
    Repeatability, ResourceId, ResourceModel, ResourceModelBuilder,
};
use crate::simulation::{ConcurrencyConstraintRule, ConcurrencyLimit};
use crate::time::{Nanoseconds, Period, PeriodList, Time, TimestampNs};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescription {
    /// Phase types in parent-before-child order; the root type is implicit
    #[serde(default)]
    pub phase_types: Vec<PhaseTypeDescription>,
    pub execution: RootPhaseDescription,
    /// Children of the root resource
    #[serde(default)]
    pub resources: Vec<ResourceDescription>,
    /// Grants of resource subtrees to phase subtrees; empty grants everything
    #[serde(default)]
    pub mapping: Vec<MappingDescription>,
    #[serde(default)]
    pub rules: Vec<RuleDescription>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseTypeDescription {
    pub path: String,
    /// Makes the type repeatable, naming its instances `name[key=instance]`
    #[serde(default)]
    pub instance_key: Option<String>,
    #[serde(default)]
    pub interchangeable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootPhaseDescription {
    pub start_ns: TimestampNs,
    pub end_ns: TimestampNs,
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub phases: Vec<PhaseDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseDescription {
    /// Name of the phase type, a subtype of the parent's type
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub instance: String,
    pub start_ns: TimestampNs,
    pub end_ns: TimestampNs,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub phases: Vec<PhaseDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDescription {
    pub name: String,
    #[serde(default)]
    pub metrics: Vec<MetricDescription>,
    #[serde(default)]
    pub resources: Vec<ResourceDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(flatten)]
    pub kind: MetricKindDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "lowercase")]
pub enum MetricKindDescription {
    Consumable {
        capacity: f64,
        /// Period boundaries; period `i` runs from `boundaries_ns[i]` to `boundaries_ns[i + 1]`
        #[serde(default)]
        boundaries_ns: Vec<TimestampNs>,
        #[serde(default)]
        values: Vec<f64>,
    },
    Blocking {
        /// Inclusive `[start, end]` nanosecond ranges
        #[serde(default)]
        blocked_ns: Vec<[TimestampNs; 2]>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDescription {
    pub phase: String,
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDescription {
    pub phase_type: String,
    pub metric_type: String,
    #[serde(default)]
    pub consumable: Option<ConsumableRuleDescription>,
    #[serde(default)]
    pub blocking: Option<BlockingRuleDescription>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumableRuleDescription {
    Exact(f64),
    Variable(f64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingRuleDescription {
    Full,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintDescription {
    pub per_instance_type: String,
    pub constrained_type: String,
    pub limit: LimitDescription,
}

/// Either a fixed number or `{ "annotation": "key" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LimitDescription {
    Fixed(u64),
    Annotation { annotation: String },
}

/// In-memory inputs of one analysis
#[derive(Debug)]
pub struct LoadedJob {
    pub execution: ExecutionModel,
    pub resources: ResourceModel,
    pub rules: RuleTable,
    pub mapping: PhaseToResourceMapping,
    pub constraints: Vec<ConcurrencyConstraintRule>,
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/')?;
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

fn annotations(values: &BTreeMap<String, serde_json::Value>) -> Vec<PhaseAnnotation> {
    values
        .iter()
        .map(|(key, value)| PhaseAnnotation::new(key.clone(), value.clone()))
        .collect()
}

/// Walks the phase tree, recording handles by path and pending dependencies
struct PhaseTreeLoader<'a> {
    time: Time,
    builder: ExecutionModelBuilder,
    handles: HashMap<String, PhaseHandle>,
    dependencies: Vec<(PhaseHandle, String, &'a str)>,
}

impl<'a> PhaseTreeLoader<'a> {
    fn add_children(
        &mut self,
        parent: PhaseHandle,
        parent_type: PhaseTypeId,
        parent_path: &str,
        children: &'a [PhaseDescription],
    ) -> Result<()> {
        for child in children {
            let spec = self.builder.specification();
            let type_id = spec.subtype(parent_type, &child.type_name).with_context(|| {
                format!(
                    "Phase type \"{}\" is not a subtype of \"{}\"",
                    child.type_name,
                    spec.phase_type(parent_type).path
                )
            })?;
            let path = join_path(parent_path, &spec.phase_name(type_id, &child.instance));

            let handle = self.builder.add_phase(
                parent,
                type_id,
                child.instance.clone(),
                self.time.timeslice_for_start_timestamp(child.start_ns),
                self.time.timeslice_for_end_timestamp(child.end_ns),
            );
            for annotation in annotations(&child.annotations) {
                self.builder.annotate(handle, annotation);
            }
            for dependency in &child.depends_on {
                let target = if dependency.starts_with('/') {
                    dependency.clone()
                } else {
                    join_path(parent_path, dependency)
                };
                self.dependencies.push((handle, target, dependency.as_str()));
            }
            if self.handles.insert(path.clone(), handle).is_some() {
                anyhow::bail!("Duplicate phase \"{path}\"");
            }

            self.add_children(handle, type_id, &path, &child.phases)?;
        }
        Ok(())
    }
}

impl JobDescription {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse job description")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read job file: {}", path.as_ref().display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid job file: {}", path.as_ref().display()))
    }

    /// Build the models at granularity `time`
    ///
    /// # Errors
    /// Returns error for unknown types, paths or metric types, and for
    /// anything the model builders reject.
    pub fn load(&self, time: Time) -> Result<LoadedJob> {
        let specification = self.specification()?;
        let execution = self.execution_model(specification, time)?;
        let resources = self.resource_model(time)?;
        let rules = self.rule_table(&execution, &resources)?;
        let mapping = self.mapping(&execution, &resources)?;
        let constraints = self.constraint_rules(&execution)?;

        tracing::debug!(
            phases = execution.phase_count(),
            metrics = resources.metric_count(),
            constraints = constraints.len(),
            "Loaded job description"
        );

        Ok(LoadedJob {
            execution,
            resources,
            rules,
            mapping,
            constraints,
        })
    }

    fn specification(&self) -> Result<ExecutionModelSpecification> {
        let mut specification = ExecutionModelSpecification::new();
        for phase_type in &self.phase_types {
            let (parent, name) = parent_path(&phase_type.path)
                .with_context(|| format!("Invalid phase type path \"{}\"", phase_type.path))?;
            let parent_id = specification.resolve(parent).with_context(|| {
                format!(
                    "Parent of phase type \"{}\" must be declared before it",
                    phase_type.path
                )
            })?;
            let repeatability = match &phase_type.instance_key {
                Some(key) => Repeatability::repeatable(key.clone(), phase_type.interchangeable),
                None => Repeatability::Single,
            };
            specification.add_phase_type(parent_id, name, repeatability)?;
        }
        Ok(specification)
    }

    fn execution_model(
        &self,
        specification: ExecutionModelSpecification,
        time: Time,
    ) -> Result<ExecutionModel> {
        let root_type = specification.root();
        let root = &self.execution;
        let builder = ExecutionModelBuilder::new(
            specification,
            time,
            time.timeslice_for_start_timestamp(root.start_ns),
            time.timeslice_for_end_timestamp(root.end_ns),
        );
        let mut loader = PhaseTreeLoader {
            time,
            builder,
            handles: HashMap::new(),
            dependencies: Vec::new(),
        };
        let root_handle = loader.builder.root();
        for annotation in annotations(&root.annotations) {
            loader.builder.annotate(root_handle, annotation);
        }
        loader.handles.insert("/".to_string(), root_handle);
        loader.add_children(root_handle, root_type, "/", &root.phases)?;

        let PhaseTreeLoader {
            mut builder,
            handles,
            dependencies,
            ..
        } = loader;
        for (phase, target, written) in dependencies {
            let dependency = handles
                .get(&target)
                .with_context(|| format!("Unknown dependency \"{written}\""))?;
            builder.add_dependency(phase, *dependency);
        }

        Ok(builder.build()?)
    }

    fn resource_model(&self, time: Time) -> Result<ResourceModel> {
        fn add(
            builder: &mut ResourceModelBuilder,
            time: Time,
            parent: ResourceId,
            description: &ResourceDescription,
        ) -> Result<()> {
            let resource = builder.add_resource(parent, &description.name);
            for metric in &description.metrics {
                match &metric.kind {
                    MetricKindDescription::Consumable {
                        capacity,
                        boundaries_ns,
                        values,
                    } => {
                        let type_id = builder.metric_type(&metric.metric_type, MetricClass::Consumable)?;
                        let boundaries = boundaries_ns
                            .iter()
                            .map(|&b| time.timeslice_for_end_timestamp(b))
                            .collect();
                        let observations = RateObservations::new(boundaries, values.clone())
                            .with_context(|| {
                                format!("Invalid observations of metric \"{}\"", metric.name)
                            })?;
                        builder.add_consumable_metric(
                            resource,
                            &metric.name,
                            type_id,
                            *capacity,
                            observations,
                        );
                    }
                    MetricKindDescription::Blocking { blocked_ns } => {
                        let type_id = builder.metric_type(&metric.metric_type, MetricClass::Blocking)?;
                        let blocked = PeriodList::<Nanoseconds>::new(
                            blocked_ns.iter().map(|&[s, e]| Period::new(s, e)).collect(),
                        );
                        builder.add_blocking_metric(
                            resource,
                            &metric.name,
                            type_id,
                            blocked.to_timeslices(&time),
                        );
                    }
                }
            }
            for child in &description.resources {
                add(builder, time, resource, child)?;
            }
            Ok(())
        }

        let mut builder = ResourceModelBuilder::new(time);
        let root = builder.root();
        for resource in &self.resources {
            add(&mut builder, time, root, resource)?;
        }
        Ok(builder.build()?)
    }

    fn rule_table(&self, execution: &ExecutionModel, resources: &ResourceModel) -> Result<RuleTable> {
        let mut table = RuleTable::new();
        for rule in &self.rules {
            let phase_type = execution
                .specification()
                .resolve(&rule.phase_type)
                .with_context(|| format!("Unknown phase type \"{}\" in rule", rule.phase_type))?;
            let metric_type = resources
                .find_metric_type(&rule.metric_type)
                .with_context(|| format!("Unknown metric type \"{}\" in rule", rule.metric_type))?;

            if let Some(consumable) = rule.consumable {
                let rule = match consumable {
                    ConsumableRuleDescription::Exact(demand) => ConsumableAttributionRule::exact(demand)?,
                    ConsumableRuleDescription::Variable(demand) => {
                        ConsumableAttributionRule::variable(demand)?
                    }
                };
                table.set_consumable(phase_type, metric_type, rule);
            }
            if let Some(blocking) = rule.blocking {
                let rule = match blocking {
                    BlockingRuleDescription::Full => BlockingAttributionRule::Full,
                    BlockingRuleDescription::None => BlockingAttributionRule::None,
                };
                table.set_blocking(phase_type, metric_type, rule);
            }
        }
        Ok(table)
    }

    fn mapping(
        &self,
        execution: &ExecutionModel,
        resources: &ResourceModel,
    ) -> Result<PhaseToResourceMapping> {
        if self.mapping.is_empty() {
            return Ok(PhaseToResourceMapping::everything(execution, resources));
        }
        let mut mapping = PhaseToResourceMapping::new();
        for entry in &self.mapping {
            let phase = execution
                .resolve_phase(&entry.phase)
                .with_context(|| format!("Unknown phase \"{}\" in mapping", entry.phase))?;
            let resource = resources
                .resolve_resource(&entry.resource)
                .with_context(|| format!("Unknown resource \"{}\" in mapping", entry.resource))?;
            mapping.add(phase, resource);
        }
        Ok(mapping)
    }

    fn constraint_rules(&self, execution: &ExecutionModel) -> Result<Vec<ConcurrencyConstraintRule>> {
        let spec = execution.specification();
        let resolve = |path: &str| {
            spec.resolve(path)
                .with_context(|| format!("Unknown phase type \"{path}\" in constraint"))
        };
        self.constraints
            .iter()
            .map(|constraint| {
                Ok(ConcurrencyConstraintRule {
                    per_instance_type: resolve(&constraint.per_instance_type)?,
                    constrained_type: resolve(&constraint.constrained_type)?,
                    limit: match &constraint.limit {
                        LimitDescription::Fixed(limit) => ConcurrencyLimit::Fixed(*limit),
                        LimitDescription::Annotation { annotation } => {
                            ConcurrencyLimit::Annotation(annotation.clone())
                        }
                    },
                })
            })
            .collect()
    }
}

/// Read a job file and build its models
pub fn load_job<P: AsRef<Path>>(path: P, time: Time) -> Result<LoadedJob> {
    JobDescription::from_file(path.as_ref())?
        .load(time)
        .with_context(|| format!("Failed to load job: {}", path.as_ref().display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricKind;
    use serde_json::json;

    fn load(value: serde_json::Value) -> Result<LoadedJob> {
        JobDescription::from_json(&value.to_string())?.load(Time::new(10).unwrap())
    }

    fn two_stages() -> serde_json::Value {
        json!({
            "phase_types": [
                { "path": "/stage", "instance_key": "id" },
                { "path": "/stage/task", "instance_key": "id", "interchangeable": true }
            ],
            "execution": {
                "start_ns": 0, "end_ns": 200,
                "phases": [
                    { "type": "stage", "instance": "1", "start_ns": 0, "end_ns": 100,
                      "annotations": { "slots": 2 },
                      "phases": [
                          { "type": "task", "instance": "a", "start_ns": 0, "end_ns": 100 },
                          { "type": "task", "instance": "b", "start_ns": 0, "end_ns": 50 }
                      ] },
                    { "type": "stage", "instance": "2", "start_ns": 100, "end_ns": 200,
                      "depends_on": ["stage[id=1]"] }
                ]
            },
            "resources": [
                { "name": "node", "metrics": [
                    { "name": "cpu", "type": "cpu", "class": "consumable", "capacity": 4.0,
                      "boundaries_ns": [0, 100, 200], "values": [3.0, 1.0] },
                    { "name": "gc", "type": "gc", "class": "blocking",
                      "blocked_ns": [[20, 39]] }
                ] }
            ],
            "rules": [
                { "phase_type": "/stage/task", "metric_type": "cpu", "consumable": { "exact": 1.0 } },
                { "phase_type": "/stage/task", "metric_type": "gc", "blocking": "full" }
            ],
            "constraints": [
                { "per_instance_type": "/stage", "constrained_type": "/stage/task",
                  "limit": { "annotation": "slots" } },
                { "per_instance_type": "/", "constrained_type": "/stage", "limit": 1 }
            ]
        })
    }

    #[test]
    fn test_load_phase_tree() {
        let job = load(two_stages()).unwrap();
        let execution = &job.execution;
        assert_eq!(execution.phase_count(), 5);

        let stage1 = execution.resolve_phase("/stage[id=1]").unwrap();
        let stage2 = execution.resolve_phase("/stage[id=2]").unwrap();
        let task_b = execution.resolve_phase("/stage[id=1]/task[id=b]").unwrap();
        assert_eq!(execution.phase(stage2).dependencies, vec![stage1]);
        assert_eq!(execution.phase(stage1).annotation("slots"), Some(&json!(2)));

        let b = execution.phase(task_b);
        assert_eq!((b.first_timeslice, b.last_timeslice), (0, 4));
        assert_eq!(execution.phase(stage2).first_timeslice, 10);
    }

    #[test]
    fn test_load_resources() {
        let job = load(two_stages()).unwrap();
        let cpu = job.resources.resolve_metric("/node/cpu").unwrap();
        let gc = job.resources.resolve_metric("/node/gc").unwrap();

        match &job.resources.metric(cpu).kind {
            MetricKind::Consumable { capacity, .. } => assert_eq!(*capacity, 4.0),
            MetricKind::Blocking { .. } => panic!("cpu should be consumable"),
        }
        match &job.resources.metric(gc).kind {
            MetricKind::Blocking { blocked } => {
                assert_eq!(blocked.periods(), &[Period::new(2, 3)]);
            }
            MetricKind::Consumable { .. } => panic!("gc should be blocking"),
        }
    }

    #[test]
    fn test_load_rules_and_constraints() {
        let job = load(two_stages()).unwrap();
        assert_eq!(job.mapping.entries().len(), 1);
        assert_eq!(job.constraints.len(), 2);
        assert_eq!(
            job.constraints[0].limit,
            ConcurrencyLimit::Annotation("slots".to_string())
        );
        assert_eq!(job.constraints[1].limit, ConcurrencyLimit::Fixed(1));
    }

    #[test]
    fn test_absolute_dependency_paths() {
        let mut value = two_stages();
        value["execution"]["phases"][1]["depends_on"] = json!(["/stage[id=1]/task[id=a]"]);
        let job = load(value).unwrap();
        let stage2 = job.execution.resolve_phase("/stage[id=2]").unwrap();
        let task_a = job.execution.resolve_phase("/stage[id=1]/task[id=a]").unwrap();
        assert_eq!(job.execution.phase(stage2).dependencies, vec![task_a]);
    }

    #[test]
    fn test_unknown_dependency() {
        let mut value = two_stages();
        value["execution"]["phases"][1]["depends_on"] = json!(["stage[id=9]"]);
        let err = load(value).unwrap_err();
        assert!(err.to_string().contains("stage[id=9]"));
    }

    #[test]
    fn test_unknown_phase_type() {
        let mut value = two_stages();
        value["execution"]["phases"][0]["type"] = json!("task");
        assert!(load(value).is_err());
    }

    #[test]
    fn test_undeclared_parent_type() {
        let mut value = two_stages();
        value["phase_types"] = json!([{ "path": "/stage/task" }]);
        assert!(load(value).is_err());
    }

    #[test]
    fn test_metric_type_class_conflict() {
        let mut value = two_stages();
        value["resources"][0]["metrics"][1]["type"] = json!("cpu");
        assert!(load(value).is_err());
    }

    #[test]
    fn test_invalid_demand_is_rejected() {
        let mut value = two_stages();
        value["rules"][0]["consumable"] = json!({ "exact": -1.0 });
        assert!(load(value).is_err());
    }

    #[test]
    fn test_explicit_mapping() {
        let mut value = two_stages();
        value["mapping"] = json!([{ "phase": "/stage[id=1]", "resource": "/node" }]);
        let job = load(value).unwrap();
        let stage1 = job.execution.resolve_phase("/stage[id=1]").unwrap();
        assert_eq!(job.mapping.entries()[0].0, stage1);

        let mut value = two_stages();
        value["mapping"] = json!([{ "phase": "/", "resource": "/rack" }]);
        assert!(load(value).is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(JobDescription::from_json("{\"execution\": 3}").is_err());
        assert!(JobDescription::from_json("not json").is_err());
    }
}

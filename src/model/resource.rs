//! Resource model: a tree of resources carrying consumable and blocking metrics

use super::rate::RateObservations;
use crate::error::{AnalysisError, Result};
use crate::time::{PeriodList, Time, Timeslices};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Dense index of a resource node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(u32);

impl ResourceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense index of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricId(u32);

impl MetricId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Dense index of a metric type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricTypeId(u32);

impl MetricTypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricClass {
    Consumable,
    Blocking,
}

/// Kind of resource signal, e.g. `cpu` or `gc-pause`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricType {
    pub name: String,
    pub class: MetricClass,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    pub parent: Option<ResourceId>,
    pub children: Vec<ResourceId>,
    pub metrics: Vec<MetricId>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    /// Rate-limited resource with an upper bound on its usage rate
    Consumable {
        capacity: f64,
        observed_usage: RateObservations,
    },
    /// Resource that is either blocking or not in each timeslice
    Blocking { blocked: PeriodList<Timeslices> },
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub id: MetricId,
    pub name: String,
    pub resource: ResourceId,
    pub type_id: MetricTypeId,
    pub path: String,
    pub kind: MetricKind,
}

impl Metric {
    pub fn class(&self) -> MetricClass {
        match self.kind {
            MetricKind::Consumable { .. } => MetricClass::Consumable,
            MetricKind::Blocking { .. } => MetricClass::Blocking,
        }
    }

    /// Capacity of a consumable metric; `None` for blocking metrics
    pub fn capacity(&self) -> Option<f64> {
        match self.kind {
            MetricKind::Consumable { capacity, .. } => Some(capacity),
            MetricKind::Blocking { .. } => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Metric(\"{}\")", self.path)
    }
}

/// Resource tree and metrics of a single job
#[derive(Debug, Clone)]
pub struct ResourceModel {
    time: Time,
    metric_types: Vec<MetricType>,
    resources: Vec<Resource>,
    metrics: Vec<Metric>,
}

impl ResourceModel {
    pub fn time(&self) -> Time {
        self.time
    }

    pub fn root(&self) -> ResourceId {
        ResourceId(0)
    }

    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id.index()]
    }

    pub fn metric(&self, id: MetricId) -> &Metric {
        &self.metrics[id.index()]
    }

    pub fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    pub fn metric_type(&self, id: MetricTypeId) -> &MetricType {
        &self.metric_types[id.index()]
    }

    pub fn metric_types(&self) -> impl Iterator<Item = (MetricTypeId, &MetricType)> {
        self.metric_types
            .iter()
            .enumerate()
            .map(|(i, t)| (MetricTypeId(i as u32), t))
    }

    pub fn find_metric_type(&self, name: &str) -> Option<MetricTypeId> {
        self.metric_types
            .iter()
            .position(|t| t.name == name)
            .map(|i| MetricTypeId(i as u32))
    }

    /// Look up a resource by `/`-separated path
    pub fn resolve_resource(&self, path: &str) -> Option<ResourceId> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self.root(), |current, component| {
                self.resource(current)
                    .children
                    .iter()
                    .copied()
                    .find(|&c| self.resource(c).name == component)
            })
    }

    /// Look up a metric by path, e.g. `/machine[0]/cpu`
    pub fn resolve_metric(&self, path: &str) -> Option<MetricId> {
        let (resource_path, metric_name) = path.rsplit_once('/')?;
        let resource = self.resolve_resource(resource_path)?;
        self.resource(resource)
            .metrics
            .iter()
            .copied()
            .find(|&m| self.metric(m).name == metric_name)
    }

    /// All metrics attached to `resource` or any of its descendants
    pub fn metrics_in_subtree(&self, resource: ResourceId) -> Vec<MetricId> {
        let mut result = Vec::new();
        let mut stack = vec![resource];
        while let Some(current) = stack.pop() {
            let node = self.resource(current);
            result.extend(node.metrics.iter().copied());
            stack.extend(node.children.iter().copied());
        }
        result.sort();
        result
    }
}

/// Builder for [`ResourceModel`]; metrics are checked against their type on `build`
#[derive(Debug)]
pub struct ResourceModelBuilder {
    time: Time,
    metric_types: Vec<MetricType>,
    resources: Vec<Resource>,
    metrics: Vec<Metric>,
}

impl ResourceModelBuilder {
    pub fn new(time: Time) -> Self {
        Self {
            time,
            metric_types: Vec::new(),
            resources: vec![Resource {
                id: ResourceId(0),
                name: String::new(),
                parent: None,
                children: Vec::new(),
                metrics: Vec::new(),
                path: "/".to_string(),
            }],
            metrics: Vec::new(),
        }
    }

    pub fn root(&self) -> ResourceId {
        ResourceId(0)
    }

    /// Register a metric type, returning the existing id if `name` is known
    ///
    /// # Errors
    ///
    /// Fails if `name` is already registered with a different class.
    pub fn metric_type(&mut self, name: &str, class: MetricClass) -> Result<MetricTypeId> {
        if let Some(index) = self.metric_types.iter().position(|t| t.name == name) {
            if self.metric_types[index].class != class {
                return Err(AnalysisError::InvalidModel(format!(
                    "metric type \"{name}\" registered as both consumable and blocking"
                )));
            }
            return Ok(MetricTypeId(index as u32));
        }
        self.metric_types.push(MetricType {
            name: name.to_string(),
            class,
        });
        Ok(MetricTypeId(self.metric_types.len() as u32 - 1))
    }

    pub fn add_resource(&mut self, parent: ResourceId, name: &str) -> ResourceId {
        let id = ResourceId(self.resources.len() as u32);
        let parent_path = &self.resources[parent.index()].path;
        let path = join_path(parent_path, name);
        self.resources.push(Resource {
            id,
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            metrics: Vec::new(),
            path,
        });
        self.resources[parent.index()].children.push(id);
        id
    }

    pub fn add_consumable_metric(
        &mut self,
        resource: ResourceId,
        name: &str,
        type_id: MetricTypeId,
        capacity: f64,
        observed_usage: RateObservations,
    ) -> MetricId {
        self.add_metric(
            resource,
            name,
            type_id,
            MetricKind::Consumable {
                capacity,
                observed_usage,
            },
        )
    }

    pub fn add_blocking_metric(
        &mut self,
        resource: ResourceId,
        name: &str,
        type_id: MetricTypeId,
        blocked: PeriodList<Timeslices>,
    ) -> MetricId {
        self.add_metric(resource, name, type_id, MetricKind::Blocking { blocked })
    }

    fn add_metric(
        &mut self,
        resource: ResourceId,
        name: &str,
        type_id: MetricTypeId,
        kind: MetricKind,
    ) -> MetricId {
        let id = MetricId(self.metrics.len() as u32);
        let path = join_path(&self.resources[resource.index()].path, name);
        self.metrics.push(Metric {
            id,
            name: name.to_string(),
            resource,
            type_id,
            path,
            kind,
        });
        self.resources[resource.index()].metrics.push(id);
        id
    }

    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidModel`] for duplicate names, metrics whose
    /// class differs from their type's class, and non-positive capacities.
    pub fn build(self) -> Result<ResourceModel> {
        for resource in &self.resources {
            let mut seen = HashSet::new();
            let names = resource
                .children
                .iter()
                .map(|c| &self.resources[c.index()].name)
                .chain(resource.metrics.iter().map(|m| &self.metrics[m.index()].name));
            for name in names {
                if name.is_empty() || name.contains('/') {
                    return Err(AnalysisError::InvalidModel(format!(
                        "invalid resource or metric name \"{name}\" under \"{}\"",
                        resource.path
                    )));
                }
                if !seen.insert(name.as_str()) {
                    return Err(AnalysisError::InvalidModel(format!(
                        "duplicate resource or metric \"{name}\" under \"{}\"",
                        resource.path
                    )));
                }
            }
        }

        for metric in &self.metrics {
            let metric_type = &self.metric_types[metric.type_id.index()];
            if metric.class() != metric_type.class {
                return Err(AnalysisError::InvalidModel(format!(
                    "{metric} does not match the class of metric type \"{}\"",
                    metric_type.name
                )));
            }
            if let Some(capacity) = metric.capacity() {
                if !(capacity > 0.0 && capacity.is_finite()) {
                    return Err(AnalysisError::InvalidModel(format!(
                        "{metric} has invalid capacity {capacity}"
                    )));
                }
            }
        }

        Ok(ResourceModel {
            time: self.time,
            metric_types: self.metric_types,
            resources: self.resources,
            metrics: self.metrics,
        })
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

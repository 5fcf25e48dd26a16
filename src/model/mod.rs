//! In-memory models of a job: phases, resources and their mapping
//!
//! Both models carry the [`Time`](crate::time::Time) granularity they were
//! built with. Analysis stages refuse to combine models of different
//! granularity.

mod execution;
mod mapping;
mod rate;
mod resource;

pub use execution::{
    is_valid_instance_id, ExecutionModel, ExecutionModelBuilder, ExecutionModelSpecification,
    Phase, PhaseAnnotation, PhaseHandle, PhaseId, PhaseType, PhaseTypeId, Repeatability,
};
pub use mapping::PhaseToResourceMapping;
pub use rate::{ObservationPeriod, ObservationPeriods, RateObservations};
pub use resource::{
    Metric, MetricClass, MetricId, MetricKind, MetricType, MetricTypeId, Resource, ResourceId,
    ResourceModel, ResourceModelBuilder,
};

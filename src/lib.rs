//! phaselens - offline bottleneck analysis for hierarchical job traces
//!
//! A job is a tree of phases (stages, tasks, ...) observed alongside a tree
//! of resources (cpu, disk, gc pauses, ...). Analysis runs in three stages:
//!
//! 1. [`attribution`]: split each metric's observed usage over the phases
//!    that were active while it was sampled.
//! 2. [`bottleneck`]: decide, per phase and timeslice, which metrics limited
//!    its progress.
//! 3. [`perfissues`]: replay the phase tree in the [`simulation`] with
//!    bottlenecks or imbalance removed and estimate what each issue costs.
//!
//! [`pipeline::run`] chains the stages for a [`job`] description and
//! produces a [`report::AnalysisReport`].

pub mod attribution;
pub mod bottleneck;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod model;
pub mod perfissues;
pub mod pipeline;
pub mod report;
pub mod simulation;
pub mod time;

#[cfg(test)]
mod test_support;

pub use error::{AnalysisError, Result};

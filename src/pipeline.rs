//! End-to-end analysis of one job
//!
//! Stages run strictly in order: resource attribution, bottleneck
//! identification, performance issue identification. Each stage borrows the
//! results of the previous ones, so the whole run lives inside [`run`].

use crate::attribution::{ResourceAttribution, ResourceAttributionSettings};
use crate::bottleneck::{BottleneckIdentification, BottleneckIdentificationResult, BottleneckKey};
use crate::config::AnalysisConfig;
use crate::job::{load_job, LoadedJob};
use crate::model::{ExecutionModel, ResourceModel};
use crate::perfissues::{PerformanceIssueIdentification, PerformanceIssueIdentificationResult};
use crate::report::{AnalysisReport, BottleneckTime, IssueReport, PhaseBottleneckReport};
use anyhow::{Context, Result};
use std::path::Path;

/// Options that shape the report rather than the analysis
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOptions {
    /// Keep only the `top` issues with the largest impact
    pub top: Option<usize>,
}

/// Run every analysis stage on a loaded job
///
/// # Errors
/// Returns error if the models disagree on granularity, a simulation
/// deadlocks, or a stage finds its input inconsistent.
pub fn run(
    job: &LoadedJob,
    config: &AnalysisConfig,
    cache_dir: &Path,
    options: ReportOptions,
) -> Result<AnalysisReport> {
    let execution = &job.execution;
    let resources = &job.resources;

    tracing::info!(
        phases = execution.phase_count(),
        metrics = resources.metric_count(),
        "Attributing resource usage"
    );
    let attribution_settings = ResourceAttributionSettings {
        mapping: job.mapping.clone(),
        rules: Box::new(job.rules.clone()),
        sampling: config.sampling.step(),
        cache: config.cache,
    };
    let attribution =
        ResourceAttribution::execute(execution, resources, &attribution_settings, cache_dir)
            .context("Resource attribution failed")?;

    tracing::info!("Identifying bottlenecks");
    let bottleneck_settings = config.bottleneck_settings(execution, resources);
    let bottlenecks = BottleneckIdentification::execute(&attribution, &bottleneck_settings);

    tracing::info!("Identifying performance issues");
    let issue_settings = config.issue_settings(job.constraints.clone());
    let issues =
        PerformanceIssueIdentification::execute(execution, resources, &issue_settings, &bottlenecks)
            .context("Performance issue identification failed")?;

    let report = build_report(execution, resources, &bottlenecks, &issues, options)?;
    tracing::info!(
        issues = report.issues.len(),
        simulated = report.simulated_duration,
        "Analysis complete"
    );
    Ok(report)
}

/// Load a job file at the configured granularity and analyze it
pub fn analyze_file(
    job_path: &Path,
    config: &AnalysisConfig,
    cache_dir: &Path,
    options: ReportOptions,
) -> Result<AnalysisReport> {
    let job = load_job(job_path, config.time()?)?;
    run(&job, config, cache_dir, options)
}

fn build_report(
    execution: &ExecutionModel,
    resources: &ResourceModel,
    bottlenecks: &BottleneckIdentificationResult<'_>,
    issues: &PerformanceIssueIdentificationResult,
    options: ReportOptions,
) -> Result<AnalysisReport> {
    let root = execution.root();

    let mut issue_reports = Vec::new();
    for pass in issues.passes() {
        for issue in issues.get(pass)? {
            if issue.estimated_impact() <= 0.0 {
                continue;
            }
            issue_reports.push(IssueReport {
                pass: pass.to_string(),
                phase: execution.phase(issue.phase()).path.clone(),
                description: issue.display(execution, resources),
                estimated_impact: issue.estimated_impact(),
                relative_real_impact: issue.relative_real_impact(),
                relative_simulated_impact: issue.relative_simulated_impact(),
                affected_metrics: issue
                    .affected_metrics()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|m| m.describe(resources))
                    .collect(),
                affected_metric_types: issue
                    .affected_metric_types()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| t.describe(resources))
                    .collect(),
            });
        }
    }
    // Stable sort keeps pass and bottom-up order among equal impacts
    issue_reports.sort_by(|a, b| b.estimated_impact.total_cmp(&a.estimated_impact));
    if let Some(top) = options.top {
        issue_reports.truncate(top);
    }

    let mut phases = Vec::new();
    for leaf in execution.leaf_phases() {
        let view = bottlenecks.metric_type_bottlenecks(leaf.id);
        let mut times = Vec::new();
        for metric_type in view.keys() {
            times.push(BottleneckTime {
                metric_type: metric_type.describe(resources),
                bottlenecked: view.time_bottlenecked_on(metric_type)?,
                uniquely_bottlenecked: view.time_uniquely_bottlenecked_on(metric_type)?,
            });
        }
        phases.push(PhaseBottleneckReport {
            phase: leaf.path.clone(),
            duration: leaf.duration(),
            not_bottlenecked: view.time_not_bottlenecked()?,
            bottlenecks: times,
        });
    }

    Ok(AnalysisReport {
        timeslice_ns: execution.time().nanoseconds_per_timeslice(),
        measured_duration: execution.phase(root).duration(),
        simulated_duration: issues.simulation().total_duration(),
        issues: issue_reports,
        phases,
    })
}

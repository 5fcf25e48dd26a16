//! Analysis report in JSON and text form
//!
//! The report is a plain data snapshot: phase and metric ids are replaced by
//! their paths so it stays meaningful without the models it came from.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// One performance issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueReport {
    /// Pass that reported the issue (e.g., "bottleneck-duration")
    pub pass: String,
    /// Path of the phase whose simulated duration the issue affects
    pub phase: String,
    pub description: String,
    /// Simulated timeslices saved by resolving the issue
    pub estimated_impact: f64,
    pub relative_real_impact: f64,
    pub relative_simulated_impact: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub affected_metrics: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub affected_metric_types: Vec<String>,
}

/// Time one leaf phase spent bottlenecked on one metric type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckTime {
    pub metric_type: String,
    pub bottlenecked: i64,
    pub uniquely_bottlenecked: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseBottleneckReport {
    pub phase: String,
    pub duration: i64,
    pub not_bottlenecked: i64,
    pub bottlenecks: Vec<BottleneckTime>,
}

/// Complete analysis output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub timeslice_ns: i64,
    /// Measured duration of the job in timeslices
    pub measured_duration: i64,
    /// Simulated duration of the job without unbottlenecked time
    pub simulated_duration: f64,
    /// Issues with a positive impact, largest first
    pub issues: Vec<IssueReport>,
    pub phases: Vec<PhaseBottleneckReport>,
}

fn percent(ratio: f64) -> f64 {
    ratio * 100.0
}

impl AnalysisReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable summary
    pub fn write_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "Job duration: {} timeslices measured, {:.2} simulated ({} ns per timeslice)",
            self.measured_duration, self.simulated_duration, self.timeslice_ns
        )?;
        writeln!(out)?;

        if self.issues.is_empty() {
            writeln!(out, "No performance issues found.")?;
        } else {
            writeln!(out, "=== Performance Issues ===")?;
            writeln!(out)?;
            writeln!(out, "    impact   % real    % sim  issue")?;
            writeln!(out, "---------- -------- --------  ----------------")?;
            for issue in &self.issues {
                writeln!(
                    out,
                    "{:>10.2} {:>7.1}% {:>7.1}%  {}",
                    issue.estimated_impact,
                    percent(issue.relative_real_impact),
                    percent(issue.relative_simulated_impact),
                    issue.description
                )?;
            }
        }

        if !self.phases.is_empty() {
            writeln!(out)?;
            writeln!(out, "=== Leaf Phase Bottlenecks ===")?;
            for phase in &self.phases {
                writeln!(out)?;
                writeln!(
                    out,
                    "{} ({} timeslices, {} not bottlenecked)",
                    phase.phase, phase.duration, phase.not_bottlenecked
                )?;
                for bottleneck in &phase.bottlenecks {
                    writeln!(
                        out,
                        "  {:<16} {:>8} bottlenecked {:>8} uniquely",
                        bottleneck.metric_type,
                        bottleneck.bottlenecked,
                        bottleneck.uniquely_bottlenecked
                    )?;
                }
            }
        }

        Ok(())
    }
}

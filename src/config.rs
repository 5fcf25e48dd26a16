//! Analysis configuration loaded from TOML
//!
//! Every field has a default, so an empty file (or no file at all) gives a
//! working setup. Names in the file refer to metric type names and phase type
//! paths of the analyzed job; entries naming types the job does not have are
//! skipped with a warning so one file can serve many jobs.

use crate::attribution::{CacheSetting, SamplingMode};
use crate::bottleneck::{
    BottleneckIdentificationSettings, DEFAULT_GLOBAL_THRESHOLD, DEFAULT_LOCAL_THRESHOLD,
};
use crate::model::{ExecutionModel, ResourceModel};
use crate::perfissues::{
    BottleneckDurationPass, PerformanceIssueIdentificationSettings, PhaseImbalancePass,
};
use crate::simulation::{simulator_factory, ConcurrencyConstraintRule};
use crate::time::{Time, DEFAULT_TIMESLICE_LENGTH_NS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Top-level analysis configuration
///
/// # Example
/// ```
/// use phaselens::config::AnalysisConfig;
///
/// let config: AnalysisConfig = toml::from_str(
///     r#"
///     timeslice_ns = 5000000
///     sampling = "phase-aware"
///
///     [bottlenecks]
///     local_threshold = 0.9
///     "#,
/// )?;
/// assert_eq!(config.timeslice_ns, 5_000_000);
/// assert!(config.validate().is_ok());
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Length of one timeslice in nanoseconds
    pub timeslice_ns: i64,
    pub cache: CacheSetting,
    pub sampling: SamplingMode,
    pub bottlenecks: BottleneckConfig,
    pub issues: IssueConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeslice_ns: DEFAULT_TIMESLICE_LENGTH_NS,
            cache: CacheSetting::default(),
            sampling: SamplingMode::default(),
            bottlenecks: BottleneckConfig::default(),
            issues: IssueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BottleneckConfig {
    pub local_threshold: f64,
    pub global_threshold: f64,
    /// Threshold overrides keyed by metric type name
    pub metric_types: BTreeMap<String, ThresholdOverride>,
    /// Local threshold overrides for one phase type on one metric type
    pub phase_types: Vec<PhaseTypeThreshold>,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            global_threshold: DEFAULT_GLOBAL_THRESHOLD,
            metric_types: BTreeMap::new(),
            phase_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdOverride {
    pub local: Option<f64>,
    pub global: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseTypeThreshold {
    /// Phase type path, e.g. `/stage/task`
    pub phase_type: String,
    pub metric_type: String,
    pub local: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IssueConfig {
    /// Also report issues for individual metrics, not only metric types
    pub include_metric_bottlenecks: bool,
    /// How far imbalance scenarios are carried up the phase tree
    pub imbalance_max_depth: usize,
}

impl Default for IssueConfig {
    fn default() -> Self {
        Self {
            include_metric_bottlenecks: false,
            imbalance_max_depth: PhaseImbalancePass::default().max_depth,
        }
    }
}

fn check_factor(name: &str, factor: f64) -> Result<()> {
    if factor > 0.0 && factor.is_finite() {
        Ok(())
    } else {
        anyhow::bail!("{name} must be positive and finite, got {factor}")
    }
}

impl AnalysisConfig {
    /// Load and validate a configuration file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, is not valid TOML, contains
    /// unknown keys, or fails [`AnalysisConfig::validate`].
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no analysis could run with
    pub fn validate(&self) -> Result<()> {
        if self.timeslice_ns <= 0 {
            anyhow::bail!("timeslice_ns must be positive, got {}", self.timeslice_ns);
        }

        let thresholds = &self.bottlenecks;
        check_factor("bottlenecks.local_threshold", thresholds.local_threshold)?;
        check_factor("bottlenecks.global_threshold", thresholds.global_threshold)?;
        for (metric_type, factors) in &thresholds.metric_types {
            if let Some(local) = factors.local {
                check_factor(&format!("bottlenecks.metric_types.{metric_type}.local"), local)?;
            }
            if let Some(global) = factors.global {
                check_factor(&format!("bottlenecks.metric_types.{metric_type}.global"), global)?;
            }
        }
        for entry in &thresholds.phase_types {
            check_factor(
                &format!(
                    "local threshold of \"{}\" on \"{}\"",
                    entry.phase_type, entry.metric_type
                ),
                entry.local,
            )?;
        }

        Ok(())
    }

    pub fn time(&self) -> Result<Time> {
        Ok(Time::new(self.timeslice_ns)?)
    }

    /// Resolve the threshold settings against the types of one job
    pub fn bottleneck_settings(
        &self,
        execution: &ExecutionModel,
        resources: &ResourceModel,
    ) -> BottleneckIdentificationSettings {
        let config = &self.bottlenecks;
        let mut settings = BottleneckIdentificationSettings {
            local_threshold: config.local_threshold,
            global_threshold: config.global_threshold,
            ..BottleneckIdentificationSettings::default()
        };

        for (name, factors) in &config.metric_types {
            let Some(metric_type) = resources.find_metric_type(name) else {
                tracing::warn!(metric_type = %name, "Ignoring threshold for unknown metric type");
                continue;
            };
            if let Some(local) = factors.local {
                settings.metric_type_local.insert(metric_type, local);
            }
            if let Some(global) = factors.global {
                settings.metric_type_global.insert(metric_type, global);
            }
        }

        for entry in &config.phase_types {
            let phase_type = execution.specification().resolve(&entry.phase_type);
            let metric_type = resources.find_metric_type(&entry.metric_type);
            match (phase_type, metric_type) {
                (Some(phase_type), Some(metric_type)) => {
                    settings
                        .phase_type_local
                        .insert((phase_type, metric_type), entry.local);
                }
                _ => tracing::warn!(
                    phase_type = %entry.phase_type,
                    metric_type = %entry.metric_type,
                    "Ignoring threshold for unknown phase or metric type"
                ),
            }
        }

        settings
    }

    /// Both built-in passes, simulated under `constraints`
    pub fn issue_settings(
        &self,
        constraints: Vec<ConcurrencyConstraintRule>,
    ) -> PerformanceIssueIdentificationSettings {
        PerformanceIssueIdentificationSettings {
            passes: vec![
                Box::new(BottleneckDurationPass {
                    include_metric_bottlenecks: self.issues.include_metric_bottlenecks,
                }),
                Box::new(PhaseImbalancePass {
                    max_depth: self.issues.imbalance_max_depth,
                }),
            ],
            simulator: simulator_factory(constraints),
        }
    }
}

//! On-disk cache of resource attribution results
//!
//! # Format
//!
//! ```text
//! gzip(
//!     varint(schema version)          LEB128, unsigned
//!     msgpack(cache body)             positional struct encoding
//! )
//! ```
//!
//! The body records the phase paths and timeslice ranges and the metric
//! paths it was computed for, plus an FNV-1a digest of everything else the
//! attribution reads: the leaf to metric mapping, the rule of every mapped
//! pair, and each metric's capacity, observations and blocked periods. A
//! cache is a miss when any of them differ from the models being analysed,
//! when its schema version differs, or when it cannot be read.

use super::active::ActivePhaseDetectionResult;
use super::attribute::LeafAttribution;
use super::demand::ResourceDemandEstimationResult;
use super::mapping::PhaseMetricMappingCache;
use super::rules::{
    BlockingAttributionRule, ConsumableAttributionRule, ResourceAttributionRuleProvider,
};
use super::sampling::ResourceSamplingResult;
use crate::error::{AnalysisError, Result};
use crate::model::{ExecutionModel, MetricKind, PhaseId, ResourceModel};
use crate::time::{Time, TimesliceId};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::hash::Hasher;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const CACHE_FILENAME: &str = "resource-attribution.bin.gz";

/// Bumped whenever the cache body layout changes
pub const CACHE_SCHEMA_VERSION: u64 = 3;

#[derive(Serialize)]
pub(crate) struct CacheBodyRef<'a> {
    pub(crate) time: Time,
    pub(crate) sampling_step: &'a str,
    pub(crate) phase_paths: Vec<&'a str>,
    pub(crate) phase_ranges: Vec<(TimesliceId, TimesliceId)>,
    pub(crate) metric_paths: Vec<&'a str>,
    pub(crate) inputs_digest: u64,
    pub(crate) active: &'a ActivePhaseDetectionResult,
    pub(crate) demand: &'a ResourceDemandEstimationResult,
    pub(crate) sampling: &'a ResourceSamplingResult,
    pub(crate) leaves: &'a BTreeMap<PhaseId, LeafAttribution>,
}

#[derive(Deserialize)]
pub(crate) struct CacheBody {
    pub(crate) time: Time,
    pub(crate) sampling_step: String,
    pub(crate) phase_paths: Vec<String>,
    pub(crate) phase_ranges: Vec<(TimesliceId, TimesliceId)>,
    pub(crate) metric_paths: Vec<String>,
    pub(crate) inputs_digest: u64,
    pub(crate) active: ActivePhaseDetectionResult,
    pub(crate) demand: ResourceDemandEstimationResult,
    pub(crate) sampling: ResourceSamplingResult,
    pub(crate) leaves: BTreeMap<PhaseId, LeafAttribution>,
}

pub(crate) fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> std::io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return writer.write_all(&[byte]);
        }
        writer.write_all(&[byte | 0x80])?;
    }
}

pub(crate) fn read_varint<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "varint longer than 64 bits",
    ))
}

pub(crate) fn phase_paths(execution: &ExecutionModel) -> Vec<&str> {
    execution.phases().map(|p| p.path.as_str()).collect()
}

pub(crate) fn phase_ranges(execution: &ExecutionModel) -> Vec<(TimesliceId, TimesliceId)> {
    execution
        .phases()
        .map(|p| (p.first_timeslice, p.last_timeslice))
        .collect()
}

pub(crate) fn metric_paths(resources: &ResourceModel) -> Vec<&str> {
    resources.metrics().map(|m| m.path.as_str()).collect()
}

/// Digest of the mapping, rules and metric data the attribution depends on
pub(crate) fn inputs_digest(
    execution: &ExecutionModel,
    resources: &ResourceModel,
    mapping: &PhaseMetricMappingCache,
    rules: &dyn ResourceAttributionRuleProvider,
) -> u64 {
    let mut hasher = fnv::FnvHasher::default();

    for &leaf in mapping.leaf_phases() {
        let phase_type = execution.phase(leaf).type_id;
        let metrics = mapping.metrics_for_leaf(leaf);
        hasher.write_usize(leaf.index());
        hasher.write_usize(metrics.len());
        for &metric in metrics {
            let metric_type = resources.metric(metric).type_id;
            hasher.write_usize(metric.index());
            match rules.consumable_rule(phase_type, metric_type) {
                ConsumableAttributionRule::Exact(demand) => {
                    hasher.write_u8(1);
                    hasher.write_u64(demand.to_bits());
                }
                ConsumableAttributionRule::Variable(demand) => {
                    hasher.write_u8(2);
                    hasher.write_u64(demand.to_bits());
                }
                ConsumableAttributionRule::None => hasher.write_u8(0),
            }
            hasher.write_u8(match rules.blocking_rule(phase_type, metric_type) {
                BlockingAttributionRule::Full => 1,
                BlockingAttributionRule::None => 0,
            });
        }
    }

    for metric in resources.metrics() {
        match &metric.kind {
            MetricKind::Consumable {
                capacity,
                observed_usage,
            } => {
                hasher.write_u8(1);
                hasher.write_u64(capacity.to_bits());
                hasher.write_usize(observed_usage.observation_count());
                for period in observed_usage.periods() {
                    hasher.write_i64(period.first_timeslice);
                    hasher.write_i64(period.last_timeslice);
                    hasher.write_u64(period.value.to_bits());
                }
            }
            MetricKind::Blocking { blocked } => {
                hasher.write_u8(2);
                hasher.write_usize(blocked.periods().len());
                for period in blocked.periods() {
                    hasher.write_i64(period.start);
                    hasher.write_i64(period.end);
                }
            }
        }
    }

    hasher.finish()
}

/// Write `body` to `<dir>/resource-attribution.bin.gz`, replacing any old cache
pub(crate) fn write(dir: &Path, body: &CacheBodyRef<'_>) -> Result<()> {
    let path = dir.join(CACHE_FILENAME);
    if path.exists() && !path.is_file() {
        return Err(AnalysisError::Cache(format!(
            "cache path \"{}\" exists but is not a file",
            path.display()
        )));
    }
    std::fs::create_dir_all(dir)?;

    let file = File::create(&path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    write_varint(&mut encoder, CACHE_SCHEMA_VERSION)?;
    rmp_serde::encode::write(&mut encoder, body)
        .map_err(|e| AnalysisError::Cache(format!("failed to encode cache: {e}")))?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Read a cache body; `Ok(None)` when the file is absent or from another version
pub(crate) fn read(dir: &Path) -> Result<Option<CacheBody>> {
    let path = dir.join(CACHE_FILENAME);
    if !path.is_file() {
        return Ok(None);
    }

    let mut decoder = GzDecoder::new(BufReader::new(File::open(&path)?));
    let version = read_varint(&mut decoder)?;
    if version != CACHE_SCHEMA_VERSION {
        tracing::warn!(
            found = version,
            expected = CACHE_SCHEMA_VERSION,
            "Resource attribution cache was created by another version, recomputing"
        );
        return Ok(None);
    }
    let body = rmp_serde::decode::from_read(&mut decoder)
        .map_err(|e| AnalysisError::Cache(format!("failed to decode cache: {e}")))?;
    Ok(Some(body))
}

/// True if `body` was computed for exactly these models, inputs and sampling step
pub(crate) fn matches(
    body: &CacheBody,
    execution: &ExecutionModel,
    resources: &ResourceModel,
    inputs_digest: u64,
    sampling_step: &str,
) -> bool {
    body.time == execution.time()
        && body.sampling_step == sampling_step
        && body.inputs_digest == inputs_digest
        && body.phase_paths.iter().map(String::as_str).eq(phase_paths(execution))
        && body.phase_ranges == phase_ranges(execution)
        && body.metric_paths.iter().map(String::as_str).eq(metric_paths(resources))
}

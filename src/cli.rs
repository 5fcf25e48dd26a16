//! CLI argument parsing for phaselens

use crate::attribution::{CacheSetting, SamplingMode};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for the analysis report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "phaselens")]
#[command(version)]
#[command(about = "Offline bottleneck analysis of hierarchical job traces", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attribute resources, identify bottlenecks and report performance issues
    Analyze(AnalyzeArgs),
}

#[derive(clap::Args, Debug)]
pub struct AnalyzeArgs {
    /// JSON job description
    #[arg(value_name = "JOB")]
    pub job: PathBuf,

    /// TOML analysis configuration
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding the resource attribution cache (default: the job's directory)
    #[arg(long = "cache-dir", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Override the cache setting of the configuration
    #[arg(long = "cache", value_enum, value_name = "MODE")]
    pub cache: Option<CacheSetting>,

    /// Override the sampling strategy of the configuration
    #[arg(long = "sampling", value_enum, value_name = "MODE")]
    pub sampling: Option<SamplingMode>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Only report the N issues with the largest impact
    #[arg(long = "top", value_name = "N")]
    pub top: Option<usize>,
}

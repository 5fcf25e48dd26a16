use anyhow::{Context, Result};
use clap::Parser;
use phaselens::cli::{AnalyzeArgs, Cli, Command, OutputFormat};
use phaselens::config::AnalysisConfig;
use phaselens::pipeline::{self, ReportOptions};
use std::io::Write;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; `--debug` raises the level to trace
fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn analyze(args: AnalyzeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => AnalysisConfig::from_toml(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(cache) = args.cache {
        config.cache = cache;
    }
    if let Some(sampling) = args.sampling {
        config.sampling = sampling;
    }

    let cache_dir = match &args.cache_dir {
        Some(dir) => dir.clone(),
        None => args
            .job
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf(),
    };

    let options = ReportOptions { top: args.top };
    let report = pipeline::analyze_file(&args.job, &config, &cache_dir, options)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match args.format {
        OutputFormat::Text => report.write_text(&mut out)?,
        OutputFormat::Json => {
            writeln!(out, "{}", report.to_json().context("Failed to serialize report")?)?
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    match args.command {
        Command::Analyze(analyze_args) => analyze(analyze_args),
    }
}

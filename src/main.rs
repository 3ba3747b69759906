//! avalanche: batch data pipeline orchestrator.
//!
//! Provisions the storage namespace, waits for streaming ingestion, runs the
//! filtered relational imports, aggregates raw records by action, and reports
//! on the health of every stage.

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use avalanche::aggregate::{map_lines, reduce_lines};
use avalanche::config::Config;
use avalanche::error::{
    AddressParseSnafu, AggregatingSnafu, ConfigSnafu, GeneratingSnafu, ImportingSnafu,
    MetricsSnafu, OutputSnafu, PipelineError, ProvisioningSnafu,
};
use avalanche::generator::{self, GeneratorConfig, LogGenerator};
use avalanche::pipeline::{Orchestrator, RunPolicy};
use avalanche::{metrics, signal};

/// Batch data pipeline orchestrator.
#[derive(Parser, Debug)]
#[command(name = "avalanche")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; built-in defaults when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage end to end, stopping at the first failure.
    Run {
        /// Validate configuration and print the plan without executing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check every artifact and service; exit code is the number of failures.
    Verify,
    /// Ensure the namespace tree exists with the configured permissions.
    Provision,
    /// Run the configured bulk imports.
    Import {
        /// Only run the named import (repeatable).
        #[arg(long = "name")]
        names: Vec<String>,
    },
    /// Run the aggregation job and print the ordered counts.
    Aggregate,
    /// Streaming mapper: records on stdin, `key<TAB>1` on stdout.
    Map,
    /// Streaming reducer: `key<TAB>count` on stdin, ordered totals on stdout.
    Reduce,
    /// Emit synthetic JSON log records on stdout.
    Generate {
        /// Records per second.
        #[arg(long, default_value_t = 5.0)]
        rate: f64,
        /// Seconds to run; 0 runs until interrupted.
        #[arg(long, default_value_t = 0.0)]
        duration: f64,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    // Initialize logging; stdout carries data for map/reduce/generate
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match args.command {
        Command::Map => return map(),
        Command::Reduce => return reduce(),
        Command::Generate { rate, duration } => return generate(rate, duration).await,
        _ => {}
    }

    info!("avalanche starting");

    let config = build_config(&args)?;

    // Initialize metrics if enabled
    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
    }

    let orchestrator = Orchestrator::from_config(config)?;
    let mut stdout = io::stdout().lock();

    match args.command {
        Command::Run { dry_run: true } => {
            info!("Dry run mode - configuration is valid");
            for line in orchestrator.plan() {
                writeln!(stdout, "{line}").context(OutputSnafu)?;
            }
        }
        Command::Run { dry_run: false } => {
            let run = orchestrator.run(RunPolicy::HaltOnFirstFailure).await;
            for outcome in run.outcomes() {
                writeln!(stdout, "{outcome}").context(OutputSnafu)?;
            }
            run.into_result()?;
            info!("Pipeline completed successfully");
        }
        Command::Verify => {
            let report = orchestrator.reporter().verify_all().await;
            write!(stdout, "{}", report.render()).context(OutputSnafu)?;
            stdout.flush().context(OutputSnafu)?;
            if report.failed() > 0 {
                std::process::exit(report.exit_code());
            }
        }
        Command::Provision => {
            let tree = orchestrator.provision().await.context(ProvisioningSnafu)?;
            for child in &tree.children {
                writeln!(stdout, "{:o}\t{}", child.mode, child.path).context(OutputSnafu)?;
            }
        }
        Command::Import { names } => {
            let specs = orchestrator.select_imports(&names)?;
            let results = orchestrator
                .import(&specs, RunPolicy::ContinueAndAggregate)
                .await;

            let mut first_error = None;
            for (spec, result) in specs.iter().zip(results) {
                match result {
                    Ok(imported) => writeln!(
                        stdout,
                        "[{:<4}] {}: {} row(s) in {} partition(s) at {}",
                        imported.status(),
                        imported.dataset,
                        imported.rows,
                        imported.partitions,
                        imported.target
                    )
                    .context(OutputSnafu)?,
                    Err(e) => {
                        writeln!(stdout, "[fail] {}: {e}", spec.name).context(OutputSnafu)?;
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e).context(ImportingSnafu);
            }
        }
        Command::Aggregate => {
            let report = orchestrator.aggregate().await.context(AggregatingSnafu)?;
            write!(stdout, "{}", report.result.to_tsv()).context(OutputSnafu)?;
            info!(
                records = report.input_records,
                skipped = report.skipped,
                partitions = report.partitions,
                "Aggregation finished"
            );
        }
        Command::Map | Command::Reduce | Command::Generate { .. } => {}
    }

    Ok(())
}

/// Load the configuration file, or the defaults when none is given.
fn build_config(args: &Args) -> Result<Config, PipelineError> {
    match &args.config {
        Some(path) => Config::from_file(path).context(ConfigSnafu),
        None => {
            let config = Config::default();
            config.validate().context(ConfigSnafu)?;
            Ok(config)
        }
    }
}

fn map() -> Result<(), PipelineError> {
    let stats = map_lines(io::stdin().lock(), io::stdout().lock()).context(OutputSnafu)?;
    debug!(emitted = stats.emitted, skipped = stats.skipped, "Map finished");
    Ok(())
}

fn reduce() -> Result<(), PipelineError> {
    let (result, skipped) =
        reduce_lines(io::stdin().lock(), io::stdout().lock()).context(OutputSnafu)?;
    debug!(keys = result.len(), total = result.total(), skipped, "Reduce finished");
    Ok(())
}

async fn generate(rate: f64, duration: f64) -> Result<(), PipelineError> {
    let config = GeneratorConfig::new(rate, duration).context(GeneratingSnafu)?;
    let shutdown = signal::shutdown_token();
    let mut generator = LogGenerator::new(rand::rng());
    generator::run(&mut generator, config, io::stdout(), shutdown)
        .await
        .context(GeneratingSnafu)?;
    Ok(())
}

//! Command line runner: `horda <definition.json> [--report-json PATH] [--seed N] [--verbose]`.
//!
//! Exits with 0 when the verdict is passed (or nothing was asserted), 1 when an
//! assertion failed and 2 when the run could not start.
use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, anyhow};
use clap::Parser;
use horda::{
    Reporter, RunReport, Simulation, Verdict,
    config::SimulationDefinition,
    protocol::ReqwestTransport,
    report::{JsonReporter, StdoutReporter},
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Runs the load-test simulation described by a JSON definition.
#[derive(Debug, Parser)]
#[command(name = "horda", version, about)]
struct Args {
    /// Simulation definition file
    definition: PathBuf,
    /// Also write the report as JSON to this file
    #[arg(long, value_name = "PATH")]
    report_json: Option<PathBuf>,
    /// Seed for every random choice of the run, overrides the definition
    #[arg(long, value_name = "N")]
    seed: Option<u64>,
    /// Log per-user transitions
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let simulation = match load(&args) {
        Ok(simulation) => simulation,
        Err(e) => {
            eprintln!("run could not start: {e:#}");
            return ExitCode::from(2);
        }
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling the run...");
            let _ = cancel_tx.send(true);
        }
    });

    let report = match simulation.run_until(cancel_rx).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("run could not start: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = publish(&args, &report).await {
        tracing::error!("Reporting failed: {e:#}");
    }

    match report.verdict {
        Verdict::Failed => ExitCode::FAILURE,
        Verdict::Passed | Verdict::NotEvaluated => ExitCode::SUCCESS,
    }
}

fn load(args: &Args) -> anyhow::Result<Simulation<ReqwestTransport>> {
    let mut definition = SimulationDefinition::from_path(&args.definition)
        .with_context(|| format!("cannot load `{}`", args.definition.display()))?;
    if let Some(seed) = args.seed {
        definition.seed = Some(seed);
    }
    Ok(definition.into_simulation(ReqwestTransport::new)?)
}

async fn publish(args: &Args, report: &RunReport) -> anyhow::Result<()> {
    StdoutReporter
        .report(report)
        .await
        .map_err(|e| anyhow!("{e}"))?;
    if let Some(path) = &args.report_json {
        JsonReporter {
            path: Some(path.clone()),
        }
        .report(report)
        .await
        .map_err(|e| anyhow!("cannot write `{}`: {e}", path.display()))?;
    }
    Ok(())
}

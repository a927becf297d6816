use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bkpipe::config::AppConfig;
use bkpipe::context::RunContext;
use bkpipe::core::{EngineSet, Epoch, Orchestrator, StdinPrompt, Tool, Toolbox, planner};
use bkpipe::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bkpipe")]
#[command(about = "Encrypted backup pipeline with multi-destination replication", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: /etc/bkpipe/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the archive and replicate it to every destination
    Run(RunArgs),
    /// Validate configuration, probe tools and print the destination plan
    Check(CheckArgs),
    /// Remove expired archive directories from local destinations
    Prune,
}

#[derive(Args, Serialize, Default)]
struct RunArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    non_interactive: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    abort_on_error: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    secure_delete: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    self_replicate: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retention_days: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    redundancy_percent: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    cloud_tasks: Option<usize>,

    /// One of xz, gzip, zstd, bzip2
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    compressor: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args)]
struct CheckArgs {
    /// Print the plan as JSON
    #[arg(long)]
    json: bool,

    /// Also print the effective configuration as TOML
    #[arg(long)]
    show_config: bool,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    epoch: String,
    destinations: &'a [bkpipe::core::Destination],
    missing_tools: Vec<&'a str>,
    errors: u64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let epoch = Epoch::now();

    let overrides = match &cli.command {
        Commands::Run(args) => Some(args),
        _ => None,
    };
    let mut config = match cli.command {
        // Pruning never reads the sources.
        Commands::Prune => AppConfig::load(cli.config.as_deref(), overrides)
            .and_then(|config| config.validate_destinations().map(|_| config)),
        _ => AppConfig::new(cli.config.as_deref(), overrides),
    }
    .context("Invalid configuration")?;
    if !matches!(cli.command, Commands::Run(_)) {
        // Inspection commands never block on a prompt or abort on a finding.
        config.non_interactive = true;
        config.abort_on_error = false;
    }

    // Only a real run leaves a log file behind.
    let log_dir = matches!(cli.command, Commands::Run(_)).then(|| config.log_dir.clone());
    let log_file = logging::init(LogConfig {
        json: cli.json_logs,
        verbose: cli.verbose || config.verbose,
        dir: log_dir,
        epoch,
    });
    if let Some(path) = &log_file {
        info!(log = %path.display(), "Logging to file");
    }

    let tools = Toolbox::probe(&config.tools, config.compressor);
    let ctx = RunContext::new(config, epoch, tools, Arc::new(StdinPrompt));
    let orchestrator = Orchestrator::new(ctx.clone(), EngineSet::default());

    match cli.command {
        Commands::Run(_) => {
            spawn_signal_listener(ctx.shutdown.clone());
            run_backup(&orchestrator).await
        }
        Commands::Check(args) => run_check(&orchestrator, &args).await,
        Commands::Prune => {
            let pruned = orchestrator.prune().await.context("Retention pass failed")?;
            println!("pruned {} archive directories", pruned);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_backup(orchestrator: &Orchestrator) -> Result<ExitCode> {
    match orchestrator.run().await {
        Ok(summary) => Ok(ExitCode::from(summary.exit_code())),
        Err(e) => {
            let code = e.exit_code();
            eprintln!("bkpipe: {:#}", anyhow::Error::from(e));
            Ok(ExitCode::from(code))
        }
    }
}

async fn run_check(orchestrator: &Orchestrator, args: &CheckArgs) -> Result<ExitCode> {
    let ctx = orchestrator.context();
    let plan = orchestrator.preflight().await.context("Preflight failed")?;

    let missing_tools: Vec<&str> = ctx
        .tools
        .missing()
        .into_iter()
        .map(|tool: Tool| ctx.tools.program(tool))
        .collect();

    if args.json {
        let report = CheckReport {
            epoch: ctx.epoch.to_string(),
            destinations: &plan,
            missing_tools,
            errors: ctx.ledger().count(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("sources:");
        for source in &ctx.config.sources {
            println!("  {}", source.display());
        }
        println!("destinations:");
        for destination in &plan {
            let required = planner::required_tools(destination.class());
            let programs: Vec<&str> = required.iter().map(|t| ctx.tools.program(*t)).collect();
            println!("  {:<40} via {}", destination.to_string(), describe_tools(&programs));
        }
        if !missing_tools.is_empty() {
            println!("missing tools: {}", missing_tools.join(", "));
        }
    }

    if args.show_config {
        println!("{}", toml::to_string_pretty(ctx.config.as_ref())?);
    }

    if ctx.ledger().count() == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

fn describe_tools(programs: &[&str]) -> String {
    if programs.is_empty() {
        "built-in copy".to_string()
    } else {
        programs.join(" + ")
    }
}

/// Cancel `token` on SIGINT or SIGTERM. In-flight commands finish; nothing
/// new is started and the workspace is torn down.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Cannot listen for SIGINT");
                    return;
                }
            }
            _ = terminate => {}
        }

        warn!("Interrupt received, finishing current step and cleaning up");
        token.cancel();
    });
}

//! `runeforge` command line.
//!
//! Every subcommand opens the pipeline over the configured DuckDB file, runs
//! one operation and prints the result as JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{AgentsCommand, ApprovalsCommand};

/// Task routing and continuous-learning pipeline
#[derive(Parser)]
#[command(name = "runeforge")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "RUNEFORGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the DuckDB database (overrides the configuration)
    #[arg(long, global = true, env = "RUNEFORGE_DB", value_name = "FILE")]
    db: Option<PathBuf>,

    /// Keep state in memory only
    #[arg(long, global = true, conflicts_with = "db")]
    ephemeral: bool,

    /// Raise the log level (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score and route a task
    Submit(commands::SubmitArgs),

    /// Attach a solution to a queued task
    Complete(commands::CompleteArgs),

    /// Record that a queued task was handled by an existing Rune
    Matched {
        task_id: String,
        rune_id: String,
    },

    /// Record that a queued task fell back to manual handling
    Fallback {
        task_id: String,
        #[arg(long)]
        reason: String,
    },

    /// Training queue counts and recurrence highlights
    Digest,

    /// Run a knowledge synthesis batch
    Synthesize,

    /// List Orbs and every Rune version
    Knowledge,

    /// Review flagged Runes and Orbs
    Approvals {
        #[command(subcommand)]
        command: ApprovalsCommand,
    },

    /// Grant an agent capabilities from approved Runes
    Enhance(commands::EnhanceArgs),

    /// Enhance several agents toward the same targets
    BulkEnhance {
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
        #[arg(long = "target")]
        targets: Vec<String>,
    },

    /// Remove a capability from an agent
    Revoke {
        agent_id: String,
        capability: String,
        #[arg(long)]
        reason: String,
        #[arg(long = "by")]
        revoked_by: String,
    },

    /// Manage the agent roster
    Agents {
        #[command(subcommand)]
        command: AgentsCommand,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = runeforge_config::PipelineConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let pipeline = commands::open_pipeline(config, cli.db, cli.ephemeral)?;

    match cli.command {
        Commands::Submit(args) => commands::submit(&pipeline, args).await,
        Commands::Complete(args) => commands::complete(&pipeline, args).await,
        Commands::Matched { task_id, rune_id } => {
            commands::emit(&pipeline.mark_matched(&task_id, &rune_id).await?)
        }
        Commands::Fallback { task_id, reason } => {
            commands::emit(&pipeline.mark_fallback(&task_id, &reason).await?)
        }
        Commands::Digest => commands::emit(&pipeline.digest().await),
        Commands::Synthesize => commands::synthesize(&pipeline).await,
        Commands::Knowledge => commands::knowledge(&pipeline).await,
        Commands::Approvals { command } => commands::approvals(&pipeline, command).await,
        Commands::Enhance(args) => commands::enhance(&pipeline, args).await,
        Commands::BulkEnhance { agents, targets } => {
            commands::bulk_enhance(&pipeline, agents, targets).await
        }
        Commands::Revoke {
            agent_id,
            capability,
            reason,
            revoked_by,
        } => commands::emit(
            &pipeline
                .revoke(&agent_id, &capability, &reason, &revoked_by)
                .await?,
        ),
        Commands::Agents { command } => commands::agents(&pipeline, command).await,
        Commands::Config => Ok(()),
    }
}

/// Install the tracing subscriber. `RUNEFORGE_LOG` takes precedence over
/// `--verbose`.
fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("RUNEFORGE_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

//! Mixtune CLI - operator interface for multi-phase fine-tuning jobs
//!
//! Provides a `mixtune` command to validate job files, run or resume a job under the
//! orchestrator, and inspect the state it leaves on disk.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Mixtune CLI - orchestrate phased reward-weighted fine-tuning
#[derive(Parser, Debug)]
#[command(
    name = "mixtune",
    author,
    version,
    about = "Mixtune - phased fine-tuning orchestration",
    long_about = "Mixtune drives an external trainer through a sequence of reward-weight phases.\nIt tracks progress from the trainer log, checkpoints job state and resumes after interruption."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a job file
    ///
    /// Parses the TOML job file, checks the phase plan and prints the effective
    /// reward weights of every phase.
    Validate {
        /// Path to the job file
        config: PathBuf,

        /// Also require the base model and training data to exist
        #[arg(long)]
        check_paths: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a job from step 0
    ///
    /// Exits 0 when the job completes, 1 when it fails and 130 when cancelled.
    Run {
        /// Path to the job file
        config: PathBuf,

        /// Print the final job record as JSON instead of progress lines
        #[arg(long)]
        json: bool,
    },

    /// Resume a job from its most recent checkpoint
    ///
    /// Starts from step 0 when the job has no checkpoint yet.
    Resume {
        /// Path to the job file
        config: PathBuf,

        /// Print the final job record as JSON instead of progress lines
        #[arg(long)]
        json: bool,
    },

    /// Show the persisted state of a job
    Status {
        /// Path to the job file
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List jobs under a checkpoint directory
    Jobs {
        /// Checkpoint directory to scan
        checkpoint_dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Validate { config, check_paths, json } => {
            commands::validate::execute(&config, check_paths, json)
        }
        Command::Run { config, json } => {
            commands::train::execute(&config, commands::train::Mode::Fresh, json).await
        }
        Command::Resume { config, json } => {
            commands::train::execute(&config, commands::train::Mode::Resume, json).await
        }
        Command::Status { config, json } => commands::status::execute(&config, json),
        Command::Jobs { checkpoint_dir, json } => commands::jobs::execute(&checkpoint_dir, json),
    }
}

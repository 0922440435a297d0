use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod commands;
mod context;

use commands::checkpoint::run_checkpoint;
use commands::run::{run_continuous, run_interactive};
use commands::web::run_web;

#[derive(Parser)]
#[command(name = "ikoma")]
#[command(about = "Local plan-execute-reflect agent", long_about = None)]
struct Cli {
    /// Verbose logging to stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent, interactively or on a single goal.
    Run(RunArgs),
    /// Inspect and manage conversation checkpoints.
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
    /// Diagnostics for the web fetcher and memory store.
    Web {
        #[command(subcommand)]
        command: WebCommand,
    },
}

#[derive(Subcommand)]
enum WebCommand {
    /// Print fetcher, domain-filter, and memory statistics as JSON.
    Stats,
    /// Delete every cached HTTP response.
    ClearCache,
    /// Reset per-domain request counters.
    ResetStats,
}

#[derive(Args)]
struct RunArgs {
    /// Run one goal to completion without prompting between iterations.
    #[arg(long, requires = "goal")]
    continuous: bool,

    /// The goal to pursue (continuous mode).
    #[arg(long)]
    goal: Option<String>,

    /// Maximum plan-execute-reflect iterations.
    #[arg(long = "max-iter")]
    max_iter: Option<u32>,

    /// Wall-clock limit in minutes.
    #[arg(long = "time-limit")]
    time_limit_mins: Option<u64>,

    /// Disable durable checkpointing for this run.
    #[arg(long = "no-checkpoint")]
    no_checkpoint: bool,
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// List checkpoint runs.
    List {
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Show one run's checkpoints.
    Show {
        run_id: String,
        /// Print per-step state details.
        #[arg(long)]
        steps: bool,
    },
    /// Remove one run's checkpoints.
    Rm {
        run_id: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
    /// Remove every checkpoint.
    ClearAll {
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            if args.continuous {
                let goal = args.goal.clone().expect("clap enforces --goal");
                run_continuous(&args, &goal, cli.verbose)
            } else {
                run_interactive(&args, cli.verbose)
            }
        }
        Command::Checkpoint { command } => run_checkpoint(command),
        Command::Web { command } => run_web(command, cli.verbose),
    }
}

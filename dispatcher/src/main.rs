mod config;
mod dispatcher;
mod eta;
mod planner;
mod render;
mod scheduler;
mod sync;

use crate::{
    config::{DispatchConfig, Overrides},
    dispatcher::{whole_seconds, DispatchOutcome, PacingController},
    eta::format_duration,
    planner::BatchPlanner,
    scheduler::{CommandScheduler, SchedulerClient},
    sync::{signals, CancellationToken},
};
use clap::{ArgAction, Args, Parser, Subcommand};
use itertools::Itertools;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

const CONFIG_FAILURE: u8 = 1;
const DISPATCH_FAILURE: u8 = 2;

/// Paced submission of array jobs to a shared batch scheduler
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// log more, can be repeated
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// submit all windows, waiting for a clear queue between them
    Run(RangeArgs),
    /// print the windows a run would submit
    Plan(RangeArgs),
    /// query the scheduler occupancy once
    Probe {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RangeArgs {
    #[arg(short, long)]
    config: PathBuf,
    /// first task index, overrides tasks.start
    #[arg(long)]
    start: Option<u64>,
    /// last task index, overrides tasks.end
    #[arg(long)]
    end: Option<u64>,
    /// task indices per array job, overrides window
    #[arg(long)]
    window: Option<u64>,
}

impl RangeArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            start: self.start,
            end: self.end,
            window: self.window,
        }
    }
}

fn setup_tracing(verbose: u8) {
    let default = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: &Path, overrides: Overrides) -> Option<DispatchConfig> {
    match DispatchConfig::load(path).and_then(|mut config| {
        config.apply(overrides)?;
        Ok(config)
    }) {
        Ok(config) => Some(config),
        Err(error) => {
            error!(error = ?error, "Failed to load {}: {error}", path.to_string_lossy());
            None
        }
    }
}

fn run(args: RangeArgs) -> ExitCode {
    // signals have to be blocked before any other thread exists
    let token = CancellationToken::new();
    if let Err(error) = signals::cancel_on_signals(token.clone()) {
        warn!(error = ?error, "Failed to install signal handling, the dispatch can only be killed");
    }

    let Some(config) = load_config(&args.config, args.overrides()) else {
        return ExitCode::from(CONFIG_FAILURE);
    };

    if config.preflight_checks() {
        error!("Preflight checks failed, nothing was submitted");
        return ExitCode::from(CONFIG_FAILURE);
    }

    let client = CommandScheduler::load(&config);
    let mut controller = match PacingController::new(&config, client, token) {
        Ok(controller) => controller,
        Err(error) => {
            error!("Failed to set up the dispatch: {error}");
            return ExitCode::from(CONFIG_FAILURE);
        }
    };

    match controller.run() {
        Ok(DispatchOutcome::Completed { windows, elapsed }) => {
            info!(
                "All {windows} jobs submitted. Time taken: {}",
                format_duration(whole_seconds(elapsed))
            );
            ExitCode::SUCCESS
        }
        Ok(DispatchOutcome::Cancelled {
            windows,
            resume_from,
            elapsed,
        }) => {
            let taken = format_duration(whole_seconds(elapsed));

            match resume_from {
                Some(start) => warn!(
                    "Dispatch cancelled after {windows} windows and {taken}, resume with --start {start}"
                ),
                None => warn!(
                    "Dispatch cancelled after {windows} windows and {taken}, nothing left to submit"
                ),
            }
            ExitCode::from(signals::INTERRUPTED as u8)
        }
        Err(error) => {
            let cause = std::error::Error::source(&error)
                .map(|source| source.to_string())
                .unwrap_or_default();

            error!(
                "Dispatch aborted: {error}: {cause}. Resume with --start {}",
                error.resume_from()
            );
            ExitCode::from(DISPATCH_FAILURE)
        }
    }
}

fn plan(args: RangeArgs) -> ExitCode {
    let Some(config) = load_config(&args.config, args.overrides()) else {
        return ExitCode::from(CONFIG_FAILURE);
    };

    match BatchPlanner::new(config.tasks, config.window) {
        Ok(planner) => {
            info!(
                "{} windows of up to {} tasks over {}",
                planner.window_count(),
                planner.window_size(),
                planner.range()
            );
            println!("{}", planner.map(|window| window.to_string()).join("\n"));
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("{error}");
            ExitCode::from(CONFIG_FAILURE)
        }
    }
}

fn probe(path: PathBuf) -> ExitCode {
    let Some(config) = load_config(&path, Overrides::default()) else {
        return ExitCode::from(CONFIG_FAILURE);
    };

    match CommandScheduler::load(&config).query_occupancy(&config.scheduler.user) {
        Ok(snapshot) => {
            println!(
                "idle: {} blocked: {} ({})",
                snapshot.idle,
                snapshot.blocked,
                if snapshot.is_clear() { "CLEAR" } else { "BUSY" }
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = ?error, "Occupancy probe failed: {error}");
            ExitCode::from(DISPATCH_FAILURE)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Plan(args) => plan(args),
        Commands::Probe { config } => probe(config),
    }
}

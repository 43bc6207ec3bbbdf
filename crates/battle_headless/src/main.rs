//! Command-line front end for the battle engine.
//!
//! Plays a scenario's battle phase with scripted answers, checkpoints a
//! phase that stops at a decision, and estimates battle odds over seeds.
//!
//! # Usage
//!
//! ```bash
//! # Play one battle phase and print the report
//! cargo run -p battle_headless -- run --scenario skirmish --seed 7
//!
//! # Stop at the second decision and write a checkpoint
//! cargo run -p battle_headless -- run --pause-at 2 --checkpoint phase.ckpt
//!
//! # Finish a checkpointed phase
//! cargo run -p battle_headless -- resume --checkpoint phase.ckpt
//!
//! # Attacker odds per site over 1000 seeds
//! cargo run -p battle_headless -- batch --scenario skirmish --count 1000 --output results/
//!
//! # Same seed, same final state
//! cargo run -p battle_headless -- verify --seed 12345 --runs 5
//! ```
//!
//! Reports go to stdout as JSON; logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use battle_core::snapshot::Checkpoint;
use battle_headless::{
    batch::{run_batch, verify_determinism, BatchConfig},
    runner::{BattleRunner, PausingPlayer, RunReport, RunStatus},
    scenario::Scenario,
};

#[derive(Parser)]
#[command(name = "battle_headless")]
#[command(about = "Fight, checkpoint and tally battle phases without a UI")]
#[command(version)]
struct Cli {
    /// Log engine steps at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play one battle phase
    Run {
        /// Scenario file or built-in name
        #[arg(short, long, default_value = "skirmish")]
        scenario: String,

        /// Dice seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Suspend at this decision (1-based) instead of answering it
        #[arg(long)]
        pause_at: Option<u32>,

        /// Where to write the checkpoint if the phase suspends
        #[arg(long, default_value = "phase.ckpt")]
        checkpoint: PathBuf,
    },

    /// Finish a checkpointed battle phase
    Resume {
        /// Checkpoint file
        #[arg(short, long)]
        checkpoint: PathBuf,
    },

    /// Play one phase per seed and tally who wins at each site
    Batch {
        /// Scenario file or built-in name
        #[arg(short, long, default_value = "skirmish")]
        scenario: String,

        /// Seeds to play
        #[arg(short, long, default_value = "100")]
        count: u32,

        /// Worker threads (0 = one per core)
        #[arg(short, long, default_value = "0")]
        parallel: usize,

        /// Directory for batch_results.json
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// First seed; the rest count up from it
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Replay one seed several times and compare final state hashes
    Verify {
        /// Scenario file or built-in name
        #[arg(short, long, default_value = "skirmish")]
        scenario: String,

        /// Dice seed
        #[arg(long, default_value = "12345")]
        seed: u64,

        /// Replays to compare
        #[arg(short, long, default_value = "5")]
        runs: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    // stdout carries the JSON reports
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            log_level,
        ))
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            seed,
            pause_at,
            checkpoint,
        } => cmd_run(&scenario, seed, pause_at, checkpoint),
        Commands::Resume { checkpoint } => cmd_resume(checkpoint),
        Commands::Batch {
            scenario,
            count,
            parallel,
            output,
            seed,
        } => cmd_batch(scenario, count, parallel, output, seed),
        Commands::Verify {
            scenario,
            seed,
            runs,
        } => cmd_verify(&scenario, seed, runs),
    }
}

fn load_scenario(name: &str) -> Scenario {
    match Scenario::resolve(name) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to load scenario: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_report(report: &RunReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to encode report: {}", e);
            std::process::exit(1);
        }
    }
}

/// Play one battle phase, checkpointing if it suspends
fn cmd_run(scenario: &str, seed: u64, pause_at: Option<u32>, checkpoint: PathBuf) {
    let scenario = load_scenario(scenario);
    let player = pause_at.map_or(PausingPlayer::never(), PausingPlayer::at);

    let mut runner = match BattleRunner::new(&scenario, seed, player) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Failed to set up scenario: {}", e);
            std::process::exit(1);
        }
    };

    let report = match runner.run() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, fatal = e.is_fatal(), "battle phase aborted");
            eprintln!("Battle phase aborted: {}", e);
            std::process::exit(1);
        }
    };

    if report.status == RunStatus::Suspended {
        if let Err(e) = runner.save_checkpoint(&checkpoint) {
            eprintln!("Failed to write checkpoint: {}", e);
            std::process::exit(1);
        }
        eprintln!("Phase suspended; checkpoint written to {}", checkpoint.display());
        eprintln!("Battles still to fight: {:?}", runner.pending_normal_battles());
    }
    print_report(&report);
}

/// Finish a checkpointed battle phase
fn cmd_resume(path: PathBuf) {
    tracing::info!(path = %path.display(), "checkpoint resume requested");

    let checkpoint = match Checkpoint::load(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load checkpoint: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!(
        "Resuming phase at dice seed {} (state {:016x})",
        checkpoint.seed,
        checkpoint.state_hash()
    );

    let name = path
        .file_stem()
        .map_or_else(|| "checkpoint".to_string(), |s| s.to_string_lossy().into_owned());
    let mut runner = BattleRunner::from_checkpoint(name, checkpoint, PausingPlayer::never());
    match runner.run() {
        Ok(report) => {
            eprintln!("Final state hash: {:016x}", report.state_hash);
            print_report(&report);
        }
        Err(e) => {
            tracing::error!(error = %e, "resumed phase aborted");
            eprintln!("Resumed phase aborted: {}", e);
            std::process::exit(1);
        }
    }
}

/// Tally battle outcomes over consecutive seeds
fn cmd_batch(scenario: String, count: u32, parallel: usize, output: PathBuf, seed: u64) {
    tracing::info!(
        scenario = %scenario,
        seeds = count,
        threads = parallel,
        first_seed = seed,
        output = %output.display(),
        "battle batch requested"
    );

    if let Err(e) = std::fs::create_dir_all(&output) {
        tracing::error!(error = %e, path = %output.display(), "results directory unavailable");
        eprintln!("Cannot create results directory {}: {}", output.display(), e);
        std::process::exit(1);
    }

    let config = BatchConfig {
        scenario,
        phases: count,
        threads: parallel,
        output_dir: output.clone(),
        seed_start: seed,
    };
    let results = run_batch(config);

    let results_path = output.join("batch_results.json");
    if let Err(e) = results.save(&results_path) {
        tracing::error!(error = %e, path = %results_path.display(), "batch results not written");
        eprintln!("Failed to write batch results: {}", e);
        std::process::exit(1);
    }

    eprint!("{}", results.digest());
    eprintln!("Batch results written to {}", results_path.display());
    if !results.failures.is_empty() {
        std::process::exit(2);
    }
}

/// Replay one seed and compare final state hashes
fn cmd_verify(scenario: &str, seed: u64, runs: u32) {
    tracing::info!(scenario, seed, runs, "replaying seed");

    let scenario = load_scenario(scenario);
    if verify_determinism(&scenario, seed, runs) {
        eprintln!("Seed {} reached the same final state in all {} replays", seed, runs);
    } else {
        eprintln!("Seed {} diverged: final state hashes differ between replays", seed);
        std::process::exit(1);
    }
}

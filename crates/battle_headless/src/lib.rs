//! Headless battle runner for scenario playback and CI verification.
//!
//! This crate plays battle phases without any user interface:
//!
//! - **Scenario playback**: load a RON board and fight every battle
//! - **Batch statistics**: play one scenario under many seeds in parallel
//! - **Determinism checks**: identical seeds must reach identical states
//! - **Checkpoints**: suspend a phase, save it, resume it later
//!
//! # Output
//!
//! - **stdout**: run reports and batch summaries (JSON)
//! - **stderr**: logs (human-readable)
//!
//! # Example
//!
//! ```bash
//! # Play the built-in skirmish
//! cargo run -p battle_headless -- run --scenario skirmish --seed 7
//!
//! # Pause at the third decision and save a checkpoint, then finish it
//! cargo run -p battle_headless -- run --pause-at 3 --checkpoint phase.ckpt
//! cargo run -p battle_headless -- resume --checkpoint phase.ckpt
//!
//! # Win rates over 1000 seeds
//! cargo run -p battle_headless -- batch --count 1000 --output results/
//! ```

pub mod batch;
pub mod runner;
pub mod scenario;

pub use batch::{run_batch, BatchConfig, BatchResults, BatchSummary, RunFailure};
pub use runner::{run_scenario, BattleRunner, PausingPlayer, RunReport, RunStatus};
pub use scenario::{Scenario, ScenarioError};

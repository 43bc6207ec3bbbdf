//! # Battle Core
//!
//! Deterministic battle resolution for turn-based strategy games played on a
//! territory map.
//!
//! This crate contains **only** the rules engine:
//! - No rendering
//! - No direct IO outside checkpoint files
//! - No system randomness (every die comes through the [`bridge`])
//!
//! Every battle keeps its remaining work as a stack of serializable steps,
//! so a battle interrupted while waiting for a player resumes exactly where
//! it stopped, without repeating a roll or a casualty.
//!
//! ## Crate Structure
//!
//! - [`battle`] - Battle variants and their step machines
//! - [`tracker`] - Pending battles, dependencies and conquest bookkeeping
//! - [`delegate`] - Per-turn driver: setup, scrambling, kamikaze, bombardment
//! - [`stack`] - Resumable execution stack
//! - [`casualty`] / [`dice`] - Casualty selection and dice rolling
//! - [`bridge`] - Mutation, dice, history and player-decision seam
//! - [`change`] - Undoable state changes
//! - [`state`] - Map, units and players
//! - [`snapshot`] - Versioned checkpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod battle;
pub mod bridge;
pub mod casualty;
pub mod change;
pub mod data;
pub mod delegate;
pub mod dice;
pub mod error;
pub mod ids;
pub mod matches;
pub mod records;
pub mod route;
pub mod rules;
pub mod snapshot;
pub mod stack;
pub mod state;
pub mod tracker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::battle::{Battle, BattleCore, BattleResultDescription, BattleType, WhoWon};
    pub use crate::bridge::{AutoPlayer, Bridge, DisplayEvent, LocalBridge, RemotePlayer, SoundClip};
    pub use crate::casualty::{CasualtyList, CasualtyRequest};
    pub use crate::change::{Change, UnitProperty};
    pub use crate::data::{Domain, UnitTrait, UnitType, UnitTypeRegistry};
    pub use crate::delegate::{BattleDelegate, StageFlags};
    pub use crate::error::{BattleError, Result};
    pub use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId, UnitTypeId};
    pub use crate::records::{BattleOutcome, BattleRecord};
    pub use crate::route::Route;
    pub use crate::rules::BattleRules;
    pub use crate::snapshot::Checkpoint;
    pub use crate::state::{GameState, Player, Territory, Unit};
    pub use crate::tracker::{AttackMove, BattleTracker};
}

//! Error types for battle resolution.

use thiserror::Error;

use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId, UnitTypeId};

/// Result type alias using [`BattleError`].
pub type Result<T> = std::result::Result<T, BattleError>;

/// Top-level error type for the battle engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BattleError {
    /// A remote decision is not available yet.
    ///
    /// Not a failure: the interrupted step stays on its stack and runs
    /// again the next time the battle is fought.
    #[error("Waiting on a decision from player {0}")]
    Suspended(PlayerId),

    /// A remote participant answered outside the offered options.
    #[error("Illegal selection from player {player}: {message}")]
    IllegalSelection {
        /// Player that answered.
        player: PlayerId,
        /// What was wrong with the answer.
        message: String,
    },

    /// An internal invariant no longer holds.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// A recoverable request the engine declined, with the reason shown to the player.
    #[error("{0}")]
    Rejected(String),

    /// Unit not present in the game state.
    #[error("Unit not found: {0}")]
    UnknownUnit(UnitId),

    /// Territory not present in the map.
    #[error("Territory not found: {0}")]
    UnknownTerritory(TerritoryId),

    /// Player not present in the game state.
    #[error("Player not found: {0}")]
    UnknownPlayer(PlayerId),

    /// Unit type not registered.
    #[error("Unit type not found: {0}")]
    UnknownUnitType(String),

    /// Unit type id out of range for the registry.
    #[error("Unit type id out of range: {0}")]
    UnknownUnitTypeId(UnitTypeId),

    /// Battle not registered with the tracker.
    #[error("Battle not found: {0}")]
    UnknownBattle(BattleId),

    /// Invalid state, usually a failed (de)serialization.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl BattleError {
    /// True when the error must abort the turn instead of being reported to the player.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Suspended(_) | Self::Rejected(_))
    }

    /// True for the resumable waiting-on-a-player condition.
    #[must_use]
    pub const fn is_suspension(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!BattleError::Suspended(PlayerId(1)).is_fatal());
        assert!(!BattleError::Rejected("later".into()).is_fatal());
        assert!(BattleError::InvariantViolation("stack".into()).is_fatal());
        assert!(BattleError::IllegalSelection {
            player: PlayerId(2),
            message: "not offered".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_suspension_flag() {
        assert!(BattleError::Suspended(PlayerId(3)).is_suspension());
        assert!(!BattleError::UnknownUnit(UnitId(4)).is_suspension());
    }
}

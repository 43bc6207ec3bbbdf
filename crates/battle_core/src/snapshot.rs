//! Checkpoints of an interrupted battle phase.
//!
//! A checkpoint bundles the game state, the delegate (tracker, stage flags,
//! step stacks of suspended battles) and the position in the dice stream.
//! Restoring one and calling [`BattleDelegate::start`] again continues the
//! phase exactly where it stopped.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bridge::{Bridge, LocalBridge, RemotePlayer};
use crate::delegate::BattleDelegate;
use crate::error::{BattleError, Result};
use crate::state::GameState;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Persisted battle phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version.
    pub version: u32,
    /// Game state at the time of capture.
    pub state: GameState,
    /// Delegate with its tracker and suspended battles.
    pub delegate: BattleDelegate,
    /// Dice seed.
    pub seed: u64,
    /// Words consumed from the dice stream.
    pub dice_position: u128,
}

impl Checkpoint {
    /// Capture the delegate together with the bridge it was driving.
    #[must_use]
    pub fn capture<R: RemotePlayer>(delegate: &BattleDelegate, bridge: &LocalBridge<R>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            state: bridge.state().clone(),
            delegate: delegate.clone(),
            seed: bridge.seed(),
            dice_position: bridge.dice_position(),
        }
    }

    /// Rebuild the bridge and delegate, answering decisions with `remote`.
    pub fn restore<R: RemotePlayer>(self, remote: R) -> (LocalBridge<R>, BattleDelegate) {
        let mut bridge = LocalBridge::new(self.state, self.seed, remote);
        bridge.restore_dice(self.seed, self.dice_position);
        debug!(seed = self.seed, position = self.dice_position, "checkpoint restored");
        (bridge, self.delegate)
    }

    /// Hash of the captured game state.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        self.state.state_hash()
    }

    /// Encode to bytes.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| BattleError::InvalidState(format!("Failed to serialize checkpoint: {e}")))
    }

    /// Decode from bytes, checking the format version.
    ///
    /// # Errors
    /// Returns an error if deserialization fails or the version differs.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let checkpoint: Self = bincode::deserialize(bytes)
            .map_err(|e| BattleError::InvalidState(format!("Failed to deserialize checkpoint: {e}")))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(BattleError::InvalidState(format!(
                "Checkpoint version mismatch: expected {CHECKPOINT_VERSION}, got {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }

    /// Save the checkpoint to a file.
    ///
    /// # Errors
    /// Returns an error if serialization or file writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), bytes)
            .map_err(|e| BattleError::InvalidState(format!("Failed to write checkpoint file: {e}")))?;
        Ok(())
    }

    /// Load a checkpoint from a file.
    ///
    /// # Errors
    /// Returns an error if file reading or deserialization fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| BattleError::InvalidState(format!("Failed to read checkpoint file: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AutoPlayer;
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::ids::{PlayerId, TerritoryId};
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    fn create_test_bridge() -> LocalBridge<AutoPlayer> {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        let mut state = GameState::new(BattleRules::default(), types);
        state.add_territory(Territory::new(TerritoryId(0), "Plains", false));
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        state.current_player = Some(PlayerId(0));
        state.spawn_unit("infantry", PlayerId(0), TerritoryId(0)).unwrap();
        LocalBridge::auto(state, 77)
    }

    #[test]
    fn test_checkpoint_capture() {
        let bridge = create_test_bridge();
        let checkpoint = Checkpoint::capture(&BattleDelegate::new(), &bridge);
        assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
        assert_eq!(checkpoint.seed, 77);
        assert_eq!(checkpoint.state_hash(), bridge.state().state_hash());
    }

    #[test]
    fn test_checkpoint_save_load() {
        let mut bridge = create_test_bridge();
        bridge.roll_dice(6, 5, PlayerId(0), "warm up").unwrap();
        let checkpoint = Checkpoint::capture(&BattleDelegate::new(), &bridge);

        let dir = std::env::temp_dir();
        let path = dir.join("battle_checkpoint_test.bin");
        checkpoint.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.state, checkpoint.state);
        assert_eq!(loaded.delegate, checkpoint.delegate);
        assert_eq!(loaded.dice_position, checkpoint.dice_position);
    }

    #[test]
    fn test_populated_state_round_trips() {
        let mut bridge = create_test_bridge();
        {
            let state = bridge.state_mut();
            let mut battleship = UnitType::new("battleship", Domain::Sea, 20, 4, 4);
            battleship.hit_points = 2;
            battleship.bombard = Some(4);
            let mut factory = UnitType::new("factory", Domain::Land, 15, 0, 0);
            factory.max_damage = 20;
            factory.damaged_changes_into = Some("damaged factory".to_string());
            state.unit_types.register(battleship);
            state.unit_types.register(factory);
            state.add_territory(Territory::new(TerritoryId(1), "Straits", true));
            state.connect(TerritoryId(0), TerritoryId(1)).unwrap();
            state.spawn_unit("battleship", PlayerId(1), TerritoryId(1)).unwrap();
            state.spawn_unit("factory", PlayerId(1), TerritoryId(0)).unwrap();
        }
        let checkpoint = Checkpoint::capture(&BattleDelegate::new(), &bridge);

        let loaded = Checkpoint::from_bytes(&checkpoint.to_bytes().unwrap()).unwrap();

        assert_eq!(loaded.state, checkpoint.state);
        assert_eq!(loaded.state_hash(), bridge.state().state_hash());
        assert_eq!(loaded.state.unit_types.len(), 3);
    }

    #[test]
    fn test_restored_dice_continue_stream() {
        let mut bridge = create_test_bridge();
        bridge.roll_dice(6, 3, PlayerId(0), "first").unwrap();
        let checkpoint = Checkpoint::capture(&BattleDelegate::new(), &bridge);
        let expected = bridge.roll_dice(6, 4, PlayerId(0), "second").unwrap();

        let (mut restored, _) = checkpoint.restore(AutoPlayer);
        let actual = restored.roll_dice(6, 4, PlayerId(0), "second").unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_checkpoint_version_mismatch() {
        let bridge = create_test_bridge();
        let mut checkpoint = Checkpoint::capture(&BattleDelegate::new(), &bridge);
        checkpoint.version = CHECKPOINT_VERSION + 1;
        let bytes = bincode::serialize(&checkpoint).unwrap();
        assert!(matches!(Checkpoint::from_bytes(&bytes), Err(BattleError::InvalidState(_))));
    }
}

//! Headless battle phase runner.
//!
//! Plays one scenario's battle phase through the delegate: every battle in
//! dependency order, defaults for every decision. A [`PausingPlayer`] can
//! stand in for a player who drops out, which leaves the phase suspended so
//! it can be checkpointed and resumed later.

use std::path::Path;

use battle_core::battle::BattleType;
use battle_core::bridge::{Bridge, DisplayEvent, LocalBridge, RemotePlayer, RetreatRequest};
use battle_core::casualty::{CasualtyList, CasualtyRequest};
use battle_core::delegate::BattleDelegate;
use battle_core::error::{BattleError, Result};
use battle_core::ids::{PlayerId, TerritoryId};
use battle_core::records::BattleRecord;
use battle_core::snapshot::Checkpoint;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scenario::{Scenario, ScenarioError};

/// Default-answering player that stops answering once, at a chosen decision.
///
/// Decisions are casualty picks and retreat questions, counted from 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct PausingPlayer {
    pause_at: Option<u32>,
    answered: u32,
}

impl PausingPlayer {
    /// Player that never pauses.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            pause_at: None,
            answered: 0,
        }
    }

    /// Player that suspends at decision number `n`.
    #[must_use]
    pub const fn at(n: u32) -> Self {
        Self {
            pause_at: Some(n),
            answered: 0,
        }
    }

    fn ask(&mut self, player: PlayerId) -> Result<()> {
        self.answered += 1;
        if self.pause_at == Some(self.answered) {
            self.pause_at = None;
            self.answered -= 1;
            debug!(%player, "player paused");
            return Err(BattleError::Suspended(player));
        }
        Ok(())
    }
}

impl RemotePlayer for PausingPlayer {
    fn select_casualties(&mut self, player: PlayerId, request: &CasualtyRequest) -> Result<CasualtyList> {
        self.ask(player)?;
        Ok(request.default.clone())
    }

    fn retreat_query(&mut self, player: PlayerId, _request: &RetreatRequest) -> Result<Option<TerritoryId>> {
        self.ask(player)?;
        Ok(None)
    }
}

/// Where a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Every battle was fought and the phase ended.
    Completed,
    /// A player stopped answering mid-phase.
    Suspended,
}

/// Summary of one battle phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Scenario name.
    pub scenario: String,
    /// Dice seed.
    pub seed: u64,
    /// Completed or suspended.
    pub status: RunStatus,
    /// Battles fought by this runner.
    pub battles_fought: u32,
    /// Dice rolls shown to players.
    pub dice_rolls: usize,
    /// Records of the phase, once it ended.
    pub records: Vec<BattleRecord>,
    /// Hash of the final game state.
    pub state_hash: u64,
}

/// Drives a delegate and its bridge through one battle phase.
pub struct BattleRunner<R> {
    name: String,
    bridge: LocalBridge<R>,
    delegate: BattleDelegate,
    battles_fought: u32,
}

impl<R: RemotePlayer> BattleRunner<R> {
    /// Build the scenario board and report its moves to a fresh delegate.
    pub fn new(scenario: &Scenario, seed: u64, remote: R) -> std::result::Result<Self, ScenarioError> {
        let (state, moves) = scenario.build()?;
        let mut bridge = LocalBridge::new(state, seed, remote);
        let mut delegate = BattleDelegate::new();
        for attack in &moves {
            delegate.add_attack(attack, &mut bridge)?;
        }
        info!(scenario = %scenario.name, seed, moves = moves.len(), "scenario loaded");
        Ok(Self {
            name: scenario.name.clone(),
            bridge,
            delegate,
            battles_fought: 0,
        })
    }

    /// Continue a checkpointed phase.
    pub fn from_checkpoint(name: impl Into<String>, checkpoint: Checkpoint, remote: R) -> Self {
        let (bridge, delegate) = checkpoint.restore(remote);
        Self {
            name: name.into(),
            bridge,
            delegate,
            battles_fought: 0,
        }
    }

    /// Play the phase until it ends or a player stops answering.
    ///
    /// # Errors
    ///
    /// Propagates every engine error except a suspension.
    pub fn run(&mut self) -> Result<RunReport> {
        match self.play() {
            Ok(()) => Ok(self.report(RunStatus::Completed)),
            Err(e) if e.is_suspension() => {
                warn!(scenario = %self.name, error = %e, "battle phase suspended");
                Ok(self.report(RunStatus::Suspended))
            }
            Err(e) => Err(e),
        }
    }

    fn play(&mut self) -> Result<()> {
        self.delegate.start(&mut self.bridge)?;
        while self.delegate.requires_user_input() {
            let Some((site, battle_type)) = self.delegate.next_battle() else {
                return Err(BattleError::InvariantViolation(format!(
                    "battles remain but none can be fought: {}",
                    self.delegate.tracker().describe(self.bridge.state()).join(", ")
                )));
            };
            if self.delegate.current_battle().is_some() {
                self.delegate.fight_current_battle(&mut self.bridge)?;
            } else {
                debug!(%site, kind = %battle_type, "fighting battle");
                self.delegate.fight_battle(site, battle_type, &mut self.bridge)?;
            }
            if self.delegate.current_battle().is_none() {
                self.battles_fought += 1;
            }
        }
        self.delegate.end(&mut self.bridge)
    }

    fn report(&self, status: RunStatus) -> RunReport {
        let dice_rolls = self
            .bridge
            .events()
            .iter()
            .filter(|e| matches!(e, DisplayEvent::Dice { .. }))
            .count();
        RunReport {
            scenario: self.name.clone(),
            seed: self.bridge.seed(),
            status,
            battles_fought: self.battles_fought,
            dice_rolls,
            records: self.delegate.statistics().to_vec(),
            state_hash: self.bridge.state().state_hash(),
        }
    }

    /// Snapshot of the phase as it stands.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::capture(&self.delegate, &self.bridge)
    }

    /// Write the phase as it stands to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file writing fails.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.checkpoint().save(path)
    }

    /// Normal battles still pending.
    #[must_use]
    pub fn pending_normal_battles(&self) -> Vec<TerritoryId> {
        self.delegate
            .battles()
            .get(&BattleType::Normal)
            .map(|sites| sites.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The delegate.
    #[must_use]
    pub const fn delegate(&self) -> &BattleDelegate {
        &self.delegate
    }

    /// The bridge.
    #[must_use]
    pub const fn bridge(&self) -> &LocalBridge<R> {
        &self.bridge
    }
}

/// Play a scenario start to finish with default answers.
///
/// # Errors
///
/// Scenario errors, or an engine error that aborted the phase.
pub fn run_scenario(scenario: &Scenario, seed: u64) -> std::result::Result<RunReport, ScenarioError> {
    let mut runner = BattleRunner::new(scenario, seed, PausingPlayer::never())?;
    Ok(runner.run()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skirmish() -> Scenario {
        Scenario::builtin("skirmish").unwrap()
    }

    #[test]
    fn test_run_skirmish_completes() {
        let report = run_scenario(&skirmish(), 42).unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.records.len(), 2);
        assert!(report.dice_rolls > 0);
        assert_eq!(report.battles_fought, 2);
    }

    #[test]
    fn test_same_seed_same_hash() {
        let a = run_scenario(&skirmish(), 9).unwrap();
        let b = run_scenario(&skirmish(), 9).unwrap();
        assert_eq!(a.state_hash, b.state_hash);
        assert_eq!(a.records, b.records);
    }

    #[test]
    fn test_pausing_player_suspends_once() {
        let mut player = PausingPlayer::at(2);
        assert!(player.ask(PlayerId(0)).is_ok());
        assert!(matches!(player.ask(PlayerId(1)), Err(BattleError::Suspended(PlayerId(1)))));
        assert!(player.ask(PlayerId(1)).is_ok());
        assert_eq!(player.answered, 2);
    }

    #[test]
    fn test_suspend_checkpoint_resume() {
        let expected = run_scenario(&skirmish(), 5).unwrap();

        let mut runner = BattleRunner::new(&skirmish(), 5, PausingPlayer::at(1)).unwrap();
        let paused = runner.run().unwrap();
        assert_eq!(paused.status, RunStatus::Suspended);
        assert!(paused.records.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phase.ckpt");
        runner.save_checkpoint(&path).unwrap();

        let checkpoint = Checkpoint::load(&path).unwrap();
        let mut resumed = BattleRunner::from_checkpoint("skirmish", checkpoint, PausingPlayer::never());
        let report = resumed.run().unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.state_hash, expected.state_hash);
        assert_eq!(report.records, expected.records);
    }
}

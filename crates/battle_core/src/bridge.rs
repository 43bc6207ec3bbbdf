//! The single seam between the engine and the rest of the game.
//!
//! Every mutation, die roll, history line, display notification and
//! remote decision goes through a [`Bridge`]. [`LocalBridge`] is the
//! in-process implementation: it owns the game state, a seeded dice
//! stream and the change log.

use std::collections::{BTreeMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::casualty::{CasualtyList, CasualtyRequest};
use crate::change::{Change, ChangeLog};
use crate::error::{BattleError, Result};
use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId};
use crate::state::GameState;

/// Notification for whatever displays the battle. Nothing flows back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayEvent {
    /// A battle is about to be shown.
    ShowBattle {
        /// Battle.
        battle: BattleId,
        /// Site.
        site: TerritoryId,
        /// Title line.
        title: String,
        /// Attacking units.
        attackers: Vec<UnitId>,
        /// Defending units.
        defenders: Vec<UnitId>,
    },
    /// The step names of the current round.
    ListSteps {
        /// Battle.
        battle: BattleId,
        /// Step names in execution order.
        steps: Vec<String>,
    },
    /// Dice were rolled.
    Dice {
        /// Battle.
        battle: BattleId,
        /// Step name.
        step: String,
        /// Rolling player.
        player: PlayerId,
        /// Die values.
        dice: Vec<u32>,
        /// Hits scored.
        hits: u32,
    },
    /// Casualties were chosen.
    Casualties {
        /// Battle.
        battle: BattleId,
        /// Step name.
        step: String,
        /// Player that lost the units.
        player: PlayerId,
        /// Killed units.
        killed: Vec<UnitId>,
        /// Damaged units.
        damaged: Vec<UnitId>,
    },
    /// Units retreated or submerged.
    Retreat {
        /// Battle.
        battle: BattleId,
        /// Message.
        message: String,
        /// Units withdrawn.
        units: Vec<UnitId>,
    },
    /// Units left the battle without casualty selection.
    DeadUnits {
        /// Battle.
        battle: BattleId,
        /// Units removed.
        units: Vec<UnitId>,
    },
    /// Bombing damage was dealt.
    Bombing {
        /// Battle.
        battle: BattleId,
        /// Total damage.
        damage: u32,
    },
    /// The battle is over.
    BattleEnd {
        /// Battle.
        battle: BattleId,
        /// Result line.
        message: String,
    },
}

/// Sound cues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoundClip {
    /// Land battle starts.
    BattleLand,
    /// Sea battle starts.
    BattleSea,
    /// Air battle starts.
    BattleAir,
    /// Bombing raid starts.
    BattleBombing,
    /// Naval bombardment.
    Bombard,
    /// AA guns hit.
    AaHit,
    /// AA guns missed.
    AaMiss,
    /// Units retreated.
    Retreat,
    /// Submarines submerged.
    Submerge,
    /// Territory captured.
    Conquered,
    /// Kamikaze attack.
    Kamikaze,
    /// Battle lost.
    BattleFailure,
    /// Stalemate.
    BattleStalemate,
}

/// A retreat or submerge question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetreatRequest {
    /// Battle.
    pub battle: BattleId,
    /// Battle site.
    pub site: TerritoryId,
    /// Submerge instead of moving away.
    pub submerge: bool,
    /// Legal destinations.
    pub options: Vec<TerritoryId>,
    /// Prompt text.
    pub message: String,
}

/// Airbase source offered for scrambling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrambleSource {
    /// Units allowed to scramble.
    pub max: u32,
    /// Scramble-capable air at the source.
    pub candidates: Vec<UnitId>,
}

/// Decisions the engine asks of players.
///
/// Every method has a default answer. An implementation that cannot answer
/// yet returns [`BattleError::Suspended`]; the battle step stays queued and
/// asks again on the next `fight`.
pub trait RemotePlayer {
    /// Choose casualties. The default accepts the engine's suggestion.
    fn select_casualties(&mut self, _player: PlayerId, request: &CasualtyRequest) -> Result<CasualtyList> {
        Ok(request.default.clone())
    }

    /// Retreat to one of the options, or stay with `None`.
    fn retreat_query(&mut self, _player: PlayerId, _request: &RetreatRequest) -> Result<Option<TerritoryId>> {
        Ok(None)
    }

    /// Pick the units that intercept. The default sends all of them.
    fn select_interceptors(
        &mut self,
        _player: PlayerId,
        _battle: BattleId,
        candidates: &[UnitId],
    ) -> Result<Vec<UnitId>> {
        Ok(candidates.to_vec())
    }

    /// Pick a bombing target for one bomber.
    fn select_bombing_target(
        &mut self,
        _player: PlayerId,
        _bomber: UnitId,
        targets: &[UnitId],
    ) -> Result<Option<UnitId>> {
        Ok(targets.first().copied())
    }

    /// Pick scrambling units per source territory.
    fn select_scramblers(
        &mut self,
        _player: PlayerId,
        _site: TerritoryId,
        _sources: &BTreeMap<TerritoryId, ScrambleSource>,
    ) -> Result<BTreeMap<TerritoryId, Vec<UnitId>>> {
        Ok(BTreeMap::new())
    }

    /// Spend kamikaze tokens: target unit to token count.
    fn select_kamikaze_attacks(
        &mut self,
        _player: PlayerId,
        _targets: &BTreeMap<TerritoryId, Vec<UnitId>>,
        _tokens: u32,
    ) -> Result<BTreeMap<UnitId, u32>> {
        Ok(BTreeMap::new())
    }

    /// Assign a bombarding unit to one of the battles, or decline.
    fn select_bombarding_battle(
        &mut self,
        _player: PlayerId,
        _unit: UnitId,
        options: &[BattleId],
    ) -> Result<Option<BattleId>> {
        Ok(options.first().copied())
    }
}

/// Remote player that always gives the default answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoPlayer;

impl RemotePlayer for AutoPlayer {}

/// Engine-facing collaborator.
pub trait Bridge {
    /// Read-only game state.
    fn state(&self) -> &GameState;

    /// Apply a change, recording its inverse.
    fn apply_change(&mut self, change: Change) -> Result<()>;

    /// Roll `count` dice with values in `0..sides`.
    fn roll_dice(&mut self, sides: u32, count: u32, player: PlayerId, annotation: &str) -> Result<Vec<u32>>;

    /// Append a history line.
    fn history_event(&mut self, text: String, units: &[UnitId]);

    /// Send a display notification.
    fn notify(&mut self, event: DisplayEvent);

    /// Play a sound for a player.
    fn play_sound(&mut self, clip: SoundClip, player: PlayerId);

    /// Decision seam.
    fn remote(&mut self) -> &mut dyn RemotePlayer;
}

/// One history line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Text.
    pub text: String,
    /// Units mentioned.
    pub units: Vec<UnitId>,
}

/// In-process bridge with a seeded dice stream.
#[derive(Debug, Clone)]
pub struct LocalBridge<R> {
    state: GameState,
    seed: u64,
    rng: ChaCha8Rng,
    scripted_dice: VecDeque<u32>,
    log: ChangeLog,
    history: Vec<HistoryEntry>,
    events: Vec<DisplayEvent>,
    sounds: Vec<(SoundClip, PlayerId)>,
    remote: R,
}

impl LocalBridge<AutoPlayer> {
    /// Bridge answering every decision with the default.
    #[must_use]
    pub fn auto(state: GameState, seed: u64) -> Self {
        Self::new(state, seed, AutoPlayer)
    }
}

impl<R: RemotePlayer> LocalBridge<R> {
    /// Create a bridge over `state` with dice seeded by `seed`.
    #[must_use]
    pub fn new(state: GameState, seed: u64, remote: R) -> Self {
        Self {
            state,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            scripted_dice: VecDeque::new(),
            log: ChangeLog::new(),
            history: Vec::new(),
            events: Vec::new(),
            sounds: Vec::new(),
            remote,
        }
    }

    /// Queue fixed die values ahead of the seeded stream.
    pub fn queue_dice<I: IntoIterator<Item = u32>>(&mut self, values: I) {
        self.scripted_dice.extend(values);
    }

    /// Dice seed.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Position in the dice stream.
    #[must_use]
    pub fn dice_position(&self) -> u128 {
        self.rng.get_word_pos()
    }

    /// Continue an earlier dice stream.
    pub fn restore_dice(&mut self, seed: u64, position: u128) {
        self.seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.rng.set_word_pos(position);
    }

    /// Mutable state for scenario setup. Bypasses the change log.
    pub fn state_mut(&mut self) -> &mut GameState {
        &mut self.state
    }

    /// Recorded history.
    #[must_use]
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Display events so far.
    #[must_use]
    pub fn events(&self) -> &[DisplayEvent] {
        &self.events
    }

    /// Drain the display events.
    pub fn take_events(&mut self) -> Vec<DisplayEvent> {
        std::mem::take(&mut self.events)
    }

    /// Sounds played so far.
    #[must_use]
    pub fn sounds(&self) -> &[(SoundClip, PlayerId)] {
        &self.sounds
    }

    /// The remote player.
    pub fn remote_mut(&mut self) -> &mut R {
        &mut self.remote
    }

    /// Change log of the turn.
    #[must_use]
    pub const fn change_log(&self) -> &ChangeLog {
        &self.log
    }

    /// Undo every change made through this bridge.
    pub fn rollback(&mut self) -> Result<()> {
        self.log.rollback(&mut self.state)
    }

    /// Give up the state.
    #[must_use]
    pub fn into_state(self) -> GameState {
        self.state
    }
}

impl<R: RemotePlayer> Bridge for LocalBridge<R> {
    fn state(&self) -> &GameState {
        &self.state
    }

    fn apply_change(&mut self, change: Change) -> Result<()> {
        self.log.apply(change, &mut self.state)
    }

    fn roll_dice(&mut self, sides: u32, count: u32, player: PlayerId, annotation: &str) -> Result<Vec<u32>> {
        if sides == 0 {
            return Err(BattleError::InvalidState("dice need at least one side".into()));
        }
        let mut dice = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let value = match self.scripted_dice.pop_front() {
                Some(v) if v < sides => v,
                Some(v) => {
                    return Err(BattleError::InvalidState(format!(
                        "scripted die {v} out of range for {sides} sides"
                    )))
                }
                None => self.rng.gen_range(0..sides),
            };
            dice.push(value);
        }
        tracing::debug!(player = %player, ?dice, "{annotation}");
        Ok(dice)
    }

    fn history_event(&mut self, text: String, units: &[UnitId]) {
        self.history.push(HistoryEntry {
            text,
            units: units.to_vec(),
        });
    }

    fn notify(&mut self, event: DisplayEvent) {
        self.events.push(event);
    }

    fn play_sound(&mut self, clip: SoundClip, player: PlayerId) {
        self.sounds.push((clip, player));
    }

    fn remote(&mut self) -> &mut dyn RemotePlayer {
        &mut self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::UnitTypeRegistry;
    use crate::rules::BattleRules;

    fn create_test_bridge(seed: u64) -> LocalBridge<AutoPlayer> {
        LocalBridge::auto(GameState::new(BattleRules::default(), UnitTypeRegistry::new()), seed)
    }

    #[test]
    fn test_dice_in_range_and_seeded() {
        let mut a = create_test_bridge(7);
        let mut b = create_test_bridge(7);
        let da = a.roll_dice(6, 50, PlayerId(0), "test").unwrap();
        let db = b.roll_dice(6, 50, PlayerId(0), "test").unwrap();
        assert_eq!(da, db);
        assert!(da.iter().all(|&v| v < 6));
    }

    #[test]
    fn test_scripted_dice_first() {
        let mut bridge = create_test_bridge(1);
        bridge.queue_dice([5, 0]);
        let dice = bridge.roll_dice(6, 2, PlayerId(0), "test").unwrap();
        assert_eq!(dice, vec![5, 0]);
        bridge.queue_dice([9]);
        assert!(bridge.roll_dice(6, 1, PlayerId(0), "test").is_err());
    }

    #[test]
    fn test_restore_dice_position() {
        let mut a = create_test_bridge(3);
        a.roll_dice(6, 10, PlayerId(0), "warmup").unwrap();
        let position = a.dice_position();
        let next = a.roll_dice(6, 10, PlayerId(0), "after").unwrap();

        let mut b = create_test_bridge(99);
        b.restore_dice(3, position);
        assert_eq!(b.roll_dice(6, 10, PlayerId(0), "after").unwrap(), next);
    }

    #[test]
    fn test_auto_player_defaults() {
        let mut auto = AutoPlayer;
        let picked = auto
            .select_interceptors(PlayerId(0), BattleId(1), &[UnitId(1), UnitId(2)])
            .unwrap();
        assert_eq!(picked.len(), 2);
        let request = RetreatRequest {
            battle: BattleId(1),
            site: TerritoryId(0),
            submerge: false,
            options: vec![TerritoryId(1)],
            message: String::new(),
        };
        assert_eq!(auto.retreat_query(PlayerId(0), &request).unwrap(), None);
    }
}

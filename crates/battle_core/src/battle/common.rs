//! State and helpers shared by every battle variant.
//!
//! [`BattleCore`] holds identity, the force sets and the outcome of one
//! engagement. Units only ever move between the force sets through its
//! methods. [`FireState`] and [`fire_phase`] implement one firing group as
//! three resumable phases: roll, select casualties, notify and remove.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::bridge::{Bridge, DisplayEvent, SoundClip};
use crate::casualty::{select_casualties, CasualtyList};
use crate::change::{Change, UnitProperty};
use crate::dice::{DiceRoll, StrengthKind};
use crate::error::{BattleError, Result};
use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId, UnitTypeId};
use crate::matches;
use crate::records::BattleOutcome;
use crate::state::GameState;
use crate::tracker::BattleTracker;

// ============================================================================
// Identity and outcomes
// ============================================================================

/// Kind of engagement. Together with the site it keys the tracker registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BattleType {
    /// Land or sea combat.
    Normal,
    /// Air superiority battle ahead of a normal battle.
    AirBattle,
    /// Interception of a bombing raid.
    AirRaid,
    /// Strategic bombing.
    BombingRaid,
}

impl BattleType {
    /// Part of a bombing run.
    #[must_use]
    pub const fn is_bombing_run(self) -> bool {
        matches!(self, Self::AirRaid | Self::BombingRaid)
    }

    /// Fought as an air battle.
    #[must_use]
    pub const fn is_air_battle(self) -> bool {
        matches!(self, Self::AirBattle | Self::AirRaid)
    }
}

impl fmt::Display for BattleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Battle",
            Self::AirBattle => "Air Battle",
            Self::AirRaid => "Air Raid",
            Self::BombingRaid => "Bombing Raid",
        };
        f.write_str(name)
    }
}

/// Winner of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WhoWon {
    /// Still running.
    #[default]
    NotFinished,
    /// Nobody.
    Draw,
    /// Attacking side.
    Attacker,
    /// Defending side.
    Defender,
}

/// Classification of how a battle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BattleResultDescription {
    /// Territory taken.
    Conquered,
    /// Won, territory not taken.
    WonWithoutConquering,
    /// Won, but enemy units remain.
    WonWithEnemyLeft,
    /// Neither side prevailed.
    Stalemate,
    /// Attacker lost.
    Lost,
    /// Taken without a fight.
    Blitzed,
    /// Bombing damage dealt.
    Bombed,
    /// Air battle won.
    AirBattleWin,
    /// Air battle lost.
    AirBattleLost,
    /// Air battle undecided.
    AirBattleStalemate,
    /// Nothing was fought.
    NoBattle,
}

impl fmt::Display for BattleResultDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Conquered => "Conquered",
            Self::WonWithoutConquering => "Won without conquering",
            Self::WonWithEnemyLeft => "Won with enemy left",
            Self::Stalemate => "Stalemate",
            Self::Lost => "Lost",
            Self::Blitzed => "Blitzed",
            Self::Bombed => "Bombed",
            Self::AirBattleWin => "Air battle won",
            Self::AirBattleLost => "Air battle lost",
            Self::AirBattleStalemate => "Air battle stalemate",
            Self::NoBattle => "No battle",
        };
        f.write_str(text)
    }
}

/// One side of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Attacking side.
    Attacker,
    /// Defending side.
    Defender,
}

impl Side {
    /// The opposing side.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Attacker => Self::Defender,
            Self::Defender => Self::Attacker,
        }
    }

    /// Defending side.
    #[must_use]
    pub const fn is_defender(self) -> bool {
        matches!(self, Self::Defender)
    }
}

/// Which casualties still fire back in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnFire {
    /// Every casualty waits and fires back.
    All,
    /// Only submarine casualties fire back.
    Subs,
    /// Casualties are removed at once.
    None,
}

// ============================================================================
// Battle core
// ============================================================================

/// Identity, force sets and outcome of one battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleCore {
    /// Battle id.
    pub id: BattleId,
    /// Battle site.
    pub site: TerritoryId,
    /// Attacking player.
    pub attacker: PlayerId,
    /// Defending player.
    pub defender: PlayerId,
    /// Battle type.
    pub battle_type: BattleType,
    /// Site is a sea zone.
    pub water: bool,
    /// Current round, starting at 1.
    pub round: u32,
    /// Round limit (0 or less: unlimited).
    pub max_rounds: i32,
    /// Carrier or transport to the units it carries.
    pub dependent_units: BTreeMap<UnitId, Vec<UnitId>>,
    /// Unit value the attacking side lost.
    pub attacker_lost_tuv: u32,
    /// Unit value the defending side lost.
    pub defender_lost_tuv: u32,
    pub(crate) attacking_units: Vec<UnitId>,
    pub(crate) defending_units: Vec<UnitId>,
    pub(crate) attacking_waiting_to_die: Vec<UnitId>,
    pub(crate) defending_waiting_to_die: Vec<UnitId>,
    pub(crate) killed: Vec<UnitId>,
    pub(crate) attacking_retreated: Vec<UnitId>,
    pub(crate) defending_retreated: Vec<UnitId>,
    pub(crate) not_participating: Vec<UnitId>,
    pub(crate) starting_attackers: Vec<UnitId>,
    pub(crate) starting_defenders: Vec<UnitId>,
    is_over: bool,
    who_won: WhoWon,
    result: Option<BattleResultDescription>,
}

impl BattleCore {
    /// Create the core of a new battle with no units.
    pub fn new(
        id: BattleId,
        site: TerritoryId,
        attacker: PlayerId,
        defender: PlayerId,
        battle_type: BattleType,
        state: &GameState,
    ) -> Result<Self> {
        let water = state.territory(site)?.water;
        let max_rounds = match battle_type {
            BattleType::Normal => state.rules.max_rounds(water),
            BattleType::AirBattle | BattleType::AirRaid => state.rules.air_battle_rounds,
            BattleType::BombingRaid => 1,
        };
        Ok(Self {
            id,
            site,
            attacker,
            defender,
            battle_type,
            water,
            round: 1,
            max_rounds,
            dependent_units: BTreeMap::new(),
            attacker_lost_tuv: 0,
            defender_lost_tuv: 0,
            attacking_units: Vec::new(),
            defending_units: Vec::new(),
            attacking_waiting_to_die: Vec::new(),
            defending_waiting_to_die: Vec::new(),
            killed: Vec::new(),
            attacking_retreated: Vec::new(),
            defending_retreated: Vec::new(),
            not_participating: Vec::new(),
            starting_attackers: Vec::new(),
            starting_defenders: Vec::new(),
            is_over: false,
            who_won: WhoWon::NotFinished,
            result: None,
        })
    }

    /// Battle has ended.
    #[must_use]
    pub const fn is_over(&self) -> bool {
        self.is_over
    }

    /// Winner so far.
    #[must_use]
    pub const fn who_won(&self) -> WhoWon {
        self.who_won
    }

    /// Result classification, once over.
    #[must_use]
    pub const fn result(&self) -> Option<BattleResultDescription> {
        self.result
    }

    /// Attacking units still in the fight.
    #[must_use]
    pub fn attacking_units(&self) -> &[UnitId] {
        &self.attacking_units
    }

    /// Defending units still in the fight.
    #[must_use]
    pub fn defending_units(&self) -> &[UnitId] {
        &self.defending_units
    }

    /// Units hit this round that have not been removed yet.
    #[must_use]
    pub fn waiting_to_die(&self, side: Side) -> &[UnitId] {
        match side {
            Side::Attacker => &self.attacking_waiting_to_die,
            Side::Defender => &self.defending_waiting_to_die,
        }
    }

    /// Units removed by this battle.
    #[must_use]
    pub fn killed(&self) -> &[UnitId] {
        &self.killed
    }

    /// Units that retreated or submerged.
    #[must_use]
    pub fn retreated(&self, side: Side) -> &[UnitId] {
        match side {
            Side::Attacker => &self.attacking_retreated,
            Side::Defender => &self.defending_retreated,
        }
    }

    /// Units set aside as unable to fight here.
    #[must_use]
    pub fn not_participating(&self) -> &[UnitId] {
        &self.not_participating
    }

    /// Forces as they stood when fighting began.
    #[must_use]
    pub fn starting_units(&self, side: Side) -> &[UnitId] {
        match side {
            Side::Attacker => &self.starting_attackers,
            Side::Defender => &self.starting_defenders,
        }
    }

    /// Active units of a side.
    #[must_use]
    pub fn units(&self, side: Side) -> &[UnitId] {
        match side {
            Side::Attacker => &self.attacking_units,
            Side::Defender => &self.defending_units,
        }
    }

    /// Active and waiting-to-die units of a side: everything that may fire.
    #[must_use]
    pub fn firing_units(&self, side: Side) -> Vec<UnitId> {
        let mut units = self.units(side).to_vec();
        units.extend_from_slice(self.waiting_to_die(side));
        units
    }

    /// Player of a side.
    #[must_use]
    pub const fn player(&self, side: Side) -> PlayerId {
        match side {
            Side::Attacker => self.attacker,
            Side::Defender => self.defender,
        }
    }

    /// Round limit reached.
    #[must_use]
    pub fn max_rounds_reached(&self) -> bool {
        self.max_rounds > 0 && i64::from(self.round) >= i64::from(self.max_rounds)
    }

    /// Final figures once over.
    #[must_use]
    pub fn outcome(&self) -> Option<BattleOutcome> {
        self.result.map(|result| BattleOutcome {
            who_won: self.who_won,
            result,
            attacker_lost_tuv: self.attacker_lost_tuv,
            defender_lost_tuv: self.defender_lost_tuv,
        })
    }

    /// Title line for display.
    #[must_use]
    pub fn title(&self, state: &GameState) -> String {
        let name = |p: PlayerId| state.player(p).map_or_else(|_| p.to_string(), |p| p.name.clone());
        let site = state.territory(self.site).map_or_else(|_| self.site.to_string(), |t| t.name.clone());
        format!("{} in {}: {} attacks {}", self.battle_type, site, name(self.attacker), name(self.defender))
    }

    pub(crate) fn units_mut(&mut self, side: Side) -> &mut Vec<UnitId> {
        match side {
            Side::Attacker => &mut self.attacking_units,
            Side::Defender => &mut self.defending_units,
        }
    }

    /// Add units to a side if they are not there yet.
    pub(crate) fn add_units(&mut self, side: Side, units: &[UnitId]) {
        push_new(self.units_mut(side), units);
    }

    /// Capture the forces at the start of fighting.
    pub(crate) fn snapshot_starting_units(&mut self) {
        self.starting_attackers = self.attacking_units.clone();
        self.starting_defenders = self.defending_units.clone();
    }

    /// Drop units from every force set.
    pub(crate) fn remove_from_sets(&mut self, units: &[UnitId]) {
        for list in [
            &mut self.attacking_units,
            &mut self.defending_units,
            &mut self.attacking_waiting_to_die,
            &mut self.defending_waiting_to_die,
        ] {
            list.retain(|u| !units.contains(u));
        }
        for deps in self.dependent_units.values_mut() {
            deps.retain(|u| !units.contains(u));
        }
    }

    /// Move units out of the fight without removing them from the map.
    pub(crate) fn mark_retreated(&mut self, side: Side, units: &[UnitId]) {
        self.units_mut(side).retain(|u| !units.contains(u));
        let retreated = match side {
            Side::Attacker => &mut self.attacking_retreated,
            Side::Defender => &mut self.defending_retreated,
        };
        push_new(retreated, units);
    }

    /// Set units aside as unable to fight here.
    pub(crate) fn set_aside(&mut self, units: &[UnitId]) {
        self.attacking_units.retain(|u| !units.contains(u));
        self.defending_units.retain(|u| !units.contains(u));
        push_new(&mut self.not_participating, units);
    }

    fn wait_to_die(&mut self, side: Side, units: &[UnitId]) {
        self.units_mut(side).retain(|u| !units.contains(u));
        let waiting = match side {
            Side::Attacker => &mut self.attacking_waiting_to_die,
            Side::Defender => &mut self.defending_waiting_to_die,
        };
        push_new(waiting, units);
    }

    /// Units carried by (or unloaded this turn from) the given units.
    pub fn dependents_of(&self, units: &[UnitId], state: &GameState) -> Vec<UnitId> {
        let mut out: Vec<UnitId> = Vec::new();
        for u in units {
            if let Some(deps) = self.dependent_units.get(u) {
                out.extend(deps.iter().copied());
            }
        }
        for unit in state.units() {
            let carried = unit.transported_by.is_some_and(|t| units.contains(&t))
                || unit.unloaded_from.is_some_and(|t| units.contains(&t));
            if carried {
                out.push(unit.id);
            }
        }
        out.sort_unstable();
        out.dedup();
        out.retain(|u| !units.contains(u));
        out
    }

    /// Add unit cost to the losing side's tally.
    pub(crate) fn tally_losses(&mut self, units: &[UnitId], state: &GameState) -> Result<()> {
        for &id in units {
            let unit = state.unit(id)?;
            let cost = state.unit_types.get(unit.type_id)?.cost;
            if state.are_allied(unit.owner, self.attacker) {
                self.attacker_lost_tuv += cost;
            } else {
                self.defender_lost_tuv += cost;
            }
        }
        Ok(())
    }

    /// Remove units (and whatever they carry) from the map and the battle.
    ///
    /// Battles blocked by this one are told about every lost unit, so cargo
    /// that was about to land elsewhere is stripped from those battles too.
    /// Returns every unit lost.
    pub fn remove(
        &mut self,
        units: &[UnitId],
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<Vec<UnitId>> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        let mut lost = units.to_vec();
        lost.extend(self.dependents_of(units, bridge.state()));

        let site = self.site;
        let here: Vec<UnitId> = {
            let state = bridge.state();
            lost.iter()
                .copied()
                .filter(|&u| state.unit(u).is_ok_and(|unit| unit.location == site))
                .collect()
        };
        if !here.is_empty() {
            self.tally_losses(&here, bridge.state())?;
            let text = format!(
                "{} lost in {}",
                units_to_text(bridge.state(), &here),
                territory_name(bridge.state(), site)
            );
            bridge.history_event(text, &here);
            bridge.apply_change(Change::remove_units(&here))?;
        }
        self.remove_from_sets(&lost);
        push_new(&mut self.killed, &here);

        for blocked in tracker.get_blocked(self.id) {
            tracker.with_battle(blocked, |battle, tracker| {
                battle.units_lost_in_preceding_battle(&lost, false, tracker, bridge)
            })?;
        }
        Ok(lost)
    }

    /// Apply the return-fire rule to freshly chosen casualties of `side`.
    pub fn remove_casualties(
        &mut self,
        killed: &[UnitId],
        return_fire: ReturnFire,
        side: Side,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        if killed.is_empty() {
            return Ok(());
        }
        match return_fire {
            ReturnFire::All => self.wait_to_die(side, killed),
            ReturnFire::Subs => {
                let subs = bridge.state().filter_units(killed, matches::is_sub)?;
                let others: Vec<UnitId> = killed.iter().copied().filter(|u| !subs.contains(u)).collect();
                self.wait_to_die(side, &subs);
                self.remove(&others, tracker, bridge)?;
            }
            ReturnFire::None => {
                self.remove(killed, tracker, bridge)?;
            }
        }
        Ok(())
    }

    /// Remove everything waiting to die, then turn damaged survivors into
    /// their damaged type.
    pub fn clear_waiting_to_die(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let mut waiting = std::mem::take(&mut self.attacking_waiting_to_die);
        waiting.append(&mut self.defending_waiting_to_die);
        self.remove(&waiting, tracker, bridge)?;
        self.change_damaged_types(bridge)
    }

    fn change_damaged_types(&self, bridge: &mut dyn Bridge) -> Result<()> {
        let mut changes = Vec::new();
        {
            let state = bridge.state();
            for &id in self.attacking_units.iter().chain(&self.defending_units) {
                let unit = state.unit(id)?;
                if unit.hits == 0 {
                    continue;
                }
                if let Some(name) = &state.unit_types.get(unit.type_id)?.damaged_changes_into {
                    let damaged: UnitTypeId = state.unit_types.id_of(name)?;
                    changes.push(Change::set(id, UnitProperty::Type(damaged)));
                    changes.push(Change::set(id, UnitProperty::Hits(0)));
                }
            }
        }
        if changes.is_empty() {
            return Ok(());
        }
        bridge.apply_change(Change::Composite(changes))
    }

    /// End the battle and write its record.
    ///
    /// # Errors
    ///
    /// [`BattleError::InvariantViolation`] when the battle already ended.
    pub fn finish(
        &mut self,
        who_won: WhoWon,
        result: BattleResultDescription,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        self.mark_over()?;
        self.who_won = who_won;
        self.result = Some(result);
        tracker.records.add_result(
            self.id,
            BattleOutcome {
                who_won,
                result,
                attacker_lost_tuv: self.attacker_lost_tuv,
                defender_lost_tuv: self.defender_lost_tuv,
            },
        )?;
        match who_won {
            WhoWon::Defender => bridge.play_sound(SoundClip::BattleFailure, self.attacker),
            WhoWon::Draw => bridge.play_sound(SoundClip::BattleStalemate, self.attacker),
            WhoWon::Attacker | WhoWon::NotFinished => {}
        }
        let message = format!("{result}");
        bridge.history_event(
            format!("{} in {}: {message}", self.battle_type, territory_name(bridge.state(), self.site)),
            &[],
        );
        bridge.notify(DisplayEvent::BattleEnd {
            battle: self.id,
            message,
        });
        tracker.remove_battle(self.id);
        info!(
            battle = %self.id,
            site = %self.site,
            round = self.round,
            ?who_won,
            %result,
            attacker_lost_tuv = self.attacker_lost_tuv,
            defender_lost_tuv = self.defender_lost_tuv,
            "battle ended"
        );
        Ok(())
    }

    /// End the battle, dropping its record instead of writing a result.
    pub fn finish_without_record(
        &mut self,
        who_won: WhoWon,
        result: BattleResultDescription,
        tracker: &mut BattleTracker,
    ) -> Result<()> {
        self.mark_over()?;
        self.who_won = who_won;
        self.result = Some(result);
        tracker.records.remove(self.id);
        tracker.remove_battle(self.id);
        debug!(battle = %self.id, site = %self.site, %result, "battle closed without record");
        Ok(())
    }

    /// Flip the over flag, exactly once.
    pub(crate) fn mark_over(&mut self) -> Result<()> {
        if self.is_over {
            error!(battle = %self.id, "battle ended twice");
            return Err(BattleError::InvariantViolation(format!("{} ended twice", self.id)));
        }
        self.is_over = true;
        Ok(())
    }
}

// ============================================================================
// Firing
// ============================================================================

/// Strength a firing group uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FireKind {
    /// Attack or defence values.
    Normal,
    /// Air-battle values.
    AirBattle,
    /// Shore bombardment.
    Bombard,
    /// AA guns of one type.
    Aa {
        /// AA type name.
        aa_type: String,
    },
}

/// Where a firing group is in its resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirePhase {
    /// Dice not rolled yet.
    Roll,
    /// Dice rolled, casualties not chosen.
    SelectCasualties,
    /// Casualties chosen, not announced or removed.
    Notify,
}

/// One firing group in flight. Stored on the step stack between phases so a
/// suspended casualty query never causes a re-roll.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FireState {
    /// Side that fires.
    pub side: Side,
    /// Strength used.
    pub kind: FireKind,
    /// Firing units.
    pub firers: Vec<UnitId>,
    /// Units that may be hit.
    pub targets: Vec<UnitId>,
    /// Return-fire rule for the casualties.
    pub return_fire: ReturnFire,
    /// Step name shown to players.
    pub step_name: String,
    /// Current phase.
    pub phase: FirePhase,
    /// Dice, once rolled.
    pub dice: DiceRoll,
    /// Casualties, once chosen.
    pub casualties: CasualtyList,
}

impl FireState {
    /// A group about to roll.
    #[must_use]
    pub fn new(
        side: Side,
        kind: FireKind,
        firers: Vec<UnitId>,
        targets: Vec<UnitId>,
        return_fire: ReturnFire,
        step_name: impl Into<String>,
    ) -> Self {
        Self {
            side,
            kind,
            firers,
            targets,
            return_fire,
            step_name: step_name.into(),
            phase: FirePhase::Roll,
            dice: DiceRoll::default(),
            casualties: CasualtyList::new(),
        }
    }
}

/// Split firers into one group per suicide-on-hit type followed by the rest.
pub fn firing_groups(state: &GameState, firers: &[UnitId]) -> Result<Vec<Vec<UnitId>>> {
    let mut suicide: BTreeMap<UnitTypeId, Vec<UnitId>> = BTreeMap::new();
    let mut rest = Vec::new();
    for &id in firers {
        let unit = state.unit(id)?;
        let t = state.unit_types.get(unit.type_id)?;
        if matches::is_suicide_on_hit(unit, t) {
            suicide.entry(unit.type_id).or_default().push(id);
        } else {
            rest.push(id);
        }
    }
    let mut groups: Vec<Vec<UnitId>> = suicide.into_values().collect();
    if !rest.is_empty() {
        groups.push(rest);
    }
    Ok(groups)
}

/// Fire states for every group among `firers`, in firing order.
pub fn fire_states(
    state: &GameState,
    side: Side,
    kind: &FireKind,
    firers: &[UnitId],
    targets: &[UnitId],
    return_fire: ReturnFire,
    step_name: &str,
) -> Result<Vec<FireState>> {
    if firers.is_empty() || targets.is_empty() {
        return Ok(Vec::new());
    }
    Ok(firing_groups(state, firers)?
        .into_iter()
        .map(|group| FireState::new(side, kind.clone(), group, targets.to_vec(), return_fire, step_name))
        .collect())
}

/// Run one phase of a firing group. Returns the group in its next phase, or
/// `None` once it is done.
pub fn fire_phase(
    core: &mut BattleCore,
    mut fire: FireState,
    tracker: &mut BattleTracker,
    bridge: &mut dyn Bridge,
) -> Result<Option<FireState>> {
    match fire.phase {
        FirePhase::Roll => {
            {
                let state = bridge.state();
                fire.firers.retain(|&u| state.has_unit(u));
                fire.targets.retain(|&u| state.has_unit(u));
            }
            if fire.firers.is_empty() || fire.targets.is_empty() {
                return Ok(None);
            }
            let player = core.player(fire.side);
            let defending = fire.side.is_defender();
            fire.dice = match &fire.kind {
                FireKind::Normal => {
                    DiceRoll::roll_units(bridge, &fire.firers, defending, StrengthKind::Normal, player, &fire.step_name)?
                }
                FireKind::AirBattle => DiceRoll::roll_units(
                    bridge,
                    &fire.firers,
                    defending,
                    StrengthKind::AirBattle,
                    player,
                    &fire.step_name,
                )?,
                FireKind::Bombard => {
                    bridge.play_sound(SoundClip::Bombard, player);
                    DiceRoll::roll_units(bridge, &fire.firers, false, StrengthKind::Bombard, player, &fire.step_name)?
                }
                FireKind::Aa { .. } => {
                    let roll = DiceRoll::roll_aa(bridge, &fire.targets, &fire.firers, player, &fire.step_name)?;
                    let clip = if roll.hits > 0 { SoundClip::AaHit } else { SoundClip::AaMiss };
                    bridge.play_sound(clip, player);
                    roll
                }
            };
            debug!(battle = %core.id, step = %fire.step_name, hits = fire.dice.hits, "dice rolled");
            bridge.notify(DisplayEvent::Dice {
                battle: core.id,
                step: fire.step_name.clone(),
                player,
                dice: fire.dice.values(),
                hits: fire.dice.hits,
            });
            fire.phase = FirePhase::SelectCasualties;
            Ok(Some(fire))
        }
        FirePhase::SelectCasualties => {
            if fire.dice.hits == 0 {
                return Ok(None);
            }
            let victim = core.player(fire.side.other());
            let transports_last = bridge.state().rules.transport_casualties_restricted;
            let casualties = select_casualties(
                bridge,
                victim,
                core.id,
                &fire.step_name,
                &fire.targets,
                fire.dice.hits,
                transports_last,
            )?;
            apply_damage(bridge, &casualties)?;
            fire.casualties = casualties;
            fire.phase = FirePhase::Notify;
            Ok(Some(fire))
        }
        FirePhase::Notify => {
            let victim_side = fire.side.other();
            bridge.notify(DisplayEvent::Casualties {
                battle: core.id,
                step: fire.step_name.clone(),
                player: core.player(victim_side),
                killed: fire.casualties.killed.clone(),
                damaged: fire.casualties.damaged.clone(),
            });
            core.remove_casualties(&fire.casualties.killed, fire.return_fire, victim_side, tracker, bridge)?;

            let suicide_group = bridge.state().any_unit(&fire.firers, matches::is_suicide_on_hit)?;
            if suicide_group && fire.dice.hits > 0 {
                let mut spent = fire.dice.hitting_units();
                if spent.is_empty() {
                    spent = fire.firers.iter().copied().take(fire.dice.hits as usize).collect();
                }
                bridge.notify(DisplayEvent::DeadUnits {
                    battle: core.id,
                    units: spent.clone(),
                });
                core.remove(&spent, tracker, bridge)?;
            }
            Ok(None)
        }
    }
}

/// Record hits on damaged units that survive.
fn apply_damage(bridge: &mut dyn Bridge, casualties: &CasualtyList) -> Result<()> {
    let mut counts: BTreeMap<UnitId, u32> = BTreeMap::new();
    for &u in &casualties.damaged {
        if !casualties.killed.contains(&u) {
            *counts.entry(u).or_default() += 1;
        }
    }
    if counts.is_empty() {
        return Ok(());
    }
    let mut changes = Vec::with_capacity(counts.len());
    for (unit, hits) in counts {
        let current = bridge.state().unit(unit)?.hits;
        changes.push(Change::set(unit, UnitProperty::Hits(current + hits)));
    }
    bridge.history_event(
        format!("Units damaged: {}", units_to_text(bridge.state(), &casualties.damaged)),
        &casualties.damaged,
    );
    bridge.apply_change(Change::Composite(changes))
}

// ============================================================================
// Helpers
// ============================================================================

/// Player who defends `site` against `attacker`.
///
/// The territory owner when at war with the attacker, otherwise the enemy
/// owning the most units there (lower id on ties), otherwise the owner.
pub fn determine_defender(state: &GameState, site: TerritoryId, attacker: PlayerId) -> Result<PlayerId> {
    let territory = state.territory(site)?;
    if let Some(owner) = territory.owner {
        if state.at_war(owner, attacker) {
            return Ok(owner);
        }
    }
    let mut counts: BTreeMap<PlayerId, usize> = BTreeMap::new();
    for id in state.units_at(site) {
        let unit = state.unit(id)?;
        if state.at_war(unit.owner, attacker) {
            *counts.entry(unit.owner).or_default() += 1;
        }
    }
    let mut best: Option<(PlayerId, usize)> = None;
    for (player, count) in counts {
        if best.map_or(true, |(_, most)| count > most) {
            best = Some((player, count));
        }
    }
    Ok(best.map(|(p, _)| p).or(territory.owner).unwrap_or(attacker))
}

/// Append the units not already in `list`.
pub(crate) fn push_new(list: &mut Vec<UnitId>, units: &[UnitId]) {
    for &u in units {
        if !list.contains(&u) {
            list.push(u);
        }
    }
}

/// "2 infantry, 1 armour".
#[must_use]
pub fn units_to_text(state: &GameState, units: &[UnitId]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for &id in units {
        if let Ok(t) = state.unit_type(id) {
            *counts.entry(t.name.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(name, n)| format!("{n} {name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Territory name, or its id when unknown.
#[must_use]
pub fn territory_name(state: &GameState, territory: TerritoryId) -> String {
    state
        .territory(territory)
        .map_or_else(|_| territory.to_string(), |t| t.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Domain, UnitTrait, UnitType, UnitTypeRegistry};
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    fn create_test_state() -> GameState {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        types.register(UnitType::new("kamikaze", Domain::Air, 4, 3, 0).with_trait(UnitTrait::SuicideOnHit));
        let mut state = GameState::new(BattleRules::default(), types);
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        state.add_player(Player::new(PlayerId(2), "Green", 2));
        let mut land = Territory::new(TerritoryId(0), "Plain", false);
        land.owner = Some(PlayerId(0));
        state.add_territory(land);
        state
    }

    #[test]
    fn test_determine_defender_prefers_enemy_owner() {
        let mut state = create_test_state();
        assert_eq!(determine_defender(&state, TerritoryId(0), PlayerId(1)).unwrap(), PlayerId(0));

        // Own territory: the enemy with most units defends.
        state.spawn_unit("infantry", PlayerId(1), TerritoryId(0)).unwrap();
        state.spawn_unit("infantry", PlayerId(2), TerritoryId(0)).unwrap();
        state.spawn_unit("infantry", PlayerId(2), TerritoryId(0)).unwrap();
        assert_eq!(determine_defender(&state, TerritoryId(0), PlayerId(0)).unwrap(), PlayerId(2));
    }

    #[test]
    fn test_firing_groups_put_suicide_on_hit_first() {
        let mut state = create_test_state();
        let a = state.spawn_unit("infantry", PlayerId(0), TerritoryId(0)).unwrap();
        let b = state.spawn_unit("kamikaze", PlayerId(0), TerritoryId(0)).unwrap();
        let groups = firing_groups(&state, &[a, b]).unwrap();
        assert_eq!(groups, vec![vec![b], vec![a]]);
    }

    #[test]
    fn test_battle_type_keys() {
        assert!(BattleType::AirRaid.is_bombing_run());
        assert!(BattleType::BombingRaid.is_bombing_run());
        assert!(!BattleType::AirBattle.is_bombing_run());
        assert!(BattleType::AirBattle.is_air_battle());
    }

    #[test]
    fn test_mark_over_once() {
        let state = create_test_state();
        let mut core =
            BattleCore::new(BattleId(1), TerritoryId(0), PlayerId(1), PlayerId(0), BattleType::Normal, &state).unwrap();
        core.mark_over().unwrap();
        assert!(matches!(core.mark_over(), Err(BattleError::InvariantViolation(_))));
    }

    #[test]
    fn test_units_to_text() {
        let mut state = create_test_state();
        let a = state.spawn_unit("infantry", PlayerId(0), TerritoryId(0)).unwrap();
        let b = state.spawn_unit("infantry", PlayerId(0), TerritoryId(0)).unwrap();
        assert_eq!(units_to_text(&state, &[a, b]), "2 infantry");
    }
}

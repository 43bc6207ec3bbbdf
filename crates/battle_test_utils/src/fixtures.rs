//! Test fixtures and helpers.
//!
//! Pre-built maps, unit types and forces for consistent testing. The
//! helpers panic on setup mistakes; they are for tests only.

use battle_core::battle::BattleType;
use battle_core::bridge::{AutoPlayer, LocalBridge, RemotePlayer};
use battle_core::data::UnitTypeRegistry;
use battle_core::delegate::BattleDelegate;
use battle_core::error::{BattleError, Result};
use battle_core::ids::{PlayerId, TerritoryId, UnitId};
use battle_core::route::Route;
use battle_core::rules::BattleRules;
use battle_core::state::{GameState, Player, Territory};
use battle_core::tracker::AttackMove;

/// The attacking player in every fixture.
pub const RED: PlayerId = PlayerId(0);
/// The defending player in every fixture.
pub const BLUE: PlayerId = PlayerId(1);

/// Unit types shared by the fixtures.
pub const STANDARD_UNITS_RON: &str = r#"(types: [
    (name: "infantry", domain: Land, cost: 3, attack: 1, defense: 2),
    (name: "artillery", domain: Land, cost: 4, attack: 2, defense: 2),
    (name: "armour", domain: Land, cost: 5, attack: 3, defense: 3),
    (name: "fighter", domain: Air, cost: 10, attack: 3, defense: 4, movement: 4,
        carrier_cost: 1, air_attack: 1, air_defense: 1,
        traits: [Interceptor, AirBattle, Scrambler]),
    (name: "bomber", domain: Air, cost: 12, attack: 4, defense: 1, movement: 6,
        air_attack: 1, traits: [StrategicBomber, AirBattle]),
    (name: "destroyer", domain: Sea, cost: 8, attack: 2, defense: 2, movement: 2,
        traits: [Destroyer]),
    (name: "submarine", domain: Sea, cost: 6, attack: 2, defense: 1, movement: 2,
        traits: [Submarine]),
    (name: "transport", domain: Sea, cost: 7, attack: 0, defense: 0, movement: 2,
        transport_capacity: 5),
    (name: "cruiser", domain: Sea, cost: 12, attack: 3, defense: 3, movement: 2,
        bombard: Some(3)),
    (name: "battleship", domain: Sea, cost: 20, attack: 4, defense: 4, movement: 2,
        hit_points: 2, bombard: Some(4)),
    (name: "carrier", domain: Sea, cost: 14, attack: 1, defense: 2, movement: 2,
        carrier_capacity: 2),
    (name: "factory", domain: Land, cost: 15, attack: 0, defense: 0, movement: 0,
        max_damage: 20, traits: [Infrastructure, Capturable]),
])"#;

/// Unit types used by every fixture.
///
/// # Panics
///
/// Panics if the embedded RON is malformed.
#[must_use]
pub fn standard_unit_types() -> UnitTypeRegistry {
    UnitTypeRegistry::from_ron_str(STANDARD_UNITS_RON).expect("embedded unit types parse")
}

/// Game state with the standard unit types, Red and Blue at war, Red to move.
#[must_use]
pub fn two_player_state(rules: BattleRules) -> GameState {
    let mut state = GameState::new(rules, standard_unit_types());
    state.add_player(Player::new(RED, "Red", 0));
    state.add_player(Player::new(BLUE, "Blue", 1));
    state.current_player = Some(RED);
    state
}

/// Add a land territory with an owner.
pub fn add_land(state: &mut GameState, id: u32, name: &str, owner: Option<PlayerId>) -> TerritoryId {
    let id = TerritoryId(id);
    let mut territory = Territory::new(id, name, false);
    territory.owner = owner;
    territory.original_owner = owner;
    state.add_territory(territory);
    id
}

/// Add a sea zone.
pub fn add_sea(state: &mut GameState, id: u32, name: &str) -> TerritoryId {
    let id = TerritoryId(id);
    state.add_territory(Territory::new(id, name, true));
    id
}

/// Spawn `count` units of one type.
///
/// # Panics
///
/// Panics on an unknown type, owner or territory.
pub fn spawn(state: &mut GameState, type_name: &str, owner: PlayerId, at: TerritoryId, count: usize) -> Vec<UnitId> {
    (0..count)
        .map(|_| state.spawn_unit(type_name, owner, at).expect("fixture unit spawns"))
        .collect()
}

/// Spawn a whole force given as `(type, count)` pairs.
pub fn spawn_force(state: &mut GameState, force: &[(&str, usize)], owner: PlayerId, at: TerritoryId) -> Vec<UnitId> {
    force
        .iter()
        .flat_map(|&(name, count)| spawn(state, name, owner, at, count))
        .collect()
}

// ============================================================================
// Single-battle fixture
// ============================================================================

/// One attack from a staging territory into a defended site.
#[derive(Debug, Clone)]
pub struct BattleFixture {
    /// Game state with both forces placed.
    pub state: GameState,
    /// Where the attack came from.
    pub from: TerritoryId,
    /// Battle site.
    pub site: TerritoryId,
    /// Red units at the site.
    pub attackers: Vec<UnitId>,
    /// Blue units at the site.
    pub defenders: Vec<UnitId>,
}

impl BattleFixture {
    /// Land attack from "Staging" (Red) into "Frontier" (Blue).
    ///
    /// # Panics
    ///
    /// Panics on an unknown unit type.
    #[must_use]
    pub fn land(rules: BattleRules, attackers: &[(&str, usize)], defenders: &[(&str, usize)]) -> Self {
        let mut state = two_player_state(rules);
        let from = add_land(&mut state, 0, "Staging", Some(RED));
        let site = add_land(&mut state, 1, "Frontier", Some(BLUE));
        state.connect(from, site).expect("fixture territories connect");
        Self::place(state, from, site, attackers, defenders)
    }

    /// Naval attack from "North Sea" into "Channel".
    ///
    /// # Panics
    ///
    /// Panics on an unknown unit type.
    #[must_use]
    pub fn sea(rules: BattleRules, attackers: &[(&str, usize)], defenders: &[(&str, usize)]) -> Self {
        let mut state = two_player_state(rules);
        let from = add_sea(&mut state, 0, "North Sea");
        let site = add_sea(&mut state, 1, "Channel");
        state.connect(from, site).expect("fixture sea zones connect");
        Self::place(state, from, site, attackers, defenders)
    }

    fn place(
        mut state: GameState,
        from: TerritoryId,
        site: TerritoryId,
        attackers: &[(&str, usize)],
        defenders: &[(&str, usize)],
    ) -> Self {
        let defenders = spawn_force(&mut state, defenders, BLUE, site);
        let attackers = spawn_force(&mut state, attackers, RED, site);
        Self {
            state,
            from,
            site,
            attackers,
            defenders,
        }
    }

    /// The combat move that brought the attackers in.
    #[must_use]
    pub fn attack(&self) -> AttackMove {
        AttackMove::new(Route::single(self.from, self.site), self.attackers.clone(), RED)
    }

    /// Bridge over a copy of the state, answering with `remote`.
    #[must_use]
    pub fn bridge_with<R: RemotePlayer>(&self, seed: u64, remote: R) -> LocalBridge<R> {
        LocalBridge::new(self.state.clone(), seed, remote)
    }

    /// Bridge over a copy of the state with default answers.
    #[must_use]
    pub fn bridge(&self, seed: u64) -> LocalBridge<AutoPlayer> {
        LocalBridge::auto(self.state.clone(), seed)
    }

    /// Delegate with the attack registered.
    ///
    /// # Errors
    ///
    /// Propagates tracker errors.
    pub fn delegate<R: RemotePlayer>(&self, bridge: &mut LocalBridge<R>) -> Result<BattleDelegate> {
        let mut delegate = BattleDelegate::new();
        delegate.add_attack(&self.attack(), bridge)?;
        Ok(delegate)
    }
}

/// Drive a battle phase to completion: start, fight every battle in
/// dependency order, end.
///
/// # Errors
///
/// Propagates the first error, including suspensions.
pub fn play_battle_phase<R: RemotePlayer>(delegate: &mut BattleDelegate, bridge: &mut LocalBridge<R>) -> Result<()> {
    delegate.start(bridge)?;
    while delegate.requires_user_input() {
        let Some((site, battle_type)) = delegate.next_battle() else {
            return Err(BattleError::InvariantViolation(
                "battles are pending but none can be fought".into(),
            ));
        };
        if delegate.current_battle().is_some() {
            delegate.fight_current_battle(bridge)?;
        } else {
            delegate.fight_battle(site, battle_type, bridge)?;
        }
    }
    delegate.end(bridge)
}

/// Resume after a suspension until the phase completes.
///
/// # Errors
///
/// Propagates any error other than a suspension, or gives up after
/// `max_resumes` suspensions.
pub fn play_until_done<R: RemotePlayer>(
    delegate: &mut BattleDelegate,
    bridge: &mut LocalBridge<R>,
    max_resumes: usize,
) -> Result<usize> {
    let mut resumes = 0;
    loop {
        match play_battle_phase(delegate, bridge) {
            Ok(()) => return Ok(resumes),
            Err(e) if e.is_suspension() && resumes < max_resumes => resumes += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Pending normal battle at the fixture site, if any.
#[must_use]
pub fn pending_normal(delegate: &BattleDelegate, site: TerritoryId) -> Option<&battle_core::battle::Battle> {
    delegate.tracker().get_pending_battle(site, BattleType::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_types_parse() {
        let types = standard_unit_types();
        assert!(types.id_of("battleship").is_ok());
        assert_eq!(types.get(types.id_of("battleship").unwrap()).unwrap().hit_points, 2);
        assert!(types.get(types.id_of("transport").unwrap()).unwrap().is_non_combat_transport());
    }

    #[test]
    fn test_land_fixture() {
        let fixture = BattleFixture::land(BattleRules::default(), &[("infantry", 2), ("armour", 1)], &[("infantry", 2)]);
        assert_eq!(fixture.attackers.len(), 3);
        assert_eq!(fixture.defenders.len(), 2);
        assert_eq!(fixture.state.units_at(fixture.site).len(), 5);
        assert!(fixture.state.at_war(RED, BLUE));
    }

    #[test]
    fn test_play_battle_phase_records_result() {
        let fixture = BattleFixture::land(BattleRules::default(), &[("armour", 4)], &[("infantry", 1)]);
        let mut bridge = fixture.bridge(3);
        let mut delegate = fixture.delegate(&mut bridge).unwrap();
        play_battle_phase(&mut delegate, &mut bridge).unwrap();
        assert_eq!(delegate.statistics().len(), 1);
        assert!(delegate.tracker().has_no_pending_battles());
    }
}

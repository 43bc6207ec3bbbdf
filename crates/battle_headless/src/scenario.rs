//! Scenario loading and configuration.
//!
//! A scenario is the board as the movement phase left it: the map, the
//! players, every unit where it stands, and the combat moves that brought
//! the attackers in. Loading one yields a [`GameState`] and the
//! [`AttackMove`]s to report to the battle delegate.

use std::collections::BTreeMap;
use std::path::Path;

use battle_core::data::UnitTypeRegistry;
use battle_core::error::BattleError;
use battle_core::ids::{PlayerId, TerritoryId, UnitId};
use battle_core::route::Route;
use battle_core::rules::BattleRules;
use battle_core::state::{GameState, Player, Territory};
use battle_core::tracker::AttackMove;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Error type for scenario operations.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// File not found.
    #[error("Scenario file not found: {0}")]
    FileNotFound(String),
    /// Failed to read file.
    #[error("Failed to read scenario file: {0}")]
    ReadError(#[from] std::io::Error),
    /// Failed to parse RON.
    #[error("Failed to parse scenario: {0}")]
    ParseError(#[from] ron::error::SpannedError),
    /// A move names a unit tag no placement defines.
    #[error("Move references unknown unit tag '{0}'")]
    UnknownTag(String),
    /// A move has no destination.
    #[error("Move {0} has an empty route")]
    EmptyRoute(usize),
    /// The engine rejected the setup.
    #[error(transparent)]
    Engine(#[from] BattleError),
    /// Built-in scenario name not recognised.
    #[error("Unknown built-in scenario '{0}'")]
    UnknownBuiltin(String),
}

/// Two-front skirmish: a land assault and a naval clash in the same turn.
pub const SKIRMISH_RON: &str = r#"Scenario(
    name: "skirmish",
    description: "Red assaults the Frontier and engages the Blue fleet in the Channel",
    attacker: 0,
    unit_types: (types: [
        (name: "infantry", domain: Land, cost: 3, attack: 1, defense: 2),
        (name: "artillery", domain: Land, cost: 4, attack: 2, defense: 2),
        (name: "armour", domain: Land, cost: 5, attack: 3, defense: 3),
        (name: "destroyer", domain: Sea, cost: 8, attack: 2, defense: 2, movement: 2, traits: [Destroyer]),
        (name: "submarine", domain: Sea, cost: 6, attack: 2, defense: 1, movement: 2, traits: [Submarine]),
        (name: "cruiser", domain: Sea, cost: 12, attack: 3, defense: 3, movement: 2, bombard: Some(3)),
        (name: "transport", domain: Sea, cost: 7, attack: 0, defense: 0, movement: 2, transport_capacity: 5),
    ]),
    players: [
        (id: 0, name: "Red", alliance: 0),
        (id: 1, name: "Blue", alliance: 1),
    ],
    territories: [
        (id: 0, name: "Staging", owner: Some(0)),
        (id: 1, name: "Frontier", owner: Some(1), production: 3),
        (id: 2, name: "North Sea", water: true),
        (id: 3, name: "Channel", water: true),
    ],
    connections: [(0, 1), (0, 2), (2, 3), (1, 3)],
    forces: [
        (kind: "infantry", owner: 1, at: 1, count: 4),
        (kind: "artillery", owner: 1, at: 1, count: 1),
        (kind: "infantry", owner: 0, at: 1, count: 3, tag: Some("assault")),
        (kind: "artillery", owner: 0, at: 1, count: 2, tag: Some("assault")),
        (kind: "armour", owner: 0, at: 1, count: 2, tag: Some("assault")),
        (kind: "destroyer", owner: 1, at: 3, count: 1),
        (kind: "cruiser", owner: 1, at: 3, count: 1),
        (kind: "transport", owner: 1, at: 3, count: 1),
        (kind: "submarine", owner: 0, at: 3, count: 2, tag: Some("wolfpack")),
        (kind: "destroyer", owner: 0, at: 3, count: 1, tag: Some("wolfpack")),
    ],
    moves: [
        (route: [0, 1], units: ["assault"]),
        (route: [2, 3], units: ["wolfpack"]),
    ],
)"#;

/// A complete scenario configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Rule variants; omitted fields keep their defaults.
    #[serde(default)]
    pub rules: BattleRules,
    /// Unit types available on this board.
    pub unit_types: UnitTypeRegistry,
    /// Player whose battle phase is played.
    pub attacker: u32,
    /// Players and their alliances.
    pub players: Vec<PlayerSetup>,
    /// Territories and sea zones.
    pub territories: Vec<TerritorySetup>,
    /// Undirected adjacencies.
    #[serde(default)]
    pub connections: Vec<(u32, u32)>,
    /// Units on the board.
    #[serde(default)]
    pub forces: Vec<Placement>,
    /// Combat moves made this turn.
    #[serde(default)]
    pub moves: Vec<MoveSetup>,
}

/// One player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSetup {
    /// Player id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Players sharing an alliance are allied; all others are at war.
    pub alliance: u32,
    /// Starting PUs.
    #[serde(default)]
    pub pus: i64,
}

/// One territory or sea zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerritorySetup {
    /// Territory id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Sea zone.
    #[serde(default)]
    pub water: bool,
    /// Current (and original) owner.
    #[serde(default)]
    pub owner: Option<u32>,
    /// Player whose capital this is.
    #[serde(default)]
    pub capital_of: Option<u32>,
    /// Production value.
    #[serde(default)]
    pub production: u32,
}

/// Units of one type placed at one territory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    /// Unit type name.
    pub kind: String,
    /// Owning player.
    pub owner: u32,
    /// Territory id.
    pub at: u32,
    /// Number of units.
    pub count: u32,
    /// Group name moves refer to.
    #[serde(default)]
    pub tag: Option<String>,
}

/// A combat move, by route and unit tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveSetup {
    /// Start territory followed by every step.
    pub route: Vec<u32>,
    /// Tags of the units that moved.
    pub units: Vec<String>,
    /// Moving player; the scenario attacker when omitted.
    #[serde(default)]
    pub player: Option<u32>,
    /// Strategic bombing move.
    #[serde(default)]
    pub bombing: bool,
}

impl Scenario {
    /// Load a scenario from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_ron_str(&contents)
    }

    /// Load from a RON string (useful for embedded scenarios).
    pub fn from_ron_str(ron: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = ron::from_str(ron)?;
        Ok(scenario)
    }

    /// A built-in scenario by name.
    pub fn builtin(name: &str) -> Result<Self, ScenarioError> {
        match name {
            "skirmish" => Self::from_ron_str(SKIRMISH_RON),
            other => Err(ScenarioError::UnknownBuiltin(other.to_string())),
        }
    }

    /// A file path if one exists, otherwise a built-in name.
    pub fn resolve(name_or_path: &str) -> Result<Self, ScenarioError> {
        if Path::new(name_or_path).exists() {
            Self::load(name_or_path)
        } else {
            Self::builtin(name_or_path)
        }
    }

    /// Lay out the board and translate the moves.
    pub fn build(&self) -> Result<(GameState, Vec<AttackMove>), ScenarioError> {
        let mut state = GameState::new(self.rules.clone(), self.unit_types.clone());
        for p in &self.players {
            let mut player = Player::new(PlayerId(p.id), p.name.clone(), p.alliance);
            player.pus = p.pus;
            state.add_player(player);
        }
        state.current_player = Some(PlayerId(self.attacker));

        for t in &self.territories {
            let mut territory = Territory::new(TerritoryId(t.id), t.name.clone(), t.water);
            territory.owner = t.owner.map(PlayerId);
            territory.original_owner = territory.owner;
            territory.capital_of = t.capital_of.map(PlayerId);
            territory.production = t.production;
            state.add_territory(territory);
        }
        for &(a, b) in &self.connections {
            state.connect(TerritoryId(a), TerritoryId(b))?;
        }

        let mut tagged: BTreeMap<&str, Vec<UnitId>> = BTreeMap::new();
        for placement in &self.forces {
            for _ in 0..placement.count {
                let id = state.spawn_unit(&placement.kind, PlayerId(placement.owner), TerritoryId(placement.at))?;
                if let Some(tag) = &placement.tag {
                    tagged.entry(tag.as_str()).or_default().push(id);
                }
            }
        }

        let mut moves = Vec::with_capacity(self.moves.len());
        for (i, m) in self.moves.iter().enumerate() {
            let Some((&start, steps)) = m.route.split_first() else {
                return Err(ScenarioError::EmptyRoute(i));
            };
            if steps.is_empty() {
                return Err(ScenarioError::EmptyRoute(i));
            }
            let mut units = Vec::new();
            for tag in &m.units {
                let ids = tagged
                    .get(tag.as_str())
                    .ok_or_else(|| ScenarioError::UnknownTag(tag.clone()))?;
                units.extend(ids.iter().copied());
            }
            let route = Route::new(TerritoryId(start), steps.iter().copied().map(TerritoryId).collect());
            let mut attack = AttackMove::new(route, units, PlayerId(m.player.unwrap_or(self.attacker)));
            attack.bombing = m.bombing;
            moves.push(attack);
        }

        debug!(
            scenario = %self.name,
            territories = self.territories.len(),
            units = state.units().count(),
            moves = moves.len(),
            "scenario built"
        );
        Ok((state, moves))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_skirmish() {
        let scenario = Scenario::builtin("skirmish").unwrap();
        assert_eq!(scenario.players.len(), 2);
        assert_eq!(scenario.moves.len(), 2);
        assert_eq!(scenario.rules, BattleRules::default());
    }

    #[test]
    fn test_build_places_units_and_moves() {
        let (state, moves) = Scenario::builtin("skirmish").unwrap().build().unwrap();
        assert_eq!(state.units_at(TerritoryId(1)).len(), 12);
        assert_eq!(state.units_at(TerritoryId(3)).len(), 6);
        assert_eq!(moves[0].units.len(), 7);
        assert_eq!(moves[0].route.end(), TerritoryId(1));
        assert_eq!(moves[1].player, PlayerId(0));
        assert!(state.at_war(PlayerId(0), PlayerId(1)));
    }

    #[test]
    fn test_unknown_tag() {
        let mut scenario = Scenario::builtin("skirmish").unwrap();
        scenario.moves[0].units.push("ghosts".into());
        assert!(matches!(scenario.build(), Err(ScenarioError::UnknownTag(t)) if t == "ghosts"));
    }

    #[test]
    fn test_parse_from_ron() {
        let ron = r#"
            Scenario(
                name: "Test",
                attacker: 0,
                unit_types: (types: []),
                players: [(id: 0, name: "Red", alliance: 0)],
                territories: [(id: 0, name: "Home")],
                rules: (low_luck: true),
            )
        "#;
        let scenario = Scenario::from_ron_str(ron).unwrap();
        assert_eq!(scenario.name, "Test");
        assert!(scenario.rules.low_luck);
        assert!(scenario.moves.is_empty());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Scenario::load("/definitely/not/here.ron"),
            Err(ScenarioError::FileNotFound(_))
        ));
    }
}

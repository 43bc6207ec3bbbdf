//! Unit predicates shared by the battle variants.
//!
//! Plain functions over `(&Unit, &UnitType)` so they plug straight into
//! [`GameState::filter_units`](crate::state::GameState::filter_units).

use crate::data::{Domain, UnitTrait, UnitType};
use crate::ids::{PlayerId, UnitId};
use crate::state::{GameState, Unit};

/// Aircraft.
pub fn is_air(_: &Unit, t: &UnitType) -> bool {
    t.is_air()
}

/// Not an aircraft.
pub fn is_not_air(_: &Unit, t: &UnitType) -> bool {
    !t.is_air()
}

/// Ship.
pub fn is_sea(_: &Unit, t: &UnitType) -> bool {
    t.is_sea()
}

/// Ground unit.
pub fn is_land(_: &Unit, t: &UnitType) -> bool {
    t.is_land()
}

/// Not a ground unit.
pub fn is_not_land(_: &Unit, t: &UnitType) -> bool {
    !t.is_land()
}

/// Submarine.
pub fn is_sub(_: &Unit, t: &UnitType) -> bool {
    t.is_sub()
}

/// Not a submarine.
pub fn is_not_sub(_: &Unit, t: &UnitType) -> bool {
    !t.is_sub()
}

/// Destroyer.
pub fn is_destroyer(_: &Unit, t: &UnitType) -> bool {
    t.is_destroyer()
}

/// Infrastructure.
pub fn is_infrastructure(_: &Unit, t: &UnitType) -> bool {
    t.is_infrastructure()
}

/// Counts as a combat unit.
pub fn is_not_infrastructure(_: &Unit, t: &UnitType) -> bool {
    !t.is_infrastructure()
}

/// Sea transport without combat value.
pub fn is_non_combat_transport(_: &Unit, t: &UnitType) -> bool {
    t.is_non_combat_transport()
}

/// Fires once and dies.
pub fn is_suicide(_: &Unit, t: &UnitType) -> bool {
    t.has(UnitTrait::Suicide)
}

/// Not a suicide unit.
pub fn is_not_suicide(_: &Unit, t: &UnitType) -> bool {
    !t.has(UnitTrait::Suicide)
}

/// Removed once it scores a hit.
pub fn is_suicide_on_hit(_: &Unit, t: &UnitType) -> bool {
    t.has(UnitTrait::SuicideOnHit)
}

/// Strategic bomber.
pub fn is_strategic_bomber(_: &Unit, t: &UnitType) -> bool {
    t.has(UnitTrait::StrategicBomber)
}

/// May intercept raids.
pub fn can_intercept(u: &Unit, t: &UnitType) -> bool {
    t.is_air() && t.has(UnitTrait::Interceptor) && !u.was_in_air_battle
}

/// May fight in an air battle.
pub fn can_air_battle(u: &Unit, t: &UnitType) -> bool {
    t.is_air() && t.has(UnitTrait::AirBattle) && !u.was_in_air_battle
}

/// May escort a raid into an air battle.
pub fn can_escort(u: &Unit, t: &UnitType) -> bool {
    t.is_air() && (t.has(UnitTrait::AirBattle) || t.has(UnitTrait::Interceptor)) && !u.was_in_air_battle
}

/// Anti-aircraft gun.
pub fn is_aa(_: &Unit, t: &UnitType) -> bool {
    t.is_aa()
}

/// Can absorb bombing damage.
pub fn can_be_damaged(_: &Unit, t: &UnitType) -> bool {
    t.can_be_damaged()
}

/// Shore bombardment capable.
pub fn can_bombard(_: &Unit, t: &UnitType) -> bool {
    t.is_sea() && t.bombard.is_some()
}

/// Changes hands on capture.
pub fn is_capturable(_: &Unit, t: &UnitType) -> bool {
    t.has(UnitTrait::Capturable)
}

/// Carrier.
pub fn is_carrier(_: &Unit, t: &UnitType) -> bool {
    t.is_carrier()
}

/// Air that can land on a carrier.
pub fn can_land_on_carrier(_: &Unit, t: &UnitType) -> bool {
    t.can_land_on_carrier()
}

/// Scramble-capable air.
pub fn can_scramble(u: &Unit, t: &UnitType) -> bool {
    t.is_air() && t.has(UnitTrait::Scrambler) && !u.was_scrambled
}

/// Airbase.
pub fn is_airbase(_: &Unit, t: &UnitType) -> bool {
    t.has(UnitTrait::Airbase)
}

/// Unit that may take part in combat at a site of the given kind.
///
/// Land units never fight at sea, disabled units and zero-value
/// infrastructure never fight, and units already in an air battle stay out.
pub fn can_be_in_battle(water: bool) -> impl Fn(&Unit, &UnitType) -> bool {
    move |u, t| {
        if u.disabled || u.was_in_air_battle || t.has(UnitTrait::NotInBattle) {
            return false;
        }
        if water && t.is_land() {
            return false;
        }
        !(t.is_infrastructure() && t.attack == 0 && t.defense == 0 && !t.is_aa())
    }
}

/// Has positive strength on the given side.
pub fn has_strength(defending: bool) -> impl Fn(&Unit, &UnitType) -> bool {
    move |_, t| t.has_combat_ability(defending)
}

/// Domain check.
pub fn in_domain(domain: Domain) -> impl Fn(&Unit, &UnitType) -> bool {
    move |_, t| t.domain == domain
}

/// Owned by the player.
pub fn owned_by(player: PlayerId) -> impl Fn(&Unit, &UnitType) -> bool {
    move |u, _| u.owner == player
}

/// Owned by a player allied with `player`.
pub fn allied_with(state: &GameState, player: PlayerId) -> impl Fn(&Unit, &UnitType) -> bool + '_ {
    move |u, _| state.are_allied(u.owner, player)
}

/// Owned by a player at war with `player`.
pub fn enemy_of(state: &GameState, player: PlayerId) -> impl Fn(&Unit, &UnitType) -> bool + '_ {
    move |u, _| state.at_war(u.owner, player)
}

/// Carried by one of the given transports.
pub fn transported_by_any(transports: &[UnitId]) -> impl Fn(&Unit, &UnitType) -> bool + '_ {
    move |u, _| u.transported_by.is_some_and(|t| transports.contains(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{TerritoryId, UnitTypeId};

    #[test]
    fn test_can_be_in_battle() {
        let unit = Unit::new(UnitId(0), UnitTypeId(0), PlayerId(0), TerritoryId(0));
        let infantry = UnitType::new("infantry", Domain::Land, 3, 1, 2);
        let factory = UnitType::new("factory", Domain::Land, 15, 0, 0).with_trait(UnitTrait::Infrastructure);
        assert!(can_be_in_battle(false)(&unit, &infantry));
        assert!(!can_be_in_battle(true)(&unit, &infantry));
        assert!(!can_be_in_battle(false)(&unit, &factory));

        let mut disabled = unit.clone();
        disabled.disabled = true;
        assert!(!can_be_in_battle(false)(&disabled, &infantry));
    }

    #[test]
    fn test_interceptor_excludes_air_battle_veterans() {
        let mut unit = Unit::new(UnitId(0), UnitTypeId(0), PlayerId(0), TerritoryId(0));
        let fighter = UnitType::new("fighter", Domain::Air, 10, 3, 4).with_trait(UnitTrait::Interceptor);
        assert!(can_intercept(&unit, &fighter));
        unit.was_in_air_battle = true;
        assert!(!can_intercept(&unit, &fighter));
    }
}

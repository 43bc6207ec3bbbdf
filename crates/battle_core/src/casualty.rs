//! Casualty selection.
//!
//! The engine computes a default choice, the owning player may replace it,
//! and the answer is validated before anything is applied. An answer that
//! does not fit the offered units is a protocol violation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bridge::Bridge;
use crate::error::{BattleError, Result};
use crate::ids::{BattleId, PlayerId, UnitId};

/// Units killed and units taking one hit each.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CasualtyList {
    /// Destroyed units.
    pub killed: Vec<UnitId>,
    /// One entry per hit absorbed. A killed multi-hit-point unit also
    /// appears here for every hit point above its last.
    pub damaged: Vec<UnitId>,
}

impl CasualtyList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill everything given.
    #[must_use]
    pub fn killing(units: &[UnitId]) -> Self {
        Self {
            killed: units.to_vec(),
            damaged: Vec::new(),
        }
    }

    /// Hits the list accounts for.
    #[must_use]
    pub fn hits(&self) -> usize {
        self.killed.len() + self.damaged.len()
    }

    /// No casualties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.killed.is_empty() && self.damaged.is_empty()
    }
}

/// One candidate offered for casualty selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasualtyCandidate {
    /// Unit.
    pub unit: UnitId,
    /// Type name.
    pub type_name: String,
    /// Production cost.
    pub cost: u32,
    /// Hit points left.
    pub hits_left: u32,
}

/// Casualty question sent to the losing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasualtyRequest {
    /// Battle.
    pub battle: BattleId,
    /// Step name.
    pub step: String,
    /// Hits to assign.
    pub hits: u32,
    /// Units that may be chosen.
    pub candidates: Vec<CasualtyCandidate>,
    /// Engine suggestion.
    pub default: CasualtyList,
}

/// Choose casualties among `targets` for `hits` hits.
///
/// When the hits cover every remaining hit point the targets all die
/// without asking. With `transports_last`, non-combat transports are only
/// chosen once nothing else is left.
///
/// # Errors
///
/// [`BattleError::IllegalSelection`] when the answer is not a legal choice,
/// [`BattleError::Suspended`] when the player cannot answer yet.
pub fn select_casualties(
    bridge: &mut dyn Bridge,
    player: PlayerId,
    battle: BattleId,
    step: &str,
    targets: &[UnitId],
    hits: u32,
    transports_last: bool,
) -> Result<CasualtyList> {
    if hits == 0 || targets.is_empty() {
        return Ok(CasualtyList::new());
    }

    let state = bridge.state();
    let mut candidates = Vec::with_capacity(targets.len());
    let mut transports = Vec::new();
    let mut total_hit_points: u32 = 0;
    for &id in targets {
        let unit = state.unit(id)?;
        let t = state.unit_types.get(unit.type_id)?;
        let hits_left = t.hit_points.saturating_sub(unit.hits).max(1);
        total_hit_points += hits_left;
        if t.is_non_combat_transport() {
            transports.push(id);
        }
        candidates.push(CasualtyCandidate {
            unit: id,
            type_name: t.name.clone(),
            cost: t.cost,
            hits_left,
        });
    }

    if hits >= total_hit_points {
        let mut all = CasualtyList::killing(targets);
        for c in &candidates {
            for _ in 1..c.hits_left {
                all.damaged.push(c.unit);
            }
        }
        return Ok(all);
    }

    let default = default_casualties(&candidates, hits, if transports_last { &transports } else { &[] });
    let request = CasualtyRequest {
        battle,
        step: step.to_string(),
        hits,
        candidates,
        default,
    };
    let answer = bridge.remote().select_casualties(player, &request)?;
    validate(&request, &answer).map_err(|message| {
        tracing::error!(battle = %battle, player = %player, %message, "illegal casualty selection");
        BattleError::IllegalSelection { player, message }
    })?;
    tracing::debug!(battle = %battle, killed = ?answer.killed, damaged = ?answer.damaged, "casualties selected");
    Ok(answer)
}

/// Damage multi-hit-point units first, then kill the cheapest.
fn default_casualties(candidates: &[CasualtyCandidate], hits: u32, last: &[UnitId]) -> CasualtyList {
    let mut list = CasualtyList::new();
    let mut remaining = hits;
    for c in candidates {
        let absorb = c.hits_left.saturating_sub(1).min(remaining);
        for _ in 0..absorb {
            list.damaged.push(c.unit);
        }
        remaining -= absorb;
        if remaining == 0 {
            return list;
        }
    }
    let mut order: Vec<&CasualtyCandidate> = candidates.iter().collect();
    order.sort_by_key(|c| (last.contains(&c.unit), c.cost, c.unit));
    for c in order.into_iter().take(remaining as usize) {
        list.killed.push(c.unit);
    }
    list
}

fn validate(request: &CasualtyRequest, answer: &CasualtyList) -> std::result::Result<(), String> {
    if answer.hits() != request.hits as usize {
        return Err(format!("{} casualties for {} hits", answer.hits(), request.hits));
    }
    let offered: BTreeMap<UnitId, u32> = request.candidates.iter().map(|c| (c.unit, c.hits_left)).collect();
    let mut killed = Vec::with_capacity(answer.killed.len());
    for id in &answer.killed {
        if !offered.contains_key(id) {
            return Err(format!("{id} was not offered"));
        }
        if killed.contains(id) {
            return Err(format!("{id} killed twice"));
        }
        killed.push(*id);
    }
    let mut damage: BTreeMap<UnitId, u32> = BTreeMap::new();
    for id in &answer.damaged {
        let Some(&hits_left) = offered.get(id) else {
            return Err(format!("{id} was not offered"));
        };
        let taken = damage.entry(*id).or_default();
        *taken += 1;
        if *taken >= hits_left {
            return Err(format!("{id} cannot absorb {taken} hits"));
        }
    }
    for id in &killed {
        let needed = offered.get(id).map_or(0, |h| h - 1);
        if damage.get(id).copied().unwrap_or(0) != needed {
            return Err(format!("{id} killed before its other {needed} hit points"));
        }
    }
    Ok(())
}

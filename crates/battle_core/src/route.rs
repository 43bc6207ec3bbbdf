//! Movement routes as supplied by the (already validated) movement layer.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::TerritoryId;
use crate::state::GameState;

/// A path from a start territory through one or more steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    start: TerritoryId,
    steps: Vec<TerritoryId>,
}

impl Route {
    /// Route from `start` through `steps`.
    #[must_use]
    pub fn new(start: TerritoryId, steps: Vec<TerritoryId>) -> Self {
        Self { start, steps }
    }

    /// One-step route.
    #[must_use]
    pub fn single(from: TerritoryId, to: TerritoryId) -> Self {
        Self::new(from, vec![to])
    }

    /// Zero-length route for units already at the site.
    #[must_use]
    pub fn scripted(at: TerritoryId) -> Self {
        Self::new(at, Vec::new())
    }

    /// First territory.
    #[must_use]
    pub const fn start(&self) -> TerritoryId {
        self.start
    }

    /// Last territory (the start when there are no steps).
    #[must_use]
    pub fn end(&self) -> TerritoryId {
        self.steps.last().copied().unwrap_or(self.start)
    }

    /// Steps after the start.
    #[must_use]
    pub fn steps(&self) -> &[TerritoryId] {
        &self.steps
    }

    /// Exactly one step.
    #[must_use]
    pub fn has_exactly_one_step(&self) -> bool {
        self.steps.len() == 1
    }

    /// Territory the units entered the end from.
    #[must_use]
    pub fn territory_before_end(&self) -> TerritoryId {
        match self.steps.len() {
            0 | 1 => self.start,
            n => self.steps[n - 2],
        }
    }

    /// Every territory, start included.
    #[must_use]
    pub fn all_territories(&self) -> Vec<TerritoryId> {
        let mut all = Vec::with_capacity(self.steps.len() + 1);
        all.push(self.start);
        all.extend_from_slice(&self.steps);
        all
    }

    /// Sea to land in the final step.
    pub fn is_unload(&self, state: &GameState) -> Result<bool> {
        if self.steps.is_empty() {
            return Ok(false);
        }
        let from = state.territory(self.territory_before_end())?;
        let to = state.territory(self.end())?;
        Ok(from.water && !to.water)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::UnitTypeRegistry;
    use crate::rules::BattleRules;
    use crate::state::Territory;

    #[test]
    fn test_end_and_before_end() {
        let route = Route::new(TerritoryId(1), vec![TerritoryId(2), TerritoryId(3)]);
        assert_eq!(route.end(), TerritoryId(3));
        assert_eq!(route.territory_before_end(), TerritoryId(2));
        let scripted = Route::scripted(TerritoryId(4));
        assert_eq!(scripted.end(), TerritoryId(4));
        assert_eq!(scripted.territory_before_end(), TerritoryId(4));
    }

    #[test]
    fn test_is_unload() {
        let mut state = GameState::new(BattleRules::default(), UnitTypeRegistry::new());
        state.add_territory(Territory::new(TerritoryId(0), "Sea", true));
        state.add_territory(Territory::new(TerritoryId(1), "Land", false));
        assert!(Route::single(TerritoryId(0), TerritoryId(1)).is_unload(&state).unwrap());
        assert!(!Route::single(TerritoryId(1), TerritoryId(0)).is_unload(&state).unwrap());
    }
}

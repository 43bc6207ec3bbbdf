//! Battle record log.
//!
//! One record per battle, opened when the battle is registered and closed
//! exactly once with its result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::battle::{BattleResultDescription, BattleType, WhoWon};
use crate::error::{BattleError, Result};
use crate::ids::{BattleId, PlayerId, TerritoryId};

/// Summary of one battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleRecord {
    /// Battle.
    pub battle: BattleId,
    /// Site.
    pub site: TerritoryId,
    /// Attacking player.
    pub attacker: PlayerId,
    /// Defending player.
    pub defender: PlayerId,
    /// Battle type.
    pub battle_type: BattleType,
    /// Unit value the attacker lost.
    pub attacker_lost_tuv: u32,
    /// Unit value the defender lost.
    pub defender_lost_tuv: u32,
    /// Winner, once finished.
    pub who_won: WhoWon,
    /// Result classification, once finished.
    pub result: Option<BattleResultDescription>,
}

/// Records of the current turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleRecords {
    records: BTreeMap<BattleId, BattleRecord>,
}

/// Final figures of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BattleOutcome {
    /// Winner.
    pub who_won: WhoWon,
    /// Result classification.
    pub result: BattleResultDescription,
    /// Attacker's lost unit value.
    pub attacker_lost_tuv: u32,
    /// Defender's lost unit value.
    pub defender_lost_tuv: u32,
}

impl BattleRecords {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a record for a new battle. Re-opening keeps the existing one.
    pub fn add_battle(
        &mut self,
        battle: BattleId,
        site: TerritoryId,
        attacker: PlayerId,
        defender: PlayerId,
        battle_type: BattleType,
    ) {
        self.records.entry(battle).or_insert(BattleRecord {
            battle,
            site,
            attacker,
            defender,
            battle_type,
            attacker_lost_tuv: 0,
            defender_lost_tuv: 0,
            who_won: WhoWon::NotFinished,
            result: None,
        });
    }

    /// Close a record.
    ///
    /// # Errors
    ///
    /// [`BattleError::InvariantViolation`] when the record is already closed,
    /// [`BattleError::UnknownBattle`] when it was never opened.
    pub fn add_result(&mut self, battle: BattleId, outcome: BattleOutcome) -> Result<()> {
        let record = self.records.get_mut(&battle).ok_or(BattleError::UnknownBattle(battle))?;
        if record.result.is_some() {
            return Err(BattleError::InvariantViolation(format!(
                "result for {battle} written twice"
            )));
        }
        record.who_won = outcome.who_won;
        record.result = Some(outcome.result);
        record.attacker_lost_tuv = outcome.attacker_lost_tuv;
        record.defender_lost_tuv = outcome.defender_lost_tuv;
        Ok(())
    }

    /// Drop a record (battle undone or never fought).
    pub fn remove(&mut self, battle: BattleId) -> Option<BattleRecord> {
        self.records.remove(&battle)
    }

    /// Record by battle.
    #[must_use]
    pub fn get(&self, battle: BattleId) -> Option<&BattleRecord> {
        self.records.get(&battle)
    }

    /// Iterate in battle order.
    pub fn iter(&self) -> impl Iterator<Item = &BattleRecord> {
        self.records.values()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget everything (end of turn).
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> BattleOutcome {
        BattleOutcome {
            who_won: WhoWon::Attacker,
            result: BattleResultDescription::Conquered,
            attacker_lost_tuv: 3,
            defender_lost_tuv: 6,
        }
    }

    #[test]
    fn test_result_written_once() {
        let mut records = BattleRecords::new();
        records.add_battle(BattleId(1), TerritoryId(2), PlayerId(0), PlayerId(1), BattleType::Normal);
        records.add_result(BattleId(1), outcome()).unwrap();
        assert_eq!(records.get(BattleId(1)).unwrap().defender_lost_tuv, 6);
        let again = records.add_result(BattleId(1), outcome());
        assert!(matches!(again, Err(BattleError::InvariantViolation(_))));
    }

    #[test]
    fn test_unknown_battle() {
        let mut records = BattleRecords::new();
        assert!(records.add_result(BattleId(5), outcome()).is_err());
    }
}

//! Scripted remote player.
//!
//! Answers are queued per decision kind and consumed in order. An empty
//! queue falls back to the engine's default answer. [`Answer::Suspend`]
//! makes the call return [`BattleError::Suspended`], which is how tests
//! interrupt a battle mid-step and check that it resumes cleanly.

use std::collections::{BTreeMap, VecDeque};

use battle_core::bridge::{RemotePlayer, RetreatRequest, ScrambleSource};
use battle_core::casualty::{CasualtyList, CasualtyRequest};
use battle_core::error::{BattleError, Result};
use battle_core::ids::{BattleId, PlayerId, TerritoryId, UnitId};
use tracing::debug;

/// One scripted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer<T> {
    /// Whatever the engine would pick.
    Default,
    /// This exact reply.
    Give(T),
    /// Not yet: suspend the asking step.
    Suspend,
}

/// Decision kinds, in the order they were asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Query {
    /// Casualty selection.
    Casualties,
    /// Retreat or submerge.
    Retreat,
    /// Interceptor selection.
    Interceptors,
    /// Bombing target.
    BombingTarget,
    /// Scramble selection.
    Scramble,
    /// Kamikaze strikes.
    Kamikaze,
    /// Bombardment assignment.
    Bombard,
}

/// Remote player replaying queued answers.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPlayer {
    casualties: VecDeque<Answer<CasualtyList>>,
    retreats: VecDeque<Answer<Option<TerritoryId>>>,
    interceptors: VecDeque<Answer<Vec<UnitId>>>,
    scrambles: VecDeque<Answer<BTreeMap<TerritoryId, Vec<UnitId>>>>,
    kamikaze: VecDeque<Answer<BTreeMap<UnitId, u32>>>,
    asked: Vec<(Query, PlayerId)>,
    retreat_prompts: Vec<RetreatRequest>,
}

fn next<T>(queue: &mut VecDeque<Answer<T>>, player: PlayerId, query: Query) -> Result<Option<T>> {
    match queue.pop_front() {
        None | Some(Answer::Default) => Ok(None),
        Some(Answer::Give(answer)) => Ok(Some(answer)),
        Some(Answer::Suspend) => {
            debug!(%player, ?query, "scripted player suspends");
            Err(BattleError::Suspended(player))
        }
    }
}

impl ScriptedPlayer {
    /// Player with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a casualty answer.
    #[must_use]
    pub fn casualties(mut self, answer: Answer<CasualtyList>) -> Self {
        self.casualties.push_back(answer);
        self
    }

    /// Queue a retreat answer.
    #[must_use]
    pub fn retreat(mut self, answer: Answer<Option<TerritoryId>>) -> Self {
        self.retreats.push_back(answer);
        self
    }

    /// Queue an interceptor answer.
    #[must_use]
    pub fn interceptors(mut self, answer: Answer<Vec<UnitId>>) -> Self {
        self.interceptors.push_back(answer);
        self
    }

    /// Queue a scramble answer.
    #[must_use]
    pub fn scramble(mut self, answer: Answer<BTreeMap<TerritoryId, Vec<UnitId>>>) -> Self {
        self.scrambles.push_back(answer);
        self
    }

    /// Queue a kamikaze answer.
    #[must_use]
    pub fn kamikaze(mut self, answer: Answer<BTreeMap<UnitId, u32>>) -> Self {
        self.kamikaze.push_back(answer);
        self
    }

    /// Every question asked so far.
    #[must_use]
    pub fn asked(&self) -> &[(Query, PlayerId)] {
        &self.asked
    }

    /// How often `query` was asked.
    #[must_use]
    pub fn count(&self, query: Query) -> usize {
        self.asked.iter().filter(|(q, _)| *q == query).count()
    }

    /// Retreat prompts received.
    #[must_use]
    pub fn retreat_prompts(&self) -> &[RetreatRequest] {
        &self.retreat_prompts
    }
}

impl RemotePlayer for ScriptedPlayer {
    fn select_casualties(&mut self, player: PlayerId, request: &CasualtyRequest) -> Result<CasualtyList> {
        self.asked.push((Query::Casualties, player));
        Ok(next(&mut self.casualties, player, Query::Casualties)?.unwrap_or_else(|| request.default.clone()))
    }

    fn retreat_query(&mut self, player: PlayerId, request: &RetreatRequest) -> Result<Option<TerritoryId>> {
        self.asked.push((Query::Retreat, player));
        self.retreat_prompts.push(request.clone());
        Ok(next(&mut self.retreats, player, Query::Retreat)?.flatten())
    }

    fn select_interceptors(&mut self, player: PlayerId, _battle: BattleId, candidates: &[UnitId]) -> Result<Vec<UnitId>> {
        self.asked.push((Query::Interceptors, player));
        Ok(next(&mut self.interceptors, player, Query::Interceptors)?.unwrap_or_else(|| candidates.to_vec()))
    }

    fn select_bombing_target(&mut self, player: PlayerId, _bomber: UnitId, targets: &[UnitId]) -> Result<Option<UnitId>> {
        self.asked.push((Query::BombingTarget, player));
        Ok(targets.first().copied())
    }

    fn select_scramblers(
        &mut self,
        player: PlayerId,
        _site: TerritoryId,
        _sources: &BTreeMap<TerritoryId, ScrambleSource>,
    ) -> Result<BTreeMap<TerritoryId, Vec<UnitId>>> {
        self.asked.push((Query::Scramble, player));
        Ok(next(&mut self.scrambles, player, Query::Scramble)?.unwrap_or_default())
    }

    fn select_kamikaze_attacks(
        &mut self,
        player: PlayerId,
        _targets: &BTreeMap<TerritoryId, Vec<UnitId>>,
        _tokens: u32,
    ) -> Result<BTreeMap<UnitId, u32>> {
        self.asked.push((Query::Kamikaze, player));
        Ok(next(&mut self.kamikaze, player, Query::Kamikaze)?.unwrap_or_default())
    }

    fn select_bombarding_battle(&mut self, player: PlayerId, _unit: UnitId, options: &[BattleId]) -> Result<Option<BattleId>> {
        self.asked.push((Query::Bombard, player));
        Ok(options.first().copied())
    }
}

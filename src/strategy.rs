//! Move selection for competitors.
//!
//! A [`Strategy`] only decides moves. Everything else a competitor does (authentication,
//! sequencing, bookkeeping) lives in [`crate::competitor::Competitor`], so a strategy is free of
//! networking and can be unit-tested with a bare [`MatchContext`].

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::game_interface::Game;
use crate::protocol::messages::{Invitation, Role, RoundRecord};

/// What a competitor knows when asked for a move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchContext {
    pub match_id: String,
    pub game: String,
    pub role: Role,
    pub opponent_id: String,
    /// 1-based index of the round being played.
    pub round: u32,
    pub own_score: u32,
    pub opponent_score: u32,
}

pub trait Strategy: Send + Sync {
    /// `history` holds the rounds of this match resolved so far, oldest first.
    fn decide_move(&self, ctx: &MatchContext, history: &[RoundRecord]) -> Value;

    fn accept_invitation(&self, _invitation: &Invitation) -> bool {
        true
    }
}

/// Always plays the same move.
#[derive(Debug, Clone)]
pub struct ConstantStrategy {
    value: Value,
}

impl ConstantStrategy {
    pub fn new(value: Value) -> Self {
        ConstantStrategy { value }
    }
}

impl Strategy for ConstantStrategy {
    fn decide_move(&self, _ctx: &MatchContext, _history: &[RoundRecord]) -> Value {
        self.value.clone()
    }
}

/// Uniformly random among `choices`.
#[derive(Debug, Clone)]
pub struct RandomChoiceStrategy {
    choices: Vec<Value>,
}

impl RandomChoiceStrategy {
    pub fn new(choices: Vec<Value>) -> Self {
        RandomChoiceStrategy { choices }
    }
}

impl Strategy for RandomChoiceStrategy {
    fn decide_move(&self, _ctx: &MatchContext, _history: &[RoundRecord]) -> Value {
        self.choices
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Walks `sequence` by round index, wrapping around.
#[derive(Debug, Clone)]
pub struct CycleStrategy {
    sequence: Vec<Value>,
}

impl CycleStrategy {
    pub fn new(sequence: Vec<Value>) -> Self {
        CycleStrategy { sequence }
    }
}

impl Strategy for CycleStrategy {
    fn decide_move(&self, ctx: &MatchContext, _history: &[RoundRecord]) -> Value {
        if self.sequence.is_empty() {
            return Value::Null;
        }
        let i = ctx.round.saturating_sub(1) as usize % self.sequence.len();
        self.sequence[i].clone()
    }
}

type StrategyFactory = Arc<dyn Fn() -> Arc<dyn Strategy> + Send + Sync>;

/// Strategies an agent can be started with, by name.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `constant` (the game's default move), `random_choice` and `cycle` over the game's moves.
    pub fn with_builtins(game: &dyn Game) -> Self {
        let default_move = game.default_move(&game.initial_state());
        let moves = game.legal_moves();

        let mut registry = Self::new();
        registry.register("constant", move || {
            Arc::new(ConstantStrategy::new(default_move.clone())) as Arc<dyn Strategy>
        });
        let choices = moves.clone();
        registry.register("random_choice", move || {
            Arc::new(RandomChoiceStrategy::new(choices.clone())) as Arc<dyn Strategy>
        });
        registry.register("cycle", move || {
            Arc::new(CycleStrategy::new(moves.clone())) as Arc<dyn Strategy>
        });
        registry
    }

    /// Registering an existing name replaces it.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Strategy> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

//! Traits a game must implement to be refereed by a supervisor
//!
//! Moves and game state travel as [`serde_json::Value`] so that supervisors and competitors
//! never need to share Rust types. A game is registered once at startup in a [`GameRegistry`]
//! and looked up by the name carried in each match assignment.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::games::{EvenOdd, HigherNumber, RockPaperScissors};

/// Result of one round, by seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    FirstWins,
    SecondWins,
    Tie,
}

impl RoundOutcome {
    /// Seat index (0 or 1) of the round winner.
    pub fn winner_seat(self) -> Option<usize> {
        match self {
            RoundOutcome::FirstWins => Some(0),
            RoundOutcome::SecondWins => Some(1),
            RoundOutcome::Tie => None,
        }
    }

    /// The outcome of a round won by `seat`.
    pub fn won_by(seat: usize) -> Self {
        if seat == 0 {
            RoundOutcome::FirstWins
        } else {
            RoundOutcome::SecondWins
        }
    }
}

/// What the game should implement
pub trait Game: Send + Sync {
    /// Name used in assignments and registries.
    fn name(&self) -> &str;

    /// State before the first round.
    fn initial_state(&self) -> Value {
        Value::Null
    }

    /// Moves a competitor may submit, used by the built-in strategies.
    fn legal_moves(&self) -> Vec<Value>;

    /// # Error
    /// Returned when `mv` is not allowed in `state`, with a message the referee logs.
    fn validate_move(&self, mv: &Value, state: &Value) -> anyhow::Result<()>;

    /// Move substituted for a missing or invalid submission. Must itself be valid.
    fn default_move(&self, state: &Value) -> Value;

    /// Resolve one round from both (already valid) moves, in seat order. May advance `state`.
    fn compute_outcome(&self, moves: [&Value; 2], state: &mut Value) -> RoundOutcome;

    /// True if the game ended before the configured number of rounds.
    fn is_terminal(&self, _state: &Value) -> bool {
        false
    }
}

/// Games known to an agent, by name.
#[derive(Clone, Default)]
pub struct GameRegistry {
    games: BTreeMap<String, Arc<dyn Game>>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `rock_paper_scissors`, `even_odd` and `higher_number`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for game in [
            Arc::new(RockPaperScissors) as Arc<dyn Game>,
            Arc::new(EvenOdd),
            Arc::new(HigherNumber),
        ] {
            registry.games.insert(game.name().to_string(), game);
        }
        registry
    }

    pub fn register(&mut self, game: Arc<dyn Game>) -> anyhow::Result<()> {
        let name = game.name().to_string();
        if self.games.contains_key(&name) {
            bail!("game {name} is already registered");
        }
        self.games.insert(name, game);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Game>> {
        self.games.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.games.keys().map(String::as_str).collect()
    }
}

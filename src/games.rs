//! Built-in games.

use anyhow::bail;
use serde_json::{json, Value};

use crate::game_interface::{Game, RoundOutcome};

const RPS_MOVES: [&str; 3] = ["rock", "paper", "scissors"];

#[derive(Debug, Clone, Copy, Default)]
pub struct RockPaperScissors;

impl RockPaperScissors {
    fn beats(a: &str, b: &str) -> bool {
        matches!(
            (a, b),
            ("rock", "scissors") | ("paper", "rock") | ("scissors", "paper")
        )
    }
}

impl Game for RockPaperScissors {
    fn name(&self) -> &str {
        "rock_paper_scissors"
    }

    fn legal_moves(&self) -> Vec<Value> {
        RPS_MOVES.iter().map(|m| json!(m)).collect()
    }

    fn validate_move(&self, mv: &Value, _state: &Value) -> anyhow::Result<()> {
        match mv.as_str() {
            Some(m) if RPS_MOVES.contains(&m) => Ok(()),
            _ => bail!("expected one of {RPS_MOVES:?}, got {mv}"),
        }
    }

    fn default_move(&self, _state: &Value) -> Value {
        json!("rock")
    }

    fn compute_outcome(&self, moves: [&Value; 2], _state: &mut Value) -> RoundOutcome {
        let a = moves[0].as_str().unwrap_or_default();
        let b = moves[1].as_str().unwrap_or_default();
        if Self::beats(a, b) {
            RoundOutcome::FirstWins
        } else if Self::beats(b, a) {
            RoundOutcome::SecondWins
        } else {
            RoundOutcome::Tie
        }
    }
}

/// Both players show 0 to 5 fingers. An even sum wins for the first seat, odd for the second.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenOdd;

impl EvenOdd {
    const MAX: u64 = 5;
}

impl Game for EvenOdd {
    fn name(&self) -> &str {
        "even_odd"
    }

    fn legal_moves(&self) -> Vec<Value> {
        (0..=Self::MAX).map(|n| json!(n)).collect()
    }

    fn validate_move(&self, mv: &Value, _state: &Value) -> anyhow::Result<()> {
        match mv.as_u64() {
            Some(n) if n <= Self::MAX => Ok(()),
            _ => bail!("expected an integer in 0..={}, got {mv}", Self::MAX),
        }
    }

    fn default_move(&self, _state: &Value) -> Value {
        json!(0)
    }

    fn compute_outcome(&self, moves: [&Value; 2], _state: &mut Value) -> RoundOutcome {
        let sum = moves[0].as_u64().unwrap_or(0) + moves[1].as_u64().unwrap_or(0);
        if sum % 2 == 0 {
            RoundOutcome::FirstWins
        } else {
            RoundOutcome::SecondWins
        }
    }
}

/// Both players pick 1 to 10, the higher number wins the round.
#[derive(Debug, Clone, Copy, Default)]
pub struct HigherNumber;

impl Game for HigherNumber {
    fn name(&self) -> &str {
        "higher_number"
    }

    fn legal_moves(&self) -> Vec<Value> {
        (1..=10u64).map(|n| json!(n)).collect()
    }

    fn validate_move(&self, mv: &Value, _state: &Value) -> anyhow::Result<()> {
        match mv.as_u64() {
            Some(n) if (1..=10).contains(&n) => Ok(()),
            _ => bail!("expected an integer in 1..=10, got {mv}"),
        }
    }

    fn default_move(&self, _state: &Value) -> Value {
        json!(1)
    }

    fn compute_outcome(&self, moves: [&Value; 2], _state: &mut Value) -> RoundOutcome {
        let a = moves[0].as_u64().unwrap_or(0);
        let b = moves[1].as_u64().unwrap_or(0);
        match a.cmp(&b) {
            std::cmp::Ordering::Greater => RoundOutcome::FirstWins,
            std::cmp::Ordering::Less => RoundOutcome::SecondWins,
            std::cmp::Ordering::Equal => RoundOutcome::Tie,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(game: &dyn Game, a: Value, b: Value) -> RoundOutcome {
        let mut state = game.initial_state();
        game.compute_outcome([&a, &b], &mut state)
    }

    #[test]
    fn rock_paper_scissors_rules() {
        let g = RockPaperScissors;
        assert_eq!(outcome(&g, json!("rock"), json!("scissors")), RoundOutcome::FirstWins);
        assert_eq!(outcome(&g, json!("rock"), json!("paper")), RoundOutcome::SecondWins);
        assert_eq!(outcome(&g, json!("paper"), json!("paper")), RoundOutcome::Tie);
        assert!(g.validate_move(&json!("lizard"), &Value::Null).is_err());
        assert!(g.validate_move(&json!(3), &Value::Null).is_err());
        assert!(g.validate_move(&g.default_move(&Value::Null), &Value::Null).is_ok());
    }

    #[test]
    fn even_odd_rules() {
        let g = EvenOdd;
        assert_eq!(outcome(&g, json!(2), json!(4)), RoundOutcome::FirstWins);
        assert_eq!(outcome(&g, json!(2), json!(3)), RoundOutcome::SecondWins);
        assert!(g.validate_move(&json!(6), &Value::Null).is_err());
        assert!(g.validate_move(&json!(-1), &Value::Null).is_err());
        assert_eq!(g.legal_moves().len(), 6);
    }

    #[test]
    fn higher_number_rules() {
        let g = HigherNumber;
        assert_eq!(outcome(&g, json!(10), json!(3)), RoundOutcome::FirstWins);
        assert_eq!(outcome(&g, json!(1), json!(3)), RoundOutcome::SecondWins);
        assert_eq!(outcome(&g, json!(7), json!(7)), RoundOutcome::Tie);
        assert!(g.validate_move(&json!(0), &Value::Null).is_err());
        assert!(g.validate_move(&json!("7"), &Value::Null).is_err());
    }
}

//! Parameter and result payloads of every method exposed by the three agent kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Method names, shared by callers and the agents exposing them.
pub mod methods {
    pub const LIST_METHODS: &str = "list_methods";

    // orchestrator
    pub const REGISTER_COMPETITOR: &str = "register_competitor";
    pub const REGISTER_SUPERVISOR: &str = "register_supervisor";
    pub const REPORT_MATCH_RESULT: &str = "report_match_result";
    pub const VALIDATE_TOKEN: &str = "validate_token";
    pub const GET_STANDINGS: &str = "get_standings";
    pub const GET_MATCH_HISTORY: &str = "get_match_history";
    pub const GET_LEAGUE_STATUS: &str = "get_league_status";

    // supervisor
    pub const ASSIGN_MATCH: &str = "assign_match";
    pub const CANCEL_MATCH: &str = "cancel_match";
    pub const GET_STATUS: &str = "get_status";

    // competitor
    pub const INVITE: &str = "invite";
    pub const REQUEST_MOVE: &str = "request_move";
    pub const REPORT_RESULT: &str = "report_result";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterCompetitor {
    pub competitor_id: String,
    pub display_name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSupervisor {
    pub supervisor_id: String,
    pub endpoint: String,
    pub max_concurrent_matches: usize,
}

/// Returned by both registration methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    pub league_id: String,
    pub agent_id: String,
    /// The bearer token the agent attaches to its own calls.
    pub auth_token: String,
    /// The token the orchestrator attaches to calls it makes to the agent.
    pub league_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateToken {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub owner_id: String,
    pub issued_at_ms: u64,
}

/// One side of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub competitor_id: String,
    pub endpoint: String,
}

/// Sent by the orchestrator to hand a match to a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAssignment {
    pub league_id: String,
    pub match_id: String,
    pub game: String,
    pub seats: [Seat; 2],
    pub round_count: u32,
    pub move_timeout_ms: u64,
    pub misbehavior_threshold: u32,
    pub timing_anomaly_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMatch {
    pub match_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub supervisor_id: String,
    pub load: usize,
    pub capacity: usize,
    pub active_matches: Vec<String>,
    /// Final reports parked for another delivery attempt.
    #[serde(default)]
    pub pending_reports: Vec<String>,
    /// Final reports given up on. Their matches need reconciling by the orchestrator.
    #[serde(default)]
    pub dropped_reports: Vec<String>,
}

/// Seat of a competitor inside a match. The first seat moves "first" for asymmetric games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    First,
    Second,
}

impl Role {
    pub fn from_seat(seat: usize) -> Role {
        if seat == 0 {
            Role::First
        } else {
            Role::Second
        }
    }

    pub fn seat(self) -> usize {
        match self {
            Role::First => 0,
            Role::Second => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub match_id: String,
    pub referee_id: String,
    pub opponent_id: String,
    pub role: Role,
    pub game: String,
    pub round_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub match_id: String,
    pub referee_id: String,
    pub round: u32,
    pub deadline_ms: u64,
    pub own_score: u32,
    pub opponent_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveReply {
    #[serde(rename = "move")]
    pub value: Value,
}

/// How a recorded move came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveOrigin {
    /// Submitted in time and legal.
    Submitted,
    /// Synthesized because the deadline expired.
    TimeoutDefault,
    /// Synthesized because the submission was illegal or malformed.
    InvalidReplaced,
    /// Synthesized for a round awarded to the opponent of a flagged competitor.
    Awarded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub competitor_id: String,
    pub value: Value,
    /// Milliseconds after the move was requested, when a reply arrived.
    pub submitted_after_ms: Option<u64>,
    pub valid: bool,
    pub origin: MoveOrigin,
}

/// A resolved round. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// 1-based, gapless.
    pub index: u32,
    pub moves: [MoveRecord; 2],
    /// `None` on a tie.
    pub winner: Option<String>,
    pub resolved_at_ms: u64,
    pub awarded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MisbehaviorCounters {
    pub timeouts: u32,
    pub invalid_moves: u32,
    pub timing_anomalies: u32,
}

impl MisbehaviorCounters {
    pub fn score(&self) -> u32 {
        self.timeouts + self.invalid_moves + self.timing_anomalies
    }
}

/// Reported with the result when a competitor reached the misbehavior threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MisbehaviorFlag {
    pub competitor_id: String,
    pub counters: MisbehaviorCounters,
    pub flagged_at_round: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcomeStatus {
    Completed,
    Forfeited,
}

/// Final result, sent by the supervisor to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub league_id: String,
    pub match_id: String,
    pub supervisor_id: String,
    pub competitors: [String; 2],
    pub status: MatchOutcomeStatus,
    /// `None` on a tie.
    pub winner: Option<String>,
    pub round_wins: [u32; 2],
    pub rounds: Vec<RoundRecord>,
    pub flags: Vec<MisbehaviorFlag>,
    /// Competitor held responsible for a forfeit.
    pub forfeit_cause: Option<String>,
    pub forfeit_reason: Option<String>,
}

impl MatchReport {
    /// The competitor that did not cause the forfeit.
    pub fn forfeit_beneficiary(&self) -> Option<&str> {
        let cause = self.forfeit_cause.as_deref()?;
        self.competitors
            .iter()
            .find(|c| c.as_str() != cause)
            .map(String::as_str)
    }

    /// Every id the report names must sit in one of its two seats, and the winner must follow
    /// from the rest of the report: the forfeit cause for a forfeit, else flags, then round wins.
    pub fn check_consistency(&self) -> Result<(), ProtocolError> {
        let seat_of = |id: &str| self.competitors.iter().position(|c| c == id);
        let stranger = |what: &str, id: &str| {
            ProtocolError::validation(format!(
                "{} names {what} {id}, who does not play in it",
                self.match_id
            ))
        };

        if let Some(winner) = self.winner.as_deref() {
            seat_of(winner).ok_or_else(|| stranger("winner", winner))?;
        }
        let mut flagged = [false, false];
        for flag in &self.flags {
            let seat = seat_of(&flag.competitor_id)
                .ok_or_else(|| stranger("flagged competitor", &flag.competitor_id))?;
            if flagged[seat] {
                return Err(ProtocolError::validation(format!(
                    "{} flags {} twice",
                    self.match_id, flag.competitor_id
                )));
            }
            flagged[seat] = true;
        }

        let expected = match self.status {
            MatchOutcomeStatus::Forfeited => {
                if let Some(cause) = self.forfeit_cause.as_deref() {
                    seat_of(cause).ok_or_else(|| stranger("forfeit cause", cause))?;
                }
                self.forfeit_beneficiary()
            }
            MatchOutcomeStatus::Completed => {
                if self.forfeit_cause.is_some() {
                    return Err(ProtocolError::validation(format!(
                        "{} is completed but names a forfeit cause",
                        self.match_id
                    )));
                }
                let seat = match flagged {
                    [true, false] => Some(1),
                    [false, true] => Some(0),
                    [true, true] => None,
                    [false, false] => match self.round_wins[0].cmp(&self.round_wins[1]) {
                        std::cmp::Ordering::Greater => Some(0),
                        std::cmp::Ordering::Less => Some(1),
                        std::cmp::Ordering::Equal => None,
                    },
                };
                seat.map(|seat| self.competitors[seat].as_str())
            }
        };
        if self.winner.as_deref() != expected {
            return Err(ProtocolError::validation(format!(
                "{} reports winner {} but its result gives {}",
                self.match_id,
                self.winner.as_deref().unwrap_or("none"),
                expected.unwrap_or("none")
            )));
        }
        Ok(())
    }
}

/// Sent to competitors after each round and once at the end of the match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultNotice {
    pub match_id: String,
    pub referee_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalNotice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalNotice {
    pub status: MatchOutcomeStatus,
    pub winner: Option<String>,
    pub round_wins: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueQuery {
    pub league_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Ack {
        Ack { ok: true }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn move_reply_uses_move_key() {
        let reply: MoveReply = serde_json::from_value(json!({"move": "rock"})).unwrap();
        assert_eq!(reply.value, json!("rock"));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"move": "rock"})
        );
    }

    #[test]
    fn forfeit_beneficiary_is_the_other_seat() {
        let report = MatchReport {
            league_id: "l".into(),
            match_id: "m".into(),
            supervisor_id: "s".into(),
            competitors: ["a".into(), "b".into()],
            status: MatchOutcomeStatus::Forfeited,
            winner: Some("b".into()),
            round_wins: [0, 0],
            rounds: vec![],
            flags: vec![],
            forfeit_cause: Some("a".into()),
            forfeit_reason: Some("declined".into()),
        };
        assert_eq!(report.forfeit_beneficiary(), Some("b"));
        report.check_consistency().unwrap();
    }

    #[test]
    fn flags_decide_the_winner_before_round_wins() {
        let flag = |id: &str| MisbehaviorFlag {
            competitor_id: id.into(),
            counters: MisbehaviorCounters {
                invalid_moves: 3,
                ..Default::default()
            },
            flagged_at_round: 3,
        };
        let mut report = MatchReport {
            league_id: "l".into(),
            match_id: "m".into(),
            supervisor_id: "s".into(),
            competitors: ["a".into(), "b".into()],
            status: MatchOutcomeStatus::Completed,
            winner: Some("b".into()),
            round_wins: [3, 2],
            rounds: vec![],
            flags: vec![flag("a")],
            forfeit_cause: None,
            forfeit_reason: None,
        };
        report.check_consistency().unwrap();

        report.flags.push(flag("b"));
        assert_eq!(
            report.check_consistency().unwrap_err().code,
            crate::error::ErrorCode::ValidationError
        );
        report.winner = None;
        report.check_consistency().unwrap();

        report.flags.push(flag("a"));
        assert!(report.check_consistency().is_err());
    }

    #[test]
    fn role_seat_mapping() {
        assert_eq!(Role::from_seat(0), Role::First);
        assert_eq!(Role::from_seat(1).seat(), 1);
    }
}

//! Round-robin schedule generation and supervisor selection.
//!
//! The schedule is fixed up front: every unordered pair of competitors meets exactly once per
//! repetition, grouped into league rounds where nobody plays twice. The orchestrator then
//! dispatches one league round at a time.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::agent::SupervisorRecord;
use crate::protocol::messages::{MatchOutcomeStatus, MatchReport, MisbehaviorFlag, RoundRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Unassigned,
    Assigned,
    Completed,
    Forfeited,
}

impl MatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Forfeited)
    }
}

/// One scheduled match, as tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: String,
    pub league_round: u32,
    /// Seat order: `competitors[0]` plays first.
    pub competitors: [String; 2],
    pub supervisor_id: Option<String>,
    pub status: MatchStatus,
    pub winner: Option<String>,
    pub round_wins: [u32; 2],
    pub rounds: Vec<RoundRecord>,
    pub flags: Vec<MisbehaviorFlag>,
    pub forfeit_cause: Option<String>,
    pub forfeit_reason: Option<String>,
    /// Set when the last dispatch attempt failed. Such a match waits for `retry_unassigned`.
    pub dispatch_failed: bool,
}

impl MatchRecord {
    pub fn new(match_id: String, league_round: u32, home: String, away: String) -> Self {
        MatchRecord {
            match_id,
            league_round,
            competitors: [home, away],
            supervisor_id: None,
            status: MatchStatus::Unassigned,
            winner: None,
            round_wins: [0, 0],
            rounds: vec![],
            flags: vec![],
            forfeit_cause: None,
            forfeit_reason: None,
            dispatch_failed: false,
        }
    }

    pub fn involves(&self, competitor_id: &str) -> bool {
        self.competitors.iter().any(|c| c == competitor_id)
    }

    pub fn opponent_of(&self, competitor_id: &str) -> Option<&str> {
        match self.competitors.iter().position(|c| c == competitor_id) {
            Some(seat) => Some(self.competitors[1 - seat].as_str()),
            None => None,
        }
    }

    /// Copy a supervisor's final report into the record.
    pub fn apply_report(&mut self, report: &MatchReport) {
        self.status = match report.status {
            MatchOutcomeStatus::Completed => MatchStatus::Completed,
            MatchOutcomeStatus::Forfeited => MatchStatus::Forfeited,
        };
        self.winner = report.winner.clone();
        self.round_wins = report.round_wins;
        self.rounds = report.rounds.clone();
        self.flags = report.flags.clone();
        self.forfeit_cause = report.forfeit_cause.clone();
        self.forfeit_reason = report.forfeit_reason.clone();
    }

    /// Resolve without playing, `cause` losing by forfeit.
    pub fn forfeit_locally(&mut self, cause: &str, reason: impl Into<String>) {
        self.status = MatchStatus::Forfeited;
        self.winner = self.opponent_of(cause).map(str::to_string);
        self.forfeit_cause = Some(cause.to_string());
        self.forfeit_reason = Some(reason.into());
    }

    /// Resolve with no winner and nobody to blame. Leaves the table untouched.
    pub fn void_locally(&mut self, reason: impl Into<String>) {
        self.status = MatchStatus::Forfeited;
        self.winner = None;
        self.forfeit_cause = None;
        self.forfeit_reason = Some(reason.into());
    }
}

/// Number of matches a full round robin produces.
pub fn expected_match_count(competitors: usize, repeat_factor: u32) -> usize {
    competitors * competitors.saturating_sub(1) / 2 * repeat_factor as usize
}

/// Circle-method round robin over `competitors` in the given (registration) order.
///
/// With an odd count a bye slot is added and whoever meets it sits the round out. Repetition
/// `k` swaps home and away when `k` is odd.
pub fn round_robin(competitors: &[String], repeat_factor: u32) -> Vec<MatchRecord> {
    if competitors.len() < 2 {
        return vec![];
    }
    let mut slots: Vec<Option<&String>> = competitors.iter().map(Some).collect();
    if slots.len() % 2 == 1 {
        slots.push(None);
    }
    let n = slots.len();
    let circle_rounds = n - 1;

    let mut matches = Vec::with_capacity(expected_match_count(competitors.len(), repeat_factor));
    for repeat in 0..repeat_factor {
        let mut ring = slots.clone();
        for r in 0..circle_rounds {
            let league_round = repeat * circle_rounds as u32 + r as u32 + 1;
            for i in 0..n / 2 {
                let (Some(a), Some(b)) = (ring[i], ring[n - 1 - i]) else {
                    continue;
                };
                // the fixed slot would always play home otherwise
                let (mut home, mut away) = if i == 0 && r % 2 == 1 { (b, a) } else { (a, b) };
                if repeat % 2 == 1 {
                    std::mem::swap(&mut home, &mut away);
                }
                let match_id = format!("match-{:03}", matches.len() + 1);
                trace!(%match_id, league_round, %home, %away, "scheduled");
                matches.push(MatchRecord::new(
                    match_id,
                    league_round,
                    home.clone(),
                    away.clone(),
                ));
            }
            // rotate everything but the first slot
            let last = ring.remove(n - 1);
            ring.insert(1, last);
        }
    }
    matches
}

/// Least-loaded supervisor with spare capacity, ties going to the earliest registered.
pub fn pick_supervisor<'a>(
    supervisors: &'a [SupervisorRecord],
    excluded: &[String],
) -> Option<&'a SupervisorRecord> {
    supervisors
        .iter()
        .filter(|s| s.has_capacity() && !excluded.contains(&s.id))
        .min_by_key(|s| (s.load, s.registration_order))
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("c{i}")).collect()
    }

    fn pair_counts(matches: &[MatchRecord]) -> HashMap<(String, String), u32> {
        let mut counts = HashMap::new();
        for m in matches {
            let mut pair = m.competitors.clone();
            pair.sort();
            let [a, b] = pair;
            *counts.entry((a, b)).or_default() += 1;
        }
        counts
    }

    #[test]
    fn every_pair_meets_once_per_repeat() {
        for n in 2..=9 {
            for repeat in 1..=3 {
                let matches = round_robin(&ids(n), repeat);
                assert_eq!(matches.len(), expected_match_count(n, repeat), "n={n}");
                let counts = pair_counts(&matches);
                assert_eq!(counts.len(), n * (n - 1) / 2);
                assert!(counts.values().all(|&c| c == repeat));
                assert!(matches.iter().all(|m| m.competitors[0] != m.competitors[1]));
            }
        }
    }

    #[test]
    fn four_competitors_give_six_matches_in_three_rounds() {
        let matches = round_robin(&ids(4), 1);
        assert_eq!(matches.len(), 6);
        let rounds: HashSet<u32> = matches.iter().map(|m| m.league_round).collect();
        assert_eq!(rounds, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn nobody_plays_twice_in_a_league_round() {
        let matches = round_robin(&ids(7), 2);
        let mut seen: HashMap<u32, HashSet<String>> = HashMap::new();
        for m in &matches {
            let round = seen.entry(m.league_round).or_default();
            for c in &m.competitors {
                assert!(round.insert(c.clone()), "{c} twice in round {}", m.league_round);
            }
        }
    }

    #[test]
    fn second_repeat_swaps_home_and_away() {
        let matches = round_robin(&ids(2), 2);
        assert_eq!(matches[0].competitors, ["c1".to_string(), "c2".to_string()]);
        assert_eq!(matches[1].competitors, ["c2".to_string(), "c1".to_string()]);
    }

    #[test]
    fn fewer_than_two_competitors_schedule_nothing() {
        assert!(round_robin(&ids(1), 1).is_empty());
        assert!(round_robin(&[], 3).is_empty());
    }

    #[test]
    fn supervisor_selection_prefers_low_load_then_registration() {
        let mut sups = vec![
            SupervisorRecord::new("s1".into(), "e1".into(), 2, 0),
            SupervisorRecord::new("s2".into(), "e2".into(), 2, 1),
        ];
        assert_eq!(pick_supervisor(&sups, &[]).unwrap().id, "s1");
        sups[0].load = 1;
        assert_eq!(pick_supervisor(&sups, &[]).unwrap().id, "s2");
        sups[1].load = 1;
        assert_eq!(pick_supervisor(&sups, &[]).unwrap().id, "s1");
        assert_eq!(pick_supervisor(&sups, &["s1".into()]).unwrap().id, "s2");
        sups[0].load = 2;
        sups[1].load = 2;
        assert!(pick_supervisor(&sups, &[]).is_none());
    }

    #[test]
    fn local_forfeit_credits_the_opponent() {
        let mut m = MatchRecord::new("m".into(), 1, "a".into(), "b".into());
        m.forfeit_locally("b", "ejected");
        assert_eq!(m.status, MatchStatus::Forfeited);
        assert_eq!(m.winner.as_deref(), Some("a"));
    }
}

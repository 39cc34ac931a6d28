use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tournament_scheduler::{MatchRecord, MatchStatus};

pub const POINTS_WIN: u32 = 3;
pub const POINTS_TIE: u32 = 1;
pub const POINTS_LOSS: u32 = 0;

/// Aggregated record for one competitor.
#[derive(PartialEq, Eq, Default, Debug, Clone, Serialize, Deserialize)]
pub struct StandingsEntry {
    pub competitor_id: String,
    pub played: u32,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    pub points: u32,
}

impl fmt::Display for StandingsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} pts (played: {}, win: {}, tie: {}, loss: {})",
            self.competitor_id, self.points, self.played, self.wins, self.ties, self.losses
        )
    }
}

/// How one terminal match changes the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEffect {
    Decided { winner: String, loser: String },
    Tie([String; 2]),
    /// Cancelled without a culprit, the table does not change.
    Void,
}

impl MatchEffect {
    pub fn of(m: &MatchRecord) -> Option<MatchEffect> {
        let [a, b] = &m.competitors;
        let decided = |winner: &str| {
            let loser = if winner == a.as_str() { b } else { a };
            MatchEffect::Decided {
                winner: winner.to_string(),
                loser: loser.clone(),
            }
        };
        match m.status {
            MatchStatus::Unassigned | MatchStatus::Assigned => None,
            MatchStatus::Completed => Some(match &m.winner {
                Some(w) => decided(w.as_str()),
                None => MatchEffect::Tie([a.clone(), b.clone()]),
            }),
            MatchStatus::Forfeited => Some(match &m.forfeit_cause {
                Some(cause) => match m.opponent_of(cause) {
                    Some(beneficiary) => decided(beneficiary),
                    None => MatchEffect::Void,
                },
                None => MatchEffect::Void,
            }),
        }
    }
}

/// The league table. Rows exist for every competitor, even before they played.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standings {
    entries: BTreeMap<String, StandingsEntry>,
}

impl Standings {
    pub fn new<'a>(competitor_ids: impl IntoIterator<Item = &'a String>) -> Self {
        let entries = competitor_ids
            .into_iter()
            .map(|id| {
                (
                    id.clone(),
                    StandingsEntry {
                        competitor_id: id.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        Standings { entries }
    }

    fn entry(&mut self, id: &str) -> &mut StandingsEntry {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| StandingsEntry {
                competitor_id: id.to_string(),
                ..Default::default()
            })
    }

    pub fn apply(&mut self, effect: &MatchEffect) {
        match effect {
            MatchEffect::Decided { winner, loser } => {
                let w = self.entry(winner);
                w.played += 1;
                w.wins += 1;
                w.points += POINTS_WIN;
                let l = self.entry(loser);
                l.played += 1;
                l.losses += 1;
                l.points += POINTS_LOSS;
            }
            MatchEffect::Tie(pair) => {
                for id in pair {
                    let e = self.entry(id);
                    e.played += 1;
                    e.ties += 1;
                    e.points += POINTS_TIE;
                }
            }
            MatchEffect::Void => {}
        }
    }

    /// Recompute the table from scratch out of the terminal matches.
    pub fn replay<'a>(
        competitor_ids: impl IntoIterator<Item = &'a String>,
        matches: &[MatchRecord],
    ) -> Standings {
        let mut standings = Standings::new(competitor_ids);
        for effect in matches.iter().filter_map(MatchEffect::of) {
            standings.apply(&effect);
        }
        standings
    }

    pub fn get(&self, id: &str) -> Option<&StandingsEntry> {
        self.entries.get(id)
    }

    /// Rows ranked by points, then wins, then id.
    pub fn ranked(&self) -> Vec<StandingsEntry> {
        let mut rows: Vec<StandingsEntry> = self.entries.values().cloned().collect();
        rows.sort_by(|a, b| {
            b.points
                .cmp(&a.points)
                .then(b.wins.cmp(&a.wins))
                .then(a.competitor_id.cmp(&b.competitor_id))
        });
        rows
    }
}

use std::collections::BTreeMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Head-to-head record against one opponent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadToHead {
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
}

/// A registered player, as the orchestrator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorRecord {
    pub id: String,
    pub display_name: String,
    pub endpoint: String,
    pub registration_order: usize,
    pub head_to_head: BTreeMap<String, HeadToHead>,
    /// Matches in which this competitor was flagged for misbehavior.
    pub flag_count: u32,
    pub ejected: bool,
}

impl PartialEq for CompetitorRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CompetitorRecord {}

impl Hash for CompetitorRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl CompetitorRecord {
    pub fn new(
        id: String,
        display_name: String,
        endpoint: String,
        registration_order: usize,
    ) -> CompetitorRecord {
        CompetitorRecord {
            id,
            display_name,
            endpoint,
            registration_order,
            head_to_head: BTreeMap::new(),
            flag_count: 0,
            ejected: false,
        }
    }

    pub fn record_against(&mut self, opponent: &str, won: Option<bool>) {
        let entry = self.head_to_head.entry(opponent.to_string()).or_default();
        match won {
            Some(true) => entry.wins += 1,
            Some(false) => entry.losses += 1,
            None => entry.ties += 1,
        }
    }
}

/// A registered referee, as the orchestrator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorRecord {
    pub id: String,
    pub endpoint: String,
    pub max_concurrent_matches: usize,
    /// Matches assigned and not yet reported.
    pub load: usize,
    pub registration_order: usize,
}

impl PartialEq for SupervisorRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SupervisorRecord {}

impl SupervisorRecord {
    pub fn new(
        id: String,
        endpoint: String,
        max_concurrent_matches: usize,
        registration_order: usize,
    ) -> SupervisorRecord {
        SupervisorRecord {
            id,
            endpoint,
            max_concurrent_matches,
            load: 0,
            registration_order,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.load < self.max_concurrent_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_to_head_accumulates() {
        let mut c = CompetitorRecord::new("a".into(), "A".into(), "ep".into(), 0);
        c.record_against("b", Some(true));
        c.record_against("b", None);
        c.record_against("c", Some(false));
        assert_eq!(
            c.head_to_head["b"],
            HeadToHead {
                wins: 1,
                losses: 0,
                ties: 1
            }
        );
        assert_eq!(c.head_to_head["c"].losses, 1);
    }

    #[test]
    fn identity_is_the_id() {
        let a = CompetitorRecord::new("a".into(), "A".into(), "ep-1".into(), 0);
        let mut moved = CompetitorRecord::new("a".into(), "Other".into(), "ep-2".into(), 3);
        moved.flag_count = 2;
        assert_eq!(a, moved);
        let s = SupervisorRecord::new("s".into(), "ep".into(), 1, 0);
        assert!(s.has_capacity());
    }
}

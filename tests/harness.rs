#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use agent_league::prelude::*;
use agent_league::protocol::messages::{Invitation, RoundRecord};
use serde_json::{json, Value};
use time::format_description;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub const LEAGUE_ID: &str = "league";

pub fn init_test_logger() {
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_timer(timer)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Short deadlines and backoffs so leagues finish in well under a second per match.
pub fn fast_config() -> Configuration {
    Configuration::new()
        .with_round_count(3)
        .with_move_timeout(Duration::from_millis(150))
        .with_retry_max_attempts(3)
        .with_retry_backoff(Duration::from_millis(2), Duration::from_millis(10))
        .with_call_timeout(Duration::from_millis(500))
        .with_circuit_breaker(100, Duration::from_secs(60), Duration::from_secs(60))
        .with_timing_anomaly_window(Duration::from_millis(10))
        .with_max_concurrent_matches(4)
        .with_verbose(false)
}

/// Sleeps past any reasonable deadline before answering.
pub struct Sleeper(pub Duration);

impl Strategy for Sleeper {
    fn decide_move(&self, _ctx: &MatchContext, _history: &[RoundRecord]) -> Value {
        thread::sleep(self.0);
        json!("rock")
    }
}

/// Always plays something no game accepts.
pub struct Illegal;

impl Strategy for Illegal {
    fn decide_move(&self, _ctx: &MatchContext, _history: &[RoundRecord]) -> Value {
        json!("lizard")
    }
}

/// Refuses every invitation.
pub struct Shy;

impl Strategy for Shy {
    fn decide_move(&self, _ctx: &MatchContext, _history: &[RoundRecord]) -> Value {
        json!("rock")
    }

    fn accept_invitation(&self, _invitation: &Invitation) -> bool {
        false
    }
}

pub fn constant(value: &str) -> Arc<dyn Strategy> {
    Arc::new(ConstantStrategy::new(json!(value)))
}

/// A whole league living on one in-process transport.
pub struct League {
    pub transport: InProcessTransport,
    pub events: EventBus,
    pub config: Configuration,
    pub manager: LeagueManager,
    pub supervisors: Vec<Supervisor>,
    pub competitors: Vec<Competitor>,
}

impl League {
    /// An orchestrator with registration open.
    pub fn new(config: Configuration) -> League {
        let transport = InProcessTransport::new();
        let events = EventBus::new();
        let manager = LeagueManager::new(
            LEAGUE_ID,
            config.clone(),
            Arc::new(transport.clone()),
            events.clone(),
        );
        transport.bind(LEAGUE_ID, manager.service());
        manager.initialize().unwrap();
        manager.open_registration().unwrap();
        League {
            transport,
            events,
            config,
            manager,
            supervisors: vec![],
            competitors: vec![],
        }
    }

    pub fn add_supervisor(&mut self, id: &str) -> &Supervisor {
        let supervisor = Supervisor::new(
            id,
            &self.config,
            Arc::new(self.transport.clone()),
            self.events.clone(),
        );
        self.transport.bind(supervisor.endpoint(), supervisor.service());
        supervisor.register(LEAGUE_ID).unwrap();
        self.supervisors.push(supervisor);
        self.supervisors.last().unwrap()
    }

    pub fn add_competitor(&mut self, id: &str, strategy: Arc<dyn Strategy>) -> &Competitor {
        let competitor = Competitor::new(
            id,
            id.to_uppercase(),
            strategy,
            &self.config,
            Arc::new(self.transport.clone()),
        );
        self.transport.bind(competitor.endpoint(), competitor.service());
        competitor.register(LEAGUE_ID).unwrap();
        self.competitors.push(competitor);
        self.competitors.last().unwrap()
    }

    pub fn start(&self) -> usize {
        let count = self.manager.schedule().unwrap();
        self.manager.start().unwrap();
        count
    }

    pub fn competitor(&self, id: &str) -> &Competitor {
        self.competitors.iter().find(|c| c.id() == id).unwrap()
    }
}

/// Collect every event matching `pattern`.
pub fn record(events: &EventBus, pattern: &str) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events.subscribe(pattern, move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    seen
}

pub fn count(seen: &Arc<Mutex<Vec<Event>>>, event_type: &str) -> usize {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

/// Poll `check` until it holds or `within` elapses.
pub fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = std::time::Instant::now() + within;
    while std::time::Instant::now() < until {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

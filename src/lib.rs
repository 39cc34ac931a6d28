//! # Agent League
//!
//! Round-robin tournaments among independently running agents that only talk through remote calls.
//!
//! Three kinds of agents take part:
//! - one orchestrator ([`LeagueManager`](crate::orchestrator::LeagueManager)) that registers
//!   everybody, builds the schedule, hands matches out and keeps the standings;
//! - supervisors ([`Supervisor`](crate::supervisor::Supervisor)) that referee matches, one
//!   [`MatchController`](crate::match_controller::MatchController) per match;
//! - competitors ([`Competitor`](crate::competitor::Competitor)) that delegate every decision to a
//!   pluggable [`Strategy`](crate::strategy::Strategy).
//!
//! Each match is played as a series of simultaneous-move rounds of a [`Game`]. Competitors that
//! miss deadlines or send illegal moves get default moves and a misbehavior score; reaching the
//! threshold flags them and hands the remaining rounds to their opponent.
//!
//! # Documentation Overview
//!
//! - The envelope, method registry and tokens live in [`protocol`]; the carriers in [`transport`].
//! - Every outbound call goes through [`ResilientClient`](crate::resilience::ResilientClient),
//!   which retries transient failures and keeps one circuit breaker per peer.
//! - Tunables are gathered in [`Configuration`](crate::configuration::Configuration).
//! - Lifecycle notifications are published on an [`EventBus`](crate::event_bus::EventBus).
//!
//! # Usage Example
//!
//! A three player league running in a single process:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use agent_league::prelude::*;
//! use serde_json::json;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::new().with_round_count(3);
//!     let transport = InProcessTransport::new();
//!     let events = EventBus::new();
//!
//!     let league = LeagueManager::new(
//!         "league-1",
//!         config.clone(),
//!         Arc::new(transport.clone()),
//!         events.clone(),
//!     );
//!     transport.bind("league-1", league.service());
//!     league.initialize()?;
//!     league.open_registration()?;
//!
//!     let referee = Supervisor::new("referee-1", &config, Arc::new(transport.clone()), events);
//!     transport.bind(referee.endpoint(), referee.service());
//!     referee.register("league-1")?;
//!
//!     for name in ["alice", "bob", "carol"] {
//!         let strategy = Arc::new(ConstantStrategy::new(json!("rock")));
//!         let player = Competitor::new(name, name, strategy, &config, Arc::new(transport.clone()));
//!         transport.bind(player.endpoint(), player.service());
//!         player.register("league-1")?;
//!     }
//!
//!     league.schedule()?;
//!     league.start()?;
//!     let summary = league.run(Duration::from_secs(30))?;
//!     for entry in summary.standings {
//!         println!("{entry}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Agents living in other processes are reached the same way through
//! [`TcpTransport`](crate::transport::TcpTransport) and served by
//! [`TcpServer`](crate::transport::TcpServer).

pub mod agent;
pub mod competitor;
pub mod configuration;
pub mod error;
pub mod event_bus;
pub mod game_interface;
pub mod games;
mod logger;
pub mod match_controller;
pub mod orchestrator;
pub mod protocol;
pub mod resilience;
pub mod standings;
pub mod strategy;
pub mod supervisor;
pub mod tournament_scheduler;
pub mod transport;

pub use anyhow;
pub use logger::init_logger;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use agent_league::prelude::*;
/// ```
pub mod prelude {
    pub use crate::competitor::Competitor;
    pub use crate::configuration::Configuration;
    pub use crate::error::{ErrorCode, LeagueError, ProtocolError, SchedulingFailure};
    pub use crate::event_bus::{topics, Event, EventBus};
    pub use crate::game_interface::{Game, GameRegistry, RoundOutcome};
    pub use crate::orchestrator::{LeagueManager, LeagueStatus, LeagueSummary};
    pub use crate::resilience::{BreakerState, ResilientClient};
    pub use crate::strategy::{
        ConstantStrategy, CycleStrategy, MatchContext, RandomChoiceStrategy, Strategy,
        StrategyRegistry,
    };
    pub use crate::supervisor::Supervisor;
    pub use crate::transport::{Handler, InProcessTransport, TcpServer, TcpTransport, Transport};
}

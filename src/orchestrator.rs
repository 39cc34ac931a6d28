//! League orchestration: registration, the round-robin schedule, dispatch to supervisors and
//! standings.
//!
//! The [`LeagueManager`] owns every piece of league state behind one lock. Remote calls are never
//! made while holding it: a dispatch reserves the match under the lock, calls the supervisor, then
//! commits or reverts. Match reports arriving on the wire are only validated by the handler and
//! queued on an mpsc channel; [`LeagueManager::run`] applies them one at a time in arrival order,
//! the same way a tournament loop consumes match results.
//!
//! # Lifecycle
//!
//! ```text
//! UNINITIALIZED -> INITIALIZED -> REGISTERING -> SCHEDULED -> RUNNING -> COMPLETED -> ARCHIVED
//!                                                               ^  |
//!                                                               |  v
//!                                                              PAUSED
//! ```

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, trace, warn};

use crate::agent::{CompetitorRecord, SupervisorRecord};
use crate::configuration::Configuration;
use crate::error::{ErrorCode, LeagueError, ProtocolError, SchedulingFailure};
use crate::event_bus::{topics, EventBus};
use crate::logger::init_logger;
use crate::protocol::auth::token_info;
use crate::protocol::messages::{
    methods, Ack, CancelMatch, LeagueQuery, MatchAssignment, MatchReport, RegisterCompetitor,
    RegisterSupervisor, RegistrationReceipt, Seat, SupervisorStatus, ValidateToken,
};
use crate::protocol::{
    verify_capabilities, AuthToken, CallContext, MethodRegistry, MethodSpec, Service, TokenStore,
};
use crate::resilience::{BreakerState, ResilientClient};
use crate::standings::{MatchEffect, Standings, StandingsEntry};
use crate::supervisor::REQUIRED_METHODS;
use crate::tournament_scheduler::{pick_supervisor, round_robin, MatchRecord, MatchStatus};
use crate::transport::Transport;

/// How long the run loop blocks on the report channel before looking at the league again.
const REPORT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeagueStatus {
    Uninitialized,
    Initialized,
    Registering,
    Scheduled,
    Running,
    Paused,
    Completed,
    Archived,
}

impl LeagueStatus {
    pub fn can_transition_to(self, to: LeagueStatus) -> bool {
        use LeagueStatus::*;
        matches!(
            (self, to),
            (Uninitialized, Initialized)
                | (Initialized, Registering)
                | (Registering, Scheduled)
                | (Scheduled, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Paused, Completed)
                | (Completed, Archived)
        )
    }
}

impl fmt::Display for LeagueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeagueStatus::Uninitialized => "UNINITIALIZED",
            LeagueStatus::Initialized => "INITIALIZED",
            LeagueStatus::Registering => "REGISTERING",
            LeagueStatus::Scheduled => "SCHEDULED",
            LeagueStatus::Running => "RUNNING",
            LeagueStatus::Paused => "PAUSED",
            LeagueStatus::Completed => "COMPLETED",
            LeagueStatus::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

/// Answer of `get_league_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeagueStatusReport {
    pub league_id: String,
    pub status: LeagueStatus,
    pub competitors: usize,
    pub supervisors: usize,
    pub total_matches: usize,
    pub terminal_matches: usize,
    pub assigned_matches: usize,
    /// Lowest league round that still has unfinished matches.
    pub current_round: Option<u32>,
}

/// Returned by [`LeagueManager::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueSummary {
    pub league_id: String,
    pub status: LeagueStatus,
    pub standings: Vec<StandingsEntry>,
    pub total_matches: usize,
    pub terminal_matches: usize,
    /// Every dispatch failure since the league started.
    pub scheduling_failures: Vec<SchedulingFailure>,
}

/// Final state handed out by [`LeagueManager::archive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedLeague {
    pub league_id: String,
    pub standings: Vec<StandingsEntry>,
    pub matches: Vec<MatchRecord>,
}

type Events = Vec<(&'static str, Value)>;

struct LeagueState {
    status: LeagueStatus,
    competitors: Vec<CompetitorRecord>,
    supervisors: Vec<SupervisorRecord>,
    matches: Vec<MatchRecord>,
    standings: Standings,
    failures: Vec<SchedulingFailure>,
}

impl LeagueState {
    fn current_round(&self) -> Option<u32> {
        self.matches
            .iter()
            .filter(|m| !m.status.is_terminal())
            .map(|m| m.league_round)
            .min()
    }

    fn outstanding(&self) -> usize {
        self.matches
            .iter()
            .filter(|m| m.status == MatchStatus::Assigned)
            .count()
    }

    fn eligible(&self, m: &MatchRecord, round: u32) -> bool {
        m.league_round == round && m.status == MatchStatus::Unassigned && !m.dispatch_failed
    }

    /// Whether a dispatch pass could assign something right now.
    fn dispatchable(&self) -> bool {
        let Some(round) = self.current_round() else {
            return false;
        };
        self.matches.iter().any(|m| self.eligible(m, round))
            && self.supervisors.iter().any(SupervisorRecord::has_capacity)
    }

    fn unfinished(&self) -> Vec<String> {
        self.matches
            .iter()
            .filter(|m| !m.status.is_terminal())
            .map(|m| m.match_id.clone())
            .collect()
    }

    fn competitor_mut(&mut self, id: &str) -> Option<&mut CompetitorRecord> {
        self.competitors.iter_mut().find(|c| c.id == id)
    }

    fn supervisor_mut(&mut self, id: &str) -> Option<&mut SupervisorRecord> {
        self.supervisors.iter_mut().find(|s| s.id == id)
    }

    fn transition(&mut self, to: LeagueStatus) -> Result<(), ProtocolError> {
        if !self.status.can_transition_to(to) {
            return Err(ProtocolError::invalid_state(format!(
                "league cannot go from {} to {to}",
                self.status
            )));
        }
        debug!(from = %self.status, %to, "league transition");
        self.status = to;
        Ok(())
    }
}

/// A match reserved for a supervisor, waiting for its `assign_match` call.
struct Reservation {
    match_id: String,
    supervisor_id: String,
    endpoint: String,
    assignment: MatchAssignment,
}

struct ManagerInner {
    league_id: String,
    config: Configuration,
    client: Arc<ResilientClient>,
    tokens: Arc<TokenStore>,
    league_token: AuthToken,
    events: EventBus,
    state: Mutex<LeagueState>,
    report_tx: Sender<MatchReport>,
    report_rx: Mutex<Receiver<MatchReport>>,
}

/// The league orchestrator. Cloning gives another handle on the same league.
#[derive(Clone)]
pub struct LeagueManager {
    inner: Arc<ManagerInner>,
}

impl LeagueManager {
    pub fn new(
        league_id: impl Into<String>,
        config: Configuration,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        if config.log() {
            if let Err(e) = init_logger(&config) {
                warn!("{e:#}");
            }
        }
        let league_id = league_id.into();
        let client = Arc::new(ResilientClient::from_config(&league_id, transport, &config));
        let tokens = Arc::new(TokenStore::new());
        let league_token = tokens.issue(&league_id);
        let (report_tx, report_rx) = mpsc::channel();
        trace!(?config);
        LeagueManager {
            inner: Arc::new(ManagerInner {
                league_id,
                config,
                client,
                tokens,
                league_token,
                events,
                state: Mutex::new(LeagueState {
                    status: LeagueStatus::Uninitialized,
                    competitors: vec![],
                    supervisors: vec![],
                    matches: vec![],
                    standings: Standings::default(),
                    failures: vec![],
                }),
                report_tx,
                report_rx: Mutex::new(report_rx),
            }),
        }
    }

    pub fn league_id(&self) -> &str {
        &self.inner.league_id
    }

    pub fn status(&self) -> LeagueStatus {
        self.inner.state().status
    }

    /// Check the configuration and leave `UNINITIALIZED`.
    pub fn initialize(&self) -> Result<(), ProtocolError> {
        self.inner
            .config
            .validate()
            .map_err(|e| ProtocolError::validation(format!("{e:#}")))?;
        self.inner.state().transition(LeagueStatus::Initialized)?;
        info!(league = %self.inner.league_id, "league initialized");
        Ok(())
    }

    pub fn open_registration(&self) -> Result<(), ProtocolError> {
        self.inner.state().transition(LeagueStatus::Registering)
    }

    pub fn register_competitor(
        &self,
        request: RegisterCompetitor,
    ) -> Result<RegistrationReceipt, ProtocolError> {
        self.inner.register_competitor(request)
    }

    pub fn register_supervisor(
        &self,
        request: RegisterSupervisor,
    ) -> Result<RegistrationReceipt, ProtocolError> {
        self.inner.register_supervisor(request)
    }

    /// Close registration and build the round robin over the competitors, in registration order.
    #[instrument(skip(self), fields(league = %self.inner.league_id))]
    pub fn schedule(&self) -> Result<usize, ProtocolError> {
        let (count, rounds) = {
            let mut state = self.inner.state();
            if state.status != LeagueStatus::Registering {
                return Err(ProtocolError::invalid_state(format!(
                    "league cannot go from {} to {}",
                    state.status,
                    LeagueStatus::Scheduled
                )));
            }
            if state.competitors.len() < 2 {
                return Err(ProtocolError::validation(format!(
                    "a league needs at least 2 competitors, {} registered",
                    state.competitors.len()
                )));
            }
            let ids: Vec<String> = state.competitors.iter().map(|c| c.id.clone()).collect();
            state.matches = round_robin(&ids, self.inner.config.repeat_factor);
            state.standings = Standings::new(&ids);
            state.transition(LeagueStatus::Scheduled)?;
            let rounds = state.matches.iter().map(|m| m.league_round).max().unwrap_or(0);
            (state.matches.len(), rounds)
        };
        info!(matches = count, rounds, "league scheduled");
        self.inner.events.publish(
            topics::LEAGUE_SCHEDULED,
            json!({ "league_id": self.inner.league_id, "matches": count, "league_rounds": rounds }),
        );
        Ok(count)
    }

    pub fn start(&self) -> Result<(), ProtocolError> {
        self.inner.state().transition(LeagueStatus::Running)?;
        info!(league = %self.inner.league_id, "league started");
        Ok(())
    }

    /// Stop dispatching. Only possible while some match is unfinished.
    pub fn pause(&self) -> Result<(), ProtocolError> {
        {
            let mut state = self.inner.state();
            if state.current_round().is_none() {
                return Err(ProtocolError::invalid_state(
                    "nothing left to pause, every match is finished",
                ));
            }
            state.transition(LeagueStatus::Paused)?;
        }
        self.inner
            .events
            .publish(topics::LEAGUE_PAUSED, json!({ "league_id": self.inner.league_id }));
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ProtocolError> {
        self.inner.state().transition(LeagueStatus::Running)?;
        self.inner
            .events
            .publish(topics::LEAGUE_RESUMED, json!({ "league_id": self.inner.league_id }));
        Ok(())
    }

    /// One dispatch pass over the current league round.
    ///
    /// Returns the failures of this pass. A failed match stays unassigned and is skipped by later
    /// passes until [`retry_unassigned`](Self::retry_unassigned).
    pub fn dispatch(&self) -> Result<Vec<SchedulingFailure>, ProtocolError> {
        let status = self.status();
        if status != LeagueStatus::Running {
            return Err(ProtocolError::invalid_state(format!(
                "cannot dispatch while {status}"
            )));
        }
        Ok(self.inner.dispatch_pass().1)
    }

    /// Clear the failure mark of every unassigned match and dispatch again.
    pub fn retry_unassigned(&self) -> Result<Vec<SchedulingFailure>, ProtocolError> {
        let cleared = {
            let mut state = self.inner.state();
            let mut cleared = 0;
            for m in state.matches.iter_mut().filter(|m| m.dispatch_failed) {
                m.dispatch_failed = false;
                cleared += 1;
            }
            cleared
        };
        debug!(cleared, "retrying unassigned matches");
        self.dispatch()
    }

    /// Apply every report already queued. Returns how many were taken off the queue.
    pub fn apply_pending_reports(&self) -> usize {
        let reports: Vec<MatchReport> = {
            let rx = self.inner.report_rx.lock().expect("poisoned");
            rx.try_iter().collect()
        };
        let count = reports.len();
        for report in reports {
            self.inner.apply_one(report);
        }
        count
    }

    /// Drive the league until it completes.
    ///
    /// Dispatches, waits for reports and applies them, over and over. While paused, reports are
    /// still applied and the call returns once no match is running. Fails with
    /// [`LeagueError::Stalled`] when nothing runs and nothing can be dispatched, or when
    /// `idle_timeout` passes without any progress.
    #[instrument(skip(self), fields(league = %self.inner.league_id))]
    pub fn run(&self, idle_timeout: Duration) -> Result<LeagueSummary, LeagueError> {
        match self.status() {
            LeagueStatus::Running | LeagueStatus::Paused | LeagueStatus::Completed => {}
            other => {
                return Err(ProtocolError::invalid_state(format!(
                    "cannot run a league that is {other}"
                ))
                .into())
            }
        }

        let mut failures = Vec::new();
        let mut last_progress = Instant::now();
        loop {
            if self.apply_pending_reports() > 0 {
                last_progress = Instant::now();
            }
            match self.status() {
                LeagueStatus::Completed | LeagueStatus::Archived => return Ok(self.summary()),
                LeagueStatus::Paused => {
                    if self.inner.state().outstanding() == 0 {
                        return Ok(self.summary());
                    }
                }
                _ => {
                    let (assigned, mut failed) = self.inner.dispatch_pass();
                    if assigned > 0 {
                        last_progress = Instant::now();
                    }
                    failures.append(&mut failed);
                    let state = self.inner.state();
                    if state.outstanding() == 0 && !state.dispatchable() {
                        let unassigned = state.unfinished();
                        warn!(?unassigned, "league stalled");
                        return Err(LeagueError::Stalled {
                            unassigned,
                            failures,
                        });
                    }
                }
            }

            if self.inner.wait_for_report(REPORT_POLL.min(idle_timeout)) {
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= idle_timeout {
                if self.reconcile() > 0 {
                    last_progress = Instant::now();
                    continue;
                }
                let unassigned = self.inner.state().unfinished();
                warn!(?unassigned, ?idle_timeout, "no progress, giving up");
                return Err(LeagueError::Stalled {
                    unassigned,
                    failures,
                });
            }
        }
    }

    /// Ask every supervisor holding assigned matches for its status and void the matches whose
    /// final report it gave up delivering. Returns how many matches were resolved.
    ///
    /// A supervisor that cannot be reached is skipped.
    pub fn reconcile(&self) -> usize {
        let holders: Vec<(String, String)> = {
            let state = self.inner.state();
            state
                .supervisors
                .iter()
                .filter(|s| {
                    state.matches.iter().any(|m| {
                        m.status == MatchStatus::Assigned
                            && m.supervisor_id.as_deref() == Some(s.id.as_str())
                    })
                })
                .map(|s| (s.id.clone(), s.endpoint.clone()))
                .collect()
        };

        let mut resolved = 0;
        for (supervisor_id, endpoint) in holders {
            let status = self
                .inner
                .client
                .call(
                    &endpoint,
                    methods::GET_STATUS,
                    Value::Null,
                    Some(&self.inner.league_token.value),
                )
                .map_err(|e| e.to_string())
                .and_then(|v| {
                    serde_json::from_value::<SupervisorStatus>(v).map_err(|e| e.to_string())
                });
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!(supervisor = %supervisor_id, "status unavailable, not reconciled: {e}");
                    continue;
                }
            };
            if status.dropped_reports.is_empty() {
                continue;
            }

            let mut events = Events::new();
            {
                let mut state = self.inner.state();
                let lost: Vec<usize> = state
                    .matches
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| {
                        m.status == MatchStatus::Assigned
                            && m.supervisor_id.as_deref() == Some(supervisor_id.as_str())
                            && status.dropped_reports.contains(&m.match_id)
                    })
                    .map(|(i, _)| i)
                    .collect();
                for idx in lost {
                    warn!(
                        match_id = %state.matches[idx].match_id,
                        supervisor = %supervisor_id,
                        "result report lost, match voided"
                    );
                    state.matches[idx].void_locally("result report lost");
                    if let Some(s) = state.supervisor_mut(&supervisor_id) {
                        s.load = s.load.saturating_sub(1);
                    }
                    let record = state.matches[idx].clone();
                    self.inner.settle(&mut state, &record, &mut events);
                    resolved += 1;
                }
                self.inner.check_completion(&mut state, &mut events);
            }
            self.inner.publish(events);
        }
        resolved
    }

    /// Ask the supervisor running `match_id` to stop it. The match ends without a winner.
    pub fn cancel_match(&self, match_id: &str, reason: &str) -> Result<(), ProtocolError> {
        let endpoint = {
            let state = self.inner.state();
            let m = state
                .matches
                .iter()
                .find(|m| m.match_id == match_id)
                .ok_or_else(|| ProtocolError::not_found(format!("no match {match_id}")))?;
            if m.status != MatchStatus::Assigned {
                return Err(ProtocolError::invalid_state(format!(
                    "match {match_id} is not running"
                )));
            }
            let supervisor_id = m.supervisor_id.as_deref().unwrap_or_default();
            state
                .supervisors
                .iter()
                .find(|s| s.id == supervisor_id)
                .map(|s| s.endpoint.clone())
                .ok_or_else(|| {
                    ProtocolError::not_found(format!("no supervisor {supervisor_id}"))
                })?
        };
        let params = serde_json::to_value(CancelMatch {
            match_id: match_id.to_string(),
            reason: reason.to_string(),
        })?;
        self.inner
            .client
            .call(
                &endpoint,
                methods::CANCEL_MATCH,
                params,
                Some(&self.inner.league_token.value),
            )
            .map_err(|e| e.into_protocol())?;
        info!(%match_id, reason, "match cancellation requested");
        Ok(())
    }

    /// Close a completed league.
    pub fn archive(&self) -> Result<ArchivedLeague, ProtocolError> {
        let archived = {
            let mut state = self.inner.state();
            state.transition(LeagueStatus::Archived)?;
            ArchivedLeague {
                league_id: self.inner.league_id.clone(),
                standings: state.standings.ranked(),
                matches: state.matches.clone(),
            }
        };
        info!(league = %self.inner.league_id, "league archived");
        self.inner.events.publish(
            topics::LEAGUE_ARCHIVED,
            json!({ "league_id": self.inner.league_id, "standings": archived.standings }),
        );
        Ok(archived)
    }

    pub fn summary(&self) -> LeagueSummary {
        let state = self.inner.state();
        LeagueSummary {
            league_id: self.inner.league_id.clone(),
            status: state.status,
            standings: state.standings.ranked(),
            total_matches: state.matches.len(),
            terminal_matches: state.matches.iter().filter(|m| m.status.is_terminal()).count(),
            scheduling_failures: state.failures.clone(),
        }
    }

    pub fn standings(&self) -> Standings {
        self.inner.state().standings.clone()
    }

    /// The table recomputed from the terminal matches alone.
    pub fn replay_standings(&self) -> Standings {
        let state = self.inner.state();
        Standings::replay(state.competitors.iter().map(|c| &c.id), &state.matches)
    }

    pub fn matches(&self) -> Vec<MatchRecord> {
        self.inner.state().matches.clone()
    }

    pub fn match_record(&self, match_id: &str) -> Option<MatchRecord> {
        let state = self.inner.state();
        state.matches.iter().find(|m| m.match_id == match_id).cloned()
    }

    pub fn competitor(&self, id: &str) -> Option<CompetitorRecord> {
        let state = self.inner.state();
        state.competitors.iter().find(|c| c.id == id).cloned()
    }

    pub fn supervisors(&self) -> Vec<SupervisorRecord> {
        self.inner.state().supervisors.clone()
    }

    pub fn status_report(&self) -> LeagueStatusReport {
        self.inner.status_report()
    }

    pub fn validate_token(&self, token: &str) -> Result<AuthToken, ProtocolError> {
        self.inner.tokens.validate(token)
    }

    pub fn breaker_state(&self, endpoint: &str) -> BreakerState {
        self.inner.client.breaker_state(endpoint)
    }

    /// Wire front of the orchestrator.
    pub fn service(&self) -> Arc<Service> {
        let mut registry = MethodRegistry::new();

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::public(methods::REGISTER_COMPETITOR, "Join the league as a player")
                .params(json!({
                    "competitor_id": "string", "display_name": "string", "endpoint": "string"
                })),
            move |params, _ctx| {
                let request: RegisterCompetitor = serde_json::from_value(params)?;
                Ok(serde_json::to_value(inner.register_competitor(request)?)?)
            },
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::public(methods::REGISTER_SUPERVISOR, "Join the league as a referee")
                .params(json!({
                    "supervisor_id": "string", "endpoint": "string",
                    "max_concurrent_matches": "integer"
                })),
            move |params, _ctx| {
                let request: RegisterSupervisor = serde_json::from_value(params)?;
                Ok(serde_json::to_value(inner.register_supervisor(request)?)?)
            },
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::authenticated(methods::REPORT_MATCH_RESULT, "Final result of a match")
                .params(json!({
                    "league_id": "string", "match_id": "string", "supervisor_id": "string",
                    "competitors": "[string; 2]", "status": "completed|forfeited",
                    "winner": "string?", "round_wins": "[integer; 2]", "rounds": "[RoundRecord]",
                    "flags": "[MisbehaviorFlag]", "forfeit_cause": "string?",
                    "forfeit_reason": "string?"
                }))
                .owned_by("supervisor_id"),
            move |params, ctx| inner.receive_report(params, ctx),
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::authenticated(methods::VALIDATE_TOKEN, "Resolve a token to its owner")
                .params(json!({ "token": "string" })),
            move |params, _ctx| {
                let request: ValidateToken = serde_json::from_value(params)?;
                Ok(token_info(&inner.tokens.validate(&request.token)?))
            },
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::public(methods::GET_STANDINGS, "Current league table")
                .params(json!({ "league_id": "string" })),
            move |params, _ctx| {
                inner.check_league(params)?;
                Ok(serde_json::to_value(inner.state().standings.ranked())?)
            },
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::public(methods::GET_MATCH_HISTORY, "Every scheduled match and its rounds")
                .params(json!({ "league_id": "string" })),
            move |params, _ctx| {
                inner.check_league(params)?;
                Ok(serde_json::to_value(&inner.state().matches)?)
            },
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::public(methods::GET_LEAGUE_STATUS, "Lifecycle status and progress")
                .params(json!({ "league_id": "string" })),
            move |params, _ctx| {
                inner.check_league(params)?;
                Ok(serde_json::to_value(inner.status_report())?)
            },
        );

        Arc::new(Service::new(
            self.inner.league_id.clone(),
            registry,
            self.inner.tokens.clone(),
        ))
    }
}

impl ManagerInner {
    fn state(&self) -> MutexGuard<'_, LeagueState> {
        self.state.lock().expect("poisoned")
    }

    fn publish(&self, events: Events) {
        for (topic, payload) in events {
            self.events.publish(topic, payload);
        }
    }

    fn check_league(&self, params: Value) -> Result<(), ProtocolError> {
        let query: LeagueQuery = serde_json::from_value(params)?;
        if query.league_id != self.league_id {
            return Err(ProtocolError::not_found(format!(
                "no league {}",
                query.league_id
            )));
        }
        Ok(())
    }

    fn status_report(&self) -> LeagueStatusReport {
        let state = self.state();
        LeagueStatusReport {
            league_id: self.league_id.clone(),
            status: state.status,
            competitors: state.competitors.len(),
            supervisors: state.supervisors.len(),
            total_matches: state.matches.len(),
            terminal_matches: state.matches.iter().filter(|m| m.status.is_terminal()).count(),
            assigned_matches: state.outstanding(),
            current_round: state.current_round(),
        }
    }

    fn check_registration(&self, state: &LeagueState, id: &str) -> Result<(), ProtocolError> {
        if state.status != LeagueStatus::Registering {
            return Err(ProtocolError::invalid_state(format!(
                "registration of {id} refused, league is {}",
                state.status
            )));
        }
        let taken = id == self.league_id
            || state.competitors.iter().any(|c| c.id == id)
            || state.supervisors.iter().any(|s| s.id == id);
        if taken {
            return Err(ProtocolError::duplicate_id(id));
        }
        Ok(())
    }

    fn receipt(&self, agent_id: &str, token: AuthToken) -> RegistrationReceipt {
        RegistrationReceipt {
            league_id: self.league_id.clone(),
            agent_id: agent_id.to_string(),
            auth_token: token.value,
            league_token: self.league_token.value.clone(),
        }
    }

    #[instrument(skip_all, fields(competitor = %request.competitor_id))]
    fn register_competitor(
        &self,
        request: RegisterCompetitor,
    ) -> Result<RegistrationReceipt, ProtocolError> {
        if request.competitor_id.trim().is_empty() || request.endpoint.trim().is_empty() {
            return Err(ProtocolError::validation(
                "competitor id and endpoint must not be empty",
            ));
        }
        let display_name = if request.display_name.trim().is_empty() {
            request.competitor_id.clone()
        } else {
            request.display_name.clone()
        };

        let receipt = {
            let mut state = self.state();
            self.check_registration(&state, &request.competitor_id)?;
            let token = self.tokens.issue(&request.competitor_id);
            let order = state.competitors.len();
            state.competitors.push(CompetitorRecord::new(
                request.competitor_id.clone(),
                display_name.clone(),
                request.endpoint.clone(),
                order,
            ));
            self.receipt(&request.competitor_id, token)
        };
        info!(endpoint = %request.endpoint, "competitor registered");
        self.events.publish(
            topics::PLAYER_REGISTERED,
            json!({ "competitor_id": request.competitor_id, "display_name": display_name }),
        );
        Ok(receipt)
    }

    #[instrument(skip_all, fields(supervisor = %request.supervisor_id))]
    fn register_supervisor(
        &self,
        request: RegisterSupervisor,
    ) -> Result<RegistrationReceipt, ProtocolError> {
        if request.supervisor_id.trim().is_empty() || request.endpoint.trim().is_empty() {
            return Err(ProtocolError::validation(
                "supervisor id and endpoint must not be empty",
            ));
        }
        if request.max_concurrent_matches == 0 {
            return Err(ProtocolError::validation(format!(
                "supervisor {} offers no capacity",
                request.supervisor_id
            )));
        }
        self.check_registration(&self.state(), &request.supervisor_id)?;

        if self.config.verify_capabilities {
            verify_capabilities(&self.client, &request.endpoint, &REQUIRED_METHODS)?;
        }

        let receipt = {
            let mut state = self.state();
            // the lock was released while the peer was probed
            self.check_registration(&state, &request.supervisor_id)?;
            let token = self.tokens.issue(&request.supervisor_id);
            let order = state.supervisors.len();
            state.supervisors.push(SupervisorRecord::new(
                request.supervisor_id.clone(),
                request.endpoint.clone(),
                request.max_concurrent_matches,
                order,
            ));
            self.receipt(&request.supervisor_id, token)
        };
        info!(capacity = request.max_concurrent_matches, "supervisor registered");
        self.events.publish(
            topics::SUPERVISOR_REGISTERED,
            json!({
                "supervisor_id": request.supervisor_id,
                "max_concurrent_matches": request.max_concurrent_matches
            }),
        );
        Ok(receipt)
    }

    fn assignment(&self, state: &LeagueState, m: &MatchRecord) -> MatchAssignment {
        let seat = |id: &String| Seat {
            competitor_id: id.clone(),
            endpoint: state
                .competitors
                .iter()
                .find(|c| &c.id == id)
                .map(|c| c.endpoint.clone())
                .unwrap_or_else(|| id.clone()),
        };
        MatchAssignment {
            league_id: self.league_id.clone(),
            match_id: m.match_id.clone(),
            game: self.config.game.clone(),
            seats: [seat(&m.competitors[0]), seat(&m.competitors[1])],
            round_count: self.config.round_count,
            move_timeout_ms: self.config.move_timeout.as_millis() as u64,
            misbehavior_threshold: self.config.misbehavior_threshold,
            timing_anomaly_window_ms: self.config.timing_anomaly_window.as_millis() as u64,
        }
    }

    /// Pick the next match of the current round and reserve it for a supervisor.
    fn reserve(
        &self,
        state: &mut LeagueState,
        excluded: &[String],
        failures: &mut Vec<SchedulingFailure>,
        events: &mut Events,
    ) -> Option<Reservation> {
        if state.status != LeagueStatus::Running {
            return None;
        }
        let round = state.current_round()?;
        let idx = state.matches.iter().position(|m| state.eligible(m, round))?;

        if state.supervisors.is_empty() {
            let ids: Vec<String> = state
                .matches
                .iter()
                .filter(|m| state.eligible(m, round))
                .map(|m| m.match_id.clone())
                .collect();
            for match_id in ids {
                if let Some(m) = state.matches.iter_mut().find(|m| m.match_id == match_id) {
                    m.dispatch_failed = true;
                }
                let failure = SchedulingFailure {
                    match_id,
                    supervisor_id: None,
                    cause: ErrorCode::SchedulingFailure,
                    message: "no supervisor registered".to_string(),
                };
                warn!("{failure}");
                events.push((
                    topics::MATCH_SCHEDULING_FAILED,
                    serde_json::to_value(&failure).unwrap_or(Value::Null),
                ));
                state.failures.push(failure.clone());
                failures.push(failure);
            }
            return None;
        }

        // every supervisor busy: the match waits for a report to free one
        let supervisor = pick_supervisor(&state.supervisors, excluded)?;
        let supervisor_id = supervisor.id.clone();
        let endpoint = supervisor.endpoint.clone();
        let assignment = self.assignment(state, &state.matches[idx]);

        if let Some(s) = state.supervisor_mut(&supervisor_id) {
            s.load += 1;
        }
        let m = &mut state.matches[idx];
        m.status = MatchStatus::Assigned;
        m.supervisor_id = Some(supervisor_id.clone());
        Some(Reservation {
            match_id: m.match_id.clone(),
            supervisor_id,
            endpoint,
            assignment,
        })
    }

    /// Undo a reservation whose `assign_match` call failed. The match goes back to the pool.
    fn release(&self, state: &mut LeagueState, reservation: &Reservation) {
        if let Some(m) = state
            .matches
            .iter_mut()
            .find(|m| m.match_id == reservation.match_id)
        {
            if m.status == MatchStatus::Assigned
                && m.supervisor_id.as_deref() == Some(reservation.supervisor_id.as_str())
            {
                m.status = MatchStatus::Unassigned;
                m.supervisor_id = None;
            }
        }
        if let Some(s) = state.supervisor_mut(&reservation.supervisor_id) {
            s.load = s.load.saturating_sub(1);
        }
    }

    /// Assign as many matches of the current round as supervisors will take.
    ///
    /// A supervisor that failed once is not tried again in the same pass, and the match it
    /// refused moves on to the next supervisor with capacity. A match nobody took by the end of
    /// the pass is marked `dispatch_failed`.
    fn dispatch_pass(&self) -> (usize, Vec<SchedulingFailure>) {
        let mut assigned = 0;
        let mut failures: Vec<SchedulingFailure> = Vec::new();
        let mut excluded: Vec<String> = Vec::new();
        loop {
            let mut events = Events::new();
            let reservation = {
                let mut state = self.state();
                self.reserve(&mut state, &excluded, &mut failures, &mut events)
            };
            self.publish(events);
            let Some(reservation) = reservation else {
                break;
            };

            let params = serde_json::to_value(&reservation.assignment).unwrap_or(Value::Null);
            let outcome = self.client.call(
                &reservation.endpoint,
                methods::ASSIGN_MATCH,
                params,
                Some(&self.league_token.value),
            );
            match outcome {
                Ok(_) => {
                    assigned += 1;
                    info!(
                        match_id = %reservation.match_id,
                        supervisor = %reservation.supervisor_id,
                        "match assigned"
                    );
                    self.events.publish(
                        topics::MATCH_ASSIGNED,
                        json!({
                            "match_id": reservation.match_id,
                            "supervisor_id": reservation.supervisor_id,
                            "competitors": [
                                reservation.assignment.seats[0].competitor_id,
                                reservation.assignment.seats[1].competitor_id
                            ]
                        }),
                    );
                }
                Err(e) => {
                    let failure = SchedulingFailure {
                        match_id: reservation.match_id.clone(),
                        supervisor_id: Some(reservation.supervisor_id.clone()),
                        cause: e.code(),
                        message: e.to_string(),
                    };
                    {
                        let mut state = self.state();
                        self.release(&mut state, &reservation);
                        state.failures.push(failure.clone());
                    }
                    warn!("{failure}");
                    self.events.publish(
                        topics::MATCH_SCHEDULING_FAILED,
                        serde_json::to_value(&failure).unwrap_or(Value::Null),
                    );
                    excluded.push(reservation.supervisor_id);
                    failures.push(failure);
                }
            }
        }

        if !failures.is_empty() {
            let mut state = self.state();
            for failure in &failures {
                if let Some(m) = state.matches.iter_mut().find(|m| {
                    m.match_id == failure.match_id && m.status == MatchStatus::Unassigned
                }) {
                    m.dispatch_failed = true;
                }
            }
        }
        (assigned, failures)
    }

    /// Wire side of `report_match_result`: check the report and queue it for the run loop.
    fn receive_report(&self, params: Value, _ctx: &CallContext) -> Result<Value, ProtocolError> {
        let report: MatchReport = serde_json::from_value(params)?;
        if report.league_id != self.league_id {
            return Err(ProtocolError::not_found(format!(
                "no league {}",
                report.league_id
            )));
        }
        {
            let state = self.state();
            let m = state
                .matches
                .iter()
                .find(|m| m.match_id == report.match_id)
                .ok_or_else(|| ProtocolError::not_found(format!("no match {}", report.match_id)))?;
            if m.status.is_terminal() {
                debug!(match_id = %report.match_id, "repeated report acknowledged");
                return Ok(serde_json::to_value(Ack::ok())?);
            }
            if m.supervisor_id.as_deref() != Some(report.supervisor_id.as_str()) {
                return Err(ProtocolError::auth(format!(
                    "match {} is not assigned to {}",
                    report.match_id, report.supervisor_id
                )));
            }
            if report.competitors != m.competitors {
                return Err(ProtocolError::validation(format!(
                    "report for {} names the wrong competitors",
                    report.match_id
                )));
            }
        }
        report.check_consistency()?;
        self.report_tx
            .send(report)
            .map_err(|_| ProtocolError::internal("report queue closed"))?;
        Ok(serde_json::to_value(Ack::ok())?)
    }

    fn wait_for_report(&self, timeout: Duration) -> bool {
        let received = {
            let rx = self.report_rx.lock().expect("poisoned");
            rx.recv_timeout(timeout)
        };
        match received {
            Ok(report) => {
                self.apply_one(report);
                true
            }
            Err(_) => false,
        }
    }

    fn apply_one(&self, report: MatchReport) {
        let mut events = Events::new();
        {
            let mut state = self.state();
            self.apply_report(&mut state, report, &mut events);
        }
        self.publish(events);
    }

    fn apply_report(&self, state: &mut LeagueState, report: MatchReport, events: &mut Events) {
        let Some(idx) = state
            .matches
            .iter()
            .position(|m| m.match_id == report.match_id)
        else {
            warn!(match_id = %report.match_id, "report for unknown match dropped");
            return;
        };
        if state.matches[idx].status.is_terminal() {
            debug!(match_id = %report.match_id, "match already settled, report ignored");
            return;
        }

        state.matches[idx].apply_report(&report);
        if let Some(s) = state.supervisor_mut(&report.supervisor_id) {
            s.load = s.load.saturating_sub(1);
        }
        let record = state.matches[idx].clone();
        self.settle(state, &record, events);
        for flag in &report.flags {
            self.record_flag(state, &flag.competitor_id, events);
        }
        self.check_completion(state, events);
    }

    /// Fold a terminal match into the table and the head-to-head records.
    fn settle(&self, state: &mut LeagueState, record: &MatchRecord, events: &mut Events) {
        let Some(effect) = MatchEffect::of(record) else {
            return;
        };
        state.standings.apply(&effect);
        match &effect {
            MatchEffect::Decided { winner, loser } => {
                if let Some(c) = state.competitor_mut(winner) {
                    c.record_against(loser, Some(true));
                }
                if let Some(c) = state.competitor_mut(loser) {
                    c.record_against(winner, Some(false));
                }
            }
            MatchEffect::Tie([a, b]) => {
                if let Some(c) = state.competitor_mut(a) {
                    c.record_against(b, None);
                }
                if let Some(c) = state.competitor_mut(b) {
                    c.record_against(a, None);
                }
            }
            MatchEffect::Void => {}
        }

        let topic = if record.status == MatchStatus::Completed {
            topics::MATCH_COMPLETED
        } else {
            topics::MATCH_FORFEITED
        };
        info!(match_id = %record.match_id, winner = ?record.winner, "match settled");
        events.push((
            topic,
            json!({
                "match_id": record.match_id,
                "competitors": record.competitors,
                "winner": record.winner,
                "round_wins": record.round_wins,
                "forfeit_cause": record.forfeit_cause,
                "forfeit_reason": record.forfeit_reason,
            }),
        ));
        events.push((
            topics::STANDINGS_UPDATED,
            serde_json::to_value(state.standings.ranked()).unwrap_or(Value::Null),
        ));
        if self.config.verbose {
            print_match_result(record);
        }
    }

    fn record_flag(&self, state: &mut LeagueState, competitor_id: &str, events: &mut Events) {
        let limit = self.config.ejection_flag_limit;
        let Some(c) = state.competitor_mut(competitor_id) else {
            return;
        };
        c.flag_count += 1;
        if limit == 0 || c.ejected || c.flag_count < limit {
            return;
        }
        c.ejected = true;
        let flag_count = c.flag_count;
        warn!(competitor = competitor_id, flag_count, "competitor ejected");
        events.push((
            topics::COMPETITOR_EJECTED,
            json!({ "competitor_id": competitor_id, "flag_count": flag_count }),
        ));

        let pending: Vec<usize> = state
            .matches
            .iter()
            .enumerate()
            .filter(|(_, m)| m.status == MatchStatus::Unassigned && m.involves(competitor_id))
            .map(|(i, _)| i)
            .collect();
        for idx in pending {
            state.matches[idx].forfeit_locally(competitor_id, "competitor ejected");
            let record = state.matches[idx].clone();
            self.settle(state, &record, events);
        }
    }

    fn check_completion(&self, state: &mut LeagueState, events: &mut Events) {
        let done = !state.matches.is_empty() && state.matches.iter().all(|m| m.status.is_terminal());
        if !done || !matches!(state.status, LeagueStatus::Running | LeagueStatus::Paused) {
            return;
        }
        state.status = LeagueStatus::Completed;
        info!(league = %self.league_id, "league completed");
        events.push((
            topics::LEAGUE_COMPLETED,
            json!({ "league_id": self.league_id, "standings": state.standings.ranked() }),
        ));
    }
}

fn print_match_result(record: &MatchRecord) {
    let [home, away] = &record.competitors;
    let [h, a] = record.round_wins;
    // clear line, green match, score, red forfeit reason, start of line
    println!(
        "\x1b[2K\x1b[32m{}: \x1b[39m{home} {h}-{a} {away} \x1b[31m{}\x1b[39m\x1b[0G",
        record.match_id,
        record.forfeit_reason.as_deref().unwrap_or("")
    );
}

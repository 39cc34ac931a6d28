//! Referee agent: accepts match assignments from the orchestrator and runs each one on its own
//! thread with a [`MatchController`].
//!
//! Final reports are delivered through a [`ReportQueue`]. A report that cannot be delivered is
//! parked and retried in the background a bounded number of times; the match itself is never
//! replayed. A report given up on is listed in [`SupervisorStatus::dropped_reports`] and
//! announced on `match.report_dropped`, so the orchestrator can reconcile the match.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::configuration::Configuration;
use crate::error::{ErrorCode, ProtocolError};
use crate::event_bus::{topics, EventBus};
use crate::game_interface::GameRegistry;
use crate::match_controller::{CancelSignal, MatchController};
use crate::protocol::messages::{
    methods, Ack, CancelMatch, MatchAssignment, MatchReport, RegisterSupervisor,
    RegistrationReceipt, SupervisorStatus,
};
use crate::protocol::{CallContext, MethodRegistry, MethodSpec, Service, TrustedPeers};
use crate::resilience::{BreakerState, CallError, ResilientClient};
use crate::transport::Transport;

/// Methods an orchestrator expects a supervisor to expose.
pub const REQUIRED_METHODS: [&str; 3] = [
    methods::ASSIGN_MATCH,
    methods::CANCEL_MATCH,
    methods::GET_STATUS,
];

#[derive(Debug, Clone)]
struct Registration {
    league_id: String,
    orchestrator_endpoint: String,
    token: String,
}

#[derive(Debug)]
struct PendingReport {
    report: MatchReport,
    endpoint: String,
    token: String,
    rounds_left: u32,
}

/// Delivery of final match reports to the orchestrator.
pub struct ReportQueue {
    client: Arc<ResilientClient>,
    events: EventBus,
    pending: Mutex<VecDeque<PendingReport>>,
    dropped: Mutex<Vec<String>>,
    retry_rounds: u32,
}

impl ReportQueue {
    pub fn new(client: Arc<ResilientClient>, retry_rounds: u32, events: EventBus) -> Self {
        ReportQueue {
            client,
            events,
            pending: Mutex::new(VecDeque::new()),
            dropped: Mutex::new(Vec::new()),
            retry_rounds,
        }
    }

    /// Retry parked reports every `tick` for as long as the queue is alive.
    pub fn spawn_retry_loop(queue: &Arc<ReportQueue>, tick: Duration) {
        let weak: Weak<ReportQueue> = Arc::downgrade(queue);
        thread::spawn(move || loop {
            thread::sleep(tick);
            let Some(queue) = weak.upgrade() else {
                break;
            };
            if queue.pending_len() > 0 {
                queue.retry_pending();
            }
        });
    }

    fn send(&self, report: &MatchReport, endpoint: &str, token: &str) -> Result<(), CallError> {
        let params = serde_json::to_value(report).unwrap_or(Value::Null);
        self.client
            .call(endpoint, methods::REPORT_MATCH_RESULT, params, Some(token))
            .map(|_| ())
    }

    /// Whether a failed delivery is worth retrying later.
    fn parkable(e: &CallError) -> bool {
        match e {
            CallError::Remote { error, .. } => error.is_retryable(),
            CallError::Malformed { .. } => false,
            _ => true,
        }
    }

    /// Deliver now, or park for a later retry. Returns true if delivered.
    pub fn submit(&self, report: MatchReport, endpoint: &str, token: &str) -> bool {
        match self.send(&report, endpoint, token) {
            Ok(()) => {
                debug!(match_id = %report.match_id, "report delivered");
                true
            }
            Err(e) if Self::parkable(&e) && self.retry_rounds > 0 => {
                warn!(match_id = %report.match_id, "report not delivered, parked: {e}");
                self.pending.lock().expect("poisoned").push_back(PendingReport {
                    report,
                    endpoint: endpoint.to_string(),
                    token: token.to_string(),
                    rounds_left: self.retry_rounds,
                });
                false
            }
            Err(e) => {
                self.give_up(&report, &e);
                false
            }
        }
    }

    /// One delivery attempt for every parked report. Returns how many were delivered.
    pub fn retry_pending(&self) -> usize {
        let batch: Vec<PendingReport> = self.pending.lock().expect("poisoned").drain(..).collect();
        let mut delivered = 0;
        let mut keep = Vec::new();
        for mut parked in batch {
            match self.send(&parked.report, &parked.endpoint, &parked.token) {
                Ok(()) => {
                    info!(match_id = %parked.report.match_id, "parked report delivered");
                    delivered += 1;
                }
                Err(e) => {
                    parked.rounds_left -= 1;
                    if parked.rounds_left == 0 || !Self::parkable(&e) {
                        self.give_up(&parked.report, &e);
                    } else {
                        keep.push(parked);
                    }
                }
            }
        }
        self.pending.lock().expect("poisoned").extend(keep);
        delivered
    }

    fn give_up(&self, report: &MatchReport, e: &CallError) {
        error!(match_id = %report.match_id, "giving up on report: {e}");
        self.dropped
            .lock()
            .expect("poisoned")
            .push(report.match_id.clone());
        self.events.publish(
            topics::MATCH_REPORT_DROPPED,
            json!({
                "match_id": report.match_id,
                "supervisor_id": report.supervisor_id,
                "reason": e.to_string(),
            }),
        );
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("poisoned").len()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let pending = self.pending.lock().expect("poisoned");
        pending.iter().map(|p| p.report.match_id.clone()).collect()
    }

    /// Matches whose report was given up on, oldest first.
    pub fn dropped_ids(&self) -> Vec<String> {
        self.dropped.lock().expect("poisoned").clone()
    }
}

struct SupervisorInner {
    id: String,
    endpoint: RwLock<String>,
    capacity: usize,
    games: GameRegistry,
    client: Arc<ResilientClient>,
    trusted: Arc<TrustedPeers>,
    events: EventBus,
    registration: RwLock<Option<Registration>>,
    active: Mutex<HashMap<String, CancelSignal>>,
    reports: Arc<ReportQueue>,
}

/// Cloning gives another handle on the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// A supervisor knowing the built-in games. Its endpoint defaults to its id.
    pub fn new(
        id: impl Into<String>,
        config: &Configuration,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        Self::with_games(id, config, transport, events, GameRegistry::with_builtins())
    }

    pub fn with_games(
        id: impl Into<String>,
        config: &Configuration,
        transport: Arc<dyn Transport>,
        events: EventBus,
        games: GameRegistry,
    ) -> Self {
        let id = id.into();
        let client = Arc::new(ResilientClient::from_config(&id, transport, config));
        let reports = Arc::new(ReportQueue::new(
            client.clone(),
            config.report_retry_rounds,
            events.clone(),
        ));
        ReportQueue::spawn_retry_loop(
            &reports,
            (config.retry_backoff_base * 2).max(Duration::from_millis(10)),
        );
        Supervisor {
            inner: Arc::new(SupervisorInner {
                endpoint: RwLock::new(id.clone()),
                id,
                capacity: config.max_concurrent_matches,
                games,
                client,
                trusted: Arc::new(TrustedPeers::new()),
                events,
                registration: RwLock::new(None),
                active: Mutex::new(HashMap::new()),
                reports,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn endpoint(&self) -> String {
        self.inner.endpoint.read().expect("poisoned").clone()
    }

    /// Where the orchestrator reaches this supervisor. Set before [`register`](Self::register).
    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        *self.inner.endpoint.write().expect("poisoned") = endpoint.into();
    }

    pub fn status(&self) -> SupervisorStatus {
        self.inner.status()
    }

    pub fn pending_reports(&self) -> usize {
        self.inner.reports.pending_len()
    }

    /// Retry parked reports now instead of waiting for the background loop.
    pub fn flush_reports(&self) -> usize {
        self.inner.reports.retry_pending()
    }

    pub fn breaker_state(&self, endpoint: &str) -> BreakerState {
        self.inner.client.breaker_state(endpoint)
    }

    /// Register with the orchestrator and trust its league token from then on.
    #[instrument(skip(self), fields(supervisor = %self.inner.id))]
    pub fn register(&self, orchestrator_endpoint: &str) -> Result<RegistrationReceipt, ProtocolError> {
        let request = RegisterSupervisor {
            supervisor_id: self.inner.id.clone(),
            endpoint: self.endpoint(),
            max_concurrent_matches: self.inner.capacity,
        };
        let value = self
            .inner
            .client
            .call(
                orchestrator_endpoint,
                methods::REGISTER_SUPERVISOR,
                serde_json::to_value(&request)?,
                None,
            )
            .map_err(CallError::into_protocol)?;
        let receipt: RegistrationReceipt = serde_json::from_value(value)?;

        self.inner
            .trusted
            .pin(receipt.league_token.clone(), receipt.league_id.clone());
        *self.inner.registration.write().expect("poisoned") = Some(Registration {
            league_id: receipt.league_id.clone(),
            orchestrator_endpoint: orchestrator_endpoint.to_string(),
            token: receipt.auth_token.clone(),
        });
        info!(league = %receipt.league_id, "registered");
        Ok(receipt)
    }

    /// Wire front of this supervisor.
    pub fn service(&self) -> Arc<Service> {
        let mut registry = MethodRegistry::new();

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::authenticated(methods::ASSIGN_MATCH, "Start refereeing a match").params(
                json!({
                    "league_id": "string", "match_id": "string", "game": "string",
                    "seats": "[{competitor_id, endpoint}; 2]", "round_count": "integer",
                    "move_timeout_ms": "integer", "misbehavior_threshold": "integer",
                    "timing_anomaly_window_ms": "integer"
                }),
            ),
            move |params, ctx| inner.assign(params, ctx),
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::authenticated(methods::CANCEL_MATCH, "Cancel a running match")
                .params(json!({ "match_id": "string", "reason": "string" })),
            move |params, ctx| {
                inner.check_orchestrator(ctx)?;
                let request: CancelMatch = serde_json::from_value(params)?;
                let active = inner.active.lock().expect("poisoned");
                let signal = active.get(&request.match_id).ok_or_else(|| {
                    ProtocolError::not_found(format!("no running match {}", request.match_id))
                })?;
                signal.cancel(request.reason);
                Ok(serde_json::to_value(Ack::ok())?)
            },
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::public(methods::GET_STATUS, "Current load and running matches"),
            move |_params, _ctx| Ok(serde_json::to_value(inner.status())?),
        );

        Arc::new(Service::new(
            self.inner.id.clone(),
            registry,
            self.inner.trusted.clone(),
        ))
    }
}

impl SupervisorInner {
    fn status(&self) -> SupervisorStatus {
        let active = self.active.lock().expect("poisoned");
        let mut active_matches: Vec<String> = active.keys().cloned().collect();
        active_matches.sort();
        SupervisorStatus {
            supervisor_id: self.id.clone(),
            load: active.len(),
            capacity: self.capacity,
            active_matches,
            pending_reports: self.reports.pending_ids(),
            dropped_reports: self.reports.dropped_ids(),
        }
    }

    fn registration(&self) -> Result<Registration, ProtocolError> {
        self.registration
            .read()
            .expect("poisoned")
            .clone()
            .ok_or_else(|| ProtocolError::invalid_state(format!("{} is not registered", self.id)))
    }

    fn check_orchestrator(&self, ctx: &CallContext) -> Result<Registration, ProtocolError> {
        let registration = self.registration()?;
        if ctx.caller.as_deref() != Some(registration.league_id.as_str()) {
            return Err(ProtocolError::auth("only the league orchestrator may do this"));
        }
        Ok(registration)
    }

    fn assign(self: &Arc<Self>, params: Value, ctx: &CallContext) -> Result<Value, ProtocolError> {
        let registration = self.check_orchestrator(ctx)?;
        let assignment: MatchAssignment = serde_json::from_value(params)?;

        if assignment.league_id != registration.league_id {
            return Err(ProtocolError::validation(format!(
                "assignment for unknown league {}",
                assignment.league_id
            )));
        }
        if assignment.seats[0].competitor_id == assignment.seats[1].competitor_id {
            return Err(ProtocolError::validation("a match needs two distinct competitors"));
        }
        if assignment.round_count == 0 || assignment.move_timeout_ms == 0 {
            return Err(ProtocolError::validation(
                "round_count and move_timeout_ms must be positive",
            ));
        }
        let game = self.games.get(&assignment.game).ok_or_else(|| {
            ProtocolError::validation(format!("unknown game {}", assignment.game))
        })?;

        let mut controller = MatchController::new(
            assignment,
            self.id.clone(),
            registration.token.clone(),
            game,
            self.client.clone(),
            self.events.clone(),
        );
        let match_id = controller.match_id().to_string();
        {
            let mut active = self.active.lock().expect("poisoned");
            if active.contains_key(&match_id) {
                return Err(ProtocolError::duplicate_id(&match_id));
            }
            if active.len() >= self.capacity {
                return Err(ProtocolError::new(
                    ErrorCode::SchedulingFailure,
                    format!("{} is at capacity ({})", self.id, self.capacity),
                ));
            }
            active.insert(match_id.clone(), controller.cancel_signal());
        }
        info!(supervisor = %self.id, %match_id, "match accepted");

        let inner = self.clone();
        thread::spawn(move || {
            let report = controller.run();
            inner.active.lock().expect("poisoned").remove(&match_id);
            inner.reports.submit(
                report.clone(),
                &registration.orchestrator_endpoint,
                &registration.token,
            );
            controller.mark_complete();
            controller.notify_final(&report);
        });

        Ok(serde_json::to_value(Ack::ok())?)
    }
}

//! Per-match state machine run by a supervisor.
//!
//! ```text
//! INITIALIZING → INVITING → ROUND_ACTIVE ⇄ RESOLVING → REPORTING → COMPLETE
//!                    └───────────┴──────→ FORFEITED
//! ```
//!
//! A controller owns everything about its match and is driven by a single thread, so rounds are
//! strictly ordered. The only remote peers it talks to are the two competitors; delivering the
//! final report to the orchestrator is the supervisor's job.

use std::fmt;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::event_bus::{topics, EventBus};
use crate::game_interface::Game;
use crate::protocol::messages::{
    methods, FinalNotice, Invitation, InvitationReply, MatchAssignment, MatchOutcomeStatus,
    MatchReport, MisbehaviorCounters, MisbehaviorFlag, MoveOrigin, MoveRecord, MoveReply,
    MoveRequest, ResultNotice, Role, RoundRecord,
};
use crate::protocol::unix_millis;
use crate::resilience::{CallError, ResilientClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerStatus {
    Initializing,
    Inviting,
    RoundActive,
    Resolving,
    Reporting,
    Complete,
    Forfeited,
}

impl ControllerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerStatus::Complete | ControllerStatus::Forfeited)
    }

    pub fn can_transition_to(self, to: ControllerStatus) -> bool {
        use ControllerStatus::*;
        match (self, to) {
            (Initializing, Inviting)
            | (Inviting, RoundActive)
            | (RoundActive, Resolving)
            | (Resolving, RoundActive)
            | (Resolving, Reporting)
            | (Inviting, Reporting)
            | (Reporting, Complete) => true,
            (from, Forfeited) => !from.is_terminal() && from != Reporting,
            _ => false,
        }
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerStatus::Initializing => "INITIALIZING",
            ControllerStatus::Inviting => "INVITING",
            ControllerStatus::RoundActive => "ROUND_ACTIVE",
            ControllerStatus::Resolving => "RESOLVING",
            ControllerStatus::Reporting => "REPORTING",
            ControllerStatus::Complete => "COMPLETE",
            ControllerStatus::Forfeited => "FORFEITED",
        };
        f.write_str(s)
    }
}

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<Mutex<Option<String>>>);

impl CancelSignal {
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.0.lock().expect("poisoned");
        guard.get_or_insert_with(|| reason.into());
    }

    pub fn reason(&self) -> Option<String> {
        self.0.lock().expect("poisoned").clone()
    }
}

/// What came back for one seat's move request.
#[derive(Debug)]
enum Submission {
    Move { value: Value, after: Duration },
    Invalid { after: Option<Duration>, reason: String },
    TimedOut,
    Unavailable(String),
}

impl Submission {
    fn replied_after(&self) -> Option<Duration> {
        match self {
            Submission::Move { after, .. } => Some(*after),
            Submission::Invalid { after, .. } => *after,
            _ => None,
        }
    }
}

/// Competitor seat that caused a forfeit, and why.
type Forfeit = (usize, String);

pub struct MatchController {
    assignment: MatchAssignment,
    supervisor_id: String,
    token: String,
    game: Arc<dyn Game>,
    client: Arc<ResilientClient>,
    events: EventBus,
    cancel: CancelSignal,
    status: ControllerStatus,
    state: Value,
    rounds: Vec<RoundRecord>,
    counters: [MisbehaviorCounters; 2],
    flagged: [bool; 2],
    flags: Vec<MisbehaviorFlag>,
    round_wins: [u32; 2],
    forfeit_cause: Option<usize>,
    forfeit_reason: Option<String>,
}

impl MatchController {
    /// `token` authenticates the supervisor towards the competitors.
    pub fn new(
        assignment: MatchAssignment,
        supervisor_id: impl Into<String>,
        token: impl Into<String>,
        game: Arc<dyn Game>,
        client: Arc<ResilientClient>,
        events: EventBus,
    ) -> Self {
        let state = game.initial_state();
        MatchController {
            assignment,
            supervisor_id: supervisor_id.into(),
            token: token.into(),
            game,
            client,
            events,
            cancel: CancelSignal::default(),
            status: ControllerStatus::Initializing,
            state,
            rounds: vec![],
            counters: Default::default(),
            flagged: [false, false],
            flags: vec![],
            round_wins: [0, 0],
            forfeit_cause: None,
            forfeit_reason: None,
        }
    }

    pub fn match_id(&self) -> &str {
        &self.assignment.match_id
    }

    pub fn status(&self) -> ControllerStatus {
        self.status
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    fn competitor(&self, seat: usize) -> &str {
        &self.assignment.seats[seat].competitor_id
    }

    fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment.move_timeout_ms)
    }

    fn transition(&mut self, to: ControllerStatus) -> bool {
        if !self.status.can_transition_to(to) {
            error!(match_id = %self.assignment.match_id, "illegal transition {} -> {to}", self.status);
            return false;
        }
        trace!(match_id = %self.assignment.match_id, "{} -> {to}", self.status);
        self.status = to;
        true
    }

    /// Play the match to its end and build the report. Leaves the controller in REPORTING or
    /// FORFEITED.
    #[instrument(skip(self), fields(match_id = %self.assignment.match_id))]
    pub fn run(&mut self) -> MatchReport {
        self.transition(ControllerStatus::Inviting);
        if let Err((seat, reason)) = self.invite() {
            return self.forfeit(Some(seat), reason);
        }

        for index in 1..=self.assignment.round_count {
            if let Some(reason) = self.cancel.reason() {
                return self.forfeit(None, format!("cancelled: {reason}"));
            }
            let any_flagged = self.flagged.iter().any(|f| *f);
            if !any_flagged && self.game.is_terminal(&self.state) {
                debug!(index, "game reached a terminal state");
                break;
            }

            self.transition(ControllerStatus::RoundActive);
            if any_flagged {
                self.transition(ControllerStatus::Resolving);
                self.award_round(index);
                continue;
            }
            match self.play_round(index) {
                Ok(moves) => {
                    self.transition(ControllerStatus::Resolving);
                    self.resolve_round(index, moves);
                }
                Err((seat, reason)) => return self.forfeit(Some(seat), reason),
            }
        }

        self.transition(ControllerStatus::Reporting);
        let report = self.report(MatchOutcomeStatus::Completed, self.winner());
        info!(
            winner = report.winner.as_deref().unwrap_or("tie"),
            "match finished {}-{}",
            report.round_wins[0],
            report.round_wins[1]
        );
        report
    }

    /// The report has been handed over for delivery.
    pub fn mark_complete(&mut self) {
        if self.status == ControllerStatus::Reporting {
            self.transition(ControllerStatus::Complete);
        }
    }

    fn invite(&mut self) -> Result<(), Forfeit> {
        for seat in 0..2 {
            let invitation = Invitation {
                match_id: self.assignment.match_id.clone(),
                referee_id: self.supervisor_id.clone(),
                opponent_id: self.competitor(1 - seat).to_string(),
                role: Role::from_seat(seat),
                game: self.assignment.game.clone(),
                round_count: self.assignment.round_count,
            };
            let params = serde_json::to_value(&invitation).unwrap_or(Value::Null);
            let endpoint = &self.assignment.seats[seat].endpoint;
            let reply = self
                .client
                .call(endpoint, methods::INVITE, params, Some(&self.token))
                .map_err(|e| (seat, format!("invitation failed: {e}")))?;
            let reply: InvitationReply = serde_json::from_value(reply)
                .map_err(|e| (seat, format!("malformed invitation reply: {e}")))?;
            if !reply.accepted {
                let why = reply.reason.unwrap_or_else(|| "no reason given".to_string());
                return Err((seat, format!("declined invitation: {why}")));
            }
            debug!(competitor = self.competitor(seat), "accepted invitation");
        }
        Ok(())
    }

    /// Collect both moves, substituting defaults and counting misbehavior.
    fn play_round(&mut self, index: u32) -> Result<[MoveRecord; 2], Forfeit> {
        let submissions = self.collect_moves(index);

        if let Some((seat, Submission::Unavailable(reason))) = submissions
            .iter()
            .enumerate()
            .find(|(_, s)| matches!(s, Submission::Unavailable(_)))
        {
            return Err((seat, format!("unavailable in round {index}: {reason}")));
        }

        let anomaly_from = self.move_timeout().saturating_sub(Duration::from_millis(
            self.assignment.timing_anomaly_window_ms,
        ));
        let moves = [0, 1].map(|seat| {
            let competitor_id = self.assignment.seats[seat].competitor_id.clone();
            match &submissions[seat] {
                Submission::Move { value, after } => {
                    let opponent_first = submissions[1 - seat]
                        .replied_after()
                        .is_some_and(|other| other < *after);
                    if opponent_first && *after >= anomaly_from {
                        self.counters[seat].timing_anomalies += 1;
                        debug!(%competitor_id, ?after, "timing anomaly");
                    }
                    MoveRecord {
                        competitor_id,
                        value: value.clone(),
                        submitted_after_ms: Some(after.as_millis() as u64),
                        valid: true,
                        origin: MoveOrigin::Submitted,
                    }
                }
                Submission::Invalid { after, reason } => {
                    self.counters[seat].invalid_moves += 1;
                    warn!(%competitor_id, index, "invalid move replaced: {reason}");
                    MoveRecord {
                        competitor_id,
                        value: self.game.default_move(&self.state),
                        submitted_after_ms: after.map(|a| a.as_millis() as u64),
                        valid: false,
                        origin: MoveOrigin::InvalidReplaced,
                    }
                }
                Submission::TimedOut | Submission::Unavailable(_) => {
                    self.counters[seat].timeouts += 1;
                    warn!(%competitor_id, index, "no move before the deadline, default move used");
                    MoveRecord {
                        competitor_id,
                        value: self.game.default_move(&self.state),
                        submitted_after_ms: None,
                        valid: false,
                        origin: MoveOrigin::TimeoutDefault,
                    }
                }
            }
        });
        Ok(moves)
    }

    fn resolve_round(&mut self, index: u32, moves: [MoveRecord; 2]) {
        let outcome = self
            .game
            .compute_outcome([&moves[0].value, &moves[1].value], &mut self.state);
        self.record_round(index, moves, outcome.winner_seat(), false);
        self.check_misbehavior(index);
    }

    /// Ask both competitors at once, waiting no longer than the move deadline.
    fn collect_moves(&self, index: u32) -> [Submission; 2] {
        let timeout = self.move_timeout();
        let started = Instant::now();
        let deadline = started + timeout;
        let deadline_ms = unix_millis() + self.assignment.move_timeout_ms;

        let (tx, rx) = mpsc::channel();
        for seat in 0..2 {
            let request = MoveRequest {
                match_id: self.assignment.match_id.clone(),
                referee_id: self.supervisor_id.clone(),
                round: index,
                deadline_ms,
                own_score: self.round_wins[seat],
                opponent_score: self.round_wins[1 - seat],
            };
            let params = serde_json::to_value(&request).unwrap_or(Value::Null);
            let endpoint = self.assignment.seats[seat].endpoint.clone();
            let client = self.client.clone();
            let token = self.token.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = client.call_with_deadline(
                    &endpoint,
                    methods::REQUEST_MOVE,
                    params,
                    Some(&token),
                    deadline,
                );
                // the controller may have moved on, the reply is then discarded
                let _ = tx.send((seat, result, started.elapsed()));
            });
        }
        drop(tx);

        let mut replies: [Option<(Result<Value, CallError>, Duration)>; 2] = [None, None];
        while replies.iter().any(Option::is_none) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((seat, result, after)) => replies[seat] = Some((result, after)),
                Err(_) => break,
            }
        }

        replies.map(|reply| match reply {
            None => Submission::TimedOut,
            Some((_, after)) if after > timeout => Submission::TimedOut,
            Some((Ok(value), after)) => self.check_move(value, after),
            Some((Err(CallError::TimedOut { .. }), _)) => Submission::TimedOut,
            Some((Err(e), _)) if e.is_unavailable() => Submission::Unavailable(e.to_string()),
            Some((Err(e), after)) => Submission::Invalid {
                after: Some(after),
                reason: e.to_string(),
            },
        })
    }

    fn check_move(&self, reply: Value, after: Duration) -> Submission {
        let reply: MoveReply = match serde_json::from_value(reply) {
            Ok(reply) => reply,
            Err(e) => {
                return Submission::Invalid {
                    after: Some(after),
                    reason: format!("malformed move reply: {e}"),
                }
            }
        };
        match self.game.validate_move(&reply.value, &self.state) {
            Ok(()) => Submission::Move {
                value: reply.value,
                after,
            },
            Err(e) => Submission::Invalid {
                after: Some(after),
                reason: e.to_string(),
            },
        }
    }

    /// A round decided by a misbehavior flag, played without contacting anyone.
    fn award_round(&mut self, index: u32) {
        let winner_seat = match self.flagged {
            [true, false] => Some(1),
            [false, true] => Some(0),
            _ => None,
        };
        let moves = [0, 1].map(|seat| MoveRecord {
            competitor_id: self.competitor(seat).to_string(),
            value: self.game.default_move(&self.state),
            submitted_after_ms: None,
            valid: true,
            origin: MoveOrigin::Awarded,
        });
        self.record_round(index, moves, winner_seat, true);
    }

    fn record_round(
        &mut self,
        index: u32,
        moves: [MoveRecord; 2],
        winner_seat: Option<usize>,
        awarded: bool,
    ) {
        debug_assert_eq!(index as usize, self.rounds.len() + 1);
        if let Some(seat) = winner_seat {
            self.round_wins[seat] += 1;
        }
        let record = RoundRecord {
            index,
            moves,
            winner: winner_seat.map(|seat| self.competitor(seat).to_string()),
            resolved_at_ms: unix_millis(),
            awarded,
        };
        trace!(index, winner = ?record.winner, awarded, "round resolved");
        self.events.publish(
            topics::ROUND_COMPLETED,
            json!({ "match_id": self.assignment.match_id, "round": record }),
        );
        if !awarded {
            self.notify(ResultNotice {
                match_id: self.assignment.match_id.clone(),
                referee_id: self.supervisor_id.clone(),
                round: Some(record.clone()),
                final_result: None,
            });
        }
        self.rounds.push(record);
    }

    fn check_misbehavior(&mut self, index: u32) {
        let threshold = self.assignment.misbehavior_threshold;
        for seat in 0..2 {
            if self.flagged[seat] || self.counters[seat].score() < threshold {
                continue;
            }
            self.flagged[seat] = true;
            let flag = MisbehaviorFlag {
                competitor_id: self.competitor(seat).to_string(),
                counters: self.counters[seat].clone(),
                flagged_at_round: index,
            };
            warn!(
                competitor = %flag.competitor_id,
                score = flag.counters.score(),
                "competitor flagged for misbehavior"
            );
            self.events.publish(
                topics::COMPETITOR_FLAGGED,
                json!({ "match_id": self.assignment.match_id, "flag": flag }),
            );
            self.flags.push(flag);
        }
    }

    fn winner(&self) -> Option<String> {
        match self.flagged {
            [true, false] => return Some(self.competitor(1).to_string()),
            [false, true] => return Some(self.competitor(0).to_string()),
            [true, true] => return None,
            [false, false] => {}
        }
        match self.round_wins[0].cmp(&self.round_wins[1]) {
            std::cmp::Ordering::Greater => Some(self.competitor(0).to_string()),
            std::cmp::Ordering::Less => Some(self.competitor(1).to_string()),
            std::cmp::Ordering::Equal => None,
        }
    }

    fn forfeit(&mut self, cause: Option<usize>, reason: String) -> MatchReport {
        self.transition(ControllerStatus::Forfeited);
        self.forfeit_cause = cause;
        let cause_id = cause.map(|seat| self.competitor(seat).to_string());
        warn!(cause = cause_id.as_deref().unwrap_or("none"), "match forfeited: {reason}");
        self.forfeit_reason = Some(reason);
        let winner = cause.map(|seat| self.competitor(1 - seat).to_string());
        self.report(MatchOutcomeStatus::Forfeited, winner)
    }

    fn report(&self, status: MatchOutcomeStatus, winner: Option<String>) -> MatchReport {
        MatchReport {
            league_id: self.assignment.league_id.clone(),
            match_id: self.assignment.match_id.clone(),
            supervisor_id: self.supervisor_id.clone(),
            competitors: [0, 1].map(|seat| self.competitor(seat).to_string()),
            status,
            winner,
            round_wins: self.round_wins,
            rounds: self.rounds.clone(),
            flags: self.flags.clone(),
            forfeit_cause: self.forfeit_cause.map(|seat| self.competitor(seat).to_string()),
            forfeit_reason: self.forfeit_reason.clone(),
        }
    }

    /// Tell both competitors how the match ended. Best effort.
    pub fn notify_final(&self, report: &MatchReport) {
        self.notify(ResultNotice {
            match_id: report.match_id.clone(),
            referee_id: self.supervisor_id.clone(),
            round: None,
            final_result: Some(FinalNotice {
                status: report.status,
                winner: report.winner.clone(),
                round_wins: report.round_wins,
            }),
        });
    }

    fn notify(&self, notice: ResultNotice) {
        let params = serde_json::to_value(&notice).unwrap_or(Value::Null);
        for seat in &self.assignment.seats {
            if let Err(e) = self.client.call(
                &seat.endpoint,
                methods::REPORT_RESULT,
                params.clone(),
                Some(&self.token),
            ) {
                debug!(competitor = %seat.competitor_id, "result notice not delivered: {e}");
            }
        }
    }
}

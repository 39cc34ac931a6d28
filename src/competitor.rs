//! Player agent: a thin shell around a [`Strategy`].
//!
//! The shell owns sequencing (only accepted, unfinished matches may ask for moves), the per-match
//! history handed to the strategy, and authentication of the supervisors calling it. Supervisor
//! tokens are minted by the orchestrator, so they are resolved through a [`TokenIntrospector`]
//! pointed at the orchestrator once registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::configuration::Configuration;
use crate::error::ProtocolError;
use crate::protocol::messages::{
    methods, Ack, FinalNotice, Invitation, InvitationReply, MoveReply, MoveRequest,
    RegisterCompetitor, RegistrationReceipt, ResultNotice, Role, RoundRecord,
};
use crate::protocol::{CallContext, MethodRegistry, MethodSpec, Service, TokenIntrospector};
use crate::resilience::{CallError, ResilientClient};
use crate::strategy::{MatchContext, Strategy};
use crate::transport::Transport;

/// A match this competitor played to the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedMatch {
    pub match_id: String,
    pub opponent_id: String,
    pub role: Role,
    pub result: FinalNotice,
    pub rounds: Vec<RoundRecord>,
}

#[derive(Debug)]
struct ActiveMatch {
    invitation: Invitation,
    history: Vec<RoundRecord>,
}

#[derive(Debug, Default)]
struct MatchBook {
    active: HashMap<String, ActiveMatch>,
    finished: Vec<FinishedMatch>,
}

impl MatchBook {
    fn unknown(&self, match_id: &str) -> ProtocolError {
        if self.finished.iter().any(|m| m.match_id == match_id) {
            ProtocolError::sequencing(format!("match {match_id} is already finished"))
        } else {
            ProtocolError::sequencing(format!("match {match_id} was never accepted"))
        }
    }
}

struct CompetitorInner {
    id: String,
    display_name: String,
    endpoint: RwLock<String>,
    strategy: Arc<dyn Strategy>,
    client: Arc<ResilientClient>,
    introspector: Arc<TokenIntrospector>,
    token: RwLock<Option<String>>,
    book: Mutex<MatchBook>,
}

/// Cloning gives another handle on the same competitor.
#[derive(Clone)]
pub struct Competitor {
    inner: Arc<CompetitorInner>,
}

impl Competitor {
    /// Its endpoint defaults to its id.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        strategy: Arc<dyn Strategy>,
        config: &Configuration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let id = id.into();
        let client = Arc::new(ResilientClient::from_config(&id, transport, config));
        Competitor {
            inner: Arc::new(CompetitorInner {
                endpoint: RwLock::new(id.clone()),
                id,
                display_name: display_name.into(),
                strategy,
                introspector: Arc::new(TokenIntrospector::new(client.clone())),
                client,
                token: RwLock::new(None),
                book: Mutex::new(MatchBook::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn endpoint(&self) -> String {
        self.inner.endpoint.read().expect("poisoned").clone()
    }

    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        *self.inner.endpoint.write().expect("poisoned") = endpoint.into();
    }

    /// Token received at registration.
    pub fn token(&self) -> Option<String> {
        self.inner.token.read().expect("poisoned").clone()
    }

    pub fn finished_matches(&self) -> Vec<FinishedMatch> {
        self.inner.book.lock().expect("poisoned").finished.clone()
    }

    pub fn active_matches(&self) -> Vec<String> {
        let book = self.inner.book.lock().expect("poisoned");
        let mut ids: Vec<String> = book.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[instrument(skip(self), fields(competitor = %self.inner.id))]
    pub fn register(&self, orchestrator_endpoint: &str) -> Result<RegistrationReceipt, ProtocolError> {
        let request = RegisterCompetitor {
            competitor_id: self.inner.id.clone(),
            display_name: self.inner.display_name.clone(),
            endpoint: self.endpoint(),
        };
        let value = self
            .inner
            .client
            .call(
                orchestrator_endpoint,
                methods::REGISTER_COMPETITOR,
                serde_json::to_value(&request)?,
                None,
            )
            .map_err(CallError::into_protocol)?;
        let receipt: RegistrationReceipt = serde_json::from_value(value)?;

        self.inner
            .introspector
            .set_issuer(orchestrator_endpoint, receipt.auth_token.clone());
        self.inner
            .introspector
            .pin(receipt.league_token.clone(), receipt.league_id.clone());
        *self.inner.token.write().expect("poisoned") = Some(receipt.auth_token.clone());
        info!(league = %receipt.league_id, "registered");
        Ok(receipt)
    }

    /// Wire front of this competitor.
    pub fn service(&self) -> Arc<Service> {
        let mut registry = MethodRegistry::new();

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::authenticated(methods::INVITE, "Invitation to play a match")
                .params(json!({
                    "match_id": "string", "referee_id": "string", "opponent_id": "string",
                    "role": "first|second", "game": "string", "round_count": "integer"
                }))
                .owned_by("referee_id"),
            move |params, ctx| inner.invite(params, ctx),
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::authenticated(methods::REQUEST_MOVE, "Ask for the move of one round")
                .params(json!({
                    "match_id": "string", "referee_id": "string", "round": "integer",
                    "deadline_ms": "integer", "own_score": "integer", "opponent_score": "integer"
                }))
                .owned_by("referee_id"),
            move |params, ctx| inner.request_move(params, ctx),
        );

        let inner = self.inner.clone();
        registry.register(
            MethodSpec::authenticated(methods::REPORT_RESULT, "Round or final result notice")
                .params(json!({
                    "match_id": "string", "referee_id": "string",
                    "round": "RoundRecord?", "final_result": "FinalNotice?"
                }))
                .owned_by("referee_id"),
            move |params, ctx| inner.report_result(params, ctx),
        );

        Arc::new(Service::new(
            self.inner.id.clone(),
            registry,
            self.inner.introspector.clone(),
        ))
    }
}

impl CompetitorInner {
    fn invite(&self, params: Value, _ctx: &CallContext) -> Result<Value, ProtocolError> {
        let invitation: Invitation = serde_json::from_value(params)?;
        let mut book = self.book.lock().expect("poisoned");

        if let Some(active) = book.active.get(&invitation.match_id) {
            if active.invitation.referee_id == invitation.referee_id {
                // repeated invitation, the first answer stands
                return Ok(serde_json::to_value(InvitationReply {
                    accepted: true,
                    reason: None,
                })?);
            }
            return Err(ProtocolError::sequencing(format!(
                "match {} is refereed by {}",
                invitation.match_id, active.invitation.referee_id
            )));
        }
        if book.finished.iter().any(|m| m.match_id == invitation.match_id) {
            return Err(book.unknown(&invitation.match_id));
        }

        let accepted = self.strategy.accept_invitation(&invitation);
        debug!(competitor = %self.id, match_id = %invitation.match_id, accepted, "invitation");
        let reply = InvitationReply {
            accepted,
            reason: (!accepted).then(|| "declined by strategy".to_string()),
        };
        if accepted {
            book.active.insert(
                invitation.match_id.clone(),
                ActiveMatch {
                    invitation,
                    history: vec![],
                },
            );
        }
        Ok(serde_json::to_value(reply)?)
    }

    fn request_move(&self, params: Value, _ctx: &CallContext) -> Result<Value, ProtocolError> {
        let request: MoveRequest = serde_json::from_value(params)?;
        let (ctx, history) = {
            let book = self.book.lock().expect("poisoned");
            let active = book
                .active
                .get(&request.match_id)
                .ok_or_else(|| book.unknown(&request.match_id))?;
            if active.invitation.referee_id != request.referee_id {
                return Err(ProtocolError::auth(format!(
                    "{} does not referee match {}",
                    request.referee_id, request.match_id
                )));
            }
            let ctx = MatchContext {
                match_id: request.match_id.clone(),
                game: active.invitation.game.clone(),
                role: active.invitation.role,
                opponent_id: active.invitation.opponent_id.clone(),
                round: request.round,
                own_score: request.own_score,
                opponent_score: request.opponent_score,
            };
            (ctx, active.history.clone())
        };

        // the strategy runs without holding the book
        let value = self.strategy.decide_move(&ctx, &history);
        Ok(serde_json::to_value(MoveReply { value })?)
    }

    fn report_result(&self, params: Value, _ctx: &CallContext) -> Result<Value, ProtocolError> {
        let notice: ResultNotice = serde_json::from_value(params)?;
        let mut book = self.book.lock().expect("poisoned");

        let Some(active) = book.active.get_mut(&notice.match_id) else {
            return Err(book.unknown(&notice.match_id));
        };
        if active.invitation.referee_id != notice.referee_id {
            return Err(ProtocolError::auth(format!(
                "{} does not referee match {}",
                notice.referee_id, notice.match_id
            )));
        }
        if let Some(round) = notice.round {
            // notices may be redelivered
            if !active.history.iter().any(|r| r.index == round.index) {
                active.history.push(round);
            }
        }
        if let Some(result) = notice.final_result {
            if let Some(done) = book.active.remove(&notice.match_id) {
                let outcome = match result.winner.as_deref() {
                    Some(w) if w == self.id => "won",
                    Some(_) => "lost",
                    None => "tied",
                };
                info!(competitor = %self.id, match_id = %notice.match_id, "match {outcome}");
                book.finished.push(FinishedMatch {
                    match_id: done.invitation.match_id,
                    opponent_id: done.invitation.opponent_id,
                    role: done.invitation.role,
                    result,
                    rounds: done.history,
                });
            } else {
                warn!(match_id = %notice.match_id, "final notice for a match already closed");
            }
        }
        Ok(serde_json::to_value(Ack::ok())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::messages::{MatchOutcomeStatus, MoveOrigin, MoveRecord};
    use crate::protocol::Request;
    use crate::strategy::CycleStrategy;
    use crate::transport::{Handler, InProcessTransport};

    struct Picky;
    impl Strategy for Picky {
        fn decide_move(&self, _ctx: &MatchContext, history: &[RoundRecord]) -> Value {
            json!(history.len())
        }
        fn accept_invitation(&self, invitation: &Invitation) -> bool {
            invitation.game == "even_odd"
        }
    }

    fn competitor(strategy: Arc<dyn Strategy>) -> Competitor {
        Competitor::new(
            "alice",
            "Alice",
            strategy,
            &Configuration::new(),
            Arc::new(InProcessTransport::new()),
        )
    }

    fn ctx() -> CallContext {
        CallContext {
            caller: Some("sup".into()),
            correlation_id: "c-1".into(),
        }
    }

    fn invitation(match_id: &str, game: &str) -> Value {
        json!({
            "match_id": match_id, "referee_id": "sup", "opponent_id": "bob",
            "role": "first", "game": game, "round_count": 3
        })
    }

    fn move_request(match_id: &str, round: u32) -> Value {
        json!({
            "match_id": match_id, "referee_id": "sup", "round": round,
            "deadline_ms": 0, "own_score": 0, "opponent_score": 0
        })
    }

    fn round(index: u32) -> RoundRecord {
        let mv = |id: &str| MoveRecord {
            competitor_id: id.into(),
            value: json!(1),
            submitted_after_ms: Some(3),
            valid: true,
            origin: MoveOrigin::Submitted,
        };
        RoundRecord {
            index,
            moves: [mv("alice"), mv("bob")],
            winner: None,
            resolved_at_ms: 0,
            awarded: false,
        }
    }

    #[test]
    fn move_before_invitation_is_a_sequencing_error() {
        let c = competitor(Arc::new(CycleStrategy::new(vec![json!("rock")])));
        let err = c.inner.request_move(move_request("m1", 1), &ctx()).unwrap_err();
        assert_eq!(err.code, ErrorCode::SequencingError);
    }

    #[test]
    fn strategy_decides_invitations_and_sees_history() {
        let c = competitor(Arc::new(Picky));
        let declined = c.inner.invite(invitation("m0", "rock_paper_scissors"), &ctx()).unwrap();
        assert_eq!(declined["accepted"], json!(false));
        assert!(c.active_matches().is_empty());

        let accepted = c.inner.invite(invitation("m1", "even_odd"), &ctx()).unwrap();
        assert_eq!(accepted["accepted"], json!(true));

        let first = c.inner.request_move(move_request("m1", 1), &ctx()).unwrap();
        assert_eq!(first, json!({"move": 0}));

        let notice = ResultNotice {
            match_id: "m1".into(),
            referee_id: "sup".into(),
            round: Some(round(1)),
            final_result: None,
        };
        let params = serde_json::to_value(&notice).unwrap();
        c.inner.report_result(params.clone(), &ctx()).unwrap();
        c.inner.report_result(params, &ctx()).unwrap();
        let second = c.inner.request_move(move_request("m1", 2), &ctx()).unwrap();
        assert_eq!(second, json!({"move": 1}));
    }

    #[test]
    fn final_notice_closes_the_match() {
        let c = competitor(Arc::new(Picky));
        c.inner.invite(invitation("m1", "even_odd"), &ctx()).unwrap();
        let notice = ResultNotice {
            match_id: "m1".into(),
            referee_id: "sup".into(),
            round: None,
            final_result: Some(FinalNotice {
                status: MatchOutcomeStatus::Completed,
                winner: Some("alice".into()),
                round_wins: [2, 1],
            }),
        };
        c.inner
            .report_result(serde_json::to_value(&notice).unwrap(), &ctx())
            .unwrap();
        assert!(c.active_matches().is_empty());
        assert_eq!(c.finished_matches()[0].opponent_id, "bob");

        let err = c.inner.request_move(move_request("m1", 3), &ctx()).unwrap_err();
        assert_eq!(err.code, ErrorCode::SequencingError);
        assert!(err.message.contains("finished"));
    }

    #[test]
    fn wire_calls_need_a_referee_token() {
        let c = competitor(Arc::new(Picky));
        let reply = c
            .service()
            .handle(Request::new(methods::INVITE, invitation("m1", "even_odd"), "c-1"));
        assert_eq!(reply.into_result().unwrap_err().code, ErrorCode::AuthError);
    }
}

//! Retry and circuit breaking around every outbound call.
//!
//! [`ResilientClient`] is the only place that decides whether a failed remote call is retried,
//! surfaced, or short-circuited:
//!
//! - transient failures (refused, timeout, reset, `TRANSIENT_NETWORK_ERROR`/`INTERNAL` replies)
//!   are retried with [`RetryPolicy`] backoff, then surfaced as `PEER_UNAVAILABLE`;
//! - every other error reply is returned at once;
//! - a peer whose [`CircuitBreaker`] is open is not contacted at all.
//!
//! Calls made with a deadline (move requests) stop retrying when the deadline would be missed,
//! and a deadline expiry is reported as [`CallError::TimedOut`] without counting against the
//! peer's breaker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::configuration::Configuration;
use crate::error::{ErrorCode, ProtocolError};
use crate::protocol::{CorrelationIds, Request};
use crate::transport::{Transport, TransportError};

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker};
pub use retry::RetryPolicy;

/// Why a resilient call produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The peer answered with a non-retryable error, or retries of a retryable one ran out.
    #[error("{peer} replied {error}")]
    Remote { peer: String, error: ProtocolError },
    /// No reply before the deadline (or every attempt timed out).
    #[error("{peer} did not reply in time after {attempts} attempt(s)")]
    TimedOut { peer: String, attempts: u32 },
    #[error("{peer} unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        peer: String,
        attempts: u32,
        reason: String,
    },
    #[error("circuit open for {peer}, call not attempted")]
    CircuitOpen { peer: String },
    #[error("unusable reply from {peer}: {detail}")]
    Malformed { peer: String, detail: String },
}

impl CallError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CallError::Remote { error, .. } => error.code,
            CallError::TimedOut { .. }
            | CallError::Unavailable { .. }
            | CallError::CircuitOpen { .. } => ErrorCode::PeerUnavailable,
            CallError::Malformed { .. } => ErrorCode::ProtocolError,
        }
    }

    /// Unreachable peer, as opposed to a peer that answered or was merely slow.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CallError::Unavailable { .. } | CallError::CircuitOpen { .. }
        )
    }

    pub fn into_protocol(self) -> ProtocolError {
        match self {
            CallError::Remote { error, .. } => error,
            other => ProtocolError::new(other.code(), other.to_string()),
        }
    }
}

enum Failure {
    Transport(TransportError),
    Remote(ProtocolError),
}

/// Outbound side of an agent: transport + retry policy + one breaker per peer.
pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    breaker_config: BreakerConfig,
    call_timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    ids: CorrelationIds,
}

impl ResilientClient {
    pub fn new(
        owner_id: &str,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        breaker_config: BreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        ResilientClient {
            transport,
            retry,
            breaker_config,
            call_timeout,
            breakers: Mutex::new(HashMap::new()),
            ids: CorrelationIds::new(owner_id),
        }
    }

    pub fn from_config(owner_id: &str, transport: Arc<dyn Transport>, config: &Configuration) -> Self {
        Self::new(
            owner_id,
            transport,
            RetryPolicy::from_config(config),
            BreakerConfig::from_config(config),
            config.call_timeout,
        )
    }

    fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut guard = self.breakers.lock().expect("poisoned");
        guard
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.breaker_config.clone())))
            .clone()
    }

    pub fn breaker_state(&self, endpoint: &str) -> BreakerState {
        self.breaker(endpoint).state()
    }

    /// Call with the default per-attempt timeout.
    pub fn call(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
        token: Option<&str>,
    ) -> Result<Value, CallError> {
        self.execute(endpoint, method, params, token, None)
    }

    /// Call that must complete before `deadline`, retries included.
    pub fn call_with_deadline(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
        token: Option<&str>,
        deadline: Instant,
    ) -> Result<Value, CallError> {
        self.execute(endpoint, method, params, token, Some(deadline))
    }

    #[instrument(skip(self, params, token))]
    fn execute(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
        token: Option<&str>,
        deadline: Option<Instant>,
    ) -> Result<Value, CallError> {
        let breaker = self.breaker(endpoint);
        let peer = endpoint.to_string();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(CallError::TimedOut {
                            peer,
                            attempts: attempt - 1,
                        });
                    }
                    remaining.min(self.call_timeout)
                }
                None => self.call_timeout,
            };

            if breaker.try_acquire() == Admission::Rejected {
                debug!("circuit open, not calling");
                return Err(CallError::CircuitOpen { peer });
            }

            let mut request = Request::new(method, params.clone(), self.ids.next_id());
            if let Some(token) = token {
                request = request.with_token(token);
            }

            let failure = match self.transport.call(endpoint, &request, timeout) {
                Ok(reply) => {
                    if reply.correlation_id != request.correlation_id {
                        breaker.record_success();
                        return Err(CallError::Malformed {
                            peer,
                            detail: format!(
                                "correlation id {} does not match {}",
                                reply.correlation_id, request.correlation_id
                            ),
                        });
                    }
                    match reply.into_result() {
                        Ok(value) => {
                            breaker.record_success();
                            return Ok(value);
                        }
                        Err(error) if error.is_retryable() => {
                            breaker.record_failure();
                            Failure::Remote(error)
                        }
                        Err(error) => {
                            breaker.record_success();
                            return Err(CallError::Remote { peer, error });
                        }
                    }
                }
                Err(e) if e.is_timeout() && deadline.is_some_and(|d| Instant::now() >= d) => {
                    breaker.record_inconclusive();
                    return Err(CallError::TimedOut {
                        peer,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() => {
                    breaker.record_failure();
                    Failure::Transport(e)
                }
                Err(e) => {
                    breaker.record_inconclusive();
                    return Err(CallError::Malformed {
                        peer,
                        detail: e.to_string(),
                    });
                }
            };

            let delay = self.retry.backoff(attempt);
            let out_of_time = deadline.is_some_and(|d| Instant::now() + delay >= d);
            if attempt >= self.retry.max_attempts || out_of_time {
                return Err(Self::exhausted(peer, attempt, failure));
            }

            debug!(attempt, ?delay, "transient failure, retrying");
            thread::sleep(delay);
        }
    }

    fn exhausted(peer: String, attempts: u32, last: Failure) -> CallError {
        match last {
            Failure::Transport(e) if e.is_timeout() => {
                warn!(%peer, attempts, "peer kept timing out");
                CallError::TimedOut { peer, attempts }
            }
            Failure::Transport(e) => {
                warn!(%peer, attempts, "peer unavailable: {e}");
                CallError::Unavailable {
                    peer,
                    attempts,
                    reason: e.to_string(),
                }
            }
            Failure::Remote(error) => {
                warn!(%peer, attempts, "peer kept failing: {error}");
                CallError::Unavailable {
                    peer,
                    attempts,
                    reason: error.to_string(),
                }
            }
        }
    }
}

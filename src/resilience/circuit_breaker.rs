use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::configuration::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures inside `window` that open the circuit.
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn from_config(config: &Configuration) -> Self {
        BreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            window: config.circuit_breaker_window,
            cooldown: config.circuit_breaker_cooldown,
        }
    }
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open probe. Its outcome decides the next state.
    Probe,
    Rejected,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: VecDeque<Instant> },
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Failure gate for one remote peer.
#[derive(Debug)]
pub struct CircuitBreaker {
    peer: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(peer: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            peer: peer.into(),
            config,
            inner: Mutex::new(Inner::Closed {
                failures: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut guard = self.inner.lock().expect("poisoned");
        self.refresh(&mut guard);
        match *guard {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Open → half-open once the cool-down elapsed.
    fn refresh(&self, inner: &mut Inner) {
        if let Inner::Open { since } = inner {
            if since.elapsed() >= self.config.cooldown {
                *inner = Inner::HalfOpen {
                    probe_in_flight: false,
                };
            }
        }
    }

    pub fn try_acquire(&self) -> Admission {
        let mut guard = self.inner.lock().expect("poisoned");
        self.refresh(&mut guard);
        match &mut *guard {
            Inner::Closed { .. } => Admission::Allowed,
            Inner::Open { .. } => Admission::Rejected,
            Inner::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Admission::Rejected
                } else {
                    *probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// The peer answered (possibly with a non-transient error).
    pub fn record_success(&self) {
        let mut guard = self.inner.lock().expect("poisoned");
        if matches!(*guard, Inner::HalfOpen { .. }) {
            info!(peer = %self.peer, "circuit closed after successful probe");
        }
        *guard = Inner::Closed {
            failures: VecDeque::new(),
        };
    }

    /// A transient failure (refused, timeout, reset, 5xx-equivalent).
    pub fn record_failure(&self) {
        let mut guard = self.inner.lock().expect("poisoned");
        let now = Instant::now();
        match &mut *guard {
            Inner::Closed { failures } => {
                failures.push_back(now);
                while let Some(first) = failures.front() {
                    if now.duration_since(*first) > self.config.window {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                if failures.len() >= self.config.failure_threshold as usize {
                    warn!(peer = %self.peer, failures = failures.len(), "circuit opened");
                    *guard = Inner::Open { since: now };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!(peer = %self.peer, "probe failed, circuit reopened");
                *guard = Inner::Open { since: now };
            }
            Inner::Open { .. } => {}
        }
    }

    /// The call ended without telling anything about the peer's health. Frees a pending probe.
    pub fn record_inconclusive(&self) {
        let mut guard = self.inner.lock().expect("poisoned");
        if let Inner::HalfOpen { probe_in_flight } = &mut *guard {
            *probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "peer",
            BreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(60),
                cooldown: Duration::from_millis(cooldown_ms),
            },
        )
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = breaker(3, 10_000);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.try_acquire(), Admission::Allowed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn success_resets_the_count() {
        let b = breaker(3, 10_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn failures_outside_the_window_do_not_count() {
        let b = CircuitBreaker::new(
            "peer",
            BreakerConfig {
                failure_threshold: 2,
                window: Duration::from_millis(20),
                cooldown: Duration::from_secs(10),
            },
        );
        b.record_failure();
        thread::sleep(Duration::from_millis(40));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let b = breaker(1, 30);
        b.record_failure();
        assert_eq!(b.try_acquire(), Admission::Rejected);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.try_acquire(), Admission::Probe);
        assert_eq!(b.try_acquire(), Admission::Rejected);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn failed_probe_reopens() {
        let b = breaker(1, 30);
        b.record_failure();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(b.try_acquire(), Admission::Probe);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn inconclusive_probe_frees_the_slot() {
        let b = breaker(1, 30);
        b.record_failure();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(b.try_acquire(), Admission::Probe);
        b.record_inconclusive();
        assert_eq!(b.try_acquire(), Admission::Probe);
    }
}

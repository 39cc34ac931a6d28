//! In-process publish/subscribe for league lifecycle notifications.
//!
//! Subscribers register a pattern: an exact event type (`match.completed`), a prefix wildcard
//! (`match.*`) or `*`. Publishing is synchronous and best-effort: a subscriber that fails or
//! panics is logged and skipped, the publisher never sees it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::protocol::unix_millis;

pub mod topics {
    pub const PLAYER_REGISTERED: &str = "player.registered";
    pub const SUPERVISOR_REGISTERED: &str = "supervisor.registered";
    pub const LEAGUE_SCHEDULED: &str = "league.scheduled";
    pub const MATCH_ASSIGNED: &str = "match.assigned";
    pub const MATCH_SCHEDULING_FAILED: &str = "match.scheduling_failed";
    pub const ROUND_COMPLETED: &str = "round.completed";
    pub const MATCH_COMPLETED: &str = "match.completed";
    pub const MATCH_FORFEITED: &str = "match.forfeited";
    pub const MATCH_REPORT_DROPPED: &str = "match.report_dropped";
    pub const COMPETITOR_FLAGGED: &str = "competitor.flagged";
    pub const COMPETITOR_EJECTED: &str = "competitor.ejected";
    pub const STANDINGS_UPDATED: &str = "standings.updated";
    pub const LEAGUE_PAUSED: &str = "league.paused";
    pub const LEAGUE_RESUMED: &str = "league.resumed";
    pub const LEAGUE_COMPLETED: &str = "league.completed";
    pub const LEAGUE_ARCHIVED: &str = "league.archived";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Does `pattern` select events of type `event_type`?
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == event_type,
    }
}

#[derive(Default)]
struct Subscriptions {
    next_id: u64,
    entries: Vec<(SubscriptionId, String, Subscriber)>,
}

/// Cloning shares the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<Mutex<Subscriptions>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut guard = self.subscriptions.lock().expect("poisoned");
        guard.next_id += 1;
        let id = SubscriptionId(guard.next_id);
        guard.entries.push((id, pattern.into(), Arc::new(handler)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.subscriptions.lock().expect("poisoned");
        let before = guard.entries.len();
        guard.entries.retain(|(entry, _, _)| *entry != id);
        guard.entries.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().expect("poisoned").entries.len()
    }

    /// Deliver to every matching subscriber, in subscription order.
    ///
    /// Returns how many subscribers handled the event without error.
    pub fn publish(&self, event_type: &str, payload: impl Serialize) -> usize {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            warn!(event_type, "event payload not serializable: {e}");
            Value::Null
        });
        let event = Event {
            event_type: event_type.to_string(),
            payload,
            timestamp_ms: unix_millis(),
        };

        // handlers run outside the lock so they may publish or subscribe themselves
        let targets: Vec<(SubscriptionId, Subscriber)> = {
            let guard = self.subscriptions.lock().expect("poisoned");
            guard
                .entries
                .iter()
                .filter(|(_, pattern, _)| pattern_matches(pattern, event_type))
                .map(|(id, _, handler)| (*id, handler.clone()))
                .collect()
        };

        trace!(event_type, subscribers = targets.len(), "publish");
        let mut delivered = 0;
        for (id, handler) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(event_type, subscription = id.0, "subscriber failed: {e:#}"),
                Err(_) => warn!(event_type, subscription = id.0, "subscriber panicked"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn patterns() {
        assert!(pattern_matches("*", "match.completed"));
        assert!(pattern_matches("match.*", "match.completed"));
        assert!(pattern_matches("match.completed", "match.completed"));
        assert!(!pattern_matches("match.*", "matches.completed"));
        assert!(!pattern_matches("match.*", "round.completed"));
        assert!(!pattern_matches("match.completed", "match.forfeited"));
    }

    #[test]
    fn fan_out_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (name, pattern) in [("a", "match.*"), ("b", "*"), ("c", "round.*")] {
            let seen = seen.clone();
            bus.subscribe(pattern, move |e: &Event| {
                seen.lock().unwrap().push(format!("{name}:{}", e.event_type));
                Ok(())
            });
        }
        assert_eq!(bus.publish(topics::MATCH_COMPLETED, json!({"match_id": "m1"})), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:match.completed", "b:match.completed"]
        );
    }

    #[test]
    fn failing_subscribers_are_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        bus.subscribe("*", |_: &Event| anyhow::bail!("nope"));
        bus.subscribe("*", |_: &Event| panic!("boom"));
        let h = hits.clone();
        bus.subscribe("*", move |_: &Event| {
            *h.lock().unwrap() += 1;
            Ok(())
        });
        assert_eq!(bus.publish("league.completed", json!(null)), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_and_no_replay() {
        let bus = EventBus::new();
        bus.publish("league.scheduled", json!({}));
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let id = bus.subscribe("league.*", move |_: &Event| {
            *h.lock().unwrap() += 1;
            Ok(())
        });
        assert_eq!(*hits.lock().unwrap(), 0);
        bus.publish("league.paused", json!({}));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish("league.resumed", json!({}));
        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}

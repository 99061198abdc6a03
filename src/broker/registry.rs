//! Pattern subscription registry.
//!
//! Tracks subscriptions per pattern. The first subscription on a pattern
//! and the removal of the last one are reported to the caller, which issues
//! the matching source-level `PSUBSCRIBE`/`PUNSUBSCRIBE`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::DecodedEvent;
use crate::pattern;
use crate::source::RawEvent;

/// Opaque identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Queue feeding one subscriber.
pub(crate) type EventQueue = mpsc::UnboundedSender<Arc<DecodedEvent>>;

pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub queue: EventQueue,
}

/// Result of removing a subscription.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Removed {
    pub pattern: String,
    /// No subscriptions remain on `pattern`.
    pub last: bool,
}

#[derive(Default)]
pub(crate) struct Registry {
    patterns: HashMap<String, Vec<Subscription>>,
    index: HashMap<SubscriptionId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns true if it is the first on its pattern.
    pub fn insert(&mut self, pattern: &str, subscription: Subscription) -> bool {
        self.index.insert(subscription.id, pattern.to_string());
        let subscribers = self.patterns.entry(pattern.to_string()).or_default();
        subscribers.push(subscription);
        subscribers.len() == 1
    }

    /// Remove a subscription, dropping its queue.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Removed> {
        let pattern = self.index.remove(&id)?;
        let subscribers = self.patterns.get_mut(&pattern)?;
        subscribers.retain(|s| s.id != id);

        let last = subscribers.is_empty();
        if last {
            self.patterns.remove(&pattern);
        }
        Some(Removed { pattern, last })
    }

    /// Remove everything, returning the patterns that were active.
    pub fn drain(&mut self) -> Vec<String> {
        self.index.clear();
        self.patterns.drain().map(|(pattern, _)| pattern).collect()
    }

    /// Queues of every subscription that should receive `event`.
    ///
    /// Events tagged with a pattern go only to that pattern's subscribers;
    /// untagged events are matched against every pattern.
    pub fn route(&self, event: &RawEvent) -> Vec<EventQueue> {
        match &event.pattern {
            Some(p) => self
                .patterns
                .get(p)
                .map(|subs| subs.iter().map(|s| s.queue.clone()).collect())
                .unwrap_or_default(),
            None => self
                .patterns
                .iter()
                .filter(|(p, _)| pattern::matches(p, &event.channel))
                .flat_map(|(_, subs)| subs.iter().map(|s| s.queue.clone()))
                .collect(),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn subscriber_count(&self, pattern: &str) -> usize {
        self.patterns.get(pattern).map(Vec::len).unwrap_or(0)
    }
}

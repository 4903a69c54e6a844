//! Reference-counted topic subscriptions
//!
//! The broker sees exactly one subscribe when a topic gains its first
//! interest and one unsubscribe when it loses its last, however many
//! consumers come and go in between.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use mqtt_relay_metadata::MatchStrategy;
use mqtt_relay_middleware::topic::matches_filter;
use mqtt_relay_middleware::Connection;

use crate::cache::ValueCache;
use crate::definitions::VariableDefinition;
use crate::dispatch::{route, Dispatch};
use crate::error::RelayError;
use crate::interest::{Interest, InterestId};

#[derive(Debug, Default)]
struct TopicEntry {
    /// Never empty while the entry is in the registry
    interests: BTreeMap<InterestId, Interest>,
}

/// Outcome of [`TopicRegistry::register`]
#[derive(Debug, Default, PartialEq)]
pub struct Registered {
    /// A broker subscribe was issued
    pub subscribed: bool,
    pub variables_changed: bool,
    /// Cached value routed to the new interest
    pub backfill: Option<Dispatch>,
}

/// Outcome of [`TopicRegistry::unregister`]
#[derive(Debug, Default, PartialEq)]
pub struct Unregistered {
    /// A broker unsubscribe was issued
    pub unsubscribed: bool,
    pub variables_changed: bool,
}

async fn subscribe(connection: Option<&dyn Connection>, topic: &str) {
    let Some(connection) = connection else {
        warn!(topic, "no broker connection, subscription waits for reconnect");
        return;
    };
    match connection.subscribe(topic).await {
        Ok(()) => debug!(topic, "subscribed to topic"),
        Err(e) => {
            let err = RelayError::Subscribe(e);
            warn!(topic, error = %err, "subscription kept, waiting for retry");
        }
    }
}

async fn unsubscribe(connection: Option<&dyn Connection>, topic: &str) {
    let Some(connection) = connection else {
        return;
    };
    match connection.unsubscribe(topic).await {
        Ok(()) => debug!(topic, "unsubscribed from topic"),
        Err(e) => {
            let err = RelayError::Unsubscribe(e);
            warn!(topic, error = %err, "topic forgotten despite failed unsubscribe");
        }
    }
}

/// Topic -> interests, plus the last value seen for each topic.
///
/// The broker connection is passed in per call; the registry never holds it.
/// Broker failures are logged and never roll back the registry: the registry
/// is the record of what is wanted, not of what the broker acknowledged.
#[derive(Debug)]
pub struct TopicRegistry {
    entries: BTreeMap<String, TopicEntry>,
    cache: ValueCache,
    strategy: MatchStrategy,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(MatchStrategy::Exact)
    }
}

impl TopicRegistry {
    pub fn new(strategy: MatchStrategy) -> Self {
        Self {
            entries: BTreeMap::new(),
            cache: ValueCache::new(),
            strategy,
        }
    }

    /// Add `interest` to `topic`, replacing any interest with the same id.
    pub async fn register(
        &mut self,
        connection: Option<&dyn Connection>,
        topic: &str,
        interest: Interest,
    ) -> Registered {
        let subscribed = !self.entries.contains_key(topic);
        if subscribed {
            subscribe(connection, topic).await;
        }

        let backfill = match self.cache.get(topic) {
            Some(payload) if interest.is_variable() => {
                let mut dispatch = Dispatch::default();
                route(topic, payload, std::iter::once(&interest), &mut dispatch);
                Some(dispatch)
            }
            _ => None,
        };

        let id = interest.id.clone();
        let is_variable = interest.is_variable();
        let previous = self
            .entries
            .entry(topic.to_string())
            .or_default()
            .interests
            .insert(interest.id.clone(), interest);
        debug!(topic, id = %id, replaced = previous.is_some(), "registered interest");

        Registered {
            subscribed,
            variables_changed: is_variable || previous.is_some_and(|p| p.is_variable()),
            backfill,
        }
    }

    /// Remove an interest. Returns `None` when the topic or id is unknown.
    pub async fn unregister(
        &mut self,
        connection: Option<&dyn Connection>,
        topic: &str,
        id: &InterestId,
    ) -> Option<Unregistered> {
        let entry = self.entries.get_mut(topic)?;
        let removed = entry.interests.remove(id)?;
        debug!(topic, id = %id, "unregistered interest");

        let unsubscribed = entry.interests.is_empty();
        if unsubscribed {
            self.entries.remove(topic);
            self.cache.evict(topic);
            unsubscribe(connection, topic).await;
        }

        Some(Unregistered {
            unsubscribed,
            variables_changed: removed.is_variable(),
        })
    }

    /// Unsubscribe every tracked topic and forget all interests and cached
    /// values. Returns how many variable interests were dropped.
    pub async fn resubscribe_all(&mut self, connection: Option<&dyn Connection>) -> usize {
        for topic in self.entries.keys() {
            unsubscribe(connection, topic).await;
        }
        let entries = std::mem::take(&mut self.entries);
        self.cache.clear();

        entries
            .values()
            .flat_map(|entry| entry.interests.values())
            .filter(|interest| interest.is_variable())
            .count()
    }

    /// Registered topics that an inbound `topic` should be routed through
    pub fn matching_topics(&self, topic: &str) -> Vec<String> {
        match self.strategy {
            MatchStrategy::Exact if self.entries.contains_key(topic) => vec![topic.to_string()],
            MatchStrategy::Exact => Vec::new(),
            MatchStrategy::Wildcard => self
                .entries
                .keys()
                .filter(|filter| matches_filter(filter, topic))
                .cloned()
                .collect(),
        }
    }

    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    pub(crate) fn interests(&self, topic: &str) -> impl Iterator<Item = &Interest> {
        self.entries
            .get(topic)
            .into_iter()
            .flat_map(|entry| entry.interests.values())
    }

    pub(crate) fn cache_mut(&mut self) -> &mut ValueCache {
        &mut self.cache
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    pub fn cached_value(&self, topic: &str) -> Option<&str> {
        self.cache.get(topic)
    }

    pub fn interest_count(&self, topic: &str) -> usize {
        self.entries
            .get(topic)
            .map(|entry| entry.interests.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every variable currently fed by a registered topic
    pub fn variable_definitions(&self) -> Vec<VariableDefinition> {
        self.entries
            .iter()
            .flat_map(|(topic, entry)| {
                entry.interests.values().filter_map(move |interest| {
                    interest
                        .variable_name()
                        .map(|name| VariableDefinition::new(name, topic))
                })
            })
            .collect()
    }
}

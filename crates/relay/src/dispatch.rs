//! Fan-out of inbound broker messages to registered interests

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::cache::ValueCache;
use crate::compare::compare_with;
use crate::error::ExtractError;
use crate::extract::{extract, render};
use crate::interest::{Interest, InterestId, InterestKind};
use crate::registry::TopicRegistry;

/// What one message (or one backfill) produced for the host
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Dispatch {
    /// Variable name -> new value, delivered as one batch
    pub variables: BTreeMap<String, String>,
    /// Feedbacks whose owners should re-evaluate
    pub feedbacks: Vec<InterestId>,
}

impl Dispatch {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.feedbacks.is_empty()
    }
}

pub(crate) fn route<'a>(
    topic: &str,
    payload: &str,
    interests: impl IntoIterator<Item = &'a Interest>,
    out: &mut Dispatch,
) {
    for interest in interests {
        match &interest.kind {
            InterestKind::Variable { name, path } => {
                if payload.is_empty() {
                    continue;
                }
                match extract(payload, path.as_deref()) {
                    Ok(value) => {
                        out.variables.insert(name.clone(), render(&value));
                    }
                    Err(ExtractError::PathNotFound(path)) => {
                        debug!(topic, variable = %name, path = %path, "path not in payload");
                    }
                    Err(e) => {
                        warn!(topic, variable = %name, error = %e, "failed to extract variable value");
                    }
                }
            }
            InterestKind::Feedback { .. } => {
                if !out.feedbacks.contains(&interest.id) {
                    out.feedbacks.push(interest.id.clone());
                }
            }
        }
    }
}

/// Record an inbound message and work out who needs to hear about it.
///
/// Returns `None` when no interest matches; such messages are dropped.
pub fn dispatch(registry: &mut TopicRegistry, topic: &str, payload: &str) -> Option<Dispatch> {
    let matched = registry.matching_topics(topic);
    if matched.is_empty() {
        debug!(topic, "no interests for topic, dropping message");
        return None;
    }

    let mut out = Dispatch::default();
    for registered in &matched {
        registry.cache_mut().record(registered, payload);
        route(topic, payload, registry.interests(registered), &mut out);
    }
    Some(out)
}

/// A feedback owner's condition on a topic value
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackCheck {
    pub topic: String,
    pub path: Option<String>,
    pub target: String,
    pub comparison: String,
}

/// Evaluate a feedback condition against the cached value for its topic.
/// No cached value, or a value the path cannot be resolved in, is false.
pub fn evaluate(cache: &ValueCache, check: &FeedbackCheck) -> bool {
    let Some(payload) = cache.get(&check.topic) else {
        return false;
    };
    match extract(payload, check.path.as_deref()) {
        Ok(value) => compare_with(&value, &check.target, &check.comparison),
        Err(e) => {
            debug!(topic = %check.topic, error = %e, "feedback value unavailable");
            false
        }
    }
}

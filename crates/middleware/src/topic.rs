//! MQTT topic names and topic filters
//!
//! A filter level of `+` matches exactly one topic level; a trailing `#`
//! matches the parent level and everything below it.

use crate::error::TransportError;

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// True when `filter` contains `+` or `#`
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains(['+', '#'])
}

/// Check a subscription filter is well formed
pub fn validate_filter(filter: &str) -> Result<(), TransportError> {
    if filter.is_empty() {
        return Err(TransportError::InvalidTopic("empty topic filter".into()));
    }

    let levels: Vec<&str> = filter.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != MULTI_LEVEL || i != last) {
            return Err(TransportError::InvalidTopic(format!(
                "'#' must be the whole final level: {}",
                filter
            )));
        }
        if level.contains('+') && *level != SINGLE_LEVEL {
            return Err(TransportError::InvalidTopic(format!(
                "'+' must occupy a whole level: {}",
                filter
            )));
        }
    }
    Ok(())
}

/// Check a topic name is publishable
pub fn validate_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty() {
        return Err(TransportError::InvalidTopic("empty topic".into()));
    }
    if has_wildcards(topic) {
        return Err(TransportError::InvalidTopic(format!(
            "wildcards are not allowed in topic names: {}",
            topic
        )));
    }
    Ok(())
}

/// Check whether `topic` is matched by the subscription `filter`
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }
    // Wildcards at the first level never match `$SYS`-style topics
    if topic.starts_with('$') && !filter.starts_with('$') {
        return false;
    }

    let mut topic_levels = topic.split(SEPARATOR);
    for level in filter.split(SEPARATOR) {
        if level == MULTI_LEVEL {
            return true;
        }
        match topic_levels.next() {
            Some(_) if level == SINGLE_LEVEL => {}
            Some(actual) if actual == level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

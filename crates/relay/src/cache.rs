use std::collections::HashMap;

/// Last raw payload seen per registered topic.
///
/// Bounded by the number of registered topics; entries are removed when the
/// last interest in a topic goes away.
#[derive(Debug, Default)]
pub struct ValueCache {
    entries: HashMap<String, String>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the value for `topic`
    pub fn record(&mut self, topic: &str, payload: &str) {
        match self.entries.get_mut(topic) {
            Some(existing) => payload.clone_into(existing),
            None => {
                self.entries.insert(topic.to_string(), payload.to_string());
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<&str> {
        self.entries.get(topic).map(String::as_str)
    }

    pub fn evict(&mut self, topic: &str) -> Option<String> {
        self.entries.remove(topic)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

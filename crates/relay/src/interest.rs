use std::fmt;

/// Caller-chosen identifier of one registration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterestId(String);

impl InterestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InterestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InterestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterestKind {
    /// Mirror the topic value into a named variable
    Variable { name: String, path: Option<String> },
    /// Re-evaluated by its owner whenever the topic changes
    Feedback { path: Option<String> },
}

/// One consumer's registration against a topic. Never mutated: changing
/// options means unregistering and registering again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub id: InterestId,
    pub kind: InterestKind,
}

fn non_empty(path: Option<String>) -> Option<String> {
    path.filter(|p| !p.is_empty())
}

impl Interest {
    pub fn variable(
        id: impl Into<InterestId>,
        name: impl Into<String>,
        path: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: InterestKind::Variable {
                name: name.into(),
                path: non_empty(path),
            },
        }
    }

    pub fn feedback(id: impl Into<InterestId>, path: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind: InterestKind::Feedback {
                path: non_empty(path),
            },
        }
    }

    pub fn path(&self) -> Option<&str> {
        match &self.kind {
            InterestKind::Variable { path, .. } | InterestKind::Feedback { path } => {
                path.as_deref()
            }
        }
    }

    pub fn variable_name(&self) -> Option<&str> {
        match &self.kind {
            InterestKind::Variable { name, .. } => Some(name),
            InterestKind::Feedback { .. } => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, InterestKind::Variable { .. })
    }
}

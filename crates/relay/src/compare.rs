//! Loose comparison of received values against configured targets.
//!
//! Both sides are compared as numbers when both parse as finite numbers,
//! otherwise as strings. There is no type mismatch error: `"abc" > "10"`
//! is a lexical comparison and simply evaluates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;
use crate::extract::render;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Lt => "lt",
            Comparison::Lte => "lte",
            Comparison::Gt => "gt",
            Comparison::Gte => "gte",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Lte => ordering != Ordering::Greater,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Gte => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Comparison {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Comparison::Eq),
            "ne" => Ok(Comparison::Ne),
            "lt" => Ok(Comparison::Lt),
            "lte" => Ok(Comparison::Lte),
            "gt" => Ok(Comparison::Gt),
            "gte" => Ok(Comparison::Gte),
            other => Err(RelayError::UnknownComparison(other.to_string())),
        }
    }
}

fn as_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Compare an extracted value against a target string
pub fn compare(value: &Value, target: &str, comparison: Comparison) -> bool {
    let lhs = render(value);
    let ordering = match (as_number(&lhs), as_number(target)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(lhs.as_str().cmp(target)),
    };
    ordering.is_some_and(|o| comparison.accepts(o))
}

/// Like [`compare`] with the operator given by name; unknown operators
/// evaluate to false
pub fn compare_with(value: &Value, target: &str, comparison: &str) -> bool {
    comparison
        .parse::<Comparison>()
        .map(|c| compare(value, target, c))
        .unwrap_or(false)
}

//! Value extraction from raw payloads
//!
//! Paths use dotted keys with optional bracketed indices: `a.b[0]`,
//! `items.2.name`, `["key with.dot"]`.

use serde_json::Value;

use crate::error::ExtractError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn flush(key: &mut String, segments: &mut Vec<Segment>) {
    if !key.is_empty() {
        segments.push(Segment::Key(std::mem::take(key)));
    }
}

fn bracket_segment(inner: &str) -> Segment {
    let inner = inner.trim();
    let quoted = inner
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    match quoted {
        Some(key) => Segment::Key(key.to_string()),
        None => inner
            .parse::<usize>()
            .map(Segment::Index)
            .unwrap_or_else(|_| Segment::Key(inner.to_string())),
    }
}

fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut key = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut key, &mut segments),
            '[' => {
                flush(&mut key, &mut segments);
                let inner: String = chars.by_ref().take_while(|&c| c != ']').collect();
                segments.push(bracket_segment(&inner));
            }
            _ => key.push(c),
        }
    }
    flush(&mut key, &mut segments);
    segments
}

fn resolve<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |value, segment| match (value, segment) {
            (Value::Object(map), Segment::Key(key)) => map.get(key),
            (Value::Object(map), Segment::Index(i)) => map.get(&i.to_string()),
            (Value::Array(items), Segment::Index(i)) => items.get(*i),
            (Value::Array(items), Segment::Key(key)) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        })
}

/// Extract the value a consumer cares about from a raw payload.
///
/// Without a path the payload is returned unchanged as a JSON string value.
pub fn extract(payload: &str, path: Option<&str>) -> Result<Value, ExtractError> {
    let path = match path {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(Value::String(payload.to_string())),
    };

    let root: Value = serde_json::from_str(payload)?;
    resolve(&root, &parse_path(path))
        .cloned()
        .ok_or_else(|| ExtractError::PathNotFound(path.to_string()))
}

/// Largest magnitude below which an integral float still prints exactly
const MAX_INTEGRAL_FLOAT: f64 = 1e15;

/// Text form of an extracted value: strings verbatim, integral numbers
/// without a fractional part, everything else as compact JSON
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_INTEGRAL_FLOAT => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

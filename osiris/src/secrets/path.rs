use super::SecretError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A slash-separated path into a configuration tree.
///
/// Segments address mapping keys or, when numeric, sequence indices.
/// `~1` escapes a literal `/` inside a segment and `~0` a literal `~`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretPath {
    segments: Vec<String>,
}

impl SecretPath {
    pub fn parse(raw: &str) -> Result<Self, SecretError> {
        if raw.is_empty() {
            return Err(SecretError::InvalidPath(raw.to_string()));
        }
        let segments = raw
            .split('/')
            .map(unescape_segment)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SecretError::InvalidPath(raw.to_string()))?;
        if segments.iter().any(String::is_empty) {
            return Err(SecretError::InvalidPath(raw.to_string()));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The value addressed by this path, if present.
    pub fn resolve<'v>(&self, value: &'v serde_json::Value) -> Option<&'v serde_json::Value> {
        let mut current = value;
        for segment in &self.segments {
            current = step(current, segment)?;
        }
        Some(current)
    }

    pub fn resolve_mut<'v>(
        &self,
        value: &'v mut serde_json::Value,
    ) -> Option<&'v mut serde_json::Value> {
        let mut current = value;
        for segment in &self.segments {
            current = step_mut(current, segment)?;
        }
        Some(current)
    }

    /// Removes the addressed value from its parent, returning it.
    pub fn remove(&self, value: &mut serde_json::Value) -> Option<serde_json::Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = value;
        for segment in parents {
            current = step_mut(current, segment)?;
        }
        match current {
            serde_json::Value::Object(map) => map.remove(last),
            serde_json::Value::Array(items) => {
                let index: usize = last.parse().ok()?;
                (index < items.len()).then(|| items.remove(index))
            }
            _ => None,
        }
    }
}

fn step<'v>(value: &'v serde_json::Value, segment: &str) -> Option<&'v serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

fn step_mut<'v>(value: &'v mut serde_json::Value, segment: &str) -> Option<&'v mut serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map.get_mut(segment),
        serde_json::Value::Array(items) => {
            let index = segment.parse::<usize>().ok()?;
            items.get_mut(index)
        }
        _ => None,
    }
}

fn unescape_segment(raw: &str) -> Result<String, ()> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(()),
        }
    }
    Ok(out)
}

fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

impl Display for SecretPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .segments
            .iter()
            .map(|s| escape_segment(s))
            .collect::<Vec<_>>()
            .join("/");
        write!(f, "{joined}")
    }
}

impl TryFrom<String> for SecretPath {
    type Error = SecretError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<SecretPath> for String {
    fn from(path: SecretPath) -> Self {
        path.to_string()
    }
}

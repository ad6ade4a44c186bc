//! Run-scoped masking: field-name heuristics for structured records and a
//! value scrubber fed by the engine's environment substitution.

use crate::secrets::DEFAULT_MASK;

/// Field names that are masked in any event or metric payload, whatever
/// component emitted them.
const SENSITIVE_EXACT: [&str; 5] = ["password", "secret", "token", "key", "authorization"];
const SENSITIVE_SUFFIXES: [&str; 4] = ["_password", "_secret", "_token", "_key"];

fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_EXACT.contains(&lowered.as_str())
        || SENSITIVE_SUFFIXES.iter().any(|suffix| lowered.ends_with(suffix))
}

/// Masks values under sensitive field names, recursively. Returns whether
/// anything was rewritten.
pub fn mask_known_fields(value: &mut serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            let mut changed = false;
            for (key, child) in map.iter_mut() {
                if is_sensitive_key(key) && !child.is_object() && !child.is_array() {
                    *child = serde_json::Value::String(DEFAULT_MASK.to_string());
                    changed = true;
                } else {
                    changed |= mask_known_fields(child);
                }
            }
            changed
        }
        serde_json::Value::Array(items) => {
            let mut changed = false;
            for item in items.iter_mut() {
                changed |= mask_known_fields(item);
            }
            changed
        }
        _ => false,
    }
}

/// Replaces known sensitive strings in serialized lines before they reach
/// disk. Values are registered when the engine reads them from the
/// environment.
#[derive(Debug, Default)]
pub struct Scrubber {
    values: Vec<String>,
}

impl Scrubber {
    /// Values shorter than this are too likely to collide with ordinary
    /// text to scrub safely.
    const MIN_LEN: usize = 4;

    pub fn register(&mut self, value: String) {
        if value.len() >= Self::MIN_LEN && !self.values.contains(&value) {
            self.values.push(value);
        }
    }

    pub fn scrub(&self, line: &str) -> String {
        let mut out = line.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), DEFAULT_MASK);
            }
        }
        out
    }
}

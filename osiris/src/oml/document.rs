use super::OmlError;
use crate::canon;
use crate::components::Mode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Deref;
use std::sync::OnceLock;
use thiserror::Error;

/// The only OML version this toolchain compiles.
pub const OML_VERSION: &str = "0.1.0";

/// Top-level keys of the older template-style format. Their presence means
/// the document is not OML and must be rejected outright.
pub const FORBIDDEN_TOP_LEVEL_KEYS: [&str; 4] = ["version", "connectors", "tasks", "outputs"];

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]+$").expect("valid regex"))
}

#[derive(Error, Debug)]
#[error("identifier `{0}` must match `[a-z0-9_-]+`")]
pub struct IdentError(String);

macro_rules! ident_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: &str) -> Result<Self, IdentError> {
                Self::try_from(raw.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdentError;
            fn try_from(raw: String) -> Result<Self, Self::Error> {
                if ident_re().is_match(&raw) {
                    Ok(Self(raw))
                } else {
                    Err(IdentError(raw))
                }
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ident_newtype!(PipelineId, "Lowercase identifier of a pipeline.");
ident_newtype!(StepId, "Lowercase identifier of one step, unique within its pipeline.");

/// Symbolic reference to a value produced by an upstream step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub from_step: StepId,
    pub key: String,
}

/// Per-step retry declaration carried into the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max: u32,
    pub backoff: Backoff,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: 1,
            backoff: Backoff::None,
            delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt, per the backoff shape.
    pub fn delay_before_attempt(&self, attempt: u32) -> std::time::Duration {
        let base = std::time::Duration::from_millis(self.delay_ms);
        match self.backoff {
            Backoff::None => std::time::Duration::ZERO,
            Backoff::Linear => base * attempt.saturating_sub(1),
            Backoff::Exp => {
                let shift = attempt.saturating_sub(2).min(16);
                if attempt <= 1 {
                    std::time::Duration::ZERO
                } else {
                    base * (1u32 << shift)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    None,
    Linear,
    Exp,
}

/// One validated step declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDecl {
    pub id: StepId,
    pub component: String,
    pub mode: Mode,
    pub config: serde_json::Value,
    #[serde(default)]
    pub needs: Vec<StepId>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputRef>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl StepDecl {
    /// Authored `needs` plus the dependencies implied by `inputs`, deduped,
    /// in declaration order.
    pub fn effective_needs(&self) -> Vec<StepId> {
        let mut needs = self.needs.clone();
        for input in self.inputs.values() {
            if !needs.contains(&input.from_step) {
                needs.push(input.from_step.clone());
            }
        }
        needs
    }
}

/// A validated OML pipeline, the compiler's input.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub id: PipelineId,
    pub oml_version: String,
    pub steps: Vec<StepDecl>,
}

/// A parsed-but-unvalidated OML document.
///
/// Parsing keeps the raw value so validation can aggregate findings over
/// the whole document instead of stopping at the first shape mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct OmlDocument {
    raw: serde_json::Value,
}

impl OmlDocument {
    pub fn parse(yaml: &str) -> Result<Self, OmlError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        Ok(Self {
            raw: canon::yaml_to_json(value)?,
        })
    }

    pub fn from_value(raw: serde_json::Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_accept_lowercase_digits_dash_underscore() {
        assert!(StepId::new("extract-users").is_ok());
        assert!(StepId::new("write_users_2").is_ok());
        assert!(PipelineId::new("users-to-csv").is_ok());

        assert!(StepId::new("Extract").is_err());
        assert!(StepId::new("step one").is_err());
        assert!(StepId::new("").is_err());
        assert!(StepId::new("a.b").is_err());
    }

    #[test]
    fn parse_keeps_the_raw_tree() {
        let doc = OmlDocument::parse("oml_version: \"0.1.0\"\nname: p\nsteps: []\n").unwrap();
        assert_eq!("0.1.0", doc.raw()["oml_version"]);
    }

    #[test]
    fn effective_needs_merges_inputs_without_duplicates() {
        let step: StepDecl = serde_json::from_value(serde_json::json!({
            "id": "write-users",
            "component": "filesystem.csv_writer",
            "mode": "write",
            "config": {"path": "users.csv"},
            "needs": ["extract-users"],
            "inputs": {"df": {"from_step": "extract-users", "key": "df"}}
        }))
        .unwrap();
        assert_eq!(vec![StepId::new("extract-users").unwrap()], step.effective_needs());
    }

    #[test]
    fn backoff_delays_scale_per_shape() {
        let linear = RetryPolicy {
            max: 3,
            backoff: Backoff::Linear,
            delay_ms: 100,
        };
        assert_eq!(0, linear.delay_before_attempt(1).as_millis());
        assert_eq!(100, linear.delay_before_attempt(2).as_millis());
        assert_eq!(200, linear.delay_before_attempt(3).as_millis());

        let exp = RetryPolicy {
            max: 4,
            backoff: Backoff::Exp,
            delay_ms: 100,
        };
        assert_eq!(0, exp.delay_before_attempt(1).as_millis());
        assert_eq!(100, exp.delay_before_attempt(2).as_millis());
        assert_eq!(200, exp.delay_before_attempt(3).as_millis());
        assert_eq!(400, exp.delay_before_attempt(4).as_millis());

        let none = RetryPolicy::default();
        assert_eq!(0, none.delay_before_attempt(2).as_millis());
    }
}

use crate::secrets::{RedactionPolicy, SecretPath, SecretPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Execution mode of a component.
///
/// The authoring surface may say `read` for `extract` and `load` for
/// `write`; both fold to the driver-facing form here. Specs must declare
/// the canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[serde(alias = "read")]
    Extract,
    #[serde(alias = "load")]
    Write,
    Transform,
    Discover,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Extract => "extract",
            Mode::Write => "write",
            Mode::Transform => "transform",
            Mode::Discover => "discover",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared run-time surface of a component: the output keys it produces,
/// the metrics it reports, and coarse placement hints.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeHints {
    pub outputs: Vec<String>,
    pub metrics: Vec<String>,
    pub privacy: PrivacyLevel,
    pub resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Public,
    #[default]
    Internal,
    Sensitive,
}

/// A declarative record describing one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub version: semver::Version,
    pub modes: Vec<Mode>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    pub config_schema: serde_json::Value,
    #[serde(default)]
    pub secrets: Vec<SecretPath>,
    #[serde(default)]
    pub redaction: RedactionPolicy,
    #[serde(default)]
    pub runtime: RuntimeHints,
    #[serde(default)]
    pub examples: Vec<serde_json::Value>,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

impl ComponentSpec {
    /// `component@version`, the driver reference recorded in manifests.
    pub fn driver_ref(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn supports_mode(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn secret_policy(&self) -> SecretPolicy {
        SecretPolicy::new(self.secrets.clone(), self.redaction.clone())
    }

    /// Whether `path` can hold a value under this spec's configuration
    /// schema. Descends `properties`/`items`; open subschemas (no
    /// `properties`, or `additionalProperties` not `false`) address
    /// anything below them.
    pub fn schema_addresses(&self, path: &SecretPath) -> bool {
        let mut node = &self.config_schema;
        for segment in path.segments() {
            if let Some(properties) = node.get("properties") {
                if let Some(child) = properties.get(segment.as_str()) {
                    node = child;
                    continue;
                }
            }
            if segment.parse::<usize>().is_ok() {
                if let Some(items) = node.get("items") {
                    node = items;
                    continue;
                }
            }
            // Not explicitly declared: only an open subschema (no property
            // list, additional properties allowed) can address it.
            let closed = node.get("additionalProperties") == Some(&serde_json::Value::Bool(false));
            return !closed && node.get("properties").is_none();
        }
        true
    }
}

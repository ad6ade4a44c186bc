use super::embedded;
use super::spec::{ComponentSpec, Mode};
use super::validation::{validate_against_schema, Violation};
use crate::canon::{self, CanonError, Fingerprint};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

const META_SCHEMA: &str = include_str!("meta_schema.json");

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("duplicate component `{0}`")]
    Duplicate(String),
    #[error("unknown component `{0}`")]
    Unknown(String),
    #[error("no version of `{name}` satisfies `{req}`")]
    NoMatchingVersion { name: String, req: semver::VersionReq },
    #[error("component spec failed validation: {0:?}")]
    SpecInvalid(Vec<Violation>),
    #[error("component name `{0}` does not match `[a-z0-9_.-]+`")]
    BadName(String),
    #[error("secret path `{path}` is not addressable in the config schema of `{name}`")]
    UnaddressableSecret { name: String, path: String },
    #[error("spec is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Canon(#[from] CanonError),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Duplicate(_) => "E_REG_DUPLICATE",
            RegistryError::Unknown(_) | RegistryError::NoMatchingVersion { .. } => "E_REG_UNKNOWN",
            RegistryError::SpecInvalid(_) | RegistryError::BadName(_) | RegistryError::Yaml(_) => {
                "E_REG_SPEC"
            }
            RegistryError::UnaddressableSecret { .. } => "E_REG_SECRET_PATH",
            RegistryError::Canon(inner) => inner.code(),
        }
    }
}

fn component_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_.-]+$").expect("valid regex"))
}

/// Loads, validates and indexes component specifications.
///
/// The map is ordered by name so `spec_fingerprint` and every iteration
/// over the registry is deterministic.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    specs: BTreeMap<String, ComponentSpec>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the embedded component specs.
    pub fn with_defaults() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for spec_yaml in embedded::all() {
            registry.load_spec_str(spec_yaml)?;
        }
        Ok(registry)
    }

    /// Parses one spec document, validates it against the meta-schema and
    /// indexes it. Duplicate names are rejected.
    pub fn load_spec_str(&mut self, spec_yaml: &str) -> Result<(), RegistryError> {
        let raw: serde_yaml::Value = serde_yaml::from_str(spec_yaml)?;
        let as_json = canon::yaml_to_json(raw)?;

        let meta_schema: serde_json::Value =
            serde_json::from_str(META_SCHEMA).expect("embedded meta-schema is valid JSON");
        validate_against_schema(&meta_schema, &as_json, "SPEC_INVALID")
            .map_err(RegistryError::SpecInvalid)?;

        let spec: ComponentSpec = serde_json::from_value(as_json)
            .map_err(|e| RegistryError::SpecInvalid(vec![Violation::new("/", "SPEC_INVALID", e.to_string())]))?;

        if !component_name_re().is_match(&spec.name) {
            return Err(RegistryError::BadName(spec.name));
        }
        for path in &spec.secrets {
            if !spec.schema_addresses(path) {
                return Err(RegistryError::UnaddressableSecret {
                    name: spec.name.clone(),
                    path: path.to_string(),
                });
            }
        }
        if self.specs.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        debug!(component = %spec.name, version = %spec.version, "component spec loaded");
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ComponentSpec, RegistryError> {
        self.specs
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    /// Exact lookup narrowed by a semver requirement.
    pub fn get_versioned(
        &self,
        name: &str,
        req: &semver::VersionReq,
    ) -> Result<&ComponentSpec, RegistryError> {
        let spec = self.get(name)?;
        if req.matches(&spec.version) {
            Ok(spec)
        } else {
            Err(RegistryError::NoMatchingVersion {
                name: name.to_string(),
                req: req.clone(),
            })
        }
    }

    /// Structural validation of a configuration against the component's
    /// schema, plus the mode membership check.
    pub fn validate_config(
        &self,
        name: &str,
        mode: Mode,
        config: &serde_json::Value,
    ) -> Result<(), Vec<Violation>> {
        let spec = self.get(name).map_err(|_| {
            vec![Violation::new("/component", "UNKNOWN_COMPONENT", format!("unknown component `{name}`"))]
        })?;

        let mut violations = Vec::new();
        if !spec.supports_mode(mode) {
            violations.push(
                Violation::new(
                    "/mode",
                    "BAD_MODE",
                    format!("component `{name}` does not support mode `{mode}`"),
                )
                .with_suggestion(format!(
                    "declared modes: {}",
                    spec.modes.iter().map(Mode::as_str).collect::<Vec<_>>().join(", ")
                )),
            );
        }
        if let Err(schema_violations) =
            validate_against_schema(&spec.config_schema, config, "CFG_INVALID")
        {
            violations.extend(schema_violations);
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn list(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }

    /// Fingerprint over the canonicalized, name-sorted collection of
    /// accepted specs. This is the `registry_fp` recorded in manifests.
    pub fn spec_fingerprint(&self) -> Result<Fingerprint, CanonError> {
        let collection: Vec<serde_json::Value> = self
            .specs
            .values()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?;
        canon::fingerprint(&serde_json::Value::Array(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn default_registry_lists_embedded_components() {
        let registry = ComponentRegistry::with_defaults().unwrap();
        assert_eq!(
            vec![
                "filesystem.csv_extractor",
                "filesystem.csv_writer",
                "mysql.extractor",
                "supabase.writer",
            ],
            registry.list()
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ComponentRegistry::with_defaults().unwrap();
        let err = registry.load_spec_str(embedded::MYSQL_EXTRACTOR).unwrap_err();
        assert_matches!(err, RegistryError::Duplicate(name) if name == "mysql.extractor");
    }

    #[test]
    fn specs_failing_the_meta_schema_are_rejected() {
        let mut registry = ComponentRegistry::new();
        let err = registry
            .load_spec_str("name: broken.component\nversion: 0.1.0\n")
            .unwrap_err();
        assert_matches!(err, RegistryError::SpecInvalid(_));
        assert_eq!("E_REG_SPEC", err.code());
    }

    #[test]
    fn undeclarable_secret_paths_are_rejected() {
        let mut registry = ComponentRegistry::new();
        let spec = r#"
name: closed.component
version: 0.1.0
modes: [write]
config_schema:
  type: object
  additionalProperties: false
  properties:
    path: {type: string}
secrets:
  - token
"#;
        let err = registry.load_spec_str(spec).unwrap_err();
        assert_matches!(err, RegistryError::UnaddressableSecret { ref path, .. } if path == "token");
    }

    #[test]
    fn versioned_lookup_applies_the_requirement() {
        let registry = ComponentRegistry::with_defaults().unwrap();
        let req = semver::VersionReq::parse("^0.1").unwrap();
        assert!(registry.get_versioned("mysql.extractor", &req).is_ok());

        let too_new = semver::VersionReq::parse("^1.0").unwrap();
        let err = registry.get_versioned("mysql.extractor", &too_new).unwrap_err();
        assert_eq!("E_REG_UNKNOWN", err.code());
    }

    #[test]
    fn validate_config_reports_mode_and_schema_violations_together() {
        let registry = ComponentRegistry::with_defaults().unwrap();
        let violations = registry
            .validate_config("mysql.extractor", Mode::Write, &json!({"fetch_size": 0}))
            .unwrap_err();

        let codes: Vec<&str> = violations.iter().map(|v| v.code.as_str()).collect();
        assert!(codes.contains(&"BAD_MODE"), "{codes:?}");
        assert!(codes.contains(&"CFG_INVALID"), "{codes:?}");
    }

    #[test]
    fn validate_config_accepts_read_as_extract() {
        let registry = ComponentRegistry::with_defaults().unwrap();
        let config = json!({"query": "SELECT id FROM t", "connection": "@mysql.default"});
        assert!(registry
            .validate_config("mysql.extractor", Mode::Extract, &config)
            .is_ok());
    }

    #[test]
    fn spec_fingerprint_is_stable_across_load_order() {
        let a = ComponentRegistry::with_defaults().unwrap();

        let mut b = ComponentRegistry::new();
        for spec in embedded::all().into_iter().rev() {
            b.load_spec_str(spec).unwrap();
        }

        assert_eq!(
            a.spec_fingerprint().unwrap(),
            b.spec_fingerprint().unwrap()
        );
    }
}

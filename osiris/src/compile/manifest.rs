use crate::canon::{self, CanonError, Fingerprint};
use crate::components::spec::PrivacyLevel;
use crate::components::Mode;
use crate::oml::{InputRef, PipelineId, RetryPolicy, StepId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Format version of the manifest schema, stable across patch releases.
pub const MANIFEST_VERSION: &str = "1";

/// The `manifest_fp` field is set to this placeholder while the manifest's
/// own fingerprint is computed, then replaced.
pub const MANIFEST_FP_PLACEHOLDER: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Version of the canonicalization rule set, folded into `compiler_fp`.
pub const CANON_RULES: &str = "canon-1";

/// Compiler semver, folded into `compiler_fp`.
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintBlock {
    pub oml_fp: Fingerprint,
    pub registry_fp: Fingerprint,
    pub compiler_fp: Fingerprint,
    pub params_fp: Fingerprint,
    pub manifest_fp: Fingerprint,
}

impl FingerprintBlock {
    /// Cache key: SHA-256 of the ordered concatenation of the input
    /// fingerprints and the active profile.
    pub fn cache_key(&self, profile: &str) -> Fingerprint {
        let mut bytes = Vec::new();
        for fp in [
            &self.oml_fp,
            &self.registry_fp,
            &self.compiler_fp,
            &self.params_fp,
        ] {
            bytes.extend_from_slice(fp.as_str().as_bytes());
        }
        bytes.extend_from_slice(profile.as_bytes());
        canon::sha256_hex(&bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineBlock {
    pub id: PipelineId,
    pub name: String,
    pub oml_version: String,
    pub fingerprints: FingerprintBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestStep {
    pub id: StepId,
    /// `component@version`, resolved against the registry at compile time.
    pub driver: String,
    pub mode: Mode,
    /// Relative path of the step's configuration file.
    pub cfg_path: String,
    #[serde(default)]
    pub needs: Vec<StepId>,
    /// Symbolic input references, resolved by the adapter against the
    /// outputs of prior steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputRef>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub privacy: PrivacyLevel,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
}

impl ManifestStep {
    pub fn component_name(&self) -> &str {
        self.driver.split('@').next().unwrap_or(&self.driver)
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|raw| duration_str::parse(raw).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toolchain {
    pub compiler: String,
    pub canon_rules: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            compiler: COMPILER_VERSION.to_string(),
            canon_rules: CANON_RULES.to_string(),
        }
    }
}

/// Manifest-resident metadata. Wall-clock values are banned here; the
/// generation timestamp lives in `meta.json`, outside every fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMeta {
    pub profile: String,
    pub toolchain: Toolchain,
}

/// The deterministic, fingerprinted compilation output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: String,
    pub pipeline: PipelineBlock,
    pub steps: Vec<ManifestStep>,
    pub meta: ManifestMeta,
}

impl Manifest {
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Fingerprint of the canonicalized manifest with `manifest_fp` pinned
    /// to the placeholder, so the stored value never feeds itself.
    pub fn compute_fingerprint(&self) -> Result<Fingerprint, CanonError> {
        let mut pinned = self.clone();
        pinned.pipeline.fingerprints.manifest_fp =
            Fingerprint::from(MANIFEST_FP_PLACEHOLDER.to_string());
        let value = serde_json::to_value(&pinned)?;
        canon::fingerprint(&value)
    }

    pub fn step(&self, id: &StepId) -> Option<&ManifestStep> {
        self.steps.iter().find(|s| &s.id == id)
    }
}

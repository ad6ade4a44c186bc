use super::manifest::{
    FingerprintBlock, Manifest, ManifestMeta, ManifestStep, PipelineBlock, Toolchain,
    CANON_RULES, COMPILER_VERSION, MANIFEST_FP_PLACEHOLDER, MANIFEST_VERSION,
};
use crate::canon::{self, CanonError, Fingerprint};
use crate::components::{ComponentRegistry, RegistryError, Violation};
use crate::connections::{self, ConnectionCatalog, ConnError};
use crate::oml::{self, OmlDocument, StepDecl, StepId};
use crate::secrets::SecretError;
use crate::utils::time;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("OML validation failed with {0:?}")]
    OmlInvalid(Vec<Violation>),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Canon(#[from] CanonError),
    #[error("manifest serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::OmlInvalid(_) => "E_OML_INVALID",
            CompileError::Registry(inner) => inner.code(),
            CompileError::Conn(inner) => inner.code(),
            CompileError::Secret(inner) => inner.code(),
            CompileError::Canon(inner) => inner.code(),
            CompileError::Yaml(_) => "E_MANIFEST_SERIALIZE",
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            CompileError::OmlInvalid(violations) => violations,
            _ => &[],
        }
    }
}

pub struct CompileRequest<'a> {
    pub oml: &'a OmlDocument,
    pub registry: &'a ComponentRegistry,
    pub catalog: &'a ConnectionCatalog,
    pub profile: &'a str,
    pub params: &'a serde_json::Value,
}

/// Compilation metadata that is deliberately outside every fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileMeta {
    pub fingerprints: FingerprintBlock,
    pub generated_at: String,
    pub toolchain: Toolchain,
    /// `_`-prefixed keys stripped per step, recorded for provenance.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stripped_keys: BTreeMap<StepId, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileResult {
    pub manifest: Manifest,
    /// Per-step configuration file contents, keyed by step id. Each value
    /// is exactly what lands in `cfg/<step_id>.json`.
    pub configs: BTreeMap<StepId, serde_json::Value>,
    pub meta: CompileMeta,
    pub effective_config: serde_json::Value,
    pub diagnostics: Vec<Violation>,
}

impl CompileResult {
    pub fn fingerprints(&self) -> &FingerprintBlock {
        &self.manifest.pipeline.fingerprints
    }

    pub fn cache_key(&self) -> Fingerprint {
        self.fingerprints().cache_key(&self.manifest.meta.profile)
    }
}

/// Compiles a parsed OML document into the manifest and per-step configs.
///
/// Fails atomically: any violation or resolution error returns before a
/// single artifact value is produced.
pub fn compile(req: CompileRequest<'_>) -> Result<CompileResult, CompileError> {
    let pipeline = oml::validate(req.oml, req.registry).map_err(CompileError::OmlInvalid)?;

    let ordered = topo_sort(&pipeline.steps);
    debug!(
        pipeline = %pipeline.id,
        steps = ordered.len(),
        "steps ordered for compilation"
    );

    let mut manifest_steps = Vec::with_capacity(ordered.len());
    let mut configs = BTreeMap::new();
    let mut stripped_keys = BTreeMap::new();
    for step in &ordered {
        let spec = req.registry.get(&step.component)?;

        let mut config = step.config.clone();
        resolve_connections(&mut config, req.catalog, &spec.config_schema)?;

        let stripped = strip_meta_keys(&mut config);
        if !stripped.is_empty() {
            stripped_keys.insert(step.id.clone(), stripped);
        }

        if let Err(violations) = req.registry.validate_config(&step.component, step.mode, &config) {
            let prefixed = violations
                .into_iter()
                .map(|v| Violation {
                    path: format!("/steps/{}{}", step.id, if v.path == "/" { String::new() } else { v.path.clone() }),
                    ..v
                })
                .collect();
            return Err(CompileError::OmlInvalid(prefixed));
        }
        spec.secret_policy().scan(&config)?;

        // The config file carries the resolved configuration plus the
        // component identity the runner needs to pick a driver.
        let mut file_value = config;
        let file_obj = file_value.as_object_mut().expect("step config is a mapping");
        file_obj.insert("component".into(), json!(spec.name));
        file_obj.insert("mode".into(), json!(step.mode.as_str()));

        manifest_steps.push(ManifestStep {
            id: step.id.clone(),
            driver: spec.driver_ref(),
            mode: step.mode,
            cfg_path: format!("cfg/{}.json", step.id),
            needs: step.effective_needs(),
            inputs: step.inputs.clone(),
            retry: step.retry.clone(),
            timeout: step.timeout.clone(),
            outputs: spec.runtime.outputs.clone(),
            metrics: spec.runtime.metrics.clone(),
            privacy: spec.runtime.privacy,
            resources: spec.runtime.resources.clone(),
        });
        configs.insert(step.id.clone(), file_value);
    }

    let oml_fp = canon::fingerprint(req.oml.raw())?;
    let registry_fp = req.registry.spec_fingerprint()?;
    let compiler_fp = canon::fingerprint(&json!({
        "compiler": COMPILER_VERSION,
        "rules": CANON_RULES,
    }))?;
    let params_fp = canon::fingerprint(&json!({
        "params": req.params,
        "profile": req.profile,
    }))?;

    let mut manifest = Manifest {
        manifest_version: MANIFEST_VERSION.to_string(),
        pipeline: PipelineBlock {
            id: pipeline.id.clone(),
            name: pipeline.id.to_string(),
            oml_version: pipeline.oml_version.clone(),
            fingerprints: FingerprintBlock {
                oml_fp,
                registry_fp,
                compiler_fp,
                params_fp,
                manifest_fp: Fingerprint::from(MANIFEST_FP_PLACEHOLDER.to_string()),
            },
        },
        steps: manifest_steps,
        meta: ManifestMeta {
            profile: req.profile.to_string(),
            toolchain: Toolchain::default(),
        },
    };
    manifest.pipeline.fingerprints.manifest_fp = manifest.compute_fingerprint()?;

    info!(
        pipeline = %pipeline.id,
        manifest_fp = %manifest.pipeline.fingerprints.manifest_fp,
        "compilation complete"
    );

    let meta = CompileMeta {
        fingerprints: manifest.pipeline.fingerprints.clone(),
        generated_at: time::iso_timestamp(),
        toolchain: Toolchain::default(),
        stripped_keys,
    };
    let effective_config = json!({
        "profile": req.profile,
        "params": req.params,
    });

    Ok(CompileResult {
        manifest,
        configs,
        meta,
        effective_config,
        diagnostics: Vec::new(),
    })
}

/// Topological order over the effective dependency edges; ties broken by
/// authoring order. The validator has already rejected cycles.
fn topo_sort(steps: &[StepDecl]) -> Vec<StepDecl> {
    let index_of: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in step.effective_needs() {
            if let Some(&dep_index) = index_of.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[dep_index].push(i);
            }
        }
    }

    // The ready queue is kept sorted by authoring index, which is exactly
    // the tie-break rule.
    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_front() {
        ordered.push(steps[i].clone());
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                let position = ready
                    .iter()
                    .position(|&queued| queued > dependent)
                    .unwrap_or(ready.len());
                ready.insert(position, dependent);
            }
        }
    }
    ordered
}

/// Resolves any `@family.alias` string at the top level of a step config
/// into an inline `resolved_connection` mapping.
fn resolve_connections(
    config: &mut serde_json::Value,
    catalog: &ConnectionCatalog,
    config_schema: &serde_json::Value,
) -> Result<(), ConnError> {
    let Some(map) = config.as_object_mut() else {
        return Ok(());
    };

    let references: Vec<(String, String, Option<String>)> = map
        .iter()
        .filter_map(|(key, value)| {
            value
                .as_str()
                .and_then(connections::parse_reference)
                .map(|(family, alias)| (key.clone(), family, alias))
        })
        .collect();
    if references.len() > 1 {
        return Err(ConnError::Catalog(
            "a step may reference at most one connection".to_string(),
        ));
    }
    let Some((key, family, alias)) = references.into_iter().next() else {
        return Ok(());
    };

    let resolved = connections::resolve(catalog, &family, alias.as_deref())?;
    connections::resolver::check_required_fields(&resolved, config_schema)?;
    map.remove(&key);
    map.insert("resolved_connection".to_string(), resolved.to_config_value());
    Ok(())
}

/// Drops top-level keys beginning with `_`, returning what was removed.
fn strip_meta_keys(config: &mut serde_json::Value) -> Vec<String> {
    let Some(map) = config.as_object_mut() else {
        return Vec::new();
    };
    let stripped: Vec<String> = map
        .keys()
        .filter(|k| k.starts_with('_'))
        .cloned()
        .collect();
    for key in &stripped {
        map.remove(key);
    }
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::Mode;

    const OML: &str = r#"
oml_version: "0.1.0"
name: users-to-csv
steps:
  - id: extract-users
    component: mysql.extractor
    mode: read
    config:
      query: SELECT id FROM t
      connection: "@mysql.default"
      _comment: scratch note
  - id: write-users-csv
    component: filesystem.csv_writer
    mode: write
    config:
      path: users.csv
    inputs:
      df:
        from_step: extract-users
        key: df
"#;

    const CATALOG: &str = r#"
mysql:
  default:
    host: db.internal
    port: 3306
    user: reader
    password: "${MYSQL_PASSWORD}"
"#;

    fn compile_sample() -> CompileResult {
        let oml = OmlDocument::parse(OML).unwrap();
        let registry = ComponentRegistry::with_defaults().unwrap();
        let catalog = ConnectionCatalog::from_yaml_str(CATALOG).unwrap();
        compile(CompileRequest {
            oml: &oml,
            registry: &registry,
            catalog: &catalog,
            profile: "dev",
            params: &json!({}),
        })
        .unwrap()
    }

    #[test]
    fn produces_ordered_steps_with_driver_refs() {
        let result = compile_sample();
        let ids: Vec<&str> = result.manifest.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(vec!["extract-users", "write-users-csv"], ids);
        assert_eq!("mysql.extractor@0.1.0", result.manifest.steps[0].driver);
        assert_eq!(Mode::Extract, result.manifest.steps[0].mode);
        assert_eq!("cfg/extract-users.json", result.manifest.steps[0].cfg_path);
        // The input reference implies the dependency edge.
        assert_eq!(
            vec![StepId::new("extract-users").unwrap()],
            result.manifest.steps[1].needs
        );
    }

    #[test]
    fn resolved_connection_carries_env_names_not_values() {
        std::env::set_var("MYSQL_PASSWORD", "secret123");
        let result = compile_sample();
        let cfg = &result.configs[&StepId::new("extract-users").unwrap()];

        assert_eq!(json!("${MYSQL_PASSWORD}"), cfg["resolved_connection"]["password"]);
        assert!(cfg.get("connection").is_none());
        assert_eq!(json!("mysql.extractor"), cfg["component"]);
        assert_eq!(json!("extract"), cfg["mode"]);
        assert!(!cfg.to_string().contains("secret123"));
    }

    #[test]
    fn meta_keys_are_stripped_and_recorded() {
        let result = compile_sample();
        let cfg = &result.configs[&StepId::new("extract-users").unwrap()];
        assert!(cfg.get("_comment").is_none());
        assert_eq!(
            vec!["_comment".to_string()],
            result.meta.stripped_keys[&StepId::new("extract-users").unwrap()]
        );
    }

    #[test]
    fn compilation_is_deterministic_across_key_order() {
        // The same document with mapping keys authored in a different
        // order must produce byte-identical artifacts.
        let reordered = r#"
name: users-to-csv
oml_version: "0.1.0"
steps:
  - mode: read
    config:
      connection: "@mysql.default"
      _comment: scratch note
      query: SELECT id FROM t
    component: mysql.extractor
    id: extract-users
  - config:
      path: users.csv
    inputs:
      df:
        key: df
        from_step: extract-users
    id: write-users-csv
    component: filesystem.csv_writer
    mode: write
"#;
        let a = compile_sample();

        let oml = OmlDocument::parse(reordered).unwrap();
        let registry = ComponentRegistry::with_defaults().unwrap();
        let catalog = ConnectionCatalog::from_yaml_str(CATALOG).unwrap();
        let b = compile(CompileRequest {
            oml: &oml,
            registry: &registry,
            catalog: &catalog,
            profile: "dev",
            params: &json!({}),
        })
        .unwrap();

        assert_eq!(a.manifest.to_yaml().unwrap(), b.manifest.to_yaml().unwrap());
        for (id, cfg) in &a.configs {
            assert_eq!(
                canon::canonicalize(cfg).unwrap(),
                canon::canonicalize(&b.configs[id]).unwrap()
            );
        }
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn validation_failures_return_diagnostics_without_artifacts() {
        let oml = OmlDocument::parse("oml_version: \"0.1.0\"\nname: p\nversion: \"1\"\nsteps: []\n")
            .unwrap();
        let registry = ComponentRegistry::with_defaults().unwrap();
        let catalog = ConnectionCatalog::default();
        let err = compile(CompileRequest {
            oml: &oml,
            registry: &registry,
            catalog: &catalog,
            profile: "dev",
            params: &json!({}),
        })
        .unwrap_err();

        assert_eq!("E_OML_INVALID", err.code());
        assert!(err
            .violations()
            .iter()
            .any(|v| v.code == "OML_FORBIDDEN_KEY" && v.path == "/version"));
    }

    #[test]
    fn unknown_connection_family_fails_compilation() {
        let oml = OmlDocument::parse(
            r#"
oml_version: "0.1.0"
name: p
steps:
  - id: a
    component: mysql.extractor
    mode: read
    config:
      query: SELECT 1
      connection: "@oracle"
"#,
        )
        .unwrap();
        let registry = ComponentRegistry::with_defaults().unwrap();
        let catalog = ConnectionCatalog::from_yaml_str(CATALOG).unwrap();
        let err = compile(CompileRequest {
            oml: &oml,
            registry: &registry,
            catalog: &catalog,
            profile: "dev",
            params: &json!({}),
        })
        .unwrap_err();
        assert_eq!("E_CONN_UNKNOWN_FAMILY", err.code());
    }

    #[test]
    fn params_and_profile_change_the_cache_key_only_through_params_fp() {
        let oml = OmlDocument::parse(OML).unwrap();
        let registry = ComponentRegistry::with_defaults().unwrap();
        let catalog = ConnectionCatalog::from_yaml_str(CATALOG).unwrap();

        let base = compile(CompileRequest {
            oml: &oml,
            registry: &registry,
            catalog: &catalog,
            profile: "dev",
            params: &json!({}),
        })
        .unwrap();
        let tuned = compile(CompileRequest {
            oml: &oml,
            registry: &registry,
            catalog: &catalog,
            profile: "dev",
            params: &json!({"batch": 500}),
        })
        .unwrap();

        assert_eq!(
            base.fingerprints().oml_fp,
            tuned.fingerprints().oml_fp
        );
        assert_ne!(base.cache_key(), tuned.cache_key());
    }

    #[test]
    fn tie_break_follows_authoring_order() {
        let oml = OmlDocument::parse(
            r#"
oml_version: "0.1.0"
name: p
steps:
  - id: b-second
    component: mysql.extractor
    mode: read
    config: {query: SELECT 2}
  - id: a-first
    component: mysql.extractor
    mode: read
    config: {query: SELECT 1}
"#,
        )
        .unwrap();
        let registry = ComponentRegistry::with_defaults().unwrap();
        let catalog = ConnectionCatalog::default();
        let result = compile(CompileRequest {
            oml: &oml,
            registry: &registry,
            catalog: &catalog,
            profile: "dev",
            params: &json!({}),
        })
        .unwrap();
        // Independent steps keep authoring order, not lexical order.
        let ids: Vec<&str> = result.manifest.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(vec!["b-second", "a-first"], ids);
    }
}

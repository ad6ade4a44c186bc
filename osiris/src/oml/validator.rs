//! Shape and cross-reference validation of an OML document.
//!
//! All findings are aggregated into one violation list; nothing is emitted
//! until the whole document has been checked.

use super::document::{
    InputRef, OmlDocument, Pipeline, PipelineId, RetryPolicy, StepDecl, StepId,
    FORBIDDEN_TOP_LEVEL_KEYS, OML_VERSION,
};
use crate::components::validation::validate_against_schema;
use crate::components::{ComponentRegistry, Mode, Violation};
use crate::secrets::policy::is_env_reference;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Validates `doc` against the OML schema and the component registry.
///
/// Returns the typed pipeline on success, or every violation found.
pub fn validate(
    doc: &OmlDocument,
    registry: &ComponentRegistry,
) -> Result<Pipeline, Vec<Violation>> {
    let mut violations = Vec::new();

    let Some(root) = doc.raw().as_object() else {
        return Err(vec![Violation::new(
            "/",
            "OML_MISSING_FIELD",
            "document root must be a mapping",
        )]);
    };

    for key in FORBIDDEN_TOP_LEVEL_KEYS {
        if root.contains_key(key) {
            violations.push(
                Violation::new(
                    format!("/{key}"),
                    "OML_FORBIDDEN_KEY",
                    format!("`{key}` belongs to the legacy template format"),
                )
                .with_suggestion("declare `oml_version: \"0.1.0\"` with `name` and `steps`"),
            );
        }
    }

    match root.get("oml_version") {
        None => violations.push(Violation::new(
            "/oml_version",
            "OML_MISSING_FIELD",
            "missing `oml_version`",
        )),
        Some(serde_json::Value::String(v)) if v == OML_VERSION => {}
        Some(other) => violations.push(Violation::new(
            "/oml_version",
            "OML_BAD_PATTERN",
            format!("`oml_version` must be exactly \"{OML_VERSION}\", got {other}"),
        )),
    }

    let pipeline_id = match root.get("name") {
        None => {
            violations.push(Violation::new("/name", "OML_MISSING_FIELD", "missing `name`"));
            None
        }
        Some(serde_json::Value::String(name)) => match PipelineId::new(name) {
            Ok(id) => Some(id),
            Err(err) => {
                violations.push(Violation::new("/name", "OML_BAD_PATTERN", err.to_string()));
                None
            }
        },
        Some(other) => {
            violations.push(Violation::new(
                "/name",
                "OML_BAD_PATTERN",
                format!("`name` must be a string, got {other}"),
            ));
            None
        }
    };

    let raw_steps = match root.get("steps") {
        Some(serde_json::Value::Array(steps)) if !steps.is_empty() => steps.as_slice(),
        Some(serde_json::Value::Array(_)) => {
            violations.push(Violation::new(
                "/steps",
                "OML_MISSING_FIELD",
                "`steps` must be a non-empty sequence",
            ));
            &[]
        }
        _ => {
            violations.push(Violation::new(
                "/steps",
                "OML_MISSING_FIELD",
                "missing `steps` sequence",
            ));
            &[]
        }
    };

    // First pass: collect declared step ids so dependency references can be
    // checked regardless of declaration order.
    let mut declared_ids: HashSet<String> = HashSet::new();
    for raw_step in raw_steps {
        if let Some(id) = raw_step.get("id").and_then(|v| v.as_str()) {
            declared_ids.insert(id.to_string());
        }
    }

    let mut steps = Vec::with_capacity(raw_steps.len());
    let mut seen_ids: HashSet<String> = HashSet::new();
    for (index, raw_step) in raw_steps.iter().enumerate() {
        match validate_step(index, raw_step, registry, &declared_ids, &mut seen_ids) {
            Ok(step) => steps.push(step),
            Err(step_violations) => violations.extend(step_violations),
        }
    }

    // Cycle detection runs over whatever steps validated; a broken step
    // cannot contribute edges anyway.
    if violations.is_empty() {
        violations.extend(detect_cycles(&steps));
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    Ok(Pipeline {
        id: pipeline_id.expect("validated above"),
        oml_version: OML_VERSION.to_string(),
        steps,
    })
}

fn validate_step(
    index: usize,
    raw_step: &serde_json::Value,
    registry: &ComponentRegistry,
    declared_ids: &HashSet<String>,
    seen_ids: &mut HashSet<String>,
) -> Result<StepDecl, Vec<Violation>> {
    let at = |suffix: &str| format!("/steps/{index}{suffix}");
    let mut violations = Vec::new();

    let Some(step_obj) = raw_step.as_object() else {
        return Err(vec![Violation::new(
            at(""),
            "OML_MISSING_FIELD",
            "step must be a mapping",
        )]);
    };

    let step_id = match step_obj.get("id").and_then(|v| v.as_str()) {
        None => {
            violations.push(Violation::new(at("/id"), "OML_MISSING_FIELD", "missing step `id`"));
            None
        }
        Some(raw_id) => match StepId::new(raw_id) {
            Ok(id) => {
                if !seen_ids.insert(raw_id.to_string()) {
                    violations.push(Violation::new(
                        at("/id"),
                        "OML_BAD_PATTERN",
                        format!("step id `{raw_id}` is declared more than once"),
                    ));
                }
                Some(id)
            }
            Err(err) => {
                violations.push(Violation::new(at("/id"), "OML_BAD_PATTERN", err.to_string()));
                None
            }
        },
    };

    let component = match step_obj.get("component").and_then(|v| v.as_str()) {
        None => {
            violations.push(Violation::new(
                at("/component"),
                "OML_MISSING_FIELD",
                "missing `component`",
            ));
            None
        }
        Some(name) => match registry.get(name) {
            Ok(_) => Some(name.to_string()),
            Err(_) => {
                violations.push(
                    Violation::new(
                        at("/component"),
                        "OML_UNKNOWN_COMPONENT",
                        format!("unknown component `{name}`"),
                    )
                    .with_suggestion(format!("known components: {}", registry.list().join(", "))),
                );
                None
            }
        },
    };

    let mode = match step_obj.get("mode") {
        None => {
            violations.push(Violation::new(at("/mode"), "OML_MISSING_FIELD", "missing `mode`"));
            None
        }
        Some(raw_mode) => match serde_json::from_value::<Mode>(raw_mode.clone()) {
            Ok(mode @ (Mode::Extract | Mode::Write | Mode::Transform)) => Some(mode),
            Ok(other) => {
                violations.push(Violation::new(
                    at("/mode"),
                    "OML_BAD_MODE",
                    format!("mode `{other}` is not an OML step mode (read, write, transform)"),
                ));
                None
            }
            Err(_) => {
                violations.push(Violation::new(
                    at("/mode"),
                    "OML_BAD_MODE",
                    format!("unrecognized mode {raw_mode}"),
                ));
                None
            }
        },
    };

    let config = match step_obj.get("config") {
        None => serde_json::Value::Object(serde_json::Map::new()),
        Some(cfg @ serde_json::Value::Object(_)) => cfg.clone(),
        Some(other) => {
            violations.push(Violation::new(
                at("/config"),
                "OML_CFG_INVALID",
                format!("`config` must be a mapping, got {other}"),
            ));
            serde_json::Value::Object(serde_json::Map::new())
        }
    };

    if let (Some(component), Some(mode)) = (component.as_deref(), mode) {
        let spec = registry.get(component).expect("existence checked above");
        if !spec.supports_mode(mode) {
            violations.push(
                Violation::new(
                    at("/mode"),
                    "OML_BAD_MODE",
                    format!("component `{component}` does not support mode `{mode}`"),
                )
                .with_suggestion(format!(
                    "declared modes: {}",
                    spec.modes.iter().map(Mode::as_str).collect::<Vec<_>>().join(", ")
                )),
            );
        }
        if let Err(schema_violations) =
            validate_against_schema(&spec.config_schema, &config, "OML_CFG_INVALID")
        {
            violations.extend(schema_violations.into_iter().map(|v| {
                let pointer = if v.path == "/" { String::new() } else { v.path.clone() };
                Violation {
                    path: at(&format!("/config{pointer}")),
                    ..v
                }
            }));
        }
        // Inline secrets: a declared secret path may only hold an
        // environment-variable reference in the authored document.
        for secret_path in spec.secret_policy().effective_paths() {
            if let Some(found) = secret_path.resolve(&config) {
                let ok = match found {
                    serde_json::Value::Null => true,
                    serde_json::Value::String(s) => is_env_reference(s),
                    _ => false,
                };
                if !ok {
                    violations.push(
                        Violation::new(
                            at(&format!("/config/{secret_path}")),
                            "OML_INLINE_SECRET",
                            "secret values must not appear inline",
                        )
                        .with_suggestion("reference an environment variable: ${VAR_NAME}"),
                    );
                }
            }
        }
    }

    let mut needs = Vec::new();
    match step_obj.get("needs") {
        None => {}
        Some(serde_json::Value::Array(entries)) => {
            for (needs_index, entry) in entries.iter().enumerate() {
                let path = at(&format!("/needs/{needs_index}"));
                match entry.as_str().map(StepId::new) {
                    Some(Ok(id)) => {
                        if declared_ids.contains(id.as_str()) {
                            needs.push(id);
                        } else {
                            violations.push(Violation::new(
                                path,
                                "OML_DEP_UNKNOWN",
                                format!("`{id}` is not a declared step"),
                            ));
                        }
                    }
                    _ => violations.push(Violation::new(
                        path,
                        "OML_DEP_UNKNOWN",
                        format!("invalid step reference {entry}"),
                    )),
                }
            }
        }
        Some(other) => violations.push(Violation::new(
            at("/needs"),
            "OML_DEP_UNKNOWN",
            format!("`needs` must be a sequence of step ids, got {other}"),
        )),
    }

    let mut inputs = BTreeMap::new();
    match step_obj.get("inputs") {
        None => {}
        Some(serde_json::Value::Object(entries)) => {
            for (key, entry) in entries {
                let path = at(&format!("/inputs/{key}"));
                match serde_json::from_value::<InputRef>(entry.clone()) {
                    Ok(input) => {
                        if declared_ids.contains(input.from_step.as_str()) {
                            inputs.insert(key.clone(), input);
                        } else {
                            violations.push(Violation::new(
                                format!("{path}/from_step"),
                                "OML_DEP_UNKNOWN",
                                format!("`{}` is not a declared step", input.from_step),
                            ));
                        }
                    }
                    Err(err) => violations.push(Violation::new(
                        path,
                        "OML_DEP_UNKNOWN",
                        format!("invalid input reference: {err}"),
                    )),
                }
            }
        }
        Some(other) => violations.push(Violation::new(
            at("/inputs"),
            "OML_DEP_UNKNOWN",
            format!("`inputs` must be a mapping, got {other}"),
        )),
    }

    let retry = match step_obj.get("retry") {
        None => RetryPolicy::default(),
        Some(raw_retry) => match serde_json::from_value::<RetryPolicy>(raw_retry.clone()) {
            Ok(retry) if retry.max >= 1 => retry,
            Ok(_) => {
                violations.push(Violation::new(
                    at("/retry/max"),
                    "OML_CFG_INVALID",
                    "`retry.max` must be at least 1",
                ));
                RetryPolicy::default()
            }
            Err(err) => {
                violations.push(Violation::new(
                    at("/retry"),
                    "OML_CFG_INVALID",
                    format!("invalid retry policy: {err}"),
                ));
                RetryPolicy::default()
            }
        },
    };

    let timeout = match step_obj.get("timeout") {
        None => None,
        Some(serde_json::Value::String(raw_timeout)) => {
            if duration_str::parse(raw_timeout).is_ok() {
                Some(raw_timeout.clone())
            } else {
                violations.push(Violation::new(
                    at("/timeout"),
                    "OML_CFG_INVALID",
                    format!("`{raw_timeout}` is not a duration (expected e.g. \"30s\")"),
                ));
                None
            }
        }
        Some(other) => {
            violations.push(Violation::new(
                at("/timeout"),
                "OML_CFG_INVALID",
                format!("`timeout` must be a duration string, got {other}"),
            ));
            None
        }
    };

    if !violations.is_empty() {
        return Err(violations);
    }

    Ok(StepDecl {
        id: step_id.expect("validated above"),
        component: component.expect("validated above"),
        mode: mode.expect("validated above"),
        config,
        needs,
        inputs,
        retry,
        timeout,
    })
}

/// Kahn's algorithm over the effective dependency edges. Any step left
/// unprocessed sits on a cycle.
fn detect_cycles(steps: &[StepDecl]) -> Vec<Violation> {
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

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0;
    while let Some(i) = queue.pop_front() {
        processed += 1;
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if processed == steps.len() {
        return Vec::new();
    }
    steps
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] > 0)
        .map(|(i, step)| {
            Violation::new(
                format!("/steps/{i}/needs"),
                "OML_DEP_CYCLE",
                format!("step `{}` participates in a dependency cycle", step.id),
            )
        })
        .collect()
}

use super::{catalog::ConnectionCatalog, ConnError};
use crate::secrets::policy::is_env_reference;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@(?P<family>[a-z0-9_]+)(?:\.(?P<alias>[a-z0-9_-]+))?$").expect("valid regex")
    })
}

/// Splits `@family.alias` (or bare `@family`) into its parts. Returns
/// `None` for strings that are not connection references.
pub fn parse_reference(raw: &str) -> Option<(String, Option<String>)> {
    let captures = reference_re().captures(raw)?;
    Some((
        captures["family"].to_string(),
        captures.name("alias").map(|m| m.as_str().to_string()),
    ))
}

/// A descriptor field whose value is the *name* of an environment variable.
/// The value itself is read only at driver invocation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvRef {
    /// Slash path of the field inside the resolved connection.
    pub field: String,
    pub var: String,
}

/// The `resolved_connection` block embedded into a step configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConnection {
    pub family: String,
    pub alias: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub env_refs: Vec<EnvRef>,
}

impl ResolvedConnection {
    /// The inline mapping written into the per-step config: descriptor
    /// fields (env references still literal) plus provenance keys.
    pub fn to_config_value(&self) -> serde_json::Value {
        let mut map = self.fields.clone();
        map.insert("family".into(), self.family.clone().into());
        map.insert("alias".into(), self.alias.clone().into());
        serde_json::Value::Object(map)
    }
}

/// Resolves a connection reference against the catalog.
///
/// Every `${NAME}` scalar in the descriptor is recorded as an environment
/// reference and kept literal; no secret value exists at compile time.
pub fn resolve(
    catalog: &ConnectionCatalog,
    family: &str,
    alias: Option<&str>,
) -> Result<ResolvedConnection, ConnError> {
    let alias = match alias {
        Some(alias) => alias.to_string(),
        None => catalog.default_alias(family)?.to_string(),
    };
    let descriptor = catalog.descriptor(family, &alias)?;
    let fields = descriptor
        .as_object()
        .expect("catalog guarantees mapping descriptors")
        .clone();

    let mut env_refs = Vec::new();
    collect_env_refs(&serde_json::Value::Object(fields.clone()), String::new(), &mut env_refs);
    debug!(family, alias, env_fields = env_refs.len(), "connection resolved");

    Ok(ResolvedConnection {
        family: family.to_string(),
        alias,
        fields,
        env_refs,
    })
}

fn collect_env_refs(value: &serde_json::Value, prefix: String, out: &mut Vec<EnvRef>) {
    match value {
        serde_json::Value::String(s) if is_env_reference(s) => {
            out.push(EnvRef {
                field: prefix,
                var: s[2..s.len() - 1].to_string(),
            });
        }
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}/{key}")
                };
                collect_env_refs(child, path, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_env_refs(child, format!("{prefix}/{index}"), out);
            }
        }
        _ => {}
    }
}

/// Required fields of `resolved_connection` declared by the component's
/// configuration schema, checked against the resolved descriptor.
pub fn check_required_fields(
    resolved: &ResolvedConnection,
    config_schema: &serde_json::Value,
) -> Result<(), ConnError> {
    let required = config_schema
        .pointer("/properties/resolved_connection/required")
        .and_then(|v| v.as_array());
    let Some(required) = required else {
        return Ok(());
    };
    for field in required.iter().filter_map(|v| v.as_str()) {
        // Provenance keys are always injected.
        if field == "family" || field == "alias" {
            continue;
        }
        if !resolved.fields.contains_key(field) {
            return Err(ConnError::MissingField {
                family: resolved.family.clone(),
                alias: resolved.alias.clone(),
                field: field.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> ConnectionCatalog {
        ConnectionCatalog::from_yaml_str(
            r#"
mysql:
  default:
    host: db.internal
    port: 3306
    user: reader
    password: "${MYSQL_PASSWORD}"
"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_references_with_and_without_alias() {
        assert_eq!(
            Some(("mysql".to_string(), Some("replica".to_string()))),
            parse_reference("@mysql.replica")
        );
        assert_eq!(Some(("mysql".to_string(), None)), parse_reference("@mysql"));
        assert_eq!(None, parse_reference("mysql.default"));
        assert_eq!(None, parse_reference("@Bad.Alias"));
    }

    #[test]
    fn resolution_records_env_names_without_reading_values() {
        std::env::set_var("MYSQL_PASSWORD", "should-never-appear");
        let resolved = resolve(&catalog(), "mysql", None).unwrap();

        assert_eq!("default", resolved.alias);
        assert_eq!(
            vec![EnvRef {
                field: "password".to_string(),
                var: "MYSQL_PASSWORD".to_string()
            }],
            resolved.env_refs
        );
        // The literal `${...}` form survives into the config value.
        let config_value = resolved.to_config_value();
        assert_eq!(json!("${MYSQL_PASSWORD}"), config_value["password"]);
        assert_eq!(json!("mysql"), config_value["family"]);
        assert!(!config_value.to_string().contains("should-never-appear"));
    }

    #[test]
    fn nested_descriptor_fields_are_recorded_with_paths() {
        let value = json!({"tls": {"key": "${TLS_KEY}"}, "hosts": ["a", "${HOST_B}"]});
        let mut refs = Vec::new();
        collect_env_refs(&value, String::new(), &mut refs);
        refs.sort_by(|a, b| a.field.cmp(&b.field));
        assert_eq!(
            vec![
                EnvRef { field: "hosts/1".into(), var: "HOST_B".into() },
                EnvRef { field: "tls/key".into(), var: "TLS_KEY".into() },
            ],
            refs
        );
    }

    #[test]
    fn required_fields_from_the_component_schema_are_enforced() {
        let resolved = resolve(&catalog(), "mysql", None).unwrap();
        let schema = json!({
            "properties": {
                "resolved_connection": {
                    "type": "object",
                    "required": ["host", "database"]
                }
            }
        });
        let err = check_required_fields(&resolved, &schema).unwrap_err();
        assert_eq!("E_CONN_MISSING_FIELD", err.code());

        let satisfied = json!({
            "properties": {"resolved_connection": {"required": ["host", "user"]}}
        });
        assert!(check_required_fields(&resolved, &satisfied).is_ok());
    }
}

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// One validation finding, addressed by a JSON path.
///
/// Violations are aggregated: a validation pass reports everything it found
/// rather than stopping at the first problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggest: Option<String>,
}

impl Violation {
    pub fn new(path: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
            message: message.into(),
            suggest: None,
        }
    }

    pub fn with_suggestion(mut self, suggest: impl Into<String>) -> Self {
        self.suggest = Some(suggest.into());
        self
    }
}

impl Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.code, self.path, self.message)?;
        if let Some(suggest) = &self.suggest {
            write!(f, " (try: {suggest})")?;
        }
        Ok(())
    }
}

/// Validates `instance` against a JSON schema, mapping each schema error to
/// a [`Violation`] carrying the instance path.
pub fn validate_against_schema(
    schema: &serde_json::Value,
    instance: &serde_json::Value,
    code: &str,
) -> Result<(), Vec<Violation>> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            return Err(vec![Violation::new(
                "/",
                code,
                format!("configuration schema is itself invalid: {err}"),
            )]);
        }
    };
    let violations: Vec<Violation> = validator
        .iter_errors(instance)
        .map(|err| {
            // `instance_path` renders as a JSON pointer, empty at the root.
            let pointer = err.instance_path.to_string();
            let path = if pointer.is_empty() { "/".to_string() } else { pointer };
            Violation::new(path, code, err.to_string())
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_errors_carry_instance_paths() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });

        let err = validate_against_schema(&schema, &json!({"path": 42}), "CFG_INVALID")
            .unwrap_err();
        assert_eq!(1, err.len());
        assert_eq!("CFG_INVALID", err[0].code);
        assert!(err[0].path.contains("path"), "{}", err[0].path);
    }

    #[test]
    fn valid_instances_pass() {
        let schema = json!({"type": "object", "required": ["query"]});
        assert!(validate_against_schema(&schema, &json!({"query": "SELECT 1"}), "X").is_ok());
    }

    #[test]
    fn violations_render_with_suggestion() {
        let v = Violation::new("/version", "OML_FORBIDDEN_KEY", "forbidden key")
            .with_suggestion("use oml_version");
        assert_eq!(
            "OML_FORBIDDEN_KEY at /version: forbidden key (try: use oml_version)",
            v.to_string()
        );
    }
}

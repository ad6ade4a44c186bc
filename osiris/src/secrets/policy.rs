use super::{SecretError, SecretPath};
use crate::canon;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const DEFAULT_MASK: &str = "***";

/// How a secret value is rewritten for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Mask,
    Drop,
    Hash,
}

/// Redaction settings a component spec may override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionPolicy {
    pub strategy: Strategy,
    pub mask: String,
    /// Paths masked in addition to the spec's `secrets` list.
    pub extras: Vec<SecretPath>,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            strategy: Strategy::Mask,
            mask: DEFAULT_MASK.to_string(),
            extras: Vec::new(),
        }
    }
}

/// The effective secret handling for one component's configuration values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SecretPolicy {
    paths: Vec<SecretPath>,
    redaction: RedactionPolicy,
}

fn env_reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$\{[A-Za-z_][A-Za-z0-9_]*\}$").expect("valid regex"))
}

/// True for the `${NAME}` form that carries an environment-variable name
/// instead of a secret value.
pub fn is_env_reference(value: &str) -> bool {
    env_reference_re().is_match(value)
}

impl SecretPolicy {
    pub fn new(paths: Vec<SecretPath>, redaction: RedactionPolicy) -> Self {
        Self { paths, redaction }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.redaction.extras.is_empty()
    }

    pub fn mask_token(&self) -> &str {
        &self.redaction.mask
    }

    /// All declared paths, spec list first, redaction extras after.
    pub fn effective_paths(&self) -> impl Iterator<Item = &SecretPath> {
        self.paths.iter().chain(self.redaction.extras.iter())
    }

    /// Rewrites every secret path in `value` according to the strategy.
    /// Returns whether anything was rewritten.
    pub fn apply(&self, value: &mut serde_json::Value) -> Result<bool, SecretError> {
        let mut changed = false;
        for path in self.effective_paths().cloned().collect::<Vec<_>>() {
            match self.redaction.strategy {
                Strategy::Mask => {
                    if let Some(target) = path.resolve_mut(value) {
                        *target = serde_json::Value::String(self.redaction.mask.clone());
                        changed = true;
                    }
                }
                Strategy::Drop => {
                    if path.remove(value).is_some() {
                        changed = true;
                    }
                }
                Strategy::Hash => {
                    if let Some(target) = path.resolve_mut(value) {
                        let fp = canon::fingerprint(target)?;
                        *target = serde_json::Value::String(format!("sha256:{}", fp.short()));
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Refuses a value holding anything but a mask token or an env-variable
    /// reference at a declared secret path. Run on every artifact before it
    /// is written.
    pub fn scan(&self, value: &serde_json::Value) -> Result<(), SecretError> {
        for path in self.effective_paths() {
            let Some(found) = path.resolve(value) else {
                continue;
            };
            let allowed = match found {
                serde_json::Value::Null => true,
                serde_json::Value::String(s) => {
                    s == &self.redaction.mask
                        || s == DEFAULT_MASK
                        || s.starts_with("sha256:")
                        || is_env_reference(s)
                }
                _ => false,
            };
            if !allowed {
                return Err(SecretError::Leak {
                    path: path.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use serde_json::json;

    fn policy_with(strategy: Strategy, paths: &[&str]) -> SecretPolicy {
        SecretPolicy::new(
            paths.iter().map(|p| SecretPath::parse(p).unwrap()).collect(),
            RedactionPolicy {
                strategy,
                ..RedactionPolicy::default()
            },
        )
    }

    #[test]
    fn mask_replaces_the_scalar_with_the_token() {
        let policy = policy_with(Strategy::Mask, &["resolved_connection/password"]);
        let mut value = json!({"resolved_connection": {"password": "hunter2", "host": "db"}});

        assert!(policy.apply(&mut value).unwrap());
        assert_eq!(
            json!({"resolved_connection": {"password": "***", "host": "db"}}),
            value
        );
    }

    #[test]
    fn drop_removes_the_key() {
        let policy = policy_with(Strategy::Drop, &["auth/token"]);
        let mut value = json!({"auth": {"token": "abc", "user": "svc"}});

        assert!(policy.apply(&mut value).unwrap());
        assert_eq!(json!({"auth": {"user": "svc"}}), value);
    }

    #[test]
    fn hash_replaces_with_prefixed_short_fingerprint() {
        let policy = policy_with(Strategy::Hash, &["password"]);
        let mut value = json!({"password": "hunter2"});

        assert!(policy.apply(&mut value).unwrap());
        let rewritten = value["password"].as_str().unwrap();
        assert!(rewritten.starts_with("sha256:"), "{rewritten}");
        assert_eq!("sha256:".len() + 16, rewritten.len());
    }

    #[test]
    fn absent_paths_leave_the_value_untouched() {
        let policy = policy_with(Strategy::Mask, &["missing/path"]);
        let mut value = json!({"present": 1});
        assert!(!policy.apply(&mut value).unwrap());
        assert_eq!(json!({"present": 1}), value);
    }

    #[rstest]
    #[case::mask_token(json!({"password": "***"}))]
    #[case::env_reference(json!({"password": "${MYSQL_PASSWORD}"}))]
    #[case::hashed(json!({"password": "sha256:0123456789abcdef"}))]
    #[case::absent(json!({"host": "db"}))]
    #[case::null(json!({"password": null}))]
    fn scan_accepts_masked_and_env_forms(#[case] value: serde_json::Value) {
        let policy = policy_with(Strategy::Mask, &["password"]);
        assert!(policy.scan(&value).is_ok());
    }

    #[rstest]
    #[case::raw_string(json!({"password": "hunter2"}))]
    #[case::number(json!({"password": 42}))]
    #[case::mapping(json!({"password": {"inner": "x"}}))]
    fn scan_refuses_raw_values(#[case] value: serde_json::Value) {
        let policy = policy_with(Strategy::Mask, &["password"]);
        let err = policy.scan(&value).unwrap_err();
        assert_matches!(err, SecretError::Leak { ref path } if path == "password");
        assert_eq!("E_SECRET_LEAK", err.code());
    }

    #[test]
    fn env_reference_form_is_strict() {
        assert!(is_env_reference("${MYSQL_PASSWORD}"));
        assert!(is_env_reference("${_private}"));
        assert!(!is_env_reference("$MYSQL_PASSWORD"));
        assert!(!is_env_reference("${BAD NAME}"));
        assert!(!is_env_reference("prefix ${NAME}"));
    }
}

use crate::utils::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::OnceLock;
use thiserror::Error;

fn session_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^run_[0-9]+$").expect("valid regex"))
}

#[derive(Error, Debug)]
#[error("session id `{0}` must match `run_<digits>`")]
pub struct SessionIdError(String);

/// Identifier of one execution attempt, `run_<unix-ms>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Mints an id from the current wall clock.
    pub fn new_now() -> Self {
        Self(format!("run_{}", time::unix_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        if session_id_re().is_match(&raw) {
            Ok(Self(raw))
        } else {
            Err(SessionIdError(raw))
        }
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_follow_the_contract() {
        let id = SessionId::new_now();
        assert!(id.as_str().starts_with("run_"));
        assert!(SessionId::try_from(id.as_str().to_string()).is_ok());
    }

    #[test]
    fn arbitrary_strings_are_rejected() {
        assert!(SessionId::try_from("run_".to_string()).is_err());
        assert!(SessionId::try_from("session_12".to_string()).is_err());
        assert!(SessionId::try_from("run_12x".to_string()).is_err());
        assert!(SessionId::try_from("run_1722470400000".to_string()).is_ok());
    }
}

use crate::oml::StepId;
use serde::{Deserialize, Serialize};

/// The final record of a session, written exactly once at close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub ok: bool,
    pub steps_completed: u32,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_of_stderr: Option<String>,
}

impl Status {
    pub fn success(steps_completed: u32) -> Self {
        Self {
            ok: true,
            steps_completed,
            exit_code: 0,
            failed_step: None,
            error: None,
            tail_of_stderr: None,
        }
    }

    pub fn failure(steps_completed: u32, failed_step: Option<StepId>, error: String) -> Self {
        Self {
            ok: false,
            steps_completed,
            exit_code: 4,
            failed_step,
            error: Some(error),
            tail_of_stderr: None,
        }
    }

    /// The host-written status when the worker never sealed its session.
    pub fn contract_violation(tail_of_stderr: String) -> Self {
        Self {
            ok: false,
            steps_completed: 0,
            exit_code: 4,
            failed_step: None,
            error: Some("status_contract_violation".to_string()),
            tail_of_stderr: Some(tail_of_stderr),
        }
    }
}

//! The framed newline-JSON protocol between the proxy adapter and the
//! worker.
//!
//! Commands travel host → worker on stdin; the worker's stdout is the
//! single ordered channel for command replies, event records and metric
//! records. Anything unparseable is a log line. Configuration data never
//! rides in a command record; `exec_step` references the uploaded file.

use crate::oml::{InputRef, StepId};
use crate::session::events::{EventRecord, MetricRecord};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Prepare {
        install_deps: bool,
    },
    ExecStep {
        step_id: StepId,
        driver: String,
        cfg_path: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, InputRef>,
    },
    Cleanup,
}

impl Command {
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Worker acknowledgement of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    /// Echo of the command name.
    pub reply: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    /// The worker's session id, reported on `prepare` so the host can
    /// fetch session files from the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One classified line of worker stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    Event(EventRecord),
    Metric(MetricRecord),
    Reply(CommandReply),
    Log(String),
}

/// Structural classification: a JSON object with an `event` field is an
/// event record, `metric` a metric record, `reply` a command reply.
/// Everything else (including malformed JSON) is a log line.
pub fn classify(line: &str) -> WorkerLine {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return WorkerLine::Log(line.to_string());
    };
    if !value.is_object() {
        return WorkerLine::Log(line.to_string());
    }
    if value.get("event").is_some() {
        if let Ok(record) = serde_json::from_value::<EventRecord>(value.clone()) {
            return WorkerLine::Event(record);
        }
    }
    if value.get("metric").is_some() {
        if let Ok(record) = serde_json::from_value::<MetricRecord>(value.clone()) {
            return WorkerLine::Metric(record);
        }
    }
    if value.get("reply").is_some() {
        if let Ok(reply) = serde_json::from_value::<CommandReply>(value) {
            return WorkerLine::Reply(reply);
        }
    }
    WorkerLine::Log(line.to_string())
}

/// The command stream covering one whole run.
pub fn command_stream(
    steps: impl IntoIterator<Item = Command>,
    install_deps: bool,
) -> Vec<Command> {
    let mut commands = vec![Command::Prepare { install_deps }];
    commands.extend(steps);
    commands.push(Command::Cleanup);
    commands
}

pub fn encode_stream(commands: &[Command]) -> serde_json::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for command in commands {
        bytes.extend_from_slice(command.to_line()?.as_bytes());
        bytes.push(b'\n');
    }
    Ok(bytes)
}

use crate::oml::StepId;
use crate::session::events::{EventName, MetricName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// A tabular value passed between steps by reference within a process.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A value produced by a step. Opaque to the engine; the variants exist so
/// drivers can agree on what they exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepValue {
    Table(Table),
    Json(serde_json::Value),
}

impl StepValue {
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            StepValue::Table(table) => Some(table),
            StepValue::Json(_) => None,
        }
    }
}

pub type Inputs = BTreeMap<String, StepValue>;
pub type Outputs = BTreeMap<String, StepValue>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("environment variable `{0}` is not set")]
    EnvMissing(String),
    #[error("missing input `{0}`")]
    InputMissing(String),
    #[error("input `{key}` has the wrong type, expected {expected}")]
    InputType { key: String, expected: String },
    #[error("step timed out after {0}")]
    Timeout(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("source error: {0}")]
    Source(String),
    #[error("no driver registered for `{0}`")]
    Unregistered(String),
}

impl DriverError {
    /// Stable machine code recorded in `step_failed` events and status
    /// records.
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::Config(_) => "E_CFG_INVALID",
            DriverError::EnvMissing(_) => "E_ENV_MISSING",
            DriverError::InputMissing(_) => "E_INPUT_MISSING",
            DriverError::InputType { .. } => "E_INPUT_TYPE",
            DriverError::Timeout(_) => "E_STEP_TIMEOUT",
            DriverError::Io(_) => "E_IO",
            DriverError::Csv(_) => "E_CSV",
            DriverError::Source(_) => "E_SOURCE",
            DriverError::Unregistered(_) => "E_DRIVER_UNREGISTERED",
        }
    }

    /// Coarse classification preserved in the `error_type` event field.
    pub fn error_type(&self) -> &'static str {
        match self {
            DriverError::Config(_) => "config",
            DriverError::EnvMissing(_) => "env_missing",
            DriverError::InputMissing(_) | DriverError::InputType { .. } => "input",
            DriverError::Timeout(_) => "timeout",
            DriverError::Io(_) => "io",
            DriverError::Csv(_) => "csv",
            DriverError::Source(_) => "source",
            DriverError::Unregistered(_) => "driver_unavailable",
        }
    }
}

/// The engine-side facility a driver may talk to during `run`.
///
/// It deliberately does not expose the session itself: a driver can emit
/// observability records, locate its artifacts directory and read the
/// environment, nothing more.
pub trait StepContext: Send + Sync {
    fn log_event(&self, name: EventName, fields: serde_json::Value);
    fn log_metric(
        &self,
        name: MetricName,
        value: f64,
        unit: Option<&str>,
        tags: Option<serde_json::Value>,
    );
    /// The step's own directory under `artifacts/`.
    fn artifacts_dir(&self) -> &Path;
    fn env(&self, name: &str) -> Option<String>;
}

/// A polymorphic unit of executable behavior, invoked once per step.
pub trait Driver: Send {
    fn run(
        &self,
        step_id: &StepId,
        config: &serde_json::Value,
        inputs: &Inputs,
        ctx: &dyn StepContext,
    ) -> Result<Outputs, DriverError>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<dyn Driver>")
    }
}

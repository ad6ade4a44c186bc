use super::id::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The closed set of event names a session may record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    RunStart,
    RunComplete,
    EnvLoaded,
    AdapterSelected,
    AdapterPrepareStart,
    PreflightValidationSuccess,
    CfgMaterialized,
    ManifestMaterialized,
    StepStart,
    StepComplete,
    StepFailed,
    ArtifactCreated,
    ArtifactsDirCreated,
    ConnectionResolveStart,
    ConnectionResolveComplete,
    ConfigMetaStripped,
    DriverRegistered,
    DriversRegistered,
    DriverRegistrationFailed,
    DependencyCheck,
    DependencyInstalled,
    SessionInitialized,
    StatusContractViolation,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::RunStart => "run_start",
            EventName::RunComplete => "run_complete",
            EventName::EnvLoaded => "env_loaded",
            EventName::AdapterSelected => "adapter_selected",
            EventName::AdapterPrepareStart => "adapter_prepare_start",
            EventName::PreflightValidationSuccess => "preflight_validation_success",
            EventName::CfgMaterialized => "cfg_materialized",
            EventName::ManifestMaterialized => "manifest_materialized",
            EventName::StepStart => "step_start",
            EventName::StepComplete => "step_complete",
            EventName::StepFailed => "step_failed",
            EventName::ArtifactCreated => "artifact_created",
            EventName::ArtifactsDirCreated => "artifacts_dir_created",
            EventName::ConnectionResolveStart => "connection_resolve_start",
            EventName::ConnectionResolveComplete => "connection_resolve_complete",
            EventName::ConfigMetaStripped => "config_meta_stripped",
            EventName::DriverRegistered => "driver_registered",
            EventName::DriversRegistered => "drivers_registered",
            EventName::DriverRegistrationFailed => "driver_registration_failed",
            EventName::DependencyCheck => "dependency_check",
            EventName::DependencyInstalled => "dependency_installed",
            EventName::SessionInitialized => "session_initialized",
            EventName::StatusContractViolation => "status_contract_violation",
        }
    }
}

impl Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The closed set of metric names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    StepsTotal,
    StepsCompleted,
    StepDurationMs,
    RowsRead,
    RowsWritten,
    RowsProcessed,
    ExecutionDuration,
    AdapterExecutionDuration,
    SessionDurationSeconds,
    SandboxOverheadMs,
    ArtifactsCopyMs,
    ArtifactsBytesTotal,
    ArtifactsFilesTotal,
    AdapterExitCode,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::StepsTotal => "steps_total",
            MetricName::StepsCompleted => "steps_completed",
            MetricName::StepDurationMs => "step_duration_ms",
            MetricName::RowsRead => "rows_read",
            MetricName::RowsWritten => "rows_written",
            MetricName::RowsProcessed => "rows_processed",
            MetricName::ExecutionDuration => "execution_duration",
            MetricName::AdapterExecutionDuration => "adapter_execution_duration",
            MetricName::SessionDurationSeconds => "session_duration_seconds",
            MetricName::SandboxOverheadMs => "sandbox_overhead_ms",
            MetricName::ArtifactsCopyMs => "artifacts_copy_ms",
            MetricName::ArtifactsBytesTotal => "artifacts_bytes_total",
            MetricName::ArtifactsFilesTotal => "artifacts_files_total",
            MetricName::AdapterExitCode => "adapter_exit_code",
        }
    }
}

impl Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: String,
    pub session: SessionId,
    pub event: EventName,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// One line of `metrics.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub ts: String,
    pub session: SessionId,
    pub metric: MetricName,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
}

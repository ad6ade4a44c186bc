//! Per-step execution shared by the local adapter and the sandbox worker:
//! environment substitution, symbolic input resolution, retry, timeout,
//! and the step event sequence. Running the same code on both sides is
//! what makes adapter parity structural rather than aspirational.

use crate::compile::ManifestStep;
use crate::drivers::{DriverError, DriverRegistry, Inputs, Outputs, StepContext, StepValue};
use crate::oml::StepId;
use crate::secrets::policy::is_env_reference;
use crate::secrets::SecretPolicy;
use crate::session::events::{EventName, EventRecord, MetricName, MetricRecord};
use crate::session::SessionContext;
use crate::utils::threads::spawn_named_thread;
use crate::utils::time;
use crossbeam::channel;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Secondary destination for step records; the worker points this at
/// stdout so the host can mirror its session.
pub trait RecordMirror: Send + Sync {
    fn event(&self, record: &EventRecord);
    fn metric(&self, record: &MetricRecord);
}

/// The step-scoped [`StepContext`] implementation handed to drivers.
///
/// Closes when the engine stops listening (timeout), so a straggling
/// driver thread cannot interleave records into a later step.
pub struct StepScope {
    session: Arc<SessionContext>,
    step_id: StepId,
    policy: SecretPolicy,
    artifacts: PathBuf,
    mirror: Option<Arc<dyn RecordMirror>>,
    closed: AtomicBool,
}

impl StepScope {
    fn new(
        session: Arc<SessionContext>,
        step_id: StepId,
        policy: SecretPolicy,
        artifacts: PathBuf,
        mirror: Option<Arc<dyn RecordMirror>>,
    ) -> Self {
        Self {
            session,
            step_id,
            policy,
            artifacts,
            mirror,
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn masked(&self, mut fields: serde_json::Value) -> serde_json::Value {
        if let Err(err) = self.policy.apply(&mut fields) {
            warn!(step = %self.step_id, %err, "masking failed, dropping fields");
            return json!({});
        }
        crate::session::masking::mask_known_fields(&mut fields);
        fields
    }
}

impl StepContext for StepScope {
    fn log_event(&self, name: EventName, fields: serde_json::Value) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let fields = self.masked(fields);
        if let Err(err) = self.session.event(name, fields.clone()) {
            warn!(step = %self.step_id, %err, "event append failed");
        }
        if let Some(mirror) = &self.mirror {
            mirror.event(&EventRecord {
                ts: time::iso_timestamp(),
                session: self.session.id().clone(),
                event: name,
                fields: match fields {
                    serde_json::Value::Object(map) => map,
                    other => serde_json::Map::from_iter([("value".to_string(), other)]),
                },
            });
        }
    }

    fn log_metric(
        &self,
        name: MetricName,
        value: f64,
        unit: Option<&str>,
        tags: Option<serde_json::Value>,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.session.metric(name, value, unit, tags.clone()) {
            warn!(step = %self.step_id, %err, "metric append failed");
        }
        if let Some(mirror) = &self.mirror {
            mirror.metric(&MetricRecord {
                ts: time::iso_timestamp(),
                session: self.session.id().clone(),
                metric: name,
                value,
                unit: unit.map(str::to_string),
                tags,
            });
        }
    }

    fn artifacts_dir(&self) -> &Path {
        &self.artifacts
    }

    fn env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// In-memory store of step outputs, keyed by producing step id. Owned by
/// the adapter (or worker) for the duration of one run.
#[derive(Default)]
pub struct OutputStore {
    outputs: HashMap<StepId, Outputs>,
}

impl OutputStore {
    pub fn insert(&mut self, step_id: StepId, outputs: Outputs) {
        self.outputs.insert(step_id, outputs);
    }

    /// Resolves a manifest step's symbolic inputs against stored outputs.
    pub fn resolve(&self, step: &ManifestStep) -> Result<Inputs, DriverError> {
        let mut inputs = Inputs::new();
        for (key, input_ref) in &step.inputs {
            let value = self
                .outputs
                .get(&input_ref.from_step)
                .and_then(|outputs| outputs.get(&input_ref.key))
                .ok_or_else(|| {
                    DriverError::InputMissing(format!(
                        "{key} <- {}.{}",
                        input_ref.from_step, input_ref.key
                    ))
                })?;
            inputs.insert(key.clone(), value.clone());
        }
        Ok(inputs)
    }
}

#[derive(Debug)]
pub struct StepSuccess {
    pub outputs: Outputs,
    pub duration_ms: u128,
}

#[derive(Debug)]
pub struct StepFailure {
    pub code: &'static str,
    pub error_type: &'static str,
    pub error: String,
}

/// Runs one manifest step to completion, honoring its retry policy and
/// timeout, emitting the step event sequence on the session (and mirror).
pub fn execute_step(
    step: &ManifestStep,
    cfg: &serde_json::Value,
    store: &OutputStore,
    drivers: &DriverRegistry,
    session: &Arc<SessionContext>,
    policy: &SecretPolicy,
    mirror: Option<Arc<dyn RecordMirror>>,
) -> Result<StepSuccess, StepFailure> {
    let mut last_failure = None;
    // A hand-edited manifest may carry `max: 0`; one attempt always runs.
    for attempt in 1..=step.retry.max.max(1) {
        let delay = step.retry.delay_before_attempt(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match execute_attempt(step, cfg, store, drivers, session, policy, mirror.clone(), attempt) {
            Ok(success) => return Ok(success),
            Err(failure) => last_failure = Some(failure),
        }
    }
    Err(last_failure.expect("at least one attempt ran"))
}

#[allow(clippy::too_many_arguments)]
fn execute_attempt(
    step: &ManifestStep,
    cfg: &serde_json::Value,
    store: &OutputStore,
    drivers: &DriverRegistry,
    session: &Arc<SessionContext>,
    policy: &SecretPolicy,
    mirror: Option<Arc<dyn RecordMirror>>,
    attempt: u32,
) -> Result<StepSuccess, StepFailure> {
    let started = Instant::now();

    // Artifacts directory first: it must exist even if the step fails
    // before its driver runs.
    let (artifacts, dir_created) = session
        .ensure_artifacts_dir(&step.id)
        .unwrap_or_else(|_| (PathBuf::new(), false));
    let scope = Arc::new(StepScope::new(
        Arc::clone(session),
        step.id.clone(),
        policy.clone(),
        artifacts,
        mirror,
    ));

    if dir_created {
        scope.log_event(
            EventName::ArtifactsDirCreated,
            json!({"step_id": step.id.as_str()}),
        );
    }
    scope.log_event(
        EventName::StepStart,
        json!({"step_id": step.id.as_str(), "driver": step.driver, "attempt": attempt}),
    );

    let result = run_driver(step, cfg, store, drivers, &scope);
    let duration_ms = started.elapsed().as_millis();

    match result {
        Ok(outputs) => {
            let rows_processed = rows_in(&outputs);
            let mut fields = json!({
                "step_id": step.id.as_str(),
                "duration_ms": duration_ms as u64,
                "attempt": attempt,
            });
            if let Some(rows) = rows_processed {
                fields["rows_processed"] = json!(rows);
            }
            scope.log_event(EventName::StepComplete, fields);
            scope.log_metric(
                MetricName::StepDurationMs,
                duration_ms as f64,
                Some("ms"),
                Some(json!({"step_id": step.id.as_str()})),
            );
            scope.close();
            Ok(StepSuccess {
                outputs,
                duration_ms,
            })
        }
        Err(err) => {
            let failure = StepFailure {
                code: err.code(),
                error_type: err.error_type(),
                error: format!("{}: {err}", err.code()),
            };
            scope.log_event(
                EventName::StepFailed,
                json!({
                    "step_id": step.id.as_str(),
                    "driver": step.driver,
                    "attempt": attempt,
                    "error": failure.error,
                    "error_type": failure.error_type,
                    "traceback": format!("{err:?}"),
                }),
            );
            scope.close();
            Err(failure)
        }
    }
}

fn run_driver(
    step: &ManifestStep,
    cfg: &serde_json::Value,
    store: &OutputStore,
    drivers: &DriverRegistry,
    scope: &Arc<StepScope>,
) -> Result<Outputs, DriverError> {
    let mut cfg = cfg.clone();
    // The compiler already strips meta keys; a manifest edited by hand may
    // still carry them, and they must never reach a driver.
    let stripped = strip_meta_keys(&mut cfg);
    if !stripped.is_empty() {
        scope.log_event(
            EventName::ConfigMetaStripped,
            json!({"step_id": step.id.as_str(), "keys": stripped}),
        );
    }
    substitute_env(step, &mut cfg, scope)?;
    let inputs = store.resolve(step)?;

    let driver = drivers
        .create(step.component_name())
        .map_err(|_| DriverError::Unregistered(step.component_name().to_string()))?;

    match step.timeout_duration() {
        None => driver.run(&step.id, &cfg, &inputs, scope.as_ref()),
        Some(timeout) => {
            let (tx, rx) = channel::bounded(1);
            let thread_scope = Arc::clone(scope);
            let step_id = step.id.clone();
            spawn_named_thread(format!("step-{step_id}"), move || {
                let result = driver.run(&step_id, &cfg, &inputs, thread_scope.as_ref());
                let _ = tx.send(result);
            });
            match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(channel::RecvTimeoutError::Timeout) => {
                    // The scope closes with the attempt; a straggling
                    // driver thread can no longer emit.
                    Err(DriverError::Timeout(
                        step.timeout.clone().unwrap_or_default(),
                    ))
                }
                Err(channel::RecvTimeoutError::Disconnected) => Err(DriverError::Source(
                    "driver thread terminated without a result".to_string(),
                )),
            }
        }
    }
}

fn strip_meta_keys(cfg: &mut serde_json::Value) -> Vec<String> {
    let Some(map) = cfg.as_object_mut() else {
        return Vec::new();
    };
    let stripped: Vec<String> = map.keys().filter(|k| k.starts_with('_')).cloned().collect();
    for key in &stripped {
        map.remove(key);
    }
    stripped
}

/// Replaces every `${NAME}` scalar with the variable's value, read at
/// invocation time. The values are registered with the session scrubber so
/// they can never appear in any session file.
fn substitute_env(
    step: &ManifestStep,
    cfg: &mut serde_json::Value,
    scope: &Arc<StepScope>,
) -> Result<(), DriverError> {
    let resolving_connection = cfg.get("resolved_connection").is_some();
    if resolving_connection {
        scope.log_event(
            EventName::ConnectionResolveStart,
            json!({"step_id": step.id.as_str()}),
        );
    }
    substitute_value(cfg, scope)?;
    if resolving_connection {
        scope.log_event(
            EventName::ConnectionResolveComplete,
            json!({"step_id": step.id.as_str()}),
        );
    }
    Ok(())
}

fn substitute_value(
    value: &mut serde_json::Value,
    scope: &Arc<StepScope>,
) -> Result<(), DriverError> {
    match value {
        serde_json::Value::String(s) if is_env_reference(s) => {
            let name = &s[2..s.len() - 1];
            let resolved = scope
                .env(name)
                .ok_or_else(|| DriverError::EnvMissing(name.to_string()))?;
            scope.session.register_sensitive(resolved.clone());
            *value = serde_json::Value::String(resolved);
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for child in map.values_mut() {
                substitute_value(child, scope)?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for child in items.iter_mut() {
                substitute_value(child, scope)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn rows_in(outputs: &Outputs) -> Option<u64> {
    let mut total = None;
    for value in outputs.values() {
        if let StepValue::Table(table) = value {
            *total.get_or_insert(0) += table.row_count() as u64;
        }
    }
    total
}

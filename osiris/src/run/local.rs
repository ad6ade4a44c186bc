//! The in-process adapter: prepare, execute, collect.

use super::step_exec::{execute_step, OutputStore};
use crate::canon;
use crate::compile::Manifest;
use crate::components::ComponentRegistry;
use crate::drivers::DriverRegistry;
use crate::secrets::SecretPolicy;
use crate::session::events::{EventName, MetricName};
use crate::session::{SealGuard, SessionContext, Status};
use fs::reader::{FileReader, ReadError};
use fs::LocalFile;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

pub struct LocalAdapter<'d> {
    drivers: &'d DriverRegistry,
}

impl<'d> LocalAdapter<'d> {
    pub fn new(drivers: &'d DriverRegistry) -> Self {
        Self { drivers }
    }

    /// Runs the manifest to a sealed session. Failures become failure
    /// statuses; the session is sealed on every path.
    pub fn execute(
        &self,
        manifest: &Manifest,
        manifest_dir: &Path,
        session: &Arc<SessionContext>,
        specs: &ComponentRegistry,
    ) -> Status {
        let started = Instant::now();
        let _guard = SealGuard::new(
            Arc::clone(session),
            Status::failure(0, None, "run aborted before collect".to_string()),
        );

        let status = self.run_phases(manifest, manifest_dir, session, specs, started);
        if let Err(err) = session.seal(&status) {
            error!(session = %session.id(), %err, "sealing failed");
        }
        status
    }

    fn run_phases(
        &self,
        manifest: &Manifest,
        manifest_dir: &Path,
        session: &Arc<SessionContext>,
        specs: &ComponentRegistry,
        started: Instant,
    ) -> Status {
        let emit = |name: EventName, fields: serde_json::Value| {
            if let Err(err) = session.event(name, fields) {
                error!(session = %session.id(), %err, "event emission failed");
            }
        };
        let emit_metric = |name: MetricName, value: f64, unit: Option<&str>| {
            let _ = session.metric(name, value, unit, None);
        };

        emit(
            EventName::RunStart,
            json!({"pipeline": manifest.pipeline.id.as_str(), "manifest_fp": manifest.pipeline.fingerprints.manifest_fp.as_str()}),
        );
        emit(EventName::AdapterSelected, json!({"adapter": "local"}));

        // prepare
        emit(EventName::AdapterPrepareStart, json!({}));
        if let Err(status) = self.prepare(manifest, manifest_dir, session, specs, &emit) {
            return status;
        }
        emit(EventName::PreflightValidationSuccess, json!({}));
        emit_metric(MetricName::StepsTotal, manifest.steps.len() as f64, None);

        // execute
        let mut store = OutputStore::default();
        let mut steps_completed = 0u32;
        for step in &manifest.steps {
            let policy = specs
                .get(step.component_name())
                .map(|spec| spec.secret_policy())
                .unwrap_or_else(|_| SecretPolicy::default());
            let cfg = match load_cfg(session, step.cfg_path.as_str()) {
                Ok(cfg) => cfg,
                Err(message) => {
                    return self.fail(
                        session,
                        steps_completed,
                        Some(step.id.clone()),
                        message,
                        started,
                    );
                }
            };
            match execute_step(step, &cfg, &store, self.drivers, session, &policy, None) {
                Ok(success) => {
                    store.insert(step.id.clone(), success.outputs);
                    steps_completed += 1;
                }
                Err(failure) => {
                    // Reference policy: a failed step aborts the run.
                    return self.fail(
                        session,
                        steps_completed,
                        Some(step.id.clone()),
                        failure.error,
                        started,
                    );
                }
            }
        }

        // collect
        emit_metric(MetricName::StepsCompleted, steps_completed as f64, None);
        emit_metric(
            MetricName::ExecutionDuration,
            started.elapsed().as_secs_f64(),
            Some("s"),
        );
        emit_metric(
            MetricName::SessionDurationSeconds,
            started.elapsed().as_secs_f64(),
            Some("s"),
        );
        emit(
            EventName::RunComplete,
            json!({"pipeline": manifest.pipeline.id.as_str(), "steps_completed": steps_completed}),
        );
        info!(session = %session.id(), steps_completed, "run complete");
        Status::success(steps_completed)
    }

    /// Materializes the manifest and every per-step config into the
    /// session, verifying existence and scanning for leaks first.
    fn prepare(
        &self,
        manifest: &Manifest,
        manifest_dir: &Path,
        session: &Arc<SessionContext>,
        specs: &ComponentRegistry,
        emit: &impl Fn(EventName, serde_json::Value),
    ) -> Result<(), Status> {
        for step in &manifest.steps {
            let bytes = LocalFile
                .read_bytes(&manifest_dir.join(&step.cfg_path))
                .map_err(|err: ReadError| {
                    Status::failure(
                        0,
                        Some(step.id.clone()),
                        format!("E_CFG_MISSING: {err}"),
                    )
                })?;

            // Pre-commit leak scan under the governing component's policy.
            let parsed: serde_json::Value = serde_json::from_slice(&bytes).map_err(|err| {
                Status::failure(0, Some(step.id.clone()), format!("E_CFG_INVALID: {err}"))
            })?;
            if let Ok(spec) = specs.get(step.component_name()) {
                spec.secret_policy().scan(&parsed).map_err(|err| {
                    Status::failure(0, Some(step.id.clone()), format!("{}: {err}", err.code()))
                })?;
            }

            if let Err(err) = session.write_cfg(&step.id, &bytes) {
                return Err(Status::failure(
                    0,
                    Some(step.id.clone()),
                    format!("E_CFG_WRITE: {err}"),
                ));
            }
            emit(
                EventName::CfgMaterialized,
                json!({
                    "path": step.cfg_path,
                    "size": bytes.len(),
                    "sha256": canon::sha256_hex(&bytes).as_str(),
                }),
            );
        }

        let manifest_bytes = LocalFile
            .read_bytes(&manifest_dir.join("manifest.yaml"))
            .map_err(|err| Status::failure(0, None, format!("E_MANIFEST_MISSING: {err}")))?;
        if let Err(err) = session.write_manifest(&manifest_bytes) {
            return Err(Status::failure(0, None, format!("E_MANIFEST_WRITE: {err}")));
        }
        emit(
            EventName::ManifestMaterialized,
            json!({
                "path": "manifest.yaml",
                "size": manifest_bytes.len(),
                "sha256": canon::sha256_hex(&manifest_bytes).as_str(),
            }),
        );
        Ok(())
    }

    fn fail(
        &self,
        session: &Arc<SessionContext>,
        steps_completed: u32,
        failed_step: Option<crate::oml::StepId>,
        error: String,
        started: Instant,
    ) -> Status {
        let _ = session.metric(MetricName::StepsCompleted, steps_completed as f64, None, None);
        let _ = session.metric(
            MetricName::ExecutionDuration,
            started.elapsed().as_secs_f64(),
            Some("s"),
            None,
        );
        Status::failure(steps_completed, failed_step, error)
    }
}

fn load_cfg(session: &Arc<SessionContext>, cfg_path: &str) -> Result<serde_json::Value, String> {
    let path = session.root().join(cfg_path);
    let bytes = LocalFile
        .read_bytes(&path)
        .map_err(|err| format!("E_CFG_MISSING: {err}"))?;
    serde_json::from_slice(&bytes).map_err(|err| format!("E_CFG_INVALID: {err}"))
}

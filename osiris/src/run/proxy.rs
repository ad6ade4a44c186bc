//! The remote-proxy adapter: behavioral parity with the local adapter
//! while every step executes inside an isolated sandbox.

use super::protocol::{classify, command_stream, encode_stream, Command, WorkerLine};
use super::sandbox::{Sandbox, SandboxError};
use crate::canon;
use crate::compile::Manifest;
use crate::components::ComponentRegistry;
use crate::oml::StepId;
use crate::session::events::{EventName, MetricName};
use crate::session::{SealGuard, SessionContext, SessionId, Status};
use crate::utils::threads::spawn_named_thread;
use fs::reader::FileReader;
use fs::LocalFile;
use serde_json::json;
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(600);
const STDERR_TAIL_LINES: usize = 40;

/// Per-run state machine. Terminal state is always `Sealed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Preparing,
    Running,
    Cleanup,
    Failed,
    Sealed,
}

pub struct ProxyAdapter<S: Sandbox> {
    sandbox: S,
    wall_timeout: Duration,
    state: RunState,
}

impl<S: Sandbox> ProxyAdapter<S> {
    pub fn new(sandbox: S, wall_timeout: Option<Duration>) -> Self {
        Self {
            sandbox,
            wall_timeout: wall_timeout.unwrap_or(DEFAULT_SANDBOX_TIMEOUT),
            state: RunState::Idle,
        }
    }

    pub fn execute(
        mut self,
        manifest: &Manifest,
        manifest_dir: &Path,
        session: &Arc<SessionContext>,
        specs: &ComponentRegistry,
    ) -> Status {
        let _guard = SealGuard::new(
            Arc::clone(session),
            Status::failure(0, None, "proxy run aborted before cleanup".to_string()),
        );

        let status = self.drive(manifest, manifest_dir, session, specs);
        if let Err(err) = session.seal(&status) {
            error!(session = %session.id(), %err, "sealing failed");
        }
        self.state = RunState::Sealed;
        status
    }

    fn drive(
        &mut self,
        manifest: &Manifest,
        manifest_dir: &Path,
        session: &Arc<SessionContext>,
        specs: &ComponentRegistry,
    ) -> Status {
        let started = Instant::now();
        let emit = |name: EventName, fields: serde_json::Value| {
            if let Err(err) = session.event(name, fields) {
                error!(session = %session.id(), %err, "event emission failed");
            }
        };

        emit(
            EventName::RunStart,
            json!({"pipeline": manifest.pipeline.id.as_str(), "manifest_fp": manifest.pipeline.fingerprints.manifest_fp.as_str()}),
        );
        emit(EventName::AdapterSelected, json!({"adapter": "remote"}));
        emit(EventName::AdapterPrepareStart, json!({}));
        self.state = RunState::Preparing;

        if let Err(status) = self.prepare(manifest, manifest_dir, session, specs, &emit) {
            self.state = RunState::Failed;
            return status;
        }
        emit(EventName::PreflightValidationSuccess, json!({}));
        let _ = session.metric(MetricName::StepsTotal, manifest.steps.len() as f64, None, None);

        // The whole run is scripted up front; the configuration rides in
        // the uploaded files, never in the commands.
        let commands = command_stream(
            manifest.steps.iter().map(|step| Command::ExecStep {
                step_id: step.id.clone(),
                driver: step.driver.clone(),
                cfg_path: step.cfg_path.clone(),
                inputs: step.inputs.clone(),
            }),
            false,
        );
        let encoded = match encode_stream(&commands) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.state = RunState::Failed;
                return Status::failure(0, None, format!("E_PROTOCOL: {err}"));
            }
        };

        let (stdout, stderr) = match self.sandbox.start_worker(&encoded) {
            Ok(streams) => (streams.stdout, streams.stderr),
            Err(err) => {
                self.state = RunState::Failed;
                return Status::failure(0, None, format!("E_SANDBOX: {err}"));
            }
        };
        self.state = RunState::Running;

        // Stderr drains concurrently into the debug log; stdout is the
        // single serially-consumed record channel.
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_session = Arc::clone(session);
        let stderr_sink = Arc::clone(&stderr_tail);
        let stderr_thread = spawn_named_thread("proxy stderr reader", move || {
            for line in stderr.lines() {
                let Ok(line) = line else { break };
                let _ = stderr_session.debug_line(&line);
                let mut tail = stderr_sink.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        let outcome = self.consume_stdout(stdout, session);

        let exit_code = match self.sandbox.wait(self.wall_timeout) {
            Ok(code) => code,
            Err(SandboxError::Timeout(timeout)) => {
                warn!(?timeout, "sandbox wall-clock timeout");
                -1
            }
            Err(err) => {
                warn!(%err, "sandbox wait failed");
                -1
            }
        };
        if stderr_thread.join().is_err() {
            warn!("stderr reader panicked");
        }
        let _ = session.metric(MetricName::AdapterExitCode, exit_code as f64, None, None);
        self.state = RunState::Cleanup;

        self.collect(session, outcome, started, stderr_tail, &emit)
    }

    /// Uploads the artifact set, mirroring each file into the host session
    /// so both session trees carry byte-identical configs.
    fn prepare(
        &mut self,
        manifest: &Manifest,
        manifest_dir: &Path,
        session: &Arc<SessionContext>,
        specs: &ComponentRegistry,
        emit: &impl Fn(EventName, serde_json::Value),
    ) -> Result<(), Status> {
        for step in &manifest.steps {
            let bytes = LocalFile
                .read_bytes(&manifest_dir.join(&step.cfg_path))
                .map_err(|err| {
                    Status::failure(0, Some(step.id.clone()), format!("E_CFG_MISSING: {err}"))
                })?;
            let parsed: serde_json::Value = serde_json::from_slice(&bytes).map_err(|err| {
                Status::failure(0, Some(step.id.clone()), format!("E_CFG_INVALID: {err}"))
            })?;
            if let Ok(spec) = specs.get(step.component_name()) {
                spec.secret_policy().scan(&parsed).map_err(|err| {
                    Status::failure(0, Some(step.id.clone()), format!("{}: {err}", err.code()))
                })?;
            }

            if let Err(err) = session.write_cfg(&step.id, &bytes) {
                return Err(Status::failure(0, Some(step.id.clone()), format!("E_CFG_WRITE: {err}")));
            }
            self.sandbox
                .upload(Path::new(&step.cfg_path), &bytes)
                .map_err(|err| {
                    Status::failure(0, Some(step.id.clone()), format!("E_SANDBOX: {err}"))
                })?;
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
        self.sandbox
            .upload(Path::new("manifest.yaml"), &manifest_bytes)
            .map_err(|err| Status::failure(0, None, format!("E_SANDBOX: {err}")))?;
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

    /// Reads the worker's stdout to EOF, forwarding records 1-for-1 into
    /// the host session.
    fn consume_stdout(
        &mut self,
        stdout: Box<dyn BufRead + Send>,
        session: &Arc<SessionContext>,
    ) -> StreamOutcome {
        let mut outcome = StreamOutcome::default();
        for line in stdout.lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match classify(&line) {
                WorkerLine::Event(record) => {
                    if record.event == EventName::StepFailed {
                        outcome.failed_step = record
                            .fields
                            .get("step_id")
                            .and_then(|v| v.as_str())
                            .and_then(|s| StepId::new(s).ok());
                        outcome.error = record
                            .fields
                            .get("error")
                            .and_then(|v| v.as_str())
                            .map(str::to_string);
                    }
                    if let Err(err) = session.mirror_event(&record) {
                        warn!(%err, "event mirror failed");
                    }
                }
                WorkerLine::Metric(record) => {
                    if record.metric == MetricName::StepDurationMs {
                        outcome.step_millis += record.value;
                    }
                    if let Err(err) = session.mirror_metric(&record) {
                        warn!(%err, "metric mirror failed");
                    }
                }
                WorkerLine::Reply(reply) => {
                    debug!(reply = %reply.reply, ok = reply.ok, "worker reply");
                    if reply.reply == "prepare" {
                        outcome.worker_session = reply.session.clone();
                    }
                    if reply.reply == "exec_step" && reply.ok {
                        outcome.steps_completed += 1;
                    }
                    if !reply.ok && outcome.error.is_none() {
                        outcome.error = reply.error.clone();
                    }
                }
                WorkerLine::Log(log_line) => {
                    let _ = session.debug_line(&log_line);
                }
            }
        }
        outcome
    }

    fn collect(
        &mut self,
        session: &Arc<SessionContext>,
        outcome: StreamOutcome,
        started: Instant,
        stderr_tail: Arc<Mutex<VecDeque<String>>>,
        emit: &impl Fn(EventName, serde_json::Value),
    ) -> Status {
        let emit_metric = |name: MetricName, value: f64, unit: Option<&str>| {
            let _ = session.metric(name, value, unit, None);
        };

        let fetched_status = outcome.worker_session.as_ref().and_then(|worker_session| {
            let path = PathBuf::from(format!("logs/{worker_session}/status.json"));
            match self.sandbox.fetch(&path) {
                Ok(Some(bytes)) => serde_json::from_slice::<Status>(&bytes).ok(),
                Ok(None) => None,
                Err(err) => {
                    warn!(%err, "status fetch failed");
                    None
                }
            }
        });

        if let Some(worker_session) = &outcome.worker_session {
            self.copy_artifacts(session, worker_session, &emit_metric);
        }

        let elapsed = started.elapsed();
        emit_metric(
            MetricName::AdapterExecutionDuration,
            elapsed.as_secs_f64(),
            Some("s"),
        );
        emit_metric(
            MetricName::SandboxOverheadMs,
            (elapsed.as_millis() as f64 - outcome.step_millis).max(0.0),
            Some("ms"),
        );
        emit_metric(MetricName::StepsCompleted, outcome.steps_completed as f64, None);
        emit_metric(
            MetricName::ExecutionDuration,
            elapsed.as_secs_f64(),
            Some("s"),
        );
        emit_metric(
            MetricName::SessionDurationSeconds,
            elapsed.as_secs_f64(),
            Some("s"),
        );

        match fetched_status {
            Some(status) => {
                if status.ok {
                    emit(
                        EventName::RunComplete,
                        json!({"steps_completed": status.steps_completed}),
                    );
                } else {
                    self.state = RunState::Failed;
                }
                status
            }
            None => {
                // The worker never sealed its session: the parity contract
                // is broken and the host supplies the terminal record.
                self.state = RunState::Failed;
                emit(
                    EventName::StatusContractViolation,
                    json!({"worker_session": outcome
                        .worker_session
                        .as_ref()
                        .map(SessionId::as_str)}),
                );
                let tail = stderr_tail
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                let mut status = Status::contract_violation(tail);
                status.steps_completed = outcome.steps_completed;
                status.failed_step = outcome.failed_step.clone();
                status
            }
        }
    }

    /// Copies step artifacts out of the sandbox into the host session.
    fn copy_artifacts(
        &mut self,
        session: &Arc<SessionContext>,
        worker_session: &SessionId,
        emit_metric: &impl Fn(MetricName, f64, Option<&str>),
    ) {
        let copy_started = Instant::now();
        let artifacts_root = PathBuf::from(format!("logs/{worker_session}/artifacts"));
        let files = match self.sandbox.list_files(&artifacts_root) {
            Ok(files) => files,
            Err(err) => {
                warn!(%err, "artifact listing failed");
                return;
            }
        };

        let mut bytes_total = 0u64;
        let mut files_total = 0u64;
        for file in files {
            let Ok(Some(content)) = self.sandbox.fetch(&file) else {
                continue;
            };
            let Ok(relative) = file.strip_prefix(&artifacts_root) else {
                continue;
            };
            let dest = session.root().join("artifacts").join(relative);
            if let Some(parent) = dest.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if std::fs::write(&dest, &content).is_ok() {
                bytes_total += content.len() as u64;
                files_total += 1;
            }
        }
        emit_metric(
            MetricName::ArtifactsCopyMs,
            copy_started.elapsed().as_millis() as f64,
            Some("ms"),
        );
        emit_metric(MetricName::ArtifactsBytesTotal, bytes_total as f64, Some("bytes"));
        emit_metric(MetricName::ArtifactsFilesTotal, files_total as f64, None);
    }
}

#[derive(Default)]
struct StreamOutcome {
    worker_session: Option<SessionId>,
    steps_completed: u32,
    failed_step: Option<StepId>,
    error: Option<String>,
    step_millis: f64,
}

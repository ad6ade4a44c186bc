//! The sandbox-side worker: interprets the command stream, runs drivers
//! through the same step executor as the local adapter, and guarantees a
//! sealed session on every exit path.

use super::protocol::{Command, CommandReply};
use super::step_exec::{execute_step, OutputStore, RecordMirror};
use crate::compile::Manifest;
use crate::components::ComponentRegistry;
use crate::drivers::DriverRegistry;
use crate::oml::StepId;
use crate::secrets::SecretPolicy;
use crate::session::events::{EventName, EventRecord, MetricRecord};
use crate::session::{SealGuard, SessionContext, Status};
use fs::reader::FileReader;
use fs::LocalFile;
use serde_json::json;
use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Prints records to the worker's stdout, the single ordered channel the
/// host mirrors into its own session.
struct StdoutMirror {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl StdoutMirror {
    fn line(&self, line: String) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

impl RecordMirror for StdoutMirror {
    fn event(&self, record: &EventRecord) {
        if let Ok(line) = serde_json::to_string(record) {
            self.line(line);
        }
    }

    fn metric(&self, record: &MetricRecord) {
        if let Ok(line) = serde_json::to_string(record) {
            self.line(line);
        }
    }
}

pub struct WorkerRuntime {
    workdir: PathBuf,
    drivers: DriverRegistry,
    specs: ComponentRegistry,
}

struct RunSession {
    session: Arc<SessionContext>,
    manifest: Manifest,
    store: OutputStore,
    steps_completed: u32,
    failed_step: Option<StepId>,
    error: Option<String>,
}

impl WorkerRuntime {
    pub fn new(workdir: PathBuf, drivers: DriverRegistry, specs: ComponentRegistry) -> Self {
        Self {
            workdir,
            drivers,
            specs,
        }
    }

    /// Consumes the command stream to EOF. Returns the process exit code.
    pub fn run(mut self, commands: impl BufRead, out: Box<dyn Write + Send>) -> i32 {
        let out = Arc::new(Mutex::new(out));
        let mirror = Arc::new(StdoutMirror {
            out: Arc::clone(&out),
        });
        let reply = |reply: CommandReply| {
            if let Ok(line) = serde_json::to_string(&reply) {
                mirror.line(line);
            }
        };

        let mut run: Option<RunSession> = None;
        // Holds the drop-based seal for the lifetime of the run.
        let mut seal_guard: Option<SealGuard> = None;

        for line in commands.lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            let command = match serde_json::from_str::<Command>(&line) {
                Ok(command) => command,
                Err(err) => {
                    warn!(%err, "unparseable command line");
                    reply(CommandReply {
                        reply: "unknown".to_string(),
                        ok: false,
                        step_id: None,
                        session: None,
                        error: Some(format!("unparseable command: {err}")),
                    });
                    continue;
                }
            };

            match command {
                Command::Prepare { install_deps } => {
                    match self.prepare(install_deps, &mirror) {
                        Ok(prepared) => {
                            seal_guard = Some(SealGuard::new(
                                Arc::clone(&prepared.session),
                                Status::failure(0, None, "worker aborted".to_string()),
                            ));
                            reply(CommandReply {
                                reply: "prepare".to_string(),
                                ok: true,
                                step_id: None,
                                session: Some(prepared.session.id().clone()),
                                error: None,
                            });
                            run = Some(prepared);
                        }
                        Err(err) => {
                            error!(%err, "prepare failed");
                            reply(CommandReply {
                                reply: "prepare".to_string(),
                                ok: false,
                                step_id: None,
                                session: None,
                                error: Some(err),
                            });
                            return 4;
                        }
                    }
                }
                Command::ExecStep { step_id, .. } => {
                    let Some(run) = run.as_mut() else {
                        reply(CommandReply {
                            reply: "exec_step".to_string(),
                            ok: false,
                            step_id: Some(step_id),
                            session: None,
                            error: Some("exec_step before prepare".to_string()),
                        });
                        continue;
                    };
                    // A failed step aborts the run; later commands are
                    // acknowledged but not executed.
                    if run.error.is_some() {
                        reply(CommandReply {
                            reply: "exec_step".to_string(),
                            ok: false,
                            step_id: Some(step_id),
                            session: Some(run.session.id().clone()),
                            error: Some("run already failed".to_string()),
                        });
                        continue;
                    }
                    let result = Self::exec_step(run, &step_id, &self.drivers, &self.specs, &mirror);
                    reply(CommandReply {
                        reply: "exec_step".to_string(),
                        ok: result.is_ok(),
                        step_id: Some(step_id),
                        session: Some(run.session.id().clone()),
                        error: result.err(),
                    });
                }
                Command::Cleanup => {
                    reply(CommandReply {
                        reply: "cleanup".to_string(),
                        ok: true,
                        step_id: None,
                        session: run.as_ref().map(|r| r.session.id().clone()),
                        error: None,
                    });
                }
            }
        }

        let Some(run) = run else {
            return 4;
        };
        let status = match &run.error {
            None => Status::success(run.steps_completed),
            Some(error) => {
                Status::failure(run.steps_completed, run.failed_step.clone(), error.clone())
            }
        };
        if let Err(err) = run.session.backfill_metrics_marker() {
            error!(%err, "metrics backfill failed");
        }
        if let Err(err) = run.session.seal(&status) {
            error!(%err, "seal failed");
        }
        drop(seal_guard);
        status.exit_code
    }

    /// Creates the sandbox-side session, materializes the uploaded
    /// artifact set into it and registers drivers.
    fn prepare(
        &mut self,
        install_deps: bool,
        mirror: &Arc<StdoutMirror>,
    ) -> Result<RunSession, String> {
        let session = Arc::new(
            SessionContext::create(&self.workdir.join("logs"))
                .map_err(|err| format!("session create: {err}"))?,
        );
        session
            .event(EventName::SessionInitialized, json!({}))
            .map_err(|err| format!("session init: {err}"))?;

        let manifest_yaml = LocalFile
            .read_to_string(&self.workdir.join("manifest.yaml"))
            .map_err(|err| format!("manifest missing: {err}"))?;
        let manifest =
            Manifest::from_yaml_str(&manifest_yaml).map_err(|err| format!("manifest: {err}"))?;
        session
            .write_manifest(manifest_yaml.as_bytes())
            .map_err(|err| format!("manifest copy: {err}"))?;

        for step in &manifest.steps {
            let bytes = LocalFile
                .read_bytes(&self.workdir.join(&step.cfg_path))
                .map_err(|err| format!("cfg missing for {}: {err}", step.id))?;
            session
                .write_cfg(&step.id, &bytes)
                .map_err(|err| format!("cfg copy: {err}"))?;
        }

        // Driver registration is sandbox-internal bookkeeping; the events
        // stay in the worker session and are not mirrored.
        let components: BTreeSet<&str> = manifest
            .steps
            .iter()
            .map(|step| step.component_name())
            .collect();
        let mut registered = 0usize;
        for component in &components {
            if self.drivers.contains(component) {
                let _ = session.event(
                    EventName::DriverRegistered,
                    json!({"driver": component}),
                );
                registered += 1;
            } else {
                let _ = session.event(
                    EventName::DriverRegistrationFailed,
                    json!({"driver": component, "error": "no driver registered"}),
                );
            }
        }
        let _ = session.event(
            EventName::DriversRegistered,
            json!({"count": registered}),
        );

        if install_deps {
            // Dependencies are compiled into this worker; the check is
            // mirrored so the host can observe it.
            emit_mirrored(
                &session,
                mirror,
                EventName::DependencyCheck,
                json!({"status": "satisfied"}),
            );
        }

        Ok(RunSession {
            session,
            manifest,
            store: OutputStore::default(),
            steps_completed: 0,
            failed_step: None,
            error: None,
        })
    }

    fn exec_step(
        run: &mut RunSession,
        step_id: &StepId,
        drivers: &DriverRegistry,
        specs: &ComponentRegistry,
        mirror: &Arc<StdoutMirror>,
    ) -> Result<(), String> {
        let Some(step) = run.manifest.step(step_id).cloned() else {
            let message = format!("step `{step_id}` is not in the manifest");
            run.error = Some(message.clone());
            run.failed_step = Some(step_id.clone());
            return Err(message);
        };

        let cfg_path = run.session.root().join(&step.cfg_path);
        let cfg: serde_json::Value = match LocalFile
            .read_bytes(&cfg_path)
            .map_err(|err| format!("cfg read: {err}"))
            .and_then(|bytes| {
                serde_json::from_slice(&bytes).map_err(|err| format!("cfg parse: {err}"))
            }) {
            Ok(cfg) => cfg,
            Err(message) => {
                run.error = Some(message.clone());
                run.failed_step = Some(step_id.clone());
                return Err(message);
            }
        };

        let policy = specs
            .get(step.component_name())
            .map(|spec| spec.secret_policy())
            .unwrap_or_else(|_| SecretPolicy::default());

        match execute_step(
            &step,
            &cfg,
            &run.store,
            drivers,
            &run.session,
            &policy,
            Some(mirror.clone() as Arc<dyn RecordMirror>),
        ) {
            Ok(success) => {
                run.store.insert(step.id.clone(), success.outputs);
                run.steps_completed += 1;
                Ok(())
            }
            Err(failure) => {
                run.failed_step = Some(step.id.clone());
                run.error = Some(failure.error.clone());
                Err(failure.error)
            }
        }
    }
}

fn emit_mirrored(
    session: &Arc<SessionContext>,
    mirror: &Arc<StdoutMirror>,
    name: EventName,
    fields: serde_json::Value,
) {
    if let Err(err) = session.event(name, fields.clone()) {
        warn!(%err, "event append failed");
    }
    let fields = match fields {
        serde_json::Value::Object(map) => map,
        other => serde_json::Map::from_iter([("value".to_string(), other)]),
    };
    mirror.event(&EventRecord {
        ts: crate::utils::time::iso_timestamp(),
        session: session.id().clone(),
        event: name,
        fields,
    });
}

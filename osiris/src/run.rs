//! The execution engine: a compiled manifest runs either in-process
//! ([`local`]) or inside an isolated sandbox driven over a line protocol
//! ([`proxy`] on the host, [`worker`] inside the sandbox). Observable
//! behavior is identical across the two adapters.

pub mod local;
pub mod protocol;
pub mod proxy;
pub mod sandbox;
pub mod step_exec;
pub mod worker;

use crate::compile::Manifest;
use crate::components::ComponentRegistry;
use crate::drivers::DriverRegistry;
use crate::oml::StepId;
use crate::session::{SessionContext, SessionError, SessionId, Status};
use fs::reader::{FileReader, ReadError};
use fs::LocalFile;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("manifest not readable: {0}")]
    ManifestRead(#[from] ReadError),
    #[error("manifest not parseable: {0}")]
    ManifestParse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("remote adapter requires a worker program path")]
    WorkerProgramMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Local,
    Remote,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Local => "local",
            AdapterKind::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub session_id: SessionId,
    pub status: Status,
    pub failed_step: Option<StepId>,
}

/// Options for [`run`] beyond the adapter choice.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Path of the worker program, required for the remote adapter.
    pub worker_program: Option<PathBuf>,
    /// Wall-clock bound for the whole sandbox run.
    pub sandbox_timeout: Option<std::time::Duration>,
}

/// Executes the compiled manifest at `manifest_dir` and seals a session
/// under `session_root`. This is the programmatic entry point the CLI
/// wraps.
pub fn run(
    manifest_dir: &Path,
    adapter: AdapterKind,
    session_root: &Path,
    drivers: &DriverRegistry,
    specs: &ComponentRegistry,
    options: RunOptions,
) -> Result<RunResult, RunError> {
    let manifest_yaml = LocalFile.read_to_string(&manifest_dir.join("manifest.yaml"))?;
    let manifest = Manifest::from_yaml_str(&manifest_yaml)?;

    // Validate options before any session directory exists; a session,
    // once created, must always end up sealed.
    if adapter == AdapterKind::Remote && options.worker_program.is_none() {
        return Err(RunError::WorkerProgramMissing);
    }

    let session = Arc::new(SessionContext::create(session_root)?);

    let status = match adapter {
        AdapterKind::Local => {
            local::LocalAdapter::new(drivers).execute(&manifest, manifest_dir, &session, specs)
        }
        AdapterKind::Remote => {
            let worker_program = options
                .worker_program
                .clone()
                .expect("checked above");
            let workdir = session_root.join(format!("sandbox_{}", session.id()));
            match sandbox::ProcessSandbox::new(worker_program, workdir) {
                Ok(sandbox) => proxy::ProxyAdapter::new(sandbox, options.sandbox_timeout)
                    .execute(&manifest, manifest_dir, &session, specs),
                Err(err) => {
                    let status = Status::failure(0, None, format!("E_SANDBOX: {err}"));
                    if let Err(seal_err) = session.seal(&status) {
                        tracing::error!(%seal_err, "sealing failed");
                    }
                    status
                }
            }
        }
    };

    Ok(RunResult {
        session_id: session.id().clone(),
        failed_step: status.failed_step.clone(),
        status,
    })
}

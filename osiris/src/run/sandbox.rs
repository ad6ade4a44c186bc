//! Sandbox abstraction for the remote-proxy adapter.
//!
//! The production implementation runs the worker program as an isolated
//! child process rooted in its own working directory; tests substitute a
//! mock to exercise failure paths the real worker would not produce.

use crate::utils::threads::spawn_named_thread;
use fs::dirs::{DirectoryManager, DirectoryManagerFs};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Dir(#[from] fs::dirs::DirError),
    #[error("worker did not start: {0}")]
    Spawn(String),
    #[error("sandbox wall-clock timeout after {0:?}")]
    Timeout(Duration),
    #[error("worker is not running")]
    NotStarted,
}

/// Line streams of a started worker. Stdout is the ordered record channel;
/// stderr carries diagnostics for the debug log.
pub struct WorkerStreams {
    pub stdout: Box<dyn BufRead + Send>,
    pub stderr: Box<dyn BufRead + Send>,
}

pub trait Sandbox {
    /// Places a file inside the sandbox at a path relative to its root.
    fn upload(&mut self, dest: &Path, content: &[u8]) -> Result<(), SandboxError>;

    /// Starts the worker program, feeding it the full command stream on
    /// stdin.
    fn start_worker(&mut self, commands: &[u8]) -> Result<WorkerStreams, SandboxError>;

    /// Waits for the worker to exit within the wall-clock bound; a timeout
    /// kills it.
    fn wait(&mut self, timeout: Duration) -> Result<i32, SandboxError>;

    /// Reads a file from the sandbox, `None` if absent.
    fn fetch(&self, path: &Path) -> Result<Option<Vec<u8>>, SandboxError>;

    /// Recursively lists files under a sandbox directory, paths relative
    /// to the sandbox root.
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, SandboxError>;
}

#[cfg(test)]
mockall::mock! {
    pub Sandbox {}

    impl Sandbox for Sandbox {
        fn upload(&mut self, dest: &Path, content: &[u8]) -> Result<(), SandboxError>;
        fn start_worker(&mut self, commands: &[u8]) -> Result<WorkerStreams, SandboxError>;
        fn wait(&mut self, timeout: Duration) -> Result<i32, SandboxError>;
        fn fetch(&self, path: &Path) -> Result<Option<Vec<u8>>, SandboxError>;
        fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, SandboxError>;
    }
}

/// Runs the worker program as a child process inside an isolated working
/// directory.
pub struct ProcessSandbox {
    worker_program: PathBuf,
    workdir: PathBuf,
    child: Option<Child>,
}

impl ProcessSandbox {
    pub fn new(worker_program: PathBuf, workdir: PathBuf) -> Result<Self, SandboxError> {
        DirectoryManagerFs.create(&workdir)?;
        Ok(Self {
            worker_program,
            workdir,
            child: None,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

impl Sandbox for ProcessSandbox {
    fn upload(&mut self, dest: &Path, content: &[u8]) -> Result<(), SandboxError> {
        let path = self.workdir.join(dest);
        if let Some(parent) = path.parent() {
            DirectoryManagerFs.create(parent)?;
        }
        std::fs::write(&path, content)?;
        debug!(dest = %dest.display(), bytes = content.len(), "uploaded to sandbox");
        Ok(())
    }

    fn start_worker(&mut self, commands: &[u8]) -> Result<WorkerStreams, SandboxError> {
        let mut child = Command::new(&self.worker_program)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SandboxError::Spawn(err.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("no stderr pipe".to_string()))?;

        // Feed the whole command stream off-thread so a worker that reads
        // slowly cannot deadlock against our stdout reads.
        let commands = commands.to_vec();
        spawn_named_thread("sandbox command feeder", move || {
            if let Err(err) = stdin.write_all(&commands) {
                warn!(%err, "command feed interrupted");
            }
            // Dropping stdin signals end of commands.
        });

        self.child = Some(child);
        Ok(WorkerStreams {
            stdout: Box::new(BufReader::new(stdout)),
            stderr: Box::new(BufReader::new(stderr)),
        })
    }

    fn wait(&mut self, timeout: Duration) -> Result<i32, SandboxError> {
        let child = self.child.as_mut().ok_or(SandboxError::NotStarted)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status.code().unwrap_or(-1));
            }
            if Instant::now() >= deadline {
                child.kill()?;
                let _ = child.wait();
                return Err(SandboxError::Timeout(timeout));
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn fetch(&self, path: &Path) -> Result<Option<Vec<u8>>, SandboxError> {
        let path = self.workdir.join(path);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, SandboxError> {
        let root = self.workdir.join(dir);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.workdir) {
                    files.push(relative.to_path_buf());
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

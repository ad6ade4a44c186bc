use super::events::{EventName, EventRecord, MetricName, MetricRecord};
use super::id::SessionId;
use super::masking::{mask_known_fields, Scrubber};
use super::status::Status;
use crate::oml::StepId;
use crate::secrets::{SecretError, SecretPolicy};
use crate::utils::time;
use fs::dirs::{DirError, DirectoryManager, DirectoryManagerFs};
use fs::writer::{FileWriter, WriteError};
use fs::LocalFile;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Dir(#[from] DirError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("record serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Secret(#[from] SecretError),
}

struct SessionFiles {
    events: File,
    metrics: File,
    human: File,
    debug: File,
}

/// Per-run scoped facility issuing events, metrics and artifact paths.
///
/// Every record is masked and scrubbed before it reaches disk, appended as
/// one newline-terminated line. `status.json` is written exactly once.
pub struct SessionContext {
    id: SessionId,
    root: PathBuf,
    files: Mutex<SessionFiles>,
    scrubber: Mutex<Scrubber>,
    sealed: Mutex<bool>,
}

fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    // A poisoned session lock must not prevent sealing.
    result.unwrap_or_else(PoisonError::into_inner)
}

impl SessionContext {
    /// Creates `<session_root>/<run_id>/` with its file set and `cfg/` and
    /// `artifacts/` subtrees.
    pub fn create(session_root: &Path) -> Result<Self, SessionError> {
        Self::create_with_id(session_root, SessionId::new_now())
    }

    pub fn create_with_id(session_root: &Path, id: SessionId) -> Result<Self, SessionError> {
        let root = session_root.join(id.as_str());
        let dirs = DirectoryManagerFs;
        dirs.create(&root.join("cfg"))?;
        dirs.create(&root.join("artifacts"))?;

        let open_append = |name: &str| -> Result<File, std::io::Error> {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(root.join(name))
        };
        let files = SessionFiles {
            events: open_append("events.jsonl")?,
            metrics: open_append("metrics.jsonl")?,
            human: open_append("osiris.log")?,
            debug: open_append("debug.log")?,
        };

        Ok(Self {
            id,
            root,
            files: Mutex::new(files),
            scrubber: Mutex::new(Scrubber::default()),
            sealed: Mutex::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a sensitive value; any later record containing it is
    /// rewritten before hitting disk.
    pub fn register_sensitive(&self, value: String) {
        relock(self.scrubber.lock()).register(value);
    }

    /// Emits a run-scoped event under the global masking policy.
    pub fn event(&self, name: EventName, fields: serde_json::Value) -> Result<(), SessionError> {
        self.event_with_policy(name, fields, None)
    }

    /// Emits a step-scoped event, additionally masked by the governing
    /// component's secret policy.
    pub fn event_with_policy(
        &self,
        name: EventName,
        mut fields: serde_json::Value,
        policy: Option<&SecretPolicy>,
    ) -> Result<(), SessionError> {
        if let Some(policy) = policy {
            policy.apply(&mut fields)?;
        }
        mask_known_fields(&mut fields);
        let fields = match fields {
            serde_json::Value::Object(map) => map,
            other => serde_json::Map::from_iter([("value".to_string(), other)]),
        };

        let record = EventRecord {
            ts: time::iso_timestamp(),
            session: self.id.clone(),
            event: name,
            fields,
        };
        self.append_event(&record)
    }

    /// Re-emits an event received from a worker, re-stamped with this
    /// session's identity and clock.
    pub fn mirror_event(&self, incoming: &EventRecord) -> Result<(), SessionError> {
        let record = EventRecord {
            ts: time::iso_timestamp(),
            session: self.id.clone(),
            event: incoming.event,
            fields: incoming.fields.clone(),
        };
        self.append_event(&record)
    }

    fn append_event(&self, record: &EventRecord) -> Result<(), SessionError> {
        let line = serde_json::to_string(record)?;
        let line = relock(self.scrubber.lock()).scrub(&line);
        let mut files = relock(self.files.lock());
        writeln!(files.events, "{line}")?;

        let level = if record.event == EventName::StepFailed {
            "ERROR"
        } else {
            "INFO"
        };
        let human_fields = relock(self.scrubber.lock())
            .scrub(&serde_json::to_string(&record.fields)?);
        writeln!(
            files.human,
            "{} {} {} {}",
            record.ts, level, record.event, human_fields
        )?;
        Ok(())
    }

    pub fn metric(
        &self,
        name: MetricName,
        value: f64,
        unit: Option<&str>,
        mut tags: Option<serde_json::Value>,
    ) -> Result<(), SessionError> {
        if let Some(tags) = tags.as_mut() {
            mask_known_fields(tags);
        }
        let record = MetricRecord {
            ts: time::iso_timestamp(),
            session: self.id.clone(),
            metric: name,
            value,
            unit: unit.map(str::to_string),
            tags,
        };
        self.append_metric(&record)
    }

    pub fn mirror_metric(&self, incoming: &MetricRecord) -> Result<(), SessionError> {
        let record = MetricRecord {
            ts: time::iso_timestamp(),
            session: self.id.clone(),
            ..incoming.clone()
        };
        self.append_metric(&record)
    }

    fn append_metric(&self, record: &MetricRecord) -> Result<(), SessionError> {
        let line = serde_json::to_string(record)?;
        let line = relock(self.scrubber.lock()).scrub(&line);
        let mut files = relock(self.files.lock());
        writeln!(files.metrics, "{line}")?;
        Ok(())
    }

    /// Verbatim line into `debug.log` (worker stderr, wire noise).
    pub fn debug_line(&self, line: &str) -> Result<(), SessionError> {
        let line = relock(self.scrubber.lock()).scrub(line);
        let mut files = relock(self.files.lock());
        writeln!(files.debug, "{line}")?;
        Ok(())
    }

    /// Copies a per-step configuration into the session. The caller has
    /// already scanned it for leaks.
    pub fn write_cfg(&self, step_id: &StepId, content: &[u8]) -> Result<PathBuf, SessionError> {
        let path = self.root.join(format!("cfg/{step_id}.json"));
        LocalFile.write(&path, content)?;
        Ok(path)
    }

    pub fn write_manifest(&self, content: &[u8]) -> Result<PathBuf, SessionError> {
        let path = self.root.join("manifest.yaml");
        LocalFile.write(&path, content)?;
        Ok(path)
    }

    /// The step's artifacts directory, created on first use. Returns
    /// whether this call created it; the step scope owns the
    /// `artifacts_dir_created` event so it reaches every record channel.
    pub fn ensure_artifacts_dir(&self, step_id: &StepId) -> Result<(PathBuf, bool), SessionError> {
        let path = self.root.join("artifacts").join(step_id.as_str());
        if path.exists() {
            return Ok((path, false));
        }
        DirectoryManagerFs.create(&path)?;
        Ok((path, true))
    }

    pub fn is_sealed(&self) -> bool {
        *relock(self.sealed.lock())
    }

    /// Writes `status.json` and flushes the logs. Exactly one seal takes
    /// effect; later calls are ignored.
    pub fn seal(&self, status: &Status) -> Result<(), SessionError> {
        let mut sealed = relock(self.sealed.lock());
        if *sealed {
            warn!(session = %self.id, "session already sealed");
            return Ok(());
        }
        let content = serde_json::to_vec(status)?;
        LocalFile.atomic_write(&self.root.join("status.json"), &content)?;
        let mut files = relock(self.files.lock());
        files.events.flush()?;
        files.metrics.flush()?;
        files.human.flush()?;
        files.debug.flush()?;
        *sealed = true;
        Ok(())
    }

    /// Guarantees `metrics.jsonl` is non-empty, backfilling the
    /// `session_initialized` marker record. Part of the worker's sealing
    /// duties.
    pub fn backfill_metrics_marker(&self) -> Result<(), SessionError> {
        let path = self.root.join("metrics.jsonl");
        let empty = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            let line = serde_json::to_string(&json!({
                "ts": time::iso_timestamp(),
                "session": self.id.as_str(),
                "metric": "session_initialized",
                "value": 1,
            }))?;
            let mut files = relock(self.files.lock());
            writeln!(files.metrics, "{line}")?;
        }
        Ok(())
    }
}

/// Seals the session with a failure status on any exit path that did not
/// seal explicitly. The finally-block of a run.
pub struct SealGuard {
    session: Arc<SessionContext>,
    fallback: Status,
}

impl SealGuard {
    pub fn new(session: Arc<SessionContext>, fallback: Status) -> Self {
        Self { session, fallback }
    }
}

impl Drop for SealGuard {
    fn drop(&mut self) {
        if !self.session.is_sealed() {
            if let Err(err) = self.session.seal(&self.fallback) {
                error!(session = %self.session.id(), %err, "failed to seal session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{RedactionPolicy, SecretPath};

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn creates_the_mandated_directory_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionContext::create(tmp.path()).unwrap();

        assert!(session.root().join("events.jsonl").is_file());
        assert!(session.root().join("metrics.jsonl").is_file());
        assert!(session.root().join("osiris.log").is_file());
        assert!(session.root().join("debug.log").is_file());
        assert!(session.root().join("cfg").is_dir());
        assert!(session.root().join("artifacts").is_dir());
    }

    #[test]
    fn events_and_metrics_append_one_record_per_line() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionContext::create(tmp.path()).unwrap();

        session
            .event(EventName::RunStart, json!({"pipeline": "users-to-csv"}))
            .unwrap();
        session
            .metric(MetricName::RowsRead, 3.0, None, None)
            .unwrap();
        session.seal(&Status::success(0)).unwrap();

        let events = read_lines(&session.root().join("events.jsonl"));
        assert_eq!(1, events.len());
        assert_eq!("run_start", events[0]["event"]);
        assert_eq!(session.id().as_str(), events[0]["session"]);

        let metrics = read_lines(&session.root().join("metrics.jsonl"));
        assert_eq!(3.0, metrics[0]["value"]);
    }

    #[test]
    fn registered_sensitive_values_never_reach_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionContext::create(tmp.path()).unwrap();
        session.register_sensitive("secret123".to_string());

        session
            .event(
                EventName::StepFailed,
                json!({"error": "auth failed with secret123"}),
            )
            .unwrap();
        session.seal(&Status::success(0)).unwrap();

        for file in ["events.jsonl", "osiris.log"] {
            let content = std::fs::read_to_string(session.root().join(file)).unwrap();
            assert!(!content.contains("secret123"), "{file}: {content}");
        }
    }

    #[test]
    fn component_policy_masks_step_scoped_events() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionContext::create(tmp.path()).unwrap();
        let policy = SecretPolicy::new(
            vec![SecretPath::parse("config/resolved_connection/password").unwrap()],
            RedactionPolicy::default(),
        );

        session
            .event_with_policy(
                EventName::StepStart,
                json!({"config": {"resolved_connection": {"password": "hunter2"}}}),
                Some(&policy),
            )
            .unwrap();
        session.seal(&Status::success(0)).unwrap();

        let events = read_lines(&session.root().join("events.jsonl"));
        assert_eq!("***", events[0]["config"]["resolved_connection"]["password"]);
    }

    #[test]
    fn seal_takes_effect_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionContext::create(tmp.path()).unwrap();

        session.seal(&Status::success(2)).unwrap();
        session
            .seal(&Status::failure(0, None, "late".to_string()))
            .unwrap();

        let status: Status =
            serde_json::from_slice(&std::fs::read(session.root().join("status.json")).unwrap())
                .unwrap();
        assert!(status.ok);
        assert_eq!(2, status.steps_completed);
    }

    #[test]
    fn seal_guard_seals_on_drop_unless_already_sealed() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionContext::create(tmp.path()).unwrap());
        {
            let _guard = SealGuard::new(
                Arc::clone(&session),
                Status::failure(0, None, "aborted".to_string()),
            );
        }
        assert!(session.is_sealed());
        let status: Status =
            serde_json::from_slice(&std::fs::read(session.root().join("status.json")).unwrap())
                .unwrap();
        assert_eq!(Some("aborted".to_string()), status.error);
    }

    #[test]
    fn artifacts_dir_reports_creation_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionContext::create(tmp.path()).unwrap();
        let step = StepId::new("extract-users").unwrap();

        let (first, created_first) = session.ensure_artifacts_dir(&step).unwrap();
        let (second, created_second) = session.ensure_artifacts_dir(&step).unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert!(created_first);
        assert!(!created_second);
    }

    #[test]
    fn empty_metrics_log_is_backfilled_with_the_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionContext::create(tmp.path()).unwrap();
        session.backfill_metrics_marker().unwrap();
        session.backfill_metrics_marker().unwrap();
        session.seal(&Status::success(0)).unwrap();

        let metrics = read_lines(&session.root().join("metrics.jsonl"));
        assert_eq!(1, metrics.len());
        assert_eq!("session_initialized", metrics[0]["metric"]);
    }
}

//! End-to-end scenarios: compile determinism, local execution, failure
//! sealing, and behavioral parity between the local and remote-proxy
//! adapters.

mod common;

use common::*;
use osiris::components::ComponentRegistry;
use osiris::run::{run, AdapterKind, RunOptions};
use osiris::session::Status;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn worker_program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_osiris-worker"))
}

fn specs() -> ComponentRegistry {
    ComponentRegistry::with_defaults().unwrap()
}

fn read_status(session_root: &Path) -> Status {
    serde_json::from_slice(&std::fs::read(session_root.join("status.json")).unwrap()).unwrap()
}

fn session_dir(session_root: &Path, id: &osiris::session::SessionId) -> PathBuf {
    session_root.join(id.as_str())
}

#[test]
fn minimal_read_write_pipeline_runs_locally() {
    std::env::set_var("E2E_MYSQL_OK", "secret123");
    let tmp = tempfile::tempdir().unwrap();
    let build = tmp.path().join("build");
    compile_and_emit(MYSQL_OML, &mysql_catalog("E2E_MYSQL_OK"), &build);

    // The compiled config carries the env-variable name, never the value.
    let cfg = std::fs::read_to_string(build.join("cfg/extract-users.json")).unwrap();
    assert!(cfg.contains("${E2E_MYSQL_OK}"), "{cfg}");
    assert!(!cfg.contains("secret123"), "{cfg}");

    let drivers = drivers_with_mysql_fixture();
    let result = run(
        &build,
        AdapterKind::Local,
        &tmp.path().join("logs"),
        &drivers,
        &specs(),
        RunOptions::default(),
    )
    .unwrap();

    assert!(result.status.ok);
    assert_eq!(2, result.status.steps_completed);
    assert_eq!(0, result.status.exit_code);

    let session = session_dir(&tmp.path().join("logs"), &result.session_id);
    assert!(session.join("artifacts/write-users-csv/users.csv").is_file());
    assert_eq!(3.0, metric_total(&session, "rows_read"));
    assert_eq!(3.0, metric_total(&session, "rows_written"));

    let events = event_multiset(&session);
    assert_eq!(Some(&1), events.get("run_start"));
    assert_eq!(Some(&2), events.get("cfg_materialized"));
    assert_eq!(Some(&1), events.get("manifest_materialized"));
    assert_eq!(Some(&2), events.get("step_start"));
    assert_eq!(Some(&2), events.get("step_complete"));
    assert_eq!(Some(&1), events.get("run_complete"));
}

#[test]
fn forbidden_top_level_key_fails_compilation_without_artifacts() {
    let oml = r#"
oml_version: "0.1.0"
name: legacy
version: "1"
steps:
  - id: a
    component: mysql.extractor
    mode: read
    config: {query: SELECT 1}
"#;
    let err = compile_oml(oml, MYSQL_CATALOG).unwrap_err();
    assert_eq!("E_OML_INVALID", err.code());
    assert!(err
        .violations()
        .iter()
        .any(|v| v.code == "OML_FORBIDDEN_KEY" && v.path == "/version"));
}

#[test]
fn dependency_cycle_is_a_compile_diagnostic() {
    let oml = r#"
oml_version: "0.1.0"
name: cyclic
steps:
  - id: a
    component: mysql.extractor
    mode: read
    config: {query: SELECT 1}
    needs: [b]
  - id: b
    component: mysql.extractor
    mode: read
    config: {query: SELECT 2}
    needs: [a]
"#;
    let err = compile_oml(oml, MYSQL_CATALOG).unwrap_err();
    assert!(err.violations().iter().any(|v| v.code == "OML_DEP_CYCLE"));
}

#[test]
fn missing_env_variable_fails_the_step_and_seals_the_session() {
    std::env::remove_var("E2E_MYSQL_MISSING");
    let tmp = tempfile::tempdir().unwrap();
    let build = tmp.path().join("build");
    compile_and_emit(MYSQL_OML, &mysql_catalog("E2E_MYSQL_MISSING"), &build);

    let drivers = drivers_with_mysql_fixture();
    let result = run(
        &build,
        AdapterKind::Local,
        &tmp.path().join("logs"),
        &drivers,
        &specs(),
        RunOptions::default(),
    )
    .unwrap();

    assert!(!result.status.ok);
    assert_eq!(4, result.status.exit_code);
    assert_eq!(
        "extract-users",
        result.status.failed_step.as_ref().unwrap().as_str()
    );
    assert!(result.status.error.as_ref().unwrap().contains("E_ENV_MISSING"));

    let session = session_dir(&tmp.path().join("logs"), &result.session_id);
    assert_eq!(result.status, read_status(&session));
    assert!(event_multiset(&session).contains_key("step_failed"));

    let artifacts = session.join("artifacts/extract-users");
    assert!(artifacts.is_dir());
    assert_eq!(0, std::fs::read_dir(&artifacts).unwrap().count());
}

#[test]
fn local_and_remote_adapters_have_behavioral_parity() {
    let tmp = tempfile::tempdir().unwrap();

    // Absolute seed path so both the host process and the sandboxed
    // worker read the same file.
    let seed = tmp.path().join("seed.csv");
    std::fs::write(&seed, "id,name\n1,ada\n2,grace\n3,edsger\n").unwrap();
    let oml = CSV_OML_TEMPLATE.replace("__SEED__", &seed.display().to_string());

    let build = tmp.path().join("build");
    compile_and_emit(&oml, MYSQL_CATALOG, &build);

    let drivers = osiris::drivers::default_driver_registry();

    let local_root = tmp.path().join("logs-local");
    let local = run(
        &build,
        AdapterKind::Local,
        &local_root,
        &drivers,
        &specs(),
        RunOptions::default(),
    )
    .unwrap();
    assert!(local.status.ok, "{:?}", local.status);

    let remote_root = tmp.path().join("logs-remote");
    let remote = run(
        &build,
        AdapterKind::Remote,
        &remote_root,
        &drivers,
        &specs(),
        RunOptions {
            worker_program: Some(worker_program()),
            sandbox_timeout: Some(Duration::from_secs(60)),
        },
    )
    .unwrap();
    assert!(remote.status.ok, "{:?}", remote.status);

    let local_session = session_dir(&local_root, &local.session_id);
    let remote_session = session_dir(&remote_root, &remote.session_id);

    // Byte-identical configuration files across adapters.
    for cfg in ["cfg/extract-seed.json", "cfg/write-seed.json"] {
        assert_eq!(
            std::fs::read(local_session.join(cfg)).unwrap(),
            std::fs::read(remote_session.join(cfg)).unwrap(),
            "{cfg} differs across adapters"
        );
        assert_eq!(
            std::fs::read(build.join(cfg)).unwrap(),
            std::fs::read(local_session.join(cfg)).unwrap(),
            "{cfg} differs from the compiled artifact"
        );
    }

    // Same event-name multiset, dependency events excluded.
    let filter_deps = |mut counts: std::collections::BTreeMap<String, usize>| {
        counts.retain(|name, _| !name.starts_with("dependency_"));
        counts
    };
    assert_eq!(
        filter_deps(event_multiset(&local_session)),
        filter_deps(event_multiset(&remote_session))
    );

    // Same data-flow totals.
    assert_eq!(
        metric_total(&local_session, "rows_read"),
        metric_total(&remote_session, "rows_read")
    );
    assert_eq!(
        metric_total(&local_session, "rows_written"),
        metric_total(&remote_session, "rows_written")
    );
    assert_eq!(3.0, metric_total(&remote_session, "rows_read"));

    // Both sessions sealed ok, same artifact produced.
    assert!(read_status(&local_session).ok);
    assert!(read_status(&remote_session).ok);
    assert!(local_session.join("artifacts/write-seed/seed-out.csv").is_file());
    assert!(remote_session.join("artifacts/write-seed/seed-out.csv").is_file());
}

#[test]
fn sensitive_env_values_never_reach_any_session_file() {
    std::env::set_var("E2E_SENTINEL_PASSWORD", "sentinel-9f8e7d6c");
    let tmp = tempfile::tempdir().unwrap();
    let build = tmp.path().join("build");
    compile_and_emit(MYSQL_OML, &mysql_catalog("E2E_SENTINEL_PASSWORD"), &build);

    let drivers = drivers_with_mysql_fixture();
    let result = run(
        &build,
        AdapterKind::Local,
        &tmp.path().join("logs"),
        &drivers,
        &specs(),
        RunOptions::default(),
    )
    .unwrap();
    assert!(result.status.ok);

    let session = session_dir(&tmp.path().join("logs"), &result.session_id);
    let mut stack = vec![session];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let content = String::from_utf8_lossy(&std::fs::read(&path).unwrap()).to_string();
                assert!(
                    !content.contains("sentinel-9f8e7d6c"),
                    "{} contains the sentinel",
                    path.display()
                );
            }
        }
    }
}

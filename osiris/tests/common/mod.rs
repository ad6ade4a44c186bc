//! Shared fixtures for the end-to-end scenario tests.
// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use osiris::compile::{compile, emit, CompileRequest, CompileResult};
use osiris::components::ComponentRegistry;
use osiris::connections::ConnectionCatalog;
use osiris::drivers::{
    default_driver_registry, DriverError, DriverRegistry, SqlClient, SqlExtractor, Table,
};
use osiris::oml::OmlDocument;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

pub const MYSQL_OML: &str = r#"
oml_version: "0.1.0"
name: users-to-csv
steps:
  - id: extract-users
    component: mysql.extractor
    mode: read
    config:
      query: SELECT id FROM t
      connection: "@mysql.default"
  - id: write-users-csv
    component: filesystem.csv_writer
    mode: write
    config:
      path: users.csv
    inputs:
      df:
        from_step: extract-users
        key: df
"#;

pub const MYSQL_CATALOG: &str = r#"
mysql:
  default:
    host: db.internal
    port: 3306
    user: reader
    password: "${MYSQL_PASSWORD}"
"#;

/// Same catalog with a caller-chosen variable name, so concurrent tests
/// never race on one process-wide environment variable.
pub fn mysql_catalog(var: &str) -> String {
    MYSQL_CATALOG.replace("MYSQL_PASSWORD", var)
}

/// A file-based pipeline both adapters can execute with the built-in
/// drivers. The seed path is substituted before compilation.
pub const CSV_OML_TEMPLATE: &str = r#"
oml_version: "0.1.0"
name: seed-to-csv
steps:
  - id: extract-seed
    component: filesystem.csv_extractor
    mode: read
    config:
      path: "__SEED__"
  - id: write-seed
    component: filesystem.csv_writer
    mode: write
    config:
      path: seed-out.csv
    inputs:
      df:
        from_step: extract-seed
        key: df
"#;

pub fn compile_oml(oml_yaml: &str, catalog_yaml: &str) -> Result<CompileResult, osiris::compile::CompileError> {
    let oml = OmlDocument::parse(oml_yaml).expect("fixture OML parses");
    let registry = ComponentRegistry::with_defaults().expect("default registry loads");
    let catalog = ConnectionCatalog::from_yaml_str(catalog_yaml).expect("fixture catalog loads");
    compile(CompileRequest {
        oml: &oml,
        registry: &registry,
        catalog: &catalog,
        profile: "dev",
        params: &json!({}),
    })
}

pub fn compile_and_emit(oml_yaml: &str, catalog_yaml: &str, out: &Path) -> CompileResult {
    let result = compile_oml(oml_yaml, catalog_yaml).expect("fixture compiles");
    emit(&result, out).expect("emission succeeds");
    result
}

/// The spec's "test fixture returning 3 rows".
pub struct ThreeRowClient;

impl SqlClient for ThreeRowClient {
    fn query(&self, _connection: &serde_json::Value, _query: &str) -> Result<Table, DriverError> {
        Ok(Table {
            columns: vec!["id".into()],
            rows: vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]],
        })
    }
}

pub fn drivers_with_mysql_fixture() -> DriverRegistry {
    let mut drivers = default_driver_registry();
    drivers.register("mysql.extractor", || {
        Box::new(SqlExtractor::new(ThreeRowClient))
    });
    drivers
}

/// Event-name multiset of a session's `events.jsonl`.
pub fn event_multiset(session_root: &Path) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    let content = std::fs::read_to_string(session_root.join("events.jsonl")).unwrap();
    for line in content.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        *counts
            .entry(value["event"].as_str().unwrap().to_string())
            .or_insert(0) += 1;
    }
    counts
}

/// Sum of one metric's values over `metrics.jsonl`.
pub fn metric_total(session_root: &Path, metric: &str) -> f64 {
    let content = std::fs::read_to_string(session_root.join("metrics.jsonl")).unwrap();
    content
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter(|value| value["metric"] == metric)
        .filter_map(|value| value["value"].as_f64())
        .sum()
}

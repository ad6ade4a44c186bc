//! File-based reference drivers: a tabular CSV extractor and a CSV writer.

use super::contract::{Driver, DriverError, Inputs, Outputs, StepContext, StepValue, Table};
use crate::oml::StepId;
use crate::session::events::{EventName, MetricName};
use serde_json::json;
use std::path::{Path, PathBuf};

fn config_str<'c>(config: &'c serde_json::Value, key: &str) -> Result<&'c str, DriverError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DriverError::Config(format!("`{key}` must be a string")))
}

fn delimiter(config: &serde_json::Value) -> Result<u8, DriverError> {
    match config.get("delimiter") {
        None => Ok(b','),
        Some(v) => {
            let raw = v
                .as_str()
                .filter(|s| s.len() == 1)
                .ok_or_else(|| DriverError::Config("`delimiter` must be one character".into()))?;
            Ok(raw.as_bytes()[0])
        }
    }
}

fn has_header(config: &serde_json::Value) -> bool {
    config
        .get("header")
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

/// Reads a CSV file into a [`Table`] and exposes it under the `df` output
/// key.
#[derive(Debug, Default)]
pub struct CsvExtractor;

impl Driver for CsvExtractor {
    fn run(
        &self,
        _step_id: &StepId,
        config: &serde_json::Value,
        _inputs: &Inputs,
        ctx: &dyn StepContext,
    ) -> Result<Outputs, DriverError> {
        let path = PathBuf::from(config_str(config, "path")?);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter(config)?)
            .has_headers(has_header(config))
            .from_path(&path)?;

        let columns = if has_header(config) {
            reader
                .headers()?
                .iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        let mut table = Table::new(columns);
        for record in reader.records() {
            let record = record?;
            table
                .rows
                .push(record.iter().map(|field| json!(field)).collect());
        }

        ctx.log_metric(MetricName::RowsRead, table.row_count() as f64, None, None);
        Ok(Outputs::from([(
            "df".to_string(),
            StepValue::Table(table),
        )]))
    }
}

/// Writes the `df` input to a CSV file, relative paths landing in the
/// step's artifacts directory.
#[derive(Debug, Default)]
pub struct CsvWriter;

impl Driver for CsvWriter {
    fn run(
        &self,
        _step_id: &StepId,
        config: &serde_json::Value,
        inputs: &Inputs,
        ctx: &dyn StepContext,
    ) -> Result<Outputs, DriverError> {
        let table = inputs
            .get("df")
            .ok_or_else(|| DriverError::InputMissing("df".to_string()))?
            .as_table()
            .ok_or_else(|| DriverError::InputType {
                key: "df".to_string(),
                expected: "tabular value".to_string(),
            })?;

        let configured = Path::new(config_str(config, "path")?);
        let path = if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            ctx.artifacts_dir().join(configured)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter(config)?)
            .from_path(&path)?;
        if has_header(config) && !table.columns.is_empty() {
            writer.write_record(&table.columns)?;
        }
        for row in &table.rows {
            writer.write_record(row.iter().map(render_field))?;
        }
        writer.flush().map_err(DriverError::Io)?;

        let size = std::fs::metadata(&path)?.len();
        ctx.log_event(
            EventName::ArtifactCreated,
            json!({"path": path.display().to_string(), "size": size}),
        );
        ctx.log_metric(MetricName::RowsWritten, table.row_count() as f64, None, None);
        Ok(Outputs::new())
    }
}

/// CSV cells are plain text; scalars render without JSON quoting.
fn render_field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

//! SQL extraction over a pluggable client seam.
//!
//! Database clients live outside the core; the engine only needs a way to
//! turn (connection, query) into a [`Table`]. Products register
//! `mysql.extractor` (or siblings) with their client implementation.

use super::contract::{Driver, DriverError, Inputs, Outputs, StepContext, StepValue, Table};
use crate::oml::StepId;
use crate::session::events::MetricName;

/// Executes a query against a resolved connection.
///
/// `connection` is the step's `resolved_connection` mapping with
/// environment substitution already applied by the engine.
#[cfg_attr(test, mockall::automock)]
pub trait SqlClient: Send + Sync {
    fn query(
        &self,
        connection: &serde_json::Value,
        query: &str,
    ) -> Result<Table, DriverError>;
}

/// Tabular extractor generic over the client that reaches the database.
pub struct SqlExtractor<C> {
    client: C,
}

impl<C: SqlClient> SqlExtractor<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C: SqlClient> Driver for SqlExtractor<C> {
    fn run(
        &self,
        _step_id: &StepId,
        config: &serde_json::Value,
        _inputs: &Inputs,
        ctx: &dyn StepContext,
    ) -> Result<Outputs, DriverError> {
        let query = config
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DriverError::Config("`query` must be a string".to_string()))?;
        let connection = config
            .get("resolved_connection")
            .ok_or_else(|| DriverError::Config("missing `resolved_connection`".to_string()))?;

        let table = self.client.query(connection, query)?;

        ctx.log_metric(MetricName::RowsRead, table.row_count() as f64, None, None);
        Ok(Outputs::from([(
            "df".to_string(),
            StepValue::Table(table),
        )]))
    }
}

//! SQL queries against SQLite databases through `sqlx`
//!
//! ```json
//! { "sql": { "url": "sqlite:///var/lib/inventory.db" } }
//! ```
//!
//! One connection pool is kept per database URL. Every cell is rendered as text,
//! NULL as an empty cell.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Pool, Row, Sqlite};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

use crate::config::HostConfiguration;
use crate::connector::{Criterion, CriterionType, Source, SourceKind, SourceType};
use crate::error::{EngineError, EngineResult};
use crate::table::SourceTable;

use super::{CriterionTestResult, ProtocolExtension};

const PROTOCOL: &str = "sql";

#[derive(Debug, Clone, Deserialize)]
struct SqlConfiguration {
    url: String,
}

impl SqlConfiguration {
    fn from_host(host: &HostConfiguration) -> EngineResult<Self> {
        let value = host
            .protocol(PROTOCOL)
            .ok_or_else(|| EngineError::MissingConfiguration(PROTOCOL.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[derive(Debug, Default)]
pub struct SqlExtension {
    pools: Mutex<HashMap<String, Pool<Sqlite>>>,
}

impl SqlExtension {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pool(&self, url: &str) -> EngineResult<Pool<Sqlite>> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(url) {
            return Ok(pool.clone());
        }

        debug!("opening SQLite pool for {url}");
        let options: SqliteConnectOptions = url.parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options.read_only(true))
            .await?;
        pools.insert(url.to_string(), pool.clone());
        Ok(pool)
    }

    async fn query(&self, query: &str, host: &HostConfiguration) -> EngineResult<SourceTable> {
        let config = SqlConfiguration::from_host(host)?;
        let pool = self.pool(&config.url).await?;
        trace!("running {query}");

        let rows = sqlx::query(query).fetch_all(&pool).await?;
        let headers = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect());
        let rows: Vec<Vec<String>> = rows.iter().map(render_row).collect();

        let mut table = SourceTable::new(rows);
        table.headers = headers;
        Ok(table)
    }
}

fn render_row(row: &SqliteRow) -> Vec<String> {
    (0..row.len()).map(|i| render_cell(row, i)).collect()
}

fn render_cell(row: &SqliteRow, index: usize) -> String {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    String::new()
}

#[async_trait]
impl ProtocolExtension for SqlExtension {
    fn identifier(&self) -> &'static str {
        "sql"
    }

    fn is_valid_configuration(&self, protocol: &str, configuration: &serde_json::Value) -> bool {
        protocol.eq_ignore_ascii_case(PROTOCOL)
            && serde_json::from_value::<SqlConfiguration>(configuration.clone())
                .is_ok_and(|c| c.url.starts_with("sqlite:"))
    }

    fn supported_sources(&self) -> &[SourceType] {
        &[SourceType::Sql]
    }

    fn supported_criteria(&self) -> &[CriterionType] {
        &[CriterionType::Sql]
    }

    #[instrument(skip_all, fields(host = %host.hostname, source = %source.key))]
    async fn process_source(
        &self,
        source: &Source,
        _connector_id: &str,
        host: &HostConfiguration,
    ) -> EngineResult<SourceTable> {
        let SourceKind::Sql { query } = &source.kind else {
            return Err(EngineError::Unsupported {
                extension: "sql",
                variant: source.source_type().to_string(),
            });
        };
        self.query(query, host).await
    }

    async fn process_criterion(
        &self,
        criterion: &Criterion,
        _connector_id: &str,
        host: &HostConfiguration,
    ) -> CriterionTestResult {
        let Criterion::Sql {
            query,
            expected_result,
        } = criterion
        else {
            return CriterionTestResult::failure(
                format!("sql cannot test {}", criterion.criterion_type()),
                None,
            );
        };

        let description = format!("SQL query '{query}'");
        match self.query(query, host).await {
            Ok(table) => CriterionTestResult::from_output(
                &description,
                table.to_csv(),
                expected_result.as_deref(),
            ),
            Err(e) => CriterionTestResult::failure(format!("{description} failed: {e}"), None),
        }
    }

    async fn health_check(&self, host: &HostConfiguration) -> Option<bool> {
        Some(self.query("SELECT 1", host).await.is_ok())
    }
}

//! Data fetcher: executes a validated query and splits rows into records
//!
//! Every selected column arrives as text (the builder casts with `::text`);
//! values are decoded per column semantic type when rows are shaped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use sqlx::{PgPool, Row};
use thiserror::Error;

use crate::query::{ParamValue, ParameterizedQuery};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed result set: {0}")]
    MalformedResult(String),
}

/// One result row keyed by column alias. `None` is SQL NULL.
pub type RawRow = HashMap<String, Option<String>>;

/// Anything that can run a parameterized query within a timeout.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn fetch(&self, query: &ParameterizedQuery, timeout: Duration) -> Result<Vec<RawRow>, FetchError>;

    fn name(&self) -> &str;
}

// ============================================================================
// PostgreSQL connector
// ============================================================================

pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseConnector for PgConnector {
    async fn fetch(&self, query: &ParameterizedQuery, timeout: Duration) -> Result<Vec<RawRow>, FetchError> {
        let mut q = sqlx::query(&query.sql);
        for param in &query.params {
            q = match param {
                ParamValue::Text(s) => q.bind(s.clone()),
                ParamValue::Integer(i) => q.bind(*i),
                ParamValue::Float(f) => q.bind(*f),
                ParamValue::Boolean(b) => q.bind(*b),
                ParamValue::Timestamp(t) => q.bind(*t),
            };
        }

        // The pooled connection is released when this future is dropped.
        let rows = tokio::time::timeout(timeout, q.fetch_all(&self.pool))
            .await
            .map_err(|_| FetchError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut raw = RawRow::new();
            for table in &query.layout {
                for column in &table.columns {
                    let value: Option<String> = row.try_get(column.alias.as_str()).map_err(|e| {
                        FetchError::MalformedResult(format!("column {}: {}", column.alias, e))
                    })?;
                    raw.insert(column.alias.clone(), value);
                }
            }
            out.push(raw);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// ============================================================================
// Shaped results
// ============================================================================

/// One table's slice of a result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedRecord {
    pub table: String,
    pub record_id: String,
    pub values: IndexMap<String, Option<serde_json::Value>>,
}

/// A result row split per table, anchor record first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedRow {
    pub records: Vec<FetchedRecord>,
}

impl FetchedRow {
    pub fn anchor(&self) -> Option<&FetchedRecord> {
        self.records.first()
    }

    pub fn record(&self, table: &str) -> Option<&FetchedRecord> {
        self.records.iter().find(|r| r.table == table)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub rows: Vec<FetchedRow>,
    pub elapsed_ms: u64,
}

impl FetchResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Whether `table`/`record_id` appears in any fetched row.
    pub fn contains_record(&self, table: &str, record_id: &str) -> bool {
        self.rows
            .iter()
            .any(|row| row.records.iter().any(|r| r.table == table && r.record_id == record_id))
    }
}

/// Run `query` through `connector` and shape the rows.
pub async fn fetch_rows(
    connector: &dyn DatabaseConnector,
    query: &ParameterizedQuery,
    timeout: Duration,
) -> Result<FetchResult, FetchError> {
    let started = Instant::now();
    let raw = connector.fetch(query, timeout).await?;
    let rows = shape_rows(query, raw)?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        connector = connector.name(),
        rows = rows.len(),
        elapsed_ms,
        "Rows fetched"
    );
    Ok(FetchResult { rows, elapsed_ms })
}

/// Split raw rows into per-table records following the query layout.
///
/// A NULL primary key on a joined table means the LEFT JOIN found nothing and
/// the table contributes no record; a NULL anchor key is a malformed result.
pub fn shape_rows(query: &ParameterizedQuery, raw: Vec<RawRow>) -> Result<Vec<FetchedRow>, FetchError> {
    let mut rows = Vec::with_capacity(raw.len());
    for (position, mut raw_row) in raw.into_iter().enumerate() {
        let mut records = Vec::with_capacity(query.layout.len());
        for (i, table) in query.layout.iter().enumerate() {
            let key_alias = table.key_alias().ok_or_else(|| {
                FetchError::MalformedResult(format!("layout for {} lacks its primary key", table.table))
            })?;
            let record_id = match raw_row.get(key_alias) {
                None => {
                    return Err(FetchError::MalformedResult(format!(
                        "row {position} is missing column {key_alias}"
                    )))
                }
                Some(None) if i == 0 => {
                    return Err(FetchError::MalformedResult(format!(
                        "row {position} has a NULL anchor key"
                    )))
                }
                Some(None) => continue,
                Some(Some(id)) => id.clone(),
            };

            let mut values = IndexMap::with_capacity(table.columns.len());
            for column in &table.columns {
                let value = raw_row.remove(&column.alias).ok_or_else(|| {
                    FetchError::MalformedResult(format!("row {position} is missing column {}", column.alias))
                })?;
                values.insert(
                    column.column.clone(),
                    value.map(|v| column.semantic_type.decode(&v)),
                );
            }
            records.push(FetchedRecord {
                table: table.table.clone(),
                record_id,
                values,
            });
        }
        rows.push(FetchedRow { records });
    }
    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================

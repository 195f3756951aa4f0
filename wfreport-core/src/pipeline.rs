//! Report pipeline: catalog → join path → query → fetch → facts → reasoning → compose
//!
//! One call is one strictly sequential execution. The only suspending steps are
//! the database fetch and the reasoning call; each is bounded by its configured
//! timeout and raced against the caller's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::catalog::SchemaCatalog;
use crate::compose::{compose, QueryTrace, ReportBundle};
use crate::config::ReportConfig;
use crate::error::ReportError;
use crate::facts::{extract_facts, extract_truncated_facts};
use crate::fetch::{fetch_rows, DatabaseConnector};
use crate::join::resolve_join_path;
use crate::query::{build_query, FilterPredicate, ParameterizedQuery, QueryLimits, QuerySpec, TimeWindow};
use crate::reasoning::{build_request, summarize, ReasoningBackend};

/// Structured reading of a question, produced upstream of this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub anchor: String,
    #[serde(default)]
    pub mentioned: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub limits: QueryLimits,
    pub fetch_timeout: Duration,
    pub reasoning_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            limits: QueryLimits::default(),
            fetch_timeout: Duration::from_secs(30),
            reasoning_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ReportConfig> for EngineSettings {
    fn from(config: &ReportConfig) -> Self {
        Self {
            limits: QueryLimits {
                default_limit: config.query.default_limit,
                max_limit: config.query.max_limit,
            },
            fetch_timeout: Duration::from_secs(config.database.fetch_timeout_seconds),
            reasoning_timeout: Duration::from_secs(config.reasoning.timeout_seconds),
        }
    }
}

pub struct ReportEngine {
    catalog: Arc<SchemaCatalog>,
    connector: Arc<dyn DatabaseConnector>,
    reasoner: Arc<dyn ReasoningBackend>,
    settings: EngineSettings,
}

impl ReportEngine {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        connector: Arc<dyn DatabaseConnector>,
        reasoner: Arc<dyn ReasoningBackend>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            connector,
            reasoner,
            settings,
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Resolve and validate the query for `intent` without touching the database.
    pub fn plan(&self, intent: &ParsedIntent) -> Result<ParameterizedQuery, ReportError> {
        let path = resolve_join_path(&self.catalog, &intent.anchor, &intent.mentioned)?;
        let spec = QuerySpec {
            path,
            filters: intent.filters.clone(),
            limit: intent.limit,
            time_window: intent.time_window.clone(),
        };
        Ok(build_query(&self.catalog, &spec, self.settings.limits)?)
    }

    pub async fn generate_report(&self, question: &str, intent: &ParsedIntent) -> Result<ReportBundle, ReportError> {
        self.generate_report_with_cancel(question, intent, &CancellationToken::new())
            .await
    }

    /// As [`generate_report`](Self::generate_report), stopping with
    /// [`ReportError::Cancelled`] as soon as `cancel` fires. No external call is
    /// issued after cancellation and in-flight calls are dropped.
    pub async fn generate_report_with_cancel(
        &self,
        question: &str,
        intent: &ParsedIntent,
        cancel: &CancellationToken,
    ) -> Result<ReportBundle, ReportError> {
        tracing::info!(anchor = %intent.anchor, mentioned = ?intent.mentioned, "Generating report");

        let query = self.plan(intent)?;
        let tables: Vec<String> = query.layout.iter().map(|t| t.table.clone()).collect();

        if cancel.is_cancelled() {
            return Err(ReportError::Cancelled { stage: "fetch" });
        }
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReportError::Cancelled { stage: "fetch" }),
            result = fetch_rows(self.connector.as_ref(), &query, self.settings.fetch_timeout) => result?,
        };

        // A full page may have cut the last anchor record's rows short.
        let truncated = fetched.row_count() >= query.limit as usize;
        let facts = if truncated {
            tracing::info!(limit = query.limit, "Row limit reached");
            extract_truncated_facts(&self.catalog, &fetched.rows)
        } else {
            extract_facts(&self.catalog, &fetched.rows)
        };
        let trace = QueryTrace {
            anchor: intent.anchor.clone(),
            tables,
            sql: query.sql.clone(),
            param_count: query.params.len(),
            row_count: fetched.row_count(),
            truncated,
            fact_count: facts.len(),
            fetch_ms: fetched.elapsed_ms,
        };

        // Nothing to reason over: no claim could ever ground.
        if facts.is_empty() {
            tracing::warn!(rows = trace.row_count, "No facts extracted, skipping reasoning");
            return Err(ReportError::Compose { raw_claims: 0, facts: 0 });
        }

        if cancel.is_cancelled() {
            return Err(ReportError::Cancelled { stage: "reasoning" });
        }
        let request = build_request(question, &facts, &self.catalog);
        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReportError::Cancelled { stage: "reasoning" }),
            result = summarize(self.reasoner.as_ref(), &request, self.settings.reasoning_timeout) => result?,
        };

        compose(question, &facts, &completion, &trace)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // TEST 1: intents deserialize with optional fields defaulted
    // ========================================================================
    #[test]
    fn test_parsed_intent_defaults() {
        let intent: ParsedIntent = serde_json::from_str(r#"{"anchor": "package"}"#).unwrap();
        assert_eq!(intent.anchor, "package");
        assert!(intent.mentioned.is_empty());
        assert!(intent.filters.is_empty());
        assert_eq!(intent.limit, None);
        assert_eq!(intent.time_window, None);

        let intent: ParsedIntent = serde_json::from_str(
            r#"{"anchor": "package", "mentioned": ["instance"],
                "filters": [{"column": "status", "op": "eq", "value": "Delayed"}],
                "limit": 25,
                "time_window": {"column": "created_at", "since": "2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(intent.mentioned, vec!["instance".to_string()]);
        assert_eq!(intent.filters.len(), 1);
        assert_eq!(intent.limit, Some(25));
        assert!(intent.time_window.unwrap().until.is_none());
    }
}

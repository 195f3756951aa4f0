//! Append-only JSONL audit trail, one record per report request.
//!
//! The log is write-only from the service's point of view; nothing reads it
//! back.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::compose::ReportBundle;
use crate::error::ReportError;
use crate::pipeline::ParsedIntent;

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub question: String,
    pub anchor: String,
    pub mentioned: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims_returned: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims_kept: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl AuditRecord {
    fn base(question: &str, intent: &ParsedIntent, elapsed_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            question: question.to_string(),
            anchor: intent.anchor.clone(),
            mentioned: intent.mentioned.clone(),
            sql: None,
            report_id: None,
            row_count: None,
            claims_returned: None,
            claims_kept: None,
            error_kind: None,
            error: None,
            elapsed_ms,
        }
    }

    pub fn success(question: &str, intent: &ParsedIntent, bundle: &ReportBundle, elapsed_ms: u64) -> Self {
        let query = &bundle.json["query"];
        Self {
            sql: query["sql"].as_str().map(str::to_string),
            report_id: Some(bundle.report_id),
            row_count: query["row_count"].as_u64().map(|n| n as usize),
            claims_returned: Some(bundle.raw_claim_count),
            claims_kept: Some(bundle.kept_claim_count),
            ..Self::base(question, intent, elapsed_ms)
        }
    }

    /// `sql` is the planned statement when planning got that far.
    pub fn failure(
        question: &str,
        intent: &ParsedIntent,
        sql: Option<String>,
        error: &ReportError,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            sql,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            ..Self::base(question, intent, elapsed_ms)
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// `path` may start with `~`.
    pub fn new(path: &str) -> Self {
        Self {
            path: PathBuf::from(shellexpand::tilde(path).into_owned()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }
}

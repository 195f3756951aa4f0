//! Dual-output composer: Markdown and JSON from one grounded claim set
//!
//! A claim survives only if its provenance resolves to an extracted fact and,
//! when it states a value, that value matches the fact. Both renderings are
//! produced from the surviving set, so the Markdown can never assert what the
//! JSON does not carry. The model's free prose is never rendered: the summary
//! is rebuilt from the surviving claim texts.

use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ReportError;
use crate::facts::{Confidence, Fact, FactSet, Provenance};
use crate::reasoning::{Claim, ReasoningCompletion};

/// Execution details attached to every bundle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTrace {
    pub anchor: String,
    pub tables: Vec<String>,
    pub sql: String,
    pub param_count: usize,
    pub row_count: usize,
    /// The row limit was reached; the last anchor record's facts are Low.
    pub truncated: bool,
    pub fact_count: usize,
    pub fetch_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundedClaim {
    pub fact_id: String,
    pub claim: String,
    pub provenance: Provenance,
    pub value: serde_json::Value,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supporting_records: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicGroup {
    pub topic: String,
    pub facts: Vec<GroundedClaim>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportBundle {
    pub report_id: Uuid,
    pub markdown: String,
    pub json: serde_json::Value,
    pub detailed_summary: Vec<TopicGroup>,
    pub raw_claim_count: usize,
    pub kept_claim_count: usize,
}

impl ReportBundle {
    pub fn dropped_claim_count(&self) -> usize {
        self.raw_claim_count - self.kept_claim_count
    }
}

/// Render a fact value for Markdown and for value comparison.
fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn value_matches(claimed: Option<&serde_json::Value>, fact: &serde_json::Value) -> bool {
    match claimed {
        None | Some(serde_json::Value::Null) => true,
        Some(v) => v == fact || render_value(v).trim() == render_value(fact),
    }
}

fn ground<'a>(claim: &Claim, facts: &'a FactSet) -> Option<&'a Fact> {
    let provenance = claim.provenance.as_ref()?;
    facts
        .supporting(provenance)
        .find(|f| value_matches(claim.value.as_ref(), &f.value))
}

/// Keep grounded claims, one per fact, grouped by topic in first-seen order
/// and ordered High, Medium, Low within a topic.
pub fn ground_claims(claims: &[Claim], facts: &FactSet) -> Vec<TopicGroup> {
    let mut groups: IndexMap<String, Vec<GroundedClaim>> = IndexMap::new();
    let mut seen = std::collections::HashSet::new();

    for claim in claims {
        let Some(fact) = ground(claim, facts) else {
            tracing::debug!(claim = %claim.text, "Dropping ungrounded claim");
            continue;
        };
        if !seen.insert(fact.id.as_str()) {
            continue;
        }
        let supporting_records = match fact.supporting_records().as_slice() {
            [_single] => Vec::new(),
            many => many.iter().map(|s| s.to_string()).collect(),
        };
        groups.entry(fact.topic.clone()).or_default().push(GroundedClaim {
            fact_id: fact.id.clone(),
            claim: claim.text.trim().to_string(),
            provenance: fact.provenance.clone(),
            value: fact.value.clone(),
            confidence: fact.confidence,
            supporting_records,
        });
    }

    groups
        .into_iter()
        .map(|(topic, mut facts)| {
            facts.sort_by_key(|c| c.confidence);
            TopicGroup { topic, facts }
        })
        .collect()
}

/// Build the report for one request. Fails with [`ReportError::Compose`] when
/// no claim survives grounding.
pub fn compose(
    question: &str,
    facts: &FactSet,
    completion: &ReasoningCompletion,
    trace: &QueryTrace,
) -> Result<ReportBundle, ReportError> {
    let raw_claim_count = completion.claims.len();
    let detailed_summary = ground_claims(&completion.claims, facts);
    let kept_claim_count: usize = detailed_summary.iter().map(|g| g.facts.len()).sum();

    if kept_claim_count == 0 {
        tracing::warn!(raw_claims = raw_claim_count, facts = facts.len(), "No grounded claims");
        return Err(ReportError::Compose {
            raw_claims: raw_claim_count,
            facts: facts.len(),
        });
    }

    tracing::debug!(prose_chars = completion.prose.len(), "Model prose discarded");

    let report_id = Uuid::new_v4();
    let summary = summary_text(&detailed_summary);
    let json = render_json(report_id, question, &summary, &detailed_summary, raw_claim_count, kept_claim_count, trace);
    let markdown = render_markdown(question, &summary, &detailed_summary, raw_claim_count, kept_claim_count, trace);

    tracing::info!(
        %report_id,
        raw_claims = raw_claim_count,
        kept_claims = kept_claim_count,
        topics = detailed_summary.len(),
        "Report composed"
    );

    Ok(ReportBundle {
        report_id,
        markdown,
        json,
        detailed_summary,
        raw_claim_count,
        kept_claim_count,
    })
}

/// Surviving claim texts in report order, one sentence each.
fn summary_text(groups: &[TopicGroup]) -> String {
    groups
        .iter()
        .flat_map(|g| &g.facts)
        .map(|c| {
            let text = c.claim.trim();
            if text.ends_with(['.', '!', '?']) {
                text.to_string()
            } else {
                format!("{text}.")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn confidence_breakdown(groups: &[TopicGroup]) -> serde_json::Value {
    let count = |c: Confidence| groups.iter().flat_map(|g| &g.facts).filter(|f| f.confidence == c).count();
    serde_json::json!({
        "High": count(Confidence::High),
        "Medium": count(Confidence::Medium),
        "Low": count(Confidence::Low),
    })
}

fn render_json(
    report_id: Uuid,
    question: &str,
    summary: &str,
    groups: &[TopicGroup],
    raw: usize,
    kept: usize,
    trace: &QueryTrace,
) -> serde_json::Value {
    serde_json::json!({
        "report_id": report_id,
        "question": question,
        "summary": summary,
        "detailed_summary": groups,
        "confidence_breakdown": confidence_breakdown(groups),
        "claims": { "returned": raw, "kept": kept, "dropped": raw - kept },
        "query": trace,
    })
}

fn render_markdown(
    question: &str,
    summary: &str,
    groups: &[TopicGroup],
    raw: usize,
    kept: usize,
    trace: &QueryTrace,
) -> String {
    let mut md = String::new();
    md.push_str("# Workflow report\n\n");
    md.push_str(&format!("**Question:** {}\n\n", question.trim()));
    md.push_str("## Summary\n\n");
    md.push_str(summary);
    md.push_str("\n\n## Detailed summary\n");

    for group in groups {
        md.push_str(&format!("\n### {}\n\n", group.topic));
        for claim in &group.facts {
            md.push_str(&format!(
                "- **{}** {} (value: `{}`; source: `{}`",
                claim.confidence,
                claim.claim,
                render_value(&claim.value),
                claim.provenance
            ));
            if !claim.supporting_records.is_empty() {
                md.push_str(&format!("; records: {}", claim.supporting_records.join(", ")));
            }
            md.push_str(")\n");
        }
    }

    md.push_str(&format!(
        "\n---\n_{} of {} claims grounded in {} facts from {} rows ({})._\n",
        kept,
        raw,
        trace.fact_count,
        trace.row_count,
        trace.tables.join(" → ")
    ));
    if trace.truncated {
        md.push_str("_Row limit reached; facts for the last record are Low._\n");
    }
    md
}

// ============================================================================
// TESTS
// ============================================================================

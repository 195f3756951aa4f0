//! Fact extractor: provenance-tagged assertions with deterministic confidence
//!
//! Records are grouped under the anchor record they were fetched with. Anchor
//! records, and joined records that are the only one of their table for an
//! anchor record, yield one fact per column. Tables that fan out (two or more
//! records for one anchor record) yield one aggregated fact per column.
//!
//! | source                               | agree  | disagree / partial |
//! |--------------------------------------|--------|--------------------|
//! | anchor or single joined record       | High   | Low                |
//! | fanned-out joined records            | Medium | Low                |
//!
//! Low facts carry the JSON array of distinct values in first-seen order when
//! more than one value was seen. Key columns are never emitted.
//!
//! When the row limit was reached the last anchor record may be missing rows,
//! so every fact of that final group is Low.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::SchemaCatalog;
use crate::fetch::{FetchedRecord, FetchedRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "High",
            Confidence::Medium => "Medium",
            Confidence::Low => "Low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(table, column, record id)`, rendered `table.column#record_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ProvenanceRepr")]
pub struct Provenance {
    pub table: String,
    pub column: String,
    pub record_id: String,
}

impl Provenance {
    pub fn new(table: impl Into<String>, column: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            record_id: record_id.into(),
        }
    }

    /// Parse a `table.column#record_id` token.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().trim_matches('`');
        let (location, record_id) = token.split_once('#')?;
        let (table, column) = location.split_once('.')?;
        if table.is_empty() || column.is_empty() || record_id.is_empty() {
            return None;
        }
        Some(Self::new(table, column, record_id))
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}#{}", self.table, self.column, self.record_id)
    }
}

/// Claims may cite provenance as a token or as an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProvenanceRepr {
    Token(String),
    Parts {
        table: String,
        column: String,
        record_id: serde_json::Value,
    },
}

impl TryFrom<ProvenanceRepr> for Provenance {
    type Error = String;

    fn try_from(repr: ProvenanceRepr) -> Result<Self, Self::Error> {
        match repr {
            ProvenanceRepr::Token(token) => {
                Provenance::parse(&token).ok_or_else(|| format!("invalid provenance token {token:?}"))
            }
            ProvenanceRepr::Parts {
                table,
                column,
                record_id,
            } => {
                let record_id = match record_id {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Number(n) => n.to_string(),
                    other => return Err(format!("invalid record id {other}")),
                };
                Ok(Provenance::new(table, column, record_id))
            }
        }
    }
}

/// How a fact's value was established.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactBasis {
    /// One record, seen in `rows` result rows.
    Record { rows: usize },
    /// Several records of one table joined to the same anchor record.
    FanOut {
        records: Vec<String>,
        missing: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    /// `F1`, `F2`, ... in extraction order.
    pub id: String,
    /// Topic the fact is grouped under (its table).
    pub topic: String,
    /// Anchor record the fact was extracted for, as `table#id`.
    pub subject: String,
    pub provenance: Provenance,
    pub value: serde_json::Value,
    pub confidence: Confidence,
    pub basis: FactBasis,
}

impl Fact {
    /// Whether a claim citing `provenance` is backed by this fact.
    pub fn supports(&self, provenance: &Provenance) -> bool {
        if self.provenance.table != provenance.table || self.provenance.column != provenance.column {
            return false;
        }
        match &self.basis {
            FactBasis::Record { .. } => self.provenance.record_id == provenance.record_id,
            FactBasis::FanOut { records, .. } => records.contains(&provenance.record_id),
        }
    }

    pub fn supporting_records(&self) -> Vec<&str> {
        match &self.basis {
            FactBasis::Record { .. } => vec![self.provenance.record_id.as_str()],
            FactBasis::FanOut { records, .. } => records.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FactSet {
    facts: Vec<Fact>,
}

impl FactSet {
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Fact> {
        self.facts.iter().find(|f| f.id == id)
    }

    /// Facts backing `provenance`, in extraction order.
    pub fn supporting<'a: 'p, 'p>(&'a self, provenance: &'p Provenance) -> impl Iterator<Item = &'a Fact> + 'p {
        self.facts.iter().filter(move |f| f.supports(provenance))
    }

    pub fn count_by_confidence(&self, confidence: Confidence) -> usize {
        self.facts.iter().filter(|f| f.confidence == confidence).count()
    }

    fn push(&mut self, mut fact: Fact) {
        fact.id = format!("F{}", self.facts.len() + 1);
        self.facts.push(fact);
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Every observation of one anchor record and the records joined to it.
#[derive(Default)]
struct AnchorGroup<'a> {
    observations: Vec<&'a FetchedRecord>,
    joined: IndexMap<&'a str, IndexMap<&'a str, Vec<&'a FetchedRecord>>>,
}

/// Extract facts from shaped rows. Deterministic: the same rows always give
/// the same facts, ids and confidences.
pub fn extract_facts(catalog: &SchemaCatalog, rows: &[FetchedRow]) -> FactSet {
    extract(catalog, rows, false)
}

/// As [`extract_facts`] for a result that hit its row limit. Rows are ordered
/// by anchor key, so only the final anchor group can be cut short.
pub fn extract_truncated_facts(catalog: &SchemaCatalog, rows: &[FetchedRow]) -> FactSet {
    extract(catalog, rows, true)
}

fn extract(catalog: &SchemaCatalog, rows: &[FetchedRow], truncated: bool) -> FactSet {
    let mut groups: IndexMap<&str, AnchorGroup<'_>> = IndexMap::new();
    let mut anchor_table: Option<&str> = None;

    for row in rows {
        let Some(anchor) = row.anchor() else { continue };
        anchor_table.get_or_insert(anchor.table.as_str());
        let group = groups.entry(anchor.record_id.as_str()).or_default();
        group.observations.push(anchor);
        for record in &row.records[1..] {
            group
                .joined
                .entry(record.table.as_str())
                .or_default()
                .entry(record.record_id.as_str())
                .or_default()
                .push(record);
        }
    }

    let mut facts = FactSet::default();
    // A joined record shared by several anchor records is asserted once.
    let mut emitted: HashSet<(&str, &str)> = HashSet::new();

    let table = anchor_table.unwrap_or_default();
    let last = groups.len().saturating_sub(1);
    for (position, (anchor_id, group)) in groups.iter().enumerate() {
        let partial_from = facts.len();
        let subject = format!("{table}#{anchor_id}");
        record_facts(catalog, &subject, &group.observations, &mut facts);

        for (joined_table, records) in &group.joined {
            match records.first() {
                Some((record_id, observations)) if records.len() == 1 => {
                    if emitted.insert((*joined_table, *record_id)) {
                        record_facts(catalog, &subject, observations, &mut facts);
                    }
                }
                _ => fan_out_facts(catalog, &subject, joined_table, records, &mut facts),
            }
        }

        if truncated && position == last {
            for fact in &mut facts.facts[partial_from..] {
                fact.confidence = Confidence::Low;
            }
            tracing::debug!(anchor = %subject, "Row limit reached, final anchor group marked Low");
        }
    }

    tracing::info!(
        anchors = groups.len(),
        facts = facts.len(),
        high = facts.count_by_confidence(Confidence::High),
        medium = facts.count_by_confidence(Confidence::Medium),
        low = facts.count_by_confidence(Confidence::Low),
        "Facts extracted"
    );
    facts
}

/// Non-key columns of `table` in schema order.
fn assertable_columns<'a>(catalog: &'a SchemaCatalog, table: &str) -> Vec<&'a str> {
    match catalog.table(table) {
        Some(t) => t
            .columns
            .iter()
            .filter(|c| !t.is_key_column(&c.name))
            .map(|c| c.name.as_str())
            .collect(),
        None => Vec::new(),
    }
}

/// Distinct non-null values in first-seen order, plus the count of NULLs.
fn distinct_values<'a>(values: impl Iterator<Item = Option<&'a serde_json::Value>>) -> (Vec<serde_json::Value>, usize) {
    let mut distinct: Vec<serde_json::Value> = Vec::new();
    let mut missing = 0;
    for value in values {
        match value {
            Some(v) => {
                if !distinct.contains(v) {
                    distinct.push(v.clone());
                }
            }
            None => missing += 1,
        }
    }
    (distinct, missing)
}

fn collapse(mut distinct: Vec<serde_json::Value>) -> serde_json::Value {
    if distinct.len() == 1 {
        distinct.remove(0)
    } else {
        serde_json::Value::Array(distinct)
    }
}

fn record_facts(catalog: &SchemaCatalog, subject: &str, observations: &[&FetchedRecord], facts: &mut FactSet) {
    let Some(first) = observations.first() else { return };
    for column in assertable_columns(catalog, &first.table) {
        let (distinct, missing) = distinct_values(
            observations
                .iter()
                .map(|r| r.values.get(column).and_then(|v| v.as_ref())),
        );
        if distinct.is_empty() {
            continue;
        }
        let confidence = if distinct.len() == 1 && missing == 0 {
            Confidence::High
        } else {
            Confidence::Low
        };
        facts.push(Fact {
            id: String::new(),
            topic: first.table.clone(),
            subject: subject.to_string(),
            provenance: Provenance::new(&first.table, column, &first.record_id),
            value: collapse(distinct),
            confidence,
            basis: FactBasis::Record {
                rows: observations.len(),
            },
        });
    }
}

fn fan_out_facts(
    catalog: &SchemaCatalog,
    subject: &str,
    table: &str,
    records: &IndexMap<&str, Vec<&FetchedRecord>>,
    facts: &mut FactSet,
) {
    for column in assertable_columns(catalog, table) {
        let mut distinct: Vec<serde_json::Value> = Vec::new();
        let mut supporting: Vec<String> = Vec::new();
        let mut missing = 0;
        let mut conflicting = false;

        for (record_id, observations) in records {
            let (values, nulls) = distinct_values(
                observations
                    .iter()
                    .map(|r| r.values.get(column).and_then(|v| v.as_ref())),
            );
            if values.is_empty() {
                missing += 1;
                continue;
            }
            // A record that disagrees with itself across rows taints the aggregate.
            if values.len() > 1 || nulls > 0 {
                conflicting = true;
            }
            supporting.push(record_id.to_string());
            for v in values {
                if !distinct.contains(&v) {
                    distinct.push(v);
                }
            }
        }

        if distinct.is_empty() {
            continue;
        }
        let confidence = if distinct.len() == 1 && missing == 0 && !conflicting {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        facts.push(Fact {
            id: String::new(),
            topic: table.to_string(),
            subject: subject.to_string(),
            provenance: Provenance::new(table, column, &supporting[0]),
            value: collapse(distinct),
            confidence,
            basis: FactBasis::FanOut {
                records: supporting,
                missing,
            },
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::workflow_catalog;
    use serde_json::json;

    fn record(table: &str, id: &str, values: &[(&str, Option<serde_json::Value>)]) -> FetchedRecord {
        FetchedRecord {
            table: table.to_string(),
            record_id: id.to_string(),
            values: values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn package(id: &str, status: &str) -> FetchedRecord {
        record(
            "package",
            id,
            &[
                ("id", Some(json!(id))),
                ("name", None),
                ("status", Some(json!(status))),
                ("created_at", None),
            ],
        )
    }

    fn instance(id: &str, package_id: &str, count: Option<i64>) -> FetchedRecord {
        record(
            "instance",
            id,
            &[
                ("id", Some(json!(id))),
                ("package_id", Some(json!(package_id))),
                ("state", None),
                ("workitem_count", count.map(|c| json!(c))),
                ("started_at", None),
            ],
        )
    }

    fn row(records: Vec<FetchedRecord>) -> FetchedRow {
        FetchedRow { records }
    }

    fn find<'a>(facts: &'a FactSet, table: &str, column: &str, subject: &str) -> &'a Fact {
        facts
            .iter()
            .find(|f| f.provenance.table == table && f.provenance.column == column && f.subject == subject)
            .unwrap_or_else(|| panic!("no fact {table}.{column} for {subject}"))
    }

    /// P1 has two instances, P2 has one; both packages are Delayed.
    fn scenario(count_a: i64, count_b: i64) -> Vec<FetchedRow> {
        vec![
            row(vec![package("P1", "Delayed"), instance("I1", "P1", Some(count_a))]),
            row(vec![package("P1", "Delayed"), instance("I2", "P1", Some(count_b))]),
            row(vec![package("P2", "Delayed"), instance("I3", "P2", Some(2))]),
        ]
    }

    // ========================================================================
    // TEST 1: anchor records yield High facts even when fanned out
    // ========================================================================
    #[test]
    fn test_anchor_status_facts_high() {
        let facts = extract_facts(&workflow_catalog(), &scenario(4, 4));

        let statuses: Vec<&Fact> = facts
            .iter()
            .filter(|f| f.provenance.table == "package" && f.provenance.column == "status")
            .collect();
        assert_eq!(statuses.len(), 2);
        for fact in statuses {
            assert_eq!(fact.confidence, Confidence::High);
            assert_eq!(fact.value, json!("Delayed"));
        }
        let p1 = find(&facts, "package", "status", "package#P1");
        assert_eq!(p1.basis, FactBasis::Record { rows: 2 });
    }

    // ========================================================================
    // TEST 2: agreeing fan-out is Medium, disagreeing fan-out is Low
    // ========================================================================
    #[test]
    fn test_fan_out_confidence() {
        let facts = extract_facts(&workflow_catalog(), &scenario(4, 4));
        let agg = find(&facts, "instance", "workitem_count", "package#P1");
        assert_eq!(agg.confidence, Confidence::Medium);
        assert_eq!(agg.value, json!(4));
        assert_eq!(agg.supporting_records(), vec!["I1", "I2"]);

        let facts = extract_facts(&workflow_catalog(), &scenario(4, 7));
        let agg = find(&facts, "instance", "workitem_count", "package#P1");
        assert_eq!(agg.confidence, Confidence::Low);
        assert_eq!(agg.value, json!([4, 7]));
        assert_eq!(agg.provenance, Provenance::new("instance", "workitem_count", "I1"));
    }

    // ========================================================================
    // TEST 3: a single joined record is High
    // ========================================================================
    #[test]
    fn test_single_joined_record_high() {
        let facts = extract_facts(&workflow_catalog(), &scenario(4, 4));
        let single = find(&facts, "instance", "workitem_count", "package#P2");
        assert_eq!(single.confidence, Confidence::High);
        assert_eq!(single.value, json!(2));
        assert_eq!(single.provenance.record_id, "I3");
    }

    // ========================================================================
    // TEST 4: partial NULLs across a fan-out lower confidence to Low
    // ========================================================================
    #[test]
    fn test_partial_nulls_low() {
        let rows = vec![
            row(vec![package("P1", "Delayed"), instance("I1", "P1", Some(4))]),
            row(vec![package("P1", "Delayed"), instance("I2", "P1", None)]),
        ];
        let facts = extract_facts(&workflow_catalog(), &rows);
        let agg = find(&facts, "instance", "workitem_count", "package#P1");
        assert_eq!(agg.confidence, Confidence::Low);
        assert_eq!(agg.value, json!(4));
        assert_eq!(
            agg.basis,
            FactBasis::FanOut {
                records: vec!["I1".into()],
                missing: 1
            }
        );
    }

    // ========================================================================
    // TEST 5: conflicting duplicates of one record are Low
    // ========================================================================
    #[test]
    fn test_conflicting_duplicates_low() {
        let rows = vec![
            row(vec![package("P1", "Delayed")]),
            row(vec![package("P1", "Active")]),
        ];
        let facts = extract_facts(&workflow_catalog(), &rows);
        let status = find(&facts, "package", "status", "package#P1");
        assert_eq!(status.confidence, Confidence::Low);
        assert_eq!(status.value, json!(["Delayed", "Active"]));
    }

    // ========================================================================
    // TEST 6: key columns and all-NULL columns produce no facts
    // ========================================================================
    #[test]
    fn test_keys_and_nulls_skipped() {
        let facts = extract_facts(&workflow_catalog(), &scenario(4, 4));
        assert!(facts.iter().all(|f| f.provenance.column != "id"));
        assert!(facts.iter().all(|f| f.provenance.column != "package_id"));
        assert!(facts.iter().all(|f| f.provenance.column != "name"));
        assert!(facts.iter().all(|f| f.value != serde_json::Value::Null));
    }

    // ========================================================================
    // TEST 7: extraction is deterministic and ids are sequential
    // ========================================================================
    #[test]
    fn test_deterministic_ids() {
        let a = extract_facts(&workflow_catalog(), &scenario(4, 7));
        let b = extract_facts(&workflow_catalog(), &scenario(4, 7));
        let ids: Vec<&str> = a.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["F1", "F2", "F3", "F4"]);
        assert_eq!(
            a.iter().map(|f| (&f.provenance, f.confidence)).collect::<Vec<_>>(),
            b.iter().map(|f| (&f.provenance, f.confidence)).collect::<Vec<_>>()
        );
        assert_eq!(a.get("F2").unwrap().provenance.table, "instance");
    }

    // ========================================================================
    // TEST 8: every provenance resolves to a fetched record
    // ========================================================================
    #[test]
    fn test_provenance_resolves_to_fetched_rows() {
        let rows = scenario(4, 7);
        let facts = extract_facts(&workflow_catalog(), &rows);
        for fact in facts.iter() {
            for id in fact.supporting_records() {
                assert!(
                    rows.iter().any(|r| r.record(&fact.provenance.table).map(|rec| rec.record_id.as_str()) == Some(id)),
                    "{} does not resolve",
                    fact.provenance
                );
            }
        }
    }

    // ========================================================================
    // TEST 9: provenance tokens parse from strings and objects
    // ========================================================================
    #[test]
    fn test_provenance_parsing() {
        let p = Provenance::parse("`package.status#P1`").unwrap();
        assert_eq!(p, Provenance::new("package", "status", "P1"));
        assert_eq!(p.to_string(), "package.status#P1");
        assert!(Provenance::parse("package#P1").is_none());
        assert!(Provenance::parse("package.status#").is_none());

        let p: Provenance = serde_json::from_value(json!("instance.workitem_count#I2")).unwrap();
        assert_eq!(p.record_id, "I2");
        let p: Provenance =
            serde_json::from_value(json!({"table": "instance", "column": "state", "record_id": 12})).unwrap();
        assert_eq!(p.record_id, "12");
        assert!(serde_json::from_value::<Provenance>(json!("garbage")).is_err());
    }

    // ========================================================================
    // TEST 10: a fanned-out fact supports claims citing any of its records
    // ========================================================================
    #[test]
    fn test_fan_out_supports_each_record() {
        let facts = extract_facts(&workflow_catalog(), &scenario(4, 4));
        let cite = Provenance::new("instance", "workitem_count", "I2");
        let backing: Vec<&Fact> = facts.supporting(&cite).collect();
        assert_eq!(backing.len(), 1);
        assert_eq!(backing[0].confidence, Confidence::Medium);

        let stranger = Provenance::new("instance", "workitem_count", "I99");
        assert_eq!(facts.supporting(&stranger).count(), 0);
    }

    // ========================================================================
    // TEST 11: a capped result marks only the final anchor group Low
    // ========================================================================
    #[test]
    fn test_truncated_final_group_low() {
        let facts = extract_truncated_facts(&workflow_catalog(), &scenario(4, 4));

        assert_eq!(find(&facts, "package", "status", "package#P1").confidence, Confidence::High);
        assert_eq!(
            find(&facts, "instance", "workitem_count", "package#P1").confidence,
            Confidence::Medium
        );
        assert_eq!(find(&facts, "package", "status", "package#P2").confidence, Confidence::Low);
        let cut = find(&facts, "instance", "workitem_count", "package#P2");
        assert_eq!(cut.confidence, Confidence::Low);
        assert_eq!(cut.value, json!(2));
    }

    // ========================================================================
    // TEST 12: one row of a two-instance package under a limit of 1 is not High
    // ========================================================================
    #[test]
    fn test_truncated_single_row_not_high() {
        let rows = vec![row(vec![package("P1", "Delayed"), instance("I1", "P1", Some(4))])];

        let complete = extract_facts(&workflow_catalog(), &rows);
        assert_eq!(
            find(&complete, "instance", "workitem_count", "package#P1").confidence,
            Confidence::High
        );

        let capped = extract_truncated_facts(&workflow_catalog(), &rows);
        assert!(capped.iter().all(|f| f.confidence == Confidence::Low));
        assert_eq!(capped.len(), complete.len());
    }

    // ========================================================================
    // TEST 13: supporting facts outlive the provenance they were looked up by
    // ========================================================================
    #[test]
    fn test_supporting_outlives_lookup_key() {
        let facts = extract_facts(&workflow_catalog(), &scenario(4, 4));
        let found: Option<&Fact> = {
            let cite = Provenance::parse("package.status#P2").unwrap();
            let first = facts.supporting(&cite).next();
            first
        };
        assert_eq!(found.map(|f| f.subject.as_str()), Some("package#P2"));
    }
}

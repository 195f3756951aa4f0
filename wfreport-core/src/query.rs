//! Query builder and validator
//!
//! Turns a resolved [`JoinPath`] plus typed filter triples into a single
//! parameterized `SELECT`. Identifiers only ever come from the validated
//! catalog and are double-quoted; every caller-supplied value, including the
//! row limit, is bound as a `$n` parameter. Validation runs in a fixed order
//! (tables, columns, operators, limit) and never coerces an unsafe request into
//! a safe one: it rejects.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{SchemaCatalog, SemanticType};
use crate::join::JoinPath;

/// Upper bound on the number of values in an `in` list.
pub const MAX_IN_VALUES: usize = 100;

/// Operators a filter may use, by wire name.
pub const ALLOWED_OPERATORS: &[&str] = &[
    "eq", "ne", "lt", "lte", "gt", "gte", "between", "in", "contains",
];

#[derive(Error, Debug, PartialEq)]
pub enum UnsafeQueryError {
    #[error("Table {0} is not in the schema catalog")]
    UnknownTable(String),

    #[error("Join {from}.{from_column} = {to}.{to_column} is not a declared relationship")]
    UndeclaredJoin {
        from: String,
        from_column: String,
        to: String,
        to_column: String,
    },

    #[error("Column {0} does not belong to any table on the join path")]
    ColumnNotOnPath(String),

    #[error("Column {column} is ambiguous between tables {tables:?}")]
    AmbiguousColumn { column: String, tables: Vec<String> },

    #[error("Operator {0:?} is not allowed")]
    OperatorNotAllowed(String),

    #[error("Value for {column} ({op}) must be {expected}")]
    InvalidValue {
        column: String,
        op: &'static str,
        expected: String,
    },

    #[error("Time window on {column}: {reason}")]
    InvalidTimeWindow { column: String, reason: String },

    #[error("Row limit {requested} is outside 1..={max}")]
    LimitOutOfBounds { requested: u32, max: u32 },

    #[error("Generated statement failed the shape check: {0}")]
    MalformedStatement(String),
}

// ============================================================================
// Query description types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Between,
    In,
    Contains,
}

impl FilterOp {
    /// Parse a wire operator. Symbolic spellings are accepted for the
    /// comparison operators.
    pub fn parse(op: &str) -> Option<Self> {
        match op.trim().to_ascii_lowercase().as_str() {
            "eq" | "=" | "==" => Some(FilterOp::Eq),
            "ne" | "!=" | "<>" => Some(FilterOp::Ne),
            "lt" | "<" => Some(FilterOp::Lt),
            "lte" | "<=" => Some(FilterOp::Lte),
            "gt" | ">" => Some(FilterOp::Gt),
            "gte" | ">=" => Some(FilterOp::Gte),
            "between" => Some(FilterOp::Between),
            "in" => Some(FilterOp::In),
            "contains" => Some(FilterOp::Contains),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Ne => "ne",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Between => "between",
            FilterOp::In => "in",
            FilterOp::Contains => "contains",
        }
    }

    fn sql_comparison(&self) -> Option<&'static str> {
        match self {
            FilterOp::Eq => Some("="),
            FilterOp::Ne => Some("<>"),
            FilterOp::Lt => Some("<"),
            FilterOp::Lte => Some("<="),
            FilterOp::Gt => Some(">"),
            FilterOp::Gte => Some(">="),
            _ => None,
        }
    }
}

/// A bound parameter. Untagged: every JSON string arrives as `Text` and keeps
/// its exact spelling; only date and timestamp columns parse it into an instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl ParamValue {
    fn describe(&self) -> String {
        match self {
            ParamValue::Boolean(b) => b.to_string(),
            ParamValue::Integer(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Timestamp(t) => t.to_rfc3339(),
            ParamValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Single(ParamValue),
    List(Vec<ParamValue>),
    Range { from: ParamValue, to: ParamValue },
}

/// `(column, operator, value)`; `column` is bare or `table.column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub column: String,
    #[serde(alias = "operator")]
    pub op: String,
    pub value: FilterValue,
}

impl FilterPredicate {
    pub fn new(column: impl Into<String>, op: impl Into<String>, value: FilterValue) -> Self {
        Self {
            column: column.into(),
            op: op.into(),
            value,
        }
    }
}

/// Half-open `[since, until)` window over a temporal column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub column: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub path: JoinPath,
    pub filters: Vec<FilterPredicate>,
    pub limit: Option<u32>,
    pub time_window: Option<TimeWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_limit: 200,
            max_limit: 1000,
        }
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedColumn {
    pub column: String,
    pub alias: String,
    pub semantic_type: SemanticType,
}

/// Columns of one path table in the result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableLayout {
    pub table: String,
    pub primary_key: String,
    pub columns: Vec<SelectedColumn>,
}

impl TableLayout {
    pub fn key_alias(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.column == self.primary_key)
            .map(|c| c.alias.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterizedQuery {
    pub sql: String,
    pub params: Vec<ParamValue>,
    /// One entry per path table, anchor first.
    pub layout: Vec<TableLayout>,
    pub limit: u32,
}

impl ParameterizedQuery {
    pub fn anchor(&self) -> &str {
        self.layout.first().map(|t| t.table.as_str()).unwrap_or_default()
    }

    pub fn table(&self, name: &str) -> Option<&TableLayout> {
        self.layout.iter().find(|t| t.table == name)
    }
}

// ============================================================================
// Builder
// ============================================================================

struct ResolvedColumn<'a> {
    table: &'a str,
    column: &'a str,
    semantic_type: SemanticType,
}

enum Condition {
    Compare(&'static str, ParamValue),
    Between(ParamValue, ParamValue),
    In(Vec<ParamValue>),
    Contains(String),
}

/// Validate `spec` against the catalog and render it.
pub fn build_query(
    catalog: &SchemaCatalog,
    spec: &QuerySpec,
    limits: QueryLimits,
) -> Result<ParameterizedQuery, UnsafeQueryError> {
    // 1. tables and joins
    let tables = spec.path.tables();
    for table in &tables {
        if !catalog.contains(table) {
            return Err(UnsafeQueryError::UnknownTable(table.to_string()));
        }
    }
    for edge in &spec.path.edges {
        if !catalog.has_relationship(&edge.from_table, &edge.from_column, &edge.to_table, &edge.to_column) {
            return Err(UnsafeQueryError::UndeclaredJoin {
                from: edge.from_table.clone(),
                from_column: edge.from_column.clone(),
                to: edge.to_table.clone(),
                to_column: edge.to_column.clone(),
            });
        }
    }

    // 2. columns
    let filter_columns = spec
        .filters
        .iter()
        .map(|f| resolve_column(catalog, &tables, &f.column))
        .collect::<Result<Vec<_>, _>>()?;
    let window_column = match &spec.time_window {
        Some(window) => {
            let resolved = resolve_column(catalog, &tables, &window.column)?;
            if !resolved.semantic_type.is_temporal() {
                return Err(UnsafeQueryError::InvalidTimeWindow {
                    column: window.column.clone(),
                    reason: format!("column is {}, not a date or timestamp", resolved.semantic_type.as_str()),
                });
            }
            Some(resolved)
        }
        None => None,
    };

    // 3. operators and operand shapes
    let mut conditions = Vec::with_capacity(spec.filters.len());
    for (filter, resolved) in spec.filters.iter().zip(&filter_columns) {
        let op = FilterOp::parse(&filter.op)
            .ok_or_else(|| UnsafeQueryError::OperatorNotAllowed(filter.op.clone()))?;
        conditions.push(check_operand(filter, op, resolved.semantic_type)?);
    }
    if let (Some(window), Some(_)) = (&spec.time_window, &window_column) {
        match (window.since, window.until) {
            (None, None) => {
                return Err(UnsafeQueryError::InvalidTimeWindow {
                    column: window.column.clone(),
                    reason: "neither since nor until is set".to_string(),
                })
            }
            (Some(since), Some(until)) if since >= until => {
                return Err(UnsafeQueryError::InvalidTimeWindow {
                    column: window.column.clone(),
                    reason: "since must be earlier than until".to_string(),
                })
            }
            _ => {}
        }
    }

    // 4. limit
    let limit = spec.limit.unwrap_or(limits.default_limit);
    if limit == 0 || limit > limits.max_limit {
        return Err(UnsafeQueryError::LimitOutOfBounds {
            requested: limit,
            max: limits.max_limit,
        });
    }

    let query = render(catalog, spec, &filter_columns, conditions, window_column.as_ref(), limit)?;
    check_shape(&query.sql)?;

    tracing::debug!(
        anchor = %spec.path.anchor,
        tables = query.layout.len(),
        params = query.params.len(),
        limit,
        "Query built"
    );
    Ok(query)
}

fn resolve_column<'a>(
    catalog: &'a SchemaCatalog,
    tables: &[&str],
    reference: &str,
) -> Result<ResolvedColumn<'a>, UnsafeQueryError> {
    let not_on_path = || UnsafeQueryError::ColumnNotOnPath(reference.to_string());

    if let Some((table, column)) = reference.split_once('.') {
        if !tables.contains(&table) {
            return Err(not_on_path());
        }
        let schema_table = catalog.table(table).ok_or_else(not_on_path)?;
        let def = schema_table.column(column).ok_or_else(not_on_path)?;
        return Ok(ResolvedColumn {
            table: &schema_table.name,
            column: &def.name,
            semantic_type: def.semantic_type,
        });
    }

    let mut found = Vec::new();
    for table in tables {
        if let Some(schema_table) = catalog.table(table) {
            if let Some(def) = schema_table.column(reference) {
                found.push(ResolvedColumn {
                    table: &schema_table.name,
                    column: &def.name,
                    semantic_type: def.semantic_type,
                });
            }
        }
    }
    match found.len() {
        0 => Err(not_on_path()),
        1 => Ok(found.remove(0)),
        _ => Err(UnsafeQueryError::AmbiguousColumn {
            column: reference.to_string(),
            tables: found.iter().map(|c| c.table.to_string()).collect(),
        }),
    }
}

fn check_operand(
    filter: &FilterPredicate,
    op: FilterOp,
    semantic_type: SemanticType,
) -> Result<Condition, UnsafeQueryError> {
    let invalid = |expected: &str| UnsafeQueryError::InvalidValue {
        column: filter.column.clone(),
        op: op.as_str(),
        expected: expected.to_string(),
    };
    let coerce = |v: &ParamValue| {
        coerce_param(v, semantic_type)
            .ok_or_else(|| invalid(&format!("a {} value", semantic_type.as_str())))
    };

    match (op, &filter.value) {
        (FilterOp::Between, FilterValue::Range { from, to }) => {
            Ok(Condition::Between(coerce(from)?, coerce(to)?))
        }
        (FilterOp::Between, _) => Err(invalid("a {\"from\", \"to\"} range")),
        (FilterOp::In, FilterValue::List(values)) => {
            if values.is_empty() || values.len() > MAX_IN_VALUES {
                return Err(invalid(&format!("a list of 1 to {MAX_IN_VALUES} values")));
            }
            Ok(Condition::In(values.iter().map(coerce).collect::<Result<_, _>>()?))
        }
        (FilterOp::In, _) => Err(invalid("a list")),
        (FilterOp::Contains, FilterValue::Single(ParamValue::Text(s))) if !s.is_empty() => {
            Ok(Condition::Contains(s.clone()))
        }
        (FilterOp::Contains, _) => Err(invalid("a non-empty text value")),
        (_, FilterValue::Single(v)) => {
            let cmp = op.sql_comparison().ok_or_else(|| invalid("a single value"))?;
            Ok(Condition::Compare(cmp, coerce(v)?))
        }
        (_, _) => Err(invalid("a single value")),
    }
}

/// Coerce a parameter to what the column's semantic type binds as.
/// Identifier and text columns compare as text.
fn coerce_param(value: &ParamValue, semantic_type: SemanticType) -> Option<ParamValue> {
    match semantic_type {
        SemanticType::Identifier | SemanticType::Text => match value {
            ParamValue::Text(_) => Some(value.clone()),
            other => Some(ParamValue::Text(other.describe())),
        },
        SemanticType::Integer => match value {
            ParamValue::Integer(_) => Some(value.clone()),
            ParamValue::Text(s) => s.trim().parse().ok().map(ParamValue::Integer),
            _ => None,
        },
        SemanticType::Decimal => match value {
            ParamValue::Float(_) => Some(value.clone()),
            ParamValue::Integer(i) => Some(ParamValue::Float(*i as f64)),
            ParamValue::Text(s) => s.trim().parse().ok().map(ParamValue::Float),
            _ => None,
        },
        SemanticType::Boolean => match value {
            ParamValue::Boolean(_) => Some(value.clone()),
            ParamValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(ParamValue::Boolean(true)),
                "false" => Some(ParamValue::Boolean(false)),
                _ => None,
            },
            _ => None,
        },
        SemanticType::Date | SemanticType::Timestamp => match value {
            ParamValue::Timestamp(_) => Some(value.clone()),
            ParamValue::Text(s) => parse_instant(s).map(ParamValue::Timestamp),
            _ => None,
        },
    }
}

/// RFC 3339, or a bare `YYYY-MM-DD` taken as midnight UTC.
fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn quote(table: &str, column: &str) -> String {
    format!("\"{table}\".\"{column}\"")
}

struct Binder {
    params: Vec<ParamValue>,
}

impl Binder {
    fn bind(&mut self, value: ParamValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }
}

fn render(
    catalog: &SchemaCatalog,
    spec: &QuerySpec,
    filter_columns: &[ResolvedColumn<'_>],
    conditions: Vec<Condition>,
    window_column: Option<&ResolvedColumn<'_>>,
    limit: u32,
) -> Result<ParameterizedQuery, UnsafeQueryError> {
    let mut layout = Vec::new();
    let mut select = Vec::new();
    let mut order_by = Vec::new();
    let mut aliases = std::collections::HashSet::new();

    for table in spec.path.tables() {
        let schema_table = catalog
            .table(table)
            .ok_or_else(|| UnsafeQueryError::UnknownTable(table.to_string()))?;
        let mut columns = Vec::with_capacity(schema_table.columns.len());
        for def in &schema_table.columns {
            let alias = format!("{}__{}", schema_table.name, def.name);
            if !aliases.insert(alias.clone()) {
                return Err(UnsafeQueryError::MalformedStatement(format!("duplicate column alias {alias}")));
            }
            select.push(format!("{}::text AS \"{}\"", quote(&schema_table.name, &def.name), alias));
            columns.push(SelectedColumn {
                column: def.name.clone(),
                alias,
                semantic_type: def.semantic_type,
            });
        }
        order_by.push(quote(&schema_table.name, &schema_table.primary_key));
        layout.push(TableLayout {
            table: schema_table.name.clone(),
            primary_key: schema_table.primary_key.clone(),
            columns,
        });
    }

    let mut sql = format!("SELECT {} FROM \"{}\"", select.join(", "), spec.path.anchor);
    for edge in &spec.path.edges {
        sql.push_str(&format!(
            " LEFT JOIN \"{}\" ON {} = {}",
            edge.to_table,
            quote(&edge.from_table, &edge.from_column),
            quote(&edge.to_table, &edge.to_column)
        ));
    }

    let mut binder = Binder { params: Vec::new() };
    let mut predicates = Vec::new();
    for (resolved, condition) in filter_columns.iter().zip(conditions) {
        let mut column = quote(resolved.table, resolved.column);
        if matches!(resolved.semantic_type, SemanticType::Identifier) {
            column.push_str("::text");
        }
        let predicate = match condition {
            Condition::Compare(cmp, value) => format!("{column} {cmp} {}", binder.bind(value)),
            Condition::Between(from, to) => {
                let from = binder.bind(from);
                let to = binder.bind(to);
                format!("{column} BETWEEN {from} AND {to}")
            }
            Condition::In(values) => {
                let placeholders: Vec<String> = values.into_iter().map(|v| binder.bind(v)).collect();
                format!("{column} IN ({})", placeholders.join(", "))
            }
            Condition::Contains(needle) => format!(
                "position(lower({}) in lower({}::text)) > 0",
                binder.bind(ParamValue::Text(needle)),
                quote(resolved.table, resolved.column)
            ),
        };
        predicates.push(predicate);
    }
    if let (Some(window), Some(resolved)) = (&spec.time_window, window_column) {
        let column = quote(resolved.table, resolved.column);
        if let Some(since) = window.since {
            predicates.push(format!("{column} >= {}", binder.bind(ParamValue::Timestamp(since))));
        }
        if let Some(until) = window.until {
            predicates.push(format!("{column} < {}", binder.bind(ParamValue::Timestamp(until))));
        }
    }
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    sql.push_str(" ORDER BY ");
    sql.push_str(&order_by.join(", "));
    let limit_placeholder = binder.bind(ParamValue::Integer(i64::from(limit)));
    sql.push_str(&format!(" LIMIT {limit_placeholder}"));

    Ok(ParameterizedQuery {
        sql,
        params: binder.params,
        layout,
        limit,
    })
}

fn shape_regex() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| {
        Regex::new(r#"^SELECT\s[^;]+\sFROM\s"[A-Za-z_][A-Za-z0-9_]*"(\s|$)"#).expect("static regex")
    })
}

/// A single `SELECT` statement, no terminators or comments.
fn check_shape(sql: &str) -> Result<(), UnsafeQueryError> {
    if !shape_regex().is_match(sql) {
        return Err(UnsafeQueryError::MalformedStatement("not a single SELECT".to_string()));
    }
    for marker in [";", "--", "/*", "*/"] {
        if sql.contains(marker) {
            return Err(UnsafeQueryError::MalformedStatement(format!("contains {marker:?}")));
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

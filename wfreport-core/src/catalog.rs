//! Schema catalog: typed table, column and relationship metadata
//!
//! The catalog is loaded once at startup from a static JSON definition and is
//! immutable afterwards; it is shared between requests behind an `Arc` without
//! locking.
//!
//! Relationships are declared on the table that owns the foreign-key column
//! but are traversable in both directions. `neighbors()` yields them in
//! declaration order (tables in definition order, relationships in the order
//! they are declared within each table), which is the tie-break order used by
//! the join resolver.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

/// Schema definition errors. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema definition {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed schema definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Schema definition declares no tables")]
    Empty,

    #[error("Duplicate table name: {0}")]
    DuplicateTable(String),

    #[error("Duplicate column {column} in table {table}")]
    DuplicateColumn { table: String, column: String },

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Primary key {column} is not a column of table {table}")]
    MissingPrimaryKey { table: String, column: String },

    #[error("Relationship on {table}.{column}: column is not declared by the table")]
    UnknownRelationshipColumn { table: String, column: String },

    #[error("Relationship on {table}.{column} references missing table {referenced}")]
    MissingReferencedTable {
        table: String,
        column: String,
        referenced: String,
    },

    #[error("Relationship on {table}.{column} references missing column {referenced_table}.{referenced_column}")]
    MissingReferencedColumn {
        table: String,
        column: String,
        referenced_table: String,
        referenced_column: String,
    },

    #[error("Schema introspection failed: {0}")]
    Introspection(#[from] sqlx::Error),
}

// ============================================================================
// Definition types
// ============================================================================

/// Semantic type of a column. Values are fetched as text and decoded with
/// [`SemanticType::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Identifier,
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Identifier => "identifier",
            SemanticType::Text => "text",
            SemanticType::Integer => "integer",
            SemanticType::Decimal => "decimal",
            SemanticType::Boolean => "boolean",
            SemanticType::Date => "date",
            SemanticType::Timestamp => "timestamp",
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, SemanticType::Date | SemanticType::Timestamp)
    }

    /// Decode the textual form of a column value into a typed JSON value.
    /// Values that do not parse as the declared type are kept as strings.
    pub fn decode(&self, raw: &str) -> serde_json::Value {
        match self {
            SemanticType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(serde_json::Value::from)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
            SemanticType::Decimal => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(raw.to_string())),
            SemanticType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "yes" => serde_json::Value::Bool(true),
                "f" | "false" | "0" | "no" => serde_json::Value::Bool(false),
                _ => serde_json::Value::String(raw.to_string()),
            },
            _ => serde_json::Value::String(raw.to_string()),
        }
    }

    /// Map an `information_schema.columns.data_type` value to a semantic type.
    pub fn from_sql_type(data_type: &str) -> Self {
        let t = data_type.to_ascii_lowercase();
        match t.as_str() {
            "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" => {
                SemanticType::Integer
            }
            "numeric" | "decimal" | "real" | "double precision" | "money" => SemanticType::Decimal,
            "boolean" | "bool" => SemanticType::Boolean,
            "date" => SemanticType::Date,
            "uuid" => SemanticType::Identifier,
            _ if t.starts_with("timestamp") => SemanticType::Timestamp,
            _ => SemanticType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

/// A foreign key declared on the owning table: `column -> references`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    pub column: String,
    pub references: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTable {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDefinition>,
}

impl SchemaTable {
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary-key and foreign-key columns carry provenance, not assertions.
    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key == name || self.relationships.iter().any(|r| r.column == name)
    }
}

/// The static, versioned document the catalog is loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub version: Option<String>,
    pub tables: Vec<SchemaTable>,
}

// ============================================================================
// Catalog
// ============================================================================

/// A declared relationship, indexed in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// One traversable step away from a table. `local_column` belongs to the table
/// `neighbors()` was called with; `remote_column` belongs to `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor<'a> {
    pub table: &'a str,
    pub local_column: &'a str,
    pub remote_column: &'a str,
    /// Position of the underlying relationship in declaration order.
    pub declared_at: usize,
}

#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    version: Option<String>,
    tables: Vec<SchemaTable>,
    index: HashMap<String, usize>,
    relationships: Vec<Relationship>,
    adjacency: HashMap<String, Vec<usize>>,
}

impl SchemaCatalog {
    /// Load and validate a JSON schema definition from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            version = catalog.version.as_deref().unwrap_or("unversioned"),
            tables = catalog.tables.len(),
            relationships = catalog.relationships.len(),
            "Schema catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        let definition: SchemaDefinition = serde_json::from_str(raw)?;
        Self::from_definition(definition)
    }

    pub fn from_definition(definition: SchemaDefinition) -> Result<Self, SchemaError> {
        if definition.tables.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut index = HashMap::new();
        for (i, table) in definition.tables.iter().enumerate() {
            ensure_identifier(&table.name)?;
            if index.insert(table.name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }

            let mut seen = std::collections::HashSet::new();
            for column in &table.columns {
                ensure_identifier(&column.name)?;
                if !seen.insert(column.name.as_str()) {
                    return Err(SchemaError::DuplicateColumn {
                        table: table.name.clone(),
                        column: column.name.clone(),
                    });
                }
            }

            if table.column(&table.primary_key).is_none() {
                return Err(SchemaError::MissingPrimaryKey {
                    table: table.name.clone(),
                    column: table.primary_key.clone(),
                });
            }
        }

        // Relationships are validated once every table is indexed so that
        // forward references resolve.
        let mut relationships = Vec::new();
        let mut adjacency: HashMap<String, Vec<usize>> = HashMap::new();
        for table in &definition.tables {
            for rel in &table.relationships {
                if table.column(&rel.column).is_none() {
                    return Err(SchemaError::UnknownRelationshipColumn {
                        table: table.name.clone(),
                        column: rel.column.clone(),
                    });
                }
                let referenced = index
                    .get(&rel.references.table)
                    .map(|&i| &definition.tables[i])
                    .ok_or_else(|| SchemaError::MissingReferencedTable {
                        table: table.name.clone(),
                        column: rel.column.clone(),
                        referenced: rel.references.table.clone(),
                    })?;
                if referenced.column(&rel.references.column).is_none() {
                    return Err(SchemaError::MissingReferencedColumn {
                        table: table.name.clone(),
                        column: rel.column.clone(),
                        referenced_table: rel.references.table.clone(),
                        referenced_column: rel.references.column.clone(),
                    });
                }

                let position = relationships.len();
                relationships.push(Relationship {
                    from_table: table.name.clone(),
                    from_column: rel.column.clone(),
                    to_table: rel.references.table.clone(),
                    to_column: rel.references.column.clone(),
                });
                adjacency.entry(table.name.clone()).or_default().push(position);
                if rel.references.table != table.name {
                    adjacency
                        .entry(rel.references.table.clone())
                        .or_default()
                        .push(position);
                }
            }
        }

        // Relationships were pushed table by table, so each adjacency list is
        // already ordered by declaration position; keep it explicit.
        for positions in adjacency.values_mut() {
            positions.sort_unstable();
        }

        Ok(Self {
            version: definition.version,
            tables: definition.tables,
            index,
            relationships,
            adjacency,
        })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.index.contains_key(table)
    }

    pub fn table(&self, name: &str) -> Option<&SchemaTable> {
        self.index.get(name).map(|&i| &self.tables[i])
    }

    /// Tables in definition order.
    pub fn tables(&self) -> impl Iterator<Item = &SchemaTable> {
        self.tables.iter()
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Every relationship touching `table`, in declaration order.
    pub fn neighbors(&self, table: &str) -> Vec<Neighbor<'_>> {
        let Some(positions) = self.adjacency.get(table) else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(positions.len());
        for &position in positions {
            let rel = &self.relationships[position];
            if rel.from_table == table {
                out.push(Neighbor {
                    table: &rel.to_table,
                    local_column: &rel.from_column,
                    remote_column: &rel.to_column,
                    declared_at: position,
                });
            }
            if rel.to_table == table && rel.from_table != table {
                out.push(Neighbor {
                    table: &rel.from_table,
                    local_column: &rel.to_column,
                    remote_column: &rel.from_column,
                    declared_at: position,
                });
            }
        }
        out
    }

    /// Whether `a.a_column = b.b_column` is a declared relationship (either direction).
    pub fn has_relationship(&self, a: &str, a_column: &str, b: &str, b_column: &str) -> bool {
        self.relationships.iter().any(|r| {
            (r.from_table == a && r.from_column == a_column && r.to_table == b && r.to_column == b_column)
                || (r.from_table == b
                    && r.from_column == b_column
                    && r.to_table == a
                    && r.to_column == a_column)
        })
    }

    /// Compact `table: column(type), ...` rendering for the reasoning context.
    pub fn prompt_summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.tables.len() + self.relationships.len());
        for table in &self.tables {
            let cols: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{}({})", c.name, c.semantic_type.as_str()))
                .collect();
            lines.push(format!(
                "{}: {} [pk={}]",
                table.name,
                cols.join(", "),
                table.primary_key
            ));
        }
        for rel in &self.relationships {
            lines.push(format!(
                "  {}.{} -> {}.{}",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column
            ));
        }
        lines.join("\n")
    }
}

/// ASCII identifier: a letter or underscore followed by letters, digits or underscores.
pub(crate) fn is_identifier(s: &str) -> bool {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
        .is_match(s)
}

fn ensure_identifier(s: &str) -> Result<(), SchemaError> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(s.to_string()))
    }
}

// ============================================================================
// Introspection
// ============================================================================

/// Build a schema definition from `information_schema` for an allow-list of
/// tables in `schema`. Tables without a single-column primary key are skipped;
/// foreign keys pointing outside the allow-list are dropped.
pub async fn introspect(
    pool: &PgPool,
    schema: &str,
    allowlist: &[String],
) -> Result<SchemaDefinition, SchemaError> {
    let columns = sqlx::query_as::<_, (String, String, String)>(
        r#"
        SELECT table_name::text, column_name::text, data_type::text
        FROM information_schema.columns
        WHERE table_schema = $1
          AND table_name = ANY($2)
        ORDER BY table_name, ordinal_position
        "#,
    )
    .bind(schema)
    .bind(allowlist)
    .fetch_all(pool)
    .await?;

    let primary_keys = sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT tc.table_name::text, kcu.column_name::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON tc.constraint_name = kcu.constraint_name
         AND tc.table_schema = kcu.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
          AND tc.table_schema = $1
          AND tc.table_name = ANY($2)
        ORDER BY tc.table_name, kcu.ordinal_position
        "#,
    )
    .bind(schema)
    .bind(allowlist)
    .fetch_all(pool)
    .await?;

    let foreign_keys = sqlx::query_as::<_, (String, String, String, String)>(
        r#"
        SELECT kcu.table_name::text, kcu.column_name::text,
               ccu.table_name::text, ccu.column_name::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON tc.constraint_name = kcu.constraint_name
         AND tc.table_schema = kcu.table_schema
        JOIN information_schema.constraint_column_usage ccu
          ON ccu.constraint_name = tc.constraint_name
         AND ccu.table_schema = tc.table_schema
        WHERE tc.constraint_type = 'FOREIGN KEY'
          AND tc.table_schema = $1
          AND tc.table_name = ANY($2)
        ORDER BY kcu.table_name, kcu.ordinal_position
        "#,
    )
    .bind(schema)
    .bind(allowlist)
    .fetch_all(pool)
    .await?;

    Ok(assemble_definition(allowlist, columns, primary_keys, foreign_keys))
}

fn assemble_definition(
    allowlist: &[String],
    columns: Vec<(String, String, String)>,
    primary_keys: Vec<(String, String)>,
    foreign_keys: Vec<(String, String, String, String)>,
) -> SchemaDefinition {
    let mut pk_columns: HashMap<String, Vec<String>> = HashMap::new();
    for (table, column) in primary_keys {
        pk_columns.entry(table).or_default().push(column);
    }

    let mut tables = Vec::new();
    for name in allowlist {
        let pk = match pk_columns.get(name).map(|v| v.as_slice()) {
            Some([single]) => single.clone(),
            Some(_) => {
                tracing::warn!(table = %name, "Skipping table with composite primary key");
                continue;
            }
            None => {
                tracing::warn!(table = %name, "Skipping table without primary key (or not found)");
                continue;
            }
        };

        let relationships: Vec<RelationshipDefinition> = foreign_keys
            .iter()
            .filter(|(t, _, referenced, _)| t == name && allowlist.contains(referenced))
            .map(|(_, column, referenced, referenced_column)| RelationshipDefinition {
                column: column.clone(),
                references: ColumnRef {
                    table: referenced.clone(),
                    column: referenced_column.clone(),
                },
            })
            .collect();

        let table_columns = columns
            .iter()
            .filter(|(t, _, _)| t == name)
            .map(|(_, column, data_type)| {
                let is_key = *column == pk || relationships.iter().any(|r| r.column == *column);
                ColumnDefinition {
                    name: column.clone(),
                    semantic_type: if is_key {
                        SemanticType::Identifier
                    } else {
                        SemanticType::from_sql_type(data_type)
                    },
                }
            })
            .collect();

        tables.push(SchemaTable {
            name: name.clone(),
            primary_key: pk,
            columns: table_columns,
            relationships,
        });
    }

    // Tables skipped above may still be referenced; drop those relationships too.
    let kept: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
    for table in &mut tables {
        table
            .relationships
            .retain(|r| kept.contains(&r.references.table));
    }

    SchemaDefinition {
        version: Some(chrono::Utc::now().format("introspected-%Y%m%d").to_string()),
        tables,
    }
}

// ============================================================================
// TESTS
// ============================================================================

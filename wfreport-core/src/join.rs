//! Join graph resolver: shortest join paths from an anchor table
//!
//! Breadth-first search over `SchemaCatalog::neighbors`. The first parent to
//! discover a table keeps it, so ties between equally short routes go to the
//! relationship declared first. The resolved path is the union of the BFS-tree
//! branches leading to each mentioned table, which makes it acyclic and
//! minimal per target.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::catalog::SchemaCatalog;
use crate::error::ReportError;

/// One traversal `from_table.from_column = to_table.to_column`. `from_table`
/// is always already on the path when the edge is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinEdge {
    pub from_table: String,
    pub to_table: String,
    pub from_column: String,
    pub to_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinPath {
    pub anchor: String,
    pub edges: Vec<JoinEdge>,
}

impl JoinPath {
    /// A path that covers only the anchor.
    pub fn anchor_only(anchor: impl Into<String>) -> Self {
        Self {
            anchor: anchor.into(),
            edges: Vec::new(),
        }
    }

    /// Anchor first, then each joined table in edge order.
    pub fn tables(&self) -> Vec<&str> {
        std::iter::once(self.anchor.as_str())
            .chain(self.edges.iter().map(|e| e.to_table.as_str()))
            .collect()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.anchor == table || self.edges.iter().any(|e| e.to_table == table)
    }

    /// Number of edges between the anchor and `table` along this path.
    pub fn depth_of(&self, table: &str) -> Option<usize> {
        if table == self.anchor {
            return Some(0);
        }
        let edge = self.edges.iter().find(|e| e.to_table == table)?;
        self.depth_of(&edge.from_table).map(|d| d + 1)
    }
}

/// Resolve the join path connecting `anchor` to every table in `mentioned`.
///
/// Unknown tables and tables with no route from the anchor both fail with
/// [`ReportError::UnreachableEntity`]. Duplicates and the anchor itself are
/// ignored in `mentioned`.
pub fn resolve_join_path(
    catalog: &SchemaCatalog,
    anchor: &str,
    mentioned: &[String],
) -> Result<JoinPath, ReportError> {
    if !catalog.contains(anchor) {
        return Err(ReportError::UnreachableEntity {
            anchor: anchor.to_string(),
            target: anchor.to_string(),
        });
    }

    let mut targets: Vec<&str> = Vec::new();
    for table in mentioned {
        let table = table.as_str();
        if table == anchor || targets.contains(&table) {
            continue;
        }
        if !catalog.contains(table) {
            return Err(ReportError::UnreachableEntity {
                anchor: anchor.to_string(),
                target: table.to_string(),
            });
        }
        targets.push(table);
    }

    if targets.is_empty() {
        tracing::debug!(anchor, "No mentioned tables; anchor-only path");
        return Ok(JoinPath::anchor_only(anchor));
    }

    // parent[t] = edge through which t was first discovered
    let mut parent: HashMap<&str, JoinEdge> = HashMap::new();
    let mut discovered: Vec<&str> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::from([anchor]);
    let mut queue: VecDeque<&str> = VecDeque::from([anchor]);
    let mut remaining = targets.len();

    'bfs: while let Some(current) = queue.pop_front() {
        for neighbor in catalog.neighbors(current) {
            if !visited.insert(neighbor.table) {
                continue;
            }
            parent.insert(
                neighbor.table,
                JoinEdge {
                    from_table: current.to_string(),
                    to_table: neighbor.table.to_string(),
                    from_column: neighbor.local_column.to_string(),
                    to_column: neighbor.remote_column.to_string(),
                },
            );
            discovered.push(neighbor.table);
            queue.push_back(neighbor.table);

            if targets.contains(&neighbor.table) {
                remaining -= 1;
                if remaining == 0 {
                    break 'bfs;
                }
            }
        }
    }

    let mut needed: HashSet<&str> = HashSet::new();
    for &target in &targets {
        if !parent.contains_key(target) {
            tracing::warn!(anchor, target, "No join path to mentioned table");
            return Err(ReportError::UnreachableEntity {
                anchor: anchor.to_string(),
                target: target.to_string(),
            });
        }
        let mut current = target;
        while current != anchor && needed.insert(current) {
            current = parent[current].from_table.as_str();
        }
    }

    // Discovery order guarantees every edge's from_table precedes it.
    let edges: Vec<JoinEdge> = discovered
        .iter()
        .filter(|t| needed.contains(*t))
        .map(|t| parent[t].clone())
        .collect();

    tracing::debug!(anchor, targets = targets.len(), edges = edges.len(), "Join path resolved");

    Ok(JoinPath {
        anchor: anchor.to_string(),
        edges,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDefinition, ColumnRef, RelationshipDefinition, SchemaDefinition, SchemaTable, SemanticType};
    use crate::fixtures::workflow_catalog;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// Table with an `id` key plus one identifier column per relationship.
    fn table(name: &str, rels: &[(&str, &str)]) -> SchemaTable {
        let mut columns = vec![ColumnDefinition {
            name: "id".to_string(),
            semantic_type: SemanticType::Identifier,
        }];
        let mut relationships = Vec::new();
        for (column, target) in rels {
            columns.push(ColumnDefinition {
                name: column.to_string(),
                semantic_type: SemanticType::Identifier,
            });
            relationships.push(RelationshipDefinition {
                column: column.to_string(),
                references: ColumnRef {
                    table: target.to_string(),
                    column: "id".to_string(),
                },
            });
        }
        SchemaTable {
            name: name.to_string(),
            primary_key: "id".to_string(),
            columns,
            relationships,
        }
    }

    /// Independent BFS distance over the raw relationship list.
    fn distance(catalog: &SchemaCatalog, from: &str, to: &str) -> Option<usize> {
        let mut dist: HashMap<String, usize> = HashMap::from([(from.to_string(), 0)]);
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(t) = queue.pop_front() {
            let d = dist[&t];
            for r in catalog.relationships() {
                let other = if r.from_table == t {
                    &r.to_table
                } else if r.to_table == t {
                    &r.from_table
                } else {
                    continue;
                };
                if !dist.contains_key(other) {
                    dist.insert(other.clone(), d + 1);
                    queue.push_back(other.clone());
                }
            }
        }
        dist.get(to).copied()
    }

    // ========================================================================
    // TEST 1: package -> instance resolves through package_id
    // ========================================================================
    #[test]
    fn test_package_to_instance() {
        let catalog = workflow_catalog();
        let path = resolve_join_path(&catalog, "package", &names(&["instance"])).unwrap();

        assert_eq!(path.anchor, "package");
        assert_eq!(
            path.edges,
            vec![JoinEdge {
                from_table: "package".into(),
                to_table: "instance".into(),
                from_column: "id".into(),
                to_column: "package_id".into(),
            }]
        );
    }

    // ========================================================================
    // TEST 2: no mentioned tables yields an anchor-only path
    // ========================================================================
    #[test]
    fn test_no_mentions_zero_edges() {
        let catalog = workflow_catalog();
        let path = resolve_join_path(&catalog, "package", &[]).unwrap();
        assert!(path.edges.is_empty());
        assert_eq!(path.tables(), vec!["package"]);

        // The anchor itself in the mention list changes nothing.
        let path = resolve_join_path(&catalog, "package", &names(&["package"])).unwrap();
        assert!(path.edges.is_empty());
    }

    // ========================================================================
    // TEST 3: isolated and unknown tables are unreachable
    // ========================================================================
    #[test]
    fn test_unreachable_table() {
        let catalog = workflow_catalog();
        let err = resolve_join_path(&catalog, "package", &names(&["template_config"])).unwrap_err();
        match err {
            ReportError::UnreachableEntity { anchor, target } => {
                assert_eq!(anchor, "package");
                assert_eq!(target, "template_config");
            }
            other => panic!("expected UnreachableEntity, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tables_are_unreachable() {
        let catalog = workflow_catalog();
        assert!(matches!(
            resolve_join_path(&catalog, "package", &names(&["ghost"])),
            Err(ReportError::UnreachableEntity { ref target, .. }) if target == "ghost"
        ));
        assert!(matches!(
            resolve_join_path(&catalog, "ghost", &[]),
            Err(ReportError::UnreachableEntity { .. })
        ));
    }

    // ========================================================================
    // TEST 4: multi-hop path follows the chain in order
    // ========================================================================
    #[test]
    fn test_multi_hop_path() {
        let catalog = workflow_catalog();
        let path = resolve_join_path(&catalog, "package", &names(&["portal_user"])).unwrap();

        assert_eq!(
            path.tables(),
            vec!["package", "instance", "workitem", "participant", "portal_user"]
        );
        assert_eq!(path.edges[1].from_column, "id");
        assert_eq!(path.edges[1].to_column, "instance_id");
        assert_eq!(path.edges[2].from_column, "participant_id");
        assert_eq!(path.edges[2].to_column, "id");
        assert_eq!(path.depth_of("portal_user"), Some(4));
    }

    // ========================================================================
    // TEST 5: shared prefixes are not duplicated
    // ========================================================================
    #[test]
    fn test_union_of_branches_shares_prefix() {
        let catalog = workflow_catalog();
        let path = resolve_join_path(
            &catalog,
            "package",
            &names(&["workitem", "instance", "workitem"]),
        )
        .unwrap();
        assert_eq!(path.edges.len(), 2);
        assert_eq!(path.tables(), vec!["package", "instance", "workitem"]);
    }

    // ========================================================================
    // TEST 6: equal-length routes resolve through the first declared relationship
    // ========================================================================
    #[test]
    fn test_tie_break_declaration_order() {
        // root <- left <- leaf and root <- right <- leaf; left is declared first.
        let def = SchemaDefinition {
            version: None,
            tables: vec![
                table("root", &[]),
                table("left", &[("root_id", "root")]),
                table("right", &[("root_id", "root")]),
                table("leaf", &[("left_id", "left"), ("right_id", "right")]),
            ],
        };
        let catalog = SchemaCatalog::from_definition(def).unwrap();
        let path = resolve_join_path(&catalog, "root", &names(&["leaf"])).unwrap();
        assert_eq!(path.tables(), vec!["root", "left", "leaf"]);

        // Reverse the declaration order and the other branch wins.
        let def = SchemaDefinition {
            version: None,
            tables: vec![
                table("root", &[]),
                table("right", &[("root_id", "root")]),
                table("left", &[("root_id", "root")]),
                table("leaf", &[("left_id", "left"), ("right_id", "right")]),
            ],
        };
        let catalog = SchemaCatalog::from_definition(def).unwrap();
        let path = resolve_join_path(&catalog, "root", &names(&["leaf"])).unwrap();
        assert_eq!(path.tables(), vec!["root", "right", "leaf"]);
    }

    // ========================================================================
    // TEST 7: every reachable pair resolves to an acyclic shortest path
    // ========================================================================
    #[test]
    fn test_paths_are_minimal_and_acyclic() {
        let catalog = workflow_catalog();
        let tables: Vec<String> = catalog.tables().map(|t| t.name.clone()).collect();

        for anchor in &tables {
            for target in &tables {
                let expected = distance(&catalog, anchor, target);
                let result = resolve_join_path(&catalog, anchor, std::slice::from_ref(target));
                match expected {
                    None => assert!(result.is_err(), "{anchor} -> {target} should be unreachable"),
                    Some(d) => {
                        let path = result.unwrap();
                        assert_eq!(path.depth_of(target), Some(d), "{anchor} -> {target}");
                        assert_eq!(path.edges.len(), d);

                        let visited = path.tables();
                        let unique: HashSet<&str> = visited.iter().copied().collect();
                        assert_eq!(unique.len(), visited.len(), "path revisits a table");

                        for (i, edge) in path.edges.iter().enumerate() {
                            assert!(catalog.has_relationship(
                                &edge.from_table,
                                &edge.from_column,
                                &edge.to_table,
                                &edge.to_column
                            ));
                            let earlier = edge.from_table == path.anchor
                                || path.edges[..i].iter().any(|e| e.to_table == edge.from_table);
                            assert!(earlier, "edge {i} starts from a table not yet on the path");
                        }
                    }
                }
            }
        }
    }
}

//! Shared workflow schema used by unit tests across the pipeline stages.

use crate::catalog::SchemaCatalog;

pub(crate) const WORKFLOW_SCHEMA: &str = r#"{
    "version": "fixture-1",
    "tables": [
        {
            "name": "package",
            "primary_key": "id",
            "columns": [
                { "name": "id", "type": "identifier" },
                { "name": "name", "type": "text" },
                { "name": "status", "type": "text" },
                { "name": "created_at", "type": "timestamp" }
            ]
        },
        {
            "name": "instance",
            "primary_key": "id",
            "columns": [
                { "name": "id", "type": "identifier" },
                { "name": "package_id", "type": "identifier" },
                { "name": "state", "type": "text" },
                { "name": "workitem_count", "type": "integer" },
                { "name": "started_at", "type": "timestamp" }
            ],
            "relationships": [
                { "column": "package_id", "references": { "table": "package", "column": "id" } }
            ]
        },
        {
            "name": "workitem",
            "primary_key": "id",
            "columns": [
                { "name": "id", "type": "identifier" },
                { "name": "instance_id", "type": "identifier" },
                { "name": "participant_id", "type": "identifier" },
                { "name": "title", "type": "text" },
                { "name": "status", "type": "text" },
                { "name": "due_date", "type": "date" }
            ],
            "relationships": [
                { "column": "instance_id", "references": { "table": "instance", "column": "id" } },
                { "column": "participant_id", "references": { "table": "participant", "column": "id" } }
            ]
        },
        {
            "name": "participant",
            "primary_key": "id",
            "columns": [
                { "name": "id", "type": "identifier" },
                { "name": "user_id", "type": "identifier" },
                { "name": "role", "type": "text" }
            ],
            "relationships": [
                { "column": "user_id", "references": { "table": "portal_user", "column": "id" } }
            ]
        },
        {
            "name": "portal_user",
            "primary_key": "id",
            "columns": [
                { "name": "id", "type": "identifier" },
                { "name": "display_name", "type": "text" },
                { "name": "active", "type": "boolean" }
            ]
        },
        {
            "name": "template_config",
            "primary_key": "id",
            "columns": [
                { "name": "id", "type": "identifier" },
                { "name": "name", "type": "text" }
            ]
        }
    ]
}"#;

pub(crate) fn workflow_catalog() -> SchemaCatalog {
    SchemaCatalog::from_json(WORKFLOW_SCHEMA).expect("fixture schema is valid")
}

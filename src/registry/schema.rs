//! Database schema for registry.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const CANDIDATES_TABLE_V0: Table = Table {
    name: "candidates",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("source", &SqlType::Text, non_null = true),
        sqlite_column!("external_ref", &SqlType::Text, non_null = true),
        sqlite_column!("title", &SqlType::Text),
        sqlite_column!("size_hint", &SqlType::Integer),
        sqlite_column!("width", &SqlType::Integer),
        sqlite_column!("height", &SqlType::Integer),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("content_hash", &SqlType::Text),
        // 16 hex digits, a u64 does not fit SQLite's signed INTEGER
        sqlite_column!("perceptual_hash", &SqlType::Text),
        sqlite_column!("committed_bytes", &SqlType::Integer),
        sqlite_column!("local_path", &SqlType::Text),
        sqlite_column!("duplicate_of", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!(
            "retry_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("next_attempt_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_candidates_claim", "source, status, created_at"),
        ("idx_candidates_status_updated", "status, updated_at"),
        ("idx_candidates_content_hash", "content_hash"),
    ],
    unique_constraints: &[&["source", "external_ref"]],
};

const MANIFESTS_TABLE_V0: Table = Table {
    name: "manifests",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("source", &SqlType::Text, non_null = true),
        sqlite_column!("external_ref", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!(
            "retry_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("candidates_created", &SqlType::Integer),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!("next_attempt_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_manifests_claim", "status, created_at"),
        ("idx_manifests_source", "source, status"),
    ],
    unique_constraints: &[&["source", "external_ref"]],
};

pub const REGISTRY_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[CANDIDATES_TABLE_V0, MANIFESTS_TABLE_V0],
    migration: None,
}];

//! Table catalog and DDL.
//!
//! Every identifier that ends up in dynamic SQL comes from the static catalog
//! below; nothing caller-supplied is interpolated without passing
//! `is_valid_identifier` and a catalog lookup first.

use crate::domain::{partition_name, PartitionBounds, PeriodKind};

/// Tables that are not partitioned
pub const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    parent_table TEXT NOT NULL,
    period_start INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    period_kind TEXT NOT NULL,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (parent_table, period_start)
);

CREATE TABLE IF NOT EXISTS processing_state (
    call_uid TEXT PRIMARY KEY,
    status TEXT NOT NULL
        CHECK (status IN ('queued', 'downloaded', 'transcribed', 'indexed', 'error')),
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK (retry_count >= 0 AND retry_count <= max_retries)
);

CREATE INDEX IF NOT EXISTS idx_processing_state_status
    ON processing_state(status, updated_at);

CREATE TABLE IF NOT EXISTS state_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    call_uid TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    error TEXT,
    at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_state_transitions_call
    ON state_transitions(call_uid, id);

CREATE INDEX IF NOT EXISTS idx_state_transitions_at
    ON state_transitions(at);

CREATE TABLE IF NOT EXISTS retention_policies (
    table_name TEXT PRIMARY KEY,
    retention_days INTEGER NOT NULL CHECK (retention_days >= 0),
    partition_column TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_cleanup_at INTEGER
);

CREATE TABLE IF NOT EXISTS geocode_cache (
    query_hash TEXT PRIMARY KEY,
    query_text TEXT NOT NULL,
    bias_city TEXT,
    bias_state TEXT,
    bias_country TEXT,
    latitude REAL,
    longitude REAL,
    confidence REAL,
    formatted_address TEXT,
    hit_count INTEGER NOT NULL DEFAULT 0,
    last_hit_at INTEGER,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_geocode_cache_expires
    ON geocode_cache(expires_at);
"#;

/// A logical table stored as one physical table per period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionedTable {
    pub name: &'static str,
    pub period: PeriodKind,
    /// Column the partition bounds apply to
    pub partition_column: &'static str,
    /// Periods ahead of "now" kept ready by maintenance
    pub lookahead: u32,
    /// Column definitions (without the bounds CHECK)
    pub columns: &'static str,
    /// `(suffix, column list)`; index name is `{partition}_{suffix}`
    pub indexes: &'static [(&'static str, &'static str)],
    /// `(table, column)` pairs holding a key of this table that must go with it
    pub dependents: &'static [(&'static str, &'static str)],
    /// Key column referenced by `dependents`
    pub key_column: &'static str,
}

impl PartitionedTable {
    /// Whether `column` is one of this table's declared columns
    pub fn has_column(&self, column: &str) -> bool {
        self.columns
            .split(',')
            .filter_map(|def| def.split_whitespace().next())
            .any(|name| name == column)
    }
}

pub const CALLS: PartitionedTable = PartitionedTable {
    name: "calls",
    period: PeriodKind::Month,
    partition_column: "started_at",
    lookahead: 1,
    columns: "call_uid TEXT NOT NULL PRIMARY KEY,
    group_id TEXT,
    feed_id INTEGER,
    tg_id INTEGER,
    playlist_uuid TEXT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    duration_ms INTEGER,
    url TEXT NOT NULL,
    size_bytes INTEGER,
    raw_json TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    processing_stage TEXT NOT NULL DEFAULT 'pending',
    picked_at INTEGER,
    last_attempt INTEGER,
    fetched_at INTEGER NOT NULL",
    indexes: &[
        ("stage", "processing_stage, fetched_at"),
        ("group", "group_id"),
    ],
    dependents: &[("processing_state", "call_uid")],
    key_column: "call_uid",
};

pub const API_CALL_METRICS: PartitionedTable = PartitionedTable {
    name: "api_call_metrics",
    period: PeriodKind::Week,
    partition_column: "recorded_at",
    lookahead: 1,
    columns: "id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL,
    status_code INTEGER,
    duration_ms INTEGER NOT NULL,
    response_size INTEGER,
    error TEXT,
    recorded_at INTEGER NOT NULL",
    indexes: &[("endpoint", "endpoint, recorded_at")],
    dependents: &[],
    key_column: "id",
};

pub const SYSTEM_LOGS: PartitionedTable = PartitionedTable {
    name: "system_logs",
    period: PeriodKind::Day,
    partition_column: "logged_at",
    lookahead: 3,
    columns: "id INTEGER PRIMARY KEY AUTOINCREMENT,
    component TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    logged_at INTEGER NOT NULL",
    indexes: &[("component", "component, logged_at")],
    dependents: &[],
    key_column: "id",
};

pub const PARTITIONED_TABLES: &[PartitionedTable] = &[CALLS, API_CALL_METRICS, SYSTEM_LOGS];

/// Unpartitioned tables a retention policy may target, with their time columns
pub const PLAIN_TABLES: &[(&str, &[&str])] = &[
    ("geocode_cache", &["expires_at", "created_at", "last_hit_at"]),
    ("state_transitions", &["at"]),
];

pub fn partitioned_table(name: &str) -> Option<&'static PartitionedTable> {
    PARTITIONED_TABLES.iter().find(|t| t.name == name)
}

/// Catalog name and time columns of a plain table
pub fn plain_table(name: &str) -> Option<(&'static str, &'static [&'static str])> {
    PLAIN_TABLES.iter().find(|(table, _)| *table == name).copied()
}

/// Non-empty ASCII `[A-Za-z0-9_]`
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// DDL for one partition of a catalog table
#[derive(Debug, Clone)]
pub struct PartitionDdl {
    pub table: &'static PartitionedTable,
    pub bounds: PartitionBounds,
    pub name: String,
}

impl PartitionDdl {
    pub fn new(table: &'static PartitionedTable, bounds: PartitionBounds) -> Self {
        Self {
            table,
            bounds,
            name: partition_name(table.name, bounds.start),
        }
    }

    /// Statements creating the partition and its indexes; all idempotent
    pub fn statements(&self) -> Vec<String> {
        let mut statements = Vec::with_capacity(1 + self.table.indexes.len());

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (\n    {columns},\n    CHECK ({col} >= {start} AND {col} < {end})\n)",
            name = self.name,
            columns = self.table.columns,
            col = self.table.partition_column,
            start = self.bounds.start.timestamp_millis(),
            end = self.bounds.end.timestamp_millis(),
        ));

        for (suffix, cols) in self.table.indexes {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS \"{name}_{suffix}\" ON \"{name}\"({cols})",
                name = self.name,
                suffix = suffix,
                cols = cols,
            ));
        }

        statements
    }

    pub fn drop_statement(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\"", self.name)
    }
}

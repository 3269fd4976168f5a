/// SQL DDL for the keel state database.
///
/// Timestamps are stored as fixed-width RFC 3339 UTC text and JSON blobs as
/// TEXT. Every table is scoped by stack name so one database can hold many
/// stacks.

pub const SCHEMA_VERSION: i32 = 3;

pub const CREATE_TABLES_SQL: &str = "
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT
);

-- Last-applied state per logical resource
CREATE TABLE IF NOT EXISTS resources (
    stack TEXT NOT NULL,
    id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    provider_id TEXT,
    properties_json TEXT NOT NULL DEFAULT '{}',
    resolved_json TEXT NOT NULL DEFAULT '{}',
    attributes_json TEXT NOT NULL DEFAULT '{}',
    dependencies_json TEXT NOT NULL DEFAULT '[]',
    deletion_policy TEXT NOT NULL DEFAULT 'delete',
    status TEXT NOT NULL DEFAULT 'pending',
    fingerprint TEXT NOT NULL DEFAULT '',
    error_message TEXT,
    format_version INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (stack, id)
);

-- Single-writer lease per stack
CREATE TABLE IF NOT EXISTS leases (
    stack TEXT PRIMARY KEY,
    lease_id TEXT NOT NULL UNIQUE,
    holder TEXT NOT NULL,
    operation TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Stack outputs as last evaluated
CREATE TABLE IF NOT EXISTS outputs (
    stack TEXT NOT NULL,
    name TEXT NOT NULL,
    value_json TEXT,
    description TEXT,
    PRIMARY KEY (stack, name)
);

-- Execution runs
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    stack TEXT NOT NULL,
    operation TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    planned INTEGER NOT NULL DEFAULT 0,
    succeeded INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0
);

-- Per-operation results within a run
CREATE TABLE IF NOT EXISTS run_operations (
    run_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    resource_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    outcome TEXT NOT NULL,
    message TEXT,
    PRIMARY KEY (run_id, sequence),
    FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
);
";

pub const CREATE_INDEXES_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_resources_status ON resources(stack, status);
CREATE INDEX IF NOT EXISTS idx_runs_stack ON runs(stack, started_at);
CREATE INDEX IF NOT EXISTS idx_run_operations_run ON run_operations(run_id);
";

/// Version 1 stored records without a fingerprint or resolved properties.
pub const MIGRATE_V1_TO_V2_SQL: &str = "
ALTER TABLE resources ADD COLUMN fingerprint TEXT NOT NULL DEFAULT '';
ALTER TABLE resources ADD COLUMN resolved_json TEXT NOT NULL DEFAULT '{}';
";

/// Version 2 had no per-record deletion policy; existing records keep the
/// default of deleting through the provider.
pub const MIGRATE_V2_TO_V3_SQL: &str = "
ALTER TABLE resources ADD COLUMN deletion_policy TEXT NOT NULL DEFAULT 'delete';
";

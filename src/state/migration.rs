use anyhow::Result;
use rusqlite::{params, Connection};

use super::models::timestamp;
use super::schema;
use crate::error::EngineError;

/// Check and apply migrations for the SQLite backend.
pub fn check_and_migrate(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)?;

    if !table_exists {
        // Fresh install: apply full schema
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)?;
        record_version(conn, schema::SCHEMA_VERSION, "Initial schema")?;
        return Ok(());
    }

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version > schema::SCHEMA_VERSION {
        return Err(EngineError::State(format!(
            "database schema version {} is newer than this build supports ({})",
            current_version,
            schema::SCHEMA_VERSION
        ))
        .into());
    }

    if current_version < schema::SCHEMA_VERSION {
        apply_migrations(conn, current_version)?;
    }

    Ok(())
}

fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    if from_version < 1 {
        // Version table exists but is empty: nothing was ever stored
        conn.execute_batch(schema::CREATE_TABLES_SQL)?;
        conn.execute_batch(schema::CREATE_INDEXES_SQL)?;
        record_version(conn, schema::SCHEMA_VERSION, "Initial schema")?;
        return Ok(());
    }

    if from_version < 2 {
        conn.execute_batch(schema::MIGRATE_V1_TO_V2_SQL)?;
        record_version(conn, 2, "Record fingerprints and resolved properties")?;
    }
    if from_version < 3 {
        conn.execute_batch(schema::MIGRATE_V2_TO_V3_SQL)?;
        record_version(conn, 3, "Per-record deletion policy")?;
    }

    // Tables added since the stored version
    conn.execute_batch(schema::CREATE_TABLES_SQL)?;
    conn.execute_batch(schema::CREATE_INDEXES_SQL)?;
    tracing::info!(
        from = from_version,
        to = schema::SCHEMA_VERSION,
        "Migrated state database"
    );
    Ok(())
}

fn record_version(conn: &Connection, version: i32, description: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        params![version, timestamp(chrono::Utc::now()), description],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1_SQL: &str = "
        CREATE TABLE schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );
        CREATE TABLE resources (
            stack TEXT NOT NULL,
            id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            provider_id TEXT,
            properties_json TEXT NOT NULL DEFAULT '{}',
            attributes_json TEXT NOT NULL DEFAULT '{}',
            dependencies_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            format_version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (stack, id)
        );
        INSERT INTO schema_version VALUES (1, '2024-01-01T00:00:00.000000Z', 'Initial schema');
        INSERT INTO resources (stack, id, resource_type, provider_id, status, created_at, updated_at)
        VALUES ('dev', 'net', 'network', 'network-1', 'applied',
                '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z');
    ";

    #[test]
    fn fresh_database_gets_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        check_and_migrate(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn v1_database_is_migrated_in_place() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_SQL).unwrap();

        check_and_migrate(&conn).unwrap();

        let (fingerprint, resolved, policy): (String, String, String) = conn
            .query_row(
                "SELECT fingerprint, resolved_json, deletion_policy FROM resources WHERE id = 'net'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(fingerprint, "");
        assert_eq!(resolved, "{}");
        assert_eq!(policy, "delete");
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 3);

        let leases: i64 = conn
            .query_row("SELECT COUNT(*) FROM leases", [], |r| r.get(0))
            .unwrap();
        assert_eq!(leases, 0);

        // Running again is a no-op
        check_and_migrate(&conn).unwrap();
    }

    #[test]
    fn newer_database_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        check_and_migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (99, 'x')",
            [],
        )
        .unwrap();
        let err = check_and_migrate(&conn).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::backend::StateBackend;
use super::migration;
use super::models::*;
use crate::error::EngineError;

/// SQLite-backed state store.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the SQLite state database.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open state database at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::State("connection mutex poisoned".to_string()).into())
    }
}

fn now() -> String {
    timestamp(Utc::now())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp in state: {}", raw))?
        .with_timezone(&Utc))
}

fn ttl_to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).context("Lease TTL out of range")
}

/// Writes are only allowed under the current, unexpired lease.
fn check_lease(conn: &Connection, lease: &Lease) -> Result<()> {
    let expires_at: Option<String> = conn
        .query_row(
            "SELECT expires_at FROM leases WHERE stack = ?1 AND lease_id = ?2",
            params![lease.stack, lease.lease_id],
            |row| row.get(0),
        )
        .optional()?;
    match expires_at {
        Some(expiry) if expiry > now() => Ok(()),
        _ => Err(EngineError::LeaseLost {
            stack: lease.stack.clone(),
            lease_id: lease.lease_id.clone(),
        }
        .into()),
    }
}

/// Open a write transaction that holds SQLite's write lock before the lease
/// is checked, so no other connection can reclaim the lease in between.
fn leased_transaction<'c>(conn: &'c mut Connection, lease: &Lease) -> Result<Transaction<'c>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    check_lease(&tx, lease)?;
    Ok(tx)
}

fn read_lease(conn: &Connection, stack: &str) -> Result<Option<Lease>> {
    let row: Option<(String, String, String, String, String, String)> = conn
        .query_row(
            "SELECT stack, lease_id, holder, operation, acquired_at, expires_at
             FROM leases WHERE stack = ?1",
            params![stack],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;
    row.map(|(stack, lease_id, holder, operation, acquired, expires)| -> Result<Lease> {
        Ok(Lease {
            lease_id,
            stack,
            holder,
            operation,
            acquired_at: parse_time(&acquired)?,
            expires_at: parse_time(&expires)?,
        })
    })
    .transpose()
}

fn write_record(conn: &Connection, stack: &str, record: &StateRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO resources
            (stack, id, resource_type, provider_id, properties_json, resolved_json,
             attributes_json, dependencies_json, deletion_policy, status, fingerprint,
             error_message, format_version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            stack,
            record.id,
            record.resource_type,
            record.provider_id,
            serde_json::to_string(&record.properties)?,
            serde_json::to_string(&record.resolved)?,
            serde_json::to_string(&record.attributes)?,
            serde_json::to_string(&record.dependencies)?,
            record.deletion_policy.as_str(),
            record.status.as_str(),
            record.fingerprint,
            record.error,
            RECORD_FORMAT_VERSION,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

const RECORD_COLUMNS: &str = "id, resource_type, provider_id, properties_json, resolved_json,
    attributes_json, dependencies_json, deletion_policy, status, fingerprint, error_message,
    format_version, created_at, updated_at";

/// A resources row before its JSON columns are decoded.
struct RecordRow {
    id: String,
    resource_type: String,
    provider_id: Option<String>,
    properties_json: String,
    resolved_json: String,
    attributes_json: String,
    dependencies_json: String,
    deletion_policy: String,
    status: String,
    fingerprint: String,
    error: Option<String>,
    format_version: u32,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            resource_type: row.get(1)?,
            provider_id: row.get(2)?,
            properties_json: row.get(3)?,
            resolved_json: row.get(4)?,
            attributes_json: row.get(5)?,
            dependencies_json: row.get(6)?,
            deletion_policy: row.get(7)?,
            status: row.get(8)?,
            fingerprint: row.get(9)?,
            error: row.get(10)?,
            format_version: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<StateRecord> {
        let context = || format!("Corrupt state record '{}'", self.id);
        let mut record = StateRecord {
            properties: serde_json::from_str(&self.properties_json).with_context(context)?,
            resolved: serde_json::from_str(&self.resolved_json).with_context(context)?,
            attributes: serde_json::from_str(&self.attributes_json).with_context(context)?,
            dependencies: serde_json::from_str::<BTreeSet<String>>(&self.dependencies_json)
                .with_context(context)?,
            deletion_policy: self
                .deletion_policy
                .parse()
                .map_err(EngineError::State)
                .with_context(context)?,
            status: self.status.parse()?,
            provider_id: self.provider_id,
            fingerprint: self.fingerprint,
            error: self.error,
            format_version: self.format_version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            resource_type: self.resource_type,
            id: self.id,
        };
        if record.format_version < RECORD_FORMAT_VERSION {
            // Older layouts carried no fingerprint
            record.refresh_fingerprint();
            record.format_version = RECORD_FORMAT_VERSION;
        }
        Ok(record)
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    // ─── Initialization ─────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        migration::check_and_migrate(&conn)
    }

    // ─── Records ────────────────────────────────────────────────────────────

    async fn load_records(&self, stack: &str) -> Result<BTreeMap<String, StateRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resources WHERE stack = ?1 ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![stack], RecordRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|row| row.into_record().map(|r| (r.id.clone(), r)))
            .collect()
    }

    async fn get_record(&self, stack: &str, id: &str) -> Result<Option<StateRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM resources WHERE stack = ?1 AND id = ?2",
                    RECORD_COLUMNS
                ),
                params![stack, id],
                RecordRow::from_row,
            )
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    async fn put_record(&self, lease: &Lease, record: &StateRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = leased_transaction(&mut conn, lease)?;
        write_record(&tx, &lease.stack, record)?;
        tx.commit()?;
        Ok(())
    }

    async fn remove_record(&self, lease: &Lease, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = leased_transaction(&mut conn, lease)?;
        let removed = tx.execute(
            "DELETE FROM resources WHERE stack = ?1 AND id = ?2",
            params![lease.stack, id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    async fn replace_all(&self, lease: &Lease, records: &[StateRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = leased_transaction(&mut conn, lease)?;
        tx.execute("DELETE FROM resources WHERE stack = ?1", params![lease.stack])?;
        for record in records {
            write_record(&tx, &lease.stack, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ─── Leases ─────────────────────────────────────────────────────────────

    async fn acquire_lease(
        &self,
        stack: &str,
        holder: &str,
        operation: &str,
        ttl: Duration,
    ) -> Result<Lease> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now();
        if let Some(existing) = read_lease(&tx, stack)? {
            if !existing.is_expired(now) {
                return Err(EngineError::LockContention {
                    stack: stack.to_string(),
                    holder: existing.holder,
                    lease_id: existing.lease_id,
                    expires_at: timestamp(existing.expires_at),
                }
                .into());
            }
            tracing::warn!(
                stack,
                holder = %existing.holder,
                lease_id = %existing.lease_id,
                "Reclaiming expired lease"
            );
            tx.execute("DELETE FROM leases WHERE stack = ?1", params![stack])?;
        }

        let lease = Lease {
            lease_id: uuid::Uuid::new_v4().to_string(),
            stack: stack.to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + ttl_to_chrono(ttl)?,
        };
        tx.execute(
            "INSERT INTO leases (stack, lease_id, holder, operation, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lease.stack,
                lease.lease_id,
                lease.holder,
                lease.operation,
                timestamp(lease.acquired_at),
                timestamp(lease.expires_at),
            ],
        )?;
        tx.commit()?;
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let mut conn = self.conn()?;
        let tx = leased_transaction(&mut conn, lease)?;
        let mut renewed = lease.clone();
        renewed.expires_at = Utc::now() + ttl_to_chrono(ttl)?;
        tx.execute(
            "UPDATE leases SET expires_at = ?1 WHERE stack = ?2 AND lease_id = ?3",
            params![timestamp(renewed.expires_at), lease.stack, lease.lease_id],
        )?;
        tx.commit()?;
        Ok(renewed)
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM leases WHERE stack = ?1 AND lease_id = ?2",
            params![lease.stack, lease.lease_id],
        )?;
        Ok(())
    }

    async fn current_lease(&self, stack: &str) -> Result<Option<Lease>> {
        let conn = self.conn()?;
        read_lease(&conn, stack)
    }

    async fn force_unlock(&self, stack: &str) -> Result<Option<Lease>> {
        let conn = self.conn()?;
        let existing = read_lease(&conn, stack)?;
        conn.execute("DELETE FROM leases WHERE stack = ?1", params![stack])?;
        Ok(existing)
    }

    // ─── Outputs ────────────────────────────────────────────────────────────

    async fn set_outputs(&self, lease: &Lease, outputs: &[OutputValue]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = leased_transaction(&mut conn, lease)?;
        tx.execute("DELETE FROM outputs WHERE stack = ?1", params![lease.stack])?;
        for output in outputs {
            let value = output.value.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO outputs (stack, name, value_json, description) VALUES (?1, ?2, ?3, ?4)",
                params![lease.stack, output.name, value, output.description],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_outputs(&self, stack: &str) -> Result<Vec<OutputValue>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, value_json, description FROM outputs WHERE stack = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![stack], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(name, value, description)| -> Result<OutputValue> {
                let value = value.map(|v| serde_json::from_str(&v)).transpose()?;
                Ok(OutputValue {
                    name,
                    value,
                    description,
                })
            })
            .collect()
    }

    // ─── Runs ───────────────────────────────────────────────────────────────

    async fn start_run(&self, lease: &Lease, operation: &str, planned: usize) -> Result<String> {
        let mut conn = self.conn()?;
        let tx = leased_transaction(&mut conn, lease)?;
        let id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO runs (id, stack, operation, started_at, status, planned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                lease.stack,
                operation,
                now(),
                run_status::RUNNING,
                planned as i64
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }

    async fn record_operation(&self, run_id: &str, operation: &OperationRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO run_operations
                (run_id, sequence, resource_id, operation, outcome, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                operation.sequence,
                operation.resource_id,
                operation.operation,
                operation.outcome,
                operation.message,
            ],
        )?;
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: &str,
        status: &str,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE runs SET completed_at = ?1, status = ?2, succeeded = ?3, failed = ?4, skipped = ?5
             WHERE id = ?6",
            params![
                now(),
                status,
                succeeded as i64,
                failed as i64,
                skipped as i64,
                run_id
            ],
        )?;
        Ok(())
    }

    async fn list_runs(&self, stack: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, stack, operation, started_at, completed_at, status,
                    planned, succeeded, failed, skipped
             FROM runs WHERE stack = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![stack, limit as i64], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    stack: row.get(1)?,
                    operation: row.get(2)?,
                    started_at: row.get(3)?,
                    completed_at: row.get(4)?,
                    status: row.get(5)?,
                    planned: row.get(6)?,
                    succeeded: row.get(7)?,
                    failed: row.get(8)?,
                    skipped: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn list_run_operations(&self, run_id: &str) -> Result<Vec<OperationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sequence, resource_id, operation, outcome, message
             FROM run_operations WHERE run_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(OperationRecord {
                    sequence: row.get(0)?,
                    resource_id: row.get(1)?,
                    operation: row.get(2)?,
                    outcome: row.get(3)?,
                    message: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

//! Durable instance records in SQLite.
//!
//! One row per client key. Every statement runs under the connection mutex,
//! so each operation is atomic with respect to a single key; concurrent
//! inserts for the same key are resolved by the primary-key constraint and
//! the loser gets [`Error::DuplicateKey`].

use crate::error::{Error, Result};
use crate::instance::{InstanceRecord, Phase};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS instances (
    client_key     TEXT PRIMARY KEY,
    instance_id    TEXT NOT NULL,
    port           INTEGER NOT NULL,
    pid            INTEGER NOT NULL,
    created_at     INTEGER NOT NULL,
    expires_at     INTEGER NOT NULL,
    phase          TEXT NOT NULL,
    waited_seconds INTEGER NOT NULL DEFAULT 0
)";

const SELECT_COLUMNS: &str =
    "client_key, instance_id, port, pid, created_at, expires_at, phase, waited_seconds";

/// Keyed store of active instances.
///
/// `Clone` shares the same connection.
#[derive(Clone)]
pub struct InstanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl InstanceStore {
    /// Opens or creates the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Store(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Non-durable store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Store(format!("connection lock poisoned: {}", e)))
    }

    pub fn exists(&self, client_key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM instances WHERE client_key = ?1",
                params![client_key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a new record. Never overwrites.
    pub fn create(&self, record: &InstanceRecord) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO instances (client_key, instance_id, port, pid, created_at, expires_at, phase, waited_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.client_key,
                record.instance_id,
                record.port,
                record.pid,
                record.created_at.timestamp_millis(),
                record.expires_at.timestamp_millis(),
                record.phase.as_str(),
                record.waited_seconds,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
                    && e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(Error::DuplicateKey {
                    client: record.client_key.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, client_key: &str) -> Result<InstanceRecord> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM instances WHERE client_key = ?1", SELECT_COLUMNS);
        let row = conn
            .query_row(&sql, params![client_key], read_row)
            .optional()?;
        row.ok_or_else(|| Error::not_found(client_key))
    }

    /// Move the record to `phase`. Backward or repeated moves are ignored.
    pub fn update_phase(&self, client_key: &str, phase: Phase) -> Result<()> {
        let conn = self.conn()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT phase FROM instances WHERE client_key = ?1",
                params![client_key],
                |row| row.get(0),
            )
            .optional()?;
        let current: Phase = current
            .ok_or_else(|| Error::not_found(client_key))?
            .parse()
            .map_err(Error::Store)?;
        if !current.can_advance_to(phase) {
            debug!(client = %client_key, from = %current, to = %phase, "Ignoring non-forward phase change");
            return Ok(());
        }
        conn.execute(
            "UPDATE instances SET phase = ?2 WHERE client_key = ?1",
            params![client_key, phase.as_str()],
        )?;
        Ok(())
    }

    /// Bump the spawn-wait counter and return its new value.
    pub fn increment_waited(&self, client_key: &str) -> Result<u32> {
        let conn = self.conn()?;
        let waited: Option<u32> = conn
            .query_row(
                "UPDATE instances SET waited_seconds = waited_seconds + 1
                 WHERE client_key = ?1 RETURNING waited_seconds",
                params![client_key],
                |row| row.get(0),
            )
            .optional()?;
        waited.ok_or_else(|| Error::not_found(client_key))
    }

    /// Remove the record. Absent keys are not an error.
    pub fn delete(&self, client_key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM instances WHERE client_key = ?1",
            params![client_key],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM instances ORDER BY created_at", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Ports held by every recorded instance.
    pub fn live_ports(&self) -> Result<HashSet<u16>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT port FROM instances")?;
        let ports = stmt
            .query_map([], |row| row.get::<_, u16>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ports)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let phase: String = row.get(6)?;
    Ok(InstanceRecord {
        client_key: row.get(0)?,
        instance_id: row.get(1)?,
        port: row.get(2)?,
        pid: row.get(3)?,
        created_at: from_millis(row.get(4)?, 4)?,
        expires_at: from_millis(row.get(5)?, 5)?,
        phase: phase.parse().map_err(|e| conversion_error(6, e))?,
        waited_seconds: row.get(7)?,
    })
}

fn from_millis(ms: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_error(idx, format!("invalid timestamp {}", ms)))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

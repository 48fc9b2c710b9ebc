//! SQLite state store for runtime records and the event log

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::core::{Event, RuntimeState};
use crate::error::{EngineError, Result};

/// Latest schema version this build knows how to write
pub const SCHEMA_VERSION: i64 = 3;

/// Upper bound on how long any statement waits for another writer
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RUNTIME_COLUMNS: &str =
    "name, pid, status, health, start_time, restart_count, last_error, last_seen, port, signature";

/// Persistent store for instance runtime state and the audit trail
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets readers proceed while a writer holds the database
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        info!("State store opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::StoreUnavailable(format!("connection lock poisoned: {}", e)))
    }

    /// Create or migrate the schema; safe to call from every process on startup
    pub fn initialize(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute_batch("CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);")?;
        let found: Option<i64> =
            tx.query_row("SELECT MAX(version) FROM schema_meta", [], |row| row.get(0))?;
        let mut version = found.unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(EngineError::UnsupportedSchema {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }

        if version < 1 {
            tx.execute_batch(
                r#"
                -- One row per instance
                CREATE TABLE IF NOT EXISTS runtime (
                    name TEXT PRIMARY KEY,
                    pid INTEGER,
                    status TEXT NOT NULL,
                    health TEXT NOT NULL DEFAULT 'unknown',
                    start_time TEXT,
                    restart_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    last_seen TEXT
                );

                -- Append-only audit trail
                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    ts TEXT NOT NULL,
                    type TEXT NOT NULL,
                    detail TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_events_name ON events (name, id);
                "#,
            )?;
            version = 1;
            debug!("Applied schema version 1");
        }

        if version < 2 {
            tx.execute_batch(
                r#"
                ALTER TABLE runtime ADD COLUMN port INTEGER;
                ALTER TABLE runtime ADD COLUMN signature INTEGER;
                "#,
            )?;
            version = 2;
            debug!("Applied schema version 2");
        }

        if version < 3 {
            tx.execute_batch(
                r#"
                -- Last start and completed count of rate-limited jobs
                CREATE TABLE IF NOT EXISTS scheduler_runs (
                    job TEXT PRIMARY KEY,
                    last_run TEXT NOT NULL,
                    run_count INTEGER NOT NULL DEFAULT 0
                );
                "#,
            )?;
            version = 3;
            debug!("Applied schema version 3");
        }

        if found != Some(version) {
            tx.execute("DELETE FROM schema_meta", [])?;
            tx.execute(
                "INSERT INTO schema_meta (version) VALUES (?1)",
                params![version],
            )?;
            info!("State store schema at version {}", version);
        }

        tx.commit()?;
        Ok(())
    }

    /// Current schema version (0 if uninitialized)
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn()?;
        let has_meta: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'",
            [],
            |row| row.get(0),
        )?;
        if !has_meta {
            return Ok(0);
        }
        let version: Option<i64> =
            conn.query_row("SELECT MAX(version) FROM schema_meta", [], |row| row.get(0))?;
        Ok(version.unwrap_or(0))
    }

    // === Runtime ===

    /// Load the runtime record of one instance
    pub fn get_runtime(&self, name: &str) -> Result<Option<RuntimeState>> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                &format!("SELECT {} FROM runtime WHERE name = ?1", RUNTIME_COLUMNS),
                params![name],
                row_to_runtime,
            )
            .optional()?;
        Ok(state)
    }

    /// Load every runtime record, ordered by name
    pub fn list_runtime(&self) -> Result<Vec<RuntimeState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runtime ORDER BY name",
            RUNTIME_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_runtime)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Write a runtime record and its event in one transaction
    pub fn save_runtime(
        &self,
        state: &RuntimeState,
        event_type: &str,
        detail: Option<&str>,
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO runtime
            (name, pid, status, health, start_time, restart_count, last_error, last_seen, port, signature)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                state.name,
                state.pid,
                state.status.as_str(),
                state.health.as_str(),
                state.start_time.map(|t| t.to_rfc3339()),
                state.restart_count,
                state.last_error,
                state.last_seen.map(|t| t.to_rfc3339()),
                state.port,
                state.signature.map(|s| s as i64),
            ],
        )?;
        let event_id = insert_event(&tx, &state.name, event_type, detail)?;
        tx.commit()?;

        debug!(
            instance = %state.name,
            status = %state.status,
            event = event_type,
            "Runtime state saved"
        );
        Ok(event_id)
    }

    /// Remove a runtime record, logging why
    pub fn delete_runtime(&self, name: &str, event_type: &str, detail: Option<&str>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM runtime WHERE name = ?1", params![name])?;
        if removed > 0 {
            insert_event(&tx, name, event_type, detail)?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Heartbeat: touch `last_seen` without rewriting the row
    pub fn update_runtime_seen(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE runtime SET last_seen = ?1 WHERE name = ?2",
            params![Utc::now().to_rfc3339(), name],
        )?;
        Ok(updated > 0)
    }

    /// Ports recorded against active instances
    pub fn claimed_ports(&self) -> Result<Vec<(String, u16)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name, port FROM runtime WHERE port IS NOT NULL ORDER BY name")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // === Scheduled jobs ===

    /// Claim a run of `job` unless another run started within `min_interval`
    ///
    /// The check and the new start time are written in one transaction, so
    /// at most one process wins each interval.
    pub fn claim_scheduled_run(&self, job: &str, min_interval: Duration) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let last: Option<String> = tx
            .query_row(
                "SELECT last_run FROM scheduler_runs WHERE job = ?1",
                params![job],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(last) = parse_time(0, last)? {
            // A clock that moved backwards never blocks a run
            if let Ok(elapsed) = (now - last).to_std() {
                if elapsed < min_interval {
                    debug!(job, ?elapsed, "Scheduled run not due");
                    return Ok(false);
                }
            }
        }

        tx.execute(
            "INSERT INTO scheduler_runs (job, last_run, run_count) VALUES (?1, ?2, 0)
             ON CONFLICT(job) DO UPDATE SET last_run = excluded.last_run",
            params![job, now.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Count a finished run of `job`; returns the new total
    pub fn complete_scheduled_run(&self, job: &str) -> Result<u64> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE scheduler_runs SET run_count = run_count + 1 WHERE job = ?1",
            params![job],
        )?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT run_count FROM scheduler_runs WHERE job = ?1",
                params![job],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    /// Completed runs of `job` and when the latest one started
    pub fn scheduled_run_info(&self, job: &str) -> Result<(u64, Option<DateTime<Utc>>)> {
        let conn = self.conn()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT run_count, last_run FROM scheduler_runs WHERE job = ?1",
                params![job],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((count, last)) => Ok((count.max(0) as u64, parse_time(1, Some(last))?)),
            None => Ok((0, None)),
        }
    }

    // === Events ===

    /// Append an event that is not tied to a runtime write
    pub fn log_event(&self, name: &str, event_type: &str, detail: Option<&str>) -> Result<i64> {
        let conn = self.conn()?;
        insert_event(&conn, name, event_type, detail)
    }

    /// Most recent events, newest first, optionally for one instance
    pub fn get_recent_events(&self, name: Option<&str>, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let limit = limit as i64;
        let mut result = Vec::new();

        match name {
            Some(name) => {
                let mut stmt = conn.prepare(
                    "SELECT id, name, ts, type, detail FROM events WHERE name = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![name, limit], row_to_event)?;
                for row in rows {
                    result.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, name, ts, type, detail FROM events ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], row_to_event)?;
                for row in rows {
                    result.push(row?);
                }
            }
        }

        Ok(result)
    }

    /// Clean up old events
    pub fn prune_events(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.conn()?;
        let cutoff = Utc::now() - chrono::TimeDelta::days(retention_days as i64);
        let count = conn.execute(
            "DELETE FROM events WHERE ts < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Pruned {} old events", count);
        Ok(count)
    }
}

fn insert_event(
    conn: &Connection,
    name: &str,
    event_type: &str,
    detail: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (name, ts, type, detail) VALUES (?1, ?2, ?3, ?4)",
        params![name, Utc::now().to_rfc3339(), event_type, detail],
    )?;
    Ok(conn.last_insert_rowid())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, e.to_string()))
        })
        .transpose()
}

fn row_to_runtime(row: &Row<'_>) -> rusqlite::Result<RuntimeState> {
    let status: String = row.get(2)?;
    let health: String = row.get(3)?;
    let signature: Option<i64> = row.get(9)?;

    Ok(RuntimeState {
        name: row.get(0)?,
        pid: row.get(1)?,
        status: status.parse().map_err(|e| conversion_error(2, e))?,
        health: health.parse().map_err(|e| conversion_error(3, e))?,
        start_time: parse_time(4, row.get(4)?)?,
        restart_count: row.get(5)?,
        last_error: row.get(6)?,
        last_seen: parse_time(7, row.get(7)?)?,
        port: row.get(8)?,
        signature: signature.map(|s| s as u64),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let ts: String = row.get(2)?;
    Ok(Event {
        id: row.get(0)?,
        name: row.get(1)?,
        timestamp: parse_time(2, Some(ts))?.unwrap_or_else(Utc::now),
        event_type: row.get(3)?,
        detail: row.get(4)?,
    })
}

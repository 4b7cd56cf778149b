//! SQLite-backed attendance history.

use chrono::{NaiveDate, NaiveTime};
use roster_core::{AttendanceDecision, AttendanceStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

/// One stored attendance row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub id: i64,
    pub name: String,
    pub date: String,
    pub time: String,
    pub status: String,
    pub late: String,
    pub confidence: f64,
    pub notes: String,
}

pub struct SqliteAttendanceStore {
    conn: Connection,
}

impl SqliteAttendanceStore {
    /// Open (creating if needed) the attendance database at `path`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            // Connection::open reports a missing directory as CannotOpen
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(dir = %parent.display(), error = %e, "failed to create database directory");
            }
        }
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        tracing::debug!(path = %path.display(), "attendance database opened");
        Ok(Self { conn })
    }

    #[cfg(test)]
    fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// All records for `date`, oldest first.
    pub fn records_on(&self, date: NaiveDate) -> rusqlite::Result<Vec<AttendanceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, date, time, status, late, confidence, notes
             FROM attendance WHERE date = ?1 ORDER BY time, id",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
            Ok(AttendanceRow {
                id: row.get(0)?,
                name: row.get(1)?,
                date: row.get(2)?,
                time: row.get(3)?,
                status: row.get(4)?,
                late: row.get(5)?,
                confidence: row.get(6)?,
                notes: row.get(7)?,
            })
        })?;
        rows.collect()
    }
}

impl AttendanceStore for SqliteAttendanceStore {
    fn exists(&self, identity: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM attendance WHERE name = ?1 AND date = ?2 LIMIT 1",
                params![identity, date.format(DATE_FORMAT).to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        Ok(found.is_some())
    }

    fn append(&mut self, decision: &AttendanceDecision) -> Result<i64, StoreError> {
        self.conn
            .execute(
                "INSERT INTO attendance (name, date, time, status, late, confidence, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    decision.identity,
                    decision.date.format(DATE_FORMAT).to_string(),
                    format_time(decision.time),
                    "Present",
                    if decision.is_late { "Late" } else { "On Time" },
                    f64::from(decision.confidence),
                    format!("Auto-recognized with {:.1}% confidence", decision.confidence * 100.0),
                ],
            )
            .map_err(backend)?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, identity = %decision.identity, "attendance row inserted");
        Ok(id)
    }
}

fn format_time(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS attendance (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  date TEXT NOT NULL,
  time TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'Present',
  late TEXT NOT NULL DEFAULT 'On Time',
  confidence REAL NOT NULL,
  notes TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_attendance_name_date ON attendance(name, date);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
"#,
    )
}

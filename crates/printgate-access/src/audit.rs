// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trust audit trail — append-only SQLite log of every trust-relevant
// decision.
//
// Schema:
//   trust_log(
//     id        INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp TEXT    NOT NULL,   -- RFC 3339
//     action    TEXT    NOT NULL,   -- e.g. "prompt", "register", "unregister"
//     subject   TEXT    NOT NULL,   -- fingerprint or display name
//     allowed   INTEGER NOT NULL,   -- 0 = denied/failed, 1 = allowed/ok
//     details   TEXT                -- optional free-form context
//   )

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use printgate_core::error::PrintgateError;

/// Convert a `rusqlite::Error` into a `PrintgateError::Database`.
fn db_err(e: rusqlite::Error) -> PrintgateError {
    PrintgateError::Database(e.to_string())
}

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS trust_log (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT    NOT NULL,
    action    TEXT    NOT NULL,
    subject   TEXT    NOT NULL,
    allowed   INTEGER NOT NULL,
    details   TEXT
);";

/// A single entry in the trust log, used for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub subject: String,
    pub allowed: bool,
    pub details: Option<String>,
}

/// Append-only trust log backed by a SQLite database.
///
/// Every prompt decision, registration, and unregistration is recorded with
/// a timestamp, the subject identity, and the outcome. The connection sits
/// behind a mutex so the log can be shared across dispatch tasks.
pub struct TrustAudit {
    conn: Mutex<Connection>,
}

impl TrustAudit {
    /// Open (or create) the trust log database at `path`.
    ///
    /// The `trust_log` table is created automatically if it does not already
    /// exist. WAL mode is enabled for better concurrent-read performance.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PrintgateError> {
        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("trust log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory trust log (useful for tests).
    pub fn open_in_memory() -> Result<Self, PrintgateError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("in-memory trust log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one entry.
    pub fn record(
        &self,
        action: &str,
        subject: &str,
        allowed: bool,
        details: Option<&str>,
    ) -> Result<(), PrintgateError> {
        let conn = self.conn.lock().expect("trust log lock poisoned");
        conn.execute(
            "INSERT INTO trust_log (timestamp, action, subject, allowed, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Utc::now().to_rfc3339(), action, subject, allowed as i64, details],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<TrustAuditEntry>, PrintgateError> {
        let conn = self.conn.lock().expect("trust log lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, action, subject, allowed, details
                 FROM trust_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(TrustAuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    action: row.get(2)?,
                    subject: row.get(3)?,
                    allowed: row.get::<_, i64>(4)? != 0,
                    details: row.get(5)?,
                })
            })
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Total number of recorded entries.
    pub fn len(&self) -> Result<usize, PrintgateError> {
        let conn = self.conn.lock().expect("trust log lock poisoned");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trust_log", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, PrintgateError> {
        Ok(self.len()? == 0)
    }
}

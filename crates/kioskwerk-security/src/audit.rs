// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Audit trail: an append-only SQLite log of every lifecycle and escalation event.
//
// Schema:
//   audit_events(
//     id          INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp   TEXT    NOT NULL,   -- RFC 3339
//     event       TEXT    NOT NULL,   -- AuditEventKind::as_str
//     session_id  TEXT,               -- NULL for kiosk-wide events
//     success     INTEGER NOT NULL,   -- 0 = failure, 1 = success
//     details     TEXT    NOT NULL    -- JSON object, privacy-filtered
//   )
//
// Details are filtered before they reach the database: keys that look like
// customer data are dropped and long strings are truncated.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use kioskwerk_core::error::{KioskError, Result};
use kioskwerk_core::types::SessionId;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

/// Key fragments that mark a detail as customer data.
const DENIED_KEY_FRAGMENTS: &[&str] = &[
    "name", "buffer", "content", "data", "email", "phone", "customer", "card", "payment", "iban",
    "token", "password", "secret",
];

/// Longest string value kept in a detail.
const MAX_DETAIL_CHARS: usize = 512;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS audit_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT    NOT NULL,
    event       TEXT    NOT NULL,
    session_id  TEXT,
    success     INTEGER NOT NULL,
    details     TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS audit_events_session ON audit_events(session_id);";

fn db_err(e: rusqlite::Error) -> KioskError {
    KioskError::Database(e.to_string())
}

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventKind {
    SessionCreated,
    SessionTerminated,
    DataDestroyed,
    ErrorOccurred,
    ErrorResolved,
    FailClosedTriggered,
    CrashRecovery,
    AdmissionRefused,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionTerminated => "session_terminated",
            Self::DataDestroyed => "data_destroyed",
            Self::ErrorOccurred => "error_occurred",
            Self::ErrorResolved => "error_resolved",
            Self::FailClosedTriggered => "fail_closed_triggered",
            Self::CrashRecovery => "crash_recovery",
            Self::AdmissionRefused => "admission_refused",
        }
    }
}

/// An event on its way to the audit trail.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: AuditEventKind,
    pub session_id: Option<SessionId>,
    pub success: bool,
    pub details: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, session_id: Option<&SessionId>) -> Self {
        Self {
            kind,
            session_id: session_id.cloned(),
            success: true,
            details: Map::new(),
        }
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }
}

/// A stored audit row, used for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub event: String,
    pub session_id: Option<String>,
    pub success: bool,
    pub details: Value,
}

/// Destination for audit events.
///
/// Recording is best-effort from the caller's point of view: a failure is
/// logged by the caller and never aborts the operation being audited.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Append-only audit log backed by a SQLite database.
pub struct AuditLog {
    conn: Mutex<Connection>,
}

impl AuditLog {
    /// Open (or create) the audit database at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!("audit log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory audit database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// All entries for one session, oldest first.
    pub fn entries_for_session(&self, session_id: &SessionId) -> Result<Vec<AuditEntry>> {
        self.query(
            "SELECT id, timestamp, event, session_id, success, details
             FROM audit_events
             WHERE session_id = ?1
             ORDER BY id ASC",
            params![session_id.as_str()],
        )
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent_entries(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        self.query(
            "SELECT id, timestamp, event, session_id, success, details
             FROM audit_events
             ORDER BY id DESC
             LIMIT ?1",
            params![limit],
        )
    }

    /// Number of entries of the given kind.
    pub fn count_kind(&self, kind: AuditEventKind) -> Result<u64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM audit_events WHERE event = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)
    }

    pub fn count(&self) -> Result<u64> {
        self.conn()
            .query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))
            .map_err(db_err)
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<AuditEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, |row| {
                let details: String = row.get(5)?;
                Ok(AuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    event: row.get(2)?,
                    session_id: row.get(3)?,
                    success: row.get::<_, i32>(4)? != 0,
                    details: serde_json::from_str(&details).unwrap_or(Value::Null),
                })
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }
}

impl AuditSink for AuditLog {
    #[instrument(skip_all, fields(event = event.kind.as_str(), success = event.success))]
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let details = Value::Object(sanitize(&event.details)).to_string();
        self.conn()
            .execute(
                "INSERT INTO audit_events (timestamp, event, session_id, success, details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Utc::now().to_rfc3339(),
                    event.kind.as_str(),
                    event.session_id.as_ref().map(SessionId::as_str),
                    i32::from(event.success),
                    details,
                ],
            )
            .map_err(db_err)?;
        debug!("audit event recorded");
        Ok(())
    }
}

/// Drop customer-data keys and truncate long strings, recursively.
pub fn sanitize(details: &Map<String, Value>) -> Map<String, Value> {
    details
        .iter()
        .filter(|(key, _)| !is_denied_key(key))
        .map(|(key, value)| (key.clone(), sanitize_value(value)))
        .collect()
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::String(s) if s.chars().count() > MAX_DETAIL_CHARS => {
            let mut cut: String = s.chars().take(MAX_DETAIL_CHARS).collect();
            cut.push('…');
            Value::String(cut)
        }
        other => other.clone(),
    }
}

fn is_denied_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    DENIED_KEY_FRAGMENTS.iter().any(|f| key.contains(f))
}

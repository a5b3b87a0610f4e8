//! SQLite-backed history sink.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{DecisionRecord, HistorySink};
use crate::error::{Error, Result};

/// Durable sink storing one row per decision, idempotent on
/// `decision_id` so at-least-once delivery never duplicates rows.
pub struct SqliteHistorySink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistorySink {
    /// Open or create a history database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn =
            Connection::open(path).map_err(|e| Error::sink_unavailable(e.to_string()))?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory sink (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::sink_unavailable(e.to_string()))?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS decisions (
                decision_id TEXT PRIMARY KEY,
                request_id  TEXT NOT NULL,
                tenant_id   TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                region      TEXT NOT NULL,
                status      TEXT NOT NULL,
                trust_score INTEGER NOT NULL,
                timestamp   TEXT NOT NULL,
                record      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_subject
                ON decisions (tenant_id, user_id, timestamp);",
        )
        .map_err(|e| Error::sink_unavailable(e.to_string()))
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::sink_unavailable(e.to_string()))
    }
}

#[async_trait]
impl HistorySink for SqliteHistorySink {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        let serialized = serde_json::to_string(record)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO decisions (
                    decision_id, request_id, tenant_id, user_id, region,
                    status, trust_score, timestamp, record
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.decision_id.to_string(),
                    record.request_id,
                    record.tenant_id,
                    record.user_id,
                    record.region,
                    record.status.to_string(),
                    record.trust_score as i64,
                    record.timestamp.to_rfc3339(),
                    serialized,
                ],
            )?;
            Ok(())
        })
    }

    async fn query(
        &self,
        user_id: &str,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM decisions
                 WHERE tenant_id = ?1 AND user_id = ?2
                 ORDER BY timestamp DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![tenant_id, user_id, limit as i64], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect()
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(serde_json::from_str(&row)?);
        }
        Ok(records)
    }
}

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::log::LogEntry;

const REPLICA_ID_KEY: &str = "replica_id";

impl Database {
    /// Persist an admitted entry. Returns `false` if it was already stored.
    pub fn insert_entry(&self, log_name: &str, entry: &LogEntry) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO log_entries (log_name, hash, origin, clock, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                log_name,
                entry.hash,
                entry.origin,
                entry.clock as i64,
                entry.payload.to_string(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// All persisted entries of a log, in admission order.
    pub fn load_entries(&self, log_name: &str) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT hash, origin, clock, payload
             FROM log_entries
             WHERE log_name = ?1
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![log_name], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Stable id of this replica, created on first use.
    pub fn replica_id(&self) -> Result<String> {
        let existing: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM replica_meta WHERE key = ?1",
                params![REPLICA_ID_KEY],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT INTO replica_meta (key, value) VALUES (?1, ?2)",
            params![REPLICA_ID_KEY, id],
        )?;
        tracing::info!(replica = %id, "created replica id");
        Ok(id)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let hash: String = row.get(0)?;
    let origin: String = row.get(1)?;
    let clock: i64 = row.get(2)?;
    let payload_str: String = row.get(3)?;

    let payload = serde_json::from_str(&payload_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(LogEntry {
        hash,
        origin,
        clock: clock as u64,
        payload,
    })
}

//! v001 -- Initial schema creation.
//!
//! Creates `log_entries`, holding every admitted entry of every log replica,
//! and `replica_meta`, a small key/value table for the persistent replica id.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Log entries (append-only, content addressed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS log_entries (
    seq      INTEGER PRIMARY KEY AUTOINCREMENT,  -- local admission order
    log_name TEXT NOT NULL,                      -- e.g. channels.general
    hash     TEXT NOT NULL,                      -- hex BLAKE3 of origin/clock/payload
    origin   TEXT NOT NULL,                      -- replica id of the writer
    clock    INTEGER NOT NULL,
    payload  TEXT NOT NULL,                      -- JSON

    UNIQUE (log_name, hash)
);

CREATE INDEX IF NOT EXISTS idx_log_entries_log ON log_entries(log_name, seq);

-- ----------------------------------------------------------------
-- Replica metadata
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS replica_meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        up(&conn).unwrap();
        up(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('log_entries', 'replica_meta')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}

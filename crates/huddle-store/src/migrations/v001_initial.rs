//! v001 -- Initial schema creation.
//!
//! A single key-value table.  Keys are namespaced by the caller
//! (`room_messages_<roomId>`, `app_cache_<key>`); values are JSON envelopes.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL               -- JSON-encoded CacheItem
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

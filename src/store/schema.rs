//! Range table schema and connection setup
//!
//! Table names are validated before they reach these templates
//! (see [`crate::store::shards`]).

use crate::error::StoreResult;
use rusqlite::{Connection, OptionalExtension};
use std::time::Duration;

/// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create one range table
/// Note: `owner` is non-null exactly when the range is being processed.
const CREATE_RANGE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY,
    start_token TEXT NOT NULL UNIQUE,
    end_token TEXT NOT NULL,
    first_key TEXT NOT NULL DEFAULT '',
    last_key TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'unclaimed',   -- unclaimed, processing, processed, failed
    owner TEXT,
    last_owner TEXT,
    total_items INTEGER NOT NULL DEFAULT 0,
    processed_items INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    processing_time REAL NOT NULL DEFAULT 0,    -- seconds
    error TEXT,
    range_data TEXT,                            -- JSON
    requeue_count INTEGER NOT NULL DEFAULT 0,
    random_key INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    heartbeat_at TEXT,
    requeued_at TEXT,
    updated_at TEXT NOT NULL,

    CHECK (status IN ('unclaimed', 'processing', 'processed', 'failed')),
    CHECK ((status = 'processing') = (owner IS NOT NULL))
)
"#;

/// Indexes for the claim scan, owner lookups and listings
const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_{table}_claim ON {table}(status, random_key)",
    "CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner) WHERE owner IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_{table}_requeued ON {table}(requeued_at) WHERE requeue_count > 0",
];

/// Pragmas for a store shared by many worker processes
const SHARED_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA locking_mode = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

/// Configure a connection for concurrent use
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> StoreResult<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(SHARED_PRAGMAS)?;
    Ok(())
}

/// Create a range table and its indexes
pub fn create_range_table(conn: &Connection, table: &str) -> StoreResult<()> {
    conn.execute(&CREATE_RANGE_TABLE.replace("{table}", table), [])?;
    for sql in CREATE_INDEXES {
        conn.execute(&sql.replace("{table}", table), [])?;
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Check whether a table exists
pub fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_range_table() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(!table_exists(&conn, "token_ranges").unwrap());
        create_range_table(&conn, "token_ranges").unwrap();
        assert!(table_exists(&conn, "token_ranges").unwrap());

        // Idempotent
        create_range_table(&conn, "token_ranges").unwrap();

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_owner_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        create_range_table(&conn, "t").unwrap();

        let insert = "INSERT INTO t (start_token, end_token, status, owner, random_key, created_at, updated_at) \
                      VALUES (?1, '10', ?2, ?3, 1, 'now', 'now')";
        assert!(conn.execute(insert, rusqlite::params!["0", "processing", "host|a"]).is_ok());
        assert!(conn.execute(insert, rusqlite::params!["1", "processing", None::<String>]).is_err());
        assert!(conn.execute(insert, rusqlite::params!["2", "unclaimed", "host|a"]).is_err());
        assert!(conn.execute(insert, rusqlite::params!["3", "bogus", None::<String>]).is_err());
    }
}

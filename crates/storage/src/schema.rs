use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

/// First id handed out by a fresh store.
pub const FIRST_ID: i64 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO id_sequence (singleton, next_id) VALUES (1, ?1)",
        rusqlite::params![FIRST_ID],
    )?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS records (
    row_id INTEGER PRIMARY KEY,
    parent_row INTEGER NOT NULL DEFAULT 0,
    parent_field TEXT NOT NULL,
    record_id INTEGER NOT NULL,
    position INTEGER,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER)),
    UNIQUE (parent_row, parent_field, record_id)
);
CREATE INDEX IF NOT EXISTS idx_records_live ON records (parent_row, parent_field, position) WHERE deleted = 0;

CREATE TABLE IF NOT EXISTS blobs (
    hash BLOB PRIMARY KEY CHECK (length(hash) = 32),
    contents BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS fields (
    row_id INTEGER NOT NULL REFERENCES records (row_id),
    field_key TEXT NOT NULL,
    value BLOB,
    blob_hash BLOB REFERENCES blobs (hash) CHECK (blob_hash IS NULL OR length(blob_hash) = 32),
    PRIMARY KEY (row_id, field_key),
    CHECK ((value IS NULL) != (blob_hash IS NULL))
);

CREATE TABLE IF NOT EXISTS id_sequence (
    singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
    next_id INTEGER NOT NULL
);
";

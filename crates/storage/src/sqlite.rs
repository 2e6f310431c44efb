use std::collections::BTreeMap;
use std::ops::Range;

use rusqlite::{Connection, OptionalExtension};

use examsync_core::{ABSENT_POSITION, FieldValue, RecordId, RecordMessage};

use crate::error::StorageError;
use crate::traits::{BlobHash, Storage};

const NOW_MS: &str = "CAST(unixepoch('now','subsec') * 1000 AS INTEGER)";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Number of distinct binary contents stored.
    pub fn blob_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[derive(Debug, Clone, Copy)]
struct RowState {
    row_id: i64,
    position: Option<i64>,
    deleted: bool,
}

fn find_row(
    conn: &Connection,
    parent_row: i64,
    parent_field: &str,
    id: RecordId,
) -> Result<Option<RowState>, StorageError> {
    let row = conn
        .query_row(
            "SELECT row_id, position, deleted FROM records WHERE parent_row = ?1 AND parent_field = ?2 AND record_id = ?3",
            rusqlite::params![parent_row, parent_field, id.get()],
            |row| {
                Ok(RowState {
                    row_id: row.get(0)?,
                    position: row.get(1)?,
                    deleted: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Row of a live element, creating it or reviving a tombstone.
///
/// A revived element starts from empty fields and no children.
fn ensure_row(
    conn: &Connection,
    parent_row: i64,
    parent_field: &str,
    id: RecordId,
    existing: Option<RowState>,
) -> Result<i64, StorageError> {
    match existing {
        Some(row) if !row.deleted => Ok(row.row_id),
        Some(row) => {
            conn.execute(
                &format!("UPDATE records SET deleted = 0, updated_at = {NOW_MS} WHERE row_id = ?1"),
                rusqlite::params![row.row_id],
            )?;
            conn.execute(
                "DELETE FROM fields WHERE row_id = ?1",
                rusqlite::params![row.row_id],
            )?;
            conn.execute(
                &format!(
                    "UPDATE records SET deleted = 1, position = NULL, updated_at = {NOW_MS} WHERE parent_row = ?1"
                ),
                rusqlite::params![row.row_id],
            )?;
            Ok(row.row_id)
        }
        None => {
            conn.execute(
                "INSERT INTO records (parent_row, parent_field, record_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![parent_row, parent_field, id.get()],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

fn tombstone(conn: &Connection, row_id: i64) -> Result<(), StorageError> {
    conn.execute(
        &format!(
            "UPDATE records SET deleted = 1, position = NULL, updated_at = {NOW_MS} WHERE row_id = ?1"
        ),
        rusqlite::params![row_id],
    )?;
    Ok(())
}

fn write_fields(
    conn: &Connection,
    row_id: i64,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<(), StorageError> {
    for (key, value) in fields {
        let (value_bytes, blob_hash) = match value {
            FieldValue::Bytes(contents) => {
                let hash = blake3::hash(contents);
                conn.execute(
                    "INSERT OR IGNORE INTO blobs (hash, contents) VALUES (?1, ?2)",
                    rusqlite::params![hash.as_bytes().as_slice(), contents],
                )?;
                (None, Some(hash.as_bytes().to_vec()))
            }
            other => (Some(other.to_msgpack()?), None),
        };
        conn.execute(
            "INSERT INTO fields (row_id, field_key, value, blob_hash) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(row_id, field_key) DO UPDATE SET value = excluded.value, blob_hash = excluded.blob_hash",
            rusqlite::params![row_id, key, value_bytes, blob_hash],
        )?;
    }
    if !fields.is_empty() {
        conn.execute(
            &format!("UPDATE records SET updated_at = {NOW_MS} WHERE row_id = ?1"),
            rusqlite::params![row_id],
        )?;
    }
    Ok(())
}

fn check_positions(conn: &Connection, parent_row: i64, set: &str) -> Result<(), StorageError> {
    let duplicate: Option<i64> = conn
        .query_row(
            "SELECT position FROM records WHERE parent_row = ?1 AND parent_field = ?2 AND deleted = 0 AND position IS NOT NULL
             GROUP BY position HAVING COUNT(*) > 1 LIMIT 1",
            rusqlite::params![parent_row, set],
            |row| row.get(0),
        )
        .optional()?;
    match duplicate {
        Some(position) => Err(StorageError::DuplicatePosition {
            set: set.to_string(),
            position,
        }),
        None => Ok(()),
    }
}

fn apply_record(
    conn: &Connection,
    parent_row: i64,
    parent_field: &str,
    message: &RecordMessage,
    create_missing: bool,
) -> Result<(), StorageError> {
    let existing = find_row(conn, parent_row, parent_field, message.id)?;
    let live = existing.filter(|row| !row.deleted);
    let missing = || StorageError::NotFound(format!("{parent_field} element {}", message.id));

    let row_id = if let Some(new_position) = message.swap_position {
        let expected = message.position.unwrap_or(ABSENT_POSITION);
        let found = live.and_then(|row| row.position).unwrap_or(ABSENT_POSITION);
        if found != expected {
            return Err(StorageError::PositionConflict {
                id: message.id,
                expected,
                found,
            });
        }
        if new_position == ABSENT_POSITION {
            if let Some(row) = live {
                tombstone(conn, row.row_id)?;
            }
            return Ok(());
        }
        if new_position < 0 {
            return Err(StorageError::ConstraintViolation(format!(
                "negative position {new_position} for element {}",
                message.id
            )));
        }
        let row_id = ensure_row(conn, parent_row, parent_field, message.id, existing)?;
        conn.execute(
            &format!("UPDATE records SET position = ?1, updated_at = {NOW_MS} WHERE row_id = ?2"),
            rusqlite::params![new_position, row_id],
        )?;
        row_id
    } else {
        match (message.deleted, live) {
            (Some(true), Some(row)) => {
                tombstone(conn, row.row_id)?;
                return Ok(());
            }
            (Some(true), None) => return Err(missing()),
            (Some(false), _) => ensure_row(conn, parent_row, parent_field, message.id, existing)?,
            (None, Some(row)) => row.row_id,
            (None, None) if create_missing => {
                ensure_row(conn, parent_row, parent_field, message.id, existing)?
            }
            (None, None) => return Err(missing()),
        }
    };

    write_fields(conn, row_id, &message.fields)?;
    for (set, children) in &message.children {
        for child in children {
            apply_record(conn, row_id, set, child, false)?;
        }
        check_positions(conn, row_id, set)?;
    }
    Ok(())
}

fn read_fields(
    conn: &Connection,
    row_id: i64,
) -> Result<BTreeMap<String, FieldValue>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT f.field_key, f.value, b.contents FROM fields f LEFT JOIN blobs b ON b.hash = f.blob_hash WHERE f.row_id = ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![row_id], |row| {
        let key: String = row.get(0)?;
        let value: Option<Vec<u8>> = row.get(1)?;
        let contents: Option<Vec<u8>> = row.get(2)?;
        Ok((key, value, contents))
    })?;

    let mut result = BTreeMap::new();
    for row in rows {
        let (key, value, contents) = row?;
        let value = match (value, contents) {
            (Some(bytes), _) => FieldValue::from_msgpack(&bytes)?,
            (None, Some(contents)) => FieldValue::Bytes(contents),
            (None, None) => {
                return Err(StorageError::NotFound(format!("blob of field {key}")));
            }
        };
        result.insert(key, value);
    }
    Ok(result)
}

fn read_record(
    conn: &Connection,
    row_id: i64,
    id: RecordId,
    position: Option<i64>,
) -> Result<RecordMessage, StorageError> {
    let mut message = RecordMessage::new(id);
    message.position = position;
    message.fields = read_fields(conn, row_id)?;

    let children = {
        let mut stmt = conn.prepare(
            "SELECT row_id, record_id, parent_field, position FROM records WHERE parent_row = ?1 AND deleted = 0
             ORDER BY parent_field, position, record_id",
        )?;
        stmt.query_map(rusqlite::params![row_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
    };
    for (child_row, child_id, set, child_position) in children {
        let child = read_record(conn, child_row, RecordId::new(child_id), child_position)?;
        message.push_child(&set, child);
    }
    Ok(message)
}

impl Storage for SqliteStorage {
    fn apply_patch(&mut self, kind: &str, patch: &RecordMessage) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        apply_record(&tx, 0, kind, patch, true)?;
        tx.commit()?;
        Ok(())
    }

    fn load(&self, kind: &str, id: RecordId) -> Result<RecordMessage, StorageError> {
        let row = find_row(&self.conn, 0, kind, id)?
            .filter(|row| !row.deleted)
            .ok_or_else(|| StorageError::NotFound(format!("{kind} {id}")))?;
        read_record(&self.conn, row.row_id, id, None)
    }

    fn reserve_ids(&mut self, count: u32) -> Result<Range<i64>, StorageError> {
        if count == 0 {
            return Err(StorageError::ConstraintViolation(
                "cannot reserve an empty id range".into(),
            ));
        }
        let tx = self.conn.transaction()?;
        let start: i64 = tx.query_row(
            "SELECT next_id FROM id_sequence WHERE singleton = 1",
            [],
            |row| row.get(0),
        )?;
        let end = start + i64::from(count);
        tx.execute(
            "UPDATE id_sequence SET next_id = ?1 WHERE singleton = 1",
            rusqlite::params![end],
        )?;
        tx.commit()?;
        Ok(start..end)
    }

    fn blob(&self, hash: &BlobHash) -> Result<Option<Vec<u8>>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT hash, contents FROM blobs WHERE hash = ?1",
                rusqlite::params![hash.as_slice()],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        match row {
            Some((stored, contents)) => {
                let stored: BlobHash = to_array(stored, "blob hash")?;
                if blake3::hash(&contents).as_bytes() != &stored {
                    return Err(StorageError::Serialization(
                        "blob contents do not match their hash".into(),
                    ));
                }
                Ok(Some(contents))
            }
            None => Ok(None),
        }
    }
}

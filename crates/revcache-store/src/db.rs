//! SQLite-backed persistence: the `cache` / `data` / `archive` /
//! `cache_archive` tables described in the wire/storage section.
//!
//! Every sync run opens one connection and does its work inside a single
//! transaction. The high-volume calls (`find_archive_by_tuple`,
//! `insert_archive`, `insert_blob`, `link_archive`) go through
//! `prepare_cached` so the statement is compiled once per connection and
//! reused across the hundreds of archives a run may touch.

use std::path::Path;

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS cache (
    id       INTEGER PRIMARY KEY,
    revision INTEGER NOT NULL,
    date     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS data (
    id    INTEGER PRIMARY KEY,
    bytes BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS archive (
    id        INTEGER PRIMARY KEY,
    idx       INTEGER NOT NULL,
    archive   INTEGER NOT NULL,
    crc       INTEGER NOT NULL,
    revision  INTEGER NOT NULL,
    name_hash INTEGER NOT NULL,
    data_id   INTEGER NOT NULL REFERENCES data(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS archive_tuple
    ON archive(idx, archive, crc, revision, name_hash);

CREATE TABLE IF NOT EXISTS cache_archive (
    cache_id   INTEGER NOT NULL REFERENCES cache(id),
    archive_id INTEGER NOT NULL REFERENCES archive(id),
    PRIMARY KEY (cache_id, archive_id)
);
";

/// A point-in-time cache: the snapshot row plus the revision and date it
/// was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub id: i64,
    pub revision: i32,
    pub date: i64,
}

/// One interned `(index, archive, crc, revision, name_hash)` tuple and
/// the blob it points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveRow {
    pub id: i64,
    pub index: u8,
    pub archive: u16,
    pub crc: u32,
    pub revision: i32,
    pub name_hash: u32,
    pub data_id: i64,
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Begin the one transaction a sync run operates inside.
    pub fn transaction(&mut self) -> Result<Tx<'_>, StoreError> {
        Ok(Tx {
            inner: self.conn.transaction()?,
        })
    }
}

pub struct Tx<'conn> {
    inner: rusqlite::Transaction<'conn>,
}

impl<'conn> Tx<'conn> {
    pub fn create_snapshot(&self, revision: i32, date: i64) -> Result<Snapshot, StoreError> {
        self.inner.execute(
            "INSERT INTO cache (revision, date) VALUES (?1, ?2)",
            params![revision, date],
        )?;
        Ok(Snapshot {
            id: self.inner.last_insert_rowid(),
            revision,
            date,
        })
    }

    pub fn find_most_recent_snapshot(&self) -> Result<Option<Snapshot>, StoreError> {
        self.inner
            .query_row(
                "SELECT id, revision, date FROM cache ORDER BY revision DESC, date DESC LIMIT 1",
                [],
                |row| {
                    Ok(Snapshot {
                        id: row.get(0)?,
                        revision: row.get(1)?,
                        date: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Master-index archive rows (`idx = 255`) linked to `snapshot_id`:
    /// the last known remote view this snapshot was built from.
    pub fn find_master_entries_for(&self, snapshot_id: i64) -> Result<Vec<ArchiveRow>, StoreError> {
        let mut stmt = self.inner.prepare(
            "SELECT a.id, a.idx, a.archive, a.crc, a.revision, a.name_hash, a.data_id
             FROM archive a
             JOIN cache_archive ca ON ca.archive_id = a.id
             WHERE ca.cache_id = ?1 AND a.idx = 255",
        )?;
        let rows = stmt
            .query_map(params![snapshot_id], Self::row_to_archive)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find_archive_by_tuple(
        &self,
        index: u8,
        archive: u16,
        crc: u32,
        revision: i32,
        name_hash: u32,
    ) -> Result<Option<i64>, StoreError> {
        let mut stmt = self.inner.prepare_cached(
            "SELECT id FROM archive WHERE idx = ?1 AND archive = ?2 AND crc = ?3 AND revision = ?4 AND name_hash = ?5",
        )?;
        stmt.query_row(params![index, archive, crc, revision, name_hash], |row| row.get(0))
            .optional()
            .map_err(StoreError::from)
    }

    pub fn insert_blob(&self, bytes: &[u8]) -> Result<i64, StoreError> {
        let mut stmt = self.inner.prepare_cached("INSERT INTO data (bytes) VALUES (?1)")?;
        stmt.execute(params![bytes])?;
        Ok(self.inner.last_insert_rowid())
    }

    /// Returns `Bytes` rather than `Vec<u8>` so a cached connection can
    /// hand back blob contents without the caller committing to an owned
    /// buffer until it actually needs one.
    pub fn read_blob(&self, id: i64) -> Result<Bytes, StoreError> {
        self.inner
            .query_row("SELECT bytes FROM data WHERE id = ?1", params![id], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .map(Bytes::from)
            .map_err(StoreError::from)
    }

    pub fn insert_archive(
        &self,
        index: u8,
        archive: u16,
        crc: u32,
        revision: i32,
        name_hash: u32,
        data_id: i64,
    ) -> Result<i64, StoreError> {
        let mut stmt = self.inner.prepare_cached(
            "INSERT INTO archive (idx, archive, crc, revision, name_hash, data_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![index, archive, crc, revision, name_hash, data_id])?;
        Ok(self.inner.last_insert_rowid())
    }

    pub fn link_archive(&self, snapshot_id: i64, archive_id: i64) -> Result<(), StoreError> {
        let mut stmt = self
            .inner
            .prepare_cached("INSERT OR IGNORE INTO cache_archive (cache_id, archive_id) VALUES (?1, ?2)")?;
        stmt.execute(params![snapshot_id, archive_id])?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().map_err(StoreError::from)
    }

    fn row_to_archive(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArchiveRow> {
        Ok(ArchiveRow {
            id: row.get(0)?,
            index: row.get(1)?,
            archive: row.get(2)?,
            crc: row.get(3)?,
            revision: row.get(4)?,
            name_hash: row.get(5)?,
            data_id: row.get(6)?,
        })
    }
}

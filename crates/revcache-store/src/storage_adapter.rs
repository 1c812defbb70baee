//! Bridges the in-memory tree the driver works with and the SQLite tables
//! underneath it: load rehydrates the last snapshot, stage buffers the
//! archives a sync run decided to keep, save commits them as a new
//! snapshot.

use revcache_core::codec::{ContainerCodec, EncodedContainer};

use crate::db::{Db, Snapshot};
use crate::error::StoreError;

/// One master-index blob as last persisted: the raw container bytes for
/// index `index`, still compressed, ready for the caller to decode.
#[derive(Debug, Clone)]
pub struct MasterEntry {
    pub index: u8,
    pub container_bytes: Vec<u8>,
}

/// What `load` hands back: the snapshot it was read from, plus every
/// master-index entry that snapshot had linked.
#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub snapshot: Snapshot,
    pub master_entries: Vec<MasterEntry>,
}

/// An archive a sync run has decided belongs in the next snapshot, staged
/// in memory until `save` commits it.
#[derive(Debug, Clone)]
struct StagedArchive {
    index: u8,
    archive: u16,
    crc: u32,
    revision: i32,
    name_hash: u32,
    container_bytes: Vec<u8>,
}

/// An archive carried forward from a prior snapshot unchanged: its tuple
/// is already interned, so `save` only needs to look it up and relink it.
#[derive(Debug, Clone, Copy)]
struct ExistingArchive {
    index: u8,
    archive: u16,
    crc: u32,
    revision: i32,
    name_hash: u32,
}

enum Pending {
    New(StagedArchive),
    Existing(ExistingArchive),
}

pub struct StorageAdapter {
    db: Db,
    pending: Vec<Pending>,
}

impl StorageAdapter {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            pending: Vec::new(),
        }
    }

    /// Rehydrate the most recently committed snapshot, if any.
    pub fn load(&mut self) -> Result<Option<LoadedSnapshot>, StoreError> {
        let tx = self.db.transaction()?;
        let Some(snapshot) = tx.find_most_recent_snapshot()? else {
            return Ok(None);
        };
        let rows = tx.find_master_entries_for(snapshot.id)?;
        let mut master_entries = Vec::with_capacity(rows.len());
        for row in rows {
            let bytes = tx.read_blob(row.data_id)?;
            tracing::debug!(index = row.archive, crc = %hex::encode(row.crc.to_be_bytes()), "rehydrated master entry");
            master_entries.push(MasterEntry {
                index: row.archive as u8,
                container_bytes: bytes.to_vec(),
            });
        }
        tx.commit()?;
        Ok(Some(LoadedSnapshot {
            snapshot,
            master_entries,
        }))
    }

    /// Fetching a single archive's bytes without a full `load()` is not
    /// part of this adapter's contract; the driver always rehydrates the
    /// whole tree before it compares anything.
    pub fn load_one(&self, _index: u8, _archive: u16) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::Unsupported(
            "load_one is not supported; rehydrate the full tree with load() instead",
        ))
    }

    /// Buffer an archive (already CRC-verified by the caller) for
    /// inclusion in the next `save`.
    pub fn stage(
        &mut self,
        index: u8,
        archive: u16,
        crc: u32,
        revision: i32,
        name_hash: u32,
        container_bytes: Vec<u8>,
    ) {
        self.pending.push(Pending::New(StagedArchive {
            index,
            archive,
            crc,
            revision,
            name_hash,
            container_bytes,
        }));
    }

    /// Carry an already-interned archive forward into the next snapshot
    /// without touching its bytes. `save` fails with
    /// [`StoreError::MissingStagedData`] if no archive matches this tuple.
    pub fn stage_existing(&mut self, index: u8, archive: u16, crc: u32, revision: i32, name_hash: u32) {
        self.pending.push(Pending::Existing(ExistingArchive {
            index,
            archive,
            crc,
            revision,
            name_hash,
        }));
    }

    /// Encode `data` into a container under the index's declared
    /// compression and stage it as a master entry (`index = 255`,
    /// `archive = index`) for the next `save`. Per convention, the
    /// container-level revision for master entries is always `-1`.
    pub fn stage_master_entry(
        &mut self,
        index: u8,
        codec: &dyn ContainerCodec,
        compression: u8,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let EncodedContainer { bytes, crc } = codec.encode(data, compression, -1)?;
        self.stage(255, index as u16, crc, -1, 0, bytes);
        Ok(())
    }

    /// Commit every staged archive as a new snapshot at `revision`,
    /// taken at `date`. Archives already interned for this exact tuple
    /// are reused rather than duplicated.
    pub fn save(&mut self, revision: i32, date: i64) -> Result<Snapshot, StoreError> {
        let tx = self.db.transaction()?;
        let snapshot = tx.create_snapshot(revision, date)?;

        for item in self.pending.drain(..) {
            let archive_id = match item {
                Pending::New(staged) => match tx.find_archive_by_tuple(
                    staged.index,
                    staged.archive,
                    staged.crc,
                    staged.revision,
                    staged.name_hash,
                )? {
                    Some(id) => id,
                    None => {
                        let blob_id = tx.insert_blob(&staged.container_bytes)?;
                        tx.insert_archive(
                            staged.index,
                            staged.archive,
                            staged.crc,
                            staged.revision,
                            staged.name_hash,
                            blob_id,
                        )?
                    }
                },
                Pending::Existing(existing) => tx
                    .find_archive_by_tuple(
                        existing.index,
                        existing.archive,
                        existing.crc,
                        existing.revision,
                        existing.name_hash,
                    )?
                    .ok_or(StoreError::MissingStagedData {
                        index: existing.index,
                        archive: existing.archive,
                    })?,
            };
            tx.link_archive(snapshot.id, archive_id)?;
        }

        tx.commit()?;
        Ok(snapshot)
    }
}

//! Reconciliation driver: rehydrates the local tree, compares it against
//! the remote master index one index at a time, downloads and verifies
//! whatever changed, and commits the result as a new snapshot.
//!
//! A CRC mismatch on a master-index entry is non-fatal — that index is
//! skipped for this run and retried next time. A CRC mismatch on a leaf
//! archive is fatal: the archive's bytes cannot be trusted and staging
//! anything built from it would poison the snapshot.

use std::collections::BTreeSet;

use bytes::Bytes;
use revcache_core::checksum::crc32;
use revcache_core::codec::{ArchiveDescriptor, ContainerCodec, IndexCodec, IndexData};
use revcache_core::wire::{RequestPriority, WireError};
use revcache_store::model::{ArchiveNode, IndexTree, Store};
use revcache_store::storage_adapter::StorageAdapter;

use crate::client::Client;
use crate::error::SyncError;

/// One master-index record: the index's current revision and the CRC-32
/// of its (still compressed) master entry blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MasterRecord {
    index: u8,
    crc: u32,
    revision: i32,
}

const MASTER_RECORD_LEN: usize = 8;

/// Index ids the client never fetches or retains locally even when the
/// server keeps advertising them.
const UNUSED_INDEXES: [u8; 2] = [16, 23];

fn parse_master_index(bytes: &[u8]) -> Result<Vec<MasterRecord>, WireError> {
    if bytes.len() % MASTER_RECORD_LEN != 0 {
        return Err(WireError::MalformedMasterIndex(bytes.len()));
    }
    Ok(bytes
        .chunks(MASTER_RECORD_LEN)
        .enumerate()
        .map(|(i, chunk)| MasterRecord {
            index: i as u8,
            crc: u32::from_be_bytes(chunk[0..4].try_into().unwrap()),
            revision: i32::from_be_bytes(chunk[4..8].try_into().unwrap()),
        })
        .collect())
}

/// Container-level tuple convention for master entries: grouped under
/// the synthetic name hash `0`, with the index's own declared revision
/// (not a container-level revision, since master entries don't carry one).
const MASTER_ENTRY_NAME_HASH: u32 = 0;

/// Summary of one reconciliation run, useful for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub indexes_unchanged: Vec<u8>,
    pub indexes_updated: Vec<u8>,
    pub indexes_skipped_crc_mismatch: Vec<u8>,
    pub archives_downloaded: usize,
    pub archives_removed: usize,
}

pub struct Driver<'a> {
    client: &'a Client,
    storage: &'a mut StorageAdapter,
    container_codec: &'a dyn ContainerCodec,
    index_codec: &'a dyn IndexCodec,
    rs_version: i32,
}

impl<'a> Driver<'a> {
    pub fn new(
        client: &'a Client,
        storage: &'a mut StorageAdapter,
        container_codec: &'a dyn ContainerCodec,
        index_codec: &'a dyn IndexCodec,
        rs_version: i32,
    ) -> Self {
        Self {
            client,
            storage,
            container_codec,
            index_codec,
            rs_version,
        }
    }

    /// Run one full reconciliation pass: load the last snapshot, compare
    /// it against the upstream master index, stage whatever changed, and
    /// commit a new snapshot. `now` is the commit timestamp (unix
    /// seconds); the caller supplies it because this module never reads
    /// the clock itself.
    pub async fn run(&mut self, now: i64) -> Result<SyncReport, SyncError> {
        let mut tree = self.load_local_tree()?;

        let master_index_bytes = self.client.request_master_index().await?;
        let master_decoded = self.container_codec.decode(&master_index_bytes)?;
        let remote_records = parse_master_index(&master_decoded.data)?;

        if self.is_up_to_date(&tree, &remote_records) {
            tracing::info!("cache already up to date, nothing to commit");
            return Ok(SyncReport {
                indexes_unchanged: remote_records.iter().map(|r| r.index).collect(),
                ..SyncReport::default()
            });
        }

        let mut report = SyncReport::default();

        for record in &remote_records {
            if UNUSED_INDEXES.contains(&record.index) {
                tree.indexes.remove(&record.index);
                continue;
            }

            let unchanged = tree
                .index(record.index)
                .map(|local| local.revision == record.revision && local.crc == record.crc)
                .unwrap_or(false);

            if unchanged {
                report.indexes_unchanged.push(record.index);
                self.carry_forward_index(&tree, record.index, record.crc, record.revision);
                continue;
            }

            let entry_bytes = self.client.request_master_entry(record.index).await?;
            let actual_crc = crc32(&entry_bytes);
            if actual_crc != record.crc {
                tracing::warn!(
                    index = record.index,
                    expected = %hex::encode(record.crc.to_be_bytes()),
                    actual = %hex::encode(actual_crc.to_be_bytes()),
                    "master entry crc mismatch, skipping index for this run"
                );
                report.indexes_skipped_crc_mismatch.push(record.index);
                continue;
            }

            let decoded = self.container_codec.decode(&entry_bytes)?;
            let remote_index = self.index_codec.decode(&decoded.data)?;

            let removed = self.reconcile_index(&mut tree, record.index, &remote_index).await?;
            report.archives_downloaded += remote_index.archives.len();
            report.archives_removed += removed;
            report.indexes_updated.push(record.index);

            self.storage.stage(
                255,
                record.index as u16,
                actual_crc,
                record.revision,
                MASTER_ENTRY_NAME_HASH,
                entry_bytes.to_vec(),
            );
        }

        // Indexes the remote master table no longer lists are dropped:
        // they simply aren't re-staged, so the next snapshot omits them.
        let remote_ids: BTreeSet<u8> = remote_records.iter().map(|r| r.index).collect();
        tree.indexes.retain(|id, _| remote_ids.contains(id));

        let snapshot = self.storage.save(self.rs_version, now)?;
        tracing::info!(
            snapshot_id = snapshot.id,
            revision = snapshot.revision,
            updated = report.indexes_updated.len(),
            unchanged = report.indexes_unchanged.len(),
            skipped = report.indexes_skipped_crc_mismatch.len(),
            "reconciliation complete"
        );

        Ok(report)
    }

    /// True iff the remote master index and the local tree agree exactly:
    /// same count of indexes, same `(revision, crc)` per index. When this
    /// holds, §4.2 step 4 says to return without creating a new snapshot
    /// at all rather than re-committing an identical one.
    fn is_up_to_date(&self, tree: &Store, remote: &[MasterRecord]) -> bool {
        tree.indexes.len() == remote.len()
            && remote.iter().all(|r| {
                tree.index(r.index)
                    .map(|local| local.revision == r.revision && local.crc == r.crc)
                    .unwrap_or(false)
            })
    }

    fn load_local_tree(&mut self) -> Result<Store, SyncError> {
        let mut store = Store::new();
        let Some(loaded) = self.storage.load()? else {
            return Ok(store);
        };
        for entry in loaded.master_entries {
            let decoded = self.container_codec.decode(&entry.container_bytes)?;
            let index_data = self.index_codec.decode(&decoded.data)?;
            let mut tree = IndexTree::new(entry.index);
            tree.revision = index_data.revision;
            tree.crc = crc32(&entry.container_bytes);
            for descriptor in &index_data.archives {
                tree.archives.insert(descriptor.id, ArchiveNode::from_descriptor(descriptor));
            }
            store.indexes.insert(entry.index, tree);
        }
        Ok(store)
    }

    /// An index whose master-entry CRC hasn't moved since the last
    /// snapshot: its master entry and every archive it already has are
    /// relinked into the new snapshot without re-downloading anything.
    fn carry_forward_index(&mut self, tree: &Store, index: u8, master_crc: u32, master_revision: i32) {
        self.storage
            .stage_existing(255, index as u16, master_crc, master_revision, MASTER_ENTRY_NAME_HASH);
        if let Some(local) = tree.index(index) {
            for node in local.archives.values() {
                self.storage.stage_existing(index, node.id, node.crc, node.revision, node.name_hash);
            }
        }
    }

    /// Diff `remote` against the locally known archives for `index`,
    /// download and verify anything added or changed, and update `tree`
    /// in place. Unchanged archives are relinked without a download.
    /// Returns the number of archives removed.
    async fn reconcile_index(&mut self, tree: &mut Store, index: u8, remote: &IndexData) -> Result<usize, SyncError> {
        let local_ids: Vec<u16> = tree.index(index).map(|t| t.archives.keys().copied().collect()).unwrap_or_default();
        let remote_ids: BTreeSet<u16> = remote.archives.iter().map(|a| a.id).collect();

        let mut removed = 0;
        for id in local_ids {
            if !remote_ids.contains(&id) {
                tree.remove_archive(index, id);
                removed += 1;
            }
        }

        // Enqueue every changed archive with flush=false so the requests
        // batch onto the wire together, then issue one explicit flush and
        // drain the whole batch — matching the "enqueue, flush once,
        // drain" pipelining policy for bulk downloads.
        let mut pending_fetches = Vec::new();
        for descriptor in &remote.archives {
            let current = tree.index(index).and_then(|t| t.archives.get(&descriptor.id)).copied();
            match current {
                Some(node) if node.matches_descriptor(descriptor) => {
                    self.storage.stage_existing(index, node.id, node.crc, node.revision, node.name_hash);
                }
                _ => {
                    let pending = self
                        .client
                        .enqueue_file(RequestPriority::Prefetch, index, descriptor.id, false)
                        .await?;
                    pending_fetches.push((descriptor, pending));
                }
            }
        }

        if !pending_fetches.is_empty() {
            self.client.flush().await?;
        }

        for (descriptor, pending) in pending_fetches {
            let bytes = pending.wait().await?;
            self.stage_fetched_archive(tree, index, descriptor, bytes)?;
        }

        if let Some(local_tree) = tree.indexes.get_mut(&index) {
            local_tree.revision = remote.revision;
        }

        Ok(removed)
    }

    fn stage_fetched_archive(
        &mut self,
        tree: &mut Store,
        index: u8,
        descriptor: &ArchiveDescriptor,
        bytes: Bytes,
    ) -> Result<(), SyncError> {
        let actual_crc = crc32(&bytes);
        if actual_crc != descriptor.crc {
            tracing::error!(
                index,
                archive = descriptor.id,
                expected = %hex::encode(descriptor.crc.to_be_bytes()),
                actual = %hex::encode(actual_crc.to_be_bytes()),
                "archive crc mismatch, aborting run"
            );
            return Err(SyncError::Integrity {
                index,
                archive: descriptor.id,
                expected: descriptor.crc,
                actual: actual_crc,
            });
        }

        self.storage.stage(
            index,
            descriptor.id,
            descriptor.crc,
            descriptor.revision,
            descriptor.name_hash,
            bytes.to_vec(),
        );

        tree.index_mut(index).archives.insert(descriptor.id, ArchiveNode::from_descriptor(descriptor));
        Ok(())
    }
}

mod infra;

use infra::{FakeServer, World};
use revcache_core::codec::{
    ArchiveDescriptor, ContainerCodec, IdentityContainerCodec, IndexCodec, IndexData, JsonIndexCodec,
};
use revcache_store::db::Db;
use revcache_store::storage_adapter::StorageAdapter;
use revcache_sync::{Client, Driver, HandshakeOutcome, SyncError};

/// Raw (pre-container) bytes for one index plus the CRC-32 its *container*
/// will carry, matching what the client computes on receipt.
fn build_index(revision: i32, archives: Vec<ArchiveDescriptor>) -> (Vec<u8>, u32) {
    let data = IndexData {
        protocol: 6,
        revision,
        named: true,
        sized: true,
        archives,
    };
    let raw = JsonIndexCodec.encode(&data).unwrap();
    let crc = IdentityContainerCodec.encode(&raw, 0, -1).unwrap().crc;
    (raw, crc)
}

fn archive_crc(raw: &[u8]) -> u32 {
    IdentityContainerCodec.encode(raw, 0, -1).unwrap().crc
}

fn master_index_bytes(records: &[(u32, i32)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(records.len() * 8);
    for (crc, revision) in records {
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes.extend_from_slice(&revision.to_be_bytes());
    }
    bytes
}

async fn run_once(server: &FakeServer, storage: &mut StorageAdapter) -> Result<revcache_sync::SyncReport, SyncError> {
    let mut client = match Client::handshake(&server.addr, 1, [0; 4]).await? {
        HandshakeOutcome::Rejected(code) => {
            return Err(SyncError::Protocol(format!("handshake rejected with code {code}")));
        }
        HandshakeOutcome::Connected(client) => client,
    };
    let container_codec = IdentityContainerCodec;
    let index_codec = JsonIndexCodec;
    let mut driver = Driver::new(&client, storage, &container_codec, &index_codec, 1);
    let result = driver.run(1_700_000_000).await;
    drop(driver);
    let _ = client.close().await;
    result
}

/// Backed by a real file rather than `:memory:` so each test exercises the
/// same on-disk path a production run would.
fn temp_storage() -> (tempfile::TempDir, StorageAdapter) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("cache.sqlite3")).unwrap();
    (dir, StorageAdapter::new(db))
}

#[tokio::test]
async fn fresh_start_downloads_everything() {
    let one_archive = ArchiveDescriptor {
        id: 0,
        crc: archive_crc(b"archive zero bytes"),
        revision: 1,
        name_hash: 111,
        compressed_size: 18,
        decompressed_size: 40,
    };
    let (index0_raw, index0_crc) = build_index(1, vec![one_archive]);

    let mut world = World::new();
    world.master_index = master_index_bytes(&[(index0_crc, 1)]);
    world.master_entries.insert(0, index0_raw);
    world.archives.insert((0, 0), b"archive zero bytes".to_vec());

    let server = FakeServer::spawn(world).await;
    let (_dir, mut storage) = temp_storage();

    let report = run_once(&server, &mut storage).await.unwrap();
    assert_eq!(report.indexes_updated, vec![0]);
    assert!(report.indexes_unchanged.is_empty());
    assert_eq!(report.archives_downloaded, 1);

    let loaded = storage.load().unwrap().unwrap();
    assert_eq!(loaded.master_entries.len(), 1);
    server.stop();
}

#[tokio::test]
async fn already_up_to_date_reuses_existing_archives_without_refetch() {
    let descriptor = ArchiveDescriptor {
        id: 0,
        crc: archive_crc(b"stable bytes"),
        revision: 1,
        name_hash: 1,
        compressed_size: 12,
        decompressed_size: 12,
    };
    let (index0_raw, index0_crc) = build_index(1, vec![descriptor]);

    let mut world = World::new();
    world.master_index = master_index_bytes(&[(index0_crc, 1)]);
    world.master_entries.insert(0, index0_raw);
    world.archives.insert((0, 0), b"stable bytes".to_vec());

    let server = FakeServer::spawn(world).await;
    let (_dir, mut storage) = temp_storage();

    let first = run_once(&server, &mut storage).await.unwrap();
    assert_eq!(first.indexes_updated, vec![0]);

    let second = run_once(&server, &mut storage).await.unwrap();
    assert!(second.indexes_updated.is_empty());
    assert_eq!(second.indexes_unchanged, vec![0]);
    assert_eq!(second.archives_downloaded, 0);

    server.stop();
}

#[tokio::test]
async fn handshake_rejected_is_a_normal_outcome() {
    let mut world = World::new();
    world.handshake_ok = false;

    let server = FakeServer::spawn(world).await;
    let outcome = Client::handshake(&server.addr, 1, [0; 4]).await.unwrap();
    assert!(matches!(outcome, HandshakeOutcome::Rejected(6)));
    server.stop();
}

#[tokio::test]
async fn archive_changed_between_runs_is_redownloaded() {
    let descriptor_v1 = ArchiveDescriptor {
        id: 0,
        crc: archive_crc(b"version one"),
        revision: 1,
        name_hash: 1,
        compressed_size: 11,
        decompressed_size: 11,
    };
    let (index0_raw_v1, index0_crc_v1) = build_index(1, vec![descriptor_v1]);

    let mut world = World::new();
    world.master_index = master_index_bytes(&[(index0_crc_v1, 1)]);
    world.master_entries.insert(0, index0_raw_v1);
    world.archives.insert((0, 0), b"version one".to_vec());

    let server = FakeServer::spawn(world).await;
    let (_dir, mut storage) = temp_storage();
    run_once(&server, &mut storage).await.unwrap();

    let descriptor_v2 = ArchiveDescriptor {
        id: 0,
        crc: archive_crc(b"version two, longer"),
        revision: 2,
        name_hash: 1,
        compressed_size: 20,
        decompressed_size: 20,
    };
    let (index0_raw_v2, index0_crc_v2) = build_index(2, vec![descriptor_v2]);
    server.update(|w| {
        w.master_index = master_index_bytes(&[(index0_crc_v2, 2)]);
        w.master_entries.insert(0, index0_raw_v2);
        w.archives.insert((0, 0), b"version two, longer".to_vec());
    });

    let second = run_once(&server, &mut storage).await.unwrap();
    assert_eq!(second.indexes_updated, vec![0]);
    assert_eq!(second.archives_downloaded, 1);

    server.stop();
}

#[tokio::test]
async fn index_dropped_from_master_table_is_removed_from_next_snapshot() {
    let descriptor = ArchiveDescriptor {
        id: 0,
        crc: archive_crc(b"index one contents"),
        revision: 1,
        name_hash: 1,
        compressed_size: 19,
        decompressed_size: 19,
    };
    let (index0_raw, index0_crc) = build_index(1, vec![]);
    let (index1_raw, index1_crc) = build_index(1, vec![descriptor]);

    let mut world = World::new();
    world.master_index = master_index_bytes(&[(index0_crc, 1), (index1_crc, 1)]);
    world.master_entries.insert(0, index0_raw);
    world.master_entries.insert(1, index1_raw);
    world.archives.insert((1, 0), b"index one contents".to_vec());

    let server = FakeServer::spawn(world).await;
    let (_dir, mut storage) = temp_storage();
    let first = run_once(&server, &mut storage).await.unwrap();
    assert_eq!(first.indexes_updated, vec![0, 1]);

    // Index 1 is no longer advertised at all on the next run.
    server.update(|w| {
        w.master_index = master_index_bytes(&[(index0_crc, 1)]);
    });

    run_once(&server, &mut storage).await.unwrap();
    let loaded = storage.load().unwrap().unwrap();
    assert_eq!(loaded.master_entries.len(), 1);
    assert_eq!(loaded.master_entries[0].index, 0);

    server.stop();
}

#[tokio::test]
async fn unused_index_stays_removed_even_while_the_server_keeps_advertising_it() {
    let descriptor = ArchiveDescriptor {
        id: 0,
        crc: archive_crc(b"index zero contents"),
        revision: 1,
        name_hash: 1,
        compressed_size: 20,
        decompressed_size: 20,
    };
    let (index0_raw, index0_crc) = build_index(1, vec![descriptor]);
    let (empty_raw, empty_crc) = build_index(1, vec![]);

    // Master-index positions are index ids, so reaching id 16 (one of
    // UNUSED_INDEXES) means padding positions 1..=15 with empty
    // placeholder indexes the client will actually fetch and keep.
    let mut records = vec![(index0_crc, 1)];
    for _ in 1u8..16 {
        records.push((empty_crc, 1));
    }
    records.push((0xDEAD_BEEF, 7)); // index 16: bogus, must never even be requested

    let mut world = World::new();
    world.master_index = master_index_bytes(&records);
    world.master_entries.insert(0, index0_raw);
    for i in 1u8..16 {
        world.master_entries.insert(i, empty_raw.clone());
    }
    world.archives.insert((0, 0), b"index zero contents".to_vec());

    let server = FakeServer::spawn(world).await;
    let (_dir, mut storage) = temp_storage();

    let first = run_once(&server, &mut storage).await.unwrap();
    assert!(!first.indexes_updated.contains(&16));
    assert!(!first.indexes_unchanged.contains(&16));

    let loaded = storage.load().unwrap().unwrap();
    assert!(loaded.master_entries.iter().all(|e| e.index != 16));

    // Server still advertises index 16 on the next run; the client must
    // keep skipping and removing it rather than only doing so once.
    let second = run_once(&server, &mut storage).await.unwrap();
    assert!(!second.indexes_updated.contains(&16));
    assert!(!second.indexes_unchanged.contains(&16));

    let loaded_again = storage.load().unwrap().unwrap();
    assert!(loaded_again.master_entries.iter().all(|e| e.index != 16));

    server.stop();
}

#[tokio::test]
async fn archive_crc_mismatch_is_fatal() {
    let descriptor = ArchiveDescriptor {
        id: 0,
        crc: archive_crc(b"the real bytes"),
        revision: 1,
        name_hash: 1,
        compressed_size: 14,
        decompressed_size: 14,
    };
    let (index0_raw, index0_crc) = build_index(1, vec![descriptor]);

    let mut world = World::new();
    world.master_index = master_index_bytes(&[(index0_crc, 1)]);
    world.master_entries.insert(0, index0_raw);
    world.corrupt_archives.insert((0, 0), b"tampered bytes!!".to_vec());

    let server = FakeServer::spawn(world).await;
    let (_dir, mut storage) = temp_storage();

    let result = run_once(&server, &mut storage).await;
    assert!(matches!(result, Err(SyncError::Integrity { index: 0, archive: 0, .. })));

    server.stop();
}

//! CRC-32 helper shared by the protocol driver and the storage adapter.

/// CRC-32 (IEEE) over `bytes`, matching the checksum the upstream server
/// advertises for each archive and master-index entry.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

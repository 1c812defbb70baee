//! Error taxonomy for the sync client and reconciliation driver.

use revcache_core::wire::WireError;
use revcache_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("integrity check failed for index {index} archive {archive}: expected crc {expected:#010x}, got {actual:#010x}")]
    Integrity {
        index: u8,
        archive: u16,
        expected: u32,
        actual: u32,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] revcache_core::codec::CodecError),
}

//! Error taxonomy for the persistence layer.

use revcache_core::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("no staged data for index {index} archive {archive}")]
    MissingStagedData { index: u8, archive: u16 },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

//! Content-addressed persistence for the asset cache: the in-memory tree
//! the driver compares against, the SQLite tables underneath it, and the
//! adapter bridging the two.

pub mod db;
pub mod error;
pub mod model;
pub mod storage_adapter;

pub use error::StoreError;

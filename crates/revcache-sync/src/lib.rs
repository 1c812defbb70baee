//! Update-protocol client and reconciliation driver for syncing a local
//! asset cache against an upstream server.

pub mod client;
pub mod driver;
pub mod error;

pub use client::{Client, ClientState, HandshakeOutcome};
pub use driver::{Driver, SyncReport};
pub use error::SyncError;

//! Shared wire types, codec seams, checksum helper, and configuration for
//! the asset cache sync client and its persistence layer.

pub mod checksum;
pub mod codec;
pub mod config;
pub mod wire;

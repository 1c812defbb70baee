//! Domain model for decoded index data, plus the two codec seams the
//! driver depends on but never implements: archive containers and the
//! master-index blob format. Concrete compression and index-serialization
//! formats are a downstream concern; these traits exist so the driver can
//! be built and tested against them without knowing which format wins.

use serde::{Deserialize, Serialize};

/// One archive's metadata as advertised by a decoded master entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub id: u16,
    pub crc: u32,
    pub revision: i32,
    pub name_hash: u32,
    pub compressed_size: u32,
    pub decompressed_size: u32,
}

/// A fully decoded index: the index's own metadata plus the set of
/// archives it currently advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexData {
    pub protocol: u8,
    pub revision: i32,
    pub named: bool,
    pub sized: bool,
    pub archives: Vec<ArchiveDescriptor>,
}

impl IndexData {
    pub fn archive(&self, id: u16) -> Option<&ArchiveDescriptor> {
        self.archives.iter().find(|a| a.id == id)
    }
}

/// A container-decoded blob: plaintext bytes plus the metadata carried in
/// the container envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedContainer {
    pub data: Vec<u8>,
    pub compression: u8,
    /// Revision stamped in the container envelope, if the format carries
    /// one. `-1` conventionally means "no revision".
    pub revision: i32,
}

/// An encoded container ready to be written to blob storage, plus the
/// CRC-32 the caller should use as the archive's advertised checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedContainer {
    pub bytes: Vec<u8>,
    pub crc: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported compression type {0}")]
    UnsupportedCompression(u8),

    #[error("container too short: {0} bytes")]
    ContainerTooShort(usize),

    #[error("index data malformed: {0}")]
    Malformed(String),
}

/// Compresses and decompresses the container envelope that wraps every
/// archive and master-index blob on the wire. The upstream server may use
/// gzip, bzip2, or no compression at all; this crate only needs to parse
/// the envelope, not every codec behind it.
pub trait ContainerCodec: Send + Sync {
    fn decode(&self, container_bytes: &[u8]) -> Result<DecodedContainer, CodecError>;
    fn encode(&self, data: &[u8], compression: u8, revision: i32) -> Result<EncodedContainer, CodecError>;
}

/// Parses and serializes the decompressed bytes of an index into
/// [`IndexData`]. The real format is a packed binary table; the identity
/// codec below is a stand-in used by the test harness.
pub trait IndexCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<IndexData, CodecError>;
    fn encode(&self, data: &IndexData) -> Result<Vec<u8>, CodecError>;
}

/// A `ContainerCodec` for uncompressed ("store", compression type 0)
/// containers: `[compression:u8][size:u32 BE][data...]`, no further
/// transform applied. Sufficient for local testing and for indices that
/// opt out of compression.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityContainerCodec;

impl ContainerCodec for IdentityContainerCodec {
    fn decode(&self, container_bytes: &[u8]) -> Result<DecodedContainer, CodecError> {
        if container_bytes.len() < 5 {
            return Err(CodecError::ContainerTooShort(container_bytes.len()));
        }
        let compression = container_bytes[0];
        if compression != 0 {
            return Err(CodecError::UnsupportedCompression(compression));
        }
        let size = u32::from_be_bytes(container_bytes[1..5].try_into().unwrap()) as usize;
        let data = container_bytes[5..]
            .get(..size)
            .ok_or(CodecError::ContainerTooShort(container_bytes.len()))?
            .to_vec();
        Ok(DecodedContainer {
            data,
            compression: 0,
            revision: -1,
        })
    }

    fn encode(&self, data: &[u8], compression: u8, _revision: i32) -> Result<EncodedContainer, CodecError> {
        if compression != 0 {
            return Err(CodecError::UnsupportedCompression(compression));
        }
        let mut bytes = Vec::with_capacity(5 + data.len());
        bytes.push(0);
        bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
        bytes.extend_from_slice(data);
        let crc = crate::checksum::crc32(&bytes);
        Ok(EncodedContainer { bytes, crc })
    }
}

/// An `IndexCodec` backed by JSON. A stand-in for the real packed index
/// table format, used wherever this crate's tests need a concrete codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonIndexCodec;

impl IndexCodec for JsonIndexCodec {
    fn decode(&self, bytes: &[u8]) -> Result<IndexData, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn encode(&self, data: &IndexData) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(data).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

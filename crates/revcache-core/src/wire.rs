//! Update-protocol wire format — on-wire types for the handshake, archive
//! requests, and the framed archive response stream.
//!
//! These types ARE the protocol: every field and byte order is dictated by
//! the upstream update server and must not change independently of it.
//! There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Handshake request type byte — `UPDATE` in the upstream protocol.
pub const HANDSHAKE_TYPE: u8 = 15;

/// Handshake response byte meaning the client's revision is current.
pub const HANDSHAKE_OK: u8 = 0;

/// Synthetic index id denoting the master-index namespace: `(255, i)` is
/// the master entry for index `i`; `(255, 255)` is the master index itself.
pub const MASTER_INDEX: u8 = 255;

/// Maximum number of outstanding `requestFile` calls. A protocol-level
/// ceiling — exceeding it causes the server to drop the connection.
pub const MAX_REQUESTS: usize = 19;

/// Size of a single archive-response frame, including the continuation
/// marker on frames after the first.
pub const FRAME_SIZE: usize = 512;

/// Size of the frame-routing preamble that precedes the first frame of an
/// archive response: `(index:u8, archive:u16, compressionType:u8, compressedSize:u32)`.
pub const FRAME_HEADER_LEN: usize = 8;

/// Continuation marker byte prefixed to every frame after the first.
pub const FRAME_CONTINUATION: u8 = 0xFF;

// ── Handshake ─────────────────────────────────────────────────────────────────

/// `UpdateHandshake` request — big-endian, 21 bytes on the wire:
/// `type:u8=15, revision:i32, key[4]:i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub revision: i32,
    pub key: [i32; 4],
}

impl HandshakeRequest {
    pub const WIRE_LEN: usize = 21;

    pub fn new(revision: i32, key: [i32; 4]) -> Self {
        Self { revision, key }
    }

    /// Encode to the 21-byte big-endian wire form.
    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0] = HANDSHAKE_TYPE;
        buf[1..5].copy_from_slice(&self.revision.to_be_bytes());
        for (i, word) in self.key.iter().enumerate() {
            let start = 5 + i * 4;
            buf[start..start + 4].copy_from_slice(&word.to_be_bytes());
        }
        buf
    }
}

/// Single-byte handshake response. `0 = OK`, any other value is a rejection
/// code the client surfaces verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse(pub u8);

impl HandshakeResponse {
    pub fn is_ok(&self) -> bool {
        self.0 == HANDSHAKE_OK
    }
}

// ── Session prelude ───────────────────────────────────────────────────────────

/// Command-type byte for the encryption-key prelude command.
pub const ENCRYPTION_KEY_TYPE: u8 = 4;

/// Command-type byte for the client-info prelude command.
pub const CLIENT_INFO_TYPE: u8 = 3;

/// The two fixed-format commands a client sends immediately after a
/// successful handshake, before issuing any file request. Their exact byte
/// sequences are dictated by the upstream server version; this crate
/// treats them as opaque, assembling them here from the same revision and
/// session keys the handshake itself carried so the call sites never touch
/// raw bytes.
#[derive(Debug, Clone, Copy)]
pub struct SessionPrelude {
    pub revision: i32,
    pub key: [i32; 4],
}

impl SessionPrelude {
    /// `type:u8=ENCRYPTION_KEY_TYPE` followed by the four session key
    /// words, big-endian. 17 bytes.
    pub fn encryption_key_command(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.push(ENCRYPTION_KEY_TYPE);
        for word in &self.key {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        buf
    }

    /// `type:u8=CLIENT_INFO_TYPE` followed by the client's revision,
    /// big-endian. 5 bytes.
    pub fn client_info_command(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.push(CLIENT_INFO_TYPE);
        buf.extend_from_slice(&self.revision.to_be_bytes());
        buf
    }
}

// ── Archive request ───────────────────────────────────────────────────────────

/// Priority class of an archive request. `Urgent` requests are serviced
/// ahead of `Prefetch` ones by the upstream server's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPriority {
    Prefetch = 0,
    Urgent = 1,
}

/// `(type:u8, index:u8, archive:u16)` — 4 bytes, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ArchiveRequest {
    pub priority: u8,
    pub index: u8,
    pub archive_hi: u8,
    pub archive_lo: u8,
}

assert_eq_size!(ArchiveRequest, [u8; 4]);

impl ArchiveRequest {
    pub fn new(priority: RequestPriority, index: u8, archive: u16) -> Self {
        let [hi, lo] = archive.to_be_bytes();
        Self {
            priority: priority as u8,
            index,
            archive_hi: hi,
            archive_lo: lo,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [self.priority, self.index, self.archive_hi, self.archive_lo]
    }
}

/// The `(index, archive)` key identifying a pending or completed request.
pub type RequestKey = (u8, u16);

// ── Archive response framing ──────────────────────────────────────────────────

/// The 8-byte routing preamble at the start of an archive response,
/// preceding the first 512-byte frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub index: u8,
    pub archive: u16,
    pub compression_type: u8,
    pub compressed_size: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        let archive = u16::from_be_bytes([bytes[1], bytes[2]]);
        let compressed_size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            index: bytes[0],
            archive,
            compression_type: bytes[3],
            compressed_size,
        }
    }

    pub fn key(&self) -> RequestKey {
        (self.index, self.archive)
    }

    /// Total bytes of reassembled payload this response carries:
    /// 1 compression-type byte + 4-byte size prefix + `compressed_size` data bytes.
    pub fn payload_len(&self) -> usize {
        5 + self.compressed_size as usize
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unexpected response for key {0:?}: no matching pending request")]
    UnexpectedResponse(RequestKey),

    #[error("malformed master index blob: length {0} is not a multiple of 8")]
    MalformedMasterIndex(usize),

    /// Not a failure in itself — `HANDSHAKE_NOT_OK` is a normal return, not
    /// an error (see `Client::handshake`). Kept here for its `Display` impl
    /// so rejection can be logged uniformly with everything else in this
    /// enum.
    #[error("handshake response was rejected with code {0}")]
    HandshakeRejected(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

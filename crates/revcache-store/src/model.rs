//! Mutable in-memory representation of a cache: the tree the reconciliation
//! driver diffs against and stages updates into before they're committed to
//! persistence.

use std::collections::BTreeMap;

use revcache_core::codec::ArchiveDescriptor;

/// One archive as tracked in the in-memory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveNode {
    pub id: u16,
    pub crc: u32,
    pub revision: i32,
    pub name_hash: u32,
    pub compressed_size: u32,
    pub decompressed_size: u32,
}

impl ArchiveNode {
    pub fn from_descriptor(desc: &ArchiveDescriptor) -> Self {
        Self {
            id: desc.id,
            crc: desc.crc,
            revision: desc.revision,
            name_hash: desc.name_hash,
            compressed_size: desc.compressed_size,
            decompressed_size: desc.decompressed_size,
        }
    }

    pub fn matches_descriptor(&self, desc: &ArchiveDescriptor) -> bool {
        self.crc == desc.crc
            && self.revision == desc.revision
            && self.name_hash == desc.name_hash
            && self.compressed_size == desc.compressed_size
            && self.decompressed_size == desc.decompressed_size
    }
}

/// One index's worth of archives, keyed by archive id.
#[derive(Debug, Clone, Default)]
pub struct IndexTree {
    pub id: u8,
    pub revision: i32,
    pub crc: u32,
    pub archives: BTreeMap<u16, ArchiveNode>,
}

impl IndexTree {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            revision: 0,
            crc: 0,
            archives: BTreeMap::new(),
        }
    }
}

/// The full in-memory cache tree: every index currently known, keyed by
/// index id.
#[derive(Debug, Clone, Default)]
pub struct Store {
    pub indexes: BTreeMap<u8, IndexTree>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, id: u8) -> Option<&IndexTree> {
        self.indexes.get(&id)
    }

    pub fn index_mut(&mut self, id: u8) -> &mut IndexTree {
        self.indexes.entry(id).or_insert_with(|| IndexTree::new(id))
    }

    pub fn remove_archive(&mut self, index: u8, archive: u16) -> Option<ArchiveNode> {
        self.indexes.get_mut(&index)?.archives.remove(&archive)
    }
}

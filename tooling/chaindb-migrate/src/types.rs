use ethereum_types::H256;
use serde::Serialize;

/// Resolved starting point of a migration: the highest canonical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainTip {
    pub height: u64,
    pub hash: H256,
}

impl ChainTip {
    pub fn new(height: u64, hash: H256) -> Self {
        Self { height, hash }
    }
}

/// One canonical block located by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub height: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

/// A descriptor together with the header bytes the walker already read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub descriptor: BlockDescriptor,
    pub header: Vec<u8>,
}

/// Everything the translator needs for one block. Body and receipts may be
/// absent in the source (pruned or never stored); the header never is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecordBundle {
    pub descriptor: BlockDescriptor,
    pub header: Vec<u8>,
    pub body: Option<Vec<u8>>,
    pub receipts: Option<Vec<u8>>,
}

impl BlockRecordBundle {
    pub fn height(&self) -> u64 {
        self.descriptor.height
    }
}

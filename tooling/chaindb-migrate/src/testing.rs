//! Synthetic chains for tests.
//!
//! Headers are minimal RLP lists `[parent_hash, number, extra]`, enough for the
//! walker to follow parent links. Hashes are derived from the height so a test
//! can compute the expected hash of any block without keeping the chain around.

use alloy_rlp::{Encodable, Header};
use ethereum_types::H256;

use crate::{
    api::{KeyValueStore, WriteBatch},
    error::StoreError,
    keys::{self, HEAD_BLOCK_KEY, RecordKind},
    reader::Namespace,
    types::ChainTip,
};

const BLOCKS_PER_SEED_BATCH: u64 = 1_000;

/// RLP list `[parent_hash, number, extra]`.
pub fn encode_header(parent_hash: H256, number: u64, extra: &[u8]) -> Vec<u8> {
    let parent_hash = parent_hash.0;
    let fields: [&dyn Encodable; 3] = [&parent_hash, &number, &extra];
    let payload_length = fields.iter().map(|field| field.length()).sum();
    let mut out = Vec::with_capacity(payload_length + 3);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for field in fields {
        field.encode(&mut out);
    }
    out
}

/// Deterministic, non-zero hash of the block at `height`.
pub fn block_hash(height: u64) -> H256 {
    let mut bytes = [0x5a; 32];
    bytes[24..].copy_from_slice(&height.to_be_bytes());
    H256(bytes)
}

#[derive(Debug, Clone)]
pub struct SyntheticBlock {
    pub height: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub header: Vec<u8>,
    pub body: Option<Vec<u8>>,
    pub receipts: Option<Vec<u8>>,
}

/// Builder for a linear chain of `len` blocks (heights `0..len`).
#[derive(Debug, Clone)]
pub struct SyntheticChain {
    namespace: Namespace,
    blocks: Vec<SyntheticBlock>,
    head_marker: bool,
}

impl SyntheticChain {
    pub fn new(len: u64) -> Self {
        assert!(len > 0, "a chain needs at least a genesis block");
        let blocks = (0..len)
            .map(|height| {
                let parent_hash = match height {
                    0 => H256::zero(),
                    _ => block_hash(height - 1),
                };
                SyntheticBlock {
                    height,
                    hash: block_hash(height),
                    parent_hash,
                    header: encode_header(parent_hash, height, &[0u8; 32]),
                    body: Some(alloy_rlp::encode(vec![height, height + 1])),
                    receipts: Some(alloy_rlp::encode(vec![height])),
                }
            })
            .collect();
        Self {
            namespace: Namespace::flat(),
            blocks,
            head_marker: true,
        }
    }

    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Drops the body of every block for which `predicate` holds.
    pub fn without_bodies(mut self, predicate: impl Fn(u64) -> bool) -> Self {
        for block in &mut self.blocks {
            if predicate(block.height) {
                block.body = None;
            }
        }
        self
    }

    pub fn without_receipts(mut self, predicate: impl Fn(u64) -> bool) -> Self {
        for block in &mut self.blocks {
            if predicate(block.height) {
                block.receipts = None;
            }
        }
        self
    }

    /// Leaves out the `LastBlock` marker so tip discovery has to scan.
    pub fn without_head_marker(mut self) -> Self {
        self.head_marker = false;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn blocks(&self) -> &[SyntheticBlock] {
        &self.blocks
    }

    pub fn block(&self, height: u64) -> &SyntheticBlock {
        &self.blocks[height as usize]
    }

    pub fn tip(&self) -> ChainTip {
        let last = &self.blocks[self.blocks.len() - 1];
        ChainTip::new(last.height, last.hash)
    }

    /// Writes the chain in source layout: block records, canonical mapping and
    /// hash→height, all behind the namespace.
    pub fn write_to(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        let ns = &self.namespace;
        for chunk in self.blocks.chunks(BLOCKS_PER_SEED_BATCH as usize) {
            let mut batch = WriteBatch::default();
            for block in chunk {
                let records = [
                    (RecordKind::Header, Some(&block.header)),
                    (RecordKind::Body, block.body.as_ref()),
                    (RecordKind::Receipts, block.receipts.as_ref()),
                ];
                for (kind, value) in records {
                    if let Some(value) = value {
                        batch.put(
                            keys::source_record_key(ns.as_bytes(), kind, block.height, block.hash),
                            value.clone(),
                        );
                    }
                }
                batch.put(
                    ns.apply(&keys::canonical_hash_key(block.height)),
                    block.hash.as_bytes().to_vec(),
                );
                batch.put(
                    ns.apply(&keys::header_number_key(block.hash)),
                    keys::encode_height(block.height).to_vec(),
                );
            }
            store.write_batch(batch)?;
        }
        if self.head_marker {
            store.put(&ns.apply(HEAD_BLOCK_KEY), self.tip().hash.as_bytes())?;
        }
        Ok(())
    }
}

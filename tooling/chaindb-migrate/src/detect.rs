//! Source layout detection
//!
//! Two things are discovered from the data itself when the caller does not
//! provide them:
//!
//! 1. the key namespace of the source store (flat or a 32-byte prefix), by
//!    looking at the shape of the first canonical block record key;
//! 2. the chain tip, from explicit arguments, marker keys or, as a last
//!    resort, the highest canonical mapping or header key.

use std::{fmt, ops::ControlFlow};

use ethereum_types::H256;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    api::KeyValueReader,
    error::MigrationError,
    keys::{
        self, BLOCK_RECORD_KEY_LEN, HASH_LEN, HEAD_BLOCK_KEY, HEADER_PREFIX, KeyClass,
        LAST_ACCEPTED_KEY, NAMESPACE_LEN, RecordKind,
    },
    reader::{ChainReader, Namespace},
    types::ChainTip,
};

pub const DEFAULT_NAMESPACE_SCAN_LIMIT: usize = 100_000;

/// Where the tip came from, reported alongside the migration summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TipSource {
    Explicit,
    HashLookup,
    HeightLookup,
    LastAcceptedMarker,
    LastBlockMarker,
    HighestCanonical,
    HighestHeader,
}

impl fmt::Display for TipSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Explicit => "explicit",
            Self::HashLookup => "hash lookup",
            Self::HeightLookup => "height lookup",
            Self::LastAcceptedMarker => "lastAccepted marker",
            Self::LastBlockMarker => "LastBlock marker",
            Self::HighestCanonical => "highest canonical mapping",
            Self::HighestHeader => "highest header key",
        };
        f.write_str(name)
    }
}

/// A key shaped like a block record, split into its namespace and record.
struct RecordCandidate {
    namespace: Vec<u8>,
    height: u64,
    hash: H256,
}

impl RecordCandidate {
    fn from_key(key: &[u8]) -> Option<Self> {
        let namespace_len = match key.len() {
            BLOCK_RECORD_KEY_LEN => 0,
            len if len == NAMESPACE_LEN + BLOCK_RECORD_KEY_LEN => NAMESPACE_LEN,
            _ => return None,
        };
        let (namespace, record) = key.split_at(namespace_len);
        let kind = RecordKind::from_tag(record[0])?;
        let (height, hash) = keys::parse_block_record_key(kind, record).ok()?;
        Some(Self {
            namespace: namespace.to_vec(),
            height,
            hash,
        })
    }

    /// Whether the canonical mapping under the same prefix points at this
    /// record. Rules out marker keys that happen to have a record's shape.
    fn is_canonical(&self, store: &dyn KeyValueReader) -> Result<bool, MigrationError> {
        let mut key = self.namespace.clone();
        key.extend_from_slice(&keys::canonical_hash_key(self.height));
        Ok(store.get(&key)?.as_deref() == Some(self.hash.as_bytes()))
    }
}

/// Finds the namespace of a source store by scanning at most `scan_limit`
/// keys from the start of the key space.
///
/// The first key shaped like a flat block record (`tag + num + hash`, 41
/// bytes) or a namespaced one (32-byte prefix followed by the same 41 bytes)
/// decides, provided the canonical mapping under that prefix names the
/// record's hash. Keys that only look like records are skipped.
pub fn discover_namespace(
    store: &dyn KeyValueReader,
    scan_limit: usize,
) -> Result<Namespace, MigrationError> {
    let mut scanned = 0usize;
    let mut start = Vec::new();
    while scanned < scan_limit {
        let mut candidate = None;
        let mut resume_after = None;
        store.scan_from(&start, &mut |key, _| {
            scanned += 1;
            candidate = RecordCandidate::from_key(key);
            if candidate.is_some() {
                resume_after = Some(key.to_vec());
            }
            if candidate.is_some() || scanned >= scan_limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;

        let (Some(candidate), Some(key)) = (candidate, resume_after) else {
            break;
        };
        if candidate.is_canonical(store)? {
            let namespace = Namespace::new(candidate.namespace)?;
            debug!(%namespace, scanned, "Discovered source namespace");
            return Ok(namespace);
        }
        debug!(
            key = %hex::encode(&key),
            "Skipping record-shaped key without canonical mapping"
        );
        start = key;
        start.push(0);
    }
    Err(MigrationError::NamespaceNotFound { scanned })
}

/// Highest entries in the `h` key space of a store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSpaceScan {
    pub highest_canonical: Option<ChainTip>,
    pub highest_header: Option<ChainTip>,
}

/// Walks every `h`-prefixed key once. Keys are big-endian by height, so the
/// last match of each shape is the highest.
pub fn scan_header_space(reader: &ChainReader) -> Result<HeaderSpaceScan, MigrationError> {
    let mut scan = HeaderSpaceScan::default();
    reader.scan_prefix(&[HEADER_PREFIX], &mut |key, value| {
        match keys::classify_key(key) {
            KeyClass::Canonical if value.len() == HASH_LEN => {
                if let Ok(height) = keys::parse_canonical_hash_key(key) {
                    scan.highest_canonical = Some(ChainTip::new(height, H256::from_slice(value)));
                }
            }
            KeyClass::Header => {
                if let Ok((height, hash)) = keys::parse_block_record_key(RecordKind::Header, key) {
                    scan.highest_header = Some(ChainTip::new(height, hash));
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    })?;
    Ok(scan)
}

/// Resolves the tip to start from.
///
/// Order: explicit hash and height; hash only (height via `H + hash`);
/// height only (hash via the canonical mapping); the `lastAccepted` then
/// `LastBlock` markers; the highest canonical mapping; the highest header key.
pub fn resolve_tip(
    reader: &ChainReader,
    hash: Option<H256>,
    height: Option<u64>,
) -> Result<(ChainTip, TipSource), MigrationError> {
    match (hash, height) {
        (Some(hash), Some(height)) => {
            return Ok((ChainTip::new(height, hash), TipSource::Explicit));
        }
        (Some(hash), None) => {
            let height = reader.header_number(hash)?.ok_or_else(|| {
                MigrationError::TipNotFound(format!("no block number stored for hash {hash:?}"))
            })?;
            return Ok((ChainTip::new(height, hash), TipSource::HashLookup));
        }
        (None, Some(height)) => {
            let hash = reader.canonical_hash(height)?.ok_or_else(|| {
                MigrationError::TipNotFound(format!("no canonical hash stored at height {height}"))
            })?;
            return Ok((ChainTip::new(height, hash), TipSource::HeightLookup));
        }
        (None, None) => {}
    }

    let markers = [
        (LAST_ACCEPTED_KEY, TipSource::LastAcceptedMarker),
        (HEAD_BLOCK_KEY, TipSource::LastBlockMarker),
    ];
    for (key, source) in markers {
        let Some(hash) = reader.marker_hash(key)? else {
            continue;
        };
        match reader.header_number(hash)? {
            Some(height) => return Ok((ChainTip::new(height, hash), source)),
            None => warn!(
                marker = %source,
                ?hash,
                "Marker points to a hash without a block number, ignoring"
            ),
        }
    }

    let scan = scan_header_space(reader)?;
    if let Some(tip) = scan.highest_canonical {
        return Ok((tip, TipSource::HighestCanonical));
    }
    if let Some(tip) = scan.highest_header {
        return Ok((tip, TipSource::HighestHeader));
    }
    Err(MigrationError::TipNotFound(
        "no marker, canonical mapping or header key found".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::KeyValueStore, backend::InMemoryBackend, testing::SyntheticChain};

    fn seeded(chain: &SyntheticChain) -> InMemoryBackend {
        let store = InMemoryBackend::new();
        chain.write_to(&store).unwrap();
        store
    }

    #[test]
    fn detects_flat_layout() {
        let store = seeded(&SyntheticChain::new(4));
        let namespace = discover_namespace(&store, DEFAULT_NAMESPACE_SCAN_LIMIT).unwrap();
        assert!(namespace.is_flat());
    }

    #[test]
    fn detects_namespaced_layout() {
        let namespace = Namespace::new(vec![0xc4; NAMESPACE_LEN]).unwrap();
        let store = seeded(&SyntheticChain::new(4).with_namespace(namespace.clone()));
        assert_eq!(
            discover_namespace(&store, DEFAULT_NAMESPACE_SCAN_LIMIT).unwrap(),
            namespace
        );
    }

    #[test]
    fn gives_up_after_scan_limit() {
        let store = InMemoryBackend::new();
        for i in 0u8..10 {
            store.put(&[b'a', i], b"noise").unwrap();
        }
        store
            .put(&keys::block_record_key(RecordKind::Header, 1, H256::zero()), b"h")
            .unwrap();
        store
            .put(&keys::canonical_hash_key(1), H256::zero().as_bytes())
            .unwrap();

        assert!(matches!(
            discover_namespace(&store, 5),
            Err(MigrationError::NamespaceNotFound { scanned: 5 })
        ));
        assert!(discover_namespace(&store, 100).unwrap().is_flat());
    }

    #[test]
    fn skips_marker_keys_shaped_like_records() {
        for first_byte in [HEADER_PREFIX, b'b', b'r'] {
            let namespace = Namespace::new(vec![first_byte; NAMESPACE_LEN]).unwrap();
            let chain = SyntheticChain::new(16).with_namespace(namespace.clone());
            let store = seeded(&chain);
            // `namespace || LastBlock` is 41 bytes and sorts before every record.
            assert_eq!(namespace.apply(HEAD_BLOCK_KEY).len(), BLOCK_RECORD_KEY_LEN);

            assert_eq!(
                discover_namespace(&store, DEFAULT_NAMESPACE_SCAN_LIMIT).unwrap(),
                namespace
            );
            let reader = ChainReader::new(&store, namespace);
            assert_eq!(
                resolve_tip(&reader, None, None).unwrap(),
                (chain.tip(), TipSource::LastBlockMarker)
            );
        }
    }

    #[test]
    fn skips_side_chain_records_without_canonical_mapping() {
        let chain = SyntheticChain::new(4);
        let store = seeded(&chain);
        let namespace = Namespace::new(vec![0x01; NAMESPACE_LEN]).unwrap();
        store
            .put(
                &keys::source_record_key(
                    namespace.as_bytes(),
                    RecordKind::Header,
                    2,
                    H256::repeat_byte(0x77),
                ),
                b"orphan",
            )
            .unwrap();

        assert!(
            discover_namespace(&store, DEFAULT_NAMESPACE_SCAN_LIMIT)
                .unwrap()
                .is_flat()
        );
    }

    #[test]
    fn resolves_tip_from_each_source() {
        let chain = SyntheticChain::new(10);
        let store = seeded(&chain);
        let reader = ChainReader::flat(&store);
        let tip = chain.tip();

        assert_eq!(
            resolve_tip(&reader, Some(tip.hash), Some(tip.height)).unwrap(),
            (tip, TipSource::Explicit)
        );
        assert_eq!(
            resolve_tip(&reader, Some(chain.block(4).hash), None).unwrap(),
            (ChainTip::new(4, chain.block(4).hash), TipSource::HashLookup)
        );
        assert_eq!(
            resolve_tip(&reader, None, Some(7)).unwrap(),
            (ChainTip::new(7, chain.block(7).hash), TipSource::HeightLookup)
        );
        assert_eq!(
            resolve_tip(&reader, None, None).unwrap(),
            (tip, TipSource::LastBlockMarker)
        );

        store.put(LAST_ACCEPTED_KEY, chain.block(8).hash.as_bytes()).unwrap();
        assert_eq!(
            resolve_tip(&reader, None, None).unwrap(),
            (ChainTip::new(8, chain.block(8).hash), TipSource::LastAcceptedMarker)
        );
    }

    #[test]
    fn falls_back_to_key_scans() {
        let chain = SyntheticChain::new(12).without_head_marker();
        let store = seeded(&chain);
        let reader = ChainReader::flat(&store);

        assert_eq!(
            resolve_tip(&reader, None, None).unwrap(),
            (chain.tip(), TipSource::HighestCanonical)
        );

        for block in chain.blocks() {
            store.delete(&keys::canonical_hash_key(block.height)).unwrap();
        }
        assert_eq!(
            resolve_tip(&reader, None, None).unwrap(),
            (chain.tip(), TipSource::HighestHeader)
        );
    }

    #[test]
    fn fails_on_empty_store() {
        let store = InMemoryBackend::new();
        let reader = ChainReader::flat(&store);
        assert!(matches!(
            resolve_tip(&reader, None, None),
            Err(MigrationError::TipNotFound(_))
        ));
        assert!(matches!(
            resolve_tip(&reader, None, Some(3)),
            Err(MigrationError::TipNotFound(_))
        ));
    }
}

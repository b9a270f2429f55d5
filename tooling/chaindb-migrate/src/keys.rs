//! Block database key schema
//!
//! Destination keys follow the go-ethereum `rawdb` layout expected by the
//! consuming runtime. Source keys use the same layout behind an optional
//! fixed-length namespace prefix.
//!
//! | Data              | Key format                               | Value            |
//! |-------------------|------------------------------------------|------------------|
//! | Block header      | `"h" + num(8 BE) + hash(32)`             | header bytes     |
//! | Block body        | `"b" + num(8 BE) + hash(32)`             | body bytes       |
//! | Block receipts    | `"r" + num(8 BE) + hash(32)`             | receipt bytes    |
//! | Canonical hash    | `"h" + num(8 BE) + "n"`                  | hash(32)         |
//! | Block number      | `"H" + hash(32)`                         | num(8 BE)        |
//! | Total difficulty  | `"h" + num(8 BE) + hash(32) + "t"`       | td scalar        |
//! | Head pointers     | `"LastHeader"`, `"LastBlock"`, ...       | hash(32)         |

use std::fmt;

use ethereum_types::H256;
use serde::Serialize;

use crate::error::KeyError;

pub const HASH_LEN: usize = 32;
pub const HEIGHT_LEN: usize = 8;
/// Length of the per-instance prefix used by namespaced source stores.
pub const NAMESPACE_LEN: usize = 32;

pub const HEADER_PREFIX: u8 = b'h';
pub const BODY_PREFIX: u8 = b'b';
pub const RECEIPTS_PREFIX: u8 = b'r';
pub const HEADER_NUMBER_PREFIX: u8 = b'H';
pub const HEADER_HASH_SUFFIX: u8 = b'n';
pub const HEADER_TD_SUFFIX: u8 = b't';

/// `tag + num + hash`
pub const BLOCK_RECORD_KEY_LEN: usize = 1 + HEIGHT_LEN + HASH_LEN;
/// `h + num + n`
pub const CANONICAL_KEY_LEN: usize = 1 + HEIGHT_LEN + 1;
/// `H + hash`
pub const HEADER_NUMBER_KEY_LEN: usize = 1 + HASH_LEN;
/// `h + num + hash + t`
pub const TD_KEY_LEN: usize = BLOCK_RECORD_KEY_LEN + 1;

pub const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
pub const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
pub const HEAD_FAST_BLOCK_KEY: &[u8] = b"LastFast";
pub const HEAD_FINALIZED_BLOCK_KEY: &[u8] = b"LastFinalized";

/// Every head pointer the runtime reads at startup.
pub const HEAD_POINTER_KEYS: [&[u8]; 4] = [
    HEAD_HEADER_KEY,
    HEAD_BLOCK_KEY,
    HEAD_FAST_BLOCK_KEY,
    HEAD_FINALIZED_BLOCK_KEY,
];

// Metadata store keys.
pub const LAST_ACCEPTED_KEY: &[u8] = b"lastAccepted";
pub const LAST_ACCEPTED_HEIGHT_KEY: &[u8] = b"lastAcceptedHeight";
pub const INITIALIZED_KEY: &[u8] = b"initialized";

/// Resume checkpoint kept in the destination while a bulk pass is in flight.
pub const WATERMARK_KEY: &[u8] = b"MigrationWatermark";

/// Chain config entry: `"ethereum-config-" + genesis hash(32)`.
pub const CHAIN_CONFIG_PREFIX: &[u8] = b"ethereum-config-";

/// Per-block records carried over from the source store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Header,
    Body,
    Receipts,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [Self::Header, Self::Body, Self::Receipts];

    pub const fn tag(self) -> u8 {
        match self {
            Self::Header => HEADER_PREFIX,
            Self::Body => BODY_PREFIX,
            Self::Receipts => RECEIPTS_PREFIX,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Body => "body",
            Self::Receipts => "receipts",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn encode_height(height: u64) -> [u8; HEIGHT_LEN] {
    height.to_be_bytes()
}

/// `tag + num(8 BE) + hash(32)` → header, body or receipts
pub fn block_record_key(kind: RecordKind, height: u64, hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(BLOCK_RECORD_KEY_LEN);
    key.push(kind.tag());
    key.extend_from_slice(&encode_height(height));
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `namespace + tag + num(8 BE) + hash(32)`
pub fn source_record_key(namespace: &[u8], kind: RecordKind, height: u64, hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(namespace.len() + BLOCK_RECORD_KEY_LEN);
    key.extend_from_slice(namespace);
    key.extend_from_slice(&block_record_key(kind, height, hash));
    key
}

/// `"h" + num(8 BE) + "n"` → canonical block hash
pub fn canonical_hash_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(CANONICAL_KEY_LEN);
    key.push(HEADER_PREFIX);
    key.extend_from_slice(&encode_height(height));
    key.push(HEADER_HASH_SUFFIX);
    key
}

/// `"H" + hash(32)` → block number (8-byte BE)
pub fn header_number_key(hash: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(HEADER_NUMBER_KEY_LEN);
    key.push(HEADER_NUMBER_PREFIX);
    key.extend_from_slice(hash.as_bytes());
    key
}

/// `"h" + num(8 BE) + hash(32) + "t"` → total difficulty
pub fn total_difficulty_key(height: u64, hash: H256) -> Vec<u8> {
    let mut key = block_record_key(RecordKind::Header, height, hash);
    key.push(HEADER_TD_SUFFIX);
    key
}

pub fn chain_config_key(genesis_hash: H256) -> Vec<u8> {
    let mut key = CHAIN_CONFIG_PREFIX.to_vec();
    key.extend_from_slice(genesis_hash.as_bytes());
    key
}

/// Parses `tag + num + hash` back into `(height, hash)`.
pub fn parse_block_record_key(kind: RecordKind, key: &[u8]) -> Result<(u64, H256), KeyError> {
    if key.len() != BLOCK_RECORD_KEY_LEN {
        return Err(KeyError::MalformedLength {
            kind: kind.as_str(),
            expected: BLOCK_RECORD_KEY_LEN,
            actual: key.len(),
        });
    }
    if key[0] != kind.tag() {
        return Err(KeyError::UnexpectedTag {
            kind: kind.as_str(),
            found: key[0],
        });
    }
    Ok((read_height(&key[1..9]), H256::from_slice(&key[9..])))
}

pub fn parse_canonical_hash_key(key: &[u8]) -> Result<u64, KeyError> {
    if key.len() != CANONICAL_KEY_LEN {
        return Err(KeyError::MalformedLength {
            kind: "canonical hash",
            expected: CANONICAL_KEY_LEN,
            actual: key.len(),
        });
    }
    if key[0] != HEADER_PREFIX || key[CANONICAL_KEY_LEN - 1] != HEADER_HASH_SUFFIX {
        return Err(KeyError::UnexpectedTag {
            kind: "canonical hash",
            found: key[0],
        });
    }
    Ok(read_height(&key[1..9]))
}

pub fn parse_header_number_key(key: &[u8]) -> Result<H256, KeyError> {
    if key.len() != HEADER_NUMBER_KEY_LEN {
        return Err(KeyError::MalformedLength {
            kind: "block number",
            expected: HEADER_NUMBER_KEY_LEN,
            actual: key.len(),
        });
    }
    if key[0] != HEADER_NUMBER_PREFIX {
        return Err(KeyError::UnexpectedTag {
            kind: "block number",
            found: key[0],
        });
    }
    Ok(H256::from_slice(&key[1..]))
}

pub fn parse_total_difficulty_key(key: &[u8]) -> Result<(u64, H256), KeyError> {
    if key.len() != TD_KEY_LEN {
        return Err(KeyError::MalformedLength {
            kind: "total difficulty",
            expected: TD_KEY_LEN,
            actual: key.len(),
        });
    }
    if key[TD_KEY_LEN - 1] != HEADER_TD_SUFFIX {
        return Err(KeyError::UnexpectedTag {
            kind: "total difficulty",
            found: key[TD_KEY_LEN - 1],
        });
    }
    parse_block_record_key(RecordKind::Header, &key[..BLOCK_RECORD_KEY_LEN])
}

fn read_height(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; HEIGHT_LEN];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

/// Coarse category of a (namespace-stripped) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClass {
    Canonical,
    Header,
    TotalDifficulty,
    Body,
    Receipts,
    HeaderNumber,
    HeadPointer,
    Other,
}

impl KeyClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Canonical => "canonical",
            Self::Header => "header",
            Self::TotalDifficulty => "total_difficulty",
            Self::Body => "body",
            Self::Receipts => "receipts",
            Self::HeaderNumber => "header_number",
            Self::HeadPointer => "head_pointer",
            Self::Other => "other",
        }
    }
}

/// Classifies a key by tag and exact length. Never fails: anything that does
/// not match a known layout is [`KeyClass::Other`].
pub fn classify_key(key: &[u8]) -> KeyClass {
    if HEAD_POINTER_KEYS.contains(&key) {
        return KeyClass::HeadPointer;
    }
    match (key.first().copied(), key.len()) {
        (Some(HEADER_PREFIX), CANONICAL_KEY_LEN)
            if key[CANONICAL_KEY_LEN - 1] == HEADER_HASH_SUFFIX =>
        {
            KeyClass::Canonical
        }
        (Some(HEADER_PREFIX), BLOCK_RECORD_KEY_LEN) => KeyClass::Header,
        (Some(HEADER_PREFIX), TD_KEY_LEN) if key[TD_KEY_LEN - 1] == HEADER_TD_SUFFIX => {
            KeyClass::TotalDifficulty
        }
        (Some(BODY_PREFIX), BLOCK_RECORD_KEY_LEN) => KeyClass::Body,
        (Some(RECEIPTS_PREFIX), BLOCK_RECORD_KEY_LEN) => KeyClass::Receipts,
        (Some(HEADER_NUMBER_PREFIX), HEADER_NUMBER_KEY_LEN) => KeyClass::HeaderNumber,
        _ => KeyClass::Other,
    }
}

//! RLP handling on top of `alloy-rlp`.
//!
//! The walker only needs the parent hash out of each header, which is the first
//! field of the header list, so headers are never fully decoded here.

use alloy_rlp::{Decodable, Header};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};

use crate::{error::DecodeError, keys::HASH_LEN};

/// Extracts the parent hash from an RLP-encoded block header without decoding
/// the remaining fields.
pub fn decode_parent_hash(header: &[u8]) -> Result<H256, DecodeError> {
    let mut buf = header;
    let mut fields = Header::decode_bytes(&mut buf, true)?;
    let parent_hash = Header::decode_bytes(&mut fields, false)?;
    if parent_hash.len() != HASH_LEN {
        return Err(DecodeError::BadLength {
            expected: HASH_LEN,
            actual: parent_hash.len(),
        });
    }
    Ok(H256::from_slice(parent_hash))
}

/// On-disk representation of the total difficulty scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TdEncoding {
    /// Big-endian bytes with leading zeros stripped.
    #[default]
    Raw,
    /// RLP scalar, as written by go-ethereum `rawdb.WriteTd`.
    Rlp,
}

impl std::str::FromStr for TdEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "rlp" => Ok(Self::Rlp),
            other => Err(format!("unknown TD encoding '{other}' (expected raw or rlp)")),
        }
    }
}

impl std::fmt::Display for TdEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Rlp => f.write_str("rlp"),
        }
    }
}

/// Total difficulty assigned to a height: monotonically increasing, one per block.
pub fn total_difficulty(height: u64) -> u128 {
    u128::from(height) + 1
}

fn minimal_be_bytes(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

pub fn encode_td(value: u128, encoding: TdEncoding) -> Vec<u8> {
    match encoding {
        TdEncoding::Raw => minimal_be_bytes(value),
        TdEncoding::Rlp => alloy_rlp::encode(value),
    }
}

pub fn decode_td(value: &[u8], encoding: TdEncoding) -> Result<u128, DecodeError> {
    match encoding {
        TdEncoding::Raw => decode_raw_scalar(value),
        TdEncoding::Rlp => {
            let mut buf = value;
            let td = u128::decode(&mut buf)?;
            if !buf.is_empty() {
                return Err(DecodeError::TrailingBytes(buf.len()));
            }
            Ok(td)
        }
    }
}

fn decode_raw_scalar(bytes: &[u8]) -> Result<u128, DecodeError> {
    if bytes.len() > 16 {
        return Err(DecodeError::BadLength {
            expected: 16,
            actual: bytes.len(),
        });
    }
    if bytes.first() == Some(&0) {
        return Err(DecodeError::NonCanonicalScalar);
    }
    Ok(bytes
        .iter()
        .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte)))
}

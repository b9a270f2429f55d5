use ethereum_types::H256;

use crate::{keys::RecordKind, verify::Violation};

/// Errors raised by the storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDB(#[from] rocksdb::Error),
    #[error("Store lock poisoned")]
    LockError,
    #[error("Store at {0} is opened read-only")]
    ReadOnly(String),
    #[error("{0}")]
    Custom(String),
}

/// A key whose length does not match the layout implied by its tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("malformed {kind} key: expected {expected} bytes, got {actual}")]
    MalformedLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unexpected tag 0x{found:02x} for {kind} key")]
    UnexpectedTag { kind: &'static str, found: u8 },
    #[error("namespace must be empty or {expected} bytes, got {actual}")]
    InvalidNamespace { expected: usize, actual: usize },
}

/// Record bytes that do not parse as the expected structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("RLP: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    #[error("value has unexpected length {actual} (expected {expected})")]
    BadLength { expected: usize, actual: usize },
    #[error("{0} trailing byte(s) after value")]
    TrailingBytes(usize),
    #[error("scalar value is not minimally encoded")]
    NonCanonicalScalar,
}

/// Stable classification of [`MigrationError`], used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    MissingRequiredRecord,
    Decode,
    StoreIo,
    InvariantViolation,
    Discovery,
    Internal,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingRequiredRecord => "missing_required_record",
            Self::Decode => "decode_error",
            Self::StoreIo => "store_io_error",
            Self::InvariantViolation => "invariant_violation",
            Self::Discovery => "discovery_error",
            Self::Internal => "internal_error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("missing {kind} record at height {height} (hash {hash:?})")]
    MissingRecord {
        kind: RecordKind,
        height: u64,
        hash: H256,
    },
    #[error("missing canonical hash at height {height}")]
    MissingCanonical { height: u64 },
    #[error("cannot decode {kind} record at height {height} (hash {hash:?}): {source}")]
    Decode {
        kind: RecordKind,
        height: u64,
        hash: H256,
        #[source]
        source: DecodeError,
    },
    #[error("malformed value under key {key}: {source}")]
    MalformedValue {
        key: String,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invariant violation at height {height}: {violation}")]
    InvariantViolation { height: u64, violation: Violation },
    #[error("cannot determine chain tip: {0}")]
    TipNotFound(String),
    #[error("no canonical block record key among the first {scanned} keys of the source store")]
    NamespaceNotFound { scanned: usize },
    #[error("pipeline stopped before genesis (next expected height {next_height})")]
    PipelineIncomplete { next_height: u64 },
    #[error("writer received block #{height} out of range (next expected #{next_height})")]
    UnexpectedHeight { height: u64, next_height: u64 },
    #[error("{0}")]
    Custom(String),
}

impl MigrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingRecord { .. } | Self::MissingCanonical { .. } => {
                ErrorClass::MissingRequiredRecord
            }
            Self::Decode { .. } | Self::MalformedValue { .. } | Self::Key(_) => ErrorClass::Decode,
            Self::Store(_) => ErrorClass::StoreIo,
            Self::InvariantViolation { .. } => ErrorClass::InvariantViolation,
            Self::TipNotFound(_) | Self::NamespaceNotFound { .. } => ErrorClass::Discovery,
            Self::PipelineIncomplete { .. } | Self::UnexpectedHeight { .. } | Self::Custom(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Height the failure is attributed to, when there is one.
    pub fn height(&self) -> Option<u64> {
        match self {
            Self::MissingRecord { height, .. }
            | Self::MissingCanonical { height }
            | Self::Decode { height, .. }
            | Self::InvariantViolation { height, .. }
            | Self::UnexpectedHeight { height, .. } => Some(*height),
            Self::PipelineIncomplete { next_height } => Some(*next_height),
            _ => None,
        }
    }
}

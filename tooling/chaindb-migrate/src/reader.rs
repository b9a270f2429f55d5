//! Namespace-aware access to a chain database.
//!
//! The source store may keep every key behind a fixed per-instance prefix. A
//! [`ChainReader`] hides that prefix: callers pass the flat key and get back
//! flat keys from scans. The destination is read through the same type with
//! an empty namespace.

use std::{fmt, ops::ControlFlow};

use ethereum_types::H256;
use serde::{Serialize, Serializer};

use crate::{
    api::KeyValueReader,
    error::{DecodeError, KeyError, MigrationError, StoreError},
    keys::{self, HASH_LEN, HEIGHT_LEN, NAMESPACE_LEN, RecordKind},
};

/// Key prefix of a namespaced store. Empty for a flat store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Namespace(Vec<u8>);

impl Namespace {
    pub fn flat() -> Self {
        Self(Vec::new())
    }

    pub fn new(bytes: Vec<u8>) -> Result<Self, KeyError> {
        if !bytes.is_empty() && bytes.len() != NAMESPACE_LEN {
            return Err(KeyError::InvalidNamespace {
                expected: NAMESPACE_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_flat(&self) -> bool {
        self.0.is_empty()
    }

    pub fn apply(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() + key.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(key);
        out
    }

    pub fn strip<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]> {
        key.strip_prefix(self.0.as_slice())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_flat() {
            f.write_str("<flat>")
        } else {
            write!(f, "0x{}", hex::encode(&self.0))
        }
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

#[derive(Clone)]
pub struct ChainReader<'a> {
    store: &'a dyn KeyValueReader,
    namespace: Namespace,
}

impl<'a> ChainReader<'a> {
    pub fn new(store: &'a dyn KeyValueReader, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    pub fn flat(store: &'a dyn KeyValueReader) -> Self {
        Self::new(store, Namespace::flat())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn store(&self) -> &'a dyn KeyValueReader {
        self.store
    }

    /// Reads a flat key through the namespace.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(&self.namespace.apply(key))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.store.contains(&self.namespace.apply(key))
    }

    pub fn record(
        &self,
        kind: RecordKind,
        height: u64,
        hash: H256,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(&keys::source_record_key(
            self.namespace.as_bytes(),
            kind,
            height,
            hash,
        ))
    }

    pub fn canonical_hash(&self, height: u64) -> Result<Option<H256>, MigrationError> {
        let key = keys::canonical_hash_key(height);
        match self.get(&key)? {
            Some(value) if value.len() == HASH_LEN => Ok(Some(H256::from_slice(&value))),
            Some(value) => Err(malformed(&key, HASH_LEN, value.len())),
            None => Ok(None),
        }
    }

    pub fn header_number(&self, hash: H256) -> Result<Option<u64>, MigrationError> {
        let key = keys::header_number_key(hash);
        match self.get(&key)? {
            Some(value) => {
                let bytes: [u8; HEIGHT_LEN] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| malformed(&key, HEIGHT_LEN, value.len()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Reads a 32-byte hash stored under a named marker key.
    pub fn marker_hash(&self, key: &[u8]) -> Result<Option<H256>, MigrationError> {
        match self.get(key)? {
            Some(value) if value.len() == HASH_LEN => Ok(Some(H256::from_slice(&value))),
            Some(value) => Err(malformed(key, HASH_LEN, value.len())),
            None => Ok(None),
        }
    }

    /// Visits every key under the flat `prefix`. The visitor sees keys with
    /// the namespace stripped.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        let namespace = &self.namespace;
        self.store.scan_prefix(&namespace.apply(prefix), &mut |key, value| {
            match namespace.strip(key) {
                Some(stripped) => visit(stripped, value),
                None => ControlFlow::Break(()),
            }
        })
    }
}

fn malformed(key: &[u8], expected: usize, actual: usize) -> MigrationError {
    MigrationError::MalformedValue {
        key: format!("0x{}", hex::encode(key)),
        source: DecodeError::BadLength { expected, actual },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::KeyValueStore,
        backend::InMemoryBackend,
        keys::{block_record_key, canonical_hash_key, header_number_key},
    };

    #[test]
    fn namespace_must_be_empty_or_fixed_length() {
        assert!(Namespace::new(Vec::new()).unwrap().is_flat());
        assert!(Namespace::new(vec![7u8; NAMESPACE_LEN]).is_ok());
        assert_eq!(
            Namespace::new(vec![7u8; 4]),
            Err(KeyError::InvalidNamespace {
                expected: NAMESPACE_LEN,
                actual: 4
            })
        );
    }

    #[test]
    fn reads_through_namespace() {
        let backend = InMemoryBackend::new();
        let namespace = Namespace::new(vec![0x11; NAMESPACE_LEN]).unwrap();
        let hash = H256::repeat_byte(0x22);

        backend
            .put(
                &namespace.apply(&block_record_key(RecordKind::Header, 3, hash)),
                b"header",
            )
            .unwrap();
        backend
            .put(&namespace.apply(&canonical_hash_key(3)), hash.as_bytes())
            .unwrap();
        backend
            .put(&namespace.apply(&header_number_key(hash)), &3u64.to_be_bytes())
            .unwrap();

        let reader = ChainReader::new(&backend, namespace);
        assert_eq!(
            reader.record(RecordKind::Header, 3, hash).unwrap(),
            Some(b"header".to_vec())
        );
        assert_eq!(reader.record(RecordKind::Body, 3, hash).unwrap(), None);
        assert_eq!(reader.canonical_hash(3).unwrap(), Some(hash));
        assert_eq!(reader.header_number(hash).unwrap(), Some(3));

        let flat = ChainReader::flat(&backend);
        assert_eq!(flat.canonical_hash(3).unwrap(), None);
    }

    #[test]
    fn rejects_malformed_canonical_value() {
        let backend = InMemoryBackend::new();
        backend.put(&canonical_hash_key(9), &[1, 2, 3]).unwrap();
        let reader = ChainReader::flat(&backend);
        assert!(matches!(
            reader.canonical_hash(9),
            Err(MigrationError::MalformedValue { .. })
        ));
    }

    #[test]
    fn scan_strips_namespace() {
        let backend = InMemoryBackend::new();
        let namespace = Namespace::new(vec![0x01; NAMESPACE_LEN]).unwrap();
        backend.put(&namespace.apply(b"h-one"), b"1").unwrap();
        backend.put(&namespace.apply(b"h-two"), b"2").unwrap();
        backend.put(b"h-flat", b"3").unwrap();

        let reader = ChainReader::new(&backend, namespace);
        let mut keys = Vec::new();
        reader
            .scan_prefix(b"h", &mut |key, _| {
                keys.push(key.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(keys, vec![b"h-one".to_vec(), b"h-two".to_vec()]);
    }
}

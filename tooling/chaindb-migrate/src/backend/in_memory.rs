use std::{
    collections::BTreeMap,
    ops::{Bound, ControlFlow},
    sync::{Arc, RwLock},
};

use crate::{
    api::{BatchOp, KeyValueReader, KeyValueStore, WriteBatch},
    error::StoreError,
};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered in-memory store. Clones share the same underlying table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<RwLock<Table>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the full contents, for byte-level comparisons.
    pub fn snapshot(&self) -> Result<Table, StoreError> {
        Ok(self.inner.read().map_err(|_| StoreError::LockError)?.clone())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().map_err(|_| StoreError::LockError)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl KeyValueReader for InMemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .inner
            .read()
            .map_err(|_| StoreError::LockError)?
            .get(key)
            .cloned())
    }

    fn scan_from(
        &self,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        let table = self.inner.read().map_err(|_| StoreError::LockError)?;
        for (key, value) in table.range::<[u8], _>((Bound::Included(start), Bound::Unbounded)) {
            if visit(key, value).is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl KeyValueStore for InMemoryBackend {
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut table = self.inner.write().map_err(|_| StoreError::LockError)?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    table.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    table.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_applied_in_order() {
        let store = InMemoryBackend::new();
        let mut batch = WriteBatch::default();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.delete(b"a".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn scan_prefix_stops_at_prefix_boundary() {
        let store = InMemoryBackend::new();
        for key in [&b"ha"[..], &b"hb"[..], &b"i"[..], &b"g"[..]] {
            store.put(key, b"v").unwrap();
        }

        let mut seen = Vec::new();
        store
            .scan_prefix(b"h", &mut |key, _| {
                seen.push(key.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen, vec![b"ha".to_vec(), b"hb".to_vec()]);
    }

    #[test]
    fn clones_share_contents() {
        let store = InMemoryBackend::new();
        let view = store.clone();
        store.put(b"k", b"v").unwrap();
        assert!(view.contains(b"k").unwrap());
        assert_eq!(view.len().unwrap(), 1);
    }
}

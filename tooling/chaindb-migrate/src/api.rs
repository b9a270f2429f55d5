//! Storage traits shared by the source reader, the destination writer and
//! the metadata store.

use std::ops::ControlFlow;

use crate::error::StoreError;

/// Read access to a byte-keyed, byte-ordered key-value store.
pub trait KeyValueReader: Send + Sync {
    /// Reads a value for the given key
    ///
    /// # Returns
    /// - `Ok(Some(value))` if the key exists
    /// - `Ok(None)` if the key does not exist
    /// - `Err(_)` on I/O or database errors
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Checks if a key exists in the database
    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Visits every entry with `key >= start` in ascending key order until the
    /// visitor returns [`ControlFlow::Break`] or the key space is exhausted.
    fn scan_from(
        &self,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError>;

    /// Visits every entry whose key starts with `prefix`, in ascending order.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        self.scan_from(prefix, &mut |key, value| {
            if !key.starts_with(prefix) {
                return ControlFlow::Break(());
            }
            visit(key, value)
        })
    }
}

/// Read-write store. Every [`WriteBatch`] is applied atomically.
pub trait KeyValueStore: KeyValueReader {
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put(key.to_vec(), value.to_vec());
        self.write_batch(batch)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete(key.to_vec());
        self.write_batch(batch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered list of puts and deletes committed as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Number of operations (puts and deletes) in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

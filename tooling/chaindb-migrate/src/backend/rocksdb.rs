//! RocksDB-backed store
//!
//! The source chain database is opened read-only so that nothing in the
//! migration can mutate it. Destination and metadata stores are opened
//! read-write and created when missing.

use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
};

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use crate::{
    api::{BatchOp, KeyValueReader, KeyValueStore, WriteBatch},
    error::StoreError,
};

pub struct RocksDBBackend {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    path: PathBuf,
    read_only: bool,
}

impl RocksDBBackend {
    /// Opens (or creates) a database for writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(4);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            read_only: false,
        })
    }

    /// Opens an existing database in read-only mode.
    ///
    /// # Errors
    /// - If the directory does not hold a database (missing, corrupted,
    ///   incompatible version, ...)
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut opts = Options::default();

        // Read-only mode: prevent any modifications
        opts.set_disable_auto_compactions(true);
        opts.set_allow_mmap_reads(true);
        opts.set_max_background_jobs(4);

        let db = DBWithThreadMode::<MultiThreaded>::open_for_read_only(&opts, path, false)?;
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
            read_only: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueReader for RocksDBBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?)
    }

    fn scan_from(
        &self,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<(), StoreError> {
        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item?;
            if visit(&key, &value).is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl KeyValueStore for RocksDBBackend {
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly(self.path.display().to_string()));
        }
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => rocks_batch.put(key, value),
                BatchOp::Delete(key) => rocks_batch.delete(key),
            }
        }
        self.db.write(rocks_batch)?;
        Ok(())
    }
}

pub mod in_memory;
pub mod rocksdb;

pub use self::in_memory::InMemoryBackend;
pub use self::rocksdb::RocksDBBackend;

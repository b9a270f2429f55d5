//! Chain database migration library
//!
//! Re-encodes the block data of a (possibly namespaced) go-ethereum style
//! chain database into the flat `rawdb` layout, walking the canonical chain
//! from its tip down to genesis, then writes the head pointers and bootstrap
//! state the destination runtime needs to start from the migrated tip.

pub mod api;
pub mod backend;
pub mod config;
pub mod detect;
pub mod error;
pub mod finalize;
pub mod inspect;
pub mod keys;
pub mod migrate;
pub mod pipeline;
pub mod reader;
pub mod rlp;
pub mod testing;
pub mod translate;
pub mod types;
pub mod verify;

pub use error::{MigrationError, StoreError};
pub use migrate::{MigrationRequest, MigrationSummary, migrate};

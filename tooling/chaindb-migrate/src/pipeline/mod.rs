//! Bulk migration pipeline
//!
//! ```text
//! walker ──(headers)──> enrichment pool (N) ──(bundles)──> batch writer ──> destination
//! ```
//!
//! Stages run on scoped threads connected by bounded channels. The walker also
//! holds one permit per block that is not yet appended, which caps the reorder
//! buffer when a slow worker holds back the next height. Errors travel
//! downstream as values; when the writer stops, dropping its receivers makes
//! every upstream `send` fail, which unwinds the remaining stages.

pub mod enrich;
pub mod walker;
pub mod writer;

use std::thread;

use crossbeam::channel::bounded;
use tracing::debug;

use crate::{
    api::KeyValueStore, config::MigrationConfig, error::MigrationError, reader::ChainReader,
    types::ChainTip,
};

pub use walker::BlockCursor;
pub use writer::{BatchWriter, Watermark, WriterStats};

/// Migrates every block from `start` down to genesis.
///
/// `tip` identifies the run in the watermark; `start` is the tip itself for a
/// fresh run or the block below the watermark when resuming.
pub fn run(
    source: &ChainReader,
    dest: &dyn KeyValueStore,
    tip: ChainTip,
    start: BlockCursor,
    config: &MigrationConfig,
) -> Result<WriterStats, MigrationError> {
    config.validate()?;
    let (header_tx, header_rx) = bounded(config.queue_capacity);
    let (bundle_tx, bundle_rx) = bounded(config.queue_capacity);
    let (permit_tx, permit_rx) = bounded(config.in_flight_limit());

    thread::scope(|scope| {
        scope.spawn(move || walker::walk(source, start, permit_tx, header_tx));
        for _ in 0..config.workers {
            let receiver = header_rx.clone();
            let sender = bundle_tx.clone();
            scope.spawn(move || enrich::enrich(source, receiver, sender));
        }
        drop(header_rx);
        drop(bundle_tx);
        debug!(workers = config.workers, height = start.height, "Pipeline started");

        BatchWriter::new(dest, tip, start.height, config)
            .with_permits(permit_rx)
            .run(bundle_rx)
    })
}

//! Batch writer
//!
//! Single consumer of the enrichment pool. Bundles arrive in any order; the
//! writer buffers them and appends strictly by descending height, so every
//! committed batch extends a contiguous range below the tip. A batch is
//! committed when it holds `batch_records` records or when `batch_interval`
//! has passed since the previous commit, whichever comes first.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use ethereum_types::H256;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    api::{KeyValueReader, KeyValueStore, WriteBatch},
    config::MigrationConfig,
    error::{DecodeError, MigrationError},
    keys::{HASH_LEN, HEIGHT_LEN, WATERMARK_KEY},
    rlp::TdEncoding,
    translate::translate,
    types::{BlockDescriptor, BlockRecordBundle, ChainTip},
};

const WATERMARK_LEN: usize = HASH_LEN + HEIGHT_LEN + HASH_LEN;

/// Resume checkpoint: the lowest block committed so far for a given tip.
///
/// Stored as `tip_hash || be64(height) || parent_hash` in the same atomic
/// batch as the records it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub tip_hash: H256,
    pub height: u64,
    pub parent_hash: H256,
}

impl Watermark {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WATERMARK_LEN);
        out.extend_from_slice(self.tip_hash.as_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(self.parent_hash.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != WATERMARK_LEN {
            return Err(DecodeError::BadLength {
                expected: WATERMARK_LEN,
                actual: bytes.len(),
            });
        }
        let mut height = [0u8; HEIGHT_LEN];
        height.copy_from_slice(&bytes[HASH_LEN..HASH_LEN + HEIGHT_LEN]);
        Ok(Self {
            tip_hash: H256::from_slice(&bytes[..HASH_LEN]),
            height: u64::from_be_bytes(height),
            parent_hash: H256::from_slice(&bytes[HASH_LEN + HEIGHT_LEN..]),
        })
    }

    pub fn load(store: &dyn KeyValueReader) -> Result<Option<Self>, MigrationError> {
        store
            .get(WATERMARK_KEY)?
            .map(|bytes| {
                Self::decode(&bytes).map_err(|source| MigrationError::MalformedValue {
                    key: String::from_utf8_lossy(WATERMARK_KEY).into_owned(),
                    source,
                })
            })
            .transpose()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Blocks appended to the destination.
    pub blocks: u64,
    /// Destination records written (watermark excluded).
    pub records: u64,
    pub batches: u64,
    pub missing_bodies: u64,
    pub missing_receipts: u64,
}

pub struct BatchWriter<'a> {
    dest: &'a dyn KeyValueStore,
    tip: ChainTip,
    td_encoding: TdEncoding,
    batch_records: usize,
    batch_interval: Duration,
    /// Next height to append; `None` once genesis has been appended.
    next_height: Option<u64>,
    reorder: BTreeMap<u64, BlockRecordBundle>,
    /// Walker slots, freed one per appended block.
    permits: Option<Receiver<()>>,
    batch: WriteBatch,
    batch_lowest: Option<BlockDescriptor>,
    last_commit: Instant,
    stats: WriterStats,
}

impl<'a> BatchWriter<'a> {
    pub fn new(
        dest: &'a dyn KeyValueStore,
        tip: ChainTip,
        start_height: u64,
        config: &MigrationConfig,
    ) -> Self {
        Self {
            dest,
            tip,
            td_encoding: config.td_encoding,
            batch_records: config.batch_records,
            batch_interval: config.batch_interval,
            next_height: Some(start_height),
            reorder: BTreeMap::new(),
            permits: None,
            batch: WriteBatch::default(),
            batch_lowest: None,
            last_commit: Instant::now(),
            stats: WriterStats::default(),
        }
    }

    /// Frees one walker slot from `permits` per appended block.
    pub fn with_permits(mut self, permits: Receiver<()>) -> Self {
        self.permits = Some(permits);
        self
    }

    /// Consumes bundles until genesis has been committed.
    ///
    /// The first error received, or raised by a commit, aborts the run: the
    /// pending batch is discarded and only earlier commits remain.
    pub fn run(
        mut self,
        receiver: Receiver<Result<BlockRecordBundle, MigrationError>>,
    ) -> Result<WriterStats, MigrationError> {
        while let Some(next_height) = self.next_height {
            let received = if self.batch.is_empty() {
                receiver.recv().ok()
            } else {
                let remaining = self.batch_interval.saturating_sub(self.last_commit.elapsed());
                match receiver.recv_timeout(remaining) {
                    Ok(item) => Some(item),
                    Err(RecvTimeoutError::Timeout) => {
                        self.commit()?;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            };
            let Some(item) = received else {
                return Err(MigrationError::PipelineIncomplete { next_height });
            };
            self.accept(item?)?;
            if !self.batch.is_empty() && self.last_commit.elapsed() >= self.batch_interval {
                self.commit()?;
            }
        }
        if !self.batch.is_empty() {
            self.commit()?;
        }
        Ok(self.stats)
    }

    fn accept(&mut self, bundle: BlockRecordBundle) -> Result<(), MigrationError> {
        let height = bundle.height();
        match self.next_height {
            Some(next_height) if height <= next_height && !self.reorder.contains_key(&height) => {
                self.reorder.insert(height, bundle);
            }
            next_height => {
                return Err(MigrationError::UnexpectedHeight {
                    height,
                    next_height: next_height.unwrap_or_default(),
                });
            }
        }

        while let Some(next_height) = self.next_height {
            let Some(bundle) = self.reorder.remove(&next_height) else {
                break;
            };
            self.append(bundle);
            self.next_height = next_height.checked_sub(1);
            if self.batch.len() >= self.batch_records {
                self.commit()?;
            }
        }
        Ok(())
    }

    fn append(&mut self, bundle: BlockRecordBundle) {
        if bundle.body.is_none() {
            self.stats.missing_bodies += 1;
        }
        if bundle.receipts.is_none() {
            self.stats.missing_receipts += 1;
        }
        self.batch_lowest = Some(bundle.descriptor);
        self.stats.blocks += 1;
        if let Some(permits) = &self.permits {
            let _ = permits.try_recv();
        }
        translate(bundle, self.td_encoding, &mut self.batch);
    }

    fn commit(&mut self) -> Result<(), MigrationError> {
        let mut batch = std::mem::take(&mut self.batch);
        let records = batch.len();
        if let Some(lowest) = self.batch_lowest.take() {
            let watermark = Watermark {
                tip_hash: self.tip.hash,
                height: lowest.height,
                parent_hash: lowest.parent_hash,
            };
            batch.put(WATERMARK_KEY.to_vec(), watermark.encode());
            debug!(height = lowest.height, "Advancing watermark");
        }
        self.dest.write_batch(batch)?;

        self.stats.records += records as u64;
        self.stats.batches += 1;
        self.last_commit = Instant::now();
        info!(
            batch = self.stats.batches,
            records,
            blocks = self.stats.blocks,
            next_height = ?self.next_height,
            "Committed batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::InMemoryBackend,
        keys::{self, RecordKind},
        types::BlockDescriptor,
    };
    use crossbeam::channel::{bounded, unbounded};

    fn bundle(height: u64) -> BlockRecordBundle {
        BlockRecordBundle {
            descriptor: BlockDescriptor {
                height,
                hash: H256::from_low_u64_be(height + 1),
                parent_hash: H256::from_low_u64_be(height),
            },
            header: vec![height as u8],
            body: Some(vec![]),
            receipts: None,
        }
    }

    fn tip(height: u64) -> ChainTip {
        ChainTip::new(height, H256::from_low_u64_be(height + 1))
    }

    #[test]
    fn watermark_encoding_is_fixed_width() {
        let watermark = Watermark {
            tip_hash: H256::repeat_byte(1),
            height: 42,
            parent_hash: H256::repeat_byte(2),
        };
        let encoded = watermark.encode();
        assert_eq!(encoded.len(), 72);
        assert_eq!(Watermark::decode(&encoded), Ok(watermark));
        assert!(Watermark::decode(&encoded[1..]).is_err());
    }

    #[test]
    fn reorders_out_of_order_bundles() {
        let dest = InMemoryBackend::new();
        let (tx, rx) = unbounded();
        for height in [2, 4, 0, 3, 1] {
            tx.send(Ok(bundle(height))).unwrap();
        }
        drop(tx);

        let config = MigrationConfig {
            batch_records: 1,
            ..Default::default()
        };
        let stats = BatchWriter::new(&dest, tip(4), 4, &config).run(rx).unwrap();

        assert_eq!(stats.blocks, 5);
        assert_eq!(stats.missing_receipts, 5);
        assert_eq!(stats.missing_bodies, 0);
        // One block per batch with a single-record threshold.
        assert_eq!(stats.batches, 5);
        assert_eq!(stats.records, 25);
        for height in 0..=4 {
            assert!(dest.contains(&keys::canonical_hash_key(height)).unwrap());
        }
        let watermark = Watermark::load(&dest).unwrap().unwrap();
        assert_eq!(watermark.height, 0);
    }

    #[test]
    fn frees_one_permit_per_appended_block() {
        let dest = InMemoryBackend::new();
        let (permit_tx, permit_rx) = bounded(8);
        for _ in 0..5 {
            permit_tx.send(()).unwrap();
        }
        let (tx, rx) = unbounded();
        for height in [2, 1] {
            tx.send(Ok(bundle(height))).unwrap();
        }
        drop(tx);

        let config = MigrationConfig::default();
        let result = BatchWriter::new(&dest, tip(3), 3, &config)
            .with_permits(permit_rx)
            .run(rx);
        assert!(matches!(
            result,
            Err(MigrationError::PipelineIncomplete { next_height: 3 })
        ));
        // Nothing was appended while height 3 was missing.
        assert_eq!(permit_tx.len(), 5);

        let (permit_tx, permit_rx) = bounded(8);
        for _ in 0..5 {
            permit_tx.send(()).unwrap();
        }
        let (tx, rx) = unbounded();
        for height in [2, 0, 3, 1] {
            tx.send(Ok(bundle(height))).unwrap();
        }
        let stats = BatchWriter::new(&dest, tip(3), 3, &config)
            .with_permits(permit_rx)
            .run(rx)
            .unwrap();
        assert_eq!(stats.blocks, 4);
        assert_eq!(permit_tx.len(), 1);
    }

    #[test]
    fn error_discards_pending_batch() {
        let dest = InMemoryBackend::new();
        let (tx, rx) = unbounded();
        tx.send(Ok(bundle(9))).unwrap();
        tx.send(Ok(bundle(8))).unwrap();
        tx.send(Err(MigrationError::MissingRecord {
            kind: RecordKind::Header,
            height: 7,
            hash: H256::zero(),
        }))
        .unwrap();

        let config = MigrationConfig::default();
        let result = BatchWriter::new(&dest, tip(9), 9, &config).run(rx);
        assert!(matches!(
            result,
            Err(MigrationError::MissingRecord { height: 7, .. })
        ));
        assert!(dest.is_empty().unwrap());
    }

    #[test]
    fn disconnect_before_genesis_is_incomplete() {
        let dest = InMemoryBackend::new();
        let (tx, rx) = unbounded();
        tx.send(Ok(bundle(3))).unwrap();
        drop(tx);

        let config = MigrationConfig::default();
        let result = BatchWriter::new(&dest, tip(3), 3, &config).run(rx);
        assert!(matches!(
            result,
            Err(MigrationError::PipelineIncomplete { next_height: 2 })
        ));
    }

    #[test]
    fn rejects_heights_above_cursor() {
        let dest = InMemoryBackend::new();
        let (tx, rx) = unbounded();
        tx.send(Ok(bundle(6))).unwrap();
        drop(tx);

        let config = MigrationConfig::default();
        let result = BatchWriter::new(&dest, tip(6), 5, &config).run(rx);
        assert!(matches!(
            result,
            Err(MigrationError::UnexpectedHeight { height: 6, next_height: 5 })
        ));
    }

    #[test]
    fn idle_writer_flushes_on_interval() {
        let dest = InMemoryBackend::new();
        let (tx, rx) = bounded(4);
        let config = MigrationConfig {
            batch_interval: Duration::from_millis(20),
            ..Default::default()
        };

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| BatchWriter::new(&dest, tip(1), 1, &config).run(rx));

            tx.send(Ok(bundle(1))).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !dest.contains(&keys::canonical_hash_key(1)).unwrap() {
                assert!(Instant::now() < deadline, "interval flush did not happen");
                std::thread::sleep(Duration::from_millis(5));
            }
            assert!(!dest.contains(&keys::canonical_hash_key(0)).unwrap());

            tx.send(Ok(bundle(0))).unwrap();
            let stats = writer.join().unwrap().unwrap();
            assert_eq!(stats.batches, 2);
        });
    }
}

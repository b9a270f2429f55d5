//! Chain walker
//!
//! Follows parent links from a cursor down to genesis. This is the only
//! sequential stage: the parent of block `h` is only known once header `h`
//! has been read.

use crossbeam::channel::Sender;
use ethereum_types::H256;
use tracing::{debug, info};

use crate::{
    error::MigrationError,
    keys::RecordKind,
    reader::ChainReader,
    rlp,
    types::{BlockDescriptor, HeaderRecord},
};

const PROGRESS_INTERVAL: u64 = 10_000;

/// Position of the walker: the next block to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCursor {
    pub height: u64,
    pub hash: H256,
}

/// Reads the header at `cursor` and extracts its parent link. Genesis gets a
/// zero parent without decoding.
pub fn read_header(
    reader: &ChainReader,
    cursor: BlockCursor,
) -> Result<HeaderRecord, MigrationError> {
    let BlockCursor { height, hash } = cursor;
    let header = reader
        .record(RecordKind::Header, height, hash)?
        .ok_or(MigrationError::MissingRecord {
            kind: RecordKind::Header,
            height,
            hash,
        })?;
    let parent_hash = match height {
        0 => H256::zero(),
        _ => rlp::decode_parent_hash(&header).map_err(|source| MigrationError::Decode {
            kind: RecordKind::Header,
            height,
            hash,
            source,
        })?,
    };
    Ok(HeaderRecord {
        descriptor: BlockDescriptor {
            height,
            hash,
            parent_hash,
        },
        header,
    })
}

/// Emits one [`HeaderRecord`] per block from `start` down to genesis.
///
/// Every block first takes a slot in `permits`, which the writer frees once
/// the block is appended; a full `permits` channel pauses the walk. A failure
/// is sent downstream as the last item. The walk also stops, silently, as
/// soon as the downstream side hangs up.
pub fn walk(
    reader: &ChainReader,
    start: BlockCursor,
    permits: Sender<()>,
    sender: Sender<Result<HeaderRecord, MigrationError>>,
) {
    let mut cursor = start;
    let mut walked = 0u64;
    loop {
        if permits.send(()).is_err() {
            debug!(height = cursor.height, "Walker stopped: writer closed");
            return;
        }
        let item = read_header(reader, cursor);
        let next = match &item {
            Ok(record) if record.descriptor.height > 0 => Some(BlockCursor {
                height: record.descriptor.height - 1,
                hash: record.descriptor.parent_hash,
            }),
            _ => None,
        };
        if sender.send(item).is_err() {
            debug!(height = cursor.height, "Walker stopped: downstream closed");
            return;
        }
        walked += 1;
        if walked % PROGRESS_INTERVAL == 0 {
            info!(height = cursor.height, walked, "Walking chain");
        }
        match next {
            Some(next) => cursor = next,
            None => return,
        }
    }
}

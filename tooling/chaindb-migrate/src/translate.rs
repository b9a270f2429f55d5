//! Source bundle → destination records.

use crate::{
    api::WriteBatch,
    keys::{self, RecordKind},
    rlp::{self, TdEncoding},
    types::BlockRecordBundle,
};

/// Appends the destination records of one block to `batch` and returns how
/// many were added.
///
/// Order within the block: canonical mapping, header, body, receipts,
/// hash→height, total difficulty. Absent body/receipts are skipped.
pub fn translate(
    bundle: BlockRecordBundle,
    td_encoding: TdEncoding,
    batch: &mut WriteBatch,
) -> usize {
    let BlockRecordBundle {
        descriptor,
        header,
        body,
        receipts,
    } = bundle;
    let (height, hash) = (descriptor.height, descriptor.hash);
    let before = batch.len();

    batch.put(keys::canonical_hash_key(height), hash.as_bytes().to_vec());
    batch.put(keys::block_record_key(RecordKind::Header, height, hash), header);
    if let Some(body) = body {
        batch.put(keys::block_record_key(RecordKind::Body, height, hash), body);
    }
    if let Some(receipts) = receipts {
        batch.put(keys::block_record_key(RecordKind::Receipts, height, hash), receipts);
    }
    batch.put(keys::header_number_key(hash), keys::encode_height(height).to_vec());
    batch.put(
        keys::total_difficulty_key(height, hash),
        rlp::encode_td(rlp::total_difficulty(height), td_encoding),
    );

    batch.len() - before
}

use crossbeam::channel::{Receiver, Sender};
use tracing::trace;

use crate::{
    error::MigrationError,
    keys::RecordKind,
    reader::ChainReader,
    types::{BlockRecordBundle, HeaderRecord},
};

/// Attaches body and receipts to a header. Either may be absent.
pub fn fetch_bundle(
    reader: &ChainReader,
    record: HeaderRecord,
) -> Result<BlockRecordBundle, MigrationError> {
    let HeaderRecord { descriptor, header } = record;
    let body = reader.record(RecordKind::Body, descriptor.height, descriptor.hash)?;
    let receipts = reader.record(RecordKind::Receipts, descriptor.height, descriptor.hash)?;
    if body.is_none() || receipts.is_none() {
        trace!(
            height = descriptor.height,
            body = body.is_some(),
            receipts = receipts.is_some(),
            "Block has missing optional records"
        );
    }
    Ok(BlockRecordBundle {
        descriptor,
        header,
        body,
        receipts,
    })
}

/// Worker loop of the enrichment pool. Upstream errors are forwarded
/// unchanged; the loop ends when either side hangs up.
pub fn enrich(
    reader: &ChainReader,
    receiver: Receiver<Result<HeaderRecord, MigrationError>>,
    sender: Sender<Result<BlockRecordBundle, MigrationError>>,
) {
    for item in receiver.iter() {
        let bundle = item.and_then(|record| fetch_bundle(reader, record));
        if sender.send(bundle).is_err() {
            return;
        }
    }
}

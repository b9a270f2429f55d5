//! Head pointers and runtime bootstrap state, written once the bulk pass has
//! drained. Rewriting them is a no-op at the byte level.

use tracing::info;

use crate::{
    api::{KeyValueStore, WriteBatch},
    error::MigrationError,
    keys::{
        self, HEAD_POINTER_KEYS, INITIALIZED_KEY, LAST_ACCEPTED_HEIGHT_KEY, LAST_ACCEPTED_KEY,
        WATERMARK_KEY,
    },
    reader::ChainReader,
    types::ChainTip,
};

pub const INITIALIZED_VALUE: u8 = 1;

/// `LastHeader`, `LastBlock`, `LastFast` and `LastFinalized` → tip hash.
pub fn head_pointer_batch(tip: ChainTip) -> WriteBatch {
    let mut batch = WriteBatch::default();
    for key in HEAD_POINTER_KEYS {
        batch.put(key.to_vec(), tip.hash.as_bytes().to_vec());
    }
    batch
}

/// Bootstrap state the runtime reads from its metadata store at startup.
pub fn bootstrap_batch(tip: ChainTip) -> WriteBatch {
    let mut batch = WriteBatch::default();
    batch.put(LAST_ACCEPTED_KEY.to_vec(), tip.hash.as_bytes().to_vec());
    batch.put(
        LAST_ACCEPTED_HEIGHT_KEY.to_vec(),
        keys::encode_height(tip.height).to_vec(),
    );
    batch.put(INITIALIZED_KEY.to_vec(), vec![INITIALIZED_VALUE]);
    batch
}

/// Writes head pointers (and the optional chain config) to `dest`, clears the
/// resume watermark, then writes bootstrap state to `metadata`.
///
/// The chain config is keyed by the genesis hash, read back from the
/// destination's canonical mapping.
pub fn finalize(
    dest: &dyn KeyValueStore,
    metadata: &dyn KeyValueStore,
    tip: ChainTip,
    chain_config: Option<&[u8]>,
) -> Result<(), MigrationError> {
    let mut batch = head_pointer_batch(tip);
    if let Some(config) = chain_config {
        let genesis = ChainReader::flat(dest)
            .canonical_hash(0)?
            .ok_or(MigrationError::MissingCanonical { height: 0 })?;
        batch.put(keys::chain_config_key(genesis), config.to_vec());
    }
    batch.delete(WATERMARK_KEY.to_vec());
    dest.write_batch(batch)?;

    metadata.write_batch(bootstrap_batch(tip))?;
    info!(height = tip.height, hash = ?tip.hash, "Wrote head pointers and bootstrap state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::KeyValueReader, backend::InMemoryBackend, keys::HEAD_FAST_BLOCK_KEY};
    use ethereum_types::H256;

    #[test]
    fn writes_heads_and_bootstrap_state() {
        let dest = InMemoryBackend::new();
        let metadata = InMemoryBackend::new();
        let tip = ChainTip::new(1_000, H256::repeat_byte(0x3c));
        dest.put(WATERMARK_KEY, b"stale").unwrap();

        finalize(&dest, &metadata, tip, None).unwrap();

        for key in HEAD_POINTER_KEYS {
            assert_eq!(dest.get(key).unwrap(), Some(tip.hash.as_bytes().to_vec()));
        }
        assert_eq!(dest.get(WATERMARK_KEY).unwrap(), None);
        assert_eq!(
            metadata.get(LAST_ACCEPTED_KEY).unwrap(),
            Some(tip.hash.as_bytes().to_vec())
        );
        assert_eq!(
            metadata.get(LAST_ACCEPTED_HEIGHT_KEY).unwrap(),
            Some(1_000u64.to_be_bytes().to_vec())
        );
        assert_eq!(metadata.get(INITIALIZED_KEY).unwrap(), Some(vec![1]));
    }

    #[test]
    fn is_idempotent() {
        let dest = InMemoryBackend::new();
        let metadata = InMemoryBackend::new();
        let tip = ChainTip::new(7, H256::repeat_byte(0x01));

        finalize(&dest, &metadata, tip, None).unwrap();
        let first = (dest.snapshot().unwrap(), metadata.snapshot().unwrap());
        finalize(&dest, &metadata, tip, None).unwrap();
        assert_eq!(first, (dest.snapshot().unwrap(), metadata.snapshot().unwrap()));
        assert!(dest.contains(HEAD_FAST_BLOCK_KEY).unwrap());
    }

    #[test]
    fn chain_config_is_keyed_by_genesis() {
        let dest = InMemoryBackend::new();
        let metadata = InMemoryBackend::new();
        let genesis = H256::repeat_byte(0x99);
        let tip = ChainTip::new(3, H256::repeat_byte(0x03));

        assert!(matches!(
            finalize(&dest, &metadata, tip, Some(b"{}")),
            Err(MigrationError::MissingCanonical { height: 0 })
        ));

        dest.put(&keys::canonical_hash_key(0), genesis.as_bytes()).unwrap();
        finalize(&dest, &metadata, tip, Some(b"{\"chainId\":43114}")).unwrap();
        assert_eq!(
            dest.get(&keys::chain_config_key(genesis)).unwrap(),
            Some(b"{\"chainId\":43114}".to_vec())
        );
    }
}

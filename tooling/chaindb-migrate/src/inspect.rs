use std::{collections::BTreeMap, ops::ControlFlow};

use serde::Serialize;

use crate::{
    api::KeyValueReader,
    error::MigrationError,
    keys::{self, KeyClass},
    reader::{ChainReader, Namespace},
};

/// Key counts of a store, grouped by [`KeyClass`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub namespace: Namespace,
    pub total_keys: u64,
    pub by_class: BTreeMap<KeyClass, u64>,
    pub highest_canonical_height: Option<u64>,
    /// Keys outside the namespace, only counted for namespaced scans.
    pub foreign_keys: u64,
}

impl KeyStats {
    pub fn count(&self, class: KeyClass) -> u64 {
        self.by_class.get(&class).copied().unwrap_or_default()
    }
}

/// Scans the whole store once and classifies every key under `namespace`.
pub fn inspect(reader: &ChainReader) -> Result<KeyStats, MigrationError> {
    let namespace = reader.namespace().clone();
    let mut stats = KeyStats {
        namespace: namespace.clone(),
        ..Default::default()
    };
    reader.store().scan_from(&[], &mut |key, _| {
        stats.total_keys += 1;
        let Some(key) = namespace.strip(key) else {
            stats.foreign_keys += 1;
            return ControlFlow::Continue(());
        };
        let class = keys::classify_key(key);
        *stats.by_class.entry(class).or_default() += 1;
        if class == KeyClass::Canonical
            && let Ok(height) = keys::parse_canonical_hash_key(key)
        {
            stats.highest_canonical_height = Some(
                stats
                    .highest_canonical_height
                    .map_or(height, |current| current.max(height)),
            );
        }
        ControlFlow::Continue(())
    })?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::KeyValueStore, backend::InMemoryBackend, keys::NAMESPACE_LEN, testing::SyntheticChain,
    };

    #[test]
    fn counts_source_layout() {
        let chain = SyntheticChain::new(9).without_bodies(|height| height % 3 == 0);
        let store = InMemoryBackend::new();
        chain.write_to(&store).unwrap();

        let stats = inspect(&ChainReader::flat(&store)).unwrap();
        assert_eq!(stats.count(KeyClass::Canonical), 9);
        assert_eq!(stats.count(KeyClass::Header), 9);
        assert_eq!(stats.count(KeyClass::Body), 6);
        assert_eq!(stats.count(KeyClass::Receipts), 9);
        assert_eq!(stats.count(KeyClass::HeaderNumber), 9);
        assert_eq!(stats.count(KeyClass::HeadPointer), 1);
        assert_eq!(stats.count(KeyClass::TotalDifficulty), 0);
        assert_eq!(stats.highest_canonical_height, Some(8));
        assert_eq!(stats.total_keys, 9 * 4 + 6 + 1);
    }

    #[test]
    fn separates_foreign_keys() {
        let namespace = Namespace::new(vec![0x42; NAMESPACE_LEN]).unwrap();
        let chain = SyntheticChain::new(3).with_namespace(namespace.clone());
        let store = InMemoryBackend::new();
        chain.write_to(&store).unwrap();
        store.put(b"unrelated", b"1").unwrap();

        let stats = inspect(&ChainReader::new(&store, namespace)).unwrap();
        assert_eq!(stats.foreign_keys, 1);
        assert_eq!(stats.count(KeyClass::Header), 3);
        assert_eq!(stats.highest_canonical_height, Some(2));
    }
}

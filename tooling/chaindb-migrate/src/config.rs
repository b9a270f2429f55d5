use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::{error::MigrationError, rlp::TdEncoding};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_BATCH_RECORDS: usize = 10_000;
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 2_000;

/// Knobs of the bulk migration pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationConfig {
    /// Width of the enrichment pool.
    pub workers: usize,
    /// Capacity of each bounded queue between stages.
    pub queue_capacity: usize,
    /// Commit once this many destination records are pending.
    pub batch_records: usize,
    /// Commit once this much time has passed since the last commit.
    #[serde(rename = "batch_interval_ms", serialize_with = "serialize_millis")]
    pub batch_interval: Duration,
    pub td_encoding: TdEncoding,
    /// Continue from the watermark of an interrupted run.
    pub resume: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_records: DEFAULT_BATCH_RECORDS,
            batch_interval: Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS),
            td_encoding: TdEncoding::default(),
            resume: false,
        }
    }
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.workers == 0 {
            return Err(MigrationError::Custom("workers must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(MigrationError::Custom(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.batch_records == 0 {
            return Err(MigrationError::Custom(
                "batch record threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Blocks the walker may have handed out but the writer not yet appended.
    /// Covers both queues and every worker, so it only throttles the walker
    /// when the reorder buffer starts to grow.
    pub fn in_flight_limit(&self) -> usize {
        2 * self.queue_capacity + self.workers
    }
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MigrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 4);
        assert_eq!(config.batch_interval, Duration::from_secs(2));
        assert_eq!(config.in_flight_limit(), 2 * 1024 + 4);
    }

    #[test]
    fn rejects_zero_sizes() {
        for config in [
            MigrationConfig {
                workers: 0,
                ..Default::default()
            },
            MigrationConfig {
                queue_capacity: 0,
                ..Default::default()
            },
            MigrationConfig {
                batch_records: 0,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn serializes_interval_as_millis() {
        let value = serde_json::to_value(MigrationConfig::default()).unwrap();
        assert_eq!(value["batch_interval_ms"], 2000);
        assert_eq!(value["td_encoding"], "raw");
    }
}

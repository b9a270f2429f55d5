//! Destination invariant verification and in-place repair
//!
//! Per height `h` in `[0, tip]`:
//!
//! - the canonical mapping `h + num + n` exists,
//! - the header exists under the mapped hash,
//! - the total difficulty exists and equals `h + 1`,
//! - `H + hash` maps the canonical hash back to `h`.
//!
//! Globally, the four head pointers must name the tip and, when a metadata
//! store is given, the bootstrap state must describe the tip.
//!
//! Everything except the canonical mapping and the header is derived data and
//! can be rewritten without the source store. A missing mapping or header
//! stops a repair at that height.

use std::fmt;

use ethereum_types::H256;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    api::{KeyValueReader, KeyValueStore, WriteBatch},
    detect::{self, TipSource},
    error::MigrationError,
    finalize::INITIALIZED_VALUE,
    keys::{
        self, HASH_LEN, HEAD_POINTER_KEYS, INITIALIZED_KEY, LAST_ACCEPTED_HEIGHT_KEY,
        LAST_ACCEPTED_KEY, RecordKind,
    },
    reader::ChainReader,
    rlp::{self, TdEncoding},
    types::ChainTip,
};

/// Target number of sampled heights on long chains.
pub const SAMPLE_TARGET: u64 = 10_000;
/// Violations kept in a report; the total is always counted.
pub const MAX_REPORTED_VIOLATIONS: usize = 1_000;
const REPAIR_BATCH_OPS: usize = 10_000;
const PROGRESS_INTERVAL: u64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    MissingCanonicalHash,
    MissingHeader { hash: H256 },
    MissingTotalDifficulty { hash: H256 },
    /// `found` is `None` when the stored value does not decode.
    WrongTotalDifficulty { hash: H256, found: Option<u128> },
    MissingHeaderNumber { hash: H256 },
    WrongHeaderNumber { hash: H256, found: Option<u64> },
    HeadPointer { key: String },
    BootstrapState { key: String },
}

impl Violation {
    /// Whether the record can be recomputed from the destination alone.
    pub fn repairable(&self) -> bool {
        !matches!(self, Self::MissingCanonicalHash | Self::MissingHeader { .. })
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCanonicalHash => write!(f, "canonical hash missing"),
            Self::MissingHeader { hash } => write!(f, "header {hash:?} missing"),
            Self::MissingTotalDifficulty { hash } => {
                write!(f, "total difficulty for {hash:?} missing")
            }
            Self::WrongTotalDifficulty {
                hash,
                found: Some(found),
            } => write!(f, "total difficulty for {hash:?} is {found}"),
            Self::WrongTotalDifficulty { hash, found: None } => {
                write!(f, "total difficulty for {hash:?} does not decode")
            }
            Self::MissingHeaderNumber { hash } => write!(f, "block number for {hash:?} missing"),
            Self::WrongHeaderNumber {
                hash,
                found: Some(found),
            } => write!(f, "block number for {hash:?} is {found}"),
            Self::WrongHeaderNumber { hash, found: None } => {
                write!(f, "block number for {hash:?} is malformed")
            }
            Self::HeadPointer { key } => write!(f, "head pointer {key} does not name the tip"),
            Self::BootstrapState { key } => {
                write!(f, "bootstrap entry {key} does not describe the tip")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeightViolation {
    pub height: u64,
    #[serde(flatten)]
    pub violation: Violation,
}

impl From<HeightViolation> for MigrationError {
    fn from(value: HeightViolation) -> Self {
        MigrationError::InvariantViolation {
            height: value.height,
            violation: value.violation,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    #[default]
    Sampled,
    Exhaustive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    pub mode: VerifyMode,
    /// Rewrite derived records in place. Implies an exhaustive scan.
    pub repair: bool,
    pub td_encoding: TdEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub tip: ChainTip,
    pub mode: VerifyMode,
    pub repair: bool,
    pub checked_heights: u64,
    pub first_bad_height: Option<u64>,
    pub violation_count: u64,
    pub violations: Vec<HeightViolation>,
    pub repaired: u64,
    /// Height of the unrepairable violation that stopped a repair.
    pub aborted_at: Option<u64>,
}

impl VerificationReport {
    fn new(tip: ChainTip, mode: VerifyMode, repair: bool) -> Self {
        Self {
            tip,
            mode,
            repair,
            checked_heights: 0,
            first_bad_height: None,
            violation_count: 0,
            violations: Vec::new(),
            repaired: 0,
            aborted_at: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violation_count == 0
    }

    /// Violations still present in the destination after this run.
    pub fn outstanding(&self) -> u64 {
        self.violation_count - self.repaired
    }

    /// The first violation left unfixed, as an error.
    pub fn into_result(self) -> Result<Self, MigrationError> {
        if self.outstanding() == 0 {
            return Ok(self);
        }
        let first = self
            .violations
            .iter()
            .find(|v| {
                !self.repair || !v.violation.repairable() || Some(v.height) == self.aborted_at
            })
            .cloned();
        match first {
            Some(violation) => Err(violation.into()),
            None => Err(MigrationError::Custom(format!(
                "{} invariant violation(s) left in destination",
                self.outstanding()
            ))),
        }
    }

    fn record(&mut self, height: u64, violation: Violation) {
        self.violation_count += 1;
        self.first_bad_height = Some(self.first_bad_height.map_or(height, |h| h.min(height)));
        if self.violations.len() < MAX_REPORTED_VIOLATIONS {
            self.violations.push(HeightViolation { height, violation });
        }
    }
}

/// `0, stride, 2*stride, ..., tip` with `stride = max(1, (tip + 1) / 10_000)`.
pub fn sample_heights(tip: u64) -> impl Iterator<Item = u64> {
    let stride = ((u128::from(tip) + 1) / u128::from(SAMPLE_TARGET)).max(1) as u64;
    (0..tip).step_by(stride as usize).chain(std::iter::once(tip))
}

/// Resolves the tip of a migrated store from its head pointers.
pub fn discover_destination_tip(
    dest: &dyn KeyValueReader,
) -> Result<(ChainTip, TipSource), MigrationError> {
    detect::resolve_tip(&ChainReader::flat(dest), None, None)
}

pub fn verify(
    dest: &dyn KeyValueStore,
    metadata: Option<&dyn KeyValueStore>,
    tip: ChainTip,
    options: VerifyOptions,
) -> Result<VerificationReport, MigrationError> {
    let mode = if options.repair {
        VerifyMode::Exhaustive
    } else {
        options.mode
    };
    let mut verifier = Verifier {
        dest,
        metadata,
        tip,
        td_encoding: options.td_encoding,
        repair: options.repair,
        report: VerificationReport::new(tip, mode, options.repair),
        repairs: WriteBatch::default(),
    };

    let completed = match mode {
        VerifyMode::Exhaustive => verifier.scan_range(0, tip.height)?,
        VerifyMode::Sampled => verifier.scan_sampled()?,
    };
    verifier.flush_repairs()?;
    if completed {
        verifier.check_heads()?;
        verifier.check_bootstrap()?;
    }

    let report = verifier.report;
    if report.is_clean() {
        info!(tip = tip.height, checked = report.checked_heights, "Destination verified");
    } else {
        warn!(
            tip = tip.height,
            first_bad_height = ?report.first_bad_height,
            violations = report.violation_count,
            repaired = report.repaired,
            "Destination has invariant violations"
        );
    }
    Ok(report)
}

struct Verifier<'a> {
    dest: &'a dyn KeyValueStore,
    metadata: Option<&'a dyn KeyValueStore>,
    tip: ChainTip,
    td_encoding: TdEncoding,
    repair: bool,
    report: VerificationReport,
    repairs: WriteBatch,
}

impl Verifier<'_> {
    /// Checks one height; unrepairable violations come first.
    fn check_height(&self, height: u64) -> Result<Vec<Violation>, MigrationError> {
        let hash = match self.dest.get(&keys::canonical_hash_key(height))? {
            Some(value) if value.len() == HASH_LEN => H256::from_slice(&value),
            _ => return Ok(vec![Violation::MissingCanonicalHash]),
        };

        let mut violations = Vec::new();
        if !self
            .dest
            .contains(&keys::block_record_key(RecordKind::Header, height, hash))?
        {
            violations.push(Violation::MissingHeader { hash });
        }

        match self.dest.get(&keys::total_difficulty_key(height, hash))? {
            None => violations.push(Violation::MissingTotalDifficulty { hash }),
            Some(value) => match rlp::decode_td(&value, self.td_encoding) {
                Ok(td) if td == rlp::total_difficulty(height) => {}
                Ok(td) => violations.push(Violation::WrongTotalDifficulty {
                    hash,
                    found: Some(td),
                }),
                Err(_) => violations.push(Violation::WrongTotalDifficulty { hash, found: None }),
            },
        }

        match self.dest.get(&keys::header_number_key(hash))? {
            None => violations.push(Violation::MissingHeaderNumber { hash }),
            Some(value) => match <[u8; 8]>::try_from(value.as_slice()).map(u64::from_be_bytes) {
                Ok(found) if found == height => {}
                Ok(found) => violations.push(Violation::WrongHeaderNumber {
                    hash,
                    found: Some(found),
                }),
                Err(_) => violations.push(Violation::WrongHeaderNumber { hash, found: None }),
            },
        }
        Ok(violations)
    }

    /// Checks and records one height. Returns `false` when a repair has to
    /// stop here.
    fn visit(&mut self, height: u64) -> Result<bool, MigrationError> {
        self.report.checked_heights += 1;
        if self.report.checked_heights % PROGRESS_INTERVAL == 0 {
            info!(height, checked = self.report.checked_heights, "Verifying destination");
        }
        let violations = self.check_height(height)?;
        if self.repair && violations.iter().any(|v| !v.repairable()) {
            for violation in violations {
                self.report.record(height, violation);
            }
            self.report.aborted_at = Some(height);
            warn!(height, "Unrepairable violation, stopping repair");
            return Ok(false);
        }
        for violation in violations {
            if self.repair {
                self.queue_repair(height, &violation);
            }
            self.report.record(height, violation);
        }
        if self.repairs.len() >= REPAIR_BATCH_OPS {
            self.flush_repairs()?;
        }
        Ok(true)
    }

    fn scan_range(&mut self, from: u64, to: u64) -> Result<bool, MigrationError> {
        for height in from..=to {
            if !self.visit(height)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Samples the chain; a failing sample triggers a dense rescan of the
    /// interval since the previous good sample. Never used for repairs.
    fn scan_sampled(&mut self) -> Result<bool, MigrationError> {
        let mut next_unchecked = 0u64;
        for height in sample_heights(self.tip.height) {
            if height < next_unchecked {
                continue;
            }
            let violations = self.check_height(height)?;
            self.report.checked_heights += 1;
            if violations.is_empty() {
                next_unchecked = height + 1;
                continue;
            }
            // The sample is counted again by the rescan.
            self.report.checked_heights -= 1;
            self.scan_range(next_unchecked, height)?;
            next_unchecked = height + 1;
        }
        Ok(true)
    }

    fn queue_repair(&mut self, height: u64, violation: &Violation) {
        match violation {
            Violation::MissingTotalDifficulty { hash }
            | Violation::WrongTotalDifficulty { hash, .. } => {
                self.repairs.put(
                    keys::total_difficulty_key(height, *hash),
                    rlp::encode_td(rlp::total_difficulty(height), self.td_encoding),
                );
            }
            Violation::MissingHeaderNumber { hash } | Violation::WrongHeaderNumber { hash, .. } => {
                self.repairs.put(
                    keys::header_number_key(*hash),
                    keys::encode_height(height).to_vec(),
                );
            }
            Violation::HeadPointer { .. }
            | Violation::BootstrapState { .. }
            | Violation::MissingCanonicalHash
            | Violation::MissingHeader { .. } => return,
        }
        self.report.repaired += 1;
    }

    fn flush_repairs(&mut self) -> Result<(), MigrationError> {
        if self.repairs.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.repairs);
        let ops = batch.len();
        self.dest.write_batch(batch)?;
        info!(ops, "Committed repairs");
        Ok(())
    }

    fn check_heads(&mut self) -> Result<(), MigrationError> {
        let mut batch = WriteBatch::default();
        for key in HEAD_POINTER_KEYS {
            if self.dest.get(key)?.as_deref() != Some(self.tip.hash.as_bytes()) {
                self.report.record(
                    self.tip.height,
                    Violation::HeadPointer {
                        key: String::from_utf8_lossy(key).into_owned(),
                    },
                );
                if self.repair {
                    batch.put(key.to_vec(), self.tip.hash.as_bytes().to_vec());
                    self.report.repaired += 1;
                }
            }
        }
        if !batch.is_empty() {
            self.dest.write_batch(batch)?;
        }
        Ok(())
    }

    fn check_bootstrap(&mut self) -> Result<(), MigrationError> {
        let Some(metadata) = self.metadata else {
            return Ok(());
        };
        let expected: [(&[u8], Vec<u8>); 3] = [
            (LAST_ACCEPTED_KEY, self.tip.hash.as_bytes().to_vec()),
            (
                LAST_ACCEPTED_HEIGHT_KEY,
                keys::encode_height(self.tip.height).to_vec(),
            ),
            (INITIALIZED_KEY, vec![INITIALIZED_VALUE]),
        ];
        let mut batch = WriteBatch::default();
        for (key, value) in expected {
            if metadata.get(key)?.as_ref() != Some(&value) {
                self.report.record(
                    self.tip.height,
                    Violation::BootstrapState {
                        key: String::from_utf8_lossy(key).into_owned(),
                    },
                );
                if self.repair {
                    batch.put(key.to_vec(), value);
                    self.report.repaired += 1;
                }
            }
        }
        if !batch.is_empty() {
            metadata.write_batch(batch)?;
        }
        Ok(())
    }
}

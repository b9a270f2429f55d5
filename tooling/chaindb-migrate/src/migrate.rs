//! End-to-end migration: discovery, bulk pass, finalization and optional
//! verification.

use ethereum_types::H256;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    api::{KeyValueReader, KeyValueStore},
    config::MigrationConfig,
    detect::{self, DEFAULT_NAMESPACE_SCAN_LIMIT, TipSource},
    error::MigrationError,
    finalize,
    pipeline::{self, BlockCursor, Watermark, WriterStats},
    reader::{ChainReader, Namespace},
    types::ChainTip,
    verify::{self, VerificationReport, VerifyMode, VerifyOptions},
};

/// Stores and parameters of one migration run.
pub struct MigrationRequest<'a> {
    /// Source chain database; only ever read.
    pub source: &'a dyn KeyValueReader,
    pub dest: &'a dyn KeyValueStore,
    /// Store holding the runtime bootstrap state.
    pub metadata: &'a dyn KeyValueStore,
    /// Source namespace; discovered from the data when `None`.
    pub namespace: Option<Namespace>,
    pub namespace_scan_limit: usize,
    pub tip_hash: Option<H256>,
    pub tip_height: Option<u64>,
    /// Chain config blob stored next to the genesis hash.
    pub chain_config: Option<Vec<u8>>,
    /// Post-migration check; `None` skips it.
    pub verify: Option<VerifyMode>,
    pub config: MigrationConfig,
}

impl<'a> MigrationRequest<'a> {
    pub fn new(
        source: &'a dyn KeyValueReader,
        dest: &'a dyn KeyValueStore,
        metadata: &'a dyn KeyValueStore,
    ) -> Self {
        Self {
            source,
            dest,
            metadata,
            namespace: None,
            namespace_scan_limit: DEFAULT_NAMESPACE_SCAN_LIMIT,
            tip_hash: None,
            tip_height: None,
            chain_config: None,
            verify: None,
            config: MigrationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub namespace: Namespace,
    pub tip: ChainTip,
    pub tip_source: TipSource,
    /// Lowest height already committed by an earlier run, when resuming.
    pub resumed_from: Option<u64>,
    pub stats: WriterStats,
    pub verification: Option<VerificationReport>,
}

pub fn migrate(request: &MigrationRequest) -> Result<MigrationSummary, MigrationError> {
    request.config.validate()?;

    let namespace = match &request.namespace {
        Some(namespace) => namespace.clone(),
        None => detect::discover_namespace(request.source, request.namespace_scan_limit)?,
    };
    let reader = ChainReader::new(request.source, namespace.clone());
    let (tip, tip_source) = detect::resolve_tip(&reader, request.tip_hash, request.tip_height)?;
    info!(
        height = tip.height,
        hash = ?tip.hash,
        source = %tip_source,
        %namespace,
        "Resolved chain tip"
    );

    let mut start = Some(BlockCursor {
        height: tip.height,
        hash: tip.hash,
    });
    let mut resumed_from = None;
    if request.config.resume {
        match Watermark::load(request.dest)? {
            Some(watermark) if watermark.tip_hash == tip.hash => {
                info!(height = watermark.height, "Resuming below watermark");
                resumed_from = Some(watermark.height);
                start = watermark.height.checked_sub(1).map(|height| BlockCursor {
                    height,
                    hash: watermark.parent_hash,
                });
            }
            Some(watermark) => warn!(
                watermark_tip = ?watermark.tip_hash,
                "Watermark belongs to another tip, starting from scratch"
            ),
            None => info!("No watermark found, starting from the tip"),
        }
    }

    let stats = match start {
        Some(start) => pipeline::run(&reader, request.dest, tip, start, &request.config)?,
        None => WriterStats::default(),
    };
    info!(
        blocks = stats.blocks,
        records = stats.records,
        batches = stats.batches,
        missing_bodies = stats.missing_bodies,
        missing_receipts = stats.missing_receipts,
        "Bulk pass complete"
    );

    finalize::finalize(
        request.dest,
        request.metadata,
        tip,
        request.chain_config.as_deref(),
    )?;

    let verification = match request.verify {
        Some(mode) => {
            let options = VerifyOptions {
                mode,
                repair: false,
                td_encoding: request.config.td_encoding,
            };
            Some(verify::verify(request.dest, Some(request.metadata), tip, options)?.into_result()?)
        }
        None => None,
    };

    Ok(MigrationSummary {
        namespace,
        tip,
        tip_source,
        resumed_from,
        stats,
        verification,
    })
}

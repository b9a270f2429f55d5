use std::{
    fmt::Display,
    fs::OpenOptions,
    io::{IsTerminal, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, Instant},
};

use chaindb_migrate::{
    MigrationError, MigrationRequest, MigrationSummary, StoreError,
    api::KeyValueStore,
    backend::RocksDBBackend,
    config::{
        DEFAULT_BATCH_INTERVAL_MS, DEFAULT_BATCH_RECORDS, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS,
        MigrationConfig,
    },
    detect::{self, DEFAULT_NAMESPACE_SCAN_LIMIT, TipSource},
    error::ErrorClass,
    inspect::{self, KeyStats},
    migrate,
    reader::{ChainReader, Namespace},
    rlp::TdEncoding,
    types::ChainTip,
    verify::{self, VerificationReport, VerifyMode, VerifyOptions},
};
use clap::{Args as ClapArgs, Parser as ClapParser, Subcommand as ClapSubcommand, ValueEnum};
use ethereum_types::H256;
use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::{Level, info, warn};
use tracing_subscriber::{
    EnvFilter, filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

const REPORT_SCHEMA_VERSION: u32 = 1;
const MAX_WORKERS: u16 = 256;
const MAX_LISTED_VIOLATIONS: usize = 20;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "chaindb-migrate",
    author = "Lambdaclass",
    about = "Chain database migration tools"
)]
pub struct CLI {
    #[command(flatten)]
    pub log: LogOptions,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapArgs)]
pub struct LogOptions {
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "CHAINDB_MIGRATE_LOG_LEVEL",
        global = true,
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Logging options"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value_t = LogColor::Auto,
        env = "CHAINDB_MIGRATE_LOG_COLOR",
        global = true,
        help = "Output logs with ANSI color codes.",
        long_help = "Possible values: auto, always, never",
        help_heading = "Logging options"
    )]
    pub log_color: LogColor,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum LogColor {
    #[default]
    Auto,
    Always,
    Never,
}

impl Display for LogColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogColor::Auto => write!(f, "auto"),
            LogColor::Always => write!(f, "always"),
            LogColor::Never => write!(f, "never"),
        }
    }
}

impl FromStr for LogColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(LogColor::Auto),
            "always" => Ok(LogColor::Always),
            "never" => Ok(LogColor::Never),
            _ => Err(format!(
                "Invalid log color '{s}'. Expected: auto, always, or never"
            )),
        }
    }
}

/// Logs go to stderr so that stdout only carries reports.
pub fn init_tracing(opts: &LogOptions) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let use_color = match opts.log_color {
        LogColor::Always => true,
        LogColor::Never => false,
        LogColor::Auto => std::io::stderr().is_terminal(),
    };
    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(include_target)
        .with_ansi(use_color);

    tracing_subscriber::registry()
        .with(log_filter)
        .with(fmt_layer)
        .init();
}

/// Post-migration verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PostVerify {
    Off,
    Sampled,
    Exhaustive,
}

impl PostVerify {
    fn mode(self) -> Option<VerifyMode> {
        match self {
            Self::Off => None,
            Self::Sampled => Some(VerifyMode::Sampled),
            Self::Exhaustive => Some(VerifyMode::Exhaustive),
        }
    }
}

fn parse_hash(value: &str) -> Result<H256, String> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|error| format!("invalid hex: {error}"))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    Ok(H256::from_slice(&bytes))
}

fn parse_namespace(value: &str) -> Result<Namespace, String> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|error| format!("invalid hex: {error}"))?;
    Namespace::new(bytes).map_err(|error| error.to_string())
}

#[derive(ClapArgs, Clone, Debug)]
pub struct MigrateArgs {
    #[arg(long = "source")]
    /// Path to the source chain database (opened read-only)
    pub source: PathBuf,
    #[arg(long = "dest")]
    /// Path to the destination chain database
    pub dest: PathBuf,
    #[arg(long = "metadata")]
    /// Path to the runtime metadata store [default: <dest>/../vm]
    pub metadata: Option<PathBuf>,
    #[arg(long = "tip-hash", value_parser = parse_hash)]
    /// Hash of the block to migrate down from
    pub tip_hash: Option<H256>,
    #[arg(long = "tip-height")]
    /// Height of the block to migrate down from
    pub tip_height: Option<u64>,
    #[arg(long = "namespace", value_parser = parse_namespace)]
    /// 32-byte hex key prefix of the source store (empty string for a flat store)
    pub namespace: Option<Namespace>,
    #[arg(long = "namespace-scan-limit", default_value_t = DEFAULT_NAMESPACE_SCAN_LIMIT)]
    /// Keys inspected while discovering the source namespace
    pub namespace_scan_limit: usize,
    #[arg(
        long = "workers",
        default_value_t = DEFAULT_WORKERS as u16,
        value_parser = clap::value_parser!(u16).range(1..=MAX_WORKERS as i64)
    )]
    /// Width of the body/receipts fetch pool (1-256, inclusive)
    pub workers: u16,
    #[arg(
        long = "queue-capacity",
        default_value_t = DEFAULT_QUEUE_CAPACITY as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    /// Capacity of each queue between pipeline stages
    pub queue_capacity: u64,
    #[arg(
        long = "batch-records",
        default_value_t = DEFAULT_BATCH_RECORDS as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    /// Commit once this many records are pending
    pub batch_records: u64,
    #[arg(long = "batch-interval-ms", default_value_t = DEFAULT_BATCH_INTERVAL_MS)]
    /// Commit once this many milliseconds passed since the last commit
    pub batch_interval_ms: u64,
    #[arg(long = "td-encoding", default_value_t = TdEncoding::Raw)]
    /// Total difficulty value encoding: raw or rlp
    pub td_encoding: TdEncoding,
    #[arg(long = "verify", value_enum, default_value_t = PostVerify::Sampled)]
    /// Check destination invariants after the migration
    pub verify: PostVerify,
    #[arg(long = "resume", default_value_t = false)]
    /// Continue below the watermark left by an interrupted run
    pub resume: bool,
    #[arg(long = "chain-config")]
    /// Chain config file stored under the genesis hash
    pub chain_config: Option<PathBuf>,
    #[arg(long = "json", default_value_t = false)]
    /// Emit machine-readable JSON output
    pub json: bool,
    #[arg(long = "report-file")]
    /// Optional path to append emitted reports (JSON lines in --json mode)
    pub report_file: Option<PathBuf>,
}

impl MigrateArgs {
    fn config(&self) -> MigrationConfig {
        MigrationConfig {
            workers: usize::from(self.workers),
            queue_capacity: self.queue_capacity as usize,
            batch_records: self.batch_records as usize,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            td_encoding: self.td_encoding,
            resume: self.resume,
        }
    }

    fn metadata_path(&self) -> PathBuf {
        self.metadata
            .clone()
            .unwrap_or_else(|| default_metadata_path(&self.dest))
    }
}

#[derive(ClapArgs, Clone, Debug)]
pub struct VerifyArgs {
    #[arg(long = "store")]
    /// Path to the migrated chain database
    pub store: PathBuf,
    #[arg(long = "metadata")]
    /// Path to the runtime metadata store; bootstrap state is checked when given
    pub metadata: Option<PathBuf>,
    #[arg(long = "tip-hash", value_parser = parse_hash)]
    /// Expected tip hash [default: read from head pointers]
    pub tip_hash: Option<H256>,
    #[arg(long = "tip-height")]
    /// Expected tip height [default: read from head pointers]
    pub tip_height: Option<u64>,
    #[arg(long = "exhaustive", default_value_t = false)]
    /// Check every height instead of a sample
    pub exhaustive: bool,
    #[arg(long = "repair", default_value_t = false)]
    /// Rewrite total difficulty, block numbers, head pointers and bootstrap state in place
    pub repair: bool,
    #[arg(long = "td-encoding", default_value_t = TdEncoding::Raw)]
    /// Total difficulty value encoding: raw or rlp
    pub td_encoding: TdEncoding,
    #[arg(long = "json", default_value_t = false)]
    /// Emit machine-readable JSON output
    pub json: bool,
    #[arg(long = "report-file")]
    /// Optional path to append emitted reports (JSON lines in --json mode)
    pub report_file: Option<PathBuf>,
}

#[derive(ClapArgs, Clone, Debug)]
pub struct InspectArgs {
    #[arg(long = "store")]
    /// Path to the chain database to inspect (opened read-only)
    pub store: PathBuf,
    #[arg(long = "namespace", value_parser = parse_namespace)]
    /// 32-byte hex key prefix [default: discovered]
    pub namespace: Option<Namespace>,
    #[arg(long = "namespace-scan-limit", default_value_t = DEFAULT_NAMESPACE_SCAN_LIMIT)]
    /// Keys inspected while discovering the namespace
    pub namespace_scan_limit: usize,
    #[arg(long = "json", default_value_t = false)]
    /// Emit machine-readable JSON output
    pub json: bool,
    #[arg(long = "report-file")]
    /// Optional path to append emitted reports (JSON lines in --json mode)
    pub report_file: Option<PathBuf>,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(
        name = "migrate",
        visible_alias = "m",
        about = "Migrate a chain database to the flat rawdb layout"
    )]
    Migrate(MigrateArgs),
    #[command(
        name = "verify",
        visible_alias = "v",
        about = "Check (and optionally repair) the invariants of a migrated store"
    )]
    Verify(VerifyArgs),
    #[command(
        name = "inspect",
        visible_alias = "i",
        about = "Count the keys of a chain database by category"
    )]
    Inspect(InspectArgs),
}

fn default_metadata_path(dest: &Path) -> PathBuf {
    match dest.parent() {
        Some(parent) => parent.join("vm"),
        None => PathBuf::from("vm"),
    }
}

#[derive(Serialize)]
struct MigrationReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    namespace: Namespace,
    tip: ChainTip,
    tip_source: TipSource,
    resumed_from: Option<u64>,
    blocks: u64,
    records: u64,
    batches: u64,
    missing_bodies: u64,
    missing_receipts: u64,
    verification: Option<VerificationReport>,
    elapsed_ms: u64,
}

impl MigrationReport {
    fn new(summary: MigrationSummary, started_at: Instant) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            status: "completed",
            phase: "migration",
            namespace: summary.namespace,
            tip: summary.tip,
            tip_source: summary.tip_source,
            resumed_from: summary.resumed_from,
            blocks: summary.stats.blocks,
            records: summary.stats.records,
            batches: summary.stats.batches,
            missing_bodies: summary.stats.missing_bodies,
            missing_receipts: summary.stats.missing_receipts,
            verification: summary.verification,
            elapsed_ms: elapsed_ms(started_at),
        }
    }

    fn human_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Migrated {} block(s) from #{} ({:?}, {}) down to genesis in {} batch(es).",
            self.blocks, self.tip.height, self.tip.hash, self.tip_source, self.batches
        )];
        if let Some(height) = self.resumed_from {
            lines.push(format!("Resumed below watermark #{height}."));
        }
        if self.missing_bodies > 0 || self.missing_receipts > 0 {
            lines.push(format!(
                "Missing optional records: {} bod(ies), {} receipt list(s).",
                self.missing_bodies, self.missing_receipts
            ));
        }
        if let Some(report) = &self.verification {
            lines.push(format!(
                "Verification ({:?}): {} height(s) checked, no violations.",
                report.mode, report.checked_heights
            ));
        }
        lines
    }
}

#[derive(Serialize)]
struct VerifyReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    #[serde(flatten)]
    report: VerificationReport,
    elapsed_ms: u64,
}

impl VerifyReport {
    fn new(report: VerificationReport, started_at: Instant) -> Self {
        let status = if report.is_clean() {
            "verified"
        } else if report.outstanding() == 0 {
            "repaired"
        } else {
            "violations"
        };
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            status,
            phase: "verification",
            report,
            elapsed_ms: elapsed_ms(started_at),
        }
    }

    fn human_lines(&self) -> Vec<String> {
        let report = &self.report;
        let mut lines = vec![format!(
            "Verified {} height(s) up to #{} ({:?}): {} violation(s), {} repaired.",
            report.checked_heights,
            report.tip.height,
            report.mode,
            report.violation_count,
            report.repaired
        )];
        if let Some(height) = report.first_bad_height {
            lines.push(format!("First bad height: #{height}"));
        }
        for violation in report.violations.iter().take(MAX_LISTED_VIOLATIONS) {
            lines.push(format!("  #{}: {}", violation.height, violation.violation));
        }
        if let Some(height) = report.aborted_at {
            lines.push(format!(
                "Repair stopped at #{height}: canonical mapping or header missing."
            ));
        }
        lines
    }
}

#[derive(Serialize)]
struct InspectReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    #[serde(flatten)]
    stats: KeyStats,
    elapsed_ms: u64,
}

impl InspectReport {
    fn human_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Store {}: {} key(s), highest canonical height {}",
            self.stats.namespace,
            self.stats.total_keys,
            self.stats
                .highest_canonical_height
                .map_or_else(|| "none".to_string(), |height| format!("#{height}"))
        )];
        for (class, count) in &self.stats.by_class {
            lines.push(format!("  {}: {count}", class.as_str()));
        }
        if self.stats.foreign_keys > 0 {
            lines.push(format!("  outside namespace: {}", self.stats.foreign_keys));
        }
        lines
    }
}

#[derive(Serialize)]
struct MigrationErrorReport {
    schema_version: u32,
    status: &'static str,
    phase: &'static str,
    error_type: &'static str,
    height: Option<u64>,
    error: String,
    elapsed_ms: u64,
}

fn elapsed_ms(started_at: Instant) -> u64 {
    started_at.elapsed().as_millis() as u64
}

fn build_error_report(
    error: &eyre::Report,
    phase: &'static str,
    started_at: Instant,
) -> MigrationErrorReport {
    let migration_error = error.downcast_ref::<MigrationError>();
    let error_class = match migration_error {
        Some(error) => error.class(),
        None if error.downcast_ref::<StoreError>().is_some() => ErrorClass::StoreIo,
        None => ErrorClass::Internal,
    };
    MigrationErrorReport {
        schema_version: REPORT_SCHEMA_VERSION,
        status: "failed",
        phase,
        error_type: error_class.as_str(),
        height: migration_error.and_then(MigrationError::height),
        error: format!("{error:#}"),
        elapsed_ms: elapsed_ms(started_at),
    }
}

pub fn emit_error_report(
    json: bool,
    phase: &'static str,
    started_at: Instant,
    error: &eyre::Report,
    report_file: Option<&Path>,
) {
    if json {
        let report = build_error_report(error, phase, started_at);

        match serde_json::to_string(&report) {
            Ok(encoded) => {
                println!("{encoded}");
                if let Err(write_error) = append_report_line(report_file, &encoded) {
                    eprintln!(
                        "Command failed: {error:#}\nCannot write report file: {write_error:#}"
                    );
                }
            }
            Err(ser_error) => {
                eprintln!("Command failed: {error:#}\nReport encoding failed: {ser_error}")
            }
        }
        return;
    }

    let line = format!("{phase} failed after {}ms: {error:#}", elapsed_ms(started_at));
    eprintln!("{line}");
    if let Err(write_error) = append_report_line(report_file, &line) {
        eprintln!("Cannot write report file: {write_error:#}");
    }
}

fn append_report_line(report_file: Option<&Path>, line: &str) -> Result<()> {
    let Some(path) = report_file else {
        return Ok(());
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Cannot create report directory {parent:?}"))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("Cannot open report file {path:?}"))?;
    writeln!(file, "{line}").wrap_err_with(|| format!("Cannot write report file {path:?}"))?;
    Ok(())
}

fn emit_report<T: Serialize>(
    report: &T,
    human_lines: &[String],
    json: bool,
    report_file: Option<&Path>,
) -> Result<()> {
    if json {
        let encoded = serde_json::to_string(report).wrap_err("Cannot serialize report")?;
        println!("{encoded}");
        append_report_line(report_file, &encoded)?;
        return Ok(());
    }

    for line in human_lines {
        println!("{line}");
        append_report_line(report_file, line)?;
    }
    Ok(())
}

impl Subcommand {
    pub fn json_output(&self) -> bool {
        match self {
            Self::Migrate(args) => args.json,
            Self::Verify(args) => args.json,
            Self::Inspect(args) => args.json,
        }
    }

    pub fn report_file(&self) -> Option<&Path> {
        match self {
            Self::Migrate(args) => args.report_file.as_deref(),
            Self::Verify(args) => args.report_file.as_deref(),
            Self::Inspect(args) => args.report_file.as_deref(),
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            Self::Migrate(_) => "migration",
            Self::Verify(_) => "verification",
            Self::Inspect(_) => "inspection",
        }
    }

    /// Runs the command on the blocking pool; every store access is
    /// synchronous.
    pub async fn run(self, started_at: Instant) -> Result<()> {
        tokio::task::spawn_blocking(move || match self {
            Self::Migrate(args) => run_migrate(&args, started_at),
            Self::Verify(args) => run_verify(&args, started_at),
            Self::Inspect(args) => run_inspect(&args, started_at),
        })
        .await
        .wrap_err("Command task panicked")?
    }
}

fn run_migrate(args: &MigrateArgs, started_at: Instant) -> Result<()> {
    let source = RocksDBBackend::open_read_only(&args.source)
        .wrap_err_with(|| format!("Cannot open source store {:?}", args.source))?;
    let dest = RocksDBBackend::open(&args.dest)
        .wrap_err_with(|| format!("Cannot open destination store {:?}", args.dest))?;
    let metadata_path = args.metadata_path();
    let metadata = RocksDBBackend::open(&metadata_path)
        .wrap_err_with(|| format!("Cannot open metadata store {metadata_path:?}"))?;
    info!(
        source = ?source.path(),
        dest = ?dest.path(),
        metadata = ?metadata.path(),
        "Opened stores"
    );
    let chain_config = args
        .chain_config
        .as_deref()
        .map(std::fs::read)
        .transpose()
        .wrap_err("Cannot read chain config file")?;

    let mut request = MigrationRequest::new(&source, &dest, &metadata);
    request.namespace = args.namespace.clone();
    request.namespace_scan_limit = args.namespace_scan_limit;
    request.tip_hash = args.tip_hash;
    request.tip_height = args.tip_height;
    request.chain_config = chain_config;
    request.verify = args.verify.mode();
    request.config = args.config();

    let summary = migrate(&request)?;
    let report = MigrationReport::new(summary, started_at);
    emit_report(&report, &report.human_lines(), args.json, args.report_file.as_deref())
}

fn run_verify(args: &VerifyArgs, started_at: Instant) -> Result<()> {
    let store = if args.repair {
        RocksDBBackend::open(&args.store)
    } else {
        RocksDBBackend::open_read_only(&args.store)
    }
    .wrap_err_with(|| format!("Cannot open store {:?}", args.store))?;
    let metadata = args
        .metadata
        .as_ref()
        .map(|path| {
            RocksDBBackend::open(path)
                .wrap_err_with(|| format!("Cannot open metadata store {path:?}"))
        })
        .transpose()?;

    let (tip, tip_source) = match (args.tip_hash, args.tip_height) {
        (None, None) => verify::discover_destination_tip(&store)?,
        (hash, height) => detect::resolve_tip(&ChainReader::flat(&store), hash, height)?,
    };
    info!(height = tip.height, source = %tip_source, "Verifying destination");

    let options = VerifyOptions {
        mode: if args.exhaustive {
            VerifyMode::Exhaustive
        } else {
            VerifyMode::Sampled
        },
        repair: args.repair,
        td_encoding: args.td_encoding,
    };
    let report = verify::verify(
        &store,
        metadata.as_ref().map(|store| store as &dyn KeyValueStore),
        tip,
        options,
    )?;
    let output = VerifyReport::new(report, started_at);
    emit_report(&output, &output.human_lines(), args.json, args.report_file.as_deref())?;
    output.report.into_result()?;
    Ok(())
}

fn run_inspect(args: &InspectArgs, started_at: Instant) -> Result<()> {
    let store = RocksDBBackend::open_read_only(&args.store)
        .wrap_err_with(|| format!("Cannot open store {:?}", args.store))?;
    let namespace = match &args.namespace {
        Some(namespace) => namespace.clone(),
        None => match detect::discover_namespace(&store, args.namespace_scan_limit) {
            Ok(namespace) => namespace,
            Err(error) => {
                warn!(%error, "Namespace discovery failed, inspecting as a flat store");
                Namespace::flat()
            }
        },
    };

    let stats = inspect::inspect(&ChainReader::new(&store, namespace))?;
    let report = InspectReport {
        schema_version: REPORT_SCHEMA_VERSION,
        status: "inspected",
        phase: "inspection",
        stats,
        elapsed_ms: elapsed_ms(started_at),
    };
    emit_report(&report, &report.human_lines(), args.json, args.report_file.as_deref())
}

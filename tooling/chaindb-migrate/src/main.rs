mod cli;

use crate::cli::{CLI, emit_error_report, init_tracing};
use clap::Parser;
use std::time::Instant;

#[tokio::main]
async fn main() {
    let started_at = Instant::now();
    let CLI { log, command } = CLI::parse();
    init_tracing(&log);

    let json = command.json_output();
    let phase = command.phase();
    let report_file = command.report_file().map(ToOwned::to_owned);

    if let Err(error) = command.run(started_at).await {
        emit_error_report(json, phase, started_at, &error, report_file.as_deref());
        std::process::exit(1);
    }
}

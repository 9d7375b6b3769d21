#![doc = include_str!("../README.md")]

mod probe;

use clap::Parser;
use probe::config::{CliArgs, RunSettings};
use probe::runner::{Outcome, Runner};
use probe::telemetry::init_telemetry;
use rpcprobe_core::WorkerState;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let settings = RunSettings::try_from(args)?;

    init_telemetry()?;

    let entries = settings.entries()?;
    log_startup_info(&settings, entries.len());

    let mut runner = Runner::new(settings);
    let outcomes = runner.run_all(&entries).await;
    for outcome in &outcomes {
        print_outcome(outcome)?;
    }
    #[cfg(feature = "tracing")]
    tracing::debug!("Final environment: {:?}", runner.harness().env_map());

    let failed = outcomes.iter().filter(|o| !o.passed()).count();
    let skipped = entries.len() - outcomes.len();
    if failed > 0 || skipped > 0 {
        anyhow::bail!(
            "{failed} of {} entries failed, {skipped} skipped",
            entries.len()
        );
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) -> anyhow::Result<()> {
    match &outcome.result {
        Ok(report) => {
            let label = if report.state == WorkerState::Cancelled {
                "STOP"
            } else {
                "PASS"
            };
            println!(
                "{label} {} ({:?}, sent {}, received {}, {:?})",
                outcome.name, report.state, report.sent, report.received, report.elapsed
            );
            if let Some(response) = &report.response {
                println!("{}", serde_json::to_string_pretty(response)?);
            }
        }
        Err(e) => println!("FAIL {}: {:#}", outcome.name, e),
    }
    Ok(())
}

fn log_startup_info(_settings: &RunSettings, _entries: usize) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Running {} entries against {} (schema: {:?}, stream: {:?}, timeout: {:?})",
            _entries,
            _settings.host,
            _settings.schema,
            _settings.stream,
            _settings.timeout
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!("Running {} entries against {}", _entries, _settings.host);
    }
}

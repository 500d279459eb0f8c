//! # Skywatch Runner
//!
//! Feeds newline-delimited JSON position reports from a file or stdin through
//! a rule document, then prints the engine counters as JSON.

mod config;

use crate::config::RunnerConfig;

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt, future};
use skywatch_core::{Flight, PositionReport, Stats};
use skywatch_rules::{Callback, CallbackResult, RuleDocument};
use skywatch_tracker::{StreamEngine, TrackerError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const CALLBACK_TARGET: &str = "skywatch::callback";

#[tokio::main]
async fn main() -> Result<()> {
    let config = RunnerConfig::from_env()?;
    init_logging(config.log_json);

    info!(
        rules = %config.rules_path.display(),
        input = %config
            .input
            .as_ref()
            .map_or_else(|| "stdin".into(), |p| p.display().to_string()),
        resample = config.resample,
        "Starting skywatch runner v{}",
        env!("CARGO_PKG_VERSION")
    );

    let engine = Arc::new(build_engine(&config)?);
    engine.start()?;

    let ingest = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(ingest.clone()));

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &config.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let summary = engine
        .run_stream(decode_reports(reader, engine.stats().clone()), &ingest)
        .await;
    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        rules_matched = summary.rules_matched,
        encounters = summary.encounters,
        "Ingestion finished"
    );

    if config.resample && !ingest.is_cancelled() {
        let pass_engine = engine.clone();
        let token = ingest.clone();
        let result = tokio::task::spawn_blocking(move || {
            pass_engine.trigger_resampled_proximity_pass_with(&token)
        })
        .await?;

        match result {
            Ok(events) => {
                for event in &events {
                    info!(
                        rule = %event.rule,
                        a = %event.flight_ids.0,
                        b = %event.flight_ids.1,
                        first_seen = event.first_seen,
                        last_seen = event.last_seen,
                        min_distance_nm = event.min_separation.distance_nm,
                        min_alt_sep_ft = event.min_separation.alt_sep_ft,
                        "Resampled encounter"
                    );
                }
            }
            Err(TrackerError::NoResampleData) => warn!("No reports recorded for resampling"),
            Err(TrackerError::Cancelled) => warn!("Resampled pass interrupted"),
            Err(e) => return Err(e.into()),
        }
    }

    engine.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&engine.stats().snapshot())?);
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,skywatch_tracker=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}

fn build_engine(config: &RunnerConfig) -> Result<StreamEngine> {
    let mut doc = RuleDocument::from_path(&config.rules_path)
        .with_context(|| format!("Failed to load {}", config.rules_path.display()))?;
    if config.resample {
        doc.config.resample = true;
    }

    let engine = StreamEngine::builder()
        .register_callback("log_flight", Callback::flight(log_flight))?
        .register_callback("log_pair", Callback::pair(log_pair))?
        .build(doc)?;
    Ok(engine)
}

fn log_flight(flight: &Flight) -> CallbackResult {
    info!(target: CALLBACK_TARGET, hex = %flight.hex, flight_id = %flight.flight_id, "{}", flight);
    Ok(())
}

fn log_pair(a: &Flight, b: &Flight) -> CallbackResult {
    info!(target: CALLBACK_TARGET, a = %a.flight_id, b = %b.flight_id, "{} / {}", a, b);
    Ok(())
}

/// Decode JSON lines into reports; bad lines are counted and dropped
fn decode_reports(
    reader: impl AsyncRead + Unpin + Send,
    stats: Arc<Stats>,
) -> impl Stream<Item = PositionReport> {
    LinesStream::new(BufReader::new(reader).lines())
        .enumerate()
        .filter_map(move |(lineno, line)| future::ready(decode_line(lineno + 1, line, &stats)))
}

fn decode_line(lineno: usize, line: io::Result<String>, stats: &Stats) -> Option<PositionReport> {
    let line = match line {
        Ok(line) => line,
        Err(e) => {
            warn!(line = lineno, error = %e, "Failed to read report");
            return None;
        }
    };
    if line.trim().is_empty() {
        return None;
    }
    match PositionReport::from_json(&line) {
        Ok(report) => Some(report),
        Err(e) => {
            stats.record_skipped();
            warn!(line = lineno, error = %e, "Skipping undecodable report");
            None
        }
    }
}

/// Stop ingestion on Ctrl+C
async fn cancel_on_ctrl_c(token: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, stopping ingestion...");
            token.cancel();
        }
        Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
    }
}

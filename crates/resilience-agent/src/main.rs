use anyhow::{Context, Result};
use detection_orchestrator::SignalDetectionEngine;
use tokio::signal::unix::SignalKind;
use tokio::sync::broadcast::error::RecvError;

mod config;
mod feed;

use config::AgentConfig;
use feed::{FeedEnd, FeedStats};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    // stdout carries the final status document; logs go to stderr
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting resilience agent");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    let detection = config.engine.detection.clone();
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Sources: {:?}", detection.sources);
    tracing::info!(
        "  Min strength: {}, max frequency: {}/s",
        detection.thresholds.min_strength,
        detection.thresholds.max_frequency
    );
    tracing::info!("  Processing mode: {:?}", detection.processing.mode());
    tracing::info!(
        "  Margin: {} capacity {} (max {} concurrent)",
        config.engine.ledger.margin_type,
        config.engine.ledger.base_capacity,
        config.engine.ledger.max_concurrent_allocations
    );
    if let Some(path) = &config.policy_file {
        tracing::info!(
            "  Policies: {} / thresholds: {} from {}",
            config.engine.policies.len(),
            config.engine.thresholds.len(),
            path
        );
    }

    // 3. Engine
    let engine = SignalDetectionEngine::new(config.engine.clone())
        .context("failed to create detection engine")?;
    engine
        .initialize(detection)
        .await
        .context("failed to initialize detection engine")?;

    // 4. Event logging
    let mut margin_events = engine.subscribe_margin_events();
    let event_logger = tokio::spawn(async move {
        loop {
            match margin_events.recv().await {
                Ok(event) => tracing::info!(
                    event_type = ?event.event_type,
                    margin_type = %event.margin_type,
                    impact = event.impact,
                    "{}",
                    event.description
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Margin event log lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // 5. Feed stdin until EOF or a shutdown signal
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let mut stats = FeedStats::default();
    let mut lines = feed::spawn_line_reader(std::io::BufReader::new(std::io::stdin()));

    tokio::select! {
        end = feed::run_feed(&engine, &mut lines, &mut stats) => {
            match end? {
                FeedEnd::Eof => tracing::info!("Input closed"),
                FeedEnd::EngineStopped(e) => {
                    tracing::error!("Engine stopped accepting signals: {}", e)
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }

    // 6. Graceful shutdown
    let drained = engine.shutdown().await.context("shutdown failed")?;
    tracing::info!(
        "Feed done: {} lines, {} processed, {} filtered, {} drained at shutdown",
        stats.lines,
        stats.processed,
        stats.filtered,
        drained.processed
    );
    event_logger.abort();

    let status = engine.status();
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

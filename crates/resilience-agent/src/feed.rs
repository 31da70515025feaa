use std::io::BufRead;

use detection_orchestrator::SignalDetectionEngine;
use resilience_core::{EngineError, EngineState, Signal};
use serde::Serialize;
use tokio::sync::mpsc;

/// Lines buffered between the reader thread and the feed loop
const LINE_BUFFER: usize = 256;

/// Counters for one feed session
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct FeedStats {
    pub lines: u64,
    pub malformed: u64,
    pub processed: u64,
    pub filtered: u64,
    pub queued: u64,
    pub errors: u64,
}

pub enum FeedEnd {
    Eof,
    /// The engine refused input (shut down or in ERROR)
    EngineStopped(EngineError),
}

/// Read `reader` line by line on a detached OS thread.
///
/// The thread is not owned by the tokio runtime, so a read that never
/// returns (an idle terminal) cannot hold up runtime shutdown. It exits at
/// EOF, on a read error, or once the receiver is gone.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<std::io::Result<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    std::thread::spawn(move || {
        for line in reader.lines() {
            let failed = line.is_err();
            if tx.blocking_send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

/// Hand one JSON signal per line to the engine. Blank lines are skipped;
/// malformed lines are logged and counted.
pub async fn run_feed(
    engine: &SignalDetectionEngine,
    lines: &mut mpsc::Receiver<std::io::Result<String>>,
    stats: &mut FeedStats,
) -> anyhow::Result<FeedEnd> {
    while let Some(line) = lines.recv().await {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines += 1;

        let signal: Signal = match serde_json::from_str(line) {
            Ok(signal) => signal,
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(line = stats.lines, "Skipping malformed signal: {}", e);
                continue;
            }
        };

        match engine.detect_signals(vec![signal]) {
            Ok(result) => {
                stats.processed += result.processed as u64;
                stats.filtered += result.filtered as u64;
                stats.queued += result.queued as u64;
                stats.errors += result.errors.len() as u64;
                for processed in &result.results {
                    tracing::info!(
                        signal_id = %processed.id,
                        key = %processed.key(),
                        confidence = processed.confidence().unwrap_or_default(),
                        "Signal accepted"
                    );
                }
            }
            Err(e @ EngineError::NotActive(_)) => return Ok(FeedEnd::EngineStopped(e)),
            Err(e) => {
                tracing::error!("Engine rejected signal: {}", e);
                if engine.state() != EngineState::Active {
                    return Ok(FeedEnd::EngineStopped(e));
                }
            }
        }
    }

    Ok(FeedEnd::Eof)
}

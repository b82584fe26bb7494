//! NDJSON event source: replays a recorded trace (or a live pipe) into the
//! engine in order.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::parse_line;
use crate::detect::Engine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub lines: usize,
    pub applied: usize,
    pub malformed: usize,
}

/// Apply every event read from `reader`. Malformed lines are logged and
/// counted, not fatal.
pub async fn replay_reader<R>(reader: R, engine: &Engine) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = ReplaySummary::default();
    while let Some(line) = lines.next_line().await.context("failed to read event stream")? {
        summary.lines += 1;
        match parse_line(&line, summary.lines) {
            Ok(Some(event)) => {
                engine.apply(&event);
                summary.applied += 1;
            }
            Ok(None) => {}
            Err(e) => {
                engine.note_parse_error();
                summary.malformed += 1;
                warn!(error = %e, "skipping malformed telemetry line");
            }
        }
    }
    Ok(summary)
}

/// Replay events from `source`, where `-` means stdin.
pub async fn replay_source(source: &str, engine: &Engine) -> Result<ReplaySummary> {
    let summary = if source == "-" {
        replay_reader(BufReader::new(tokio::io::stdin()), engine).await?
    } else {
        let path = Path::new(source);
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open event stream: {}", path.display()))?;
        replay_reader(BufReader::new(file), engine).await?
    };
    info!(
        source,
        lines = summary.lines,
        applied = summary.applied,
        malformed = summary.malformed,
        "event stream finished"
    );
    Ok(summary)
}

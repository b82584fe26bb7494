//! reqdrift -- online per-request resource drift scoring.
//!
//! Resolves low-level telemetry (scheduling, page faults, allocations,
//! socket traffic) to logical requests, accumulates six feature channels per
//! request, and scores every update against a pre-trained cluster model to
//! flag requests that look like application-layer denial of service.

pub mod api;
pub mod config;
pub mod detect;
pub mod features;
pub mod identity;
pub mod model;
pub mod table;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::DetectorConfig;
use crate::detect::{Engine, EngineStats, RequestView};
use crate::model::ModelParams;
use crate::telemetry::replay::{replay_source, ReplaySummary};

/// Build an engine and, when given, install the model file into it.
pub fn build_engine(config: &DetectorConfig, model: Option<&Path>) -> Result<Arc<Engine>> {
    let engine = Engine::new(config).context("invalid engine configuration")?;
    if let Some(path) = model {
        let params = ModelParams::load(path)?;
        engine
            .model()
            .install(&params)
            .with_context(|| format!("failed to install model {}", path.display()))?;
    }
    Ok(Arc::new(engine))
}

/// Start the detector: optional event stream ingestion plus the read API.
pub async fn serve(
    config: DetectorConfig,
    model: Option<PathBuf>,
    events: Option<String>,
) -> Result<()> {
    let engine = build_engine(&config, model.as_deref())?;

    if let Some(source) = events {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = replay_source(&source, &engine).await {
                tracing::error!(error = %e, "event stream failed");
            }
        });
    }

    let addr: std::net::SocketAddr = config
        .api
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.api.listen_address))?;
    let app = api::router(api::state::AppState::new(engine));

    tracing::info!(%addr, "reqdrift listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Everything the engine knows after a replay.
#[derive(Debug, Serialize)]
pub struct Report {
    pub summary: ReplaySummary,
    pub stats: EngineStats,
    /// Normalization statistics and cluster parameters the scores were computed with.
    pub model: ModelParams,
    pub requests: Vec<RequestView>,
}

/// Replay an event stream through a fresh engine and collect the results.
pub async fn replay(config: &DetectorConfig, model: Option<&Path>, events: &str) -> Result<Report> {
    let engine = build_engine(config, model)?;
    let summary = replay_source(events, &engine).await?;
    Ok(Report {
        summary,
        stats: engine.stats(),
        model: engine.model().snapshot(),
        requests: engine.report(),
    })
}

/// Write `report` as pretty JSON.
pub fn write_report(report: &Report, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create report file: {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), report)
        .with_context(|| format!("failed to write report: {}", path.display()))?;
    tracing::info!(path = %path.display(), requests = report.requests.len(), "wrote report");
    Ok(())
}

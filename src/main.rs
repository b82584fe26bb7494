use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use reqdrift::config::{DetectorConfig, LoggingConfig};
use reqdrift::model::{FeatureChannel, ModelParams, ModelStore};

#[derive(Parser)]
#[command(
    name = "reqdrift",
    about = "Per-request resource drift scoring for application-layer DoS detection",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $REQDRIFT_CONFIG, then /etc/reqdrift/reqdrift.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the detector (event ingestion + read API)
    Serve {
        /// Model file to install at startup (TOML or JSON)
        #[arg(long)]
        model: Option<PathBuf>,

        /// NDJSON event stream to consume; `-` reads stdin
        #[arg(long)]
        events: Option<String>,

        /// Bind address, overrides [api] listen_address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Replay a recorded event trace and print per-request results
    Replay {
        /// NDJSON event trace; `-` reads stdin
        events: String,

        /// Model file to install before replaying
        #[arg(long)]
        model: Option<PathBuf>,

        /// Write the full report as JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate a model file against the configured cluster count
    CheckModel {
        /// Model file (TOML or JSON)
        model: PathBuf,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DetectorConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve {
            model,
            events,
            bind,
        } => {
            if let Some(bind) = bind {
                config.api.listen_address = bind;
            }
            tracing::info!(bind = %config.api.listen_address, ?model, ?events, "Starting reqdrift");
            reqdrift::serve(config, model, events).await?;
        }
        Commands::Replay { events, model, out } => {
            let report = reqdrift::replay(&config, model.as_deref(), &events).await?;

            println!("\n=== reqdrift Replay Report ===");
            println!(
                "Lines: {}  Applied: {}  Malformed: {}",
                report.summary.lines, report.summary.applied, report.summary.malformed
            );
            println!(
                "Requests: {}  Scored: {}  Rejected: {}  Clock discards: {}",
                report.stats.requests,
                report.stats.scored,
                report.stats.table_rejections,
                report.stats.clock_discards
            );
            if !report.stats.model_loaded {
                println!("(no model loaded: requests were accumulated but not scored)");
            }
            println!();
            println!(
                "{:<10} | {:>14} | {:>12} | {:>12} | {:>8} | Verdict",
                "Request", "CPU (ns)", "Malloc", "Recv", "Cluster"
            );
            println!(
                "{:-<10}-|-{:->14}-|-{:->12}-|-{:->12}-|-{:->8}-|-{:-<8}",
                "", "", "", "", "", ""
            );
            for view in &report.requests {
                let r = &view.request;
                let (cluster, verdict) = match &view.score {
                    Some(score) => (
                        score
                            .nearest
                            .map(|n| n.cluster.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        if score.is_outlier { "OUTLIER" } else { "ok" },
                    ),
                    None => ("-".to_string(), "unscored"),
                };
                println!(
                    "{:<10} | {:>14} | {:>12} | {:>12} | {:>8} | {}",
                    r.id, r.cpu_time, r.malloc_total, r.bytes_received, cluster, verdict
                );
            }
            println!();

            if let Some(path) = out {
                reqdrift::write_report(&report, &path)?;
                println!("Report written to {}", path.display());
            }
        }
        Commands::CheckModel { model } => {
            let params = ModelParams::load(&model)?;
            let store = ModelStore::new(config.engine.clusters);
            store.install(&params)?;

            println!("Model {} is valid", model.display());
            println!(
                "Clusters: {} of {}  Offset: {}",
                params.baselines.len(),
                store.clusters(),
                params.offset
            );
            println!("{:<12} | {:>14} | {:>14}", "Channel", "Mean", "Std");
            println!("{:-<12}-|-{:->14}-|-{:->14}", "", "", "");
            for channel in FeatureChannel::ALL {
                match store.channel_stats(channel) {
                    Some(stats) => println!(
                        "{:<12} | {:>14} | {:>14}",
                        channel.name(),
                        stats.mean,
                        stats.std
                    ),
                    None => println!("{:<12} | {:>14} | {:>14}", channel.name(), "-", "-"),
                }
            }
        }
    }

    Ok(())
}

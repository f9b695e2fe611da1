//! salienced: the reflection daemon.
//!
//! Registers every layer up front (a bad schedule or model profile stops
//! startup), then ticks the scheduler and decays both ledgers on a timer
//! until ctrl-c. Shutdown lets the topic in progress finish.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use salience_core::{
    DirLayerSource, LayerExecutor, LayerSource, ReflectionScheduler, SalienceConfig, Services,
    StaticLayerSource, METRICS, VERSION,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "salienced")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Salience reflection daemon", long_about = None)]
struct Args {
    /// Configuration file (missing file means defaults)
    #[arg(short, long, env = "SALIENCE_CONFIG", default_value = "salience.toml")]
    config: PathBuf,

    /// Directory of layer definitions (overrides [scheduler].layers_dir)
    #[arg(long)]
    layers_dir: Option<PathBuf>,

    /// Use in-memory stores (nothing survives a restart)
    #[arg(long)]
    in_memory: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    salience_core::init_tracing(args.json, level);

    let config = SalienceConfig::load(&args.config)
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;
    let layers_dir = args
        .layers_dir
        .clone()
        .or_else(|| config.scheduler.layers_dir.clone());
    let services = if args.in_memory {
        Services::in_memory(config)?
    } else {
        Services::connect(config)
            .await
            .context("Failed to connect to the salience store")?
    };
    let services = Arc::new(services);

    let source: Arc<dyn LayerSource> = match layers_dir {
        Some(dir) => Arc::new(
            DirLayerSource::open(dir.clone())
                .await
                .with_context(|| format!("Failed to load layers from {}", dir.display()))?,
        ),
        None => {
            warn!("no layers directory configured; only decay will run");
            Arc::new(StaticLayerSource::default())
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor =
        Arc::new(LayerExecutor::new(services.clone()).with_shutdown(shutdown_rx.clone()));
    let scheduler = Arc::new(ReflectionScheduler::new(services.clone(), executor, source));
    let jobs = scheduler
        .register_all(Utc::now())
        .await
        .context("Layer registration failed")?;
    info!(version = VERSION, jobs, "salienced started");

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run_until(shutdown).await }
    });
    let decay_task = tokio::spawn(decay_loop(services.clone(), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");
    // Receivers may already be gone if both tasks exited early.
    let _ = shutdown_tx.send(true);

    let (scheduled, decayed) = tokio::join!(scheduler_task, decay_task);
    for (task, result) in [("scheduler", scheduled), ("decay", decayed)] {
        if let Err(e) = result {
            warn!(task, error = %e, "task ended abnormally");
        }
    }
    METRICS.flush();
    info!("salienced stopped");
    Ok(())
}

/// Decay both ledgers every `[ledger].decay_interval_secs` until shutdown.
async fn decay_loop(services: Arc<Services>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(services.config.ledger.decay_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => decay_once(&services).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("decay loop stopped");
}

async fn decay_once(services: &Services) {
    match services.ledger.decay().await {
        Ok(report) => info!(
            topics = report.topics_decayed,
            total = report.total_decayed,
            "salience decay"
        ),
        Err(e) => warn!(error = %e, "salience decay failed"),
    }
    match services.impulse.apply_decay().await {
        Ok(report) => info!(
            topics = report.topics_decayed,
            total = report.total_decayed,
            "impulse decay"
        ),
        Err(e) => warn!(error = %e, "impulse decay failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[tokio::test(start_paused = true)]
    async fn decay_loop_stops_on_shutdown() {
        let services = Arc::new(Services::in_memory(SalienceConfig::default()).unwrap());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(decay_loop(services, rx));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("decay loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn registration_with_no_layers_is_empty() {
        let services = Arc::new(Services::in_memory(SalienceConfig::default()).unwrap());
        let executor = Arc::new(LayerExecutor::new(services.clone()));
        let scheduler = ReflectionScheduler::new(
            services,
            executor,
            Arc::new(StaticLayerSource::default()),
        );
        assert_eq!(scheduler.register_all(Utc::now()).await.unwrap(), 0);
    }
}

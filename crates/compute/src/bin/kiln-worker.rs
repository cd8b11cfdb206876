//! kiln-worker -- priority-aware synthesis dispatcher.
//!
//! Two tasks share the runtime:
//! - the ingress poller: broker -> per-topic queues, commit channel -> broker
//! - the dispatcher: priority drain + round-robin, owns the warm backend
//!
//! SIGINT/SIGTERM stops polling, lets the in-flight task finish, unloads the
//! resident base and flushes the last commits.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiln_compute::{
    Dispatcher, DispatcherSettings, Executor, HttpBackend, ResourceCache, RetryPolicy,
};
use kiln_core::config::{load_dotenv, BrokerKind};
use kiln_core::KilnConfig;
use kiln_notify::HttpResultSink;
use kiln_queue::{
    commit_channel, topic_queues, Broker, IngressPoller, MemoryBroker, MemoryLog, PollerSettings,
    SqsBroker,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Kiln worker: pulls synthesis tasks off the broker and runs them on a warm backend.
#[derive(Parser, Debug)]
#[command(name = "kiln-worker", version, about)]
struct Cli {
    /// Path to kiln.toml config file.
    #[arg(long, env = "KILN_CONFIG", default_value = "config/kiln.toml")]
    config: PathBuf,

    /// Override `broker.kind` after the config file has been loaded and
    /// validated as written.
    #[arg(long, value_enum)]
    broker: Option<BrokerArg>,

    /// JSON-lines file of `{"topic": ..., "message": {...}}` published to the
    /// in-process log at startup. Only used with the memory broker.
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BrokerArg {
    Sqs,
    Memory,
}

impl From<BrokerArg> for BrokerKind {
    fn from(arg: BrokerArg) -> Self {
        match arg {
            BrokerArg::Sqs => BrokerKind::Sqs,
            BrokerArg::Memory => BrokerKind::Memory,
        }
    }
}

#[derive(Deserialize)]
struct SeedLine {
    topic: String,
    message: serde_json::Value,
}

// ── Wiring ──────────────────────────────────────────────────────────

async fn connect_broker(config: &KilnConfig, seed: Option<&Path>) -> anyhow::Result<Arc<dyn Broker>> {
    let topics = config.broker.all_topics();
    match config.broker.kind {
        BrokerKind::Sqs => {
            let broker = SqsBroker::new(&config.broker.sqs, &topics)
                .await
                .context("failed to connect to SQS")?;
            Ok(Arc::new(broker))
        }
        BrokerKind::Memory => {
            let log = MemoryLog::new();
            if let Some(path) = seed {
                let published = seed_log(&log, path)?;
                info!(path = %path.display(), published, "seeded in-process log");
            }
            Ok(Arc::new(MemoryBroker::connect(
                log,
                config.broker.consumer_group.clone(),
                topics,
            )))
        }
    }
}

fn seed_log(log: &MemoryLog, path: &Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open seed file {}", path.display()))?;
    let mut published = 0;
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: SeedLine = serde_json::from_str(&line)
            .with_context(|| format!("seed line {} is not valid", n + 1))?;
        log.publish(&entry.topic, entry.message.to_string());
        published += 1;
    }
    Ok(published)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = KilnConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if let Some(kind) = cli.broker {
        config.broker.kind = kind.into();
        config.validate()?;
    }
    config.log_summary();

    let broker = connect_broker(&config, cli.seed.as_deref()).await?;
    match broker.health_check().await {
        Ok(health) => info!(%health, "broker reachable"),
        Err(e) => warn!(error = %e, "broker health check failed, poller will keep retrying"),
    }

    let topics = config.broker.all_topics();
    let (senders, queues) = topic_queues(&topics, config.broker.queue_capacity);
    let (commit_tx, commit_rx) = commit_channel();

    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    let sink = Arc::new(HttpResultSink::new(&config.sink)?);
    info!(backend = %config.backend.url, sink = %sink.endpoint(), "endpoints configured");

    let cache = ResourceCache::from_config(backend.clone(), &config.cache);
    let executor = Executor::new(cache, backend, sink, RetryPolicy::from_config(&config.retry))
        .with_strict_overlays(config.cache.strict_overlays);
    let dispatcher = Dispatcher::new(
        queues,
        commit_tx,
        executor,
        DispatcherSettings::from_config(&config),
    );
    let metrics = dispatcher.metrics_handle();

    let poller = IngressPoller::new(
        broker,
        senders,
        commit_rx,
        PollerSettings::from(&config.broker),
    );

    let cancel = CancellationToken::new();
    let poller_handle = tokio::spawn(poller.run(cancel.clone()));
    let dispatch_handle = tokio::spawn(dispatcher.run(cancel.clone()));

    info!("kiln-worker started");
    shutdown_signal().await;
    info!("shutdown signal received, finishing in-flight task");
    cancel.cancel();

    if let Err(e) = dispatch_handle.await {
        warn!(error = %e, "dispatcher task panicked");
    }
    match poller_handle.await {
        Ok(stats) => info!(?stats, "poller stopped"),
        Err(e) => warn!(error = %e, "poller task panicked"),
    }

    if let Ok(m) = metrics.read() {
        info!(executed = m.total_executed(), interrupted = m.interrupted, "kiln-worker exited cleanly");
    }
    Ok(())
}

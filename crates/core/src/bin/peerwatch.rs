use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use peerwatch::{
    config::{set_logger, BootstrapPeers, Config, ConfigArgs},
    peering::{PeeringMetrics, PeeringService},
    store::{MemoryStore, RecordLog},
    transport::{ConnectionNotifier, TcpTransport},
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const NOTIFICATION_CAPACITY: usize = 1024;

async fn report_metrics(metrics: PeeringMetrics, config: Config, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(config.metrics_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(snapshot) => tracing::info!(%snapshot, "Peering metrics"),
                    Err(error) => tracing::warn!(%error, "Failed to serialize metrics"),
                }
            }
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let record_log = match &config.record_log {
        Some(path) => Some(
            RecordLog::open(path)
                .await
                .with_context(|| format!("opening record log {}", path.display()))?,
        ),
        None => None,
    };
    let store = match &record_log {
        Some(log) => MemoryStore::new().with_record_log(log.clone()),
        None => MemoryStore::new(),
    };
    if let Some(path) = &config.peers_file {
        for peer in BootstrapPeers::load(path)?.peers {
            store.add_discovered(peer);
        }
    }
    if store.is_empty() {
        tracing::warn!("No bootstrap peers configured, only inbound peers will be tracked");
    }

    let (notifier, notifications) = ConnectionNotifier::channel(NOTIFICATION_CAPACITY);
    let transport = Arc::new(TcpTransport::new(notifier, config.connection_hold));
    let service = PeeringService::new(
        &config,
        transport,
        notifications,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
    );
    let cancel = CancellationToken::new();
    let reporter = tokio::spawn(report_metrics(
        service.metrics(),
        config.clone(),
        cancel.clone(),
    ));

    let mut service = tokio::spawn(service.run(cancel.clone()));
    let result = tokio::select! {
        result = &mut service => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("Shutdown requested"),
                Err(error) => tracing::error!(%error, "Failed to listen for shutdown signal"),
            }
            cancel.cancel();
            service.await
        }
    };
    cancel.cancel();
    let _ = reporter.await;
    if let Some(log) = record_log {
        log.flush().await;
    }
    result?
}

fn main() -> anyhow::Result<()> {
    let args = ConfigArgs::parse();
    let config_file = args.config.clone();
    let config = args.build()?;
    // the level may come from the config file, so the logger waits for it
    set_logger(Some(config.log_level));
    tracing::debug!(?config_file, ?config, "Configuration loaded");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}

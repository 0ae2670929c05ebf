#![warn(missing_docs)]
//! ShareFS coordination daemon: runs one filesystem instance and keeps its
//! peer connections up

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sharefs_meta::{
    accept_peer, join_peer, CacheInvalidator, DirStore, Instance, InvalidateMode, MetaConfig,
    PeerConfig, PeerOrdinal, ResourceId,
};
use sharefs_transport::{PeerLink, TcpTransport};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "sharefsd", version, about = "ShareFS coordination daemon")]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "SHAREFS_CONFIG", default_value = "/etc/sharefs/sharefs.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

/// No page cache lives in this process; invalidations are only logged.
struct LoggedInvalidator;

impl CacheInvalidator for LoggedInvalidator {
    fn invalidate(&self, resource: ResourceId, mode: InvalidateMode) {
        tracing::debug!(resource = %resource, ?mode, "cache invalidation");
    }

    fn purge_name_cache(&self) {
        tracing::debug!("name cache purge");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    let config = MetaConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    tracing::info!(
        fs = %config.fs_name,
        ordinal = config.ordinal,
        listen = %config.listen_addr,
        "ShareFS daemon starting..."
    );

    let state_dir = config.state_dir.join(&config.fs_name);
    let store = DirStore::open(&state_dir)
        .await
        .with_context(|| format!("opening state directory {}", state_dir.display()))?;

    let transport = Arc::new(TcpTransport::new(config.send.tcp()));
    let listener = transport
        .listen(&config.listen_addr)
        .await
        .with_context(|| format!("listening on {}", config.listen_addr))?;

    let (peers_tx, peers_rx) = watch::channel(config.peers.clone());
    let instance = Instance::new(config, Arc::new(store), Arc::new(LoggedInvalidator))?;
    instance.start().await?;

    let hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let acceptor = tokio::spawn(accept_loop(instance.clone(), transport.clone(), listener));
    let connector = tokio::spawn(connect_loop(instance.clone(), transport, peers_rx));
    let reloader = tokio::spawn(reload_loop(instance.clone(), args.config.clone(), hangup, peers_tx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    acceptor.abort();
    connector.abort();
    reloader.abort();
    instance.shutdown().await;
    Ok(())
}

async fn accept_loop(instance: Arc<Instance>, transport: Arc<TcpTransport>, listener: TcpListener) {
    loop {
        let link = match transport.accept(&listener).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let link: Arc<dyn PeerLink> = Arc::new(link);
        let instance = instance.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_peer(&instance, link).await {
                tracing::debug!(error = %e, "incoming peer not admitted");
            }
        });
    }
}

/// Dials every configured peer with a lower ordinal that is not connected.
/// Peers with higher ordinals dial us. The peer list follows reloads.
async fn connect_loop(
    instance: Arc<Instance>,
    transport: Arc<TcpTransport>,
    mut peers: watch::Receiver<Vec<PeerConfig>>,
) {
    let local = instance.local().as_u32();
    let mut tick = tokio::time::interval(RECONNECT_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            changed = peers.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let targets: Vec<PeerConfig> = peers
            .borrow()
            .iter()
            .filter(|p| p.ordinal < local)
            .cloned()
            .collect();
        for peer in &targets {
            if instance.registry().is_connected(PeerOrdinal::new(peer.ordinal)) {
                continue;
            }
            let link = match transport.connect(&peer.addr).await {
                Ok(link) => link,
                Err(e) => {
                    tracing::debug!(peer = %peer.name, addr = %peer.addr, error = %e, "connect failed");
                    continue;
                }
            };
            let link: Arc<dyn PeerLink> = Arc::new(link);
            match join_peer(&instance, link).await {
                Ok(ordinal) => tracing::info!(peer = %peer.name, ordinal = %ordinal, "connected"),
                Err(e) => tracing::warn!(peer = %peer.name, error = %e, "handshake failed"),
            }
        }
    }
}

/// Re-reads the configuration file on SIGHUP and publishes the new peer
/// list. Identity fields cannot change while running.
async fn reload_loop(
    instance: Arc<Instance>,
    path: PathBuf,
    mut hangup: tokio::signal::unix::Signal,
    peers: watch::Sender<Vec<PeerConfig>>,
) {
    while hangup.recv().await.is_some() {
        let config = match MetaConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "reload failed, keeping current configuration");
                continue;
            }
        };
        let running = instance.config();
        if config.fs_name != running.fs_name || config.ordinal != running.ordinal {
            tracing::warn!(
                fs = %config.fs_name,
                ordinal = config.ordinal,
                "reload changes filesystem identity, ignored"
            );
            continue;
        }
        tracing::info!(peers = config.peers.len(), "configuration reloaded");
        peers.send_replace(config.peers);
    }
}

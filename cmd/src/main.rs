//! Delay-tolerant networking agent binary.
//!
//! Wires the stack together: bundle storage, the epidemic router
//! dispatcher, one CLA instance with its TCP transport, optional UDP
//! neighbor discovery, the ingest loop turning received wire payloads
//! into stored-and-routed bundles, and the bundle-processor report loop
//! logging outcome signals.

use clap::Parser;
use dtn_cla::{run_discovery, tcp, ClaConfig, ClaInstance, DiscoveryConfig};
use dtn_routing::{
    BpSignal, BundleOutcome, EpidemicConfig, EpidemicDispatcher, Limit, RouterSignal,
};
use dtn_storage::{Bundle, BundleStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::AgentConfig;

/// Delay-tolerant networking agent with epidemic routing
#[derive(Parser, Debug)]
#[command(name = "dtn-agent", version, about = "DTN bundle agent with epidemic routing")]
struct Args {
    /// Endpoint identifier of this node, e.g. dtn://alpha
    #[arg(long)]
    eid: Option<String>,

    /// Listen address for inbound contacts, e.g. 0.0.0.0:4556
    #[arg(long)]
    listen: Option<String>,

    /// Connect to peer address, e.g. 10.0.0.2:4556 (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Link MTU in bytes
    #[arg(long)]
    mtu: Option<usize>,

    /// Largest serialized bundle accepted for transmission
    #[arg(long)]
    max_bundle_size: Option<usize>,

    /// Bound on bundles held in storage
    #[arg(long)]
    storage_capacity: Option<usize>,

    /// Replication fan-out: unlimited, direct, or a count
    #[arg(long)]
    replication_limit: Option<Limit>,

    /// Hop budget before direct delivery only: unlimited, direct, or a count
    #[arg(long)]
    hop_limit: Option<Limit>,

    /// Enable UDP beacon neighbor discovery
    #[arg(long)]
    discover: bool,

    /// UDP port to listen for beacons on
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Destination for our own beacons
    #[arg(long)]
    discovery_broadcast: Option<String>,

    /// Connect address announced in beacons (defaults to the bound listen address)
    #[arg(long)]
    announce_addr: Option<String>,

    /// Beacon announce interval, e.g. 10s
    #[arg(long, default_value = "10s")]
    announce_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("dtn_agent={}", args.log_level).parse()?)
        .add_directive(format!("dtn_wire={}", args.log_level).parse()?)
        .add_directive(format!("dtn_storage={}", args.log_level).parse()?)
        .add_directive(format!("dtn_routing={}", args.log_level).parse()?)
        .add_directive(format!("dtn_cla={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("Starting dtn-agent v{}", env!("CARGO_PKG_VERSION"));

    // Config file and environment first, command line flags on top.
    let mut cfg = AgentConfig::load_from_file(&args.config)?;
    if let Some(eid) = args.eid {
        cfg.eid = eid;
    }
    if args.listen.is_some() {
        cfg.listen = args.listen.clone();
    }
    if !args.connect.is_empty() {
        cfg.peers = args.connect.clone();
    }
    if let Some(mtu) = args.mtu {
        cfg.mtu = mtu;
    }
    if let Some(size) = args.max_bundle_size {
        cfg.max_bundle_size = size;
    }
    if let Some(capacity) = args.storage_capacity {
        cfg.storage_capacity = capacity;
    }
    if args.discover {
        cfg.discovery.enabled = true;
    }
    if let Some(port) = args.discovery_port {
        cfg.discovery.port = port;
    }
    if let Some(addr) = args.discovery_broadcast {
        cfg.discovery.broadcast_addr = addr;
    }
    if args.announce_addr.is_some() {
        cfg.discovery.announce_addr = args.announce_addr.clone();
    }

    let replication_limit = match args.replication_limit {
        Some(limit) => limit,
        None => cfg.replication_limit.parse().map_err(anyhow::Error::msg)?,
    };
    let hop_limit = match args.hop_limit {
        Some(limit) => limit,
        None => cfg.hop_limit.parse().map_err(anyhow::Error::msg)?,
    };

    if cfg.listen.is_none() && cfg.peers.is_empty() && !cfg.discovery.enabled {
        anyhow::bail!("Must specify at least one of --listen, --connect or --discover");
    }

    info!(
        "Node {}: replication={:?}, hop_limit={:?}, mtu={}, storage_capacity={}",
        cfg.eid, replication_limit, hop_limit, cfg.mtu, cfg.storage_capacity
    );

    let store: Arc<dyn BundleStore> = Arc::new(MemoryStore::new(cfg.storage_capacity));

    // The router signal queue is created up front: the CLA instance and
    // the discovery task both produce into it, the dispatcher consumes.
    let (router_tx, router_rx) = mpsc::unbounded_channel::<RouterSignal>();
    let (bp_tx, mut bp_rx) = mpsc::unbounded_channel::<BpSignal>();
    let (ingest_tx, mut ingest_rx) = mpsc::channel(64);

    let cla = ClaInstance::new(
        ClaConfig {
            name: cfg.cla_name.clone(),
            mtu: cfg.mtu,
            max_bundle_size: cfg.max_bundle_size,
            ..ClaConfig::default()
        },
        router_tx.clone(),
        ingest_tx,
    )?;
    tokio::spawn(cla.clone().run());

    let dispatcher = EpidemicDispatcher::with_queue(
        store.clone(),
        cla.clone(),
        EpidemicConfig {
            replication_limit,
            hop_limit,
        },
        bp_tx,
        router_rx,
    );
    tokio::spawn(dispatcher.run());

    let bound = tcp::launch(cla.clone(), cfg.listen.clone(), cfg.peers.clone()).await?;
    if let Some(addr) = bound {
        info!("Accepting contacts on {}", addr);
    }

    if cfg.discovery.enabled {
        let announce_addr = cfg
            .discovery
            .announce_addr
            .clone()
            .or_else(|| bound.map(|a| a.to_string()));
        match announce_addr {
            Some(announce_addr) => {
                let discovery_config = DiscoveryConfig {
                    eid: cfg.eid.clone(),
                    announce_addr,
                    listen_port: cfg.discovery.port,
                    broadcast_addr: cfg.discovery.broadcast_addr.clone(),
                    interval: if args.announce_interval.as_secs() != 10 {
                        Duration::from(args.announce_interval)
                    } else {
                        Duration::from_secs(cfg.discovery.interval_s)
                    },
                    queue_len: 32,
                };
                let scheme = cfg.cla_name.clone();
                let discovery_router_tx = router_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        run_discovery(discovery_config, scheme, discovery_router_tx).await
                    {
                        warn!("Discovery failed: {}", e);
                    }
                });
            }
            None => warn!("Discovery enabled but no announce address available, disabled"),
        }
    }

    // Ingest loop: received wire payloads become stored bundles, each
    // announced to the router for (re)flooding.
    let ingest_store = store.clone();
    let ingest_router_tx = router_tx.clone();
    tokio::spawn(async move {
        while let Some((version, payload)) = ingest_rx.recv().await {
            let mut bundle = match Bundle::deserialize(payload) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Discarding malformed {:?} bundle: {}", version, e);
                    continue;
                }
            };
            bundle.hop_count = bundle.hop_count.saturating_add(1);
            match ingest_store.add(bundle).await {
                Ok(id) => {
                    debug!("Stored received bundle as {}", id);
                    if ingest_router_tx.send(RouterSignal::RouteBundle(id)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Dropping received bundle: {}", e),
            }
        }
    });

    info!("Agent started. Waiting for bundles...");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

    // Bundle-processor report loop: outcome signals become log lines.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            maybe = bp_rx.recv() => match maybe {
                Some(signal) => report_outcome(&signal),
                None => {
                    info!("Signal channels closed, shutting down");
                    break;
                }
            }
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}

fn report_outcome(signal: &BpSignal) {
    match signal.outcome {
        BundleOutcome::Routed => {
            debug!("Bundle {} bound to routes", signal.bundle_id);
        }
        BundleOutcome::TransmissionSuccess => {
            info!("Bundle {} replicated to every contact", signal.bundle_id);
        }
        BundleOutcome::TransmissionFailure => {
            warn!(
                "Bundle {} replication incomplete ({:?})",
                signal.bundle_id, signal.reason
            );
        }
        BundleOutcome::Expired => {
            info!("Bundle {} expired ({:?})", signal.bundle_id, signal.reason);
        }
        BundleOutcome::ForwardingContraindicated => {
            debug!(
                "Bundle {} not forwardable ({:?})",
                signal.bundle_id, signal.reason
            );
        }
    }
}

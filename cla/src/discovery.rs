//! UDP beacon neighbor discovery.
//!
//! Two concerns run decoupled: an announce loop broadcasting this node's
//! beacon every interval, and a scan loop receiving peer beacons. Scanned
//! beacons pass through a bounded queue (dropped silently when full, the
//! scan loop never blocks) and are forwarded to the router as
//! neighbor-discovered signals. Contact establishment stays with the
//! transport layer, not the router.

use crate::{address, ClaError};
use dtn_routing::{Node, RouterSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Beacon wire prefix; bumps with any format change.
const BEACON_PREFIX: &str = "DTNB1";

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Our endpoint identifier, announced in every beacon
    pub eid: String,
    /// Connect address peers should dial to reach us
    pub announce_addr: String,
    /// UDP port to listen for beacons on
    pub listen_port: u16,
    /// Destination for our own beacons, e.g. `255.255.255.255:3005`
    pub broadcast_addr: String,
    /// Announce interval
    pub interval: Duration,
    /// Bound on beacons queued between scan and forward
    pub queue_len: usize,
}

/// Encode one beacon.
fn format_beacon(eid: &str, connect_addr: &str) -> String {
    format!("{} {} {}", BEACON_PREFIX, eid, connect_addr)
}

/// Decode a beacon into `(eid, connect_addr)`.
fn parse_beacon(data: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.splitn(3, ' ');
    if parts.next()? != BEACON_PREFIX {
        return None;
    }
    let eid = parts.next()?;
    let connect_addr = parts.next()?;
    if eid.is_empty() || connect_addr.is_empty() {
        return None;
    }
    Some((eid.to_string(), connect_addr.to_string()))
}

/// Parse a received datagram and offer it to the bounded queue.
fn offer_beacon(data: &[u8], own_eid: &str, seen_tx: &mpsc::Sender<(String, String)>) {
    let Some((eid, connect_addr)) = parse_beacon(data) else {
        trace!("ignoring malformed beacon");
        return;
    };
    if eid == own_eid {
        return;
    }
    // never block in scan context; a full queue drops the beacon
    if seen_tx.try_send((eid, connect_addr)).is_err() {
        trace!("discovery queue full, beacon dropped");
    }
}

/// Drain scanned beacons into router neighbor-discovered signals.
async fn forward_beacons(
    mut seen_rx: mpsc::Receiver<(String, String)>,
    router_tx: mpsc::UnboundedSender<RouterSignal>,
    scheme: String,
) {
    while let Some((eid, connect_addr)) = seen_rx.recv().await {
        let cla_addr = address::make_cla_addr(&scheme, &connect_addr);
        debug!("neighbor {} seen at {}", eid, cla_addr);
        if router_tx
            .send(RouterSignal::NeighborDiscovered(Node { eid, cla_addr }))
            .is_err()
        {
            return;
        }
    }
}

/// Run discovery: announce our beacon every interval and scan for peers.
///
/// Runs until the process exits; returns early only on socket setup
/// failure.
pub async fn run_discovery(
    config: DiscoveryConfig,
    scheme: String,
    router_tx: mpsc::UnboundedSender<RouterSignal>,
) -> Result<(), ClaError> {
    let socket = UdpSocket::bind(("0.0.0.0", config.listen_port)).await?;
    socket.set_broadcast(true)?;
    let socket = Arc::new(socket);
    info!(
        "discovery: announcing {} at {} every {:?}",
        config.eid, config.announce_addr, config.interval
    );

    let (seen_tx, seen_rx) = mpsc::channel(config.queue_len);
    tokio::spawn(forward_beacons(seen_rx, router_tx, scheme));

    let announce_socket = socket.clone();
    let beacon = format_beacon(&config.eid, &config.announce_addr);
    let broadcast_addr = config.broadcast_addr.clone();
    let interval = config.interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = announce_socket
                .send_to(beacon.as_bytes(), &broadcast_addr)
                .await
            {
                warn!("discovery: beacon send failed: {}", e);
            }
        }
    });

    let mut buf = [0u8; 512];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, _from)) => offer_beacon(&buf[..n], &config.eid, &seen_tx),
            Err(e) => warn!("discovery: recv failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_roundtrip() {
        let beacon = format_beacon("dtn://alpha", "10.0.0.7:4556");
        assert_eq!(
            parse_beacon(beacon.as_bytes()),
            Some(("dtn://alpha".to_string(), "10.0.0.7:4556".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_malformed_beacons() {
        for bad in [
            &b""[..],
            b"DTNB1",
            b"DTNB1 dtn://alpha",
            b"OTHER dtn://alpha 10.0.0.7:4556",
            &[0xFF, 0xFE, 0x00][..],
        ] {
            assert_eq!(parse_beacon(bad), None, "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_own_beacons_are_ignored() {
        let (seen_tx, mut seen_rx) = mpsc::channel(4);
        let own = format_beacon("dtn://alpha", "10.0.0.7:4556");
        offer_beacon(own.as_bytes(), "dtn://alpha", &seen_tx);
        assert!(seen_rx.try_recv().is_err());

        let peer = format_beacon("dtn://beta", "10.0.0.8:4556");
        offer_beacon(peer.as_bytes(), "dtn://alpha", &seen_tx);
        assert_eq!(
            seen_rx.try_recv().unwrap(),
            ("dtn://beta".to_string(), "10.0.0.8:4556".to_string())
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_beacons() {
        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        for i in 0..3 {
            let beacon = format_beacon("dtn://beta", &format!("10.0.0.8:{}", 4000 + i));
            offer_beacon(beacon.as_bytes(), "dtn://alpha", &seen_tx);
        }
        // only the first fit; the rest were dropped, nothing blocked
        assert_eq!(
            seen_rx.try_recv().unwrap().1,
            "10.0.0.8:4000".to_string()
        );
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forward_maps_to_neighbor_signals() {
        let (seen_tx, seen_rx) = mpsc::channel(4);
        let (router_tx, mut router_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_beacons(seen_rx, router_tx, "mtcp".to_string()));

        seen_tx
            .send(("dtn://beta".to_string(), "10.0.0.8:4556".to_string()))
            .await
            .unwrap();

        match router_rx.recv().await.unwrap() {
            RouterSignal::NeighborDiscovered(node) => {
                assert_eq!(node.eid, "dtn://beta");
                assert_eq!(node.cla_addr, "mtcp://10.0.0.8:4556");
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }
}

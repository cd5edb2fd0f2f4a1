//! Per-link RX and TX worker loops.

use crate::instance::{ClaInstance, Connection};
use crate::link::Link;
use crate::ClaError;
use dtn_routing::{OutboundBundle, RouterSignal};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// RX worker: drains the link's byte queue through the parser pipeline
/// and forwards completed bundle payloads to the ingest queue.
///
/// Exits when the link disconnects; the read call observes the connected
/// flag while blocked, so teardown never leaves this task hanging.
pub(crate) async fn rx_worker(instance: Arc<ClaInstance>, link: Arc<Link>) {
    let mut buf = [0u8; 512];
    let mut completed = Vec::new();
    loop {
        let n = match link.read(&mut buf).await {
            Ok(n) => n,
            Err(_) => break,
        };
        {
            let mut pipeline = link.pipeline.lock().await;
            pipeline.feed(&buf[..n], &mut completed);
        }
        for (version, payload) in completed.drain(..) {
            trace!(
                "{}: received {:?} bundle payload, {} bytes",
                link.cla_addr(),
                version,
                payload.len()
            );
            if instance.ingest(version, payload).await.is_err() {
                warn!("{}: ingest queue closed", link.cla_addr());
                return;
            }
        }
    }
    debug!("{}: RX worker exiting", link.cla_addr());
}

/// TX worker: drains the link's outbound queue, transmitting each bundle
/// as one framed packet and reporting the attempt outcome to the router.
///
/// Transport failure is link-fatal: the connection is closed and the
/// worker exits; the lifecycle manager finishes the cleanup on the
/// resulting `ConnectionDown`.
pub(crate) async fn tx_worker(
    instance: Arc<ClaInstance>,
    link: Arc<Link>,
    conn: Arc<dyn Connection>,
    mut tx_rx: mpsc::Receiver<OutboundBundle>,
) {
    let mut connected = link.subscribe_connected();
    loop {
        let outbound = tokio::select! {
            maybe = tx_rx.recv() => match maybe {
                Some(outbound) => outbound,
                None => break,
            },
            changed = connected.changed() => {
                if changed.is_err() || !*connected.borrow() {
                    break;
                }
                continue;
            }
        };

        // Fragments unbound by a rollback are skipped, not transmitted.
        if outbound.routed.is_cancelled() {
            trace!(
                "{}: skipping cancelled handover of bundle {}",
                link.cla_addr(),
                outbound.bundle.id
            );
            continue;
        }

        let wire = outbound.bundle.serialize();
        match transmit_packet(&instance, &link, conn.as_ref(), &wire).await {
            Ok(()) => {
                debug!(
                    "{}: transmitted bundle {} ({} bytes)",
                    link.cla_addr(),
                    outbound.bundle.id,
                    wire.len()
                );
                instance.signal_router(RouterSignal::TransmissionSuccess(outbound.routed));
            }
            Err(e) => {
                warn!(
                    "{}: transmission of bundle {} failed: {}",
                    link.cla_addr(),
                    outbound.bundle.id,
                    e
                );
                instance.signal_router(RouterSignal::TransmissionFailure(outbound.routed));
                conn.close().await;
                break;
            }
        }
    }
    debug!("{}: TX worker exiting", link.cla_addr());
}

async fn transmit_packet(
    instance: &ClaInstance,
    link: &Link,
    conn: &dyn Connection,
    wire: &[u8],
) -> Result<(), ClaError> {
    instance.begin_packet(link, conn, wire.len()).await?;
    instance.send_packet_data(link, conn, wire).await?;
    instance.end_packet(conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{ClaConfig, LifecycleEvent};
    use crate::testutil::MockConnection;
    use bytes::Bytes;
    use dtn_routing::RoutedBundle;
    use dtn_storage::{Bundle, BundleFlags};
    use dtn_wire::BundleVersion;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc as tokio_mpsc;
    use tokio::time::{timeout, Duration};

    fn bundle(payload: &'static [u8]) -> Bundle {
        Bundle {
            id: 1,
            version: BundleVersion::V7,
            source: "dtn://alpha/app".into(),
            destination: "dtn://beta/app".into(),
            creation_timestamp_s: 1_700_000_000,
            lifetime_s: 60,
            flags: BundleFlags::empty(),
            hop_count: 0,
            fragment_offset: 0,
            total_adu_length: payload.len() as u64,
            payload: Bytes::from_static(payload),
        }
    }

    struct Rig {
        instance: Arc<ClaInstance>,
        conn: Arc<MockConnection>,
        addr: String,
        router_rx: tokio_mpsc::UnboundedReceiver<RouterSignal>,
        ingest_rx: tokio_mpsc::Receiver<(BundleVersion, Bytes)>,
    }

    /// Bring one mock connection all the way up through the lifecycle.
    async fn rig(name: &str) -> Rig {
        let (router_tx, router_rx) = tokio_mpsc::unbounded_channel();
        let (ingest_tx, ingest_rx) = tokio_mpsc::channel(16);
        let config = ClaConfig {
            name: name.to_string(),
            ..ClaConfig::default()
        };
        let instance = ClaInstance::new(config, router_tx, ingest_tx).unwrap();
        let conn = MockConnection::new("peer:9", false);
        let addr = format!("{}://peer:9", instance.name());
        instance
            .handle_event(LifecycleEvent::ConnectionUp(conn.clone()))
            .await;
        instance
            .handle_event(LifecycleEvent::ChannelUp(conn.clone()))
            .await;
        let mut rig = Rig {
            instance,
            conn,
            addr,
            router_rx,
            ingest_rx,
        };
        let _ = rig.router_rx.try_recv(); // ContactUp
        rig
    }

    #[tokio::test]
    async fn test_tx_worker_transmits_and_reports_success() {
        let mut r = rig("txw-ok").await;
        let b = bundle(b"payload");
        let routed = RoutedBundle::new(1, b.destination.clone(), vec![r.addr.clone()]);
        let tx = r.instance.get_tx_queue(&r.addr).await.unwrap();
        tx.send(OutboundBundle {
            bundle: b.clone(),
            routed,
        })
        .await
        .unwrap();

        let signal = timeout(Duration::from_secs(1), r.router_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal, RouterSignal::TransmissionSuccess(_)));

        // header frame plus the MTU-chunked serialized bundle, in order
        let submitted = r.conn.submitted.lock().unwrap().clone();
        let flat: Vec<u8> = submitted.concat();
        let wire = b.serialize();
        let header = dtn_wire::encode_header(wire.len() as u64);
        assert_eq!(&flat[..header.len()], header.as_slice());
        assert_eq!(&flat[header.len()..], &wire[..]);
    }

    #[tokio::test]
    async fn test_tx_worker_failure_is_link_fatal() {
        let mut r = rig("txw-fail").await;
        r.conn.fail_submit.store(true, Ordering::SeqCst);

        let b = bundle(b"payload");
        let routed = RoutedBundle::new(1, b.destination.clone(), vec![r.addr.clone()]);
        let tx = r.instance.get_tx_queue(&r.addr).await.unwrap();
        tx.send(OutboundBundle { bundle: b, routed }).await.unwrap();

        let signal = timeout(Duration::from_secs(1), r.router_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal, RouterSignal::TransmissionFailure(_)));

        // the worker tears the connection down
        timeout(Duration::from_secs(1), async {
            while !r.conn.closed.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_tx_worker_skips_cancelled_handover() {
        let mut r = rig("txw-skip").await;
        let b = bundle(b"payload");
        let routed = RoutedBundle::new(1, b.destination.clone(), vec![r.addr.clone()]);
        routed.cancel();
        let tx = r.instance.get_tx_queue(&r.addr).await.unwrap();
        tx.send(OutboundBundle {
            bundle: b.clone(),
            routed,
        })
        .await
        .unwrap();

        // a second, live handover still goes through
        let live = RoutedBundle::new(2, b.destination.clone(), vec![r.addr.clone()]);
        tx.send(OutboundBundle { bundle: b, routed: live })
            .await
            .unwrap();
        let signal = timeout(Duration::from_secs(1), r.router_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match signal {
            RouterSignal::TransmissionSuccess(routed) => assert_eq!(routed.bundle_id, 2),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rx_worker_delivers_parsed_payloads() {
        let mut r = rig("rxw-ok").await;

        let b = bundle(b"incoming data");
        let wire = b.serialize();
        let mut framed = dtn_wire::encode_header(wire.len() as u64).to_vec();
        framed.extend_from_slice(&wire);

        // bytes arrive in small chunks from callback context
        for chunk in framed.chunks(3) {
            r.instance.handle_rx(&r.addr, chunk).await;
        }

        let (version, payload) = timeout(Duration::from_secs(1), r.ingest_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, BundleVersion::V7);
        let decoded = Bundle::deserialize(payload).unwrap();
        assert_eq!(decoded.payload, Bytes::from_static(b"incoming data"));
    }

    #[tokio::test]
    async fn test_workers_quiesce_on_connection_down() {
        let r = rig("quiesce-test").await;
        r.instance
            .handle_event(LifecycleEvent::ConnectionDown(r.conn.clone()))
            .await;
        // handle_event returns only after both workers exited and the
        // link left the registry
        assert!(r.instance.get_tx_queue(&r.addr).await.is_none());
    }
}

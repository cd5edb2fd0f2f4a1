//! Per-link state: RX byte queue, TX queue, connected flag, parser.

use crate::instance::Connection;
use crate::ClaError;
use dtn_routing::OutboundBundle;
use dtn_wire::RxPipeline;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{trace, warn};

/// How often a blocked read re-checks the connected flag.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Grace period for best-effort fill after the first byte.
const RX_GRACE: Duration = Duration::from_millis(5);

/// One active transport connection/channel to a peer.
///
/// Created by the lifecycle manager on a connect/accept event and
/// destroyed by it after both workers have quiesced. The registry owns
/// lookup; everything inside the link has its own finer-grained guards.
pub struct Link {
    cla_addr: String,
    rx_tx: mpsc::Sender<u8>,
    rx_rx: Mutex<mpsc::Receiver<u8>>,
    tx_tx: mpsc::Sender<OutboundBundle>,
    tx_rx: StdMutex<Option<mpsc::Receiver<OutboundBundle>>>,
    connected: watch::Sender<bool>,
    owner: StdMutex<Option<Arc<dyn Connection>>>,
    pub(crate) pipeline: Mutex<RxPipeline>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Link {
    /// Create a link with the given RX byte-queue and TX queue capacities.
    pub fn new(cla_addr: String, rx_capacity: usize, tx_capacity: usize) -> Arc<Self> {
        let (rx_tx, rx_rx) = mpsc::channel(rx_capacity);
        let (tx_tx, tx_rx) = mpsc::channel(tx_capacity);
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            cla_addr,
            rx_tx,
            rx_rx: Mutex::new(rx_rx),
            tx_tx,
            tx_rx: StdMutex::new(Some(tx_rx)),
            connected,
            owner: StdMutex::new(None),
            pipeline: Mutex::new(RxPipeline::new()),
            workers: StdMutex::new(Vec::new()),
        })
    }

    /// Bind the transport connection this link was registered for.
    pub(crate) fn bind_owner(&self, conn: Arc<dyn Connection>) {
        *self.owner.lock().expect("owner lock poisoned") = Some(conn);
    }

    /// Whether `conn` is the connection this link was registered for.
    ///
    /// Lifecycle events from a connection that lost the address race must
    /// not act on the surviving link.
    pub(crate) fn is_owned_by(&self, conn: &Arc<dyn Connection>) -> bool {
        self.owner
            .lock()
            .expect("owner lock poisoned")
            .as_ref()
            .map(|owner| std::ptr::addr_eq(Arc::as_ptr(owner), Arc::as_ptr(conn)))
            .unwrap_or(false)
    }

    /// The link's CLA address.
    pub fn cla_addr(&self) -> &str {
        &self.cla_addr
    }

    /// Whether the channel is currently usable.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the connected flag.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Set the connected flag. `send_replace` stores the value even while
    /// no worker has subscribed yet; a plain `send` would drop it.
    pub(crate) fn mark_connected(&self) {
        self.connected.send_replace(true);
    }

    /// Clear the connected flag; blocked workers observe it on their next
    /// wake or poll timeout.
    pub(crate) fn mark_disconnected(&self) {
        self.connected.send_replace(false);
    }

    /// Push received bytes from transport-callback context.
    ///
    /// Never blocks; bytes that do not fit the bounded queue are dropped
    /// silently.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut dropped = 0usize;
        for &byte in bytes {
            if self.rx_tx.try_send(byte).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            trace!("{}: RX queue full, dropped {} bytes", self.cla_addr, dropped);
        }
    }

    /// Read received bytes into `buf`.
    ///
    /// A zero-length request returns immediately. The first byte blocks,
    /// polling the connected flag so teardown is observed promptly even on
    /// an empty queue; the rest of the buffer is filled best-effort with a
    /// short grace timeout per byte.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ClaError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut rx = self.rx_rx.lock().await;

        buf[0] = loop {
            if !self.is_connected() {
                return Err(ClaError::Disconnected);
            }
            match timeout(RX_POLL_INTERVAL, rx.recv()).await {
                Ok(Some(byte)) => break byte,
                Ok(None) => return Err(ClaError::Disconnected),
                Err(_) => continue,
            }
        };

        let mut filled = 1;
        while filled < buf.len() {
            match timeout(RX_GRACE, rx.recv()).await {
                Ok(Some(byte)) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                _ => break,
            }
        }
        Ok(filled)
    }

    /// Sender side of the outbound queue.
    pub fn tx_sender(&self) -> mpsc::Sender<OutboundBundle> {
        self.tx_tx.clone()
    }

    /// Take the receive side of the outbound queue; only the TX worker may.
    pub(crate) fn take_tx_receiver(&self) -> Option<mpsc::Receiver<OutboundBundle>> {
        self.tx_rx.lock().expect("tx receiver lock poisoned").take()
    }

    /// Reset the link's parser pipeline to the header phase.
    pub async fn reset_parsers(&self) {
        self.pipeline.lock().await.reset();
    }

    pub(crate) fn add_worker(&self, handle: JoinHandle<()>) {
        self.workers.lock().expect("worker lock poisoned").push(handle);
    }

    /// Wait for the RX/TX workers to exit.
    pub(crate) async fn quiesce(&self) {
        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("worker lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("{}: worker task failed: {}", self.cla_addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_flag_holds_without_subscribers() {
        // the flag is set before any worker subscribes to the watch
        let link = Link::new("mtcp://peer".into(), 16, 4);
        assert!(!link.is_connected());
        link.mark_connected();
        assert!(link.is_connected());

        let mut watched = link.subscribe_connected();
        assert!(*watched.borrow_and_update());
        link.mark_disconnected();
        assert!(!link.is_connected());
        assert!(watched.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_zero_length_read_returns_immediately() {
        let link = Link::new("mtcp://peer".into(), 16, 4);
        link.mark_connected();
        let mut buf = [];
        assert_eq!(link.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_is_best_effort() {
        let link = Link::new("mtcp://peer".into(), 16, 4);
        link.mark_connected();
        link.push_bytes(&[1, 2, 3]);

        // buffer larger than what is queued: returns early, no stall
        let mut buf = [0u8; 8];
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_read_observes_disconnect() {
        let link = Link::new("mtcp://peer".into(), 16, 4);
        link.mark_connected();

        let reader = {
            let link = link.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                link.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;

        link.mark_disconnected();
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(ClaError::Disconnected)));
    }

    #[tokio::test]
    async fn test_rx_queue_drops_overflow_silently() {
        let link = Link::new("mtcp://peer".into(), 4, 4);
        link.mark_connected();
        link.push_bytes(&[1, 2, 3, 4, 5, 6]);

        let mut buf = [0u8; 8];
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_disconnected_read_fails_with_zero_bytes() {
        let link = Link::new("mtcp://peer".into(), 16, 4);
        link.push_bytes(&[9]);
        let mut buf = [0u8; 4];
        assert!(matches!(
            link.read(&mut buf).await,
            Err(ClaError::Disconnected)
        ));
    }
}

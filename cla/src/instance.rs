//! CLA instance: singleton-per-transport, lifecycle event loop, op table.

use crate::address;
use crate::link::Link;
use crate::pool::SendPool;
use crate::registry::LinkRegistry;
use crate::workers;
use crate::ClaError;
use async_trait::async_trait;
use bytes::Bytes;
use dtn_routing::{ContactResolver, OutboundBundle, RouteError, RouterSignal};
use dtn_wire::{encode_header, BundleVersion};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// One CLA instance per transport kind, process-wide.
static ACTIVE_INSTANCES: Lazy<StdMutex<HashSet<String>>> =
    Lazy::new(|| StdMutex::new(HashSet::new()));

/// A transport connection handed to the lifecycle manager.
///
/// Implementations are the per-transport half of the CLA op table. All
/// methods may be called from any task; none may touch the link registry.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Peer connect-address (the part after the scheme).
    fn peer_identifier(&self) -> String;

    /// Whether the local side initiated this connection.
    fn is_initiator(&self) -> bool;

    /// Largest chunk the transport accepts per submission.
    fn mtu(&self) -> usize;

    /// Actively establish the logical channel (initiator role only).
    async fn request_channel(&self) -> Result<(), ClaError>;

    /// Submit one pool buffer for transmission. The buffer's slot is
    /// released via its completion, once the transport has consumed it.
    async fn submit(&self, buf: crate::pool::PoolBuf) -> Result<(), ClaError>;

    /// Tear the connection down; the transport delivers `ConnectionDown`.
    async fn close(&self);
}

/// Lifecycle events, enqueued by transport callbacks and consumed by the
/// instance's single manager task.
pub enum LifecycleEvent {
    /// A transport connection was established or accepted
    ConnectionUp(Arc<dyn Connection>),
    /// The logical channel on a connection became usable
    ChannelUp(Arc<dyn Connection>),
    /// The logical channel went away; triggers connection close
    ChannelDown(Arc<dyn Connection>),
    /// The transport connection is gone
    ConnectionDown(Arc<dyn Connection>),
}

/// CLA instance configuration.
#[derive(Debug, Clone)]
pub struct ClaConfig {
    /// Transport/scheme name, e.g. `mtcp`
    pub name: String,
    /// Maximum concurrent links
    pub max_links: usize,
    /// Per-submission chunk limit used when a transport reports no MTU
    pub mtu: usize,
    /// Largest serialized bundle this CLA accepts
    pub max_bundle_size: usize,
    /// Send-buffer pool slots (per instance, not per link)
    pub pool_slots: usize,
    /// Per-link RX byte-queue capacity
    pub rx_queue_bytes: usize,
    /// Per-link TX queue capacity
    pub tx_queue_len: usize,
}

impl Default for ClaConfig {
    fn default() -> Self {
        Self {
            name: "mtcp".to_string(),
            max_links: 16,
            mtu: 1400,
            max_bundle_size: 1 << 20,
            pool_slots: 8,
            rx_queue_bytes: 4096,
            tx_queue_len: 8,
        }
    }
}

/// A CLA instance: owns the link registry, the lifecycle queue, and the
/// send-buffer pool for one transport kind.
pub struct ClaInstance {
    config: ClaConfig,
    registry: Mutex<LinkRegistry>,
    lifecycle_tx: mpsc::Sender<LifecycleEvent>,
    lifecycle_rx: StdMutex<Option<mpsc::Receiver<LifecycleEvent>>>,
    pub(crate) pool: SendPool,
    router_tx: mpsc::UnboundedSender<RouterSignal>,
    ingest_tx: mpsc::Sender<(BundleVersion, Bytes)>,
}

impl ClaInstance {
    /// Create the instance for a transport kind.
    ///
    /// At most one instance per transport name may exist in the process;
    /// a second creation fails until the first is dropped.
    pub fn new(
        config: ClaConfig,
        router_tx: mpsc::UnboundedSender<RouterSignal>,
        ingest_tx: mpsc::Sender<(BundleVersion, Bytes)>,
    ) -> Result<Arc<Self>, ClaError> {
        {
            let mut active = ACTIVE_INSTANCES.lock().expect("instance table poisoned");
            if !active.insert(config.name.clone()) {
                return Err(ClaError::AlreadyExists(config.name));
            }
        }
        // Sized so teardown events always fit even with every link
        // connecting and disconnecting at once.
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(2 * config.max_links + 2);
        let pool = SendPool::new(config.pool_slots, config.mtu);
        Ok(Arc::new(Self {
            registry: Mutex::new(LinkRegistry::new(config.max_links)),
            lifecycle_tx,
            lifecycle_rx: StdMutex::new(Some(lifecycle_rx)),
            pool,
            router_tx,
            ingest_tx,
            config,
        }))
    }

    /// Transport name this instance adapts.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Instance configuration.
    pub fn config(&self) -> &ClaConfig {
        &self.config
    }

    /// Largest serialized bundle this CLA accepts.
    pub fn max_bundle_size(&self) -> usize {
        self.config.max_bundle_size
    }

    /// Enqueue a lifecycle event; called from transport tasks.
    pub async fn enqueue_event(&self, event: LifecycleEvent) {
        if self.lifecycle_tx.send(event).await.is_err() {
            warn!("{}: lifecycle manager gone, event dropped", self.config.name);
        }
    }

    pub(crate) fn signal_router(&self, signal: RouterSignal) {
        let _ = self.router_tx.send(signal);
    }

    pub(crate) async fn ingest(
        &self,
        version: BundleVersion,
        payload: Bytes,
    ) -> Result<(), ClaError> {
        self.ingest_tx
            .send((version, payload))
            .await
            .map_err(|_| ClaError::Disconnected)
    }

    fn cla_addr_for(&self, conn: &dyn Connection) -> String {
        address::make_cla_addr(&self.config.name, &conn.peer_identifier())
    }

    /// Run the lifecycle manager until the event queue closes.
    ///
    /// All four event kinds for one physical connection are serialized
    /// through this single task, so teardown never races setup for the
    /// same address.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self
            .lifecycle_rx
            .lock()
            .expect("lifecycle lock poisoned")
            .take()
            .expect("lifecycle manager already running");
        info!("{}: lifecycle manager started", self.config.name);
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
        info!("{}: lifecycle manager stopped", self.config.name);
    }

    pub(crate) async fn handle_event(self: &Arc<Self>, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ConnectionUp(conn) => self.handle_connection_up(conn).await,
            LifecycleEvent::ChannelUp(conn) => self.handle_channel_up(conn).await,
            LifecycleEvent::ChannelDown(conn) => {
                debug!("{}: channel down, closing connection", self.cla_addr_for(conn.as_ref()));
                conn.close().await;
            }
            LifecycleEvent::ConnectionDown(conn) => self.handle_connection_down(conn).await,
        }
    }

    async fn handle_connection_up(&self, conn: Arc<dyn Connection>) {
        let addr = self.cla_addr_for(conn.as_ref());
        let link = Link::new(
            addr.clone(),
            self.config.rx_queue_bytes,
            self.config.tx_queue_len,
        );
        link.bind_owner(conn.clone());

        let registered = self.registry.lock().await.register(link);
        if let Err(e) = registered {
            // Duplicate address is a protocol violation: the new link is
            // dropped and the newer connection torn down; the existing
            // link proceeds unaffected.
            warn!("{}: registration failed: {}", addr, e);
            conn.close().await;
            return;
        }
        info!("{}: connection up", addr);

        if conn.is_initiator() {
            if let Err(e) = conn.request_channel().await {
                warn!("{}: channel request failed: {}", addr, e);
                conn.close().await;
            }
        }
    }

    async fn handle_channel_up(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        let addr = self.cla_addr_for(conn.as_ref());
        let link = self.registry.lock().await.lookup(&addr);
        let Some(link) = link else {
            warn!("{}: channel up for unknown link", addr);
            conn.close().await;
            return;
        };

        // A rejected duplicate connection still delivers its channel
        // events; they must not act on the surviving link.
        if !link.is_owned_by(&conn) {
            warn!("{}: channel up from a superseded connection", addr);
            conn.close().await;
            return;
        }

        let Some(tx_rx) = link.take_tx_receiver() else {
            warn!("{}: link already initialized", addr);
            conn.close().await;
            return;
        };

        link.mark_connected();
        link.add_worker(tokio::spawn(workers::rx_worker(self.clone(), link.clone())));
        link.add_worker(tokio::spawn(workers::tx_worker(
            self.clone(),
            link.clone(),
            conn,
            tx_rx,
        )));
        info!("{}: channel up, link active", addr);
        self.signal_router(RouterSignal::ContactUp(addr));
    }

    async fn handle_connection_down(&self, conn: Arc<dyn Connection>) {
        let addr = self.cla_addr_for(conn.as_ref());
        // Removed from the registry before the teardown wait, so no task
        // can acquire a handle to a link that is being destroyed. Only the
        // owning connection's down event removes the link; a rejected
        // duplicate's teardown leaves the surviving link alone.
        let link = {
            let mut registry = self.registry.lock().await;
            match registry.lookup(&addr) {
                Some(link) if link.is_owned_by(&conn) => registry.unregister(&addr),
                Some(_) => {
                    debug!("{}: connection down from a superseded connection", addr);
                    return;
                }
                None => None,
            }
        };
        match link {
            Some(link) if link.is_connected() => {
                link.mark_disconnected();
                link.quiesce().await;
                info!("{}: connection down", addr);
                self.signal_router(RouterSignal::ContactDown(addr));
            }
            Some(_) => debug!("{}: connection down before channel up", addr),
            None => debug!("{}: connection down for unknown link", addr),
        }
    }

    /// Transmit-queue lookup for an address (op table).
    pub async fn get_tx_queue(&self, cla_addr: &str) -> Option<mpsc::Sender<OutboundBundle>> {
        let link = self.registry.lock().await.lookup(cla_addr)?;
        link.is_connected().then(|| link.tx_sender())
    }

    /// Push received bytes for an address from transport-callback context.
    ///
    /// The registry lock is held only long enough to find the link; the
    /// push itself never blocks.
    pub async fn handle_rx(&self, cla_addr: &str, bytes: &[u8]) {
        let link = self.registry.lock().await.lookup(cla_addr);
        if let Some(link) = link {
            link.push_bytes(bytes);
        }
    }

    /// Reset the parser pipeline of the link at `cla_addr`.
    pub async fn reset_parsers(&self, cla_addr: &str) {
        let link = self.registry.lock().await.lookup(cla_addr);
        if let Some(link) = link {
            link.reset_parsers().await;
        }
    }

    /// Emit the framing header announcing `length` payload bytes.
    pub async fn begin_packet(
        &self,
        link: &Link,
        conn: &dyn Connection,
        length: usize,
    ) -> Result<(), ClaError> {
        let header = encode_header(length as u64);
        self.send_packet_data(link, conn, &header).await
    }

    /// Transmit raw bytes, fragmenting at the transport MTU.
    ///
    /// Each chunk takes one pool slot before submission; acquisition
    /// blocks when the pool is exhausted, which is the instance-wide
    /// backpressure bound. Transport failure is link-fatal and is handled
    /// by the caller; partial data is not retried.
    pub async fn send_packet_data(
        &self,
        link: &Link,
        conn: &dyn Connection,
        mut data: &[u8],
    ) -> Result<(), ClaError> {
        let mtu = conn.mtu().max(1);
        while !data.is_empty() {
            if !link.is_connected() {
                return Err(ClaError::Disconnected);
            }
            let mut buf = self.pool.acquire().await?;
            let take = mtu.min(data.len());
            buf.data.extend_from_slice(&data[..take]);
            conn.submit(buf).await?;
            data = &data[take..];
        }
        Ok(())
    }

    /// Finish a packet. The framing carries no trailer.
    pub async fn end_packet(&self, _conn: &dyn Connection) -> Result<(), ClaError> {
        Ok(())
    }

    /// Scheduled-contact hook; this transport has no scheduled contacts.
    pub async fn start_scheduled_contact(&self, eid: &str, cla_addr: &str) {
        debug!("{}: scheduled contact start ignored ({} at {})", self.config.name, eid, cla_addr);
    }

    /// Scheduled-contact hook; this transport has no scheduled contacts.
    pub async fn end_scheduled_contact(&self, eid: &str, cla_addr: &str) {
        debug!("{}: scheduled contact end ignored ({} at {})", self.config.name, eid, cla_addr);
    }
}

impl Drop for ClaInstance {
    fn drop(&mut self) {
        ACTIVE_INSTANCES
            .lock()
            .expect("instance table poisoned")
            .remove(&self.config.name);
    }
}

#[async_trait]
impl ContactResolver for ClaInstance {
    async fn max_bundle_size(&self, cla_addr: &str) -> Option<usize> {
        let link = self.registry.lock().await.lookup(cla_addr)?;
        link.is_connected().then_some(self.config.max_bundle_size)
    }

    async fn enqueue(&self, cla_addr: &str, outbound: OutboundBundle) -> Result<(), RouteError> {
        let link = self
            .registry
            .lock()
            .await
            .lookup(cla_addr)
            .ok_or_else(|| RouteError::NoLink(cla_addr.to_string()))?;
        link.tx_sender()
            .try_send(outbound)
            .map_err(|_| RouteError::QueueUnavailable(cla_addr.to_string()))
    }
}

//! Single-task epidemic router dispatcher.

use crate::fragment::{fragment_and_route, DefaultFragmentAlloc, FragmentAlloc};
use crate::signal::{
    BpSignal, BundleOutcome, OutboundBundle, ReasonCode, RoutedBundle, RouterSignal,
};
use crate::RouteError;
use async_trait::async_trait;
use dtn_storage::{Bundle, BundleFlags, BundleId, BundleStore};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Resolves CLA addresses to live links: per-address size limit and
/// transmit-queue handover. Implemented by the CLA layer.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    /// Largest serialized bundle the link at `cla_addr` accepts, or
    /// `None` when no live link exists for the address.
    async fn max_bundle_size(&self, cla_addr: &str) -> Option<usize>;

    /// Hand a bundle to the link's transmit queue.
    async fn enqueue(&self, cla_addr: &str, outbound: OutboundBundle) -> Result<(), RouteError>;
}

/// Time source seam for expiration checks.
pub trait Clock: Send + Sync {
    /// Current time in unix seconds.
    fn now_unix_s(&self) -> u64;
}

/// Wall-clock time source.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_s(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Fan-out or hop budget: unlimited, a fixed count, or direct delivery only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// No bound
    Unlimited,
    /// At most this many
    Bounded(u32),
    /// Zero: only the contact registered for the destination itself
    DirectOnly,
}

impl FromStr for Limit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unlimited" => Ok(Limit::Unlimited),
            "direct" | "0" => Ok(Limit::DirectOnly),
            n => n
                .parse::<u32>()
                .map(|n| {
                    if n == 0 {
                        Limit::DirectOnly
                    } else {
                        Limit::Bounded(n)
                    }
                })
                .map_err(|_| format!("invalid limit '{}': expected 'unlimited', 'direct' or a count", s)),
        }
    }
}

/// Epidemic routing policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct EpidemicConfig {
    /// How many contacts each bundle is replicated to
    pub replication_limit: Limit,
    /// How many hops a bundle may flood before direct delivery only
    pub hop_limit: Limit,
}

impl Default for EpidemicConfig {
    fn default() -> Self {
        Self {
            replication_limit: Limit::Unlimited,
            hop_limit: Limit::Unlimited,
        }
    }
}

/// The router dispatcher: drains one signal queue, fully handling each
/// signal before the next, so the routing state needs no locks.
pub struct EpidemicDispatcher {
    store: Arc<dyn BundleStore>,
    resolver: Arc<dyn ContactResolver>,
    alloc: Box<dyn FragmentAlloc>,
    clock: Box<dyn Clock>,
    config: EpidemicConfig,
    signal_rx: mpsc::UnboundedReceiver<RouterSignal>,
    bp_tx: mpsc::UnboundedSender<BpSignal>,
    /// CLA addresses with a usable link
    contacts: BTreeSet<String>,
    /// Discovered neighbors: EID to CLA address
    neighbors: HashMap<String, String>,
}

impl EpidemicDispatcher {
    /// Create a dispatcher; the returned sender feeds its signal queue.
    pub fn new(
        store: Arc<dyn BundleStore>,
        resolver: Arc<dyn ContactResolver>,
        config: EpidemicConfig,
        bp_tx: mpsc::UnboundedSender<BpSignal>,
    ) -> (Self, mpsc::UnboundedSender<RouterSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        (
            Self::with_queue(store, resolver, config, bp_tx, signal_rx),
            signal_tx,
        )
    }

    /// Create a dispatcher over an externally created signal queue.
    ///
    /// Useful when signal producers must be constructed before the
    /// dispatcher itself.
    pub fn with_queue(
        store: Arc<dyn BundleStore>,
        resolver: Arc<dyn ContactResolver>,
        config: EpidemicConfig,
        bp_tx: mpsc::UnboundedSender<BpSignal>,
        signal_rx: mpsc::UnboundedReceiver<RouterSignal>,
    ) -> Self {
        Self {
            store,
            resolver,
            alloc: Box::new(DefaultFragmentAlloc),
            clock: Box::new(SystemClock),
            config,
            signal_rx,
            bp_tx,
            contacts: BTreeSet::new(),
            neighbors: HashMap::new(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the fragment allocator.
    pub fn with_alloc(mut self, alloc: Box<dyn FragmentAlloc>) -> Self {
        self.alloc = alloc;
        self
    }

    /// Run until every signal sender is dropped.
    pub async fn run(mut self) {
        info!("router dispatcher started");
        while let Some(signal) = self.signal_rx.recv().await {
            self.handle_signal(signal).await;
        }
        info!("router dispatcher stopped");
    }

    async fn handle_signal(&mut self, signal: RouterSignal) {
        match signal {
            RouterSignal::RouteBundle(id) => self.handle_route_bundle(id).await,
            RouterSignal::ContactUp(addr) => {
                info!("contact up: {}", addr);
                self.contacts.insert(addr);
            }
            RouterSignal::ContactDown(addr) => {
                info!("contact down: {}", addr);
                self.contacts.remove(&addr);
            }
            RouterSignal::TransmissionSuccess(routed) => self.handle_outcome(routed, true),
            RouterSignal::TransmissionFailure(routed) => self.handle_outcome(routed, false),
            RouterSignal::NeighborDiscovered(node) => {
                info!("neighbor discovered: {} at {}", node.eid, node.cla_addr);
                self.neighbors.insert(node.eid, node.cla_addr);
            }
            RouterSignal::WithdrawNode(eid) => {
                info!("withdrawing node {}", eid);
                self.neighbors.remove(&eid);
            }
            RouterSignal::OptimizationDrop(id) => {
                debug!("optimization drop for bundle {}", id);
                if let Err(e) = self.store.delete(id).await {
                    debug!("optimization drop: {}", e);
                }
            }
            // Reserved for richer routing policies; accepted and logged.
            RouterSignal::ProcessCommand(cmd) => {
                debug!("router command ignored under epidemic policy: {}", cmd);
            }
        }
    }

    async fn handle_route_bundle(&mut self, id: BundleId) {
        let bundle = match self.store.get(id).await {
            Ok(bundle) => bundle,
            Err(e) => {
                debug!("route-bundle {}: {}", id, e);
                self.inform(id, BundleOutcome::ForwardingContraindicated, ReasonCode::NoInfo);
                return;
            }
        };

        // Expiration is checked before any route lookup.
        if bundle.is_expired_at(self.clock.now_unix_s()) {
            debug!("bundle {} expired before routing", id);
            self.inform(id, BundleOutcome::Expired, ReasonCode::LifetimeExpired);
            return;
        }

        let chosen = self.select_contacts(&bundle);
        let mut live = Vec::with_capacity(chosen.len());
        let mut min_mtu = usize::MAX;
        for addr in chosen {
            match self.resolver.max_bundle_size(&addr).await {
                Some(limit) => {
                    min_mtu = min_mtu.min(limit);
                    live.push(addr);
                }
                None => debug!("contact {} has no live link", addr),
            }
        }

        // A bundle with zero eligible contacts is rejected before any
        // replication record exists.
        if live.is_empty() {
            self.inform(
                id,
                BundleOutcome::ForwardingContraindicated,
                ReasonCode::NoKnownRoute,
            );
            return;
        }

        if bundle.serialized_size() > min_mtu {
            if bundle.flags.contains(BundleFlags::MUST_NOT_FRAGMENT) {
                debug!("bundle {} oversized and must not fragment", id);
                self.inform(
                    id,
                    BundleOutcome::ForwardingContraindicated,
                    ReasonCode::NoKnownRoute,
                );
                return;
            }
            match fragment_and_route(
                self.store.as_ref(),
                self.resolver.as_ref(),
                self.alloc.as_ref(),
                &bundle,
                &live,
                min_mtu,
            )
            .await
            {
                Ok(bound) => {
                    for (fragment_id, _) in &bound {
                        self.inform(*fragment_id, BundleOutcome::Routed, ReasonCode::NoInfo);
                    }
                }
                Err(RouteError::NoMemory) | Err(RouteError::Storage(_)) => {
                    self.inform(
                        id,
                        BundleOutcome::ForwardingContraindicated,
                        ReasonCode::DepletedStorage,
                    );
                }
                Err(e) => {
                    warn!("fragmentation of bundle {} failed: {}", id, e);
                    self.inform(
                        id,
                        BundleOutcome::ForwardingContraindicated,
                        ReasonCode::NoTimelyContact,
                    );
                }
            }
            return;
        }

        let routed = RoutedBundle::new(id, bundle.destination.clone(), live.clone());
        for addr in &live {
            let outbound = OutboundBundle {
                bundle: bundle.clone(),
                routed: routed.clone(),
            };
            if let Err(e) = self.resolver.enqueue(addr, outbound).await {
                // A stalled link never blocks the dispatcher; the refused
                // handover resolves as a failed attempt.
                warn!("handover of bundle {} to {} failed: {}", id, addr, e);
                self.handle_outcome(routed.clone(), false);
            }
        }
        self.inform(id, BundleOutcome::Routed, ReasonCode::NoInfo);
    }

    /// Choose contacts per epidemic policy.
    fn select_contacts(&self, bundle: &Bundle) -> Vec<String> {
        let direct_only = matches!(self.config.replication_limit, Limit::DirectOnly)
            || match self.config.hop_limit {
                Limit::Unlimited => false,
                Limit::Bounded(n) => bundle.hop_count >= n,
                Limit::DirectOnly => true,
            };
        if direct_only {
            return self
                .neighbors
                .get(&bundle.destination)
                .filter(|addr| self.contacts.contains(*addr))
                .map(|addr| vec![addr.clone()])
                .unwrap_or_default();
        }

        let mut chosen: Vec<String> = self.contacts.iter().cloned().collect();
        if let Limit::Bounded(n) = self.config.replication_limit {
            chosen.truncate(n as usize);
        }
        chosen
    }

    /// Record one transmission outcome; report the aggregate exactly when
    /// the final outstanding attempt resolves.
    fn handle_outcome(&self, routed: Arc<RoutedBundle>, success: bool) {
        if let Some(all_transmitted) = routed.record_attempt(success) {
            let (outcome, reason) = if all_transmitted {
                (BundleOutcome::TransmissionSuccess, ReasonCode::NoInfo)
            } else {
                (BundleOutcome::TransmissionFailure, ReasonCode::NoTimelyContact)
            };
            self.inform(routed.bundle_id, outcome, reason);
        }
    }

    fn inform(&self, bundle_id: BundleId, outcome: BundleOutcome, reason: ReasonCode) {
        debug!("bundle {} outcome {:?} reason {:?}", bundle_id, outcome, reason);
        let _ = self.bp_tx.send(BpSignal {
            bundle_id,
            outcome,
            reason,
        });
    }
}

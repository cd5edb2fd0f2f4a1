//! Router signal types and the routed-bundle replication record.

use dtn_storage::{Bundle, BundleId};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A neighbor seen by discovery: node identifier plus how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Endpoint identifier of the neighbor node
    pub eid: String,
    /// CLA address the neighbor can be contacted at
    pub cla_addr: String,
}

/// Signals consumed by the router dispatcher.
///
/// A closed set of variants, each carrying its payload by move; every
/// signal is produced once and consumed exactly once by the dispatcher.
#[derive(Debug)]
pub enum RouterSignal {
    /// A stored bundle is ready to be routed
    RouteBundle(BundleId),
    /// A link to the given CLA address became usable
    ContactUp(String),
    /// The link to the given CLA address went away
    ContactDown(String),
    /// One replication attempt completed successfully
    TransmissionSuccess(Arc<RoutedBundle>),
    /// One replication attempt failed
    TransmissionFailure(Arc<RoutedBundle>),
    /// Discovery saw a neighbor
    NeighborDiscovered(Node),
    /// Forget everything known about a node
    WithdrawNode(String),
    /// Drop a bundle on request of the storage optimizer
    OptimizationDrop(BundleId),
    /// Out-of-band router command
    ProcessCommand(String),
}

/// Replication record for one routed bundle (or fragment).
///
/// Counters are only ever advanced by the dispatcher task (transmission
/// outcomes travel back to it as signals), so `serialized` and
/// `transmitted` never race; they are atomics so other tasks can observe
/// them. Invariant: `transmitted <= serialized <= contact_count`, and the
/// aggregate outcome resolves exactly once, when `serialized` first
/// reaches `contact_count`.
#[derive(Debug)]
pub struct RoutedBundle {
    /// Id of the bundle this record tracks
    pub bundle_id: BundleId,
    /// Destination endpoint identifier
    pub destination: String,
    /// CLA addresses the bundle was handed to
    pub contacts: Vec<String>,
    serialized: AtomicU32,
    transmitted: AtomicU32,
    cancelled: AtomicBool,
    resolved: AtomicBool,
}

impl RoutedBundle {
    /// Create a record fanning out to the given contacts.
    pub fn new(bundle_id: BundleId, destination: String, contacts: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            bundle_id,
            destination,
            contacts,
            serialized: AtomicU32::new(0),
            transmitted: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            resolved: AtomicBool::new(false),
        })
    }

    /// Replication fan-out target.
    pub fn contact_count(&self) -> u32 {
        self.contacts.len() as u32
    }

    /// Attempts resolved so far (success or failure).
    pub fn serialized(&self) -> u32 {
        self.serialized.load(Ordering::Acquire)
    }

    /// Attempts that completed successfully.
    pub fn transmitted(&self) -> u32 {
        self.transmitted.load(Ordering::Acquire)
    }

    /// Record one resolved replication attempt.
    ///
    /// Returns `Some(all_transmitted)` exactly once, on the call that
    /// resolves the final outstanding attempt. Must only be called from
    /// the dispatcher task.
    pub fn record_attempt(&self, success: bool) -> Option<bool> {
        let prev = self.serialized.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev < self.contact_count(), "attempt recorded past fan-out");
        if success {
            self.transmitted.fetch_add(1, Ordering::AcqRel);
        }
        if prev + 1 == self.contact_count() && !self.resolved.swap(true, Ordering::AcqRel) {
            Some(self.transmitted() == self.contact_count())
        } else {
            None
        }
    }

    /// Unbind this record from its route: queued handovers are skipped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the record was unbound from its route.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A bundle handed to a link's transmit queue, with its replication record.
#[derive(Debug)]
pub struct OutboundBundle {
    /// The bundle to serialize and transmit
    pub bundle: Bundle,
    /// Replication record the attempt outcome is reported against
    pub routed: Arc<RoutedBundle>,
}

/// Aggregate outcome kinds reported to the bundle processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleOutcome {
    /// The bundle (or fragment) was bound to one or more routes
    Routed,
    /// Every replication attempt transmitted successfully
    TransmissionSuccess,
    /// At least one replication attempt failed
    TransmissionFailure,
    /// The bundle outlived its lifetime
    Expired,
    /// The bundle cannot be forwarded
    ForwardingContraindicated,
}

/// Reason codes accompanying a bundle outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// No additional information
    NoInfo,
    /// No eligible route exists
    NoKnownRoute,
    /// Storage or buffer memory was exhausted
    DepletedStorage,
    /// The bundle lifetime elapsed
    LifetimeExpired,
    /// No contact resolved the transfer in time
    NoTimelyContact,
}

/// Status signal delivered to the bundle processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpSignal {
    /// Bundle the status refers to
    pub bundle_id: BundleId,
    /// Outcome kind
    pub outcome: BundleOutcome,
    /// Reason detail
    pub reason: ReasonCode,
}

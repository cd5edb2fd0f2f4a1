//! Routing signals, the epidemic dispatch policy, and fragmentation.
//!
//! The router is a single task draining one signal queue: bundle arrivals,
//! contact changes, neighbor discoveries, and transmission outcomes all
//! arrive as [`RouterSignal`] values and are handled strictly in order,
//! which keeps the routing decision state free of locks. Decisions are
//! reported back to the bundle processor as [`BpSignal`] status messages.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod fragment;
pub mod signal;

use thiserror::Error;

pub use dispatcher::{Clock, ContactResolver, EpidemicConfig, EpidemicDispatcher, Limit, SystemClock};
pub use fragment::{DefaultFragmentAlloc, FragmentAlloc};
pub use signal::{
    BpSignal, BundleOutcome, Node, OutboundBundle, ReasonCode, RoutedBundle, RouterSignal,
};

/// Routing errors
#[derive(Error, Debug)]
pub enum RouteError {
    /// No link is registered for the given CLA address
    #[error("no link for address {0}")]
    NoLink(String),
    /// The per-link transmit queue refused the handover
    #[error("transmit queue unavailable for {0}")]
    QueueUnavailable(String),
    /// Fragment allocation failed
    #[error("fragment allocation failed")]
    NoMemory,
    /// A fragment is too small to carry any payload at the route MTU
    #[error("maximum bundle size {0} leaves no room for payload")]
    FragmentTooSmall(usize),
    /// Storage-layer failure
    #[error(transparent)]
    Storage(#[from] dtn_storage::StorageError),
}

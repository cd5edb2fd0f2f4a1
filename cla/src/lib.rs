//! Convergence layer adapter (CLA) link engine.
//!
//! A CLA instance adapts bundles onto one transport kind. It owns an
//! address-keyed registry of live links, a lifecycle event loop that
//! serializes all connect/disconnect handling, per-link RX/TX worker
//! tasks, and a fixed send-buffer pool bounding in-flight outbound data
//! per instance. Transport callbacks never mutate shared state; they
//! enqueue events and return.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod discovery;
pub mod instance;
pub mod link;
pub mod pool;
pub mod registry;
pub mod tcp;
#[cfg(test)]
mod testutil;
mod workers;

use thiserror::Error;

pub use discovery::{run_discovery, DiscoveryConfig};
pub use instance::{ClaConfig, ClaInstance, Connection, LifecycleEvent};
pub use link::Link;
pub use pool::{PoolBuf, SendPool};
pub use registry::LinkRegistry;

/// CLA errors
#[derive(Error, Debug)]
pub enum ClaError {
    /// A CLA instance for this transport already exists
    #[error("CLA instance '{0}' already exists")]
    AlreadyExists(String),
    /// A link with this CLA address is already registered
    #[error("duplicate CLA address {0}")]
    DuplicateAddress(String),
    /// The link registry is at capacity
    #[error("link registry full: {0} links")]
    RegistryFull(usize),
    /// The peer disconnected
    #[error("link disconnected")]
    Disconnected,
    /// The send-buffer pool was torn down
    #[error("send-buffer pool closed")]
    PoolClosed,
    /// Malformed CLA address string
    #[error("malformed CLA address '{0}'")]
    Address(String),
    /// Transport I/O failure
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
}

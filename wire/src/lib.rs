//! MTCP framing and the streaming per-link RX parser pipeline.
//!
//! This crate implements the transport-adaptation framing used by the CLA
//! link engine: every logical payload is preceded by a small self-describing
//! length header (a CBOR byte-string head), and incoming byte streams are
//! driven through a two-phase parser that hands payload slices to a
//! version-selected bundle decoder without ever crossing a frame boundary.
//!
//! ## Wire format
//!
//! ```text
//! +----------------------+----------------------------+
//! | byte-string head     | 1..9 bytes, encodes length |
//! +----------------------+----------------------------+
//! | payload              | exactly that many bytes    |
//! +----------------------+----------------------------+
//! ```
//!
//! The payload's first byte selects the bundle decoder: `0x06` for
//! version-6 bundles, `0x9F` (CBOR indefinite array) for version-7.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod mtcp;
pub mod pipeline;

pub use error::WireError;
pub use mtcp::{encode_header, MtcpParser, MAX_HEADER_SIZE};
pub use pipeline::{BundleVersion, RxPipeline, DEFAULT_MAX_FRAME_SIZE};

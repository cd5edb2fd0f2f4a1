//! Per-link RX parser pipeline.
//!
//! Chains the MTCP header parser with a lazily selected, version-specific
//! bundle decoder. The inner decoders are deliberately not trusted to
//! respect the outer frame boundary: every slice handed to them is capped
//! at the remaining frame length, and a decoder claiming to consume more
//! than that trips a fatal assertion.

use crate::mtcp::MtcpParser;
use crate::WireError;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Default frame size limit (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Bundle protocol version selected from the payload discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleVersion {
    /// RFC 5050 bundle (primary block starts with version byte 6)
    V6,
    /// BPbis bundle (CBOR indefinite-length array head)
    V7,
}

impl BundleVersion {
    /// Discriminator byte opening a serialized bundle of this version.
    pub fn discriminator(self) -> u8 {
        match self {
            BundleVersion::V6 => 0x06,
            BundleVersion::V7 => 0x9F,
        }
    }

    fn from_discriminator(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x06 => Ok(BundleVersion::V6),
            0x9F => Ok(BundleVersion::V7),
            other => Err(WireError::Version(other)),
        }
    }
}

/// Inner decoder state: collects the bytes of one bundle.
///
/// The bundle formats are self-delimiting in principle, but this layer
/// treats them as opaque; the outer frame tells us where the bundle ends.
#[derive(Debug, Default)]
struct BundleCollector {
    buf: BytesMut,
}

impl BundleCollector {
    /// Consume as much input as offered; reports the full length consumed.
    fn read(&mut self, buf: &[u8]) -> usize {
        self.buf.extend_from_slice(buf);
        buf.len()
    }

    fn take(&mut self) -> Bytes {
        std::mem::take(&mut self.buf).freeze()
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Streaming RX pipeline for one link.
///
/// Exactly one parser is current at any time: the MTCP header parser until
/// the frame length is known, then the version-selected bundle collector
/// until `next_bytes` reaches zero.
#[derive(Debug)]
pub struct RxPipeline {
    mtcp: MtcpParser,
    version: Option<BundleVersion>,
    collector: BundleCollector,
}

impl RxPipeline {
    /// Create a pipeline with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a pipeline with an explicit frame size limit.
    pub fn with_max_frame_size(limit: u64) -> Self {
        Self {
            mtcp: MtcpParser::new(limit),
            version: None,
            collector: BundleCollector::default(),
        }
    }

    /// Reset all parser state back to the header-decode phase.
    pub fn reset(&mut self) {
        self.mtcp.reset();
        self.version = None;
        self.collector.reset();
    }

    /// Remaining payload bytes of the current frame.
    pub fn next_bytes(&self) -> u64 {
        self.mtcp.next_bytes
    }

    /// Whether the pipeline is waiting for a frame header.
    pub fn in_header_phase(&self) -> bool {
        !self.mtcp.in_payload()
    }

    /// Feed received bytes; completed bundle payloads are appended to `out`.
    ///
    /// Returns the number of bytes consumed. Malformed input (bad header,
    /// unknown version discriminator, oversized frame) discards the
    /// offending frame and resynchronizes; it never fails the link.
    pub fn feed(&mut self, mut buf: &[u8], out: &mut Vec<(BundleVersion, Bytes)>) -> usize {
        let mut total = 0;
        while !buf.is_empty() {
            if !self.mtcp.in_payload() {
                match self.mtcp.parse(buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        buf = &buf[n..];
                        // An empty frame carries no bundle; the parser has
                        // already returned to the header phase.
                        continue;
                    }
                    Err(e) => {
                        warn!("discarding malformed frame header: {}", e);
                        self.reset();
                        // Skip the rest of this chunk; resync on next input.
                        return total + buf.len();
                    }
                }
            }

            // Never hand the inner decoder bytes past the frame boundary.
            let cap = self.mtcp.next_bytes.min(buf.len() as u64) as usize;
            let slice = &buf[..cap];

            let consumed = match self.version {
                None => match BundleVersion::from_discriminator(slice[0]) {
                    Ok(version) => {
                        debug!("selected bundle parser version {:?}", version);
                        self.version = Some(version);
                        self.collector.read(slice)
                    }
                    Err(e) => {
                        warn!("resetting parsers: {}", e);
                        self.reset();
                        // Discard the remainder of the offending frame data.
                        return total + buf.len();
                    }
                },
                Some(_) => self.collector.read(slice),
            };

            // advance_payload asserts consumed <= next_bytes and resets the
            // outer parser when the frame is complete.
            self.mtcp.advance_payload(consumed as u64);
            if !self.mtcp.in_payload() {
                let version = self
                    .version
                    .take()
                    .expect("frame completed without a selected parser");
                out.push((version, self.collector.take()));
            }

            total += consumed;
            buf = &buf[consumed..];
        }
        total
    }
}

impl Default for RxPipeline {
    fn default() -> Self {
        Self::new()
    }
}

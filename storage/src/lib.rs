//! Bundle model and bundle storage.
//!
//! This crate defines the in-node representation of a bundle (the unit of
//! store-and-forward transfer), its self-describing binary serialization,
//! and the async [`BundleStore`] trait with an in-memory backend.
//!
//! The serialization deliberately opens with the protocol-version
//! discriminator byte so that serialized bundles feed straight back through
//! the receive parser pipeline on the far side of a link.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mem;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dtn_wire::BundleVersion;
use thiserror::Error;

pub use mem::MemoryStore;

/// Unique bundle identifier, assigned monotonically by the store.
pub type BundleId = u64;

bitflags! {
    /// Bundle processing control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BundleFlags: u32 {
        /// The bundle must not be fragmented in transit
        const MUST_NOT_FRAGMENT = 0x01;
        /// The bundle is a fragment of a larger ADU
        const IS_FRAGMENT = 0x02;
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// No bundle with the requested id
    #[error("bundle {0} not found")]
    NotFound(BundleId),
    /// The store has reached its capacity bound
    #[error("storage depleted: capacity {0} reached")]
    Depleted(usize),
    /// Serialized bundle bytes could not be decoded
    #[error("malformed bundle: {0}")]
    Malformed(&'static str),
}

/// A bundle held by this node.
///
/// The payload is opaque application data; fragment offset and total ADU
/// length describe this bundle's slice of the original application data
/// unit when [`BundleFlags::IS_FRAGMENT`] is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Store-assigned identifier (0 until added to a store)
    pub id: BundleId,
    /// Bundle protocol version
    pub version: BundleVersion,
    /// Source endpoint identifier
    pub source: String,
    /// Destination endpoint identifier
    pub destination: String,
    /// Creation timestamp, unix seconds
    pub creation_timestamp_s: u64,
    /// Lifetime in seconds from creation
    pub lifetime_s: u64,
    /// Processing control flags
    pub flags: BundleFlags,
    /// Number of nodes this bundle has traversed
    pub hop_count: u32,
    /// Offset of the payload within the original ADU
    pub fragment_offset: u64,
    /// Total length of the original ADU
    pub total_adu_length: u64,
    /// Payload bytes
    pub payload: Bytes,
}

/// Fixed serialized overhead besides the two EID strings:
/// version byte, two u32 EID lengths, creation, lifetime, flags u32,
/// hop count u32, fragment offset, total ADU length, payload length.
const FIXED_HEADER_SIZE: usize = 1 + 4 + 4 + 8 + 8 + 4 + 4 + 8 + 8 + 8;

impl Bundle {
    /// Unix-seconds instant after which the bundle must not be forwarded.
    pub fn expiration_time_s(&self) -> u64 {
        self.creation_timestamp_s.saturating_add(self.lifetime_s)
    }

    /// Whether the bundle has outlived its lifetime at `now` (unix seconds).
    pub fn is_expired_at(&self, now_s: u64) -> bool {
        now_s > self.expiration_time_s()
    }

    /// Serialized size of the headers alone, without any payload.
    pub fn header_size(&self) -> usize {
        FIXED_HEADER_SIZE + self.source.len() + self.destination.len()
    }

    /// Total serialized size including the payload.
    pub fn serialized_size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    /// Minimum serialized size of the first fragment of this bundle.
    ///
    /// Every fragment of this serialization replicates the full header, so
    /// the three minima coincide; they are kept distinct because the
    /// fragmentation policy reasons about them separately.
    pub fn first_fragment_min_size(&self) -> usize {
        self.header_size()
    }

    /// Minimum serialized size of an intermediate fragment.
    pub fn middle_fragment_min_size(&self) -> usize {
        self.header_size()
    }

    /// Minimum serialized size of the final fragment.
    pub fn last_fragment_min_size(&self) -> usize {
        self.header_size()
    }

    /// Serialize into self-describing wire bytes.
    ///
    /// The first byte is the version discriminator, so the result can be
    /// framed and parsed back by the receive pipeline.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        buf.put_u8(self.version.discriminator());
        buf.put_u32(self.source.len() as u32);
        buf.put_slice(self.source.as_bytes());
        buf.put_u32(self.destination.len() as u32);
        buf.put_slice(self.destination.as_bytes());
        buf.put_u64(self.creation_timestamp_s);
        buf.put_u64(self.lifetime_s);
        buf.put_u32(self.flags.bits());
        buf.put_u32(self.hop_count);
        buf.put_u64(self.fragment_offset);
        buf.put_u64(self.total_adu_length);
        buf.put_u64(self.payload.len() as u64);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a bundle from serialized wire bytes.
    ///
    /// The id is not carried on the wire; the decoded bundle has id 0 until
    /// it is added to a store.
    pub fn deserialize(mut buf: Bytes) -> Result<Self, StorageError> {
        if buf.remaining() < 1 {
            return Err(StorageError::Malformed("empty input"));
        }
        let version = match buf.get_u8() {
            0x06 => BundleVersion::V6,
            0x9F => BundleVersion::V7,
            _ => return Err(StorageError::Malformed("unknown version discriminator")),
        };
        let source = read_string(&mut buf)?;
        let destination = read_string(&mut buf)?;
        if buf.remaining() < 8 + 8 + 4 + 4 + 8 + 8 + 8 {
            return Err(StorageError::Malformed("truncated header"));
        }
        let creation_timestamp_s = buf.get_u64();
        let lifetime_s = buf.get_u64();
        let flags = BundleFlags::from_bits_truncate(buf.get_u32());
        let hop_count = buf.get_u32();
        let fragment_offset = buf.get_u64();
        let total_adu_length = buf.get_u64();
        let payload_len = buf.get_u64() as usize;
        if buf.remaining() < payload_len {
            return Err(StorageError::Malformed("truncated payload"));
        }
        let payload = buf.split_to(payload_len);
        Ok(Bundle {
            id: 0,
            version,
            source,
            destination,
            creation_timestamp_s,
            lifetime_s,
            flags,
            hop_count,
            fragment_offset,
            total_adu_length,
            payload,
        })
    }
}

fn read_string(buf: &mut Bytes) -> Result<String, StorageError> {
    if buf.remaining() < 4 {
        return Err(StorageError::Malformed("truncated string length"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(StorageError::Malformed("truncated string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| StorageError::Malformed("non-UTF-8 EID"))
}

/// Bundle storage interface.
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Persist a bundle, assigning and returning its id.
    async fn add(&self, bundle: Bundle) -> Result<BundleId, StorageError>;

    /// Fetch a bundle by id.
    async fn get(&self, id: BundleId) -> Result<Bundle, StorageError>;

    /// Remove a bundle by id.
    async fn delete(&self, id: BundleId) -> Result<(), StorageError>;

    /// Number of bundles currently held.
    async fn len(&self) -> usize;

    /// Whether the store holds no bundles.
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle() -> Bundle {
        Bundle {
            id: 0,
            version: BundleVersion::V7,
            source: "dtn://alpha/src".into(),
            destination: "dtn://beta/sink".into(),
            creation_timestamp_s: 1_700_000_000,
            lifetime_s: 3600,
            flags: BundleFlags::empty(),
            hop_count: 2,
            fragment_offset: 0,
            total_adu_length: 11,
            payload: Bytes::from_static(b"hello world"),
        }
    }

    #[test]
    fn test_serialize_roundtrip() {
        let bundle = sample_bundle();
        let wire = bundle.serialize();
        assert_eq!(wire.len(), bundle.serialized_size());
        assert_eq!(wire[0], 0x9F);

        let decoded = Bundle::deserialize(wire).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn test_serialize_roundtrip_v6_fragment() {
        let mut bundle = sample_bundle();
        bundle.version = BundleVersion::V6;
        bundle.flags = BundleFlags::IS_FRAGMENT;
        bundle.fragment_offset = 512;
        bundle.total_adu_length = 4096;

        let wire = bundle.serialize();
        assert_eq!(wire[0], 0x06);
        let decoded = Bundle::deserialize(wire).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn test_deserialize_rejects_truncation() {
        let wire = sample_bundle().serialize();
        for cut in [0, 1, 5, wire.len() - 1] {
            let truncated = wire.slice(..cut);
            assert!(Bundle::deserialize(truncated).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_deserialize_rejects_unknown_version() {
        let mut wire = BytesMut::from(&sample_bundle().serialize()[..]);
        wire[0] = 0x42;
        assert!(matches!(
            Bundle::deserialize(wire.freeze()),
            Err(StorageError::Malformed(_))
        ));
    }

    #[test]
    fn test_expiration() {
        let bundle = sample_bundle();
        assert_eq!(bundle.expiration_time_s(), 1_700_003_600);
        assert!(!bundle.is_expired_at(1_700_003_600));
        assert!(bundle.is_expired_at(1_700_003_601));
    }

    #[test]
    fn test_fragment_min_sizes_cover_header() {
        let bundle = sample_bundle();
        let header = bundle.serialized_size() - bundle.payload.len();
        assert_eq!(bundle.first_fragment_min_size(), header);
        assert_eq!(bundle.middle_fragment_min_size(), header);
        assert_eq!(bundle.last_fragment_min_size(), header);
    }
}

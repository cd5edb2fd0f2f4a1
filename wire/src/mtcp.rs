//! MTCP outer codec: a CBOR byte-string head announcing the payload length.
//!
//! The head is self-describing: `0x40 | n` for lengths below 24, or
//! `0x58`/`0x59`/`0x5A`/`0x5B` followed by a big-endian u8/u16/u32/u64.
//! The parser is a streaming state machine so the head may arrive in
//! arbitrarily small chunks.

use crate::WireError;
use smallvec::SmallVec;

/// Maximum encoded header size (head byte plus a u64 length)
pub const MAX_HEADER_SIZE: usize = 9;

/// CBOR major type 2 (byte string) in the high bits of the head byte
const MAJOR_BYTE_STRING: u8 = 0x40;

/// Encode a frame header announcing `len` payload bytes.
pub fn encode_header(len: u64) -> SmallVec<[u8; MAX_HEADER_SIZE]> {
    let mut buf = SmallVec::new();
    if len < 24 {
        buf.push(MAJOR_BYTE_STRING | len as u8);
    } else if len <= u8::MAX as u64 {
        buf.push(MAJOR_BYTE_STRING | 24);
        buf.push(len as u8);
    } else if len <= u16::MAX as u64 {
        buf.push(MAJOR_BYTE_STRING | 25);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= u32::MAX as u64 {
        buf.push(MAJOR_BYTE_STRING | 26);
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        buf.push(MAJOR_BYTE_STRING | 27);
        buf.extend_from_slice(&len.to_be_bytes());
    }
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the head byte
    Head,
    /// Collecting the multi-byte length that follows the head byte
    Length { remaining: u8 },
    /// Forwarding payload bytes until `next_bytes` reaches zero
    Payload,
}

/// Streaming parser for the MTCP framing header.
///
/// `next_bytes` is the number of payload bytes still owed for the current
/// frame; it is only meaningful while [`MtcpParser::in_payload`] is true and
/// decreases monotonically until the parser resets to the head stage.
#[derive(Debug)]
pub struct MtcpParser {
    stage: Stage,
    length: u64,
    max_frame_size: u64,
    /// Remaining payload bytes of the current frame
    pub next_bytes: u64,
}

impl MtcpParser {
    /// Create a parser enforcing the given frame size limit.
    pub fn new(max_frame_size: u64) -> Self {
        Self {
            stage: Stage::Head,
            length: 0,
            max_frame_size,
            next_bytes: 0,
        }
    }

    /// Reset to the head-decode stage, discarding any partial frame state.
    pub fn reset(&mut self) {
        self.stage = Stage::Head;
        self.length = 0;
        self.next_bytes = 0;
    }

    /// Whether the header is complete and payload bytes are expected next.
    pub fn in_payload(&self) -> bool {
        self.stage == Stage::Payload
    }

    /// Feed header bytes; returns how many bytes were consumed.
    ///
    /// Stops consuming as soon as the payload stage is entered. Callers must
    /// not pass payload bytes through this method.
    pub fn parse(&mut self, buf: &[u8]) -> Result<usize, WireError> {
        let mut consumed = 0;
        for &byte in buf {
            match self.stage {
                Stage::Head => {
                    if byte & 0xE0 != MAJOR_BYTE_STRING {
                        return Err(WireError::Header(byte));
                    }
                    consumed += 1;
                    match byte & 0x1F {
                        n @ 0..=23 => {
                            self.length = n as u64;
                            self.enter_payload()?;
                            return Ok(consumed);
                        }
                        24 => self.stage = Stage::Length { remaining: 1 },
                        25 => self.stage = Stage::Length { remaining: 2 },
                        26 => self.stage = Stage::Length { remaining: 4 },
                        27 => self.stage = Stage::Length { remaining: 8 },
                        ai => return Err(WireError::Reserved(ai)),
                    }
                    self.length = 0;
                }
                Stage::Length { remaining } => {
                    self.length = (self.length << 8) | byte as u64;
                    consumed += 1;
                    if remaining == 1 {
                        self.enter_payload()?;
                        return Ok(consumed);
                    }
                    self.stage = Stage::Length {
                        remaining: remaining - 1,
                    };
                }
                Stage::Payload => return Ok(consumed),
            }
        }
        Ok(consumed)
    }

    /// Account for `n` payload bytes handed to the inner decoder.
    ///
    /// Panics if `n` exceeds the remaining frame length; that would mean an
    /// inner decoder consumed past the declared frame boundary, which is a
    /// logic bug, not a runtime condition.
    pub fn advance_payload(&mut self, n: u64) {
        assert!(
            n <= self.next_bytes,
            "inner decoder consumed {} bytes past the frame boundary",
            n - self.next_bytes
        );
        self.next_bytes -= n;
        if self.next_bytes == 0 {
            self.reset();
        }
    }

    fn enter_payload(&mut self) -> Result<(), WireError> {
        if self.length > self.max_frame_size {
            let len = self.length;
            self.reset();
            return Err(WireError::Size(len));
        }
        // An empty frame owes no payload; go straight back to head decode.
        if self.length == 0 {
            self.reset();
            return Ok(());
        }
        self.next_bytes = self.length;
        self.stage = Stage::Payload;
        Ok(())
    }
}

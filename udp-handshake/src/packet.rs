//! Wire-format definitions for handshake packets.
//!
//! Every datagram exchanged between client and server is a [`Packet`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission,
//!   stamping the integrity checksum on the way out.
//! - Splitting a raw byte slice back into a [`Packet`].  Decoding carries the
//!   received checksum verbatim; [`Packet::verify_checksum`] decides whether
//!   the rest of the fields can be trusted.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Flags             |            Checksum           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 12 bytes.  The payload length is
//! implied by the datagram length.

use std::fmt;

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Connection-establishment request.
    pub const SYN: u16 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u16 = 0b0000_0010;
    /// Sender has no more data to send.
    pub const FIN: u16 = 0b0000_0100;
    /// Negative acknowledgement / protocol error.
    pub const ERR: u16 = 0b0000_1000;

    /// `ACK|ERR`: "your packet was rejected, resend it".
    pub const NACK: u16 = ACK | ERR;

    /// `true` when every bit of `mask` is set in `value`.
    #[inline]
    pub fn has(value: u16, mask: u16) -> bool {
        value & mask == mask
    }

    /// Render a flag set as `SYN|ACK`, or `DATA` when empty.
    pub fn describe(value: u16) -> String {
        let names: Vec<&str> = [(SYN, "SYN"), (ACK, "ACK"), (FIN, "FIN"), (ERR, "ERR")]
            .iter()
            .filter(|(bit, _)| value & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            "DATA".to_owned()
        } else {
            names.join("|")
        }
    }
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 12;

/// Largest datagram either side will read in one receive call.
pub const MAX_DATAGRAM: usize = 1024;

/// Largest payload that still fits in [`MAX_DATAGRAM`].
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_CHECKSUM: usize = 10;

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Packet::encode`] converts to big-endian
/// on the wire and [`Packet::decode`] converts back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Position of this packet in the sender's stream.
    pub seq: u32,
    /// Next sequence number expected from the peer.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u16,
    /// CRC-32 over `header(checksum = 0) || payload`, low 16 bits.
    ///
    /// Ignored by [`Packet::encode`], which always recomputes it.
    /// Carried verbatim by [`Packet::decode`].
    pub checksum: u16,
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with the checksum left at zero.
    pub fn new(seq: u32, ack: u32, flags: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags,
                checksum: 0,
            },
            payload: payload.into(),
        }
    }

    /// `true` when every bit of `mask` is set.
    pub fn has_flags(&self, mask: u16) -> bool {
        flags::has(self.header.flags, mask)
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The checksum is computed over the logical fields and written into
    /// both the returned bytes and `self.header.checksum`.
    pub fn encode(&mut self) -> Result<Vec<u8>, PacketError> {
        self.header.checksum = self.compute_checksum();
        self.to_wire()
    }

    /// Serialise with whatever checksum `self.header.checksum` currently
    /// holds, without recomputing it.
    pub fn to_wire(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge {
                len: self.payload.len(),
            });
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        write_header(&mut buf, &self.header, self.header.checksum);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Split a raw datagram into header fields and payload.
    ///
    /// Returns [`PacketError::TooShort`] if `buf` is shorter than
    /// [`HEADER_LEN`].  The checksum is **not** verified here.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort { len: buf.len() });
        }

        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let flags = read_u16(buf, OFF_FLAGS);
        let checksum = read_u16(buf, OFF_CHECKSUM);

        Ok(Packet {
            header: Header {
                seq,
                ack,
                flags,
                checksum,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }

    /// Masked CRC-32 over the header (checksum zeroed) followed by the payload.
    pub fn compute_checksum(&self) -> u16 {
        let mut header = Vec::with_capacity(HEADER_LEN);
        write_header(&mut header, &self.header, 0);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(&self.payload);
        (hasher.finalize() & 0xffff) as u16
    }

    /// `true` when the carried checksum matches the recomputed one.
    ///
    /// A packet that fails this check must not be trusted for any other field.
    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum() == self.header.checksum
    }

    /// Payload as lossy UTF-8, for logs and confirmation messages.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[seq={} ack={} flags={} checksum={:#06x} len={}]",
            self.header.seq,
            self.header.ack,
            flags::describe(self.header.flags),
            self.header.checksum,
            self.payload.len()
        )
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn write_header(buf: &mut Vec<u8>, header: &Header, checksum: u16) {
    buf.extend_from_slice(&header.seq.to_be_bytes());
    buf.extend_from_slice(&header.ack.to_be_bytes());
    buf.extend_from_slice(&header.flags.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
}

/// Errors that can arise when framing a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("datagram of {len} bytes is shorter than the 12-byte header")]
    TooShort { len: usize },
    /// Payload would push the datagram past [`MAX_DATAGRAM`].
    #[error("payload of {len} bytes exceeds the 1012-byte limit")]
    PayloadTooLarge { len: usize },
}

//! Envelope encoding and decoding.
//!
//! Every inner packet crosses the wire wrapped in a 20-byte IPv4-style outer
//! header. All multi-byte fields are big-endian (network byte order).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |      TOS      |         Total Length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Identification         |Flags|    Fragment Offset      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      TTL      |   Protocol    |        Header Checksum        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Source Address                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Destination Address                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding is permissive: it strips the header block without looking at it.
//! [`validate`] is the strict check, kept separate so the relay can report
//! suspicious envelopes without refusing them.

use crate::error::CodecError;
use crate::{OUTER_HEADER_LEN, OUTER_TTL, PROTOCOL_IPV6_ENCAP, PROTOCOL_TCP, TCP_HEADER_LEN};
use std::net::Ipv4Addr;

/// Version 4, IHL 5
const VERSION_IHL: u8 = 0x45;

/// Identification placeholder stamped on every envelope
const IDENTIFICATION: u16 = 0;

/// Offset of the checksum field
const CHECKSUM_OFFSET: usize = 10;

/// Synthetic TCP flags: PSH | ACK
const TCP_FLAGS_PSH_ACK: u8 = 0x18;

/// Synthetic TCP data offset: 5 words, no options
const TCP_DATA_OFFSET: u8 = 0x50;

/// Internet checksum (RFC 1071) of `bytes`.
///
/// Sums big-endian 16-bit words with end-around carry, padding an odd
/// trailing byte with zero, and returns the one's complement. Over a header
/// that already carries a correct checksum the result is `0`.
#[must_use]
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Zero-copy view of an outer header
#[derive(Debug, Clone, Copy)]
pub struct OuterHeader<'a> {
    raw: &'a [u8],
}

impl<'a> OuterHeader<'a> {
    /// View the first 20 bytes of `bytes` as an outer header.
    ///
    /// No field is checked; see [`validate`] for that.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedEnvelope`] if fewer than 20 bytes are given.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CodecError> {
        if bytes.len() < OUTER_HEADER_LEN {
            return Err(CodecError::MalformedEnvelope {
                expected: OUTER_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            raw: &bytes[..OUTER_HEADER_LEN],
        })
    }

    /// Version nibble
    pub fn version(&self) -> u8 {
        self.raw[0] >> 4
    }

    /// Header length in 32-bit words
    pub fn ihl(&self) -> u8 {
        self.raw[0] & 0x0F
    }

    /// Type of service
    pub fn tos(&self) -> u8 {
        self.raw[1]
    }

    /// Total length field
    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.raw[2], self.raw[3]])
    }

    /// Identification field
    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.raw[4], self.raw[5]])
    }

    /// Flags and fragment offset, as stored
    pub fn flags_fragment(&self) -> u16 {
        u16::from_be_bytes([self.raw[6], self.raw[7]])
    }

    /// Time to live
    pub fn ttl(&self) -> u8 {
        self.raw[8]
    }

    /// Protocol byte
    pub fn protocol(&self) -> u8 {
        self.raw[9]
    }

    /// Stored header checksum
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.raw[CHECKSUM_OFFSET], self.raw[CHECKSUM_OFFSET + 1]])
    }

    /// Source address
    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.raw[12], self.raw[13], self.raw[14], self.raw[15])
    }

    /// Destination address
    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.raw[16], self.raw[17], self.raw[18], self.raw[19])
    }

    /// Checksum recomputed over the header with the checksum field zeroed
    pub fn computed_checksum(&self) -> u16 {
        let mut header = [0u8; OUTER_HEADER_LEN];
        header.copy_from_slice(self.raw);
        header[CHECKSUM_OFFSET] = 0;
        header[CHECKSUM_OFFSET + 1] = 0;
        internet_checksum(&header)
    }

    /// Whether the stored checksum matches the header contents
    pub fn checksum_valid(&self) -> bool {
        internet_checksum(self.raw) == 0
    }

    /// Raw 20 header bytes
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}

/// Envelope layout on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeVariant {
    /// Outer header (protocol 41) followed directly by the inner packet
    #[default]
    Plain,
    /// Outer header (protocol 6) and a synthetic TCP header before the inner packet
    TcpMimic {
        /// Source port in the synthetic TCP header
        src_port: u16,
        /// Destination port in the synthetic TCP header
        dst_port: u16,
    },
}

impl EnvelopeVariant {
    /// Bytes preceding the inner packet
    pub fn header_len(&self) -> usize {
        match self {
            EnvelopeVariant::Plain => OUTER_HEADER_LEN,
            EnvelopeVariant::TcpMimic { .. } => OUTER_HEADER_LEN + TCP_HEADER_LEN,
        }
    }

    /// Largest inner packet this variant can carry
    pub fn max_inner(&self) -> usize {
        u16::MAX as usize - self.header_len()
    }

    /// Protocol byte stamped in the outer header
    pub fn protocol(&self) -> u8 {
        match self {
            EnvelopeVariant::Plain => PROTOCOL_IPV6_ENCAP,
            EnvelopeVariant::TcpMimic { .. } => PROTOCOL_TCP,
        }
    }

    /// Short name for logs and configuration
    pub fn name(&self) -> &'static str {
        match self {
            EnvelopeVariant::Plain => "plain",
            EnvelopeVariant::TcpMimic { .. } => "tcp-mimic",
        }
    }
}

/// Encoder/decoder for one envelope variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeCodec {
    variant: EnvelopeVariant,
}

impl EnvelopeCodec {
    /// Codec for `variant`
    pub fn new(variant: EnvelopeVariant) -> Self {
        Self { variant }
    }

    /// Codec for the plain protocol-41 envelope
    pub fn plain() -> Self {
        Self::default()
    }

    /// Variant this codec produces and expects
    pub fn variant(&self) -> EnvelopeVariant {
        self.variant
    }

    /// Wrap `inner` in a new envelope addressed from `src` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadTooLarge`] if `inner` exceeds the
    /// variant's maximum.
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr, inner: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(self.variant.header_len() + inner.len());
        self.encode_into(src, dst, inner, &mut out)?;
        Ok(out)
    }

    /// Like [`EnvelopeCodec::encode`], writing into a reusable buffer.
    ///
    /// `out` is cleared first. On error it is left empty.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadTooLarge`] if `inner` exceeds the
    /// variant's maximum.
    pub fn encode_into(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        inner: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        out.clear();
        let max = self.variant.max_inner();
        if inner.len() > max {
            return Err(CodecError::PayloadTooLarge {
                max,
                actual: inner.len(),
            });
        }

        let total_length = (self.variant.header_len() + inner.len()) as u16;

        out.reserve(total_length as usize);
        out.push(VERSION_IHL);
        out.push(0); // TOS
        out.extend_from_slice(&total_length.to_be_bytes());
        out.extend_from_slice(&IDENTIFICATION.to_be_bytes());
        out.extend_from_slice(&[0, 0]); // flags / fragment offset
        out.push(OUTER_TTL);
        out.push(self.variant.protocol());
        out.extend_from_slice(&[0, 0]); // checksum placeholder
        out.extend_from_slice(&src.octets());
        out.extend_from_slice(&dst.octets());

        let checksum = internet_checksum(&out[..OUTER_HEADER_LEN]);
        out[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());

        if let EnvelopeVariant::TcpMimic { src_port, dst_port } = self.variant {
            out.extend_from_slice(&src_port.to_be_bytes());
            out.extend_from_slice(&dst_port.to_be_bytes());
            out.extend_from_slice(&[0; 4]); // sequence
            out.extend_from_slice(&[0; 4]); // acknowledgment
            out.push(TCP_DATA_OFFSET);
            out.push(TCP_FLAGS_PSH_ACK);
            out.extend_from_slice(&u16::MAX.to_be_bytes()); // window
            out.extend_from_slice(&[0; 4]); // checksum, urgent pointer
        }

        out.extend_from_slice(inner);
        Ok(())
    }

    /// Strip the header block and return the inner packet.
    ///
    /// The header is not inspected.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedEnvelope`] if `bytes` is shorter than
    /// the header block.
    pub fn decode<'b>(&self, bytes: &'b [u8]) -> Result<&'b [u8], CodecError> {
        let header_len = self.variant.header_len();
        if bytes.len() < header_len {
            return Err(CodecError::MalformedEnvelope {
                expected: header_len,
                actual: bytes.len(),
            });
        }
        Ok(&bytes[header_len..])
    }

    /// Strictly check an envelope and return its parsed outer header.
    ///
    /// Checks version, IHL, protocol for this variant, checksum, and that the
    /// total length matches `bytes.len()`.
    ///
    /// # Errors
    ///
    /// Returns the first [`CodecError`] found.
    pub fn validate<'b>(&self, bytes: &'b [u8]) -> Result<OuterHeader<'b>, CodecError> {
        let header_len = self.variant.header_len();
        if bytes.len() < header_len {
            return Err(CodecError::MalformedEnvelope {
                expected: header_len,
                actual: bytes.len(),
            });
        }

        let header = OuterHeader::parse(bytes)?;
        if header.version() != 4 {
            return Err(CodecError::InvalidVersion(header.version()));
        }
        if header.ihl() != 5 {
            return Err(CodecError::InvalidHeaderLength(header.ihl()));
        }
        if header.protocol() != self.variant.protocol() {
            return Err(CodecError::ProtocolMismatch {
                expected: self.variant.protocol(),
                actual: header.protocol(),
            });
        }
        if !header.checksum_valid() {
            return Err(CodecError::ChecksumMismatch {
                stored: header.checksum(),
                computed: header.computed_checksum(),
            });
        }
        if header.total_length() as usize != bytes.len() {
            return Err(CodecError::LengthMismatch {
                header: header.total_length() as usize,
                actual: bytes.len(),
            });
        }
        Ok(header)
    }
}

/// Encode with the plain envelope.
///
/// # Errors
///
/// Returns [`CodecError::PayloadTooLarge`] for inner packets over 65515 bytes.
pub fn encode(src: Ipv4Addr, dst: Ipv4Addr, inner: &[u8]) -> Result<Vec<u8>, CodecError> {
    EnvelopeCodec::plain().encode(src, dst, inner)
}

/// Decode a plain envelope.
///
/// # Errors
///
/// Returns [`CodecError::MalformedEnvelope`] for inputs under 20 bytes.
pub fn decode(bytes: &[u8]) -> Result<&[u8], CodecError> {
    EnvelopeCodec::plain().decode(bytes)
}

/// Strictly validate a plain envelope.
///
/// # Errors
///
/// Returns the first [`CodecError`] found.
pub fn validate(bytes: &[u8]) -> Result<OuterHeader<'_>, CodecError> {
    EnvelopeCodec::plain().validate(bytes)
}

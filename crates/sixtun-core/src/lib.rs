//! # SIXTUN Core
//!
//! Userspace IPv6-in-IPv4 tunnel relay.
//!
//! This crate provides:
//! - The envelope codec (20-byte IPv4-style outer header around an opaque payload)
//! - Diagnostic packet classification
//! - Tunnel session configuration
//! - The relay engine that moves packets between a TUN device and a remote peer
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐   tun_to_net    ┌────────┐  encode   ┌──────────┐
//!  TUN ────▶ │  tun_reader  │ ──────────────▶ │ Writer │ ────────▶ │  peer    │
//!            └──────────────┘                 └────────┘           │  socket  │
//!            ┌──────────────┐   net_to_tun    ┌────────┐  decode   │          │
//!  TUN ◀──── │  tun_writer  │ ◀────────────── │ Reader │ ◀──────── │          │
//!            └──────────────┘                 └────────┘           └──────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod envelope;
pub mod error;
pub mod relay;
pub mod session;

pub use classify::{IpVersion, classify_protocol, classify_version, identify_tunnel_packet};
pub use envelope::{
    EnvelopeCodec, EnvelopeVariant, OuterHeader, decode, encode, internet_checksum, validate,
};
pub use error::{CodecError, RelayError, Result};
pub use relay::{RelayEngine, RelayStats, TaskHealth};
pub use session::{DatagramPayload, Protocol, TunnelSession};

/// Outer header size in bytes
pub const OUTER_HEADER_LEN: usize = sixtun_transport::framing::OUTER_HEADER_LEN;

/// Synthetic TCP header size used by the TCP-mimic envelope
pub const TCP_HEADER_LEN: usize = 20;

/// IP protocol number for IPv6 encapsulation
pub const PROTOCOL_IPV6_ENCAP: u8 = 0x29;

/// IP protocol number for TCP
pub const PROTOCOL_TCP: u8 = 0x06;

/// TTL stamped on every outer header
pub const OUTER_TTL: u8 = 64;

/// Largest inner payload a plain envelope can carry (65535 - 20)
pub const MAX_INNER_LEN: usize = u16::MAX as usize - OUTER_HEADER_LEN;

/// Default per-read buffer size for device and socket reads
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default tunnel port
pub const DEFAULT_PORT: u16 = 4000;

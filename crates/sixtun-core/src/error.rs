//! Error types for the tunnel relay.
//!
//! Errors are split by where they can be handled:
//!
//! - [`CodecError`]: one envelope is unusable. The relay drops it and moves on.
//! - [`RelayError`]: something broke at the engine or connection level. Only
//!   [`RelayError::BindFailure`] is fatal to the engine; every other variant
//!   stays local to the task or connection that produced it.

use sixtun_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

/// Envelope encoding and validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input shorter than the envelope header block
    #[error("malformed envelope: expected at least {expected} bytes, got {actual}")]
    MalformedEnvelope {
        /// Minimum size for the envelope variant
        expected: usize,
        /// Actual input size
        actual: usize,
    },

    /// Inner payload does not fit the 16-bit total length
    #[error("payload too large: {actual} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Maximum inner length for the envelope variant
        max: usize,
        /// Offending payload length
        actual: usize,
    },

    /// Version nibble is not 4
    #[error("invalid outer version: {0}")]
    InvalidVersion(u8),

    /// IHL nibble is not 5
    #[error("invalid outer header length: {0} words")]
    InvalidHeaderLength(u8),

    /// Protocol byte does not match the envelope variant
    #[error("protocol mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    ProtocolMismatch {
        /// Protocol the variant stamps
        expected: u8,
        /// Protocol found in the header
        actual: u8,
    },

    /// Header checksum does not verify
    #[error("checksum mismatch: header carries 0x{stored:04x}, computed 0x{computed:04x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        stored: u16,
        /// Checksum recomputed with the field zeroed
        computed: u16,
    },

    /// Total length field disagrees with the buffer
    #[error("length mismatch: header says {header} bytes, buffer has {actual}")]
    LengthMismatch {
        /// Value of the total length field
        header: usize,
        /// Actual buffer size
        actual: usize,
    },
}

/// Relay engine errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        /// Listen address
        addr: SocketAddr,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// Outbound connection to the peer could not be established
    #[error("failed to reach peer {addr}: {source}")]
    DialFailure {
        /// Peer address
        addr: SocketAddr,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// Device read or write failed
    #[error("interface {interface} I/O failed: {source}")]
    InterfaceIoFailure {
        /// Interface name
        interface: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Peer closed the connection in an orderly way
    #[error("connection to {0} closed")]
    ConnectionClosed(SocketAddr),

    /// Envelope could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport-level failure on an established connection
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session configuration rejected
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// `run` was called on an engine that is already running or has run
    #[error("relay engine already started")]
    AlreadyRunning,

    /// Engine is shutting down
    #[error("relay cancelled")]
    Cancelled,
}

impl RelayError {
    /// Returns true if retrying the operation later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::DialFailure { .. } | RelayError::ConnectionClosed(_) => true,
            RelayError::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the engine cannot continue
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::BindFailure { .. } | RelayError::InvalidSession(_)
        )
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

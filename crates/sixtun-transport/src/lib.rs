//! # SIXTUN Transport
//!
//! Transport plumbing for the SIXTUN tunnel broker.
//!
//! This crate provides:
//! - Async FIFO packet queues with explicit saturation policies
//! - A registry of outbound peer connections with serialized dialing
//! - Record framing for stream transports
//! - The TUN device boundary (raw descriptor and in-memory implementations)
//! - Dual-stack socket setup and dial backoff

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod device;
pub mod framing;
pub mod queue;
pub mod registry;
pub mod socket;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use device::{ChannelDevice, DeviceHandle, FdDevice, TunDevice};
#[cfg(target_os = "linux")]
pub use device::NamedDevice;
pub use framing::Framing;
pub use queue::{OverflowPolicy, PacketQueue, QueueCapacity};
pub use registry::{
    ConnectionRegistry, ConnectionRole, ConnectionState, Dialer, PeerConnection, TcpDialer,
};
pub use transport::{StatsRecorder, TransportError, TransportResult, TransportStats};

/// Largest record the stream and datagram paths will accept (max IPv4 total length)
pub const MAX_RECORD_SIZE: usize = 65_535;

//! Tunnel session configuration.

use crate::envelope::{EnvelopeCodec, EnvelopeVariant};
use crate::error::{RelayError, Result};
use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_PORT, OUTER_HEADER_LEN};
use sixtun_transport::{BackoffConfig, Framing, QueueCapacity};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Transport carrying the envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Stream transport with explicit record framing
    #[default]
    Tcp,
    /// One envelope per datagram
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{other}' (expected tcp or udp)")),
        }
    }
}

/// How an inbound UDP datagram is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatagramPayload {
    /// The datagram is already an inner packet and goes to the device as-is
    #[default]
    Inner,
    /// The datagram is one envelope; it is decoded and malformed ones are dropped
    Envelope,
}

impl fmt::Display for DatagramPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DatagramPayload::Inner => "inner",
            DatagramPayload::Envelope => "envelope",
        })
    }
}

impl FromStr for DatagramPayload {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inner" => Ok(DatagramPayload::Inner),
            "envelope" => Ok(DatagramPayload::Envelope),
            other => Err(format!(
                "unknown datagram payload '{other}' (expected inner or envelope)"
            )),
        }
    }
}

/// Everything the relay engine needs to know about one tunnel.
///
/// Immutable once the engine starts.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    /// Our IPv4 endpoint address (outer source)
    pub local_addr: Ipv4Addr,

    /// Remote IPv4 endpoint address (outer destination, dial target)
    pub peer_addr: Ipv4Addr,

    /// Port we listen on
    pub local_port: u16,

    /// Port the peer listens on
    pub peer_port: u16,

    /// Envelope transport
    pub protocol: Protocol,

    /// Address to bind the listener on; the IPv6 wildcard binds dual-stack
    pub listen_addr: IpAddr,

    /// Record delimiting on stream connections
    pub framing: Framing,

    /// Envelope layout
    pub variant: EnvelopeVariant,

    /// Interpretation of inbound UDP datagrams; outbound datagrams are always envelopes
    pub udp_inbound: DatagramPayload,

    /// Capacity policy for both direction queues
    pub queue_capacity: QueueCapacity,

    /// Deadline for establishing the outbound connection
    pub connect_timeout: Duration,

    /// Deadline for sending one envelope
    pub send_timeout: Duration,

    /// Idle limit on peer connections (`None` waits indefinitely)
    pub receive_timeout: Option<Duration>,

    /// Outbound redial schedule
    pub backoff: BackoffConfig,

    /// Per-read buffer size for the device
    pub buffer_size: usize,
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self {
            local_addr: Ipv4Addr::UNSPECIFIED,
            peer_addr: Ipv4Addr::LOCALHOST,
            local_port: DEFAULT_PORT,
            peer_port: DEFAULT_PORT,
            protocol: Protocol::Tcp,
            listen_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            framing: Framing::default(),
            variant: EnvelopeVariant::default(),
            udp_inbound: DatagramPayload::default(),
            queue_capacity: QueueCapacity::default(),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            receive_timeout: None,
            backoff: BackoffConfig::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TunnelSession {
    /// Session between two endpoints with default tuning
    pub fn new(
        local_addr: Ipv4Addr,
        peer_addr: Ipv4Addr,
        local_port: u16,
        peer_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            local_addr,
            peer_addr,
            local_port,
            peer_port,
            protocol,
            ..Self::default()
        }
    }

    /// Address the listener binds
    pub fn listen_socket(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.local_port)
    }

    /// Address the outbound path reaches the peer at
    pub fn peer_socket(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.peer_addr), self.peer_port)
    }

    /// Codec for this session's envelope variant
    pub fn codec(&self) -> EnvelopeCodec {
        EnvelopeCodec::new(self.variant)
    }

    /// Largest record a peer connection will accept
    pub fn max_record_len(&self) -> usize {
        sixtun_transport::MAX_RECORD_SIZE
    }

    /// Reject configurations the engine cannot run.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidSession`] naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.peer_port == 0 {
            return Err(RelayError::InvalidSession("peer port must not be 0".into()));
        }
        if self.peer_addr.is_unspecified() {
            return Err(RelayError::InvalidSession(
                "peer address must not be 0.0.0.0".into(),
            ));
        }
        if self.buffer_size < OUTER_HEADER_LEN {
            return Err(RelayError::InvalidSession(format!(
                "buffer size {} is smaller than the outer header",
                self.buffer_size
            )));
        }
        if self.connect_timeout.is_zero() || self.send_timeout.is_zero() {
            return Err(RelayError::InvalidSession(
                "connect and send timeouts must be non-zero".into(),
            ));
        }
        if self.receive_timeout.is_some_and(|t| t.is_zero()) {
            return Err(RelayError::InvalidSession(
                "receive timeout must be non-zero when set".into(),
            ));
        }
        if let QueueCapacity::Bounded { capacity: 0, .. } = self.queue_capacity {
            return Err(RelayError::InvalidSession(
                "bounded queue capacity must be greater than 0".into(),
            ));
        }
        if self.protocol == Protocol::Udp && self.framing != Framing::default() {
            tracing::debug!(framing = %self.framing, "Framing is ignored for UDP sessions");
        }
        Ok(())
    }
}

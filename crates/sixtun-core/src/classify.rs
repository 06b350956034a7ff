//! Diagnostic packet classification.
//!
//! These helpers only produce labels for logs and the `classify` command.
//! Nothing in the relay branches on their output.

use crate::{OUTER_HEADER_LEN, PROTOCOL_IPV6_ENCAP};
use std::borrow::Cow;
use std::fmt;

/// IP version as read from the top nibble of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// Version 4
    V4,
    /// Version 6
    V6,
    /// Any other nibble, or empty input
    Unknown,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IpVersion::V4 => "IPv4",
            IpVersion::V6 => "IPv6",
            IpVersion::Unknown => "Unknown",
        })
    }
}

/// Classify `bytes` by IP version
#[must_use]
pub fn classify_version(bytes: &[u8]) -> IpVersion {
    match bytes.first().map(|b| b >> 4) {
        Some(4) => IpVersion::V4,
        Some(6) => IpVersion::V6,
        _ => IpVersion::Unknown,
    }
}

/// Name for an IP protocol number
#[must_use]
pub fn protocol_name(protocol: u8) -> Cow<'static, str> {
    match protocol {
        0x01 => Cow::Borrowed("ICMP"),
        0x02 => Cow::Borrowed("IGMP"),
        0x06 => Cow::Borrowed("TCP"),
        0x11 => Cow::Borrowed("UDP"),
        PROTOCOL_IPV6_ENCAP => Cow::Borrowed("ENCAP"),
        0x59 => Cow::Borrowed("OSPF"),
        0x84 => Cow::Borrowed("SCTP"),
        other => Cow::Owned(format!("Unknown protocol (0x{other:02x})")),
    }
}

/// Name of the protocol carried by an IPv4 header
#[must_use]
pub fn classify_protocol(bytes: &[u8]) -> Cow<'static, str> {
    if bytes.len() < OUTER_HEADER_LEN {
        return Cow::Borrowed("Invalid IPv4 packet");
    }
    protocol_name(bytes[9])
}

/// Describe whether `bytes` is a tunnel envelope.
///
/// Envelopes report the version of the packet they carry; anything else
/// reports its outer protocol.
#[must_use]
pub fn identify_tunnel_packet(bytes: &[u8]) -> String {
    if bytes.len() < OUTER_HEADER_LEN {
        return classify_protocol(bytes).into_owned();
    }
    if bytes[9] == PROTOCOL_IPV6_ENCAP {
        let inner = classify_version(&bytes[OUTER_HEADER_LEN..]);
        return format!("Tunnel IPv4 -> {inner}");
    }
    format!("Non-tunnelled {}", classify_protocol(bytes))
}

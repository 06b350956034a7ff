//! Relay traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Packets read from the device
    pub packets_from_tun: u64,
    /// Packets written to the device
    pub packets_to_tun: u64,
    /// Packets from the configured peer's own connection, written straight to the device
    pub peer_return_packets: u64,
    /// Device writes that failed
    pub device_write_failures: u64,
    /// Envelopes sent to the peer
    pub envelopes_sent: u64,
    /// Envelope bytes sent to the peer
    pub bytes_sent: u64,
    /// Envelopes received from any peer connection or datagram
    pub envelopes_received: u64,
    /// Envelope bytes received
    pub bytes_received: u64,
    /// Envelopes dropped because they were too short to decode
    pub malformed_dropped: u64,
    /// Envelopes forwarded despite failing strict validation
    pub validation_warnings: u64,
    /// Packets dropped because they could not be encoded
    pub encode_errors: u64,
    /// Envelope sends that failed
    pub send_failures: u64,
    /// Outbound dials that produced a connection
    pub dials: u64,
    /// Outbound dial attempts that failed
    pub dial_failures: u64,
    /// Inbound connections accepted
    pub connections_accepted: u64,
    /// Packets waiting in the device-to-network queue
    pub tun_to_net_depth: usize,
    /// Packets waiting in the network-to-device queue
    pub net_to_tun_depth: usize,
    /// Packets evicted by a drop-oldest queue policy
    pub queue_dropped: u64,
}

/// Atomic counters behind [`RelayStats`]
#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    packets_from_tun: AtomicU64,
    packets_to_tun: AtomicU64,
    peer_return_packets: AtomicU64,
    device_write_failures: AtomicU64,
    envelopes_sent: AtomicU64,
    bytes_sent: AtomicU64,
    envelopes_received: AtomicU64,
    bytes_received: AtomicU64,
    malformed_dropped: AtomicU64,
    validation_warnings: AtomicU64,
    encode_errors: AtomicU64,
    send_failures: AtomicU64,
    dial_failures: AtomicU64,
    connections_accepted: AtomicU64,
}

macro_rules! counter {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl RelayCounters {
    counter! {
        tun_read => packets_from_tun,
        tun_written => packets_to_tun,
        peer_return => peer_return_packets,
        device_write_failure => device_write_failures,
        malformed => malformed_dropped,
        validation_warning => validation_warnings,
        encode_error => encode_errors,
        send_failure => send_failures,
        dial_failure => dial_failures,
        accepted => connections_accepted,
    }

    pub(crate) fn sent(&self, bytes: usize) {
        self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn received(&self, bytes: usize) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counter values; queue and dial fields are left for the caller to fill in
    pub(crate) fn snapshot(&self) -> RelayStats {
        RelayStats {
            packets_from_tun: self.packets_from_tun.load(Ordering::Relaxed),
            packets_to_tun: self.packets_to_tun.load(Ordering::Relaxed),
            peer_return_packets: self.peer_return_packets.load(Ordering::Relaxed),
            device_write_failures: self.device_write_failures.load(Ordering::Relaxed),
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            validation_warnings: self.validation_warnings.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            ..RelayStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = RelayCounters::default();
        counters.tun_read();
        counters.tun_read();
        counters.sent(36);
        counters.received(56);
        counters.malformed();
        counters.dial_failure();
        counters.device_write_failure();

        let stats = counters.snapshot();
        assert_eq!(stats.packets_from_tun, 2);
        assert_eq!(stats.envelopes_sent, 1);
        assert_eq!(stats.bytes_sent, 36);
        assert_eq!(stats.envelopes_received, 1);
        assert_eq!(stats.bytes_received, 56);
        assert_eq!(stats.malformed_dropped, 1);
        assert_eq!(stats.dial_failures, 1);
        assert_eq!(stats.packets_to_tun, 0);
        assert_eq!(stats.device_write_failures, 1);
        assert_eq!(stats.peer_return_packets, 0);
    }
}

//! Transport error taxonomy and traffic counters.
//!
//! Every socket-facing component in this crate reports failures through
//! [`TransportError`] and accounts traffic through a [`StatsRecorder`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket or device
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection or transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Listening socket could not be bound
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        /// Address we tried to bind
        addr: SocketAddr,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Outbound connection could not be established
    #[error("Failed to dial {addr}: {reason}")]
    DialFailed {
        /// Peer address
        addr: SocketAddr,
        /// Human-readable cause
        reason: String,
    },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Which operation timed out
        operation: &'static str,
        /// Configured deadline
        after: Duration,
    },

    /// Queue was closed while an operation was pending
    #[error("Queue is closed")]
    QueueClosed,
}

impl TransportError {
    /// Returns true if retrying the operation later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::DialFailed { .. } | TransportError::Timeout { .. } | TransportError::Io(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Snapshot of transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

/// Lock-free counters shared between the tasks driving one socket.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsRecorder {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

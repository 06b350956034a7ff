//! Peer connections and the registry that deduplicates outbound dials.
//!
//! The registry maps `(address, port)` to at most one live [`PeerConnection`].
//! Every `acquire`/`release` runs under a single async mutex, so two tasks
//! racing to reach the same peer produce one dial, and the loser receives the
//! winner's connection.

use crate::framing::Framing;
use crate::transport::{StatsRecorder, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// Any bidirectional byte stream a peer connection can run over
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased peer stream
pub type BoxedStream = Box<dyn PeerStream>;

/// Opens outbound streams to peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establish a stream to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DialFailed`] or [`TransportError::Timeout`].
    async fn dial(&self, addr: SocketAddr) -> TransportResult<BoxedStream>;
}

/// TCP dialer with a connect deadline. Dialed streams have `TCP_NODELAY` set.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer that gives up after `connect_timeout`
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> TransportResult<BoxedStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                after: self.connect_timeout,
            })?
            .map_err(|e| TransportError::DialFailed {
                addr,
                reason: e.to_string(),
            })?;

        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Dial in progress
    Connecting = 0,
    /// Usable for I/O
    Active = 1,
    /// Closed after EOF, I/O error or release
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }
}

/// Which direction of the tunnel a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Drains the outbound queue and sends envelopes
    Writer,
    /// Receives envelopes and hands their payload inward
    Reader,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One live stream to or from the remote tunnel endpoint.
///
/// The stream is split so one reader and one writer can make progress
/// concurrently; each half is guarded by its own lock.
pub struct PeerConnection {
    id: u64,
    remote: SocketAddr,
    role: ConnectionRole,
    state: AtomicU8,
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    stats: StatsRecorder,
}

impl PeerConnection {
    /// Wrap an established stream. The connection starts [`ConnectionState::Active`].
    pub fn new(stream: BoxedStream, remote: SocketAddr, role: ConnectionRole) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            role,
            state: AtomicU8::new(ConnectionState::Active as u8),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            stats: StatsRecorder::new(),
        }
    }

    /// Process-unique connection identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote socket address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Direction role
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection can still carry traffic
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Traffic counters for this connection
    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    /// Send one framed record, bounded by `deadline`.
    ///
    /// Any failure marks the connection closed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection is no longer
    /// active, [`TransportError::Timeout`] or the underlying I/O error.
    pub async fn send_record(
        &self,
        framing: Framing,
        record: &[u8],
        deadline: Duration,
    ) -> TransportResult<()> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let result = match timeout(deadline, framing.write_record(&mut *writer, record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout {
                operation: "send",
                after: deadline,
            }),
        };

        match result {
            Ok(()) => {
                self.stats.record_send(record.len());
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                self.mark_closed();
                Err(e)
            }
        }
    }

    /// Receive one framed record into `buf`.
    ///
    /// Returns `Ok(None)` on orderly close by the peer, after which the
    /// connection is closed. A `deadline` of `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if nothing arrives within
    /// `deadline`, or the underlying I/O error. Both close the connection.
    pub async fn recv_record(
        &self,
        framing: Framing,
        buf: &mut Vec<u8>,
        max_len: usize,
        deadline: Option<Duration>,
    ) -> TransportResult<Option<usize>> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let read = framing.read_record(&mut *reader, buf, max_len);
        let result = match deadline {
            Some(deadline) => match timeout(deadline, read).await {
                Ok(r) => r.map_err(TransportError::Io),
                Err(_) => Err(TransportError::Timeout {
                    operation: "receive",
                    after: deadline,
                }),
            },
            None => read.await.map_err(TransportError::Io),
        };

        match result {
            Ok(Some(n)) => {
                self.stats.record_recv(n);
                Ok(Some(n))
            }
            Ok(None) => {
                self.mark_closed();
                Ok(None)
            }
            Err(e) => {
                self.stats.record_recv_error();
                self.mark_closed();
                Err(e)
            }
        }
    }

    /// Mark closed and shut down the write half
    pub async fn close(&self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(conn = self.id, remote = %self.remote, "Shutdown error ignored: {}", e);
        }
    }

    fn mark_closed(&self) {
        let prev = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if prev != ConnectionState::Closed as u8 {
            debug!(conn = self.id, remote = %self.remote, role = ?self.role, "Connection closed");
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of outbound peer connections keyed by `(address, port)`.
pub struct ConnectionRegistry {
    dialer: Arc<dyn Dialer>,
    connections: Mutex<HashMap<SocketAddr, Arc<PeerConnection>>>,
    dials: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry that dials through `dialer`
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connections: Mutex::new(HashMap::new()),
            dials: AtomicU64::new(0),
        }
    }

    /// Return the live connection for `addr`, dialing one if needed.
    ///
    /// The registry lock is held across the dial, so concurrent callers for
    /// the same key wait for the first dial instead of starting their own.
    /// A stored connection that has since closed is evicted and redialed.
    ///
    /// # Errors
    ///
    /// Propagates the dial failure; no entry is left behind.
    pub async fn acquire(&self, addr: SocketAddr) -> TransportResult<Arc<PeerConnection>> {
        let mut connections = self.connections.lock().await;

        if let Some(conn) = connections.get(&addr) {
            if conn.is_active() {
                return Ok(conn.clone());
            }
            debug!(remote = %addr, conn = conn.id(), "Evicting closed connection");
            connections.remove(&addr);
        }

        self.dials.fetch_add(1, Ordering::Relaxed);
        let stream = self.dialer.dial(addr).await?;
        let conn = Arc::new(PeerConnection::new(stream, addr, ConnectionRole::Writer));
        info!(remote = %addr, conn = conn.id(), "Outbound connection established");

        connections.insert(addr, conn.clone());
        Ok(conn)
    }

    /// Close and remove the connection for `addr`.
    ///
    /// Returns whether an entry existed.
    pub async fn release(&self, addr: SocketAddr) -> bool {
        let removed = self.connections.lock().await.remove(&addr);
        match removed {
            Some(conn) => {
                conn.close().await;
                debug!(remote = %addr, conn = conn.id(), "Connection released");
                true
            }
            None => false,
        }
    }

    /// Look up without dialing
    pub async fn get(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        self.connections.lock().await.get(&addr).cloned()
    }

    /// Close and remove every connection
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, conn) in drained {
            conn.close().await;
        }
    }

    /// Number of stored connections
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Whether no connection is stored
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Total dial attempts made through this registry
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }
}

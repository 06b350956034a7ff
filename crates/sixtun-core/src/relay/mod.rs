//! The tunnel relay engine.
//!
//! [`RelayEngine::bind`] claims the listening socket; [`RelayEngine::run`]
//! starts the relay tasks and supervises them until cancelled:
//!
//! | Task          | Moves                                                  |
//! |---------------|--------------------------------------------------------|
//! | `tun-reader`  | device → `tun_to_net`                                  |
//! | `tun-writer`  | `net_to_tun` → device                                  |
//! | `outbound`    | dials the peer, runs the single Writer (`tun_to_net` → peer) |
//! | `accept`      | accepts peer connections, spawns one Reader per connection |
//! | `udp-receiver`| datagrams → `net_to_tun`                               |
//! | `udp-writer`  | `tun_to_net` → datagrams                               |

mod interface;
mod outbound;
mod stats;
mod tasks;
mod tcp;
mod udp;

pub use stats::RelayStats;
pub use tasks::{TaskGroup, TaskHealth};

use crate::envelope::EnvelopeCodec;
use crate::error::{RelayError, Result};
use crate::session::{Protocol, TunnelSession};
use sixtun_transport::socket::{self, DEFAULT_BACKLOG};
use sixtun_transport::{
    ConnectionRegistry, Dialer, PacketQueue, TcpDialer, TransportStats, TunDevice,
};
use stats::RelayCounters;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// State shared by every relay task
pub(crate) struct RelayContext {
    pub(crate) session: TunnelSession,
    pub(crate) codec: EnvelopeCodec,
    pub(crate) device: Arc<dyn TunDevice>,
    /// Held for every device write; the queue drain and peer-return paths share it
    device_write: Mutex<()>,
    pub(crate) tun_to_net: PacketQueue<Vec<u8>>,
    pub(crate) net_to_tun: PacketQueue<Vec<u8>>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) counters: RelayCounters,
    /// Wakes the outbound supervisor out of its backoff sleep
    pub(crate) redial: Notify,
}

impl RelayContext {
    /// Write one packet to the device under the device write lock
    pub(crate) async fn write_to_device(&self, packet: &[u8]) -> Result<()> {
        let _guard = self.device_write.lock().await;
        if let Err(source) = self.device.write_packet(packet).await {
            self.counters.device_write_failure();
            return Err(RelayError::InterfaceIoFailure {
                interface: self.device.name().to_string(),
                source,
            });
        }
        self.counters.tun_written();
        Ok(())
    }

    /// Forward-but-report check applied to every received envelope
    pub(crate) fn check_envelope(&self, envelope: &[u8]) {
        if let Err(e) = self.codec.validate(envelope) {
            self.counters.validation_warning();
            tracing::debug!(
                error = %e,
                head = %hex::encode(&envelope[..envelope.len().min(crate::OUTER_HEADER_LEN)]),
                "Envelope failed validation, forwarding anyway"
            );
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// Relays packets between a TUN device and the remote tunnel endpoint
pub struct RelayEngine {
    ctx: Arc<RelayContext>,
    listener: Mutex<Option<Listener>>,
    local_addr: SocketAddr,
    group: TaskGroup,
}

impl RelayEngine {
    /// Bind the listener for `session` and prepare the relay.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidSession`] for unusable settings and
    /// [`RelayError::BindFailure`] if the listening socket cannot be bound.
    pub async fn bind(session: TunnelSession, device: Arc<dyn TunDevice>) -> Result<Self> {
        let dialer = Arc::new(TcpDialer::new(session.connect_timeout));
        Self::bind_with_dialer(session, device, dialer).await
    }

    /// Like [`RelayEngine::bind`], dialing the peer through `dialer`.
    ///
    /// # Errors
    ///
    /// Same as [`RelayEngine::bind`].
    pub async fn bind_with_dialer(
        session: TunnelSession,
        device: Arc<dyn TunDevice>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        session.validate()?;

        let addr = session.listen_socket();
        let bind_failure = |source| RelayError::BindFailure { addr, source };

        let (listener, local_addr) = match session.protocol {
            Protocol::Tcp => {
                let listener = socket::bind_tcp_listener(addr, DEFAULT_BACKLOG)
                    .await
                    .map_err(bind_failure)?;
                let local = listener.local_addr().map_err(|e| bind_failure(e.into()))?;
                (Listener::Tcp(listener), local)
            }
            Protocol::Udp => {
                let socket = socket::bind_udp(addr).await.map_err(bind_failure)?;
                let local = socket.local_addr().map_err(|e| bind_failure(e.into()))?;
                (Listener::Udp(Arc::new(socket)), local)
            }
        };

        info!(
            listen = %local_addr,
            peer = %session.peer_socket(),
            protocol = %session.protocol,
            framing = %session.framing,
            variant = session.variant.name(),
            interface = device.name(),
            "Relay bound"
        );

        let ctx = RelayContext {
            codec: session.codec(),
            device,
            device_write: Mutex::new(()),
            tun_to_net: PacketQueue::new("tun_to_net", session.queue_capacity),
            net_to_tun: PacketQueue::new("net_to_tun", session.queue_capacity),
            registry: ConnectionRegistry::new(dialer),
            counters: RelayCounters::default(),
            redial: Notify::new(),
            session,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            listener: Mutex::new(Some(listener)),
            local_addr,
            group: TaskGroup::new(CancellationToken::new()),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session this engine was bound with
    pub fn session(&self) -> &TunnelSession {
        &self.ctx.session
    }

    /// Current counters and queue depths
    pub fn stats(&self) -> RelayStats {
        let mut stats = self.ctx.counters.snapshot();
        stats.tun_to_net_depth = self.ctx.tun_to_net.len();
        stats.net_to_tun_depth = self.ctx.net_to_tun.len();
        stats.queue_dropped = self.ctx.tun_to_net.dropped() + self.ctx.net_to_tun.dropped();
        stats.dials = self.ctx.registry.dial_count();
        stats
    }

    /// Traffic on the current outbound connection, if one is established
    pub async fn outbound_stats(&self) -> Option<TransportStats> {
        let peer = self.ctx.session.peer_socket();
        self.ctx
            .registry
            .get(peer)
            .await
            .filter(|conn| conn.is_active())
            .map(|conn| conn.stats())
    }

    /// Health of every long-lived relay task and live connection task
    pub fn health(&self) -> Vec<(String, TaskHealth)> {
        self.group.health()
    }

    /// Run the relay until `cancel` fires.
    ///
    /// Returns once every task has been cancelled and joined. A task that
    /// fails on its own is recorded in [`RelayEngine::health`] while the
    /// others keep running.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyRunning`] if called more than once.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(RelayError::AlreadyRunning)?;

        let group = &self.group;
        let ctx = &self.ctx;

        group.spawn("tun-reader", interface::tun_reader(ctx.clone(), group.token()));
        group.spawn("tun-writer", interface::tun_writer(ctx.clone(), group.token()));

        match listener {
            Listener::Tcp(listener) => {
                group.spawn("outbound", outbound::supervise(ctx.clone(), group.token()));
                group.spawn("accept", tcp::accept_loop(ctx.clone(), listener, group.clone()));
            }
            Listener::Udp(socket) => {
                group.spawn(
                    "udp-receiver",
                    udp::receive_loop(ctx.clone(), socket.clone(), group.token()),
                );
                group.spawn("udp-writer", udp::writer_loop(ctx.clone(), socket, group.token()));
            }
        }

        info!(listen = %self.local_addr, "Relay running");

        let group_token = group.token();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = group_token.cancelled() => {}
        }

        info!("Relay shutting down");
        ctx.tun_to_net.close();
        ctx.net_to_tun.close();
        group.shutdown().await;
        ctx.registry.close_all().await;

        for (task, health) in group.health() {
            if let TaskHealth::Failed(reason) = health {
                warn!(task = %task, reason = %reason, "Task had failed before shutdown");
            }
        }
        info!("Relay stopped");
        Ok(())
    }
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("local_addr", &self.local_addr)
            .field("peer", &self.ctx.session.peer_socket())
            .field("protocol", &self.ctx.session.protocol)
            .finish()
    }
}

//! Inbound stream path: accept loop, role detection and Readers.

use super::{RelayContext, TaskGroup};
use crate::error::{RelayError, Result};
use sixtun_transport::socket::normalize_addr;
use sixtun_transport::{ConnectionRole, PeerConnection};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion) does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Where a Reader delivers decoded packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundRoute {
    /// Connection from an address other than the configured peer; packets go
    /// through `net_to_tun`
    Overlay,
    /// The configured peer's own connection back to us; packets are written
    /// straight to the device
    PeerReturn,
}

/// Decide the role of a connection accepted from `remote`
pub(crate) fn route_for(remote: SocketAddr, peer: IpAddr) -> InboundRoute {
    if normalize_addr(remote).ip() == peer {
        InboundRoute::PeerReturn
    } else {
        InboundRoute::Overlay
    }
}

/// Accept peer connections and spawn a Reader for each until cancelled.
pub(crate) async fn accept_loop(
    ctx: Arc<RelayContext>,
    listener: TcpListener,
    group: TaskGroup,
) -> Result<()> {
    let cancel = group.token();
    let peer_ip = IpAddr::V4(ctx.session.peer_addr);

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                continue;
            }
        };

        ctx.counters.accepted();
        // Every accept is a hint that the peer is up
        ctx.redial.notify_one();

        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "Could not set TCP_NODELAY");
        }

        let remote = normalize_addr(remote);
        let route = route_for(remote, peer_ip);
        let conn = Arc::new(PeerConnection::new(
            Box::new(stream),
            remote,
            ConnectionRole::Reader,
        ));
        info!(remote = %remote, conn = conn.id(), route = ?route, "Accepted peer connection");

        group.spawn_ephemeral(
            format!("reader-{}", conn.id()),
            read_loop(ctx.clone(), conn, route, cancel.clone()),
        );
    }
}

/// Receive envelopes from `conn` and deliver their payload per `route`.
pub(crate) async fn read_loop(
    ctx: Arc<RelayContext>,
    conn: Arc<PeerConnection>,
    route: InboundRoute,
    cancel: CancellationToken,
) -> Result<()> {
    let framing = ctx.session.framing;
    let max_len = ctx.session.max_record_len();
    let idle = ctx.session.receive_timeout;
    let mut buf = Vec::with_capacity(ctx.session.buffer_size);

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                conn.close().await;
                return Ok(());
            }
            received = conn.recv_record(framing, &mut buf, max_len, idle) => received,
        };

        match received {
            Ok(Some(n)) => {
                ctx.counters.received(n);
                trace!(conn = conn.id(), len = n, "Envelope received");
            }
            Ok(None) => {
                debug!(remote = %conn.remote(), conn = conn.id(), "Peer closed connection");
                return Err(RelayError::ConnectionClosed(conn.remote()));
            }
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        }

        ctx.check_envelope(&buf);
        let inner = match ctx.codec.decode(&buf) {
            Ok(inner) => inner,
            Err(e) => {
                ctx.counters.malformed();
                debug!(conn = conn.id(), error = %e, "Dropping malformed envelope");
                continue;
            }
        };

        match route {
            InboundRoute::Overlay => {
                let pushed = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    pushed = ctx.net_to_tun.push(inner.to_vec()) => pushed,
                };
                if pushed.is_err() {
                    return Err(RelayError::Cancelled);
                }
            }
            InboundRoute::PeerReturn => {
                ctx.counters.peer_return();
                if let Err(e) = ctx.write_to_device(inner).await {
                    warn!(conn = conn.id(), error = %e, "Peer-return write to device failed");
                    conn.close().await;
                    return Err(e);
                }
            }
        }
    }
}

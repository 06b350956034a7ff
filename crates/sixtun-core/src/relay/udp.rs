//! Datagram path.
//!
//! Outbound, every datagram carries exactly one envelope. Inbound datagrams
//! are taken as inner packets, or decoded as envelopes when the session asks
//! for [`DatagramPayload::Envelope`].

use super::RelayContext;
use crate::error::Result;
use crate::session::DatagramPayload;
use sixtun_transport::{MAX_RECORD_SIZE, TransportError};
use sixtun_transport::socket::send_target;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Move incoming datagrams into `net_to_tun` until cancelled.
pub(crate) async fn receive_loop(
    ctx: Arc<RelayContext>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_RECORD_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => received,
        };

        let (n, from) = match received {
            Ok(received) => received,
            Err(e) => {
                // ICMP port unreachable and similar surface here; the socket stays usable
                debug!(error = %e, "Datagram receive error");
                continue;
            }
        };

        ctx.counters.received(n);
        trace!(from = %from, len = n, "Datagram received");

        let datagram = &buf[..n];
        let inner = match ctx.session.udp_inbound {
            DatagramPayload::Inner => datagram,
            DatagramPayload::Envelope => {
                ctx.check_envelope(datagram);
                match ctx.codec.decode(datagram) {
                    Ok(inner) => inner,
                    Err(e) => {
                        ctx.counters.malformed();
                        debug!(from = %from, error = %e, "Dropping malformed datagram");
                        continue;
                    }
                }
            }
        };

        let pushed = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            pushed = ctx.net_to_tun.push(inner.to_vec()) => pushed,
        };
        if pushed.is_err() {
            return Ok(());
        }
    }
}

/// Encode packets from `tun_to_net` and send each as one datagram to the peer.
pub(crate) async fn writer_loop(
    ctx: Arc<RelayContext>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) -> Result<()> {
    let local = ctx.session.local_addr;
    let remote = ctx.session.peer_addr;
    let deadline = ctx.session.send_timeout;
    let local_socket = socket.local_addr().map_err(TransportError::from)?;
    let target = send_target(local_socket, ctx.session.peer_socket());
    let mut envelope = Vec::with_capacity(ctx.session.buffer_size);

    debug!(dest = %target, "Datagram writer started");

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            packet = ctx.tun_to_net.pop() => match packet {
                Some(packet) => packet,
                None => return Ok(()),
            },
        };

        if let Err(e) = ctx.codec.encode_into(local, remote, &packet, &mut envelope) {
            ctx.counters.encode_error();
            warn!(error = %e, "Dropping packet that cannot be encoded");
            continue;
        }

        match tokio::time::timeout(deadline, socket.send_to(&envelope, target)).await {
            Ok(Ok(_)) => ctx.counters.sent(envelope.len()),
            Ok(Err(e)) => {
                ctx.counters.send_failure();
                warn!(dest = %target, error = %e, "Datagram send failed");
            }
            Err(_) => {
                ctx.counters.send_failure();
                warn!(dest = %target, after = ?deadline, "Datagram send timed out");
            }
        }
    }
}

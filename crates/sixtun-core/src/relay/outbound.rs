//! Outbound path: the dial supervisor and the Writer it runs.
//!
//! The supervisor is the only place a Writer is started, and it runs the
//! Writer inline, so the outbound connection never has more than one.

use super::RelayContext;
use crate::error::{RelayError, Result};
use sixtun_transport::{Backoff, PeerConnection};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Keep a Writer running on a live connection to the configured peer.
///
/// Dial failures and Writer exits are followed by a backoff sleep, which an
/// accepted inbound connection can cut short through `ctx.redial`.
pub(crate) async fn supervise(ctx: Arc<RelayContext>, cancel: CancellationToken) -> Result<()> {
    let peer = ctx.session.peer_socket();
    let mut backoff = Backoff::new(ctx.session.backoff.clone());

    loop {
        let acquired = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            acquired = ctx.registry.acquire(peer) => acquired,
        };

        match acquired {
            Ok(conn) => {
                backoff.reset();
                info!(peer = %peer, conn = conn.id(), "Writer attached to outbound connection");

                let outcome = write_loop(&ctx, &conn, &cancel).await;
                ctx.registry.release(peer).await;

                match outcome {
                    Ok(()) => return Ok(()),
                    Err(RelayError::Cancelled) => return Ok(()),
                    Err(e) => warn!(peer = %peer, error = %e, "Writer stopped, redialing"),
                }
            }
            Err(e) => {
                ctx.counters.dial_failure();
                warn!(peer = %peer, error = %e, attempt = backoff.attempts() + 1, "Dial failed");
                if !e.is_transient() {
                    return Err(RelayError::DialFailure { addr: peer, source: e });
                }
            }
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(RelayError::DialFailure {
                addr: peer,
                source: sixtun_transport::TransportError::DialFailed {
                    addr: peer,
                    reason: format!("gave up after {} attempts", backoff.attempts()),
                },
            });
        };

        debug!(peer = %peer, delay = ?delay, "Waiting before redial");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.redial.notified() => debug!(peer = %peer, "Redial requested"),
        }
    }
}

/// Drain `tun_to_net` onto `conn` until the send fails, the queue closes, or
/// the relay is cancelled.
async fn write_loop(
    ctx: &RelayContext,
    conn: &PeerConnection,
    cancel: &CancellationToken,
) -> Result<()> {
    let local = ctx.session.local_addr;
    let remote = ctx.session.peer_addr;
    let framing = ctx.session.framing;
    let deadline = ctx.session.send_timeout;
    let mut envelope = Vec::with_capacity(ctx.session.buffer_size);

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
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

        let sent = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            sent = conn.send_record(framing, &envelope, deadline) => sent,
        };

        match sent {
            Ok(()) => {
                ctx.counters.sent(envelope.len());
                trace!(conn = conn.id(), len = envelope.len(), "Envelope sent");
            }
            Err(e) => {
                ctx.counters.send_failure();
                return Err(e.into());
            }
        }
    }
}

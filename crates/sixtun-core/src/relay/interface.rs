//! Device-side relay tasks.

use super::RelayContext;
use crate::classify::classify_version;
use crate::error::{RelayError, Result};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Read packets from the device into `tun_to_net` until the device fails or
/// the relay is cancelled.
pub(crate) async fn tun_reader(ctx: Arc<RelayContext>, cancel: CancellationToken) -> Result<()> {
    let mut buf = vec![0u8; ctx.session.buffer_size];
    let interface = ctx.device.name().to_string();
    debug!(interface = %interface, "Device reader started");

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = ctx.device.read_packet(&mut buf) => read,
        };

        let n = read.map_err(|source| RelayError::InterfaceIoFailure {
            interface: interface.clone(),
            source,
        })?;
        // A zero-length read is end of file: the descriptor will never yield again
        if n == 0 {
            return Err(RelayError::InterfaceIoFailure {
                interface,
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "device closed"),
            });
        }

        ctx.counters.tun_read();
        trace!(len = n, version = %classify_version(&buf[..n]), "Packet from device");

        let packet = buf[..n].to_vec();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            pushed = ctx.tun_to_net.push(packet) => {
                if pushed.is_err() {
                    // Queue closed during shutdown
                    return Ok(());
                }
            }
        }
    }
}

/// Drain `net_to_tun` into the device until the device fails, the queue is
/// closed, or the relay is cancelled.
pub(crate) async fn tun_writer(ctx: Arc<RelayContext>, cancel: CancellationToken) -> Result<()> {
    debug!(interface = ctx.device.name(), "Device writer started");

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            packet = ctx.net_to_tun.pop() => match packet {
                Some(packet) => packet,
                None => return Ok(()),
            },
        };

        trace!(len = packet.len(), "Packet to device");
        ctx.write_to_device(&packet).await?;
    }
}

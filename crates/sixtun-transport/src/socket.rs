//! Dual-stack listener setup and address normalization.
//!
//! Listeners bound to an IPv6 wildcard accept IPv4 peers as IPv4-mapped
//! addresses (`::ffff:a.b.c.d`). Everything that compares peer addresses
//! goes through [`normalize_addr`] first so that a mapped address and its
//! plain IPv4 form are treated as the same peer.

use crate::transport::{TransportError, TransportResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use tokio::net::{TcpListener, UdpSocket};
use tracing::debug;

/// Pending-connection backlog for stream listeners
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Datagram socket buffer size (1MB each direction)
const UDP_BUFFER_SIZE: usize = 1024 * 1024;

fn new_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, ty, Some(protocol))?;
    if addr.is_ipv6() {
        // Accept IPv4 peers on the same socket
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a TCP listener on `addr`.
///
/// An IPv6 address is bound dual-stack.
///
/// # Errors
///
/// Returns [`TransportError::BindFailed`] if any step of socket setup fails.
pub async fn bind_tcp_listener(addr: SocketAddr, backlog: i32) -> TransportResult<TcpListener> {
    let bind_failed = |source| TransportError::BindFailed { addr, source };

    let socket = new_socket(addr, Type::STREAM, Protocol::TCP).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.listen(backlog).map_err(bind_failed)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener).map_err(bind_failed)?;
    debug!(addr = %addr, "TCP listener bound");
    Ok(listener)
}

/// Bind a UDP socket on `addr`.
///
/// # Errors
///
/// Returns [`TransportError::BindFailed`] if any step of socket setup fails.
pub async fn bind_udp(addr: SocketAddr) -> TransportResult<UdpSocket> {
    let bind_failed = |source| TransportError::BindFailed { addr, source };

    let socket = new_socket(addr, Type::DGRAM, Protocol::UDP).map_err(bind_failed)?;
    socket
        .set_recv_buffer_size(UDP_BUFFER_SIZE)
        .map_err(bind_failed)?;
    socket
        .set_send_buffer_size(UDP_BUFFER_SIZE)
        .map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket).map_err(bind_failed)?;
    debug!(addr = %addr, "UDP socket bound");
    Ok(socket)
}

/// Collapse an IPv4-mapped IPv6 address to plain IPv4
#[must_use]
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// [`normalize_ip`] applied to a socket address; the port is kept
#[must_use]
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(normalize_ip(addr.ip()), addr.port())
}

/// Adapt a destination to the family of the socket sending to it.
///
/// A dual-stack IPv6 socket reaches IPv4 peers through their mapped form.
#[must_use]
pub fn send_target(local: SocketAddr, dest: SocketAddr) -> SocketAddr {
    match (local, dest) {
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        _ => dest,
    }
}

//! End-to-end tests for the relay engine.
//!
//! Each test runs real engines on loopback sockets with in-memory devices and
//! checks what comes out on the other side.

use sixtun_core::{
    CodecError, DatagramPayload, OUTER_HEADER_LEN, PROTOCOL_IPV6_ENCAP, Protocol, RelayEngine,
    RelayError, TaskHealth, decode, encode, identify_tunnel_packet, validate,
};
use sixtun_integration_tests::fixtures::{
    RECV_TIMEOUT, RunningRelay, free_port, ipv6_packet, loopback_session,
};
use sixtun_transport::{ChannelDevice, FdDevice, Framing, MAX_RECORD_SIZE};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Read one envelope framed by its outer header
async fn read_envelope(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let n = tokio::time::timeout(
        RECV_TIMEOUT,
        Framing::HeaderLength.read_record(stream, &mut buf, MAX_RECORD_SIZE),
    )
    .await
    .expect("timed out waiting for an envelope")
    .expect("read failed");
    assert!(n.is_some(), "connection closed before an envelope arrived");
    buf
}

/// Read envelopes until one carries `packet`
async fn read_until(stream: &mut TcpStream, packet: &[u8]) {
    loop {
        let envelope = read_envelope(stream).await;
        if decode(&envelope).unwrap() == packet {
            return;
        }
    }
}

/// Poll `health` until task `name` reports failure, returning the reason
async fn wait_for_failure(engine: &RelayEngine, name: &str) -> String {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let failed = engine
                .health()
                .into_iter()
                .find_map(|(n, h)| match h {
                    TaskHealth::Failed(reason) if n == name => Some(reason),
                    _ => None,
                });
            if let Some(reason) = failed {
                return reason;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{name} never failed"))
}

async fn accept_one(listener: &TcpListener) -> TcpStream {
    let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, listener.accept())
        .await
        .expect("relay never dialed")
        .expect("accept failed");
    stream
}

// ============================================================================
// Codec contract
// ============================================================================

#[test]
fn test_ten_byte_input_is_malformed() {
    assert_eq!(
        decode(&[0u8; 10]),
        Err(CodecError::MalformedEnvelope {
            expected: OUTER_HEADER_LEN,
            actual: 10,
        })
    );
}

#[test]
fn test_sixteen_byte_envelope_identifies_as_tunnel() {
    let envelope = encode(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), &ipv6_packet(16))
        .unwrap();
    assert_eq!(envelope.len(), 36);
    assert_eq!(identify_tunnel_packet(&envelope), "Tunnel IPv4 -> IPv6");
    assert!(validate(&envelope).is_ok());
}

// ============================================================================
// TCP outbound path
// ============================================================================

#[tokio::test]
async fn test_device_packet_reaches_peer_as_envelope() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let session = loopback_session(Protocol::Tcp, peer.local_addr().unwrap().port());
    let relay = RunningRelay::start(session).await.unwrap();

    let packet = ipv6_packet(16);
    assert!(relay.handle.inject(packet.clone()));

    let mut stream = accept_one(&peer).await;
    let envelope = read_envelope(&mut stream).await;

    assert_eq!(envelope.len(), 36);
    assert_eq!(envelope[0], 0x45);
    assert_eq!(envelope[9], PROTOCOL_IPV6_ENCAP);
    assert_eq!(u16::from_be_bytes([envelope[2], envelope[3]]), 36);
    assert_eq!(decode(&envelope).unwrap(), &packet[..]);

    let stats = relay.engine.stats();
    assert_eq!(stats.packets_from_tun, 1);
    assert_eq!(stats.envelopes_sent, 1);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_envelope_order_preserved() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let session = loopback_session(Protocol::Tcp, peer.local_addr().unwrap().port());
    let relay = RunningRelay::start(session).await.unwrap();

    let packets: Vec<_> = (20..60).map(ipv6_packet).collect();
    for packet in &packets {
        relay.handle.inject(packet.clone());
    }

    let mut stream = accept_one(&peer).await;
    for packet in &packets {
        let envelope = read_envelope(&mut stream).await;
        assert_eq!(decode(&envelope).unwrap(), &packet[..]);
    }

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_outbound_dial_retries_until_peer_listens() {
    let port = free_port();
    let relay = RunningRelay::start(loopback_session(Protocol::Tcp, port))
        .await
        .unwrap();

    // Queue a packet while nothing listens; the supervisor keeps retrying
    let packet = ipv6_packet(40);
    relay.handle.inject(packet.clone());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(relay.engine.stats().dial_failures >= 1);

    let peer = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let mut stream = accept_one(&peer).await;
    let envelope = read_envelope(&mut stream).await;
    assert_eq!(decode(&envelope).unwrap(), &packet[..]);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_failure_releases_and_redials() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let session = loopback_session(Protocol::Tcp, peer.local_addr().unwrap().port());
    let relay = RunningRelay::start(session).await.unwrap();

    let first = accept_one(&peer).await;
    drop(first);

    // Writes on the reset connection fail; keep feeding until the supervisor redials
    let mut second = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            relay.handle.inject(ipv6_packet(64));
            if let Ok(accepted) =
                tokio::time::timeout(Duration::from_millis(20), peer.accept()).await
            {
                break accepted.unwrap().0;
            }
        }
    })
    .await
    .expect("relay never redialed");

    let packet = ipv6_packet(99);
    relay.handle.inject(packet.clone());
    read_until(&mut second, &packet).await;

    let stats = relay.engine.stats();
    assert!(stats.send_failures >= 1);
    assert!(stats.dials >= 2);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_traffic_shares_one_outbound_connection() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let session = loopback_session(Protocol::Tcp, peer.local_addr().unwrap().port());
    let relay = RunningRelay::start(session).await.unwrap();
    let port = relay.port();

    // Inbound connections nudge the supervisor while packets are queued
    let clients: Vec<_> = (0..4)
        .map(|_| tokio::spawn(TcpStream::connect(("127.0.0.1", port))))
        .collect();
    let packets: Vec<_> = (20..52).map(ipv6_packet).collect();
    for packet in &packets {
        relay.handle.inject(packet.clone());
    }
    let mut held = Vec::new();
    for client in clients {
        held.push(client.await.unwrap().unwrap());
    }

    let mut stream = accept_one(&peer).await;
    for packet in &packets {
        let envelope = read_envelope(&mut stream).await;
        assert_eq!(decode(&envelope).unwrap(), &packet[..]);
    }

    assert!(
        tokio::time::timeout(Duration::from_millis(200), peer.accept())
            .await
            .is_err(),
        "relay opened a second outbound connection"
    );
    assert_eq!(relay.engine.stats().dials, 1);
    let outbound = relay.engine.outbound_stats().await.unwrap();
    assert_eq!(outbound.send_errors, 0);

    drop(held);
    relay.stop().await.unwrap();
}

// ============================================================================
// TCP inbound roles
// ============================================================================

#[tokio::test]
async fn test_dual_stack_listener_recognizes_ipv4_peer() {
    let mut session = loopback_session(Protocol::Tcp, free_port());
    session.listen_addr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
    let relay = RunningRelay::start(session).await.unwrap();
    assert!(relay.engine.local_addr().is_ipv6());

    // Arrives as ::ffff:127.0.0.1, which is the configured peer
    let mut client = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
    let packet = ipv6_packet(24);
    client
        .write_all(&encode(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &packet).unwrap())
        .await
        .unwrap();

    assert_eq!(relay.next_written().await, packet);
    assert_eq!(relay.engine.stats().peer_return_packets, 1);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_peer_return_device_failure_is_counted() {
    let session = loopback_session(Protocol::Tcp, free_port());
    let (device, handle) = ChannelDevice::pair("gone");
    let engine = Arc::new(RelayEngine::bind(session, Arc::new(device)).await.unwrap());
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });
    drop(handle);

    let mut client = TcpStream::connect(engine.local_addr()).await.unwrap();
    client
        .write_all(&encode(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &ipv6_packet(16)).unwrap())
        .await
        .unwrap();

    tokio::time::timeout(RECV_TIMEOUT, async {
        while engine.stats().device_write_failures == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device write failure was not counted");
    let stats = engine.stats();
    assert_eq!(stats.peer_return_packets, 1);
    assert_eq!(stats.packets_to_tun, 0);

    cancel.cancel();
    tokio::time::timeout(RECV_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_two_relays_back_to_back() {
    let port_a = free_port();
    let relay_b = RunningRelay::start(loopback_session(Protocol::Tcp, port_a))
        .await
        .unwrap();

    let mut session_a = loopback_session(Protocol::Tcp, relay_b.port());
    session_a.local_port = port_a;
    let relay_a = RunningRelay::start(session_a).await.unwrap();

    // A -> B: arrives on B's listener from B's configured peer (peer return path)
    let outbound = ipv6_packet(16);
    relay_a.handle.inject(outbound.clone());
    assert_eq!(relay_b.next_written().await, outbound);

    // B -> A
    let inbound = ipv6_packet(64);
    relay_b.handle.inject(inbound.clone());
    assert_eq!(relay_a.next_written().await, inbound);

    assert!(relay_b.engine.stats().connections_accepted >= 1);
    assert!(relay_a.engine.stats().connections_accepted >= 1);

    relay_a.stop().await.unwrap();
    relay_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_overlay_connection_feeds_device_queue() {
    // The configured peer is 127.0.0.2, so a connection from 127.0.0.1 is an overlay peer
    let mut session = loopback_session(Protocol::Tcp, free_port());
    session.peer_addr = Ipv4Addr::new(127, 0, 0, 2);
    let relay = RunningRelay::start(session).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
    let packets = [ipv6_packet(16), ipv6_packet(100), ipv6_packet(1280)];
    for packet in &packets {
        let envelope = encode(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, packet).unwrap();
        client.write_all(&envelope).await.unwrap();
    }

    for packet in &packets {
        assert_eq!(&relay.next_written().await, packet);
    }
    let stats = relay.engine.stats();
    assert_eq!(stats.envelopes_received, 3);
    assert_eq!(stats.peer_return_packets, 0);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_framing_desync_closes_only_that_connection() {
    let mut session = loopback_session(Protocol::Tcp, free_port());
    session.peer_addr = Ipv4Addr::new(127, 0, 0, 2);
    let relay = RunningRelay::start(session).await.unwrap();

    // Total length 8 is shorter than the outer header
    let mut bad = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
    let mut bogus = vec![0u8; 20];
    bogus[0] = 0x45;
    bogus[2..4].copy_from_slice(&8u16.to_be_bytes());
    bad.write_all(&bogus).await.unwrap();

    let mut good = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
    let packet = ipv6_packet(32);
    good.write_all(&encode(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &packet).unwrap())
        .await
        .unwrap();
    assert_eq!(relay.next_written().await, packet);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_length_prefixed_framing() {
    let mut session = loopback_session(Protocol::Tcp, free_port());
    session.peer_addr = Ipv4Addr::new(127, 0, 0, 2);
    session.framing = Framing::LengthPrefixed;
    let relay = RunningRelay::start(session).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", relay.port())).await.unwrap();
    let packet = ipv6_packet(48);
    let envelope = encode(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &packet).unwrap();
    Framing::LengthPrefixed
        .write_record(&mut client, &envelope)
        .await
        .unwrap();

    assert_eq!(relay.next_written().await, packet);
    relay.stop().await.unwrap();
}

// ============================================================================
// UDP
// ============================================================================

#[tokio::test]
async fn test_udp_envelope_inbound_and_outbound() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut session = loopback_session(Protocol::Udp, peer.local_addr().unwrap().port());
    session.udp_inbound = DatagramPayload::Envelope;
    let relay = RunningRelay::start(session).await.unwrap();
    let relay_addr: SocketAddr = ([127, 0, 0, 1], relay.port()).into();

    // Inbound: malformed datagram is dropped, the next one is delivered
    peer.send_to(&[0u8; 10], relay_addr).await.unwrap();
    let packet = ipv6_packet(16);
    let envelope = encode(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &packet).unwrap();
    peer.send_to(&envelope, relay_addr).await.unwrap();
    assert_eq!(relay.next_written().await, packet);
    assert_eq!(relay.engine.stats().malformed_dropped, 1);

    // Outbound: one envelope per datagram to the configured peer
    let outbound = ipv6_packet(200);
    relay.handle.inject(outbound.clone());
    let mut buf = vec![0u8; MAX_RECORD_SIZE];
    let (n, _) = tokio::time::timeout(RECV_TIMEOUT, peer.recv_from(&mut buf))
        .await
        .expect("no datagram from relay")
        .unwrap();
    assert_eq!(n, OUTER_HEADER_LEN + outbound.len());
    assert_eq!(decode(&buf[..n]).unwrap(), &outbound[..]);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_datagram_delivered_unchanged_by_default() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = loopback_session(Protocol::Udp, peer.local_addr().unwrap().port());
    assert_eq!(session.udp_inbound, DatagramPayload::Inner);
    let relay = RunningRelay::start(session).await.unwrap();
    let relay_addr: SocketAddr = ([127, 0, 0, 1], relay.port()).into();

    let packet = ipv6_packet(48);
    peer.send_to(&packet, relay_addr).await.unwrap();
    assert_eq!(relay.next_written().await, packet);

    // Short datagrams are not envelopes in this mode, so nothing is dropped
    peer.send_to(&[0x60u8; 10], relay_addr).await.unwrap();
    assert_eq!(relay.next_written().await, vec![0x60u8; 10]);
    assert_eq!(relay.engine.stats().malformed_dropped, 0);

    relay.stop().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_cancellation_stops_all_tasks() {
    let relay = RunningRelay::start(loopback_session(Protocol::Tcp, free_port()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let engine = relay.engine.clone();
    let running: Vec<_> = engine
        .health()
        .into_iter()
        .filter(|(_, h)| h.is_running())
        .map(|(name, _)| name)
        .collect();
    for task in ["accept", "outbound", "tun-reader", "tun-writer"] {
        assert!(running.iter().any(|n| n == task), "{task} not running");
    }

    relay.stop().await.unwrap();
    assert!(
        engine
            .health()
            .iter()
            .all(|(_, h)| *h == TaskHealth::Finished)
    );

    // A stopped engine cannot be restarted
    assert!(matches!(
        engine.run(CancellationToken::new()).await,
        Err(RelayError::AlreadyRunning)
    ));
}

#[tokio::test]
async fn test_device_failure_degrades_without_stopping() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let session = loopback_session(Protocol::Tcp, peer.local_addr().unwrap().port());

    let (device, handle) = ChannelDevice::pair("failing");
    let engine = Arc::new(RelayEngine::bind(session, Arc::new(device)).await.unwrap());
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });

    // Device reads fail once the handle is gone
    drop(handle);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let health = engine.health();
    let reader = health.iter().find(|(n, _)| n == "tun-reader").unwrap();
    assert!(matches!(&reader.1, TaskHealth::Failed(_)));
    let accept = health.iter().find(|(n, _)| n == "accept").unwrap();
    assert!(accept.1.is_running());

    cancel.cancel();
    tokio::time::timeout(RECV_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_device_eof_fails_reader() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let device = FdDevice::from_fd(OwnedFd::from(ours), "eof0").unwrap();
    let session = loopback_session(Protocol::Tcp, free_port());
    let engine = Arc::new(RelayEngine::bind(session, Arc::new(device)).await.unwrap());
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });

    drop(theirs);
    let reason = wait_for_failure(&engine, "tun-reader").await;
    assert!(reason.contains("device closed"), "{reason}");
    assert!(
        engine
            .health()
            .iter()
            .any(|(n, h)| n == "accept" && h.is_running())
    );

    cancel.cancel();
    tokio::time::timeout(RECV_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_fatal() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut session = loopback_session(Protocol::Tcp, 4000);
    session.local_port = taken.local_addr().unwrap().port();

    let (device, _handle) = ChannelDevice::pair("bind-test");
    let result = RelayEngine::bind(session, Arc::new(device)).await;
    assert!(matches!(result, Err(RelayError::BindFailure { .. })));
}

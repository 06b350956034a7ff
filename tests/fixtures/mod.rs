//! Relay fixtures for integration testing
//!
//! Provides engines running on loopback with in-memory devices, so tests can
//! inject packets on one side and observe envelopes or packets on the other.
//!
//! # Example
//!
//! ```no_run
//! use sixtun_integration_tests::fixtures::{RunningRelay, ipv6_packet, loopback_session};
//! use sixtun_core::Protocol;
//!
//! # async fn example() {
//! let relay = RunningRelay::start(loopback_session(Protocol::Tcp, 4001)).await.unwrap();
//! relay.handle.inject(ipv6_packet(16));
//! relay.stop().await.unwrap();
//! # }
//! ```

use sixtun_core::{RelayEngine, RelayError, TunnelSession};
use sixtun_core::Protocol;
use sixtun_transport::{BackoffConfig, ChannelDevice, DeviceHandle};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a test waits for any single packet before failing
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask the OS for a currently unused TCP port on loopback
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("ephemeral port addr").port()
}

/// Session on 127.0.0.1 with an ephemeral listen port and fast retries
pub fn loopback_session(protocol: Protocol, peer_port: u16) -> TunnelSession {
    let mut session = TunnelSession::new(
        Ipv4Addr::LOCALHOST,
        Ipv4Addr::LOCALHOST,
        0,
        peer_port,
        protocol,
    );
    session.listen_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    session.connect_timeout = Duration::from_secs(1);
    session.send_timeout = Duration::from_secs(1);
    session.backoff = BackoffConfig {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(100),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: None,
    };
    session
}

/// IPv6-looking packet of `len` bytes (version nibble 6, then a counting pattern)
pub fn ipv6_packet(len: usize) -> Vec<u8> {
    let mut packet: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    if let Some(first) = packet.first_mut() {
        *first = 0x60;
    }
    packet
}

/// An engine running in the background with an in-memory device
pub struct RunningRelay {
    /// The engine, shared with its run task
    pub engine: Arc<RelayEngine>,
    /// Test side of the engine's device
    pub handle: DeviceHandle,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), RelayError>>,
}

impl RunningRelay {
    /// Bind and start an engine for `session`
    pub async fn start(session: TunnelSession) -> Result<Self, RelayError> {
        let (device, handle) = ChannelDevice::pair("sixtun-test");
        let engine = Arc::new(RelayEngine::bind(session, Arc::new(device)).await?);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        Ok(Self {
            engine,
            handle,
            cancel,
            task,
        })
    }

    /// Port the engine listens on
    pub fn port(&self) -> u16 {
        self.engine.local_addr().port()
    }

    /// Next packet the engine wrote to its device, failing after [`RECV_TIMEOUT`]
    pub async fn next_written(&self) -> Vec<u8> {
        tokio::time::timeout(RECV_TIMEOUT, self.handle.next_written())
            .await
            .expect("timed out waiting for a packet on the device")
            .expect("device dropped")
    }

    /// Cancel the engine and wait for `run` to return
    pub async fn stop(self) -> Result<(), RelayError> {
        self.cancel.cancel();
        tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("engine did not stop in time")
            .expect("engine task panicked")
    }
}

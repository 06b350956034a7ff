//! SIXTUN CLI
//!
//! Userspace IPv6-in-IPv4 tunnel broker

mod config;

use clap::{Args, Parser, Subcommand};
use sixtun_core::{
    RelayEngine, RelayStats, classify_protocol, classify_version, identify_tunnel_packet,
};
use sixtun_transport::{FdDevice, TunDevice};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use config::Config;

/// SIXTUN - carry IPv6 packets between two IPv4 endpoints
#[derive(Parser)]
#[command(name = "sixtun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to ~/.config/sixtun/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a TUN interface and relay until Ctrl+C
    Run(RunArgs),

    /// Describe a hex-encoded packet
    Classify {
        /// Packet bytes as hex (whitespace and `:` separators allowed)
        #[arg(required = true)]
        packet: String,
    },

    /// Print the effective configuration
    Config,
}

/// Overrides applied on top of the configuration file
#[derive(Args, Default)]
struct RunArgs {
    /// Our IPv4 address
    #[arg(long)]
    local: Option<String>,

    /// Peer IPv4 address
    #[arg(long)]
    peer: Option<String>,

    /// Port to listen on
    #[arg(long)]
    local_port: Option<u16>,

    /// Peer port
    #[arg(long)]
    peer_port: Option<u16>,

    /// Envelope transport (tcp or udp)
    #[arg(long)]
    protocol: Option<String>,

    /// Stream framing (header-length, length-prefixed or raw)
    #[arg(long)]
    framing: Option<String>,

    /// TUN interface name to attach to
    #[arg(short, long)]
    interface: Option<String>,

    /// Use an already-attached TUN descriptor inherited from the parent process
    #[arg(long, conflicts_with = "interface")]
    tun_fd: Option<RawFd>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        let tunnel = &mut config.tunnel;
        if let Some(local) = &self.local {
            tunnel.local_addr.clone_from(local);
        }
        if let Some(peer) = &self.peer {
            tunnel.peer_addr.clone_from(peer);
        }
        if let Some(port) = self.local_port {
            tunnel.local_port = port;
        }
        if let Some(port) = self.peer_port {
            tunnel.peer_port = port;
        }
        if let Some(protocol) = &self.protocol {
            tunnel.protocol.clone_from(protocol);
        }
        if let Some(interface) = &self.interface {
            tunnel.interface.clone_from(interface);
        }
        if let Some(framing) = &self.framing {
            config.transport.framing.clone_from(framing);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;
    if let Commands::Run(args) = &cli.command {
        args.apply(&mut config);
    }

    // Initialize logging
    let filter = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run(args) => {
            config.validate()?;
            run_tunnel(args.tun_fd, &config).await?;
        }
        Commands::Classify { packet } => {
            classify_packet(&packet)?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Attach the device, run the relay and wait for Ctrl+C
async fn run_tunnel(tun_fd: Option<RawFd>, config: &Config) -> anyhow::Result<()> {
    let session = config.to_session()?;
    let device = open_device(tun_fd, &config.tunnel.interface)?;

    let engine = Arc::new(RelayEngine::bind(session, device).await?);
    let cancel = CancellationToken::new();

    println!("SIXTUN Tunnel");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {} ({})", engine.local_addr(), engine.session().protocol);
    println!("Peer: {}", engine.session().peer_socket());
    println!("Press Ctrl+C to stop");

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => println!("\nShutting down..."),
                Err(e) => tracing::error!(error = %e, "Cannot listen for Ctrl+C"),
            }
            cancel.cancel();
        }
    });

    if let Some(secs) = config.logging.stats_interval_secs {
        tokio::spawn(report_stats(
            engine.clone(),
            Duration::from_secs(secs),
            cancel.clone(),
        ));
    }

    engine.run(cancel).await?;
    print_stats(&engine.stats());

    Ok(())
}

fn open_device(tun_fd: Option<RawFd>, interface: &str) -> anyhow::Result<Arc<dyn TunDevice>> {
    if let Some(fd) = tun_fd {
        if fd < 0 {
            anyhow::bail!("Invalid TUN descriptor: {fd}");
        }
        // SAFETY: the descriptor is handed to us by the parent process and
        // nothing else in this process owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        return Ok(Arc::new(FdDevice::from_fd(owned, interface)?));
    }

    #[cfg(target_os = "linux")]
    {
        let device = sixtun_transport::NamedDevice::attach(interface)
            .map_err(|e| anyhow::anyhow!("cannot attach to TUN interface {interface}: {e}"))?;
        Ok(Arc::new(device))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("attaching by name is only supported on Linux; pass --tun-fd instead")
    }
}

/// Log counters every `every` until cancelled
async fn report_stats(engine: Arc<RelayEngine>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let stats = engine.stats();
        tracing::info!(
            from_tun = stats.packets_from_tun,
            to_tun = stats.packets_to_tun,
            sent = stats.envelopes_sent,
            received = stats.envelopes_received,
            malformed = stats.malformed_dropped,
            send_failures = stats.send_failures,
            dials = stats.dials,
            dial_failures = stats.dial_failures,
            device_write_failures = stats.device_write_failures,
            tun_to_net = stats.tun_to_net_depth,
            net_to_tun = stats.net_to_tun_depth,
            "Relay stats"
        );

        if let Some(outbound) = engine.outbound_stats().await {
            tracing::debug!(
                bytes_sent = outbound.bytes_sent,
                send_errors = outbound.send_errors,
                "Outbound connection"
            );
        }

        for (name, health) in engine.health() {
            if !health.is_running() {
                tracing::warn!(task = %name, health = ?health, "Relay task not running");
            }
        }
    }
}

fn print_stats(stats: &RelayStats) {
    println!("Packets from interface: {}", stats.packets_from_tun);
    println!("Packets to interface:   {}", stats.packets_to_tun);
    println!(
        "Envelopes sent:         {} ({} bytes)",
        stats.envelopes_sent, stats.bytes_sent
    );
    println!(
        "Envelopes received:     {} ({} bytes)",
        stats.envelopes_received, stats.bytes_received
    );
    println!("Malformed dropped:      {}", stats.malformed_dropped);
    println!("Device write failures:  {}", stats.device_write_failures);
    println!("Outbound dials:         {}", stats.dials);
    println!("Queue drops:            {}", stats.queue_dropped);
}

/// Print version, protocol and tunnel description of a hex packet
fn classify_packet(input: &str) -> anyhow::Result<()> {
    let bytes = parse_hex(input)?;

    println!("Length:   {} bytes", bytes.len());
    println!("Version:  {}", classify_version(&bytes));
    println!("Protocol: {}", classify_protocol(&bytes));
    println!("Tunnel:   {}", identify_tunnel_packet(&bytes));

    Ok(())
}

fn parse_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).map_err(|e| anyhow::anyhow!("invalid hex packet: {e}"))
}

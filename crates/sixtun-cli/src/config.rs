//! Configuration file for the SIXTUN CLI.

use serde::{Deserialize, Serialize};
use sixtun_core::{DatagramPayload, EnvelopeVariant, Protocol, TunnelSession};
use sixtun_transport::{BackoffConfig, Framing, OverflowPolicy, QueueCapacity};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SIXTUN configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Tunnel endpoints and interface
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Envelope transport tuning
    #[serde(default)]
    pub transport: TransportConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tunnel endpoints and interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Our IPv4 address, stamped as the outer source
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// Remote IPv4 endpoint
    #[serde(default = "default_peer_addr")]
    pub peer_addr: String,
    /// Port we listen on
    #[serde(default = "default_port")]
    pub local_port: u16,
    /// Port the peer listens on
    #[serde(default = "default_port")]
    pub peer_port: u16,
    /// `tcp` or `udp`
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Listener bind address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// TUN interface to attach to
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Per-read buffer size for the device
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Envelope transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `header-length`, `length-prefixed` or `raw`
    #[serde(default = "default_framing")]
    pub framing: String,
    /// `plain` or `tcp-mimic`
    #[serde(default = "default_variant")]
    pub variant: String,
    /// Source port of the synthetic TCP header (defaults to the local port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimic_src_port: Option<u16>,
    /// Destination port of the synthetic TCP header (defaults to the peer port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimic_dst_port: Option<u16>,
    /// `inner` (datagrams are raw packets) or `envelope` (datagrams are decoded)
    #[serde(default = "default_udp_inbound")]
    pub udp_inbound: String,
    /// Per-direction queue limit; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    /// `block` or `drop-oldest`, applied when `queue_capacity` is set
    #[serde(default = "default_overflow")]
    pub queue_overflow: String,
    /// Outbound connect deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-envelope send deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Idle limit on peer connections in milliseconds; none when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u64>,
    /// Redial schedule
    #[serde(default)]
    pub backoff: BackoffSection,
}

/// Redial schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSection {
    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    /// Delay cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Growth factor per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Jitter fraction in `0.0..=1.0`
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
    /// Stop redialing after this many attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log relay counters at this interval; off when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_interval_secs: Option<u64>,
}

// Default values

fn default_local_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_peer_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    sixtun_core::DEFAULT_PORT
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_listen_addr() -> String {
    "::".to_string()
}

fn default_interface() -> String {
    "sixtun0".to_string()
}

fn default_buffer_size() -> usize {
    sixtun_core::DEFAULT_BUFFER_SIZE
}

fn default_framing() -> String {
    Framing::default().as_str().to_string()
}

fn default_variant() -> String {
    "plain".to_string()
}

fn default_udp_inbound() -> String {
    DatagramPayload::default().to_string()
}

fn default_overflow() -> String {
    "block".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_addr: default_local_addr(),
            peer_addr: default_peer_addr(),
            local_port: default_port(),
            peer_port: default_port(),
            protocol: default_protocol(),
            listen_addr: default_listen_addr(),
            interface: default_interface(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            framing: default_framing(),
            variant: default_variant(),
            mimic_src_port: None,
            mimic_dst_port: None,
            udp_inbound: default_udp_inbound(),
            queue_capacity: None,
            queue_overflow: default_overflow(),
            connect_timeout_ms: default_timeout_ms(),
            send_timeout_ms: default_timeout_ms(),
            receive_timeout_ms: None,
            backoff: BackoffSection::default(),
        }
    }
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
            max_attempts: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats_interval_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("sixtun/config.toml")
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    ///
    /// A missing file at the default location is created with the defaults; a
    /// missing file anywhere else is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if reading, parsing or creating the file fails.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        if path != Self::default_path() {
            anyhow::bail!("config file not found: {}", path.display());
        }

        let config = Self::default();
        if let Err(e) = config.save(path) {
            tracing::debug!(path = %path.display(), error = %e, "Could not write default config");
        }
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        let level = self.logging.level.to_lowercase();
        if !level.contains('=') && !valid_log_levels.contains(&level.as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.logging.stats_interval_secs == Some(0) {
            anyhow::bail!("Stats interval must be at least 1 second");
        }

        if self.tunnel.interface.len() > 15 {
            anyhow::bail!(
                "Interface name '{}' is longer than 15 bytes",
                self.tunnel.interface
            );
        }

        let backoff = &self.transport.backoff;
        if backoff.multiplier < 1.0 {
            anyhow::bail!("Backoff multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            anyhow::bail!("Backoff jitter must be between 0.0 and 1.0");
        }
        if backoff.initial_ms > backoff.max_ms {
            anyhow::bail!("Backoff initial delay exceeds its maximum");
        }

        self.to_session()?.validate()?;
        Ok(())
    }

    /// Build the engine session this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns an error if an address or enumerated setting does not parse.
    pub fn to_session(&self) -> anyhow::Result<TunnelSession> {
        let tunnel = &self.tunnel;
        let transport = &self.transport;

        let local_addr = parse_ipv4(&tunnel.local_addr, "local_addr")?;
        let peer_addr = parse_ipv4(&tunnel.peer_addr, "peer_addr")?;
        let listen_addr: IpAddr = tunnel
            .listen_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid listen_addr: {}", tunnel.listen_addr))?;
        let protocol: Protocol = tunnel.protocol.parse().map_err(anyhow::Error::msg)?;
        let framing: Framing = transport.framing.parse().map_err(anyhow::Error::msg)?;
        let udp_inbound: DatagramPayload =
            transport.udp_inbound.parse().map_err(anyhow::Error::msg)?;

        let variant = match transport.variant.to_lowercase().as_str() {
            "plain" => EnvelopeVariant::Plain,
            "tcp-mimic" => EnvelopeVariant::TcpMimic {
                src_port: transport.mimic_src_port.unwrap_or(tunnel.local_port),
                dst_port: transport.mimic_dst_port.unwrap_or(tunnel.peer_port),
            },
            other => anyhow::bail!("Invalid variant: {other}. Must be one of: plain, tcp-mimic"),
        };

        let overflow = match transport.queue_overflow.to_lowercase().as_str() {
            "block" => OverflowPolicy::Block,
            "drop-oldest" => OverflowPolicy::DropOldest,
            other => {
                anyhow::bail!("Invalid queue_overflow: {other}. Must be one of: block, drop-oldest")
            }
        };
        let queue_capacity = match transport.queue_capacity {
            Some(capacity) => QueueCapacity::Bounded { capacity, overflow },
            None => QueueCapacity::Unbounded,
        };

        let backoff = &transport.backoff;
        let mut session = TunnelSession::new(
            local_addr,
            peer_addr,
            tunnel.local_port,
            tunnel.peer_port,
            protocol,
        );
        session.listen_addr = listen_addr;
        session.framing = framing;
        session.variant = variant;
        session.udp_inbound = udp_inbound;
        session.queue_capacity = queue_capacity;
        session.connect_timeout = Duration::from_millis(transport.connect_timeout_ms);
        session.send_timeout = Duration::from_millis(transport.send_timeout_ms);
        session.receive_timeout = transport.receive_timeout_ms.map(Duration::from_millis);
        session.backoff = BackoffConfig {
            initial: Duration::from_millis(backoff.initial_ms),
            max: Duration::from_millis(backoff.max_ms),
            multiplier: backoff.multiplier,
            jitter: backoff.jitter,
            max_attempts: backoff.max_attempts,
        };
        session.buffer_size = tunnel.buffer_size;

        Ok(session)
    }
}

fn parse_ipv4(value: &str, name: &str) -> anyhow::Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {name}: {value} (expected an IPv4 address)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tunnel.local_port, 4000);
        assert_eq!(config.tunnel.protocol, "tcp");
        assert_eq!(config.transport.framing, "header-length");
        assert!(config.transport.queue_capacity.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "sixtun_core=trace".to_string();
        assert!(config.validate().is_ok());

        config.tunnel.peer_addr = "2001:db8::1".to_string();
        assert!(config.validate().is_err());
        config.tunnel.peer_addr = "0.0.0.0".to_string();
        assert!(config.validate().is_err());
        config.tunnel.peer_addr = "192.0.2.7".to_string();

        config.tunnel.peer_port = 0;
        assert!(config.validate().is_err());
        config.tunnel.peer_port = 4000;

        config.transport.framing = "newline".to_string();
        assert!(config.validate().is_err());
        config.transport.framing = "raw".to_string();

        config.transport.udp_inbound = "framed".to_string();
        assert!(config.validate().is_err());
        config.transport.udp_inbound = "inner".to_string();

        config.transport.queue_capacity = Some(0);
        assert!(config.validate().is_err());
        config.transport.queue_capacity = Some(128);

        config.transport.backoff.jitter = 1.5;
        assert!(config.validate().is_err());
        config.transport.backoff.jitter = 0.0;

        config.tunnel.interface = "a-very-long-interface".to_string();
        assert!(config.validate().is_err());
        config.tunnel.interface = "tun6".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            local_addr = "198.51.100.1"
            peer_addr = "203.0.113.9"
            protocol = "udp"

            [transport]
            variant = "tcp-mimic"
            udp_inbound = "envelope"
            queue_capacity = 256
            queue_overflow = "drop-oldest"
            receive_timeout_ms = 30000

            [transport.backoff]
            max_attempts = 5
            "#,
        )
        .unwrap();

        let session = config.to_session().unwrap();
        assert_eq!(session.local_addr, Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(session.peer_addr, Ipv4Addr::new(203, 0, 113, 9));
        assert_eq!(session.protocol, Protocol::Udp);
        assert_eq!(session.udp_inbound, DatagramPayload::Envelope);
        assert_eq!(session.local_port, 4000);
        assert_eq!(
            session.variant,
            EnvelopeVariant::TcpMimic {
                src_port: 4000,
                dst_port: 4000
            }
        );
        assert_eq!(
            session.queue_capacity,
            QueueCapacity::Bounded {
                capacity: 256,
                overflow: OverflowPolicy::DropOldest
            }
        );
        assert_eq!(session.receive_timeout, Some(Duration::from_secs(30)));
        assert_eq!(session.backoff.max_attempts, Some(5));
        assert_eq!(session.backoff.initial, Duration::from_millis(100));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_serialization() {
        let mut config = Config::default();
        config.transport.queue_capacity = Some(64);
        let toml_str = config.to_toml().unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.tunnel.peer_addr, deserialized.tunnel.peer_addr);
        assert_eq!(deserialized.transport.queue_capacity, Some(64));
        assert!(deserialized.transport.receive_timeout_ms.is_none());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.tunnel.interface = "tun9".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tunnel.interface, "tun9");
        assert!(Config::load_or_default(&path).is_ok());
        assert!(Config::load_or_default(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_listen_addr_dual_stack_default() {
        let session = Config::default().to_session().unwrap();
        assert_eq!(session.listen_addr, "::".parse::<IpAddr>().unwrap());
    }
}

//! Configuration management for the transport engine
//!
//! Every section has defaults, so a configuration file only needs to name the
//! values it changes. Files are read through the `config` crate (format picked
//! from the extension) and layered with `QUUX_`-prefixed environment
//! variables, using `__` between section and field:
//! `QUUX_CONNECTION__MAX_IDLE_TIMEOUT=5000`.

use crate::quic::error::{QuicError, Result};
use crate::quic::packet::MAX_DATAGRAM_SIZE;
use crate::quic::stream::{INITIAL_MAX_STREAM_DATA, StreamLimits};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

const ENV_PREFIX: &str = "QUUX";
const ENV_SEPARATOR: &str = "__";

/// Smallest datagram the engine will agree to build
pub const MIN_UDP_PAYLOAD_SIZE: u64 = 256;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Stream buffer configuration
    pub stream: StreamConfig,
    /// Loss recovery configuration
    pub recovery: RecoveryConfig,
    /// Packet protection configuration
    pub crypto: CryptoConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum idle timeout in milliseconds
    pub max_idle_timeout: u64,
    /// Keep-alive interval in milliseconds, 0 disables
    pub keep_alive_interval: u64,
    /// Maximum UDP payload size
    pub max_udp_payload_size: u64,
    /// Maximum concurrent peer-initiated streams
    pub max_streams: u64,
    /// Reclaim peers once all their streams are retired
    pub auto_reclaim: bool,
    /// Maximum ranges reported per ACK frame
    pub max_ack_ranges: usize,
    /// Packets a peer may emit per loop iteration
    pub max_packets_per_flush: usize,
    /// Datagrams read from one socket per loop iteration
    pub max_datagrams_per_poll: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_idle_timeout: 30_000,    // 30 seconds
            keep_alive_interval: 10_000, // 10 seconds
            max_udp_payload_size: 1200,
            max_streams: 100,
            auto_reclaim: true,
            max_ack_ranges: 32,
            max_packets_per_flush: 256,
            max_datagrams_per_poll: 256,
        }
    }
}

/// Stream buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes a stream buffers before writes return 0
    pub send_buffer_size: usize,
    /// Receive window advertised per stream
    pub receive_window: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 256 * 1024, // 256KB
            receive_window: 256 * 1024,   // 256KB
        }
    }
}

/// Loss recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// RTT assumed before the first sample, in milliseconds
    pub initial_rtt: u64,
    /// Lower bound of the retransmission timeout, in milliseconds
    pub min_rto: u64,
    /// Upper bound of the retransmission timeout, in milliseconds
    pub max_rto: u64,
    /// Packets acknowledged after a missing one before it counts as lost
    pub packet_threshold: u64,
    /// Initial congestion window, in packets
    pub initial_congestion_window: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_rtt: 100,
            min_rto: 50,
            max_rto: 10_000,
            packet_threshold: 3,
            initial_congestion_window: 10,
        }
    }
}

/// Packet protection backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoBackend {
    /// No protection
    #[default]
    Plaintext,
    /// ChaCha20-Poly1305 keyed from `pre_shared_key`
    #[serde(rename = "chacha20_poly1305")]
    ChaCha20Poly1305,
}

/// Crypto configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Crypto backend to use
    pub backend: CryptoBackend,
    /// 32-byte key as 64 hex characters
    pub pre_shared_key: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file, overridden by environment variables
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty-printed JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| QuicError::Config(format!("Failed to serialize to JSON: {}", e)))?;
        std::fs::write(path, contents)
            .map_err(|e| QuicError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        if connection.max_idle_timeout == 0 {
            return Err(QuicError::Config("max_idle_timeout must be greater than 0".to_string()));
        }
        if !(MIN_UDP_PAYLOAD_SIZE..=MAX_DATAGRAM_SIZE as u64).contains(&connection.max_udp_payload_size) {
            return Err(QuicError::Config(format!(
                "max_udp_payload_size must be between {} and {}",
                MIN_UDP_PAYLOAD_SIZE, MAX_DATAGRAM_SIZE
            )));
        }
        if connection.max_streams == 0 {
            return Err(QuicError::Config("max_streams must be greater than 0".to_string()));
        }
        if connection.max_ack_ranges == 0
            || connection.max_packets_per_flush == 0
            || connection.max_datagrams_per_poll == 0
        {
            return Err(QuicError::Config("per-iteration limits must be greater than 0".to_string()));
        }

        if self.stream.send_buffer_size == 0 {
            return Err(QuicError::Config("send_buffer_size must be greater than 0".to_string()));
        }
        if self.stream.receive_window < INITIAL_MAX_STREAM_DATA {
            return Err(QuicError::Config(format!(
                "receive_window must be at least {}",
                INITIAL_MAX_STREAM_DATA
            )));
        }

        let recovery = &self.recovery;
        if recovery.initial_rtt == 0 || recovery.min_rto == 0 {
            return Err(QuicError::Config("initial_rtt and min_rto must be greater than 0".to_string()));
        }
        if recovery.min_rto > recovery.max_rto {
            return Err(QuicError::Config("min_rto must not exceed max_rto".to_string()));
        }
        if recovery.packet_threshold == 0 || recovery.initial_congestion_window == 0 {
            return Err(QuicError::Config(
                "packet_threshold and initial_congestion_window must be greater than 0".to_string(),
            ));
        }

        if self.crypto.backend == CryptoBackend::ChaCha20Poly1305 {
            let key = self.crypto.pre_shared_key.as_deref().unwrap_or_default();
            let valid = key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(QuicError::Config(
                    "pre_shared_key must be 64 hex characters for chacha20_poly1305".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Get duration values
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.max_idle_timeout)
    }

    /// `None` when keep-alives are disabled
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.connection.keep_alive_interval > 0).then(|| Duration::from_millis(self.connection.keep_alive_interval))
    }

    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            send_buffer_size: self.stream.send_buffer_size,
            receive_window: self.stream.receive_window,
        }
    }

    /// Get tracing level
    pub fn tracing_level(&self) -> Level {
        parse_level(&self.logging.level)
    }
}

/// Map a level name to a tracing level, defaulting to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Configuration builder for easier setup
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.max_idle_timeout = timeout.as_millis() as u64;
        self
    }

    /// Set the keep-alive interval, zero disables
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.connection.keep_alive_interval = interval.as_millis() as u64;
        self
    }

    /// Set the per-stream send buffer size
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.config.stream.send_buffer_size = size;
        self
    }

    /// Set the per-stream receive window
    pub fn receive_window(mut self, window: u64) -> Self {
        self.config.stream.receive_window = window;
        self
    }

    /// Enable or disable automatic peer reclamation
    pub fn auto_reclaim(mut self, enabled: bool) -> Self {
        self.config.connection.auto_reclaim = enabled;
        self
    }

    /// Use ChaCha20-Poly1305 with a pre-shared key
    pub fn pre_shared_key<S: Into<String>>(mut self, hex_key: S) -> Self {
        self.config.crypto.backend = CryptoBackend::ChaCha20Poly1305;
        self.config.crypto.pre_shared_key = Some(hex_key.into());
        self
    }

    /// Set log level
    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

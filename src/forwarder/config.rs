//! Forwarder configuration: defaults, file loading, key parsing
//!
//! The configuration file is plain text: one `key = value` per line,
//! `#`-prefixed comments, blank lines ignored, surrounding whitespace
//! trimmed. Unknown keys and malformed values warn and are skipped; a
//! missing file warns and leaves every default in place.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CONNECTION_POOL_SIZE, DEFAULT_CONNECTION_TIMEOUT_SECS,
    DEFAULT_FAST_RECONNECT_MIN_AGE_SECS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_MAX_CLIENTS,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_MAX_RETRANSMITS, DEFAULT_RDP_PORT,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_RECONNECT_INTERVAL_SECS, DEFAULT_RETRANSMIT_TIMEOUT_MS,
    DEFAULT_SOCKET_TIMEOUT_SECS, DEFAULT_STATS_INTERVAL_SECS, DEFAULT_UDP_PREFERENCE,
};
use crate::transport::{HtpConfig, TransportMode};

/// Runtime options for the forwarder and its hybrid transport endpoints
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Target host every accepted client is forwarded to
    pub target_ip: IpAddr,
    pub target_port: u16,
    pub listen_port: u16,
    pub listen_interface: IpAddr,

    /// Bound on concurrently active connection pairs
    pub max_clients: usize,
    /// Idle timeout after which a pair is cleaned up regardless of state
    pub connection_timeout: Duration,
    /// Spacing between successive target reconnect attempts
    pub reconnect_interval: Duration,
    /// Scratch buffer size for socket-to-socket forwarding
    pub buffer_size: usize,
    /// Send/receive timeout applied to tuned TCP sockets; `None` disables
    pub socket_timeout: Option<Duration>,

    pub verbose_logging: bool,
    pub enable_stats: bool,
    pub stats_interval: Duration,
    /// Extra log sink; logs always go to stdout as well
    pub log_file: Option<PathBuf>,

    pub transport_mode: TransportMode,
    /// Clamped to [0, 1] on load
    pub udp_preference: f32,
    pub retransmit_timeout: Duration,
    pub max_retransmit: u32,
    pub heartbeat_interval: Duration,

    pub enable_fast_reconnect: bool,
    /// Keep the target side open when a client drops
    pub keep_target_alive: bool,
    /// Delay before the first target reconnect attempt
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// How many warm disconnected pairs are retained for reuse
    pub connection_pool_size: usize,
    /// Minimum pair age before a client drop qualifies for fast reconnect
    pub fast_reconnect_min_age: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            target_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 192, 100)),
            target_port: DEFAULT_RDP_PORT,
            listen_port: DEFAULT_RDP_PORT,
            listen_interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_clients: DEFAULT_MAX_CLIENTS,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECS),
            buffer_size: DEFAULT_BUFFER_SIZE,
            socket_timeout: Some(Duration::from_secs(DEFAULT_SOCKET_TIMEOUT_SECS)),
            verbose_logging: true,
            enable_stats: true,
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            log_file: None,
            transport_mode: TransportMode::TcpOnly,
            udp_preference: DEFAULT_UDP_PREFERENCE,
            retransmit_timeout: Duration::from_millis(DEFAULT_RETRANSMIT_TIMEOUT_MS),
            max_retransmit: DEFAULT_MAX_RETRANSMITS,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            enable_fast_reconnect: false,
            keep_target_alive: true,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connection_pool_size: DEFAULT_CONNECTION_POOL_SIZE,
            fast_reconnect_min_age: Duration::from_secs(DEFAULT_FAST_RECONNECT_MIN_AGE_SECS),
        }
    }
}

impl ForwarderConfig {
    /// Load from `path`, falling back to defaults with a warning when the
    /// file cannot be read
    pub fn load(path: &Path) -> Self {
        let mut config = Self::default();
        config.apply_file(path);
        config
    }

    /// Apply `path` on top of the current values; an unreadable file warns
    /// and changes nothing
    pub fn apply_file(&mut self, path: &Path) {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                self.apply(&text);
                info!("configuration loaded from {}", path.display());
            }
            Err(e) => {
                warn!("cannot open config file {} ({}), using current settings", path.display(), e);
            }
        }
    }

    /// Apply `key = value` lines from `text` on top of the current values
    pub fn apply(&mut self, text: &str) {
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("invalid config line {}: {}", index + 1, line);
                continue;
            };
            self.apply_key(key.trim(), value.trim());
        }
    }

    fn apply_key(&mut self, key: &str, value: &str) {
        match key {
            "target_ip" => set(key, value, &mut self.target_ip),
            "target_port" => set(key, value, &mut self.target_port),
            "listen_port" => set(key, value, &mut self.listen_port),
            "listen_interface" => set(key, value, &mut self.listen_interface),
            "max_clients" => set(key, value, &mut self.max_clients),
            "connection_timeout" => set_secs(key, value, &mut self.connection_timeout),
            "reconnect_interval" => set_secs(key, value, &mut self.reconnect_interval),
            "buffer_size" => set(key, value, &mut self.buffer_size),
            "socket_timeout" => {
                if let Some(secs) = parse::<u64>(key, value) {
                    self.socket_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
            }
            "verbose_logging" => set_flag(key, value, &mut self.verbose_logging),
            "enable_stats" => set_flag(key, value, &mut self.enable_stats),
            "stats_interval" => set_secs(key, value, &mut self.stats_interval),
            "log_file" => {
                self.log_file = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "transport_mode" => match TransportMode::parse(value) {
                Some(mode) => self.transport_mode = mode,
                None => warn!("unknown transport_mode '{}', keeping {}", value, self.transport_mode),
            },
            "udp_preference" => {
                if let Some(preference) = parse::<f32>(key, value) {
                    self.udp_preference = preference.clamp(0.0, 1.0);
                }
            }
            "retransmit_timeout" => set_millis(key, value, &mut self.retransmit_timeout),
            "max_retransmit" => set(key, value, &mut self.max_retransmit),
            "heartbeat_interval" => set_millis(key, value, &mut self.heartbeat_interval),
            "enable_fast_reconnect" => set_flag(key, value, &mut self.enable_fast_reconnect),
            "keep_target_alive" => set_flag(key, value, &mut self.keep_target_alive),
            "reconnect_delay" => set_millis(key, value, &mut self.reconnect_delay),
            "max_reconnect_attempts" => set(key, value, &mut self.max_reconnect_attempts),
            "connection_pool_size" => set(key, value, &mut self.connection_pool_size),
            "fast_reconnect_min_age" => set_secs(key, value, &mut self.fast_reconnect_min_age),
            _ => warn!("unknown config key: {}", key),
        }
    }

    /// Address clients are forwarded to
    pub fn target_addr(&self) -> SocketAddr {
        SocketAddr::new(self.target_ip, self.target_port)
    }

    /// Address the forwarder listens on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_interface, self.listen_port)
    }

    /// Endpoint tuning derived from the forwarder options
    pub fn htp_config(&self) -> HtpConfig {
        HtpConfig {
            retransmit_timeout_ms: self.retransmit_timeout.as_millis() as u64,
            max_retransmits: self.max_retransmit,
            udp_preference: self.udp_preference,
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
            ..HtpConfig::default()
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("invalid value '{}' for {}, keeping current setting", value, key);
            None
        }
    }
}

fn set<T: FromStr>(key: &str, value: &str, slot: &mut T) {
    if let Some(parsed) = parse(key, value) {
        *slot = parsed;
    }
}

fn set_secs(key: &str, value: &str, slot: &mut Duration) {
    if let Some(secs) = parse::<u64>(key, value) {
        *slot = Duration::from_secs(secs);
    }
}

fn set_millis(key: &str, value: &str, slot: &mut Duration) {
    if let Some(millis) = parse::<u64>(key, value) {
        *slot = Duration::from_millis(millis);
    }
}

/// Boolean keys are integers: any nonzero value enables
fn set_flag(key: &str, value: &str, slot: &mut bool) {
    if let Some(flag) = parse::<i64>(key, value) {
        *slot = flag != 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ForwarderConfig::default();
        assert_eq!(config.listen_port, 3389);
        assert_eq!(config.target_port, 3389);
        assert_eq!(config.max_clients, 10);
        assert_eq!(config.transport_mode, TransportMode::TcpOnly);
        assert!(!config.enable_fast_reconnect);
        assert!(config.keep_target_alive);
        assert_eq!(config.fast_reconnect_min_age, Duration::from_secs(5));
    }

    #[test]
    fn test_apply_full_file() {
        let text = "\
# forwarding
target_ip = 10.0.0.5
target_port = 3390
listen_port = 13389
listen_interface = 127.0.0.1

max_clients = 32
connection_timeout = 120
buffer_size = 4096
socket_timeout = 10

verbose_logging = 0
enable_stats = 1
stats_interval = 30
log_file = /tmp/htrelay.log

transport_mode = hybrid
udp_preference = 0.6
retransmit_timeout = 50
max_retransmit = 2
heartbeat_interval = 500

enable_fast_reconnect = 1
keep_target_alive = 1
reconnect_delay = 200
max_reconnect_attempts = 3
connection_pool_size = 4
fast_reconnect_min_age = 2
";
        let mut config = ForwarderConfig::default();
        config.apply(text);

        assert_eq!(config.target_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(config.target_port, 3390);
        assert_eq!(config.listen_port, 13389);
        assert_eq!(config.listen_interface, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.max_clients, 32);
        assert_eq!(config.connection_timeout, Duration::from_secs(120));
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.socket_timeout, Some(Duration::from_secs(10)));
        assert!(!config.verbose_logging);
        assert_eq!(config.stats_interval, Duration::from_secs(30));
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/htrelay.log")));
        assert_eq!(config.transport_mode, TransportMode::Hybrid);
        assert!((config.udp_preference - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.retransmit_timeout, Duration::from_millis(50));
        assert_eq!(config.max_retransmit, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert!(config.enable_fast_reconnect);
        assert_eq!(config.reconnect_delay, Duration::from_millis(200));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.connection_pool_size, 4);
        assert_eq!(config.fast_reconnect_min_age, Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_keys_and_garbage_do_not_abort() {
        let mut config = ForwarderConfig::default();
        config.apply("no_such_key = 1\nnot a key value line\ntarget_port = 4000\n");
        assert_eq!(config.target_port, 4000);
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let mut config = ForwarderConfig::default();
        config.apply("target_port = banana\nmax_clients = -3\ntransport_mode = carrier-pigeon\n");
        assert_eq!(config.target_port, DEFAULT_RDP_PORT);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(config.transport_mode, TransportMode::TcpOnly);
    }

    #[test]
    fn test_udp_preference_is_clamped() {
        let mut config = ForwarderConfig::default();
        config.apply("udp_preference = 1.7\n");
        assert!((config.udp_preference - 1.0).abs() < f32::EPSILON);
        config.apply("udp_preference = -0.4\n");
        assert_eq!(config.udp_preference, 0.0);
    }

    #[test]
    fn test_socket_timeout_zero_disables() {
        let mut config = ForwarderConfig::default();
        config.apply("socket_timeout = 0\n");
        assert_eq!(config.socket_timeout, None);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ForwarderConfig::load(Path::new("/nonexistent/htrelay.conf"));
        assert_eq!(config.listen_port, DEFAULT_RDP_PORT);
    }

    #[test]
    fn test_htp_config_projection() {
        let mut config = ForwarderConfig::default();
        config.apply("retransmit_timeout = 42\nmax_retransmit = 7\nudp_preference = 0.25\n");
        let htp = config.htp_config();
        assert_eq!(htp.retransmit_timeout_ms, 42);
        assert_eq!(htp.max_retransmits, 7);
        assert!((htp.udp_preference - 0.25).abs() < f32::EPSILON);
    }
}

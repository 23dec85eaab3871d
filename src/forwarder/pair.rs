//! Connection-pair lifecycle for the forwarder
//!
//! A pair binds one accepted client socket to one target side, which is
//! either a plain TCP socket or a hybrid transport endpoint. Pairs move
//! through a nine-state lifecycle; a "fast reconnect" path keeps the target
//! side warm across client drops so the next client can reuse it.

use std::io;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::transport::HtpEndpoint;

/// Lifecycle states of a connection pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Init,
    Connecting,
    Connected,
    Active,
    ClientDisconnected,
    TargetDisconnected,
    Reconnecting,
    Error,
    Closing,
}

impl PairState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Active => "active",
            Self::ClientDisconnected => "client_disconnected",
            Self::TargetDisconnected => "target_disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The target side of a pair: direct TCP or hybrid transport
#[derive(Debug)]
pub enum TargetChannel {
    Tcp(TcpStream),
    Htp(HtpEndpoint),
}

impl TargetChannel {
    /// True when the channel can still carry traffic
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Tcp(_) => true,
            Self::Htp(endpoint) => endpoint.is_connected(),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Htp(_) => "hybrid",
        }
    }
}

/// One client session bound to one target session
#[derive(Debug)]
pub struct ConnectionPair {
    pub client: Option<TcpStream>,
    pub target: Option<TargetChannel>,

    state: PairState,
    verbose: bool,
    started_at: Instant,
    state_changed_at: Instant,
    last_activity: Instant,

    /// Bytes forwarded client → target
    pub bytes_sent: u64,
    /// Bytes forwarded target → client
    pub bytes_received: u64,

    last_error: Option<String>,
    error_count: u32,
    pub reconnect_attempts: u32,
    pub disconnect_time: Option<Instant>,
    pub last_reconnect_attempt: Option<Instant>,
}

impl ConnectionPair {
    pub fn new(client: TcpStream, verbose: bool) -> Self {
        let now = Instant::now();
        Self {
            client: Some(client),
            target: None,
            state: PairState::Init,
            verbose,
            started_at: now,
            state_changed_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            last_error: None,
            error_count: 0,
            reconnect_attempts: 0,
            disconnect_time: None,
            last_reconnect_attempt: None,
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Transition to `new_state`, logging the change with its reason.
    /// Entering [`PairState::Error`] records the reason as the last error.
    pub fn set_state(&mut self, new_state: PairState, reason: &str) {
        if self.state == new_state {
            return;
        }
        if self.verbose {
            info!("connection state changed: {} -> {} ({})", self.state, new_state, reason);
        } else {
            debug!("connection state changed: {} -> {} ({})", self.state, new_state, reason);
        }
        if new_state == PairState::Error {
            self.last_error = Some(reason.to_string());
            self.error_count += 1;
        }
        self.state = new_state;
        self.state_changed_at = Instant::now();
    }

    /// Refresh the activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the pair was created or last reset for reuse
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time since the last forwarded byte or reset
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// True when the target side exists and can carry traffic
    pub fn target_ready(&self) -> bool {
        self.target.as_ref().is_some_and(|t| t.is_ready())
    }

    /// Eligible to adopt a new client: the old client is gone, the target
    /// side is still warm, and reconnect attempts are not exhausted
    pub fn is_reusable(&self, max_reconnect_attempts: u32) -> bool {
        self.state == PairState::ClientDisconnected
            && self.target_ready()
            && self.reconnect_attempts < max_reconnect_attempts
    }

    /// Handle a clean client drop under fast reconnect: release the client
    /// socket, optionally keep the target side warm, and become reusable.
    pub fn handle_client_disconnect(&mut self, keep_target_alive: bool) {
        info!("client disconnected, preparing for fast reconnect");
        self.client = None;
        self.disconnect_time = Some(Instant::now());
        self.reconnect_attempts = 0;
        self.last_reconnect_attempt = None;

        if keep_target_alive {
            info!("keeping target connection alive for fast reconnect");
        } else if let Some(target) = self.target.take() {
            if let TargetChannel::Htp(mut endpoint) = target {
                let _ = endpoint.disconnect();
            }
        }

        self.set_state(PairState::ClientDisconnected, "client closed its connection");
    }

    /// Adopt a new client socket, preserving the warm target side.
    /// Byte counters and timestamps restart; the target side is untouched.
    pub fn adopt_client(&mut self, client: TcpStream) {
        let now = Instant::now();
        self.client = Some(client);
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.started_at = now;
        self.last_activity = now;
        self.disconnect_time = None;
        self.reconnect_attempts = 0;
        self.last_reconnect_attempt = None;

        self.set_state(PairState::Connecting, "new client adopted via fast reconnect");
        if self.target_ready() {
            self.set_state(PairState::Connected, "target side still warm");
        }
    }

    /// Log an I/O failure with its side and mapped cause, then transition
    /// to the matching half-open state
    pub fn record_io_error(&mut self, err: &io::Error, context: &str, client_side: bool) {
        let side = if client_side { "client" } else { "target" };
        let hint = cause_hint(err.kind());
        let transport = self.target.as_ref().map_or("tcp", |t| t.describe());

        error!(
            "{} {} error: {}{} [state: {}, transport: {}, duration: {}s, sent: {} bytes, received: {} bytes]",
            context,
            side,
            err,
            hint,
            self.state,
            transport,
            self.age().as_secs(),
            self.bytes_sent,
            self.bytes_received,
        );

        let reason = format!("{} {} error: {}{}", context, side, err, hint);
        if client_side {
            self.set_state(PairState::ClientDisconnected, &reason);
        } else {
            self.set_state(PairState::TargetDisconnected, &reason);
        }
    }

    /// One-line status report for the periodic connection survey
    pub fn log_status(&self, index: usize) {
        info!(
            "connection {} status: state={}, duration={}s, state_duration={}s, errors={}, sent={}, received={}",
            index,
            self.state,
            self.age().as_secs(),
            self.state_changed_at.elapsed().as_secs(),
            self.error_count,
            self.bytes_sent,
            self.bytes_received,
        );
        if let Some(last_error) = &self.last_error {
            info!("connection {} last error: {}", index, last_error);
        }
        if let Some(TargetChannel::Htp(endpoint)) = &self.target {
            let stats = endpoint.stats();
            info!(
                "connection {} transport: sent={}, received={}, lost={}, retransmitted={}, rtt_avg={}ms, loss={:.1}%, udp={:.0}%",
                index,
                stats.packets_sent,
                stats.packets_received,
                stats.packets_lost,
                stats.packets_retransmitted,
                stats.rtt_avg_ms,
                stats.loss_rate() * 100.0,
                stats.udp_ratio() * 100.0,
            );
        }
    }
}

/// Human-readable cause for the usual socket failure modes
fn cause_hint(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::ConnectionReset => " (connection forcibly closed by remote host)",
        io::ErrorKind::TimedOut => " (connection timed out)",
        io::ErrorKind::ConnectionRefused => " (connection refused by remote host)",
        io::ErrorKind::NetworkUnreachable => " (network unreachable)",
        io::ErrorKind::HostUnreachable => " (host unreachable)",
        io::ErrorKind::BrokenPipe => " (peer went away mid-write)",
        _ => "",
    }
}

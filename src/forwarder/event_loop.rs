//! Single-threaded event loop driving the listener and every connection pair
//!
//! One readiness wait per iteration covers the listening socket, each
//! pair's client socket, each plain pair's target socket, and both sockets
//! of each hybrid pair's endpoint. Wake-ups drive accepts (with the
//! fast-reconnect reuse search), bidirectional forwarding, per-pair timeout
//! checks, endpoint packet pumps, and the periodic statistics report. All
//! state is owned by the loop; there are no locks and no background
//! threads.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{setsockopt, sockopt};
use tracing::{debug, error, info, trace, warn};

use crate::constants::{POLL_INTERVAL_MS, WRITE_RETRY_DELAY_MS};
use crate::error::Result;
use crate::forwarder::config::ForwarderConfig;
use crate::forwarder::pair::{ConnectionPair, PairState, TargetChannel};
use crate::forwarder::stats::ForwarderStats;
use crate::socket_error;
use crate::transport::{HtpRuntime, TransportMode};

/// What to do with a pair after driving it for one iteration
enum PairDisposition {
    Keep,
    Close,
    /// The client went away cleanly and the pair qualifies for fast
    /// reconnect
    ClientGone,
}

/// Outcome of forwarding one direction of a plain TCP pair
enum ForwardStatus {
    Transferred,
    Idle,
    ClientGone,
    PeerClosed,
    Failed,
}

/// The forwarder: listener, bounded pair pool, statistics, and the
/// endpoint runtime, all owned by the loop thread
pub struct Forwarder {
    config: ForwarderConfig,
    listener: TcpListener,
    pairs: Vec<ConnectionPair>,
    stats: ForwarderStats,
    runtime: HtpRuntime,
    /// Scratch buffer reused for every forwarding read
    buffer: Vec<u8>,
}

impl Forwarder {
    /// Bind the listening socket and prepare an empty pool
    pub fn new(config: ForwarderConfig) -> Result<Self> {
        let listen_addr = config.listen_addr();
        let listener = TcpListener::bind(listen_addr)
            .map_err(|e| socket_error!("failed to bind {}: {}", listen_addr, e))?;
        listener.set_nonblocking(true)?;

        let runtime = HtpRuntime::new(config.htp_config());
        let buffer = vec![0u8; config.buffer_size.max(1)];

        Ok(Self {
            config,
            listener,
            pairs: Vec::new(),
            stats: ForwarderStats::new(),
            runtime,
            buffer,
        })
    }

    /// Actual listening address; useful when the config asked for port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    pub fn pairs(&self) -> &[ConnectionPair] {
        &self.pairs
    }

    /// Run until `stop` is raised, then close every pair in reverse order
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        info!(
            "forwarder started, listening on {}, forwarding to {} ({} transport)",
            self.local_addr()?,
            self.config.target_addr(),
            self.config.transport_mode,
        );

        while !stop.load(Ordering::Relaxed) {
            if self.config.enable_stats && self.stats.due(self.config.stats_interval) {
                self.stats.report(&self.pairs, self.config.verbose_logging);
            }

            if self.config.enable_fast_reconnect {
                self.reconnect_pass();
            }

            let ready = self.wait_ready()?;

            if ready.contains(&self.listener.as_raw_fd()) {
                self.accept_ready();
            }

            self.service_pairs(&ready);
        }

        self.shutdown();
        Ok(())
    }

    /// One readiness wait over every socket the loop owns.
    ///
    /// Target sockets of pairs waiting for a new client are left out: their
    /// buffered bytes must survive untouched until reuse. Hybrid endpoints
    /// stay registered since their packet pump drains them safely.
    fn wait_ready(&mut self) -> Result<HashSet<RawFd>> {
        let mut fds: Vec<RawFd> = Vec::with_capacity(1 + self.pairs.len() * 2);
        fds.push(self.listener.as_raw_fd());
        for pair in &self.pairs {
            if let Some(client) = &pair.client {
                fds.push(client.as_raw_fd());
            }
            match &pair.target {
                Some(TargetChannel::Tcp(target)) if pair.client.is_some() => {
                    fds.push(target.as_raw_fd());
                }
                Some(TargetChannel::Htp(endpoint)) => {
                    if let Some(fd) = endpoint.datagram_raw_fd() {
                        fds.push(fd);
                    }
                    if let Some(fd) = endpoint.stream_raw_fd() {
                        fds.push(fd);
                    }
                }
                _ => {}
            }
        }

        let mut poll_fds: Vec<PollFd> = fds
            .iter()
            .map(|&fd| {
                // SAFETY: every fd here belongs to the listener or to a
                // socket stored in self.pairs, all of which outlive this
                // call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN)
            })
            .collect();

        match poll(&mut poll_fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => Ok(HashSet::new()),
            Ok(_) => {
                let interesting = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
                Ok(fds
                    .iter()
                    .zip(&poll_fds)
                    .filter(|(_, p)| p.revents().is_some_and(|r| r.intersects(interesting)))
                    .map(|(&fd, _)| fd)
                    .collect())
            }
            Err(nix::errno::Errno::EINTR) => Ok(HashSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain the accept queue: reuse a warm pair when possible, otherwise
    /// open a fresh target, rejecting once the pool is full
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((client, peer)) => self.handle_accept(client, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_accept(&mut self, client: TcpStream, peer: SocketAddr) {
        if self.config.enable_fast_reconnect {
            let reusable = self
                .pairs
                .iter()
                .position(|p| p.is_reusable(self.config.max_reconnect_attempts));
            if let Some(index) = reusable {
                tune_stream(&client, &self.config);
                self.pairs[index].adopt_client(client);
                info!(
                    "fast reconnect successful: {} -> {} (reusing pair {})",
                    peer,
                    self.config.target_addr(),
                    index,
                );
                return;
            }
        }

        if self.pairs.len() >= self.config.max_clients {
            // Dropping the socket closes it; nothing leaks.
            warn!("maximum connections reached, rejecting {}", peer);
            return;
        }

        tune_stream(&client, &self.config);
        let mut pair = ConnectionPair::new(client, self.config.verbose_logging);
        pair.set_state(PairState::Connecting, "new client connection");

        match Self::open_target(&self.config, &mut self.runtime) {
            Ok(target) => {
                let transport = target.describe();
                pair.target = Some(target);
                pair.set_state(PairState::Connected, "target connection established");
                self.stats.record_connection();
                info!(
                    "new connection {} established ({}): {} -> {}",
                    self.pairs.len(),
                    transport,
                    peer,
                    self.config.target_addr(),
                );
                self.pairs.push(pair);
            }
            Err(e) => {
                error!("failed to connect to target {}: {}", self.config.target_addr(), e);
                // The pair (and the client socket) drop here.
            }
        }
    }

    /// Open the target side: hybrid transport when the mode allows it,
    /// falling back to plain TCP
    fn open_target(config: &ForwarderConfig, runtime: &mut HtpRuntime) -> Result<TargetChannel> {
        let target_addr = config.target_addr();

        if config.transport_mode != TransportMode::TcpOnly {
            let mut endpoint = runtime.endpoint(target_addr, config.transport_mode);
            match endpoint.connect() {
                Ok(()) => {
                    info!("hybrid transport connection established to {}", target_addr);
                    return Ok(TargetChannel::Htp(endpoint));
                }
                Err(e) => {
                    warn!("hybrid transport to {} failed ({}), falling back to tcp", target_addr, e);
                }
            }
        }

        let stream = match config.socket_timeout {
            Some(timeout) => TcpStream::connect_timeout(&target_addr, timeout)?,
            None => TcpStream::connect(target_addr)?,
        };
        tune_stream(&stream, config);
        Ok(TargetChannel::Tcp(stream))
    }

    /// Retry warm pairs whose target side went away, honoring the
    /// reconnect delay and spacing; exhausted pairs are closed
    fn reconnect_pass(&mut self) {
        let mut index = 0;
        while index < self.pairs.len() {
            let due = {
                let pair = &self.pairs[index];
                pair.state() == PairState::ClientDisconnected
                    && !pair.target_ready()
                    && pair
                        .disconnect_time
                        .is_some_and(|t| t.elapsed() >= self.config.reconnect_delay)
                    && pair
                        .last_reconnect_attempt
                        .map_or(true, |t| t.elapsed() >= self.config.reconnect_interval)
            };
            if due && !self.try_reconnect_target(index) {
                self.cleanup_pair(index);
                continue;
            }
            index += 1;
        }
    }

    /// Attempt to rebuild one pair's target side; returns false once the
    /// pair has used up its attempts and must close
    fn try_reconnect_target(&mut self, index: usize) -> bool {
        {
            let pair = &mut self.pairs[index];
            pair.reconnect_attempts += 1;
            pair.last_reconnect_attempt = Some(Instant::now());
            if pair.reconnect_attempts > self.config.max_reconnect_attempts {
                warn!("max reconnect attempts reached, giving up on pair {}", index);
                pair.set_state(PairState::Closing, "reconnect attempts exhausted");
                return false;
            }
            pair.set_state(PairState::Reconnecting, "reconnecting to target");
            info!(
                "reconnecting to target (attempt {}/{})",
                pair.reconnect_attempts, self.config.max_reconnect_attempts,
            );
        }

        match Self::open_target(&self.config, &mut self.runtime) {
            Ok(target) => {
                let pair = &mut self.pairs[index];
                pair.target = Some(target);
                pair.set_state(PairState::ClientDisconnected, "target reconnected, awaiting client");
                info!("target reconnection successful");
            }
            Err(e) => {
                error!("target reconnection failed: {}", e);
                self.pairs[index]
                    .set_state(PairState::ClientDisconnected, "target reconnection failed");
            }
        }
        true
    }

    /// Timeout checks and forwarding for every pair; cleanup compacts the
    /// pool with swap-removal, so readiness stays keyed by descriptor
    fn service_pairs(&mut self, ready: &HashSet<RawFd>) {
        let mut index = 0;
        while index < self.pairs.len() {
            if self.pairs[index].idle_for() > self.config.connection_timeout {
                info!("connection {} timed out", index);
                self.cleanup_pair(index);
                continue;
            }

            match self.drive_pair(index, ready) {
                PairDisposition::Keep => index += 1,
                PairDisposition::Close => {
                    self.cleanup_pair(index);
                }
                PairDisposition::ClientGone => {
                    let warm = self
                        .pairs
                        .iter()
                        .enumerate()
                        .filter(|(i, p)| *i != index && p.state() == PairState::ClientDisconnected)
                        .count();
                    if warm >= self.config.connection_pool_size {
                        info!("warm pair pool is full, closing connection {}", index);
                        self.cleanup_pair(index);
                    } else {
                        let keep_target = self.config.keep_target_alive;
                        self.pairs[index].handle_client_disconnect(keep_target);
                        index += 1;
                    }
                }
            }
        }
    }

    /// Forward both directions of one pair and pump its endpoint
    fn drive_pair(&mut self, index: usize, ready: &HashSet<RawFd>) -> PairDisposition {
        let client_ready = self.pairs[index]
            .client
            .as_ref()
            .is_some_and(|c| ready.contains(&c.as_raw_fd()));

        // Both sides are taken out of the pair so its bookkeeping methods
        // stay callable while the sockets are borrowed.
        let mut client = self.pairs[index].client.take();
        let mut target = self.pairs[index].target.take();
        let pair = &mut self.pairs[index];

        let disposition = match &mut target {
            None => PairDisposition::Keep,
            Some(TargetChannel::Tcp(stream)) => {
                let target_ready = ready.contains(&stream.as_raw_fd());
                drive_plain(
                    &self.config,
                    pair,
                    &mut client,
                    stream,
                    &mut self.buffer,
                    client_ready,
                    target_ready,
                )
            }
            Some(TargetChannel::Htp(endpoint)) => drive_hybrid(
                &self.config,
                pair,
                &mut client,
                endpoint,
                &mut self.buffer,
                client_ready,
            ),
        };

        pair.client = client;
        pair.target = target;
        disposition
    }

    /// Close one pair, fold its counters into the totals, and compact the
    /// pool. Relative order of the remaining pairs is not preserved.
    fn cleanup_pair(&mut self, index: usize) {
        let mut pair = self.pairs.swap_remove(index);
        pair.set_state(PairState::Closing, "connection cleanup");
        if self.config.verbose_logging {
            pair.log_status(index);
        }
        info!(
            "cleaning up connection {} (sent: {} bytes, received: {} bytes)",
            index, pair.bytes_sent, pair.bytes_received,
        );

        if let Some(TargetChannel::Htp(mut endpoint)) = pair.target.take() {
            let _ = endpoint.disconnect();
        }
        self.stats.absorb_pair(&pair);
        // Remaining sockets close on drop.
    }

    /// Close every pair in reverse order and report final totals
    fn shutdown(&mut self) {
        info!("cleaning up {} active connections...", self.pairs.len());
        for index in (0..self.pairs.len()).rev() {
            self.cleanup_pair(index);
        }
        if self.config.enable_stats {
            self.stats.report(&self.pairs, false);
        }
        info!("forwarder shutdown complete");
    }
}

/// Apply the RDP-friendly socket tuning to an accepted or connected stream:
/// no Nagle delay, keep-alive probes, non-blocking mode, and the configured
/// send/receive timeouts
fn tune_stream(stream: &TcpStream, config: &ForwarderConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", e);
    }
    if let Err(e) = setsockopt(stream, sockopt::KeepAlive, &true) {
        warn!("failed to set SO_KEEPALIVE: {}", e);
    }
    if let Err(e) = stream.set_nonblocking(true) {
        warn!("failed to set socket non-blocking: {}", e);
    }
    if let Some(timeout) = config.socket_timeout {
        if let Err(e) = stream.set_read_timeout(Some(timeout)) {
            warn!("failed to set receive timeout: {}", e);
        }
        if let Err(e) = stream.set_write_timeout(Some(timeout)) {
            warn!("failed to set send timeout: {}", e);
        }
    }
}

/// Drive a plain TCP pair: client → target, then target → client
fn drive_plain(
    config: &ForwarderConfig,
    pair: &mut ConnectionPair,
    client: &mut Option<TcpStream>,
    target: &mut TcpStream,
    buffer: &mut [u8],
    client_ready: bool,
    target_ready: bool,
) -> PairDisposition {
    let Some(client) = client.as_mut() else {
        return PairDisposition::Keep;
    };

    if client_ready {
        match forward_tcp(config, pair, client, target, true, buffer) {
            ForwardStatus::Transferred | ForwardStatus::Idle => {}
            ForwardStatus::ClientGone => return PairDisposition::ClientGone,
            ForwardStatus::PeerClosed | ForwardStatus::Failed => return PairDisposition::Close,
        }
    }

    if target_ready {
        match forward_tcp(config, pair, target, client, false, buffer) {
            ForwardStatus::Transferred | ForwardStatus::Idle => {}
            _ => return PairDisposition::Close,
        }
    }

    PairDisposition::Keep
}

/// Read once from `src` and drain the bytes into `dst`.
///
/// Would-block on the read yields back to the loop; would-block on the
/// write retries after a brief pause until the buffer is drained, because
/// a partial forward would corrupt the stream.
fn forward_tcp(
    config: &ForwarderConfig,
    pair: &mut ConnectionPair,
    src: &mut TcpStream,
    dst: &mut TcpStream,
    from_client: bool,
    buffer: &mut [u8],
) -> ForwardStatus {
    let side = if from_client { "client" } else { "target" };

    let n = match src.read(buffer) {
        Ok(0) => {
            info!("connection closed by {}", side);
            if from_client {
                if config.enable_fast_reconnect && pair.age() > config.fast_reconnect_min_age {
                    return ForwardStatus::ClientGone;
                }
            } else {
                pair.set_state(PairState::TargetDisconnected, "target closed the connection");
            }
            return ForwardStatus::PeerClosed;
        }
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ForwardStatus::Idle,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return ForwardStatus::Idle,
        Err(e) => {
            pair.record_io_error(&e, "recv", from_client);
            return ForwardStatus::Failed;
        }
    };

    let mut written = 0;
    while written < n {
        match dst.write(&buffer[written..n]) {
            Ok(0) => {
                warn!("write returned 0, connection may be closed");
                return ForwardStatus::Failed;
            }
            Ok(sent) => written += sent,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(WRITE_RETRY_DELAY_MS));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                pair.record_io_error(&e, "send", !from_client);
                return ForwardStatus::Failed;
            }
        }
    }

    if from_client {
        pair.bytes_sent += n as u64;
    } else {
        pair.bytes_received += n as u64;
    }
    pair.touch();
    if pair.state() == PairState::Connected {
        pair.set_state(PairState::Active, "data transfer started");
    }

    ForwardStatus::Transferred
}

/// Drive a hybrid pair: shuttle bytes between the client socket and the
/// endpoint, then run the endpoint's packet pump and timer pass
fn drive_hybrid(
    config: &ForwarderConfig,
    pair: &mut ConnectionPair,
    client: &mut Option<TcpStream>,
    endpoint: &mut crate::transport::HtpEndpoint,
    buffer: &mut [u8],
    client_ready: bool,
) -> PairDisposition {
    // Client → endpoint.
    if client_ready {
        if let Some(stream) = client.as_mut() {
            match stream.read(buffer) {
                Ok(0) => {
                    info!("connection closed by client");
                    if config.enable_fast_reconnect && pair.age() > config.fast_reconnect_min_age {
                        return PairDisposition::ClientGone;
                    }
                    return PairDisposition::Close;
                }
                Ok(n) => match endpoint.send_data(&buffer[..n]) {
                    Ok(accepted) => {
                        if accepted < n {
                            debug!("send window full, dropped {} bytes", n - accepted);
                        }
                        pair.bytes_sent += accepted as u64;
                        pair.touch();
                        if pair.state() == PairState::Connected {
                            pair.set_state(PairState::Active, "data transfer started");
                        }
                    }
                    Err(e) => {
                        warn!("hybrid send failed: {}", e);
                        pair.set_state(PairState::Error, "hybrid transport send failed");
                        return PairDisposition::Close;
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    pair.record_io_error(&e, "recv", true);
                    return PairDisposition::Close;
                }
            }
        }
    }

    // Endpoint → client.
    if let Some(stream) = client.as_mut() {
        match endpoint.recv_data(buffer) {
            Ok(0) => {}
            Ok(n) => {
                let mut written = 0;
                while written < n {
                    match stream.write(&buffer[written..n]) {
                        Ok(0) => {
                            warn!("write returned 0, connection may be closed");
                            return PairDisposition::Close;
                        }
                        Ok(sent) => written += sent,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(WRITE_RETRY_DELAY_MS));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            pair.record_io_error(&e, "send", true);
                            return PairDisposition::Close;
                        }
                    }
                }
                pair.bytes_received += n as u64;
                pair.touch();
                if pair.state() == PairState::Connected {
                    pair.set_state(PairState::Active, "data transfer started");
                }
            }
            Err(_) => {
                pair.set_state(PairState::TargetDisconnected, "endpoint closed");
                return PairDisposition::Close;
            }
        }
    }

    // Packet pump and timers run on every pass, client or not.
    if let Err(e) = endpoint.poll_incoming() {
        trace!("endpoint poll failed: {}", e);
    }
    match endpoint.tick() {
        Ok(_) => PairDisposition::Keep,
        Err(_) => {
            pair.set_state(PairState::TargetDisconnected, "endpoint closed");
            PairDisposition::Close
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config() -> ForwarderConfig {
        ForwarderConfig {
            listen_interface: std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            enable_stats: false,
            verbose_logging: false,
            socket_timeout: None,
            ..ForwarderConfig::default()
        }
    }

    #[test]
    fn test_new_binds_requested_interface() {
        let forwarder = Forwarder::new(test_config()).unwrap();
        let addr = forwarder.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let first = Forwarder::new(test_config()).unwrap();
        let config = ForwarderConfig {
            listen_port: first.local_addr().unwrap().port(),
            ..test_config()
        };
        assert!(Forwarder::new(config).is_err());
    }

    #[test]
    fn test_wait_ready_times_out_quietly() {
        let mut forwarder = Forwarder::new(test_config()).unwrap();
        let ready = forwarder.wait_ready().unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_stop_flag_ends_loop() {
        let mut forwarder = Forwarder::new(test_config()).unwrap();
        let stop = AtomicBool::new(true);
        forwarder.run(&stop).unwrap();
        assert!(forwarder.pairs().is_empty());
    }
}

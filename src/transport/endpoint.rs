//! Hybrid transport endpoint: packet pump, acknowledgment, retransmission,
//! heartbeat, and liveness over one UDP and one TCP channel.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::constants::{IDLE_TIMEOUT_MS, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{HtrError, Result};
use crate::transport::buffers::{RecvBuffer, SendBuffer};
use crate::transport::packet::{self, PacketHeader, PacketType};
use crate::transport::selector::should_use_stream_channel;
use crate::transport::stats::EndpointStats;
use crate::transport::{HtpConfig, TransportMode};

/// Construction handle for hybrid transport endpoints.
///
/// Owns the tuning defaults and the seed source; every endpoint it creates
/// gets its own PRNG, so no process-wide state is involved.
#[derive(Debug)]
pub struct HtpRuntime {
    config: HtpConfig,
    rng: fastrand::Rng,
}

impl HtpRuntime {
    pub fn new(config: HtpConfig) -> Self {
        Self {
            config,
            rng: fastrand::Rng::new(),
        }
    }

    /// Runtime with a deterministic seed, for reproducible tests
    pub fn with_seed(config: HtpConfig, seed: u64) -> Self {
        Self {
            config,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    pub fn config(&self) -> &HtpConfig {
        &self.config
    }

    /// Create an endpoint for `remote`; sockets are opened by
    /// [`HtpEndpoint::connect`]
    pub fn endpoint(&mut self, remote: SocketAddr, mode: TransportMode) -> HtpEndpoint {
        HtpEndpoint::new(remote, mode, self.config.clone(), self.rng.u64(..))
    }
}

/// One side of a hybrid transport session
#[derive(Debug)]
pub struct HtpEndpoint {
    remote: SocketAddr,
    mode: TransportMode,
    config: HtpConfig,
    datagram: Option<UdpSocket>,
    stream: Option<TcpStream>,
    connected: bool,
    /// Next sequence to assign; randomized at creation
    send_seq: u32,
    /// Last sequence acknowledged to the peer
    ack_seq: u32,
    send_buffer: SendBuffer,
    recv_buffer: RecvBuffer,
    last_activity: Instant,
    last_heartbeat: Instant,
    stats: EndpointStats,
    rng: fastrand::Rng,
}

impl HtpEndpoint {
    fn new(remote: SocketAddr, mode: TransportMode, config: HtpConfig, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let send_seq = rng.u32(..);
        let send_window = config.send_window as usize;
        let now = Instant::now();
        Self {
            remote,
            mode,
            config,
            datagram: None,
            stream: None,
            connected: false,
            send_seq,
            ack_seq: 0,
            send_buffer: SendBuffer::new(send_window),
            recv_buffer: RecvBuffer::new(),
            last_activity: now,
            last_heartbeat: now,
            stats: EndpointStats::default(),
            rng,
        }
    }

    /// Open the channels the mode calls for and mark the endpoint connected.
    ///
    /// In Hybrid and Auto modes a failed stream connect degrades the
    /// endpoint to the datagram channel alone; in TcpOnly mode it is fatal.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(HtrError::invalid_input("endpoint is already connected"));
        }

        if self.mode.wants_datagram() {
            let bind_addr = if self.remote.is_ipv4() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            } else {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
            };
            let socket = UdpSocket::bind(bind_addr)?;
            socket.set_nonblocking(true)?;
            socket.connect(self.remote)?;
            self.datagram = Some(socket);
        }

        if self.mode.wants_stream() {
            match TcpStream::connect(self.remote) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    self.stream = Some(stream);
                }
                Err(e) if self.mode == TransportMode::TcpOnly => {
                    self.datagram = None;
                    return Err(e.into());
                }
                Err(e) => {
                    debug!("stream channel to {} unavailable, staying on datagram: {}", self.remote, e);
                }
            }
        }

        self.connected = true;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Announce close on every open channel and mark the endpoint
    /// not connected. In-flight unacknowledged data is discarded.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }

        let header = PacketHeader::control_close(self.next_seq());
        let bytes = packet::encode(&header, &[])?;
        if self.datagram.is_some() {
            let _ = self.send_packet(&bytes, false);
        }
        if self.stream.is_some() {
            let _ = self.send_packet(&bytes, true);
        }

        self.connected = false;
        Ok(())
    }

    /// Fragment `data` into Data packets and queue them for reliability.
    ///
    /// Returns the number of bytes accepted, which is less than
    /// `data.len()` when the send window fills (backpressure) or when both
    /// channels reject a fragment after at least one was sent.
    pub fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        if !self.connected {
            return Err(HtrError::EndpointClosed);
        }

        let mut accepted = 0;
        while accepted < data.len() {
            if self.send_buffer.is_full() {
                trace!("send window full, accepting {} of {} bytes", accepted, data.len());
                break;
            }

            let chunk = (data.len() - accepted).min(MAX_PAYLOAD_SIZE);
            let payload = &data[accepted..accepted + chunk];
            let sequence = self.next_seq();
            let header = PacketHeader::data(
                sequence,
                self.ack_seq,
                self.config.recv_window,
                chunk as u16,
            );
            let bytes = packet::encode(&header, payload)?;

            let prefer_stream = should_use_stream_channel(
                self.mode,
                self.config.udp_preference,
                &self.stats,
                &mut self.rng,
            );
            match self.send_preferring(&bytes, prefer_stream) {
                Ok(_) => {}
                Err(e) if accepted == 0 => return Err(e),
                Err(_) => break,
            }

            self.send_buffer.push(sequence, bytes)?;
            accepted += chunk;
        }

        Ok(accepted)
    }

    /// Copy in-order received payload into `buf`; returns bytes written
    pub fn recv_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.connected {
            return Err(HtrError::EndpointClosed);
        }
        Ok(self.recv_buffer.drain(buf))
    }

    /// Drain both channels and dispatch every valid packet.
    ///
    /// The datagram channel is read first because it is lossy and cheap to
    /// drain; invalid packets are discarded silently. Returns the number of
    /// packets processed.
    pub fn poll_incoming(&mut self) -> Result<usize> {
        if !self.connected {
            return Ok(0);
        }

        let mut processed = 0;
        while let Some((header, payload)) = self.read_datagram() {
            self.dispatch(header, payload, false)?;
            processed += 1;
        }
        while let Some((header, payload)) = self.read_stream() {
            self.dispatch(header, payload, true)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run the timer pass: retransmissions, heartbeat, idle detection.
    ///
    /// Returns the number of actions taken, or [`HtrError::EndpointClosed`]
    /// once the idle timeout marks the endpoint not connected.
    pub fn tick(&mut self) -> Result<usize> {
        if !self.connected {
            return Err(HtrError::EndpointClosed);
        }

        let mut actions = 0;

        // Retransmissions prefer the stream channel: the peer already
        // failed to receive these bytes once.
        let sweep = self.send_buffer.sweep(
            Duration::from_millis(self.config.retransmit_timeout_ms),
            self.config.max_retransmits,
        );
        for (sequence, bytes) in sweep.retransmits {
            match self.send_preferring(&bytes, true) {
                Ok(_) => {
                    self.stats.packets_retransmitted += 1;
                    actions += 1;
                    trace!("retransmitted sequence {}", sequence);
                }
                Err(e) => debug!("retransmit of sequence {} failed: {}", sequence, e),
            }
        }
        if sweep.lost > 0 {
            self.stats.packets_lost += sweep.lost;
            actions += sweep.lost as usize;
            debug!("{} packet(s) dropped after retransmit exhaustion", sweep.lost);
        }

        // Heartbeats prefer the datagram channel.
        if self.last_heartbeat.elapsed() > Duration::from_millis(self.config.heartbeat_interval_ms)
        {
            let header = PacketHeader::heartbeat(self.next_seq());
            let bytes = packet::encode(&header, &[])?;
            if self.send_preferring(&bytes, false).is_ok() {
                self.last_heartbeat = Instant::now();
                actions += 1;
            }
        }

        if self.last_activity.elapsed() > Duration::from_millis(IDLE_TIMEOUT_MS) {
            warn!("endpoint to {} idle for over {} ms, closing", self.remote, IDLE_TIMEOUT_MS);
            self.connected = false;
            return Err(HtrError::EndpointClosed);
        }

        Ok(actions)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Next in-order sequence the receive side expects
    pub fn recv_sequence(&self) -> u32 {
        self.recv_buffer.cursor()
    }

    /// Data packets currently awaiting acknowledgment
    pub fn pending_retransmits(&self) -> usize {
        self.send_buffer.len()
    }

    /// Local address of the datagram socket, if one is open
    pub fn datagram_local_addr(&self) -> Option<SocketAddr> {
        self.datagram.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Raw descriptor of the datagram socket for readiness polling
    pub fn datagram_raw_fd(&self) -> Option<RawFd> {
        self.datagram.as_ref().map(|s| s.as_raw_fd())
    }

    /// Raw descriptor of the stream socket for readiness polling
    pub fn stream_raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn next_seq(&mut self) -> u32 {
        let sequence = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        sequence
    }

    /// Send raw packet bytes on one channel, updating counters on success
    fn send_packet(&mut self, bytes: &[u8], use_stream: bool) -> Result<usize> {
        let sent = if use_stream {
            match self.stream.as_mut() {
                Some(stream) => stream.write(bytes)?,
                None => return Err(HtrError::socket("stream channel is not open")),
            }
        } else {
            match self.datagram.as_ref() {
                Some(socket) => socket.send(bytes)?,
                None => return Err(HtrError::socket("datagram channel is not open")),
            }
        };

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += sent as u64;
        if use_stream {
            self.stats.stream_packets += 1;
        } else {
            self.stats.datagram_packets += 1;
        }
        self.last_activity = Instant::now();
        Ok(sent)
    }

    /// Try the preferred channel first, then the other one
    fn send_preferring(&mut self, bytes: &[u8], prefer_stream: bool) -> Result<usize> {
        match self.send_packet(bytes, prefer_stream) {
            Ok(n) => Ok(n),
            Err(first) => match self.send_packet(bytes, !prefer_stream) {
                Ok(n) => Ok(n),
                Err(_) => Err(first),
            },
        }
    }

    /// Non-blocking read of one valid packet from the datagram channel
    fn read_datagram(&mut self) -> Option<(PacketHeader, Vec<u8>)> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let socket = self.datagram.as_ref()?;
            match socket.recv(&mut buf) {
                Ok(len) => {
                    if let Some(parsed) = self.accept_packet(&buf[..len]) {
                        return Some(parsed);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    debug!("datagram recv from {} failed: {}", self.remote, e);
                    return None;
                }
            }
        }
    }

    /// Non-blocking read of one valid packet from the stream channel
    fn read_stream(&mut self) -> Option<(PacketHeader, Vec<u8>)> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let stream = self.stream.as_mut()?;
            match stream.read(&mut buf) {
                Ok(0) => {
                    debug!("stream channel to {} closed by peer", self.remote);
                    self.stream = None;
                    return None;
                }
                Ok(len) => {
                    if let Some(parsed) = self.accept_packet(&buf[..len]) {
                        return Some(parsed);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    debug!("stream recv from {} failed: {}", self.remote, e);
                    return None;
                }
            }
        }
    }

    /// Validate raw bytes; count and timestamp valid packets only
    fn accept_packet(&mut self, bytes: &[u8]) -> Option<(PacketHeader, Vec<u8>)> {
        match packet::decode(bytes) {
            Ok((header, payload)) => {
                self.stats.packets_received += 1;
                self.stats.bytes_received += bytes.len() as u64;
                self.last_activity = Instant::now();
                Some((header, payload.to_vec()))
            }
            Err(e) => {
                trace!("discarding packet from {}: {}", self.remote, e);
                None
            }
        }
    }

    /// Route one valid packet by type
    fn dispatch(&mut self, header: PacketHeader, payload: Vec<u8>, from_stream: bool) -> Result<()> {
        match header.packet_type {
            PacketType::Data => {
                // Acknowledge on the channel the packet arrived on.
                let ack = PacketHeader::ack(self.next_seq(), header.sequence);
                let bytes = packet::encode(&ack, &[])?;
                if let Err(e) = self.send_packet(&bytes, from_stream) {
                    debug!("ack for sequence {} failed: {}", header.sequence, e);
                }
                self.ack_seq = header.sequence;
                self.recv_buffer.insert(header.sequence, payload);
            }
            PacketType::Ack => {
                if let Some(entry) = self.send_buffer.ack(header.ack_sequence) {
                    let rtt = entry.first_send_time.elapsed().as_millis() as u32;
                    self.stats.record_rtt(rtt);
                }
            }
            PacketType::Heartbeat => {
                self.last_activity = Instant::now();
            }
            PacketType::Control => {
                if header.is_close() {
                    debug!("peer {} announced close", self.remote);
                    self.connected = false;
                }
            }
            // Reserved types; tolerated but not acted upon.
            PacketType::Nack | PacketType::RetransmitRequest => {}
        }
        Ok(())
    }
}

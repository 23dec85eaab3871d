//! End-to-end forwarder scenarios over loopback sockets
//!
//! Each test runs a real event loop in a background thread against a local
//! echo server, drives it with plain TCP clients, and inspects the
//! forwarder state after a graceful stop.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, sleep, JoinHandle};
use std::time::{Duration, Instant};

use htrelay::{Forwarder, ForwarderConfig, TransportMode};

/// Echo server on loopback; counts accepted connections
fn spawn_echo() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, accepted)
}

fn forwarder_config(target: SocketAddr) -> ForwarderConfig {
    ForwarderConfig {
        target_ip: target.ip(),
        target_port: target.port(),
        listen_interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        transport_mode: TransportMode::TcpOnly,
        enable_stats: false,
        verbose_logging: false,
        socket_timeout: None,
        ..ForwarderConfig::default()
    }
}

/// Run the loop in a thread; the handle returns the forwarder after stop
fn spawn_forwarder(config: ForwarderConfig) -> (SocketAddr, Arc<AtomicBool>, JoinHandle<Forwarder>) {
    let mut forwarder = Forwarder::new(config).unwrap();
    let addr = forwarder.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let handle = thread::spawn(move || {
        forwarder.run(&stop_flag).unwrap();
        forwarder
    });
    (addr, stop, handle)
}

fn stop_forwarder(stop: &AtomicBool, handle: JoinHandle<Forwarder>) -> Forwarder {
    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap()
}

/// Read until `n` bytes arrive or the deadline passes
fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 1024];
    while out.len() < n && Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => out.extend_from_slice(&buf[..read]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("client read failed: {}", e),
        }
    }
    out
}

#[test]
fn test_tcp_forward_round_trip() {
    let (echo_addr, _accepted) = spawn_echo();
    let (addr, stop, handle) = spawn_forwarder(forwarder_config(echo_addr));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"ABCDEF").unwrap();
    let echoed = read_exactly(&mut client, 6);
    assert_eq!(echoed, b"ABCDEF");

    drop(client);
    let forwarder = stop_forwarder(&stop, handle);
    assert_eq!(forwarder.stats().total_connections, 1);
    assert!(forwarder.stats().total_bytes_sent(forwarder.pairs()) >= 6);
    assert!(forwarder.stats().total_bytes_received(forwarder.pairs()) >= 6);
}

#[test]
fn test_fast_reconnect_preserves_target() {
    let (echo_addr, accepted) = spawn_echo();
    let config = ForwarderConfig {
        enable_fast_reconnect: true,
        keep_target_alive: true,
        // Skip the handshake grace period so the test needs no 5 s wait.
        fast_reconnect_min_age: Duration::ZERO,
        ..forwarder_config(echo_addr)
    };
    let (addr, stop, handle) = spawn_forwarder(config);

    let mut first = TcpStream::connect(addr).unwrap();
    first.write_all(b"hello").unwrap();
    assert_eq!(read_exactly(&mut first, 5), b"hello");
    drop(first);

    // Give the loop time to classify the drop and park the warm pair.
    sleep(Duration::from_millis(400));

    let mut second = TcpStream::connect(addr).unwrap();
    second.write_all(b"world").unwrap();
    assert_eq!(read_exactly(&mut second, 5), b"world");
    drop(second);

    let forwarder = stop_forwarder(&stop, handle);
    assert_eq!(
        accepted.load(Ordering::SeqCst),
        1,
        "the target connection must be reused across client sessions",
    );
    assert_eq!(forwarder.stats().total_connections, 1);
}

#[test]
fn test_pool_bound_rejects_excess_clients() {
    let (echo_addr, _accepted) = spawn_echo();
    let config = ForwarderConfig {
        max_clients: 1,
        ..forwarder_config(echo_addr)
    };
    let (addr, stop, handle) = spawn_forwarder(config);

    let mut first = TcpStream::connect(addr).unwrap();
    first.write_all(b"keep").unwrap();
    assert_eq!(read_exactly(&mut first, 4), b"keep");

    // The second client is accepted and immediately dropped.
    let mut second = TcpStream::connect(addr).unwrap();
    let rejected = read_exactly(&mut second, 1);
    assert!(rejected.is_empty(), "client beyond the pool bound must be closed");

    // The established pair keeps working.
    first.write_all(b"still").unwrap();
    assert_eq!(read_exactly(&mut first, 5), b"still");

    let forwarder = stop_forwarder(&stop, handle);
    assert_eq!(forwarder.stats().total_connections, 1);
}

#[test]
fn test_graceful_stop_closes_pairs() {
    let (echo_addr, _accepted) = spawn_echo();
    let (addr, stop, handle) = spawn_forwarder(forwarder_config(echo_addr));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"bye").unwrap();
    assert_eq!(read_exactly(&mut client, 3), b"bye");

    let forwarder = stop_forwarder(&stop, handle);
    assert!(forwarder.pairs().is_empty(), "shutdown must clean up every pair");

    // The client side observes the close.
    let leftover = read_exactly(&mut client, 1);
    assert!(leftover.is_empty());
}

#[test]
fn test_warm_pool_cap_limits_parked_pairs() {
    let (echo_addr, accepted) = spawn_echo();
    let config = ForwarderConfig {
        enable_fast_reconnect: true,
        keep_target_alive: true,
        fast_reconnect_min_age: Duration::ZERO,
        connection_pool_size: 0,
        ..forwarder_config(echo_addr)
    };
    let (addr, stop, handle) = spawn_forwarder(config);

    // With a zero-sized warm pool the drop closes the pair outright.
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"one").unwrap();
    assert_eq!(read_exactly(&mut client, 3), b"one");
    drop(client);
    sleep(Duration::from_millis(400));

    let mut replacement = TcpStream::connect(addr).unwrap();
    replacement.write_all(b"two").unwrap();
    assert_eq!(read_exactly(&mut replacement, 3), b"two");

    let forwarder = stop_forwarder(&stop, handle);
    assert_eq!(accepted.load(Ordering::SeqCst), 2, "no warm pair was available to reuse");
    assert_eq!(forwarder.stats().total_connections, 2);
}

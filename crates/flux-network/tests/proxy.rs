//! End-to-end tests driving `ConnectionManager` over real loopback sockets,
//! one per scenario from the forwarding contract: plain echo with a clean
//! upstream close, an encrypted-downstream handshake and message, a transfer
//! that exceeds one directional buffer's capacity, a half-close that still
//! flushes pending bytes, an isolated crypto authentication failure, and a
//! signal-style shutdown with connections still live.

use std::{
    io::{Read, Write},
    net::{Shutdown, TcpListener as StdTcpListener, TcpStream as StdTcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use flux_network::{
    Config, ConnectionManager, LogLevel,
    crypto::{FramedCryptoStream, Handshake, HandshakeOutcome, SharedKey},
};

fn config(upstream_port: u16, encrypt_downstream: bool, encrypt_upstream: bool) -> Config {
    Config::new("127.0.0.1", 0, "127.0.0.1", upstream_port, encrypt_downstream, encrypt_upstream, LogLevel::Error)
}

fn spawn_proxy(mut manager: ConnectionManager) -> (Arc<AtomicBool>, thread::JoinHandle<i32>) {
    let run_flag = Arc::new(AtomicBool::new(true));
    let flag = run_flag.clone();
    let handle = thread::spawn(move || {
        let status = manager.run(&flag).expect("event loop returned an io error");
        manager.teardown();
        status
    });
    (run_flag, handle)
}

fn stop(run_flag: &AtomicBool, handle: thread::JoinHandle<i32>) {
    run_flag.store(false, Ordering::Relaxed);
    let status = handle.join().expect("proxy thread panicked");
    assert_eq!(status, 0);
}

fn handshake(client: &mut StdTcpStream) -> SharedKey {
    let mut hs = Handshake::new();
    for _ in 0..64 {
        if let HandshakeOutcome::Done(shared) = hs.step(client).unwrap() {
            return shared;
        }
    }
    panic!("handshake did not complete");
}

#[test]
fn plaintext_echo_then_upstream_closes() {
    let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let upstream_thread = thread::spawn(move || {
        let (mut sock, _) = upstream.accept().unwrap();
        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        sock.write_all(b"pong").unwrap();
        // Dropping `sock` here closes the connection from upstream's side.
    });

    let manager = ConnectionManager::new(config(upstream_port, false, false)).unwrap();
    let proxy_addr = manager.local_addr().unwrap();
    let (run_flag, handle) = spawn_proxy(manager);

    let mut client = StdTcpStream::connect(proxy_addr).unwrap();
    client.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");

    // Upstream has now closed; the proxy forwards that as a clean EOF.
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut trailing = [0u8; 1];
    assert_eq!(client.read(&mut trailing).unwrap(), 0);

    upstream_thread.join().unwrap();
    stop(&run_flag, handle);
}

#[test]
fn encrypted_downstream_handshake_and_message() {
    let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let upstream_thread = thread::spawn(move || {
        let (mut sock, _) = upstream.accept().unwrap();
        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).unwrap();
        buf
    });

    // `-i` only: downstream is encrypted, upstream stays plaintext.
    let manager = ConnectionManager::new(config(upstream_port, true, false)).unwrap();
    let proxy_addr = manager.local_addr().unwrap();
    let (run_flag, handle) = spawn_proxy(manager);

    let mut client = StdTcpStream::connect(proxy_addr).unwrap();
    let shared = handshake(&mut client);
    let mut stream = FramedCryptoStream::new(shared);
    stream.send(&mut client, b"ABCD").unwrap();

    let received = upstream_thread.join().unwrap();
    assert_eq!(&received, b"ABCD");

    stop(&run_flag, handle);
}

#[test]
fn large_transfer_across_buffer_capacity() {
    let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();
    let upstream_thread = thread::spawn(move || {
        let (mut sock, _) = upstream.accept().unwrap();
        // Let the proxy's downstream-facing buffer fill past capacity
        // before upstream starts draining it.
        thread::sleep(Duration::from_millis(150));
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while received.len() < expected.len() {
            let n = sock.read(&mut buf).unwrap();
            assert!(n > 0, "upstream saw EOF before the whole payload arrived");
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let manager = ConnectionManager::new(config(upstream_port, false, false)).unwrap();
    let proxy_addr = manager.local_addr().unwrap();
    let (run_flag, handle) = spawn_proxy(manager);

    let mut client = StdTcpStream::connect(proxy_addr).unwrap();
    client.write_all(&payload).unwrap();

    let received = upstream_thread.join().unwrap();
    assert_eq!(received, payload);

    stop(&run_flag, handle);
}

#[test]
fn half_close_flushes_pending_bytes_before_teardown() {
    let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let upstream_thread = thread::spawn(move || {
        let (mut sock, _) = upstream.accept().unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = vec![0u8; 100];
        sock.read_exact(&mut buf).unwrap();
        buf
    });

    let manager = ConnectionManager::new(config(upstream_port, false, false)).unwrap();
    let proxy_addr = manager.local_addr().unwrap();
    let (run_flag, handle) = spawn_proxy(manager);

    let mut client = StdTcpStream::connect(proxy_addr).unwrap();
    let payload = vec![42u8; 100];
    client.write_all(&payload).unwrap();
    // Half-close: downstream disconnects with its 100 bytes still sitting in
    // the to-upstream buffer. The proxy must flush them before it tears the
    // rest of the connection down.
    client.shutdown(Shutdown::Write).unwrap();

    let received = upstream_thread.join().unwrap();
    assert_eq!(received, payload);

    stop(&run_flag, handle);
}

#[test]
fn crypto_auth_failure_is_isolated_to_its_connection() {
    let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let upstream_thread = thread::spawn(move || {
        let mut results = Vec::new();
        for _ in 0..2 {
            let (mut sock, _) = upstream.accept().unwrap();
            sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut buf = Vec::new();
            let _ = sock.read_to_end(&mut buf);
            results.push(buf);
        }
        results
    });

    let manager = ConnectionManager::new(config(upstream_port, true, false)).unwrap();
    let proxy_addr = manager.local_addr().unwrap();
    let (run_flag, handle) = spawn_proxy(manager);

    // Client A: a clean handshake followed by one valid message.
    let mut client_a = StdTcpStream::connect(proxy_addr).unwrap();
    let shared_a = handshake(&mut client_a);
    let mut stream_a = FramedCryptoStream::new(shared_a);
    stream_a.send(&mut client_a, b"hello-from-a").unwrap();

    // Client B: a clean handshake followed by a frame whose ciphertext is
    // pure garbage and cannot authenticate against the shared key.
    let mut client_b = StdTcpStream::connect(proxy_addr).unwrap();
    let _ = handshake(&mut client_b);
    const NONCE_LEN: usize = 24; // crypto_box_NONCEBYTES
    const BODY_LEN: usize = 48; // crypto_box_ZEROBYTES (32) plus some ciphertext
    let mut frame = Vec::new();
    frame.extend_from_slice(&(BODY_LEN as u16).to_be_bytes());
    frame.extend_from_slice(&[0xAAu8; NONCE_LEN]);
    frame.extend_from_slice(&[0x55u8; BODY_LEN]);
    client_b.write_all(&frame).unwrap();

    // The proxy tears client B's connection down on the failed decrypt;
    // its socket observes a clean close.
    client_b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut trailing = [0u8; 1];
    assert_eq!(client_b.read(&mut trailing).unwrap(), 0);

    let results = upstream_thread.join().unwrap();
    assert!(results.iter().any(|r| r == b"hello-from-a"), "client A's message never reached upstream");

    stop(&run_flag, handle);
}

#[test]
fn shutdown_closes_listener_and_active_connections() {
    let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let upstream_thread = thread::spawn(move || {
        let conns: Vec<_> = (0..3).map(|_| upstream.accept().unwrap().0).collect();
        thread::sleep(Duration::from_millis(300));
        drop(conns);
    });

    let manager = ConnectionManager::new(config(upstream_port, false, false)).unwrap();
    let proxy_addr = manager.local_addr().unwrap();
    let (run_flag, handle) = spawn_proxy(manager);

    let _clients: Vec<StdTcpStream> = (0..3).map(|_| StdTcpStream::connect(proxy_addr).unwrap()).collect();
    thread::sleep(Duration::from_millis(50));

    // `stop` asserts the loop exits with status 0 and the thread (which
    // calls `teardown` right after `run` returns) doesn't panic tearing
    // down three still-live connections plus the listener.
    stop(&run_flag, handle);
    upstream_thread.join().unwrap();
}

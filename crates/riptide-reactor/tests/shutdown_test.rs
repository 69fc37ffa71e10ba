//! Shutdown semantics: cooperative close, multi-consumer unblock, and
//! listener isolation.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use riptide_reactor::{EngineConfig, EpollServer, Event};

fn new_server() -> Arc<EpollServer> {
    Arc::new(EpollServer::with_config(EngineConfig::default()).unwrap())
}

fn spawn_consumer(server: &Arc<EpollServer>) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel();
    let server = Arc::clone(server);
    thread::spawn(move || {
        while let Some(event) = server.recv() {
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    rx
}

fn next_event(events: &mpsc::Receiver<Event>) -> Event {
    events
        .recv_timeout(Duration::from_secs(5))
        .expect("timed out waiting for event")
}

fn expect_accepted(events: &mpsc::Receiver<Event>) -> RawFd {
    match next_event(events) {
        Event::Accepted { fd } => fd,
        other => panic!("expected Accepted, got {other:?}"),
    }
}

/// Every blocked recv() caller gets exactly one terminal result.
#[test]
fn test_close_unblocks_all_recv_callers() {
    let server = new_server();
    server.start(2, false).unwrap();

    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let server = Arc::clone(&server);
        let tx = tx.clone();
        thread::spawn(move || {
            tx.send(server.recv()).unwrap();
        });
    }

    // Let all three block inside recv() before closing.
    thread::sleep(Duration::from_millis(100));
    server.close();

    for _ in 0..3 {
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, None);
    }
}

/// close() joins every worker; join() afterwards returns immediately.
#[test]
fn test_close_then_join_returns() {
    let server = new_server();
    server.start(4, false).unwrap();
    server.close();
    server.join();
    assert_eq!(server.recv(), None);
}

/// close() is idempotent.
#[test]
fn test_double_close() {
    let server = new_server();
    server.start(1, false).unwrap();
    server.close();
    server.close();
}

/// Connected clients are torn down by close() and see EOF.
#[test]
fn test_close_tears_down_clients() {
    let server = new_server();
    let addr = server.listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
    server.start(2, false).unwrap();
    let events = spawn_consumer(&server);

    let mut client = TcpStream::connect(addr).unwrap();
    let fd = expect_accepted(&events);

    server.close();

    let mut closed_seen = 0;
    while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
        if let Event::ClientClosed { fd: got } = event {
            assert_eq!(got, fd);
            closed_seen += 1;
        }
    }
    assert_eq!(closed_seen, 1);

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "client must observe EOF after close()");
}

/// Removing one listener tears down its clients but leaves a sibling
/// listener and its connections untouched.
#[test]
fn test_unlisten_isolates_sibling_listener() {
    let server = new_server();
    let addr_a = server.listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
    let addr_b = server.listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
    server.start(2, false).unwrap();
    let events = spawn_consumer(&server);

    let _client_a = TcpStream::connect(addr_a).unwrap();
    let fd_a = expect_accepted(&events);
    let mut client_b = TcpStream::connect(addr_b).unwrap();
    let fd_b = expect_accepted(&events);

    server.unlisten(addr_a.ip(), addr_a.port());

    // A's client is cascaded down...
    match next_event(&events) {
        Event::ClientClosed { fd } => assert_eq!(fd, fd_a),
        other => panic!("expected ClientClosed for listener A's client, got {other:?}"),
    }

    // ...and new connections to A eventually fail.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match TcpStream::connect(addr_a) {
            Err(_) => break,
            Ok(extra) => {
                drop(extra);
                assert!(Instant::now() < deadline, "listener A still accepting");
                thread::sleep(Duration::from_millis(20));
            }
        }
    }

    // B's session keeps working.
    client_b.write_all(b"still-here").unwrap();
    let mut received = Vec::new();
    while received.len() < 10 {
        match next_event(&events) {
            Event::Received { fd, bytes } => {
                assert_eq!(fd, fd_b);
                received.extend_from_slice(&bytes);
            }
            // Stray accepts from the probe connections above are fine.
            Event::Accepted { .. } | Event::ClientClosed { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(received, b"still-here");

    server.send(fd_b, b"ack");
    let mut reply = [0u8; 3];
    client_b.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ack");

    server.close();
}

/// unlisten on an address nobody is bound to is a no-op.
#[test]
fn test_unlisten_unknown_address_is_noop() {
    let server = new_server();
    server.start(1, false).unwrap();
    server.unlisten(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
    server.close();
}

//! End-to-end flows across the listen, connect, poll and stream layers.

use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use crate::bandwidth::NetworkCounters;
use crate::connection::Connection;
use crate::connector::{AsyncConnector, ConnectorConfig, OpenConnectionResult};
use crate::listen_socket::ListenSocket;
use crate::platform::SocketConfig;
use crate::poll_group::{PollGroup, TransportKind};

const TIMEOUT: Duration = Duration::from_secs(10);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Listen, connect through the async connector, wait on the poll group and
/// accept. Returns `(client, server)`.
fn establish() -> (Connection, Connection) {
    let listener = ListenSocket::bind("127.0.0.1:0".parse().unwrap(), &SocketConfig::default())
        .expect("bind loopback");
    let mut group = PollGroup::new(TransportKind::Tcp);
    group.add(&listener);

    let connector = AsyncConnector::new(ConnectorConfig::default()).unwrap();
    let (tx, rx) = bounded::<OpenConnectionResult>(1);
    connector
        .open_async("127.0.0.1", listener.local_addr().port(), move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let deadline = Instant::now() + TIMEOUT;
    let server = loop {
        assert!(Instant::now() < deadline, "no inbound connection");
        if group.check_sockets(Duration::from_millis(100)).unwrap() > 0 {
            assert!(group.is_set(&listener));
            if let Some(conn) = listener.accept() {
                break conn;
            }
        }
    };
    group.remove(&listener);

    let client = rx
        .recv_timeout(TIMEOUT)
        .expect("connector callback")
        .expect("connect to loopback listener");
    (client, server)
}

#[test]
fn test_plain_exchange_through_listener_and_connector() {
    let (mut client, mut server) = establish();
    let counters = NetworkCounters::new();
    let data = pattern(4096);

    counters.record_send(client.write_all(&data).unwrap());

    let mut received = vec![0u8; data.len()];
    server.read_all(&mut received, Some(TIMEOUT)).unwrap();
    assert_eq!(received, data);

    server.write_all(b"ack").unwrap();
    let mut ack = [0u8; 3];
    client.read_all(&mut ack, Some(TIMEOUT)).unwrap();
    assert_eq!(&ack, b"ack");

    let snapshot = counters.snapshot_and_reset();
    assert_eq!(snapshot.bytes_sent, data.len() as u64);
    assert_eq!(snapshot.bytes_sent_stream, data.len() as u64);
}

#[test]
fn test_compressed_exchange_through_listener_and_connector() {
    let (mut client, mut server) = establish();
    client.enable_compression().unwrap();
    server.enable_compression().unwrap();

    let counters = NetworkCounters::new();
    let data: Vec<u8> = b"state update ".iter().copied().cycle().take(32 * 1024).collect();

    counters.record_send(client.write_all(&data).unwrap());
    let flushed = client.flush().unwrap();
    assert!(flushed > 0);
    assert!(flushed < data.len(), "repetitive data should shrink");

    let mut received = vec![0u8; data.len()];
    server.read_all(&mut received, Some(TIMEOUT)).unwrap();
    assert_eq!(received, data);

    // Second message on the same stream.
    let second = pattern(1000);
    client.write_all(&second).unwrap();
    client.flush().unwrap();
    let mut received = vec![0u8; second.len()];
    server.read_all(&mut received, Some(TIMEOUT)).unwrap();
    assert_eq!(received, second);
}

#[test]
fn test_server_sees_disconnect_after_draining() {
    let (mut client, mut server) = establish();
    client.enable_compression().unwrap();
    server.enable_compression().unwrap();

    client.write_all(b"last words").unwrap();
    client.flush().unwrap();
    drop(client);

    let mut buf = [0u8; 10];
    server.read_all(&mut buf, Some(TIMEOUT)).unwrap();
    assert_eq!(&buf, b"last words");

    let deadline = Instant::now() + TIMEOUT;
    while !server.read_disconnected() {
        assert!(Instant::now() < deadline, "disconnect never observed");
        let mut scratch = [0u8; 16];
        let got = server.read_no_int(&mut scratch).unwrap();
        assert_eq!(got.bytes, 0);
        std::thread::sleep(Duration::from_millis(5));
    }
}

//! Tests for TCP and UDP sockets against servers on the loopback interface.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream, UdpSocket},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rstest::*;

use equipmentrs::{
    ConnectOptions, EquipmentError, ErrorKind, MessageInterface, SocketTransport, connect,
};

fn options() -> ConnectOptions {
    ConnectOptions::default().with_timeout(Some(Duration::from_secs(5)))
}

/// Start a server that accepts one connection and runs `serve` on it.
fn serve_tcp(serve: impl FnOnce(TcpStream) + Send + 'static) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve(stream);
    });
    (port, handle)
}

/// A server that answers every line with `ANSWER:<line>`, split into several writes.
fn answering_server(stream: TcpStream) {
    let mut writer = stream.try_clone().unwrap();
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let answer = format!("ANSWER:{}\n", line.trim_end());
        let (first, second) = answer.split_at(answer.len() / 2);
        writer.write_all(first.as_bytes()).unwrap();
        writer.flush().unwrap();
        thread::sleep(Duration::from_millis(10));
        writer.write_all(second.as_bytes()).unwrap();
    }
}

#[rstest]
#[case("TCP::127.0.0.1::{port}")]
#[case("TCPIP::127.0.0.1::{port}::SOCKET")]
fn test_tcp_query(#[case] template: &str) {
    let (port, server) = serve_tcp(answering_server);
    let address = template.replace("{port}", &port.to_string());
    let mut conn = connect(&address, options()).unwrap();
    assert_eq!(conn.query_str("*IDN?").unwrap(), "ANSWER:*IDN?");
    assert_eq!(conn.query_str("MEAS?").unwrap(), "ANSWER:MEAS?");
    conn.disconnect().unwrap();
    server.join().unwrap();
}

/// The default write termination of sockets is `\r\n`.
#[rstest]
fn test_tcp_write_termination() {
    let (port, server) = serve_tcp(|stream| {
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        assert_eq!(line, "OUTP ON\r\n");
    });
    let mut conn = connect(&format!("TCP::127.0.0.1::{port}"), options()).unwrap();
    assert_eq!(conn.write_str("OUTP ON").unwrap(), 9);
    server.join().unwrap();
}

/// A server that never answers makes the read time out, the partial answer is kept.
#[rstest]
fn test_tcp_timeout() {
    let (port, server) = serve_tcp(|mut stream| {
        stream.write_all(b"+1.0").unwrap();
        thread::sleep(Duration::from_millis(300));
    });
    let options = ConnectOptions::default().with_timeout(Some(Duration::from_millis(100)));
    let mut conn = connect(&format!("TCP::127.0.0.1::{port}"), options).unwrap();
    let err = conn.read().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.partial_data(), Some(b"+1.0".as_slice()));
    server.join().unwrap();
}

/// The server closing the connection is reported as such.
#[rstest]
fn test_tcp_peer_closed() {
    let (port, server) = serve_tcp(drop);
    let mut conn = connect(&format!("TCP::127.0.0.1::{port}"), options()).unwrap();
    server.join().unwrap();
    assert!(matches!(conn.read(), Err(EquipmentError::ConnectionClosed)));
}

/// The server closing the connection in the middle of a message.
#[rstest]
fn test_tcp_closed_without_termination() {
    let (port, server) = serve_tcp(|mut stream| {
        stream.write_all(b"incomplete").unwrap();
    });
    let mut conn = connect(&format!("TCP::127.0.0.1::{port}"), options()).unwrap();
    server.join().unwrap();
    let err = conn.read().unwrap_err();
    assert!(matches!(err, EquipmentError::TerminatorNotFound { .. }));
    assert_eq!(err.partial_data(), Some(b"incomplete".as_slice()));
}

/// Nobody listens on the port.
#[rstest]
fn test_tcp_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = connect(&format!("TCP::127.0.0.1::{port}"), options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.to_string().contains(&port.to_string()));
}

/// A blocked read is cancelled by the abort handle.
#[rstest]
fn test_tcp_abort() {
    let (port, server) = serve_tcp(|stream| {
        let mut line = String::new();
        // returns once the client shut the socket down
        let _ = BufReader::new(stream).read_line(&mut line);
    });
    let mut conn = connect(&format!("TCP::127.0.0.1::{port}"), ConnectOptions::default()).unwrap();
    let handle = conn.abort_handle().unwrap();
    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.abort();
    });
    assert_eq!(conn.read().unwrap_err().kind(), ErrorKind::Connection);
    aborter.join().unwrap();
    server.join().unwrap();
}

/// After a reconnect, the new connection is used.
#[rstest]
fn test_tcp_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        for answer in [&b"first\n"[..], b"second\n"] {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(answer).unwrap();
            thread::sleep(Duration::from_millis(100));
        }
    });
    let mut conn = connect(&format!("TCP::127.0.0.1::{port}"), options()).unwrap();
    assert_eq!(conn.read_string().unwrap(), "first");
    conn.transport_mut::<SocketTransport>()
        .unwrap()
        .reconnect(3)
        .unwrap();
    assert_eq!(conn.read_string().unwrap(), "second");
    server.join().unwrap();
}

/// Every UDP datagram is one message.
#[rstest]
fn test_udp_query() {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (n, peer) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"TEMP?\r\n");
        server.send_to(b"21.5", peer).unwrap();
    });
    let mut conn = connect(&format!("UDP::127.0.0.1::{port}"), options()).unwrap();
    assert_eq!(conn.query_str("TEMP?").unwrap(), "21.5");
    handle.join().unwrap();
}

/// A read on a silent connection times out when the timeout expires, not earlier.
#[rstest]
fn test_tcp_timeout_boundary() {
    let (port, server) = serve_tcp(|stream| {
        let mut line = String::new();
        let _ = BufReader::new(stream).read_line(&mut line);
    });
    let timeout = Duration::from_millis(200);
    let options = ConnectOptions::default().with_timeout(Some(timeout));
    let mut conn = connect(&format!("TCP::127.0.0.1::{port}"), options).unwrap();
    let start = Instant::now();
    assert!(conn.read().unwrap_err().is_timeout());
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout - Duration::from_millis(10), "{elapsed:?}");
    assert!(elapsed <= timeout + Duration::from_millis(500), "{elapsed:?}");
    conn.disconnect().unwrap();
    server.join().unwrap();
}

fn serve_datagram(size: usize) -> (u16, JoinHandle<()>) {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (_, peer) = server.recv_from(&mut buf).unwrap();
        server.send_to(&vec![b'x'; size], peer).unwrap();
    });
    (port, handle)
}

/// A datagram larger than the read buffer of a TCP socket arrives complete.
#[rstest]
fn test_udp_large_datagram() {
    let (port, handle) = serve_datagram(5000);
    let mut conn = connect(&format!("UDP::127.0.0.1::{port}"), options()).unwrap();
    assert_eq!(conn.query(b"WAVE?").unwrap(), vec![b'x'; 5000]);
    handle.join().unwrap();
}

/// A datagram larger than the maximum read size is an error, not a truncated message.
#[rstest]
fn test_udp_datagram_too_large() {
    let (port, handle) = serve_datagram(5000);
    let options = options().with_max_read_size(4096);
    let mut conn = connect(&format!("UDP::127.0.0.1::{port}"), options).unwrap();
    assert!(matches!(
        conn.query(b"WAVE?"),
        Err(EquipmentError::MaxReadSizeExceeded {
            size: 5000,
            max: 4096
        })
    ));
    handle.join().unwrap();
}

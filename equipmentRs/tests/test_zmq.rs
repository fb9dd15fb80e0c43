//! Tests for the ZeroMQ transport against a minimal ZMTP 3.0 peer on the loopback interface.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

use rstest::*;

use equipmentrs::{ConnectOptions, EquipmentError, MessageInterface, ZmqSocketType, connect};

const MORE: u8 = 0x01;
const COMMAND: u8 = 0x04;

fn greeting() -> Vec<u8> {
    let mut greeting = vec![0u8; 64];
    greeting[0] = 0xFF;
    greeting[9] = 0x7F;
    greeting[10] = 3;
    greeting[12..16].copy_from_slice(b"NULL");
    greeting
}

fn ready(socket_type: &[u8]) -> Vec<u8> {
    let mut body = vec![5];
    body.extend_from_slice(b"READY");
    body.push(11);
    body.extend_from_slice(b"Socket-Type");
    body.extend_from_slice(&(socket_type.len() as u32).to_be_bytes());
    body.extend_from_slice(socket_type);
    body
}

fn write_frame(stream: &mut TcpStream, flags: u8, body: &[u8]) {
    let mut frame = vec![flags, body.len() as u8];
    frame.extend_from_slice(body);
    stream.write_all(&frame).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    let mut body = vec![0u8; usize::from(head[1])];
    stream.read_exact(&mut body).unwrap();
    (head[0], body)
}

/// Accept one peer, complete the handshake and run `serve`. The handshake checks the socket type
/// that the client announces.
fn serve(
    expected_type: &'static [u8],
    serve: impl FnOnce(&mut TcpStream) + Send + 'static,
) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut peer_greeting = [0u8; 64];
        stream.read_exact(&mut peer_greeting).unwrap();
        assert_eq!(peer_greeting[0], 0xFF);
        assert_eq!(&peer_greeting[12..16], b"NULL");
        stream.write_all(&greeting()).unwrap();

        let (flags, body) = read_frame(&mut stream);
        assert_eq!(flags, COMMAND);
        assert_eq!(body, ready(expected_type));
        write_frame(&mut stream, COMMAND, &ready(b"REP"));

        serve(&mut stream);
    });
    (port, handle)
}

fn options() -> ConnectOptions {
    ConnectOptions::default().with_timeout(Some(Duration::from_secs(5)))
}

/// A REQ socket sends an empty delimiter before the request and strips it from the reply.
#[rstest]
fn test_req() {
    let (port, server) = serve(b"REQ", |stream| {
        assert_eq!(read_frame(stream), (MORE, vec![]));
        assert_eq!(read_frame(stream), (0, b"*IDN?".to_vec()));
        write_frame(stream, MORE, b"");
        write_frame(stream, 0, b"ACME,ZMQ,1");
    });
    let mut conn = connect(&format!("ZMQ::127.0.0.1::{port}"), options()).unwrap();
    assert_eq!(conn.query_str("*IDN?").unwrap(), "ACME,ZMQ,1");
    server.join().unwrap();
}

/// A DEALER socket sends bare messages, multi-part replies are joined.
#[rstest]
fn test_dealer_multipart() {
    let (port, server) = serve(b"DEALER", |stream| {
        assert_eq!(read_frame(stream), (0, b"DATA?".to_vec()));
        write_frame(stream, MORE, b"1,2,");
        write_frame(stream, 0, b"3");
    });
    let mut options = options();
    options.zmq.socket_type = ZmqSocketType::Dealer;
    let mut conn = connect(&format!("ZMQ::127.0.0.1::{port}"), options).unwrap();
    assert_eq!(conn.query(b"DATA?").unwrap(), b"1,2,3");
    server.join().unwrap();
}

/// Messages are not terminated, even if they contain line feeds.
#[rstest]
fn test_no_termination() {
    let (port, server) = serve(b"REQ", |stream| {
        read_frame(stream);
        read_frame(stream);
        write_frame(stream, MORE, b"");
        write_frame(stream, 0, b"a\nb\n");
    });
    let mut conn = connect(&format!("ZMQ::127.0.0.1::{port}"), options()).unwrap();
    assert_eq!(conn.query(b"x").unwrap(), b"a\nb\n");
    server.join().unwrap();
}

/// A reply that is larger than the maximum read size is rejected.
#[rstest]
fn test_max_read_size() {
    let (port, server) = serve(b"REQ", |stream| {
        read_frame(stream);
        read_frame(stream);
        write_frame(stream, MORE, b"");
        write_frame(stream, 0, &[b'x'; 100]);
    });
    let mut conn = connect(
        &format!("ZMQ::127.0.0.1::{port}"),
        options().with_max_read_size(10),
    )
    .unwrap();
    assert!(matches!(
        conn.query(b"x"),
        Err(EquipmentError::MaxReadSizeExceeded { max: 10, .. })
    ));
    server.join().unwrap();
}

/// A peer that does not speak ZMTP fails the handshake.
#[rstest]
fn test_bad_greeting() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(&[b'H'; 64]).unwrap();
        thread::sleep(Duration::from_millis(100));
    });
    let err = connect(&format!("ZMQ::127.0.0.1::{port}"), options()).unwrap_err();
    assert!(matches!(err, EquipmentError::Connection { .. }), "{err:?}");
    server.join().unwrap();
}

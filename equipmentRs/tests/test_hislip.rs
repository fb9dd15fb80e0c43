//! Tests for the HiSLIP transport against a scripted server on the loopback interface.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

use rstest::*;

use equipmentrs::{
    ConnectOptions, Connection, EquipmentError, HislipTransport, LockInfo, MessageInterface,
    connect,
};

const FATAL_ERROR: u8 = 2;
const ERROR: u8 = 3;
const ASYNC_LOCK: u8 = 4;
const ASYNC_LOCK_RESPONSE: u8 = 5;
const DATA: u8 = 6;
const DATA_END: u8 = 7;
const DEVICE_CLEAR_COMPLETE: u8 = 8;
const DEVICE_CLEAR_ACKNOWLEDGE: u8 = 9;
const ASYNC_REMOTE_LOCAL_CONTROL: u8 = 10;
const ASYNC_REMOTE_LOCAL_RESPONSE: u8 = 11;
const TRIGGER: u8 = 12;
const ASYNC_DEVICE_CLEAR: u8 = 19;
const ASYNC_STATUS_QUERY: u8 = 21;
const ASYNC_STATUS_RESPONSE: u8 = 22;
const ASYNC_DEVICE_CLEAR_ACKNOWLEDGE: u8 = 23;
const ASYNC_LOCK_INFO: u8 = 24;
const ASYNC_LOCK_INFO_RESPONSE: u8 = 25;

const FIRST_ID: u32 = 0xFFFF_FF00;

/// A message as `(type, control code, parameter, payload)`.
type Message = (u8, u8, u32, Vec<u8>);

fn send(stream: &mut TcpStream, kind: u8, control: u8, parameter: u32, payload: &[u8]) {
    let mut data = b"HS".to_vec();
    data.push(kind);
    data.push(control);
    data.extend_from_slice(&parameter.to_be_bytes());
    data.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    data.extend_from_slice(payload);
    stream.write_all(&data).unwrap();
}

fn receive(stream: &mut TcpStream) -> Message {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(&header[..2], b"HS");
    let parameter = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let length = u64::from_be_bytes(header[8..16].try_into().unwrap());
    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).unwrap();
    (header[2], header[3], parameter, payload)
}

/// The two channels of the server side of a session.
struct Server {
    sync: TcpStream,
    asynchronous: TcpStream,
}

/// Accept one session, negotiate `max_message_size` and run `scenario`.
fn serve(
    init_control: u8,
    max_message_size: u64,
    scenario: impl FnOnce(&mut Server) + Send + 'static,
) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut sync, _) = listener.accept().unwrap();
        let (kind, _, parameter, payload) = receive(&mut sync);
        assert_eq!(kind, 0);
        assert_eq!(parameter >> 16, 0x0100, "protocol version 1.0");
        assert_eq!(payload, b"hislip0");
        send(&mut sync, 1, init_control, 0x0100_0007, b"");
        if init_control & 0x02 != 0 {
            return;
        }

        let (mut asynchronous, _) = listener.accept().unwrap();
        let (kind, _, parameter, _) = receive(&mut asynchronous);
        assert_eq!((kind, parameter), (17, 7));
        send(&mut asynchronous, 18, 0, 0x5253, b"");

        let (kind, _, _, payload) = receive(&mut asynchronous);
        assert_eq!(kind, 15);
        assert_eq!(payload.len(), 8);
        send(&mut asynchronous, 16, 0, 0, &max_message_size.to_be_bytes());

        scenario(&mut Server { sync, asynchronous });
    });
    (port, handle)
}

fn open(port: u16) -> Connection {
    let options = ConnectOptions::default().with_timeout(Some(Duration::from_secs(5)));
    connect(&format!("TCPIP::127.0.0.1::hislip0,{port}::INSTR"), options).unwrap()
}

/// The session is initialized on both channels.
#[rstest]
fn test_initialize() {
    let (port, server) = serve(0x01, 1 << 20, |_| {});
    let mut conn = open(port);
    let transport = conn.transport_mut::<HislipTransport>().unwrap();
    assert_eq!(transport.session_id(), 7);
    assert_eq!(transport.server_vendor_id(), 0x5253);
    assert_eq!(transport.maximum_server_message_size(), 1 << 20);
    server.join().unwrap();
}

/// Requests and responses carry the message id, RMT-delivered is reported with the next request.
#[rstest]
fn test_query() {
    let (port, server) = serve(0, 1 << 20, |s| {
        assert_eq!(receive(&mut s.sync), (DATA_END, 0, FIRST_ID, b"*IDN?\n".to_vec()));
        send(&mut s.sync, DATA_END, 0, FIRST_ID, b"ACME,HISLIP,1\n");
        assert_eq!(
            receive(&mut s.sync),
            (DATA_END, 1, FIRST_ID + 2, b"MEAS?\n".to_vec())
        );
        send(&mut s.sync, DATA, 0, FIRST_ID + 2, b"+1.2");
        send(&mut s.sync, DATA_END, 0, FIRST_ID + 2, b"3\n");
    });
    let mut conn = open(port);
    assert_eq!(conn.query(b"*IDN?\n").unwrap(), b"ACME,HISLIP,1\n");
    assert_eq!(conn.query(b"MEAS?\n").unwrap(), b"+1.23\n");
    server.join().unwrap();
}

/// A message larger than the server accepts is split into `Data` messages.
#[rstest]
fn test_write_split() {
    let (port, server) = serve(0, 16 + 4, |s| {
        assert_eq!(receive(&mut s.sync), (DATA, 0, FIRST_ID, b"ABCD".to_vec()));
        assert_eq!(receive(&mut s.sync), (DATA, 0, FIRST_ID + 2, b"EFGH".to_vec()));
        assert_eq!(receive(&mut s.sync), (DATA_END, 0, FIRST_ID + 4, b"IJ".to_vec()));
    });
    let mut conn = open(port);
    assert_eq!(conn.write(b"ABCDEFGHIJ").unwrap(), 10);
    server.join().unwrap();
}

/// Data that belongs to an earlier request is discarded.
#[rstest]
fn test_stale_data_discarded() {
    let (port, server) = serve(0, 1 << 20, |s| {
        receive(&mut s.sync);
        send(&mut s.sync, DATA_END, 0, 0x1234_5678, b"stale\n");
        send(&mut s.sync, DATA_END, 0, FIRST_ID, b"fresh\n");
    });
    let mut conn = open(port);
    assert_eq!(conn.query_str("x").unwrap(), "fresh\n");
    server.join().unwrap();
}

#[rstest]
fn test_read_stb_and_trigger() {
    let (port, server) = serve(0, 1 << 20, |s| {
        assert_eq!(receive(&mut s.sync), (TRIGGER, 0, FIRST_ID, vec![]));
        let (kind, _, parameter, _) = receive(&mut s.asynchronous);
        assert_eq!((kind, parameter), (ASYNC_STATUS_QUERY, FIRST_ID));
        send(&mut s.asynchronous, ASYNC_STATUS_RESPONSE, 0x42, 0, b"");
    });
    let mut conn = open(port);
    conn.trigger().unwrap();
    assert_eq!(conn.read_stb().unwrap(), 0x42);
    server.join().unwrap();
}

/// Device clear runs on both channels and restarts the message ids.
#[rstest]
fn test_clear() {
    let (port, server) = serve(0, 1 << 20, |s| {
        assert_eq!(receive(&mut s.sync).2, FIRST_ID);
        assert_eq!(receive(&mut s.asynchronous).0, ASYNC_DEVICE_CLEAR);
        send(&mut s.asynchronous, ASYNC_DEVICE_CLEAR_ACKNOWLEDGE, 1, 0, b"");
        let (kind, control, _, _) = receive(&mut s.sync);
        assert_eq!((kind, control), (DEVICE_CLEAR_COMPLETE, 1));
        send(&mut s.sync, DEVICE_CLEAR_ACKNOWLEDGE, 1, 0, b"");
        assert_eq!(receive(&mut s.sync).2, FIRST_ID);
    });
    let mut conn = open(port);
    conn.write(b"*RST\n").unwrap();
    conn.clear().unwrap();
    conn.write(b"*CLS\n").unwrap();
    server.join().unwrap();
}

#[rstest]
fn test_locking() {
    let (port, server) = serve(0, 1 << 20, |s| {
        let (kind, control, parameter, payload) = receive(&mut s.asynchronous);
        assert_eq!((kind, control), (ASYNC_LOCK, 1));
        assert_eq!(parameter, 86_400_000);
        assert_eq!(payload, b"");
        send(&mut s.asynchronous, ASYNC_LOCK_RESPONSE, 1, 0, b"");

        assert_eq!(receive(&mut s.asynchronous).0, ASYNC_LOCK_INFO);
        send(&mut s.asynchronous, ASYNC_LOCK_INFO_RESPONSE, 1, 1, b"");

        let (kind, control, _, _) = receive(&mut s.asynchronous);
        assert_eq!((kind, control), (ASYNC_LOCK, 0));
        send(&mut s.asynchronous, ASYNC_LOCK_RESPONSE, 1, 0, b"");

        let (_, _, _, payload) = receive(&mut s.asynchronous);
        assert_eq!(payload, b"shared");
        send(&mut s.asynchronous, ASYNC_LOCK_RESPONSE, 0, 0, b"");
    });
    let mut conn = open(port);
    let transport = conn.transport_mut::<HislipTransport>().unwrap();
    assert!(transport.lock("").unwrap());
    assert_eq!(
        transport.lock_info().unwrap(),
        LockInfo {
            exclusive: true,
            num_locks: 1
        }
    );
    assert!(transport.unlock().unwrap());
    assert!(!transport.lock("shared").unwrap());
    assert!(transport.lock(&"x".repeat(257)).is_err());
    server.join().unwrap();
}

#[rstest]
#[case(true, 3)]
#[case(false, 6)]
fn test_remote_local(#[case] remote: bool, #[case] control: u8) {
    let (port, server) = serve(0, 1 << 20, move |s| {
        let (kind, received, _, _) = receive(&mut s.asynchronous);
        assert_eq!((kind, received), (ASYNC_REMOTE_LOCAL_CONTROL, control));
        send(&mut s.asynchronous, ASYNC_REMOTE_LOCAL_RESPONSE, 0, 0, b"");
    });
    let mut conn = open(port);
    if remote {
        conn.remote().unwrap();
    } else {
        conn.local().unwrap();
    }
    server.join().unwrap();
}

/// An error message of the server is reported, the client answers with a fatal error and closes.
#[rstest]
fn test_server_error() {
    let (port, server) = serve(0, 1 << 20, |s| {
        receive(&mut s.sync);
        send(&mut s.sync, ERROR, 4, 0, b"too long");
        assert_eq!(receive(&mut s.sync).0, FATAL_ERROR);
    });
    let mut conn = open(port);
    match conn.query(b"x") {
        Err(EquipmentError::Hislip { code, message }) => {
            assert_eq!(code, 4);
            assert!(message.contains("too long"), "{message}");
        }
        other => panic!("Expected a HiSLIP error, got {other:?}"),
    }
    server.join().unwrap();
    assert!(matches!(conn.write(b"x"), Err(EquipmentError::ConnectionClosed)));
}

/// A server that requires encryption is refused.
#[rstest]
fn test_encryption_refused() {
    let (port, server) = serve(0x02, 1 << 20, |_| {});
    let options = ConnectOptions::default().with_timeout(Some(Duration::from_secs(5)));
    let err = connect(&format!("TCPIP::127.0.0.1::hislip0,{port}::INSTR"), options).unwrap_err();
    assert!(matches!(err, EquipmentError::Connection { .. }), "{err:?}");
    server.join().unwrap();
}

//! Tests for the connection facade, with a registry that opens echo transports.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rstest::*;

use equipmentrs::{
    Backend, ConnectOptions, Connection, EchoTransport, Encoding, EquipmentError,
    EquipmentRecord, ErrorKind, Family, LoopbackTransport, MessageInterface, Registry,
};

#[fixture]
fn registry() -> Registry {
    let registry = Registry::empty();
    registry.set_default(
        Family::Socket,
        Backend::message("echo", |_, _| Ok(EchoTransport::new()), b"\n", b"\n"),
    );
    registry
}

fn options() -> ConnectOptions {
    ConnectOptions::default().with_timeout(Some(Duration::from_millis(50)))
}

fn close_counter(conn: &mut Connection) -> Arc<AtomicUsize> {
    conn.transport_mut::<EchoTransport>().unwrap().close_counter()
}

#[rstest]
fn test_query(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.query_str("*IDN?").unwrap(), "*IDN?");
    assert_eq!(conn.query(b"MEAS:VOLT?").unwrap(), b"MEAS:VOLT?");
}

/// The family defaults for the terminations apply unless the options set them.
#[rstest]
fn test_terminations(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    let engine = conn.message_based().unwrap();
    assert_eq!(engine.read_termination(), b"\n");
    assert_eq!(engine.timeout(), Some(Duration::from_millis(50)));

    let mut conn = registry
        .connect("TCP::localhost::5025", options().with_termination(b"\r"))
        .unwrap();
    let engine = conn.message_based().unwrap();
    assert_eq!(engine.read_termination(), b"\r");
    assert_eq!(engine.write_termination(), b"\r");
}

/// The name identifies the family, the equipment and the address.
/// Text settings changed on the engine apply to the string methods of the connection.
#[rstest]
fn test_engine_text_settings(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    assert_eq!(conn.query_str("1.5  ").unwrap(), "1.5  ");
    conn.message_based().unwrap().set_rstrip(true);
    assert!(conn.rstrip());
    assert_eq!(conn.query_str("1.5  ").unwrap(), "1.5");

    assert_eq!(conn.query_str("é").unwrap(), "é");
    conn.message_based().unwrap().set_encoding(Encoding::Ascii);
    assert_eq!(conn.encoding(), Encoding::Ascii);
    assert!(matches!(
        conn.query_str("é"),
        Err(EquipmentError::InvalidArgument(_))
    ));
}

#[rstest]
fn test_name(registry: Registry) {
    let options = options()
        .with_manufacturer("Acme")
        .with_model("PS-1")
        .with_serial_number("0042");
    let conn = registry.connect("TCP::localhost::5025", options).unwrap();
    assert_eq!(conn.name(), "SOCKET<Acme|PS-1|0042 at TCP::localhost::5025>");
    assert_eq!(format!("{conn:?}"), conn.name());
    assert_eq!(conn.address().family(), Family::Socket);
    assert_eq!(conn.options().model.as_deref(), Some("PS-1"));
}

/// Disconnecting releases the transport exactly once, no matter how often it is called.
#[rstest]
fn test_disconnect_is_idempotent(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    let closed = close_counter(&mut conn);
    conn.disconnect().unwrap();
    conn.disconnect().unwrap();
    assert!(!conn.is_connected());
    drop(conn);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

/// Dropping a connection disconnects it.
#[rstest]
fn test_drop_disconnects(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    let closed = close_counter(&mut conn);
    assert_eq!(closed.load(Ordering::SeqCst), 0);
    drop(conn);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

/// Every operation fails after the connection was closed.
#[rstest]
fn test_io_after_disconnect(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    conn.disconnect().unwrap();
    assert!(matches!(conn.write(b"x"), Err(EquipmentError::ConnectionClosed)));
    assert!(matches!(conn.read(), Err(EquipmentError::ConnectionClosed)));
    assert!(matches!(
        conn.read_exact(1),
        Err(EquipmentError::ConnectionClosed)
    ));
    assert!(matches!(conn.clear(), Err(EquipmentError::ConnectionClosed)));
    assert!(matches!(
        conn.message_based(),
        Err(EquipmentError::ConnectionClosed)
    ));
    assert!(conn.abort_handle().is_none());
}

/// Controller operations that a transport does not implement are reported as such.
#[rstest]
fn test_unsupported_controller_operations(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    for result in [
        conn.trigger(),
        conn.clear(),
        conn.remote(),
        conn.local(),
        conn.interface_clear(),
    ] {
        assert!(matches!(
            result,
            Err(EquipmentError::InterfaceCommandNotSupported)
        ));
    }
    assert!(matches!(
        conn.read_stb(),
        Err(EquipmentError::InterfaceCommandNotSupported)
    ));
}

/// The concrete transport is only returned for the right type.
#[rstest]
fn test_transport_mut(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    assert!(conn.transport_mut::<EchoTransport>().is_ok());
    assert!(matches!(
        conn.transport_mut::<LoopbackTransport>(),
        Err(EquipmentError::InvalidArgument(_))
    ));
}

/// A read that gets no answer times out, the connection stays usable.
#[rstest]
fn test_timeout_keeps_connection(registry: Registry) {
    let mut conn = registry.connect("TCP::localhost::5025", options()).unwrap();
    let err = conn.read().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(conn.is_connected());
    assert_eq!(conn.query_str("ping").unwrap(), "ping");
}

/// The connection options decide how strings are handled.
#[rstest]
fn test_rstrip(registry: Registry) {
    let mut conn = registry
        .connect("TCP::localhost::5025", options().with_rstrip(true))
        .unwrap();
    assert_eq!(conn.query_str("1.0 \t").unwrap(), "1.0");
}

/// An address without a backend cannot be resolved.
#[rstest]
fn test_no_backend(registry: Registry) {
    let err = registry
        .connect("GPIB0::6::INSTR", ConnectOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}

/// Malformed addresses and options are rejected before the backend is called.
#[rstest]
fn test_rejected_before_open() {
    let opened = Arc::new(AtomicUsize::new(0));
    let registry = Registry::empty();
    let counter = Arc::clone(&opened);
    registry.set_default(
        Family::Socket,
        Backend::message(
            "counting",
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(EchoTransport::new())
            },
            b"\n",
            b"\n",
        ),
    );

    let err = registry
        .connect("TCP::localhost", ConnectOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    let err = registry
        .connect(
            "TCP::localhost::5025",
            ConnectOptions::default().with_max_read_size(0),
        )
        .unwrap_err();
    assert!(matches!(err, EquipmentError::InvalidArgument(_)));
    assert_eq!(opened.load(Ordering::SeqCst), 0);

    registry
        .connect("TCP::localhost::5025", ConnectOptions::default())
        .unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1);
}

/// A failing backend reports a connection error.
#[rstest]
fn test_backend_error() {
    let registry = Registry::empty();
    registry.set_default(
        Family::Zmq,
        Backend::new("broken", |_, _| Err(EquipmentError::ConnectionClosed)),
    );
    let err = registry
        .connect("ZMQ::localhost::5555", ConnectOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

/// A record of an equipment register, deserialized from JSON.
#[rstest]
fn test_equipment_record(registry: Registry) {
    let json = r#"{
        "manufacturer": "Acme",
        "model": "PS-1",
        "serial": "0042",
        "address": "TCP::localhost::5025",
        "properties": {"timeout": 0.05, "termination": "\r"}
    }"#;
    let record: EquipmentRecord = serde_json::from_str(json).unwrap();
    let options = record.options();
    assert_eq!(options.manufacturer.as_deref(), Some("Acme"));
    assert_eq!(options.serial_number.as_deref(), Some("0042"));
    assert_eq!(options.timeout, Some(Duration::from_millis(50)));

    let mut conn = record.connect_with(&registry).unwrap();
    assert_eq!(conn.name(), "SOCKET<Acme|PS-1|0042 at TCP::localhost::5025>");
    assert_eq!(conn.message_based().unwrap().read_termination(), b"\r");
    assert_eq!(conn.query_str("V?").unwrap(), "V?");
}

/// Properties in the record do not override an empty identity.
#[rstest]
fn test_equipment_record_identity() {
    let record = EquipmentRecord {
        manufacturer: "Acme".to_string(),
        properties: ConnectOptions::default().with_model("from-properties"),
        ..Default::default()
    };
    let options = record.options();
    assert_eq!(options.manufacturer.as_deref(), Some("Acme"));
    assert_eq!(options.model.as_deref(), Some("from-properties"));
}

/// An abort handle makes a blocked read fail from another thread.
#[rstest]
fn test_abort_handle(registry: Registry) {
    let mut conn = registry
        .connect("TCP::localhost::5025", ConnectOptions::default())
        .unwrap();
    let handle = conn.abort_handle().unwrap();
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.abort();
    });
    assert!(matches!(conn.read(), Err(EquipmentError::ConnectionClosed)));
    aborter.join().unwrap();
}

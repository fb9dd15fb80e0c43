//! Test cases for the LoopbackTransport and the EchoTransport.

use std::{sync::atomic::Ordering, time::Duration};

use rstest::*;

use equipmentrs::{
    EchoTransport, EquipmentError, LoopbackTransport, MessageBased, MessageInterface, Transport,
};

/// A function that creates a new `LoopbackTransport` with the given input and output vectors.
fn crt_lbk(from_host: Vec<&str>, from_inst: Vec<&str>) -> LoopbackTransport {
    LoopbackTransport::new(
        from_host.into_iter().map(|s| s.as_bytes().to_vec()).collect(),
        from_inst.into_iter().map(|s| s.as_bytes().to_vec()).collect(),
    )
}

/// Create a loopback transport that contains no commands.
#[fixture]
fn emp_lbk() -> LoopbackTransport {
    crt_lbk(vec![], vec![])
}

/// Ensure `finalize` method passes if an empty loopback transport is used.
///
/// This routine calls the finalize method manually, however, it is not necessary to do so as it is
/// implemented in the `Drop` trait for `LoopbackTransport`.
#[rstest]
fn finalize_test(mut emp_lbk: LoopbackTransport) {
    emp_lbk.finalize();
}

/// Ensure `finalize` method panics if bytes are left in the loopback transport.
#[rstest]
#[case(vec!["cmd"], vec![])]
#[case(vec![], vec!["resp"])]
#[case(vec!["cmd"], vec!["resp"])]
#[should_panic]
fn finalize_test_panic(#[case] from_host: Vec<&str>, #[case] from_inst: Vec<&str>) {
    let mut lbk = crt_lbk(from_host, from_inst);
    lbk.finalize();
}

/// Dropping a loopback transport with unused bytes panics.
#[rstest]
#[should_panic]
fn drop_with_leftover() {
    let _lbk = crt_lbk(vec!["cmd"], vec![]);
}

/// An answer that was only partially read is a leftover as well.
#[rstest]
#[should_panic]
fn finalize_partial_answer() {
    let mut lbk = crt_lbk(vec![], vec!["abc"]);
    lbk.read_raw(1, None).unwrap();
    lbk.finalize();
}

#[rstest]
fn write_raw() {
    let mut lbk = crt_lbk(vec!["cmd1", "cmd2"], vec![]);
    assert_eq!(lbk.write_raw(b"cmd1", None).unwrap(), 4);
    assert_eq!(lbk.write_raw(b"cmd2", None).unwrap(), 4);
    lbk.finalize();
}

#[rstest]
#[should_panic]
fn write_raw_mismatch() {
    let mut lbk = crt_lbk(vec!["cmd1"], vec![]);
    let _ = lbk.write_raw(b"cmd3", None);
}

#[rstest]
#[should_panic]
fn write_raw_unexpected(mut emp_lbk: LoopbackTransport) {
    let _ = emp_lbk.write_raw(b"cmd", None);
}

#[rstest]
#[should_panic]
fn read_raw_unexpected(mut emp_lbk: LoopbackTransport) {
    let _ = emp_lbk.read_raw(16, None);
}

/// Answers are handed out in pieces of at most the chunk size.
#[rstest]
fn read_raw_chunks() {
    let mut lbk = crt_lbk(vec![], vec!["abcde"]).with_chunk_size(2);
    assert_eq!(lbk.read_raw(16, None).unwrap().data, b"ab");
    assert_eq!(lbk.read_raw(1, None).unwrap().data, b"c");
    assert_eq!(lbk.read_raw(16, None).unwrap().data, b"de");
    lbk.finalize();
}

/// With end marks, the last chunk of every answer ends a message.
#[rstest]
fn read_raw_end_marks() {
    let mut lbk = crt_lbk(vec![], vec!["abc"]).with_end_marks().with_chunk_size(2);
    assert!(!lbk.read_raw(16, None).unwrap().end);
    assert!(lbk.read_raw(16, None).unwrap().end);
}

/// A closed loopback transport refuses any I/O.
#[rstest]
fn closed(mut emp_lbk: LoopbackTransport) {
    emp_lbk.close().unwrap();
    assert!(emp_lbk.is_closed());
    assert!(matches!(
        emp_lbk.write_raw(b"x", None),
        Err(EquipmentError::ConnectionClosed)
    ));
    assert!(matches!(
        emp_lbk.read_raw(1, None),
        Err(EquipmentError::ConnectionClosed)
    ));
}

/// A scripted conversation through the protocol engine.
#[rstest]
fn conversation() {
    let lbk = crt_lbk(
        vec!["*IDN?\r\n", "VOLT 1.5\r\n", "VOLT?\r\n"],
        vec!["ACME,PS-1,0042,1.0\n", "+1.500\n"],
    );
    let mut inst = MessageBased::new(lbk);
    assert_eq!(inst.query_str("*IDN?").unwrap(), "ACME,PS-1,0042,1.0");
    inst.write_str("VOLT 1.5").unwrap();
    assert_eq!(inst.query_str("VOLT?").unwrap(), "+1.500");
}

/// The echo transport returns what was written.
#[rstest]
fn echo() {
    let mut echo = EchoTransport::new().with_chunk_size(3);
    assert_eq!(echo.write_raw(b"hello", None).unwrap(), 5);
    assert_eq!(echo.read_raw(16, None).unwrap().data, b"hel");
    assert_eq!(echo.read_raw(16, None).unwrap().data, b"lo");
}

/// The echo transport accepts at most the write limit per call.
#[rstest]
fn echo_write_limit() {
    let mut echo = EchoTransport::new().with_write_limit(2);
    assert_eq!(echo.write_raw(b"hello", None).unwrap(), 2);
    assert_eq!(echo.read_raw(16, None).unwrap().data, b"he");
}

/// Without pending bytes, the echo transport waits for the timeout.
#[rstest]
fn echo_timeout() {
    let mut echo = EchoTransport::new();
    let err = echo
        .read_raw(16, Some(Duration::from_millis(20)))
        .unwrap_err();
    assert!(err.is_timeout());
}

/// Closing the echo transport is counted and makes it fail.
#[rstest]
fn echo_close() {
    let mut echo = EchoTransport::new().with_pending(b"unsolicited");
    let closed = echo.close_counter();
    echo.close().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        echo.write_raw(b"x", None),
        Err(EquipmentError::ConnectionClosed)
    ));
}

//! Tests for the message-based protocol engine, driven by the loopback and echo transports.

use std::{
    thread,
    time::{Duration, Instant},
};

use rstest::*;

use equipmentrs::{
    BlockDetection, ConnectOptions, EchoTransport, Encoding, EquipmentError, LoopbackTransport,
    MessageBased, MessageInterface, Transport,
};

fn loopback(from_host: &[&[u8]], from_inst: &[&[u8]]) -> MessageBased<LoopbackTransport> {
    let transport = LoopbackTransport::new(
        from_host.iter().map(|b| b.to_vec()).collect(),
        from_inst.iter().map(|b| b.to_vec()).collect(),
    );
    MessageBased::new(transport)
}

#[fixture]
fn echo() -> MessageBased<EchoTransport> {
    let mut inst = MessageBased::new(EchoTransport::new());
    inst.set_termination(b"\n");
    inst.set_timeout(Some(Duration::from_millis(50))).unwrap();
    inst
}

/// The default terminations are `\n` for reading and `\r\n` for writing.
#[rstest]
fn test_default_terminations() {
    let mut inst = loopback(&[b"*IDN?\r\n"], &[b"ACME,1,2,3\n"]);
    assert_eq!(inst.read_termination(), b"\n");
    assert_eq!(inst.write_termination(), b"\r\n");
    assert_eq!(inst.timeout(), None);
    assert_eq!(inst.query_str("*IDN?").unwrap(), "ACME,1,2,3");
}

/// The write termination is not appended a second time.
#[rstest]
fn test_write_termination_not_doubled() {
    let mut inst = loopback(&[b"*RST\r\n", b"*CLS\r\n"], &[]);
    assert_eq!(inst.write(b"*RST").unwrap(), 6);
    assert_eq!(inst.write(b"*CLS\r\n").unwrap(), 6);
}

/// An empty write termination sends the bytes as they are.
#[rstest]
fn test_no_write_termination() {
    let mut inst = loopback(&[b"raw"], &[]);
    inst.set_write_termination(b"");
    assert_eq!(inst.write(b"raw").unwrap(), 3);
}

/// Bytes received after a termination are kept for the next read.
#[rstest]
fn test_leftover_for_next_read() {
    let mut inst = loopback(&[], &[b"one\ntwo\nthree\n"]);
    assert_eq!(inst.read().unwrap(), b"one");
    assert_eq!(inst.read().unwrap(), b"two");
    assert_eq!(inst.read().unwrap(), b"three");
}

/// A message that arrives byte by byte is assembled.
#[rstest]
#[case(1)]
#[case(2)]
#[case(5)]
fn test_chunked_message(#[case] chunk_size: usize) {
    let transport =
        LoopbackTransport::new(vec![], vec![b"+1.2345E-03\r\n".to_vec()]).with_chunk_size(chunk_size);
    let mut inst = MessageBased::new(transport);
    inst.set_read_termination(b"\r\n");
    assert_eq!(inst.read_string().unwrap(), "+1.2345E-03");
}

/// The engine requests at most its chunk size from the transport.
#[rstest]
fn test_engine_chunk_size() {
    let mut inst = loopback(&[], &[b"abcdef\n"]);
    inst.set_chunk_size(3);
    assert_eq!(inst.read().unwrap(), b"abcdef");
}

/// A termination inside a definite length block is part of the payload.
#[rstest]
fn test_block_with_termination() {
    let mut inst = loopback(&[], &[b"#15a\nb\nc\n"]);
    assert_eq!(inst.read().unwrap(), b"a\nb\nc");
}

/// A block that is split over several reads is still returned in one piece.
#[rstest]
fn test_block_split_over_reads() {
    let mut data = b"#2".to_vec();
    data.extend_from_slice(b"10");
    data.extend_from_slice(&[b'\n'; 10]);
    data.push(b'\n');
    let transport = LoopbackTransport::new(vec![], vec![data]).with_chunk_size(3);
    let mut inst = MessageBased::new(transport);
    assert_eq!(inst.read().unwrap(), vec![b'\n'; 10]);
}

/// Where a block header is recognized depends on the block detection.
#[rstest]
#[case(BlockDetection::Disabled, b"DATA #14abcd".as_slice())]
#[case(BlockDetection::Leading, b"DATA #14abcd".as_slice())]
#[case(BlockDetection::Anywhere, b"DATA abcd".as_slice())]
fn test_block_detection(#[case] detection: BlockDetection, #[case] expected: &[u8]) {
    let mut inst = loopback(&[], &[b"DATA #14abcd\n"]);
    inst.set_block_detection(detection);
    assert_eq!(inst.read().unwrap(), expected);
}

/// Without block detection, the termination inside the payload ends the message.
#[rstest]
fn test_block_detection_disabled_splits() {
    let mut inst = loopback(&[], &[b"#13a\nb\n"]);
    inst.set_block_detection(BlockDetection::Disabled);
    assert_eq!(inst.read().unwrap(), b"#13a");
    assert_eq!(inst.read().unwrap(), b"b");
}

/// A malformed block header is a protocol error.
#[rstest]
fn test_invalid_block_header() {
    let mut inst = loopback(&[], &[b"#2x1abc\n"]);
    let err = inst.read().unwrap_err();
    assert!(matches!(err, EquipmentError::InvalidBlockHeader(_)), "{err:?}");
}

/// `read_exact` ignores the termination.
#[rstest]
fn test_read_exact() {
    let mut inst = loopback(&[], &[b"abc\ndef"]);
    assert_eq!(inst.read_exact(4).unwrap(), b"abc\n");
    assert_eq!(inst.read_exact(3).unwrap(), b"def");
}

/// `read_exact` and `read` share the buffer.
#[rstest]
fn test_read_exact_then_read() {
    let mut inst = loopback(&[], &[b"#205hello\n"]);
    assert_eq!(inst.read_exact(4).unwrap(), b"#205");
    assert_eq!(inst.read().unwrap(), b"hello");
}

/// The transport signals the end of a message, e.g., a datagram or the END bit.
#[rstest]
fn test_end_marks_without_termination() {
    let transport =
        LoopbackTransport::new(vec![], vec![b"first".to_vec(), b"second".to_vec()]).with_end_marks();
    let mut inst = MessageBased::new(transport);
    inst.set_read_termination(b"");
    assert_eq!(inst.read().unwrap(), b"first");
    assert_eq!(inst.read().unwrap(), b"second");
}

/// The bytes that follow a binary block up to the end mark belong to the block's message.
#[rstest]
#[case(None)]
#[case(Some(8))]
#[case(Some(3))]
fn test_block_followed_by_end_mark(#[case] chunk_size: Option<usize>) {
    let mut transport = LoopbackTransport::new(
        vec![],
        vec![b"#15hello\n".to_vec(), b"next".to_vec()],
    )
    .with_end_marks();
    if let Some(chunk_size) = chunk_size {
        transport = transport.with_chunk_size(chunk_size);
    }
    let mut inst = MessageBased::new(transport);
    inst.set_read_termination(b"");
    assert_eq!(inst.read().unwrap(), b"hello");
    assert_eq!(inst.read().unwrap(), b"next");
}

/// A termination at the end of a marked message is removed.
#[rstest]
fn test_end_marks_with_termination() {
    let transport = LoopbackTransport::new(vec![], vec![b"value\n".to_vec()]).with_end_marks();
    let mut inst = MessageBased::new(transport);
    assert_eq!(inst.read().unwrap(), b"value");
}

/// The peer closing the connection before any byte arrived.
#[rstest]
fn test_eof_without_data() {
    let mut inst = loopback(&[], &[b""]);
    assert!(matches!(
        inst.read().unwrap_err(),
        EquipmentError::ConnectionClosed
    ));
}

/// The peer closing the connection in the middle of a message.
#[rstest]
fn test_eof_without_termination() {
    let mut inst = loopback(&[], &[b"abc", b""]);
    let err = inst.read().unwrap_err();
    assert_eq!(err.partial_data(), Some(b"abc".as_slice()));
    assert!(matches!(err, EquipmentError::TerminatorNotFound { .. }));
}

/// Without a read termination, EOF ends the message.
#[rstest]
fn test_eof_ends_unterminated_message() {
    let mut inst = loopback(&[], &[b"abc", b""]);
    inst.set_read_termination(b"");
    assert_eq!(inst.read().unwrap(), b"abc");
}

/// A read without an answer times out.
#[rstest]
fn test_timeout(mut echo: MessageBased<EchoTransport>) {
    let err = echo.read().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.partial_data(), Some(b"".as_slice()));
}

/// The bytes received before the timeout are attached to the error.
#[rstest]
fn test_timeout_keeps_partial_data() {
    let mut inst = MessageBased::new(EchoTransport::new().with_pending(b"+1.23"));
    inst.set_timeout(Some(Duration::from_millis(50))).unwrap();
    match inst.read() {
        Err(EquipmentError::Timeout { timeout, partial }) => {
            assert_eq!(timeout, Duration::from_millis(50));
            assert_eq!(partial, b"+1.23");
        }
        other => panic!("Expected a timeout, got {other:?}"),
    }
}

/// A read without an answer fails when the timeout expires, neither earlier nor much later.
#[rstest]
fn test_timeout_boundary() {
    let timeout = Duration::from_millis(200);
    let mut inst = MessageBased::new(EchoTransport::new());
    inst.set_timeout(Some(timeout)).unwrap();
    let start = Instant::now();
    assert!(inst.read().unwrap_err().is_timeout());
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout - Duration::from_millis(10), "{elapsed:?}");
    assert!(elapsed <= timeout + Duration::from_millis(500), "{elapsed:?}");
}

/// The timeout applies to the whole read, not to every chunk.
#[rstest]
fn test_timeout_spans_chunks() {
    let transport = EchoTransport::new().with_chunk_size(1).with_pending(b"abc");
    let mut inst = MessageBased::new(transport);
    inst.set_timeout(Some(Duration::from_millis(100))).unwrap();
    let start = Instant::now();
    assert!(inst.read().unwrap_err().is_timeout());
    assert!(start.elapsed() < Duration::from_secs(2));
}

/// A zero timeout is rejected, `None` blocks forever.
#[rstest]
fn test_zero_timeout_rejected(mut echo: MessageBased<EchoTransport>) {
    assert!(matches!(
        echo.set_timeout(Some(Duration::ZERO)),
        Err(EquipmentError::InvalidArgument(_))
    ));
    assert_eq!(echo.timeout(), Some(Duration::from_millis(50)));
    echo.set_timeout(None).unwrap();
    assert_eq!(echo.timeout(), None);
}

/// Writes that the transport only partially accepts are completed.
#[rstest]
fn test_partial_writes() {
    let mut inst = MessageBased::new(EchoTransport::new().with_write_limit(2));
    inst.set_termination(b"\n");
    assert_eq!(inst.write(b"hello").unwrap(), 6);
    assert_eq!(inst.read().unwrap(), b"hello");
}

/// A message that is longer than the maximum read size is an error.
#[rstest]
fn test_max_read_size_message(mut echo: MessageBased<EchoTransport>) {
    echo.set_max_read_size(4).unwrap();
    echo.write(b"0123456789").unwrap();
    assert!(matches!(
        echo.read(),
        Err(EquipmentError::MaxReadSizeExceeded { size: 10, max: 4 })
    ));
}

/// Runaway data without a termination is an error as soon as it exceeds the maximum read size.
#[rstest]
fn test_max_read_size_runaway() {
    let transport = EchoTransport::new()
        .with_chunk_size(3)
        .with_pending(b"0123456789");
    let mut inst = MessageBased::new(transport);
    inst.set_timeout(Some(Duration::from_secs(5))).unwrap();
    inst.set_max_read_size(4).unwrap();
    let err = inst.read().unwrap_err();
    assert!(matches!(err, EquipmentError::MaxReadSizeExceeded { max: 4, .. }), "{err:?}");
}

#[rstest]
fn test_max_read_size_read_exact(mut echo: MessageBased<EchoTransport>) {
    echo.set_max_read_size(4).unwrap();
    assert!(matches!(
        echo.read_exact(5),
        Err(EquipmentError::MaxReadSizeExceeded { size: 5, max: 4 })
    ));
    assert!(echo.set_max_read_size(0).is_err());
}

/// Strings are encoded and decoded with the configured codec.
#[rstest]
fn test_encoding() {
    let mut inst = loopback(&[&[b'V', 0xB5, b'\r', b'\n']], &[&[0xB5, b'A', b'\n']]);
    inst.set_encoding(Encoding::Latin1);
    assert_eq!(inst.query_str("Vµ").unwrap(), "µA");
}

/// Characters that the codec cannot represent are an error.
#[rstest]
fn test_encoding_error(mut echo: MessageBased<EchoTransport>) {
    echo.set_encoding(Encoding::Ascii);
    assert!(echo.write_str("µ").is_err());
}

/// Trailing whitespace is removed on request.
#[rstest]
#[case(false, "1.0  \r")]
#[case(true, "1.0")]
fn test_rstrip(#[case] rstrip: bool, #[case] expected: &str) {
    let mut inst = loopback(&[], &[b"1.0  \r\n"]);
    inst.set_rstrip(rstrip);
    assert_eq!(inst.read_string().unwrap(), expected);
}

/// The options configure the engine, the family defaults fill in what they leave open.
#[rstest]
fn test_with_options() {
    let options = ConnectOptions::default()
        .with_read_termination(b"\r")
        .with_timeout(Some(Duration::from_secs(3)))
        .with_max_read_size(64);
    let inst = MessageBased::with_options(EchoTransport::new(), &options, b"\n", b"\n").unwrap();
    assert_eq!(inst.read_termination(), b"\r");
    assert_eq!(inst.write_termination(), b"\n");
    assert_eq!(inst.timeout(), Some(Duration::from_secs(3)));
    assert_eq!(inst.max_read_size(), 64);
}

#[rstest]
fn test_with_options_invalid() {
    let options = ConnectOptions::default().with_timeout(Some(Duration::ZERO));
    assert!(MessageBased::with_options(EchoTransport::new(), &options, b"\n", b"\n").is_err());
}

/// Changing the read termination applies to bytes that are already buffered.
#[rstest]
fn test_change_termination_with_buffered_bytes() {
    let mut inst = loopback(&[], &[b"a\rb\n"]);
    inst.set_read_termination(b"\r");
    assert_eq!(inst.read().unwrap(), b"a");
    inst.set_read_termination(b"\n");
    assert_eq!(inst.read().unwrap(), b"b");
}

/// Bytes that were not read yet are discarded on request.
#[rstest]
fn test_clear_buffer(mut echo: MessageBased<EchoTransport>) {
    echo.write(b"one").unwrap();
    echo.write(b"two").unwrap();
    assert_eq!(echo.read().unwrap(), b"one");
    echo.clear_buffer();
    echo.write(b"three").unwrap();
    assert_eq!(echo.read().unwrap(), b"three");
}

/// A blocked read fails promptly when it is aborted from another thread.
#[rstest]
fn test_abort_blocked_read() {
    let mut inst = MessageBased::new(EchoTransport::new());
    let handle = inst.transport().abort_handle().unwrap();
    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.abort();
    });
    assert!(matches!(
        inst.read().unwrap_err(),
        EquipmentError::ConnectionClosed
    ));
    aborter.join().unwrap();
}

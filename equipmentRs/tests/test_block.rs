//! Tests for the binary block formats.

use rstest::*;

use equipmentrs::{
    EquipmentError, LoopbackTransport, MessageBased, MessageInterface,
    block::{BlockHeader, ByteOrder, Format, from_bytes, to_bytes},
};

#[rstest]
#[case(b"#15abcde".as_slice(), BlockHeader::Definite { header_len: 3, data_len: 5 })]
#[case(b"#210".as_slice(), BlockHeader::Definite { header_len: 4, data_len: 10 })]
#[case(b"#40000".as_slice(), BlockHeader::Definite { header_len: 6, data_len: 0 })]
#[case(b"#0abc\n".as_slice(), BlockHeader::Indefinite)]
fn test_header(#[case] data: &[u8], #[case] header: BlockHeader) {
    assert_eq!(BlockHeader::parse(data).unwrap(), Some(header));
}

#[rstest]
#[case(b"15abc".as_slice())]
#[case(b"#x5abc".as_slice())]
#[case(b"#3a00".as_slice())]
fn test_header_invalid(#[case] data: &[u8]) {
    assert!(matches!(
        BlockHeader::parse(data),
        Err(EquipmentError::InvalidBlockHeader(_))
    ));
}

#[rstest]
fn test_ieee_little_endian() {
    let data = to_bytes(&[1u16, 258], Format::Ieee, ByteOrder::Little).unwrap();
    assert_eq!(data, b"#14\x01\x00\x02\x01");
}

#[rstest]
fn test_ieee_big_endian() {
    let data = to_bytes(&[1u16, 258], Format::Ieee, ByteOrder::Big).unwrap();
    assert_eq!(data, b"#14\x00\x01\x01\x02");
    let values: Vec<u16> = from_bytes(&data, Format::Ieee, ByteOrder::Big).unwrap();
    assert_eq!(values, vec![1, 258]);
}

/// The number of length digits grows with the payload.
#[rstest]
fn test_ieee_length_digits() {
    let values = vec![0.5f64; 200];
    let data = to_bytes(&values, Format::Ieee, ByteOrder::Little).unwrap();
    assert_eq!(&data[..6], b"#41600");
    assert_eq!(data.len(), 6 + 1600);
}

#[rstest]
fn test_hp() {
    let data = to_bytes(&[-1i16, 2], Format::Hp, ByteOrder::Big).unwrap();
    assert_eq!(data, b"#A\x00\x04\xFF\xFF\x00\x02");
    let values: Vec<i16> = from_bytes(&data, Format::Hp, ByteOrder::Big).unwrap();
    assert_eq!(values, vec![-1, 2]);
}

#[rstest]
fn test_hp_too_large() {
    let values = vec![0u8; 65536];
    assert!(matches!(
        to_bytes(&values, Format::Hp, ByteOrder::Little),
        Err(EquipmentError::InvalidArgument(_))
    ));
}

#[rstest]
fn test_ascii() {
    let data = to_bytes(&[1.5f32, -2.0, 3.25], Format::Ascii, ByteOrder::Little).unwrap();
    assert_eq!(data, b"1.5,-2,3.25");
    let values: Vec<f32> = from_bytes(b" 1.5, -2 ,3.25,", Format::Ascii, ByteOrder::Little).unwrap();
    assert_eq!(values, vec![1.5, -2.0, 3.25]);
}

#[rstest]
fn test_ascii_invalid() {
    assert!(from_bytes::<i32>(b"1,two,3", Format::Ascii, ByteOrder::Little).is_err());
}

#[rstest]
fn test_raw() {
    let data = to_bytes(&[0x01020304u32], Format::Raw, ByteOrder::Big).unwrap();
    assert_eq!(data, [1, 2, 3, 4]);
    let values: Vec<u32> = from_bytes(&data, Format::Raw, ByteOrder::Little).unwrap();
    assert_eq!(values, vec![0x04030201]);
}

/// Bytes that do not fill a whole value are an error, not silently dropped.
#[rstest]
#[case(Format::Raw, &[1, 2, 3, 4, 5, 6])]
#[case(Format::Ieee, b"#16\x01\x02\x03\x04\x05\x06")]
fn test_incomplete_value(#[case] format: Format, #[case] data: &[u8]) {
    assert!(matches!(
        from_bytes::<f32>(data, format, ByteOrder::Little),
        Err(EquipmentError::Protocol(_))
    ));
}

/// A response header in front of the block is skipped.
#[rstest]
fn test_skip_response_header() {
    let values: Vec<u8> = from_bytes(b":CURV #13\x01\x02\x03", Format::Ieee, ByteOrder::Little).unwrap();
    assert_eq!(values, vec![1, 2, 3]);
}

/// An indefinite length block ends with the message, the trailing line feed is not data.
#[rstest]
fn test_indefinite() {
    let values: Vec<u8> = from_bytes(b"#0\x07\x08\n", Format::Ieee, ByteOrder::Little).unwrap();
    assert_eq!(values, vec![7, 8]);
}

/// A block that is shorter than its header claims is an error.
#[rstest]
fn test_truncated() {
    assert!(matches!(
        from_bytes::<u8>(b"#15abc", Format::Ieee, ByteOrder::Little),
        Err(EquipmentError::Protocol(_))
    ));
    assert!(matches!(
        from_bytes::<u8>(b"no block", Format::Ieee, ByteOrder::Little),
        Err(EquipmentError::InvalidBlockHeader(_))
    ));
}

/// A block written with the engine reaches the equipment unchanged, and a block that contains
/// the termination is read back as one message.
#[rstest]
fn test_block_through_engine() {
    let block = to_bytes(&[13u8, 10, 7], Format::Ieee, ByteOrder::Little).unwrap();
    let mut command = b"DATA ".to_vec();
    command.extend_from_slice(&block);
    let mut expected_write = command.clone();
    expected_write.push(b'\n');
    let mut answer = block.clone();
    answer.push(b'\n');

    let transport = LoopbackTransport::new(vec![expected_write], vec![answer]);
    let mut inst = MessageBased::new(transport);
    inst.set_termination(b"\n");
    inst.write(&command).unwrap();
    assert_eq!(inst.read().unwrap(), vec![13, 10, 7]);
}

//! Tests for parsing and formatting address strings.

use rstest::*;

use equipmentrs::{
    Address, AddressFields, EquipmentError, ErrorKind, Family, GpibTarget, SocketProtocol, UsbMode,
};

fn parse(address: &str) -> Address {
    Address::parse(address).unwrap()
}

/// Every family prefix is recognized, case-insensitively.
#[rstest]
#[case("COM3", Family::Serial)]
#[case("com3", Family::Serial)]
#[case("ASRL7", Family::Serial)]
#[case("ASRLCOM2", Family::Serial)]
#[case("ASRL/dev/ttyUSB0::INSTR", Family::Serial)]
#[case("GPIB0::6::INSTR", Family::Gpib)]
#[case("gpib::INTFC", Family::Gpib)]
#[case("TCP::10.0.0.2::5025", Family::Socket)]
#[case("UDP::10.0.0.2::5025", Family::Socket)]
#[case("TCPIP0::10.0.0.2::5025::SOCKET", Family::Socket)]
#[case("TCPIP::10.0.0.2", Family::Vxi11)]
#[case("TCPIP::10.0.0.2::gpib0,5::INSTR", Family::Vxi11)]
#[case("TCPIP::10.0.0.2::hislip0", Family::Hislip)]
#[case("Prologix::192.168.1.70::1234::6", Family::Prologix)]
#[case("PROLOGIX::/dev/ttyUSB0::GPIB::6", Family::Prologix)]
#[case("USB::0x0957::0x1796::MY123::INSTR", Family::Usb)]
#[case("FTDI::0x0403::0x6001::FT123", Family::Ftdi)]
#[case("SDK::libvendor.so", Family::Sdk)]
#[case("ZMQ::10.0.0.2::5555", Family::Zmq)]
fn test_family(#[case] address: &str, #[case] family: Family) {
    assert_eq!(parse(address).family(), family);
}

/// Serial port names are normalized.
#[rstest]
#[case("COM3", "COM3")]
#[case("ASRL3", "COM3")]
#[case("ASRLCOM12", "COM12")]
#[case("ASRL/dev/ttyS0", "/dev/ttyS0")]
#[case("ASRL/dev/ttyUSB0::INSTR", "/dev/ttyUSB0")]
fn test_serial_port(#[case] address: &str, #[case] port: &str) {
    assert_eq!(
        parse(address).fields(),
        &AddressFields::Serial {
            port: port.to_string()
        }
    );
}

/// GPIB primary and secondary addresses, the board and the interface target.
#[rstest]
#[case("GPIB::6", 0, GpibTarget::Device { pad: 6, sad: None })]
#[case("GPIB1::6::INSTR", 1, GpibTarget::Device { pad: 6, sad: None })]
#[case("GPIB0::30::96::INSTR", 0, GpibTarget::Device { pad: 30, sad: Some(96) })]
#[case("GPIB0::1::0", 0, GpibTarget::Device { pad: 1, sad: Some(0) })]
#[case("GPIB2::INTFC", 2, GpibTarget::Interface)]
#[case("GPIB0::dmm34401", 0, GpibTarget::Named("dmm34401".to_string()))]
fn test_gpib(#[case] address: &str, #[case] board: u32, #[case] target: GpibTarget) {
    let addr = parse(address);
    assert_eq!(addr.board(), board);
    assert_eq!(addr.fields(), &AddressFields::Gpib(target));
}

/// The LAN families distinguish sockets, VXI-11 and HiSLIP by their tokens.
#[rstest]
fn test_tcpip_socket() {
    assert_eq!(
        parse("TCPIP0::192.168.1.20::5025::SOCKET").fields(),
        &AddressFields::Socket {
            protocol: SocketProtocol::Tcp,
            host: "192.168.1.20".to_string(),
            port: 5025
        }
    );
    assert_eq!(
        parse("UDP::scope.lab::1234").fields(),
        &AddressFields::Socket {
            protocol: SocketProtocol::Udp,
            host: "scope.lab".to_string(),
            port: 1234
        }
    );
}

#[rstest]
#[case("TCPIP::192.168.1.20", "inst0")]
#[case("TCPIP::192.168.1.20::INSTR", "inst0")]
#[case("TCPIP1::192.168.1.20::gpib0,2::INSTR", "gpib0,2")]
fn test_vxi11(#[case] address: &str, #[case] device_name: &str) {
    assert_eq!(
        parse(address).fields(),
        &AddressFields::Vxi11 {
            host: "192.168.1.20".to_string(),
            device_name: device_name.to_string()
        }
    );
}

#[rstest]
#[case("TCPIP::10.0.0.1::hislip0", "hislip0", 4880)]
#[case("TCPIP::10.0.0.1::hislip1::INSTR", "hislip1", 4880)]
#[case("TCPIP::10.0.0.1::hislip0,4881::INSTR", "hislip0", 4881)]
fn test_hislip(#[case] address: &str, #[case] sub_address: &str, #[case] port: u16) {
    let addr = parse(address);
    assert_eq!(addr.host(), Some("10.0.0.1"));
    assert_eq!(
        addr.fields(),
        &AddressFields::Hislip {
            host: "10.0.0.1".to_string(),
            sub_address: sub_address.to_string(),
            port
        }
    );
}

/// A Prologix address names an ethernet controller with a port of at least four digits, or a
/// serial port of a USB controller.
#[rstest]
#[case("Prologix::192.168.1.70::1234::6", "192.168.1.70", Some(1234), 6, None)]
#[case("Prologix::192.168.1.70::1234::GPIB::6::112", "192.168.1.70", Some(1234), 6, Some(112))]
#[case("Prologix::COM3::6", "COM3", None, 6, None)]
#[case("Prologix::/dev/ttyUSB0::GPIB0::22::96", "/dev/ttyUSB0", None, 22, Some(96))]
fn test_prologix(
    #[case] address: &str,
    #[case] hw_address: &str,
    #[case] enet_port: Option<u16>,
    #[case] pad: u8,
    #[case] sad: Option<u8>,
) {
    assert_eq!(
        parse(address).fields(),
        &AddressFields::Prologix {
            hw_address: hw_address.to_string(),
            enet_port,
            pad,
            sad
        }
    );
}

/// USB IDs are accepted in hexadecimal and decimal notation, the qualifier selects the mode.
#[rstest]
#[case("USB::0x0957::0x1796::MY123::INSTR", None, UsbMode::Tmc)]
#[case("USB0::2391::6038::MY123", None, UsbMode::Tmc)]
#[case("USB::0x0957::0x1796::MY123::1::RAW", Some(1), UsbMode::Raw)]
fn test_usb(
    #[case] address: &str,
    #[case] interface_number: Option<u8>,
    #[case] mode: UsbMode,
) {
    assert_eq!(
        parse(address).fields(),
        &AddressFields::Usb {
            vendor_id: 0x0957,
            product_id: 0x1796,
            serial_number: "MY123".to_string(),
            interface_number,
            mode
        }
    );
}

#[rstest]
fn test_ftdi() {
    let addr = parse("FTDI0::0x0403::0x6001::FT4ABC::0");
    assert_eq!(
        addr.fields(),
        &AddressFields::Ftdi {
            vendor_id: 0x0403,
            product_id: 0x6001,
            serial_number: "FT4ABC".to_string(),
            interface_number: Some(0)
        }
    );
}

/// The SDK path is taken verbatim, even if it contains the separator.
#[rstest]
#[case("SDK::libvendor.so", "libvendor.so")]
#[case("SDK::C:\\Program Files\\Vendor\\vendor.dll", "C:\\Program Files\\Vendor\\vendor.dll")]
#[case("SDK::odd::name.so", "odd::name.so")]
fn test_sdk(#[case] address: &str, #[case] path: &str) {
    assert_eq!(
        parse(address).fields(),
        &AddressFields::Sdk {
            path: path.to_string()
        }
    );
}

#[rstest]
fn test_zmq() {
    assert_eq!(
        parse("ZMQ::127.0.0.1::5555").fields(),
        &AddressFields::Zmq {
            host: "127.0.0.1".to_string(),
            port: 5555
        }
    );
}

/// The raw string is kept as it was given.
#[rstest]
fn test_raw_is_kept() {
    let addr: Address = "gpib0::6".parse().unwrap();
    assert_eq!(addr.raw(), "gpib0::6");
    assert_eq!(addr.to_string(), "GPIB0::6::INSTR");
}

/// Formatting an address gives its canonical form, which parses to the same fields.
#[rstest]
#[case("COM3", "COM3")]
#[case("ASRL/dev/ttyUSB0", "ASRL/dev/ttyUSB0::INSTR")]
#[case("GPIB::6::96", "GPIB0::6::96::INSTR")]
#[case("GPIB1::INTFC", "GPIB1::INTFC")]
#[case("TCP::host::5025", "TCPIP0::host::5025::SOCKET")]
#[case("UDP::host::5025", "UDP::host::5025")]
#[case("TCPIP::host", "TCPIP0::host::inst0::INSTR")]
#[case("TCPIP::host::hislip0", "TCPIP0::host::hislip0,4880::INSTR")]
#[case("Prologix::host::1234::6", "Prologix::host::1234::GPIB::6")]
#[case("USB::0x957::0x1796::SN", "USB0::0x0957::0x1796::SN::INSTR")]
#[case("FTDI::1027::24577::SN", "FTDI0::0x0403::0x6001::SN")]
#[case("ZMQ::host::5555", "ZMQ::host::5555")]
fn test_canonical_form(#[case] address: &str, #[case] canonical: &str) {
    let addr = parse(address);
    assert_eq!(addr.to_string(), canonical);
    assert_eq!(parse(canonical).fields(), addr.fields());
}

/// Malformed addresses are rejected with a parse error.
#[rstest]
#[case("")]
#[case("FOO::bar")]
#[case("COM")]
#[case("COMx")]
#[case("GPIBx::6")]
#[case("GPIB0::31")]
#[case("GPIB0::6::50")]
#[case("GPIB0::6::127")]
#[case("GPIB0::6::96::1")]
#[case("GPIB0::")]
#[case("TCP::host")]
#[case("TCP::host::port")]
#[case("TCP::host::70000")]
#[case("TCPIP::::5025::SOCKET")]
#[case("TCPIP::INSTR")]
#[case("TCPIP0::SOCKET")]
#[case("TCPIP::host::SOCKET")]
#[case("TCPIP::host::hislipx")]
#[case("TCPIP::host::hislip0,abc")]
#[case("Prologix::host::1234")]
#[case("Prologix::host::1234::31")]
#[case("USB::0x0957::0xZZZZ::SN")]
#[case("USB::0x0957::0x1796")]
#[case("SDK")]
#[case("SDK::")]
#[case("ZMQ::host")]
fn test_parse_error(#[case] address: &str) {
    let err = Address::parse(address).unwrap_err();
    assert!(matches!(err, EquipmentError::Parse { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Parse);
}

/// The parse error names the token that could not be interpreted.
#[rstest]
fn test_parse_error_token() {
    match Address::parse("GPIB0::42::INSTR") {
        Err(EquipmentError::Parse { address, token, .. }) => {
            assert_eq!(address, "GPIB0::42::INSTR");
            assert_eq!(token, "42");
        }
        other => panic!("Expected a parse error, got {other:?}"),
    }
}

//! Parser for VISA-style address strings.
//!
//! An address consists of tokens separated by `::`. The literal prefix of the first token selects
//! the interface family, an optional number that directly follows the prefix is the board index.
//! Each family then interprets the remaining tokens with its own grammar. The parser is a pure
//! function, it never touches the network or any device.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::EquipmentError;

/// The interface family of an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Family {
    /// RS-232/RS-485 serial port.
    Serial,
    /// GPIB (IEEE 488) board.
    Gpib,
    /// Raw TCP or UDP socket.
    Socket,
    /// VXI-11 LAN instrument.
    Vxi11,
    /// HiSLIP LAN instrument.
    Hislip,
    /// GPIB device behind a Prologix controller.
    Prologix,
    /// USB device, raw bulk transfers or USBTMC.
    Usb,
    /// FTDI USB-to-serial chip.
    Ftdi,
    /// Vendor SDK (shared library).
    Sdk,
    /// ZeroMQ socket.
    Zmq,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Serial => "SERIAL",
            Family::Gpib => "GPIB",
            Family::Socket => "SOCKET",
            Family::Vxi11 => "VXI11",
            Family::Hislip => "HISLIP",
            Family::Prologix => "PROLOGIX",
            Family::Usb => "USB",
            Family::Ftdi => "FTDI",
            Family::Sdk => "SDK",
            Family::Zmq => "ZMQ",
        };
        f.write_str(name)
    }
}

/// Transport protocol of a socket address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketProtocol {
    /// Stream socket.
    Tcp,
    /// Datagram socket.
    Udp,
}

/// What a GPIB address points to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GpibTarget {
    /// A device with a primary and an optional secondary address.
    Device {
        /// Primary address, 0 to 30.
        pad: u8,
        /// Secondary address, `None` if it was omitted.
        sad: Option<u8>,
    },
    /// The board itself (`INTFC`), for controller operations.
    Interface,
    /// A device or board name from the GPIB configuration file.
    Named(String),
}

/// How a USB device is talked to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UsbMode {
    /// Raw bulk transfers (`::RAW`).
    Raw,
    /// USB Test & Measurement Class (`::INSTR` or no qualifier).
    Tmc,
}

/// The family specific fields of an address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AddressFields {
    /// `COM<n>`, `ASRL<n>`, `ASRLCOM<n>` or `ASRL/dev/...`.
    Serial {
        /// Name of the serial port, e.g., `COM3` or `/dev/ttyUSB0`.
        port: String,
    },
    /// `GPIB[board]::pad[::sad]`, `GPIB[board]::INTFC` or `GPIB[board]::name`.
    Gpib(GpibTarget),
    /// `TCP::host::port`, `UDP::host::port` or `TCPIP[board]::host::port::SOCKET`.
    Socket {
        /// Stream or datagram socket.
        protocol: SocketProtocol,
        /// Host name or IP address.
        host: String,
        /// Port number.
        port: u16,
    },
    /// `TCPIP[board]::host[::name]`.
    Vxi11 {
        /// Host name or IP address.
        host: String,
        /// The LAN device name, `inst0` if omitted.
        device_name: String,
    },
    /// `TCPIP[board]::host::hislip<n>[,port]`.
    Hislip {
        /// Host name or IP address.
        host: String,
        /// The HiSLIP sub-address, e.g., `hislip0`.
        sub_address: String,
        /// Port number, 4880 if omitted.
        port: u16,
    },
    /// `Prologix::hw[::enet_port][::GPIB]::pad[::sad]`.
    Prologix {
        /// Host name or IP address of a GPIB-ETHERNET controller, or the serial port of a
        /// GPIB-USB controller.
        hw_address: String,
        /// Port of a GPIB-ETHERNET controller, `None` for a GPIB-USB controller.
        enet_port: Option<u16>,
        /// Primary address of the GPIB device.
        pad: u8,
        /// Secondary address of the GPIB device.
        sad: Option<u8>,
    },
    /// `USB[board]::vid::pid::serial[::interface][::RAW|::INSTR]`.
    Usb {
        /// Vendor ID.
        vendor_id: u16,
        /// Product ID.
        product_id: u16,
        /// Serial number of the device.
        serial_number: String,
        /// USB interface number, `None` if omitted.
        interface_number: Option<u8>,
        /// Raw bulk transfers or USBTMC.
        mode: UsbMode,
    },
    /// `FTDI[driver]::vid::pid::serial[::interface]`.
    Ftdi {
        /// Vendor ID.
        vendor_id: u16,
        /// Product ID.
        product_id: u16,
        /// Serial number of the device.
        serial_number: String,
        /// USB interface number, `None` if omitted.
        interface_number: Option<u8>,
    },
    /// `SDK::path`.
    Sdk {
        /// Path to the shared library.
        path: String,
    },
    /// `ZMQ::host::port`.
    Zmq {
        /// Host name or IP address.
        host: String,
        /// Port number.
        port: u16,
    },
}

/// A parsed address string.
///
/// # Example
///
/// ```
/// use equipmentrs::{Address, AddressFields, Family, GpibTarget};
///
/// let addr: Address = "GPIB0::6::INSTR".parse().unwrap();
/// assert_eq!(addr.family(), Family::Gpib);
/// assert_eq!(addr.board(), 0);
/// assert_eq!(
///     addr.fields(),
///     &AddressFields::Gpib(GpibTarget::Device { pad: 6, sad: None })
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    raw: String,
    board: u32,
    fields: AddressFields,
}

/// The recognized family prefixes, longest first so that `TCP` does not shadow `TCPIP`.
const PREFIXES: [(&str, Prefix); 12] = [
    ("PROLOGIX", Prefix::Prologix),
    ("ASRLCOM", Prefix::Serial),
    ("TCPIP", Prefix::Tcpip),
    ("ASRL", Prefix::Serial),
    ("FTDI", Prefix::Ftdi),
    ("GPIB", Prefix::Gpib),
    ("COM", Prefix::Serial),
    ("TCP", Prefix::Tcp),
    ("UDP", Prefix::Udp),
    ("USB", Prefix::Usb),
    ("SDK", Prefix::Sdk),
    ("ZMQ", Prefix::Zmq),
];

#[derive(Clone, Copy, Debug)]
enum Prefix {
    Serial,
    Gpib,
    Tcpip,
    Tcp,
    Udp,
    Prologix,
    Usb,
    Ftdi,
    Sdk,
    Zmq,
}

impl Address {
    /// Parse an address string.
    ///
    /// The family prefix and the qualifiers (`INSTR`, `SOCKET`, `INTFC`, `RAW`) are case
    /// insensitive. On failure, the error names the token that could not be interpreted.
    pub fn parse(address: &str) -> Result<Self, EquipmentError> {
        Parser::new(address).parse()
    }

    /// The address string as it was given.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The board index (or the driver number for FTDI addresses), 0 if omitted.
    pub fn board(&self) -> u32 {
        self.board
    }

    /// The family specific fields.
    pub fn fields(&self) -> &AddressFields {
        &self.fields
    }

    /// The interface family.
    pub fn family(&self) -> Family {
        match self.fields {
            AddressFields::Serial { .. } => Family::Serial,
            AddressFields::Gpib(_) => Family::Gpib,
            AddressFields::Socket { .. } => Family::Socket,
            AddressFields::Vxi11 { .. } => Family::Vxi11,
            AddressFields::Hislip { .. } => Family::Hislip,
            AddressFields::Prologix { .. } => Family::Prologix,
            AddressFields::Usb { .. } => Family::Usb,
            AddressFields::Ftdi { .. } => Family::Ftdi,
            AddressFields::Sdk { .. } => Family::Sdk,
            AddressFields::Zmq { .. } => Family::Zmq,
        }
    }

    /// The host name for the LAN families, `None` otherwise.
    pub fn host(&self) -> Option<&str> {
        match &self.fields {
            AddressFields::Socket { host, .. }
            | AddressFields::Vxi11 { host, .. }
            | AddressFields::Hislip { host, .. }
            | AddressFields::Zmq { host, .. } => Some(host),
            _ => None,
        }
    }
}

impl FromStr for Address {
    type Err = EquipmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    /// Writes the canonical form of the address.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let board = self.board;
        match &self.fields {
            AddressFields::Serial { port } => {
                if port.starts_with('/') {
                    write!(f, "ASRL{port}::INSTR")
                } else {
                    write!(f, "{port}")
                }
            }
            AddressFields::Gpib(GpibTarget::Device { pad, sad: None }) => {
                write!(f, "GPIB{board}::{pad}::INSTR")
            }
            AddressFields::Gpib(GpibTarget::Device { pad, sad: Some(sad) }) => {
                write!(f, "GPIB{board}::{pad}::{sad}::INSTR")
            }
            AddressFields::Gpib(GpibTarget::Interface) => write!(f, "GPIB{board}::INTFC"),
            AddressFields::Gpib(GpibTarget::Named(name)) => write!(f, "GPIB{board}::{name}"),
            AddressFields::Socket {
                protocol: SocketProtocol::Tcp,
                host,
                port,
            } => write!(f, "TCPIP{board}::{host}::{port}::SOCKET"),
            AddressFields::Socket {
                protocol: SocketProtocol::Udp,
                host,
                port,
            } => write!(f, "UDP::{host}::{port}"),
            AddressFields::Vxi11 { host, device_name } => {
                write!(f, "TCPIP{board}::{host}::{device_name}::INSTR")
            }
            AddressFields::Hislip {
                host,
                sub_address,
                port,
            } => write!(f, "TCPIP{board}::{host}::{sub_address},{port}::INSTR"),
            AddressFields::Prologix {
                hw_address,
                enet_port,
                pad,
                sad,
            } => {
                write!(f, "Prologix::{hw_address}")?;
                if let Some(port) = enet_port {
                    write!(f, "::{port}")?;
                }
                write!(f, "::GPIB::{pad}")?;
                if let Some(sad) = sad {
                    write!(f, "::{sad}")?;
                }
                Ok(())
            }
            AddressFields::Usb {
                vendor_id,
                product_id,
                serial_number,
                interface_number,
                mode,
            } => {
                write!(
                    f,
                    "USB{board}::0x{vendor_id:04X}::0x{product_id:04X}::{serial_number}"
                )?;
                if let Some(interface) = interface_number {
                    write!(f, "::{interface}")?;
                }
                match mode {
                    UsbMode::Raw => write!(f, "::RAW"),
                    UsbMode::Tmc => write!(f, "::INSTR"),
                }
            }
            AddressFields::Ftdi {
                vendor_id,
                product_id,
                serial_number,
                interface_number,
            } => {
                write!(
                    f,
                    "FTDI{board}::0x{vendor_id:04X}::0x{product_id:04X}::{serial_number}"
                )?;
                if let Some(interface) = interface_number {
                    write!(f, "::{interface}")?;
                }
                Ok(())
            }
            AddressFields::Sdk { path } => write!(f, "SDK::{path}"),
            AddressFields::Zmq { host, port } => write!(f, "ZMQ::{host}::{port}"),
        }
    }
}

/// Holds the address while its tokens are consumed.
struct Parser<'a> {
    raw: &'a str,
    tokens: Vec<&'a str>,
}

impl<'a> Parser<'a> {
    fn new(raw: &'a str) -> Self {
        Parser {
            raw,
            tokens: raw.trim().split("::").collect(),
        }
    }

    fn error(&self, token: &str, reason: impl Into<String>) -> EquipmentError {
        EquipmentError::Parse {
            address: self.raw.to_string(),
            token: token.to_string(),
            reason: reason.into(),
        }
    }

    fn parse(self) -> Result<Address, EquipmentError> {
        let first = self.tokens[0];
        let upper = first.to_ascii_uppercase();
        let Some((name, prefix)) = PREFIXES
            .iter()
            .find(|(name, _)| upper.starts_with(name))
            .copied()
        else {
            let known: Vec<&str> = PREFIXES.iter().map(|(name, _)| *name).collect();
            return Err(self.error(
                first,
                format!("unknown interface family, expected one of {}", known.join(", ")),
            ));
        };
        let suffix = &first[name.len()..];
        if !matches!(prefix, Prefix::Sdk)
            && let Some(empty) = self.tokens.iter().skip(1).find(|token| token.is_empty())
        {
            return Err(self.error(empty, "empty token between separators"));
        }

        match prefix {
            Prefix::Serial => self.serial(suffix),
            Prefix::Gpib => {
                let board = self.board(first, suffix)?;
                self.gpib(board)
            }
            Prefix::Tcpip => {
                let board = self.board(first, suffix)?;
                self.tcpip(board)
            }
            Prefix::Tcp | Prefix::Udp => {
                self.no_suffix(first, suffix)?;
                let protocol = if matches!(prefix, Prefix::Tcp) {
                    SocketProtocol::Tcp
                } else {
                    SocketProtocol::Udp
                };
                self.socket(protocol)
            }
            Prefix::Prologix => {
                self.no_suffix(first, suffix)?;
                self.prologix()
            }
            Prefix::Usb => {
                let board = self.board(first, suffix)?;
                self.usb(board)
            }
            Prefix::Ftdi => {
                let board = self.board(first, suffix)?;
                self.ftdi(board)
            }
            Prefix::Sdk => {
                self.no_suffix(first, suffix)?;
                self.sdk()
            }
            Prefix::Zmq => {
                self.no_suffix(first, suffix)?;
                self.zmq()
            }
        }
    }

    fn board(&self, token: &str, suffix: &str) -> Result<u32, EquipmentError> {
        if suffix.is_empty() {
            return Ok(0);
        }
        if !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(self.error(token, "the family prefix may only be followed by a board number"));
        }
        suffix
            .parse()
            .map_err(|_| self.error(token, "board number is out of range"))
    }

    fn no_suffix(&self, token: &str, suffix: &str) -> Result<(), EquipmentError> {
        if suffix.is_empty() {
            Ok(())
        } else {
            Err(self.error(token, "unexpected characters after the family prefix"))
        }
    }

    fn number<T: FromStr>(&self, token: &str, what: &str) -> Result<T, EquipmentError> {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return Err(self.error(token, format!("expected {what}")));
        }
        token
            .parse()
            .map_err(|_| self.error(token, format!("{what} is out of range")))
    }

    /// Remove a trailing qualifier token (case insensitive), returns whether it was present.
    fn strip_qualifier(&mut self, qualifier: &str) -> bool {
        if self.tokens.len() > 1
            && self
                .tokens
                .last()
                .is_some_and(|token| token.eq_ignore_ascii_case(qualifier))
        {
            self.tokens.pop();
            true
        } else {
            false
        }
    }

    /// Error if there are more tokens than `count`.
    fn expect_at_most(&self, count: usize) -> Result<(), EquipmentError> {
        match self.tokens.get(count) {
            Some(extra) => Err(self.error(extra, "unexpected trailing token")),
            None => Ok(()),
        }
    }

    /// Get the required token at `index`.
    fn required(&self, index: usize, what: &str) -> Result<&'a str, EquipmentError> {
        self.tokens
            .get(index)
            .copied()
            .ok_or_else(|| self.error(self.raw, format!("missing {what}")))
    }

    fn serial(mut self, suffix: &str) -> Result<Address, EquipmentError> {
        self.strip_qualifier("INSTR");
        self.expect_at_most(1)?;
        let port = if suffix.starts_with('/') {
            suffix.to_string()
        } else if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            let number: u32 = self.number(suffix, "a port number")?;
            format!("COM{number}")
        } else {
            return Err(self.error(
                self.tokens[0],
                "expected a port number or a device path after the serial prefix",
            ));
        };
        Ok(Address {
            raw: self.raw.to_string(),
            board: 0,
            fields: AddressFields::Serial { port },
        })
    }

    fn gpib(mut self, board: u32) -> Result<Address, EquipmentError> {
        self.strip_qualifier("INSTR");
        let target_token = self.required(1, "primary address")?;
        let target = if target_token.eq_ignore_ascii_case("INTFC") {
            self.expect_at_most(2)?;
            GpibTarget::Interface
        } else if target_token.bytes().all(|b| b.is_ascii_digit()) {
            self.expect_at_most(3)?;
            let pad = self.primary_address(target_token)?;
            let sad = match self.tokens.get(2) {
                Some(token) => Some(self.secondary_address(token)?),
                None => None,
            };
            GpibTarget::Device { pad, sad }
        } else {
            self.expect_at_most(2)?;
            GpibTarget::Named(target_token.to_string())
        };
        Ok(Address {
            raw: self.raw.to_string(),
            board,
            fields: AddressFields::Gpib(target),
        })
    }

    fn primary_address(&self, token: &str) -> Result<u8, EquipmentError> {
        let pad: u8 = self.number(token, "a primary address")?;
        if pad > 30 {
            return Err(self.error(token, "primary address must be in the range [0, 30]"));
        }
        Ok(pad)
    }

    fn secondary_address(&self, token: &str) -> Result<u8, EquipmentError> {
        let sad: u8 = self.number(token, "a secondary address")?;
        if sad <= 30 || (96..=126).contains(&sad) {
            Ok(sad)
        } else {
            Err(self.error(
                token,
                "secondary address must be in the range [0, 30] or [96, 126]",
            ))
        }
    }

    fn tcpip(mut self, board: u32) -> Result<Address, EquipmentError> {
        let socket = self.strip_qualifier("SOCKET");
        if !socket {
            self.strip_qualifier("INSTR");
        }
        let host = self.required(1, "host")?.to_string();

        if socket {
            self.expect_at_most(3)?;
            let port_token = self.required(2, "port")?;
            let port = self.number(port_token, "a port number")?;
            return Ok(Address {
                raw: self.raw.to_string(),
                board,
                fields: AddressFields::Socket {
                    protocol: SocketProtocol::Tcp,
                    host,
                    port,
                },
            });
        }

        self.expect_at_most(3)?;
        let fields = match self.tokens.get(2) {
            None => AddressFields::Vxi11 {
                host,
                device_name: "inst0".to_string(),
            },
            Some(token) if token.to_ascii_lowercase().starts_with("hislip") => {
                let (sub_address, port) = match token.split_once(',') {
                    Some((name, port)) => (name, self.number(port, "a HiSLIP port number")?),
                    None => (*token, 4880),
                };
                let index = &sub_address["hislip".len()..];
                if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(self.error(token, "expected hislip<n>[,port]"));
                }
                AddressFields::Hislip {
                    host,
                    sub_address: sub_address.to_string(),
                    port,
                }
            }
            Some(token) => AddressFields::Vxi11 {
                host,
                device_name: token.to_string(),
            },
        };
        Ok(Address {
            raw: self.raw.to_string(),
            board,
            fields,
        })
    }

    fn socket(mut self, protocol: SocketProtocol) -> Result<Address, EquipmentError> {
        self.strip_qualifier("SOCKET");
        self.expect_at_most(3)?;
        let host = self.required(1, "host")?.to_string();
        let port = self.number(self.required(2, "port")?, "a port number")?;
        Ok(Address {
            raw: self.raw.to_string(),
            board: 0,
            fields: AddressFields::Socket {
                protocol,
                host,
                port,
            },
        })
    }

    fn prologix(self) -> Result<Address, EquipmentError> {
        let hw_address = self.required(1, "controller address")?.to_string();
        let mut index = 2;

        let mut enet_port = None;
        if let Some(token) = self.tokens.get(index)
            && token.len() >= 4
            && token.bytes().all(|b| b.is_ascii_digit())
        {
            enet_port = Some(self.number(token, "a port number")?);
            index += 1;
        }

        if let Some(token) = self.tokens.get(index)
            && token.to_ascii_uppercase().starts_with("GPIB")
        {
            let board = &token[4..];
            if !board.bytes().all(|b| b.is_ascii_digit()) {
                return Err(self.error(token, "expected GPIB[board]"));
            }
            index += 1;
        }

        let pad = self.primary_address(self.required(index, "primary address")?)?;
        let sad = match self.tokens.get(index + 1) {
            Some(token) => Some(self.secondary_address(token)?),
            None => None,
        };
        self.expect_at_most(index + 2)?;

        Ok(Address {
            raw: self.raw.to_string(),
            board: 0,
            fields: AddressFields::Prologix {
                hw_address,
                enet_port,
                pad,
                sad,
            },
        })
    }

    fn usb_id(&self, token: &str, what: &str) -> Result<u16, EquipmentError> {
        let lower = token.to_ascii_lowercase();
        match lower.strip_prefix("0x") {
            Some(hex) => u16::from_str_radix(hex, 16)
                .map_err(|_| self.error(token, format!("expected a hexadecimal {what}"))),
            None => self.number(token, what),
        }
    }

    /// Parse `vid::pid::serial[::interface]` of a USB or FTDI address.
    fn usb_fields(&self) -> Result<(u16, u16, String, Option<u8>), EquipmentError> {
        self.expect_at_most(5)?;
        let vendor_id = self.usb_id(self.required(1, "vendor ID")?, "vendor ID")?;
        let product_id = self.usb_id(self.required(2, "product ID")?, "product ID")?;
        let serial_number = self.required(3, "serial number")?.to_string();
        let interface_number = match self.tokens.get(4) {
            Some(token) => Some(self.number(token, "an interface number")?),
            None => None,
        };
        Ok((vendor_id, product_id, serial_number, interface_number))
    }

    fn usb(mut self, board: u32) -> Result<Address, EquipmentError> {
        let mode = if self.strip_qualifier("RAW") {
            UsbMode::Raw
        } else {
            self.strip_qualifier("INSTR");
            UsbMode::Tmc
        };
        let (vendor_id, product_id, serial_number, interface_number) = self.usb_fields()?;
        Ok(Address {
            raw: self.raw.to_string(),
            board,
            fields: AddressFields::Usb {
                vendor_id,
                product_id,
                serial_number,
                interface_number,
                mode,
            },
        })
    }

    fn ftdi(self, board: u32) -> Result<Address, EquipmentError> {
        let (vendor_id, product_id, serial_number, interface_number) = self.usb_fields()?;
        Ok(Address {
            raw: self.raw.to_string(),
            board,
            fields: AddressFields::Ftdi {
                vendor_id,
                product_id,
                serial_number,
                interface_number,
            },
        })
    }

    fn sdk(self) -> Result<Address, EquipmentError> {
        // The path may contain "::" itself, so take everything after the first separator.
        let path = self
            .raw
            .trim()
            .split_once("::")
            .map(|(_, path)| path)
            .unwrap_or_default();
        if path.is_empty() {
            return Err(self.error(self.raw, "missing path to the SDK library"));
        }
        Ok(Address {
            raw: self.raw.to_string(),
            board: 0,
            fields: AddressFields::Sdk {
                path: path.to_string(),
            },
        })
    }

    fn zmq(self) -> Result<Address, EquipmentError> {
        self.expect_at_most(3)?;
        let host = self.required(1, "host")?.to_string();
        let port = self.number(self.required(2, "port")?, "a port number")?;
        Ok(Address {
            raw: self.raw.to_string(),
            board: 0,
            fields: AddressFields::Zmq { host, port },
        })
    }
}

//! EquipmentRs: Connect to your laboratory equipment from Rust
//!
//! The EquipmentRs library turns a compact, VISA-like address string such as `GPIB0::6::INSTR`,
//! `TCPIP::192.168.1.20::hislip0::INSTR` or `ASRL/dev/ttyUSB0` into a live connection to a piece
//! of equipment. To do so, it provides:
//!
//! - An [`Address`] parser that understands the address grammar of every supported interface
//!   family.
//! - A [`Registry`] that selects the implementation to use for a connection, either by matching
//!   the manufacturer and model of the equipment against registered regular expressions or by
//!   falling back to the generic implementation of the address family.
//! - A set of [`Transport`] drivers that move raw bytes: serial ports, TCP/UDP sockets, GPIB
//!   boards, VXI-11 and HiSLIP LAN instruments, Prologix controllers, ZeroMQ, USB, USBTMC and FTDI
//!   devices.
//! - The [`MessageBased`] protocol engine that frames messages with termination characters,
//!   understands IEEE 488.2 binary blocks, enforces timeouts and guards against runaway reads.
//! - A [`Connection`] that ties everything together and disconnects when it goes out of scope.
//! - A [`Modbus`] client that speaks Modbus RTU, ASCII and TCP over a serial port or a socket.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use equipmentrs::{ConnectOptions, MessageInterface, connect};
//!
//! let options = ConnectOptions::default().with_timeout(Some(Duration::from_secs(2)));
//! let mut conn = connect("TCPIP::192.168.1.20::hislip0::INSTR", options).unwrap();
//! println!("{}", conn.query_str("*IDN?").unwrap());
//! ```
//!
//! # Supported interfaces
//!
//! | Family   | Address                                                   | Feature  |
//! |----------|-----------------------------------------------------------|----------|
//! | Serial   | `COM3`, `ASRL3`, `ASRL/dev/ttyUSB0::INSTR`                | `serial` |
//! | Socket   | `TCP::host::5025`, `UDP::host::5025`, `TCPIP::host::5025::SOCKET` | -        |
//! | VXI-11   | `TCPIP::host[::inst0][::INSTR]`                           | -        |
//! | HiSLIP   | `TCPIP::host::hislip0[,4880][::INSTR]`                    | -        |
//! | GPIB     | `GPIB0::6[::96][::INSTR]`, `GPIB0::INTFC`                  | `gpib`   |
//! | Prologix | `Prologix::192.168.1.70::1234::6`, `Prologix::COM3::6`     | -        |
//! | ZeroMQ   | `ZMQ::host::5555`                                         | -        |
//! | USB      | `USB::0x1234::0x5678::SN::RAW`, `USB::0x1234::0x5678::SN::INSTR` | `usb`    |
//! | FTDI     | `FTDI::0x0403::0x6001::SN`                                | `usb`    |
//! | SDK      | `SDK::/path/to/library.so`                                | `sdk`    |
//! | Modbus   | `MODBUS::host[::502]`, `MODBUS::COM3[::ASCII]` (see [`Modbus`]) | -        |
//!
//! # Logging
//!
//! All traffic is logged with the [`log`] facade at the `debug` level. Install any logger, e.g.,
//! `env_logger`, in your application to see it.
//!
//! # Status
//!
//! This project is currently under active development and (breaking) changes might occure fast. If
//! you are interested in using this project and/or contributing, please get in touch by raising an
//! issue on GitHub.
//!
//! # License
//!
//! Licensed under either of
//!
//! - Apache License, Version 2.0 ([LICENSE-APACHE](http://www.apache.org/licenses/LICENSE-2.0))
//! - MIT license ([LICENSE-MIT](http://opensource.org/licenses/MIT))
//!
//! at your option.
//!
//! # Contribution
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted
//! for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
//! dual licensed as above, without any additional terms or conditions.

#![warn(missing_docs)]

mod address;
pub mod block;
mod connection;
#[cfg(feature = "usb")]
mod ftdi;
#[cfg(feature = "gpib")]
mod gpib;
mod hislip;
mod loopback;
mod message_based;
mod modbus;
mod options;
mod prologix;
mod registry;
#[cfg(feature = "sdk")]
mod sdk;
#[cfg(feature = "serial")]
mod serial;
mod socket;
mod transport;
#[cfg(feature = "usb")]
mod usb;
mod vxi11;
mod zmq;

pub use address::{Address, AddressFields, Family, GpibTarget, SocketProtocol, UsbMode};
pub use connection::{Connection, EquipmentRecord, Session, connect};
#[cfg(feature = "usb")]
pub use ftdi::FtdiTransport;
#[cfg(feature = "gpib")]
pub use gpib::GpibTransport;
pub use hislip::{HislipTransport, LockInfo, RemoteLocal};
pub use loopback::{EchoTransport, LoopbackTransport};
pub use message_based::MessageBased;
pub use modbus::{Framer, Modbus, ModbusAddress, ModbusPdu, to_registers};
pub use options::{
    BlockDetection, ConnectOptions, Encoding, FlowControl, GpibOptions, HislipOptions, Parity,
    PrologixOptions, SerialOptions, SocketOptions, StopBits, UsbOptions, Vxi11Options, ZmqOptions,
    ZmqSocketType,
};
pub use prologix::PrologixTransport;
pub use registry::{Backend, Registration, Registry};
#[cfg(feature = "sdk")]
pub use sdk::SdkLibrary;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use socket::SocketTransport;
pub use transport::{AbortHandle, Chunk, Transport};
#[cfg(feature = "usb")]
pub use usb::{UsbTransport, UsbtmcCapabilities};
pub use vxi11::{Vxi11Device, Vxi11Discovery, Vxi11Transport, find_vxi11};
pub use zmq::ZmqTransport;

use std::time::Duration;

use thiserror::Error;

/// The error enum for all connections.
///
/// Every operation of this crate returns this error type, so errors of the parser, the registry,
/// the transports and the protocol engine all propagate nicely with the `?` operator. Use
/// [`EquipmentError::kind`] if you only care about the broad category of a failure, e.g., to tell
/// "could not connect" apart from "connected, but the equipment did not respond".
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EquipmentError {
    /// The address string does not follow the grammar of any known interface family.
    #[error("Invalid address {address:?}: unexpected token {token:?}, {reason}")]
    Parse {
        /// The address that was parsed.
        address: String,
        /// The token of the address that could not be interpreted.
        token: String,
        /// Description of what was expected instead.
        reason: String,
    },
    /// No implementation is registered for the address family, manufacturer and model.
    #[error(
        "Cannot determine the interface for the {family} address (manufacturer={manufacturer:?}, model={model:?})"
    )]
    Resolution {
        /// Family of the address that was resolved.
        family: Family,
        /// Manufacturer of the equipment, if one was given.
        manufacturer: Option<String>,
        /// Model of the equipment, if one was given.
        model: Option<String>,
    },
    /// A session with the equipment could not be established.
    #[error("Cannot connect to {address}: {message}")]
    Connection {
        /// The address of the equipment.
        address: String,
        /// Reason why the connection failed.
        message: String,
    },
    /// The connection was closed, either by the peer, by an abort handle or by `disconnect`.
    #[error("The connection is closed")]
    ConnectionClosed,
    /// A read or write did not finish within the configured timeout. Bytes that were received
    /// before the timeout occurred are attached, but they are not a complete message.
    #[error("Timeout occurred after {timeout:?} ({} byte(s) received)", partial.len())]
    Timeout {
        /// The timeout that was exceeded.
        timeout: Duration,
        /// Bytes received before the timeout.
        partial: Vec<u8>,
    },
    /// The equipment does not follow the protocol of its interface.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// A binary block header (`#<n><length>`) could not be parsed.
    #[error("Invalid binary block header: {0}")]
    InvalidBlockHeader(String),
    /// The peer closed the connection before the read termination was received.
    #[error("The read termination was not found before the connection closed ({} byte(s) received)", partial.len())]
    TerminatorNotFound {
        /// Bytes received before the connection closed.
        partial: Vec<u8>,
    },
    /// More bytes would have to be read than `max_read_size` allows.
    #[error("Maximum read size exceeded: {size} byte(s) > {max} byte(s)")]
    MaxReadSizeExceeded {
        /// The number of bytes requested or received.
        size: usize,
        /// The configured maximum.
        max: usize,
    },
    /// A VXI-11 device returned a non-zero error code.
    #[error("VXI-11 error {code}: {message}")]
    Vxi11 {
        /// The VXI-11 error code.
        code: u32,
        /// Description of the error code.
        message: &'static str,
    },
    /// A Modbus device answered with an exception response.
    #[error("Modbus exception 0x{code:02X}: {message}")]
    Modbus {
        /// The Modbus exception code.
        code: u8,
        /// Description of the exception code.
        message: &'static str,
    },
    /// A HiSLIP server reported an error or fatal error.
    #[error("HiSLIP error {code}: {message}")]
    Hislip {
        /// The HiSLIP error code (control code of the error message).
        code: u8,
        /// Description of the error.
        message: String,
    },
    /// A GPIB library function reported an error.
    #[error("GPIB error in {function} (ibsta=0x{ibsta:04x}, iberr={iberr}): {message}")]
    Gpib {
        /// Name of the library function that failed.
        function: &'static str,
        /// The status word.
        ibsta: i32,
        /// The error code.
        iberr: i32,
        /// Description of the error code.
        message: &'static str,
    },
    /// Error when an invalid argument is passed to a function. This error contains only an error
    /// message, but no arguments. It is intended for the user.
    #[error("{0}")]
    InvalidArgument(String),
    /// The called command is not supported by this interface.
    #[error("This command is not supported by this interface.")]
    InterfaceCommandNotSupported,
    /// Error when reading from/writing to an interface. See [`std::io::Error`] for more details.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serial")]
    /// Serial port errors can occur when opening a serial interface. See the [`serialport::Error`]
    /// documentation for more information.
    #[error(transparent)]
    Serialport(#[from] serialport::Error),
    #[cfg(feature = "usb")]
    /// Errors from libusb. See the [`rusb::Error`] documentation for more information.
    #[error(transparent)]
    Usb(#[from] rusb::Error),
    #[cfg(any(feature = "gpib", feature = "sdk"))]
    /// A shared library could not be loaded or a symbol was not found in it.
    #[error(transparent)]
    Library(#[from] libloading::Error),
}

/// The broad category of an [`EquipmentError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed address.
    Parse,
    /// No implementation for the family/manufacturer/model.
    Resolution,
    /// Could not connect, or the connection went away.
    Connection,
    /// Connected, but no (complete) response in time.
    Timeout,
    /// The equipment violated the protocol.
    Protocol,
    /// Everything else.
    Other,
}

impl EquipmentError {
    /// Get the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EquipmentError::Parse { .. } => ErrorKind::Parse,
            EquipmentError::Resolution { .. } => ErrorKind::Resolution,
            EquipmentError::Connection { .. } | EquipmentError::ConnectionClosed => {
                ErrorKind::Connection
            }
            EquipmentError::Timeout { .. } => ErrorKind::Timeout,
            EquipmentError::Protocol(_)
            | EquipmentError::InvalidBlockHeader(_)
            | EquipmentError::TerminatorNotFound { .. }
            | EquipmentError::MaxReadSizeExceeded { .. }
            | EquipmentError::Vxi11 { .. }
            | EquipmentError::Modbus { .. }
            | EquipmentError::Hislip { .. }
            | EquipmentError::Gpib { .. } => ErrorKind::Protocol,
            _ => ErrorKind::Other,
        }
    }

    /// Returns `true` if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// The bytes that were received before a timeout or before the connection closed, if any.
    pub fn partial_data(&self) -> Option<&[u8]> {
        match self {
            EquipmentError::Timeout { partial, .. }
            | EquipmentError::TerminatorNotFound { partial } => Some(partial),
            _ => None,
        }
    }

    /// Create a connection error for the given address from anything that displays.
    pub(crate) fn connection(address: &Address, message: impl std::fmt::Display) -> Self {
        EquipmentError::Connection {
            address: address.raw().to_string(),
            message: message.to_string(),
        }
    }
}

/// The `MessageInterface` trait defines the request/response surface of message-based equipment.
///
/// It is implemented by the [`MessageBased`] protocol engine and by [`Connection`], so instrument
/// drivers can be written generically over it. Only [`MessageInterface::write`],
/// [`MessageInterface::read`] and [`MessageInterface::read_exact`] need an implementation, all
/// other methods are built on top of them.
pub trait MessageInterface {
    /// Write bytes to the equipment. The write termination is appended by the implementation.
    ///
    /// Returns the number of bytes that were sent, including the termination.
    fn write(&mut self, _data: &[u8]) -> Result<usize, EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// Read one message from the equipment, without the read termination.
    fn read(&mut self) -> Result<Vec<u8>, EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// Read exactly `size` bytes from the equipment, ignoring the read termination.
    fn read_exact(&mut self, _size: usize) -> Result<Vec<u8>, EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// The encoding used to convert between strings and bytes.
    fn encoding(&self) -> Encoding {
        Encoding::Utf8
    }

    /// Whether trailing whitespace is removed from strings that are read.
    fn rstrip(&self) -> bool {
        false
    }

    /// Write `data` and then read the response. No delay is inserted between the two.
    fn query(&mut self, data: &[u8]) -> Result<Vec<u8>, EquipmentError> {
        self.write(data)?;
        self.read()
    }

    /// Encode `message` and write it to the equipment.
    fn write_str(&mut self, message: &str) -> Result<usize, EquipmentError> {
        let data = self.encoding().encode(message)?;
        self.write(&data)
    }

    /// Read one message and decode it.
    fn read_string(&mut self) -> Result<String, EquipmentError> {
        let data = self.read()?;
        let text = self.encoding().decode(&data)?;
        if self.rstrip() {
            Ok(text.trim_end().to_string())
        } else {
            Ok(text)
        }
    }

    /// Write `message` and then read the decoded response.
    fn query_str(&mut self, message: &str) -> Result<String, EquipmentError> {
        self.write_str(message)?;
        self.read_string()
    }
}

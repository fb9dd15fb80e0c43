//! Connection properties.
//!
//! [`ConnectOptions`] collects everything that configures a connection apart from the address:
//! the identity of the equipment (used by the registry), the message framing, and a sub-table of
//! properties per interface family. All structs implement serde's `Deserialize`, so the properties
//! of an equipment register entry can be deserialized straight into them. Missing keys take the
//! documented defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EquipmentError;

/// Default maximum number of bytes a single read may return.
pub const DEFAULT_MAX_READ_SIZE: usize = 1 << 20;

/// Text codec used to convert between strings and bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// UTF-8.
    #[default]
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    /// 7-bit ASCII.
    #[serde(rename = "ascii", alias = "ASCII")]
    Ascii,
    /// ISO 8859-1, every byte maps to the code point of the same value.
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

impl Encoding {
    /// Encode a string.
    pub fn encode(self, text: &str) -> Result<Vec<u8>, EquipmentError> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Ascii => {
                if text.is_ascii() {
                    Ok(text.as_bytes().to_vec())
                } else {
                    Err(EquipmentError::InvalidArgument(format!(
                        "{text:?} cannot be encoded as ASCII"
                    )))
                }
            }
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        EquipmentError::InvalidArgument(format!(
                            "{c:?} cannot be encoded as latin-1"
                        ))
                    })
                })
                .collect(),
        }
    }

    /// Decode bytes into a string.
    pub fn decode(self, data: &[u8]) -> Result<String, EquipmentError> {
        match self {
            Encoding::Utf8 => String::from_utf8(data.to_vec())
                .map_err(|e| EquipmentError::Protocol(format!("invalid UTF-8 response: {e}"))),
            Encoding::Ascii => {
                if data.is_ascii() {
                    Ok(data.iter().map(|&b| char::from(b)).collect())
                } else {
                    Err(EquipmentError::Protocol(
                        "response contains non-ASCII bytes".to_string(),
                    ))
                }
            }
            Encoding::Latin1 => Ok(data.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Where the protocol engine looks for IEEE 488.2 definite-length binary blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockDetection {
    /// Never, the read termination always ends a message.
    Disabled,
    /// Only if a message starts with `#`.
    #[default]
    Leading,
    /// At the first `#` that is followed by a digit, e.g., after a response header such as
    /// `:CURV #41000...`.
    Anywhere,
}

/// Parity of a serial line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always 1.
    Mark,
    /// Parity bit always 0.
    Space,
}

/// Number of stop bits of a serial line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    #[serde(rename = "1", alias = "one")]
    One,
    /// One and a half stop bits.
    #[serde(rename = "1.5", alias = "one_point_five")]
    OnePointFive,
    /// Two stop bits.
    #[serde(rename = "2", alias = "two")]
    Two,
}

/// Flow control of a serial line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control with the RTS/CTS lines.
    RtsCts,
    /// Hardware flow control with the DSR/DTR lines.
    DsrDtr,
    /// Software flow control with XON/XOFF characters.
    XonXoff,
}

/// Properties of serial ports and FTDI chips.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// Baud rate.
    pub baud_rate: u32,
    /// Number of data bits, 5 to 8.
    pub data_bits: u8,
    /// Parity.
    pub parity: Parity,
    /// Number of stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
    /// Maximum time between two received bytes before a read returns.
    #[serde(with = "optional_seconds")]
    pub inter_byte_timeout: Option<Duration>,
}

impl Default for SerialOptions {
    fn default() -> Self {
        SerialOptions {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            inter_byte_timeout: None,
        }
    }
}

/// Properties of TCP and UDP sockets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Number of bytes requested from the socket per receive call.
    pub buffer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions { buffer_size: 4096 }
    }
}

/// Properties of GPIB connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpibOptions {
    /// Assert EOI with the last byte of a write.
    pub send_eoi: bool,
    /// End-of-string mode and character, see the `ibeos` documentation.
    pub eos_mode: u16,
    /// Path to the GPIB library. If not set, the `GPIB_LIBRARY` environment variable is used,
    /// and then the default library names of NI-488.2 and linux-gpib are tried.
    pub library: Option<String>,
}

impl Default for GpibOptions {
    fn default() -> Self {
        GpibOptions {
            send_eoi: true,
            eos_mode: 0,
            library: None,
        }
    }
}

/// Properties of VXI-11 connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vxi11Options {
    /// Number of bytes requested per `device_read` call.
    pub buffer_size: usize,
    /// Port of the core channel. If not set, the portmapper on port 111 is asked.
    pub port: Option<u16>,
    /// How long to wait for a lock held by another link.
    #[serde(with = "seconds")]
    pub lock_timeout: Duration,
}

impl Default for Vxi11Options {
    fn default() -> Self {
        Vxi11Options {
            buffer_size: 4096,
            port: None,
            lock_timeout: Duration::ZERO,
        }
    }
}

/// Properties of HiSLIP connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HislipOptions {
    /// Number of bytes requested from the socket per receive call.
    pub buffer_size: usize,
    /// How long to wait for a lock held by another client.
    #[serde(with = "seconds")]
    pub lock_timeout: Duration,
}

impl Default for HislipOptions {
    fn default() -> Self {
        HislipOptions {
            buffer_size: 4096,
            lock_timeout: Duration::ZERO,
        }
    }
}

/// Properties of a Prologix controller. Options that are `None` are left as configured in the
/// controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrologixOptions {
    /// `++mode`, 1 is CONTROLLER mode, 0 is DEVICE mode.
    pub mode: u8,
    /// `++eoi`, assert EOI with the last byte of a write.
    pub eoi: Option<bool>,
    /// `++eos`, GPIB termination appended by the controller (0: CR+LF, 1: CR, 2: LF, 3: none).
    pub eos: Option<u8>,
    /// `++eot_enable`, append `eot_char` when EOI is detected while reading.
    pub eot_enable: Option<bool>,
    /// `++eot_char`.
    pub eot_char: Option<u8>,
    /// `++read_tmo_ms`, inter-character timeout of the controller.
    pub read_tmo_ms: Option<u16>,
}

impl Default for PrologixOptions {
    fn default() -> Self {
        PrologixOptions {
            mode: 1,
            eoi: None,
            eos: None,
            eot_enable: None,
            eot_char: None,
            read_tmo_ms: None,
        }
    }
}

/// Type of a ZeroMQ socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZmqSocketType {
    /// Strict request/reply.
    #[default]
    Req,
    /// Asynchronous request/reply, no envelope.
    Dealer,
}

/// Properties of ZeroMQ connections.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZmqOptions {
    /// The socket type announced to the peer.
    pub socket_type: ZmqSocketType,
}

/// Properties of USB, USBTMC and FTDI connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbOptions {
    /// Number of bytes requested per bulk-in transfer.
    pub buffer_size: usize,
    /// The `bConfigurationValue` to activate, the active configuration is kept if not set.
    pub configuration: Option<u8>,
    /// The `bAlternateSetting` of the interface.
    pub alternate_setting: u8,
}

impl Default for UsbOptions {
    fn default() -> Self {
        UsbOptions {
            buffer_size: 4096,
            configuration: None,
            alternate_setting: 0,
        }
    }
}

/// All properties of a connection apart from the address.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use equipmentrs::{ConnectOptions, Encoding};
///
/// let options = ConnectOptions::default()
///     .with_manufacturer("Keysight")
///     .with_model("34465A")
///     .with_timeout(Some(Duration::from_secs(5)))
///     .with_termination(b"\n")
///     .with_encoding(Encoding::Ascii);
/// assert_eq!(options.read_termination_or(b"\r"), b"\n");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Manufacturer of the equipment, used to select the implementation.
    pub manufacturer: Option<String>,
    /// Model of the equipment, used to select the implementation.
    pub model: Option<String>,
    /// Serial number of the equipment.
    pub serial_number: Option<String>,
    /// Timeout of every blocking operation in seconds, `None` blocks forever.
    #[serde(with = "optional_seconds")]
    pub timeout: Option<Duration>,
    /// Sets both the read and the write termination, unless they are set individually.
    #[serde(with = "optional_bytes")]
    pub termination: Option<Vec<u8>>,
    /// Read termination, `None` uses the default of the interface family, empty disables it.
    #[serde(with = "optional_bytes")]
    pub read_termination: Option<Vec<u8>>,
    /// Write termination, `None` uses the default of the interface family, empty disables it.
    #[serde(with = "optional_bytes")]
    pub write_termination: Option<Vec<u8>>,
    /// Text codec.
    pub encoding: Encoding,
    /// Maximum number of bytes a single read may return.
    pub max_read_size: usize,
    /// Remove trailing whitespace from strings that are read.
    pub rstrip: bool,
    /// Where to look for binary blocks.
    pub block_detection: BlockDetection,
    /// Serial port and FTDI properties.
    pub serial: SerialOptions,
    /// Socket properties.
    pub socket: SocketOptions,
    /// GPIB properties.
    pub gpib: GpibOptions,
    /// VXI-11 properties.
    pub vxi11: Vxi11Options,
    /// HiSLIP properties.
    pub hislip: HislipOptions,
    /// Prologix properties.
    pub prologix: PrologixOptions,
    /// ZeroMQ properties.
    pub zmq: ZmqOptions,
    /// USB properties.
    pub usb: UsbOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            manufacturer: None,
            model: None,
            serial_number: None,
            timeout: None,
            termination: None,
            read_termination: None,
            write_termination: None,
            encoding: Encoding::Utf8,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            rstrip: false,
            block_detection: BlockDetection::Leading,
            serial: SerialOptions::default(),
            socket: SocketOptions::default(),
            gpib: GpibOptions::default(),
            vxi11: Vxi11Options::default(),
            hislip: HislipOptions::default(),
            prologix: PrologixOptions::default(),
            zmq: ZmqOptions::default(),
            usb: UsbOptions::default(),
        }
    }
}

impl ConnectOptions {
    /// Set the manufacturer.
    pub fn with_manufacturer(mut self, manufacturer: &str) -> Self {
        self.manufacturer = Some(manufacturer.to_string());
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Set the serial number.
    pub fn with_serial_number(mut self, serial_number: &str) -> Self {
        self.serial_number = Some(serial_number.to_string());
        self
    }

    /// Set the timeout, `None` blocks forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set both the read and the write termination.
    pub fn with_termination(mut self, termination: &[u8]) -> Self {
        self.termination = Some(termination.to_vec());
        self
    }

    /// Set the read termination, an empty slice disables it.
    pub fn with_read_termination(mut self, termination: &[u8]) -> Self {
        self.read_termination = Some(termination.to_vec());
        self
    }

    /// Set the write termination, an empty slice disables it.
    pub fn with_write_termination(mut self, termination: &[u8]) -> Self {
        self.write_termination = Some(termination.to_vec());
        self
    }

    /// Set the text codec.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the maximum number of bytes a single read may return.
    pub fn with_max_read_size(mut self, max_read_size: usize) -> Self {
        self.max_read_size = max_read_size;
        self
    }

    /// Remove trailing whitespace from strings that are read.
    pub fn with_rstrip(mut self, rstrip: bool) -> Self {
        self.rstrip = rstrip;
        self
    }

    /// Set where to look for binary blocks.
    pub fn with_block_detection(mut self, block_detection: BlockDetection) -> Self {
        self.block_detection = block_detection;
        self
    }

    /// Set the serial port properties.
    pub fn with_serial(mut self, serial: SerialOptions) -> Self {
        self.serial = serial;
        self
    }

    /// The read termination to use, `default` is the default of the interface family.
    pub fn read_termination_or(&self, default: &[u8]) -> Vec<u8> {
        self.read_termination
            .as_ref()
            .or(self.termination.as_ref())
            .cloned()
            .unwrap_or_else(|| default.to_vec())
    }

    /// The write termination to use, `default` is the default of the interface family.
    pub fn write_termination_or(&self, default: &[u8]) -> Vec<u8> {
        self.write_termination
            .as_ref()
            .or(self.termination.as_ref())
            .cloned()
            .unwrap_or_else(|| default.to_vec())
    }

    /// Check the options that are independent of the interface family.
    pub fn validate(&self) -> Result<(), EquipmentError> {
        validate_timeout(self.timeout)?;
        if self.max_read_size == 0 {
            return Err(EquipmentError::InvalidArgument(
                "max_read_size must be larger than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A timeout of zero would mean "return immediately", which is not a supported mode.
pub(crate) fn validate_timeout(timeout: Option<Duration>) -> Result<(), EquipmentError> {
    match timeout {
        Some(timeout) if timeout.is_zero() => Err(EquipmentError::InvalidArgument(
            "The timeout must be positive or None (block forever)".to_string(),
        )),
        _ => Ok(()),
    }
}

/// (De)serialize a `Duration` as floating-point seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// (De)serialize an `Option<Duration>` as optional floating-point seconds.
mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

/// (De)serialize an optional termination as a string, e.g., `"\r\n"`.
mod optional_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&String::from_utf8_lossy(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.map(String::into_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_round_trip() {
        let bytes = Encoding::Latin1.encode("µA").unwrap();
        assert_eq!(bytes, vec![0xB5, b'A']);
        assert_eq!(Encoding::Latin1.decode(&bytes).unwrap(), "µA");
    }

    #[test]
    fn test_ascii_rejects_non_ascii() {
        assert!(Encoding::Ascii.encode("µ").is_err());
        assert!(Encoding::Ascii.decode(&[0xB5]).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(validate_timeout(Some(Duration::ZERO)).is_err());
        assert!(validate_timeout(None).is_ok());
    }
}

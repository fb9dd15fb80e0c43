//! This module provides a Modbus client on top of a serial or socket [`Connection`].
//!
//! A Modbus address names the underlying connection and, optionally, how requests are framed:
//!
//! - `MODBUS::host[::port][::SOCKET][::UDP]`: Modbus TCP (MBAP header) over a TCP or UDP socket,
//!   the port defaults to 502.
//! - `MODBUS::COM3[::RTU|::ASCII]`, `MODBUS::/dev/ttyUSB0[::RTU|::ASCII]`: Modbus RTU (binary with
//!   CRC-16) or Modbus ASCII (hexadecimal with LRC) over a serial port.
//!
//! # Example
//!
//! ```no_run
//! use equipmentrs::{ConnectOptions, Modbus};
//!
//! let mut plc = Modbus::connect("MODBUS::192.168.1.50", ConnectOptions::default()).unwrap();
//! let temperature = plc.read_input_registers(0x0100, 2, 1).unwrap().float32().unwrap();
//! plc.write_register(0x0200, 1500, 1).unwrap();
//! ```

use std::{fmt, str::FromStr, time::Duration};

use crc::{CRC_16_MODBUS, Crc};

use crate::{
    BlockDetection, ConnectOptions, Connection, Encoding, EquipmentError, MessageInterface,
    Registry,
    block::{BlockValue, ByteOrder, Format, from_bytes, to_bytes},
};

const DEFAULT_PORT: u16 = 502;
const MBAP_HEADER_SIZE: usize = 7;
const MAX_PDU_SIZE: usize = 253;

const READ_COILS: u8 = 0x01;
const READ_DISCRETE_INPUTS: u8 = 0x02;
const READ_HOLDING_REGISTERS: u8 = 0x03;
const READ_INPUT_REGISTERS: u8 = 0x04;
const WRITE_SINGLE_COIL: u8 = 0x05;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const WRITE_MULTIPLE_COILS: u8 = 0x0F;
const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const MAX_READ_BITS: u16 = 2000;
const MAX_READ_REGISTERS: u16 = 125;
const MAX_WRITE_COILS: usize = 1968;
const MAX_WRITE_REGISTERS: usize = 123;

/// Description of a Modbus exception code.
pub(crate) fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "Modbus function code is not supported",
        0x02 => "Invalid Modbus register address requested",
        0x03 => "The structure of the Modbus request message is invalid",
        0x04 => {
            "An unrecoverable error occurred while the Modbus device was attempting to perform \
             the requested action"
        }
        0x05 => {
            "The Modbus device has accepted the request and is processing it, but it may take a \
             long time to process"
        }
        0x06 => "The Modbus device is busy processing a previous request",
        0x08 => "Parity error in the memory of a Modbus device",
        0x0A => "The Modbus gateway is misconfigured or overloaded",
        0x0B => "The Modbus device is not present on the network",
        _ => "Unknown Modbus exception code",
    }
}

/// How Modbus requests and responses are framed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framer {
    /// Hexadecimal characters between `:` and `\r\n`, with a longitudinal redundancy check.
    Ascii,
    /// Binary frames with a CRC-16.
    Rtu,
    /// Binary frames behind an MBAP header with a transaction id (Modbus TCP).
    Socket,
}

/// A parsed `MODBUS::` address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModbusAddress {
    /// The address of the underlying serial port or socket, e.g., `TCP::host::502` or `COM3`.
    pub address: String,
    /// The framing of requests and responses.
    pub framer: Framer,
}

impl ModbusAddress {
    /// Parse a `MODBUS::` address.
    pub fn parse(address: &str) -> Result<Self, EquipmentError> {
        let error = |token: &str, reason: &str| EquipmentError::Parse {
            address: address.to_string(),
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let mut tokens: Vec<&str> = address.trim().split("::").collect();
        if !tokens[0].eq_ignore_ascii_case("MODBUS") {
            return Err(error(tokens[0], "expected MODBUS"));
        }
        if let Some(empty) = tokens.iter().find(|token| token.is_empty()) {
            return Err(error(empty, "empty token between separators"));
        }
        let udp = tokens.len() > 2
            && tokens
                .last()
                .is_some_and(|token| token.eq_ignore_ascii_case("UDP"));
        if udp {
            tokens.pop();
        }
        let framer = match tokens.last().map(|token| token.to_ascii_uppercase()) {
            Some(token) if tokens.len() > 2 && ["ASCII", "RTU", "SOCKET"].contains(&&*token) => {
                tokens.pop();
                Some(match token.as_str() {
                    "ASCII" => Framer::Ascii,
                    "RTU" => Framer::Rtu,
                    _ => Framer::Socket,
                })
            }
            _ => None,
        };

        let target = *tokens
            .get(1)
            .ok_or_else(|| error(address, "missing serial port or host"))?;
        let is_com = target
            .get(..3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("COM"))
            && target
                .get(3..)
                .is_some_and(|number| !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()));
        let serial = if target.starts_with("/dev/") {
            Some(format!("ASRL{target}"))
        } else if is_com {
            Some(target.to_ascii_uppercase())
        } else {
            None
        };

        match serial {
            Some(serial) => {
                if let Some(extra) = tokens.get(2) {
                    return Err(error(extra, "unexpected trailing token"));
                }
                if udp {
                    return Err(error("UDP", "a serial port cannot use UDP"));
                }
                Ok(ModbusAddress {
                    address: serial,
                    framer: framer.unwrap_or(Framer::Rtu),
                })
            }
            None => {
                if let Some(extra) = tokens.get(3) {
                    return Err(error(extra, "unexpected trailing token"));
                }
                let port = match tokens.get(2) {
                    Some(token) => token
                        .parse::<u16>()
                        .map_err(|_| error(token, "expected a port number"))?,
                    None => DEFAULT_PORT,
                };
                let protocol = if udp { "UDP" } else { "TCP" };
                Ok(ModbusAddress {
                    address: format!("{protocol}::{target}::{port}"),
                    framer: framer.unwrap_or(Framer::Socket),
                })
            }
        }
    }
}

impl FromStr for ModbusAddress {
    type Err = EquipmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModbusAddress::parse(s)
    }
}

/// A Modbus response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModbusPdu {
    /// The device id (unit identifier) of the responding device.
    pub device_id: u8,
    /// The function code of the response.
    pub function_code: u8,
    /// The register data of a read, or the echo of a write.
    pub data: Vec<u8>,
}

impl fmt::Display for ModbusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ModbusPdu(device_id={}, function_code=0x{:02X}, data={:02X?})",
            self.device_id, self.function_code, self.data
        )
    }
}

impl ModbusPdu {
    /// The data as big-endian values of type `T`.
    pub fn values<T: BlockValue>(&self) -> Result<Vec<T>, EquipmentError> {
        from_bytes(&self.data, Format::Raw, ByteOrder::Big)
    }

    /// The data as 16-bit registers.
    pub fn registers(&self) -> Result<Vec<u16>, EquipmentError> {
        self.values()
    }

    fn single<T: BlockValue>(&self) -> Result<T, EquipmentError> {
        if self.data.len() != T::SIZE {
            return Err(EquipmentError::Protocol(format!(
                "Modbus data has {} byte(s), expected {}",
                self.data.len(),
                T::SIZE
            )));
        }
        let values = self.values::<T>()?;
        values.first().copied().ok_or_else(|| {
            EquipmentError::Protocol("Modbus data is empty".to_string())
        })
    }

    /// The data as one unsigned 16-bit integer.
    pub fn uint16(&self) -> Result<u16, EquipmentError> {
        self.single()
    }

    /// The data as one signed 16-bit integer.
    pub fn int16(&self) -> Result<i16, EquipmentError> {
        self.single()
    }

    /// The data as one unsigned 32-bit integer.
    pub fn uint32(&self) -> Result<u32, EquipmentError> {
        self.single()
    }

    /// The data as one signed 32-bit integer.
    pub fn int32(&self) -> Result<i32, EquipmentError> {
        self.single()
    }

    /// The data as one unsigned 64-bit integer.
    pub fn uint64(&self) -> Result<u64, EquipmentError> {
        self.single()
    }

    /// The data as one signed 64-bit integer.
    pub fn int64(&self) -> Result<i64, EquipmentError> {
        self.single()
    }

    /// The data as one 32-bit float.
    pub fn float32(&self) -> Result<f32, EquipmentError> {
        self.single()
    }

    /// The data as one 64-bit float.
    pub fn float64(&self) -> Result<f64, EquipmentError> {
        self.single()
    }

    /// The data as text.
    pub fn decode(&self, encoding: Encoding) -> Result<String, EquipmentError> {
        encoding.decode(&self.data)
    }
}

/// Convert values into the big-endian 16-bit registers that hold them, e.g., a `f32` takes two
/// registers.
pub fn to_registers<T: BlockValue>(values: &[T]) -> Result<Vec<u16>, EquipmentError> {
    let bytes = to_bytes(values, Format::Raw, ByteOrder::Big)?;
    if bytes.len() % 2 != 0 {
        return Err(EquipmentError::InvalidArgument(format!(
            "{} byte(s) do not fill whole 16-bit registers",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// CRC-16 of Modbus RTU frames.
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub(crate) fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Longitudinal redundancy check of Modbus ASCII frames.
pub(crate) fn lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
        .wrapping_neg()
}

fn hex_decode(text: &[u8]) -> Result<Vec<u8>, EquipmentError> {
    if text.len() % 2 != 0 {
        return Err(EquipmentError::Protocol(
            "Modbus ASCII frame has an odd number of characters".to_string(),
        ));
    }
    text.chunks_exact(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .ok_or_else(|| {
                    EquipmentError::Protocol(format!(
                        "Modbus ASCII frame contains invalid characters {:?}",
                        String::from_utf8_lossy(pair)
                    ))
                })
        })
        .collect()
}

/// A Modbus client.
///
/// Every request waits for its response. An exception response of the device is returned as
/// [`EquipmentError::Modbus`].
#[derive(Debug)]
pub struct Modbus {
    connection: Connection,
    framer: Framer,
    transaction_id: u16,
}

impl Modbus {
    /// Connect to a `MODBUS::` address with the global [`Registry`].
    ///
    /// The `options` apply to the underlying serial port or socket.
    pub fn connect(address: &str, options: ConnectOptions) -> Result<Self, EquipmentError> {
        Modbus::connect_with(Registry::global(), address, options)
    }

    /// Connect to a `MODBUS::` address with the given registry.
    pub fn connect_with(
        registry: &Registry,
        address: &str,
        options: ConnectOptions,
    ) -> Result<Self, EquipmentError> {
        let parsed = ModbusAddress::parse(address)?;
        let connection = registry.connect(&parsed.address, options)?;
        Modbus::new(connection, parsed.framer)
    }

    /// Use an open connection with the given framing. The terminations of the connection are
    /// changed to suit the framing.
    pub fn new(mut connection: Connection, framer: Framer) -> Result<Self, EquipmentError> {
        let termination: &[u8] = if framer == Framer::Ascii { b"\r\n" } else { b"" };
        let engine = connection.message_based()?;
        engine.set_termination(termination);
        engine.set_block_detection(BlockDetection::Disabled);
        Ok(Modbus {
            connection,
            framer,
            transaction_id: 0,
        })
    }

    /// The framing of requests and responses.
    pub fn framer(&self) -> Framer {
        self.framer
    }

    /// The underlying connection.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// The timeout of reads and writes.
    pub fn timeout(&mut self) -> Result<Option<Duration>, EquipmentError> {
        Ok(self.connection.message_based()?.timeout())
    }

    /// Set the timeout of reads and writes, `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        self.connection.message_based()?.set_timeout(timeout)
    }

    /// Close the underlying connection.
    pub fn disconnect(&mut self) -> Result<(), EquipmentError> {
        self.connection.disconnect()
    }

    /// Send a request with `function_code` and `data` to `device_id`, returns the number of
    /// bytes written.
    pub fn write(
        &mut self,
        function_code: u8,
        data: &[u8],
        device_id: u8,
    ) -> Result<usize, EquipmentError> {
        if data.len() >= MAX_PDU_SIZE {
            return Err(EquipmentError::InvalidArgument(format!(
                "Modbus request data of {} byte(s) exceeds the PDU size of {MAX_PDU_SIZE} bytes",
                data.len()
            )));
        }
        let mut pdu = Vec::with_capacity(data.len() + 1);
        pdu.push(function_code);
        pdu.extend_from_slice(data);

        let frame = match self.framer {
            Framer::Socket => {
                self.transaction_id = self.transaction_id.checked_add(1).unwrap_or(1);
                let length = (pdu.len() + 1) as u16;
                let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
                frame.extend_from_slice(&self.transaction_id.to_be_bytes());
                frame.extend_from_slice(&[0, 0]);
                frame.extend_from_slice(&length.to_be_bytes());
                frame.push(device_id);
                frame.extend_from_slice(&pdu);
                frame
            }
            Framer::Rtu => {
                let mut frame = vec![device_id];
                frame.extend_from_slice(&pdu);
                let crc = crc16(&frame);
                frame.extend_from_slice(&crc.to_le_bytes());
                frame
            }
            Framer::Ascii => {
                let mut binary = vec![device_id];
                binary.extend_from_slice(&pdu);
                binary.push(lrc(&binary));
                let mut frame = b":".to_vec();
                for byte in binary {
                    frame.extend_from_slice(format!("{byte:02X}").as_bytes());
                }
                frame
            }
        };
        self.connection.write(&frame)
    }

    /// Read a response, returns the device id and the PDU (function code and data).
    pub fn read(&mut self) -> Result<(u8, Vec<u8>), EquipmentError> {
        let (device_id, pdu) = match self.framer {
            Framer::Socket => self.read_socket()?,
            Framer::Rtu => self.read_rtu()?,
            Framer::Ascii => self.read_ascii()?,
        };
        match pdu.first() {
            None => Err(EquipmentError::Protocol(
                "Modbus response without a function code".to_string(),
            )),
            Some(&function_code) if function_code & 0x80 != 0 => {
                let code = pdu.get(1).copied().unwrap_or_default();
                Err(EquipmentError::Modbus {
                    code,
                    message: exception_message(code),
                })
            }
            Some(_) => Ok((device_id, pdu)),
        }
    }

    fn read_socket(&mut self) -> Result<(u8, Vec<u8>), EquipmentError> {
        let header = self.connection.read_exact(MBAP_HEADER_SIZE)?;
        let tid = u16::from_be_bytes([header[0], header[1]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let device_id = header[6];
        if length == 0 {
            return Err(EquipmentError::Protocol(
                "Modbus MBAP header with a length of zero".to_string(),
            ));
        }
        // read the whole frame before checking the transaction id
        let pdu = self.connection.read_exact(length - 1)?;
        if tid != self.transaction_id {
            return Err(EquipmentError::Protocol(format!(
                "Received unexpected Modbus transaction ID {tid}, expected {}",
                self.transaction_id
            )));
        }
        Ok((device_id, pdu))
    }

    fn read_rtu(&mut self) -> Result<(u8, Vec<u8>), EquipmentError> {
        let mut frame = self.connection.read_exact(2)?;
        let function_code = frame[1];
        let remaining = if function_code & 0x80 != 0 {
            1
        } else {
            match function_code {
                READ_COILS | READ_DISCRETE_INPUTS | READ_HOLDING_REGISTERS
                | READ_INPUT_REGISTERS => {
                    let count = self.connection.read_exact(1)?;
                    frame.extend_from_slice(&count);
                    usize::from(count[0])
                }
                WRITE_SINGLE_COIL
                | WRITE_SINGLE_REGISTER
                | WRITE_MULTIPLE_COILS
                | WRITE_MULTIPLE_REGISTERS => 4,
                other => {
                    return Err(EquipmentError::Protocol(format!(
                        "Cannot determine the length of a Modbus RTU response with function code \
                         0x{other:02X}"
                    )));
                }
            }
        };
        frame.extend(self.connection.read_exact(remaining + 2)?);

        let (body, crc) = frame.split_at(frame.len() - 2);
        let expected = crc16(body);
        let received = u16::from_le_bytes([crc[0], crc[1]]);
        if received != expected {
            return Err(EquipmentError::Protocol(format!(
                "Modbus RTU CRC mismatch, received 0x{received:04X}, expected 0x{expected:04X}"
            )));
        }
        Ok((body[0], body[1..].to_vec()))
    }

    fn read_ascii(&mut self) -> Result<(u8, Vec<u8>), EquipmentError> {
        let line = self.connection.read()?;
        let hex = line.strip_prefix(b":").ok_or_else(|| {
            EquipmentError::Protocol("Modbus ASCII frame does not start with ':'".to_string())
        })?;
        let binary = hex_decode(hex)?;
        if binary.len() < 3 {
            return Err(EquipmentError::Protocol(format!(
                "Modbus ASCII frame of {} byte(s) is too short",
                binary.len()
            )));
        }
        if lrc(&binary) != 0 {
            return Err(EquipmentError::Protocol(
                "Modbus ASCII LRC mismatch".to_string(),
            ));
        }
        Ok((binary[0], binary[1..binary.len() - 1].to_vec()))
    }

    /// Send a request and check that the response belongs to it.
    fn request(
        &mut self,
        function_code: u8,
        data: &[u8],
        device_id: u8,
    ) -> Result<(u8, Vec<u8>), EquipmentError> {
        self.write(function_code, data, device_id)?;
        let (device_id, response) = self.read()?;
        if response[0] != function_code {
            return Err(EquipmentError::Protocol(format!(
                "Received unexpected Modbus function code 0x{:02X}, expected 0x{function_code:02X}",
                response[0]
            )));
        }
        Ok((device_id, response))
    }

    fn read_registers(
        &mut self,
        function_code: u8,
        address: u16,
        count: u16,
        max: u16,
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        if count == 0 || count > max {
            return Err(EquipmentError::InvalidArgument(format!(
                "Cannot read {count} Modbus value(s), must be in the range [1, {max}]"
            )));
        }
        let mut request = address.to_be_bytes().to_vec();
        request.extend_from_slice(&count.to_be_bytes());
        let (device_id, response) = self.request(function_code, &request, device_id)?;
        let byte_count = response.get(1).copied().map(usize::from);
        let data = response.get(2..).unwrap_or_default();
        if byte_count != Some(data.len()) {
            return Err(EquipmentError::Protocol(format!(
                "Modbus response declares {byte_count:?} byte(s), but contains {}",
                data.len()
            )));
        }
        Ok(ModbusPdu {
            device_id,
            function_code,
            data: data.to_vec(),
        })
    }

    fn read_bits(
        &mut self,
        function_code: u8,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<Vec<bool>, EquipmentError> {
        let pdu = self.read_registers(function_code, address, count, MAX_READ_BITS, device_id)?;
        let bits: Vec<bool> = pdu
            .data
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
            .take(usize::from(count))
            .collect();
        if bits.len() != usize::from(count) {
            return Err(EquipmentError::Protocol(format!(
                "Modbus response contains {} of {count} bit(s)",
                bits.len()
            )));
        }
        Ok(bits)
    }

    /// Read coils (function code `0x01`).
    pub fn read_coils(
        &mut self,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<Vec<bool>, EquipmentError> {
        self.read_bits(READ_COILS, address, count, device_id)
    }

    /// Read discrete inputs (function code `0x02`).
    pub fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<Vec<bool>, EquipmentError> {
        self.read_bits(READ_DISCRETE_INPUTS, address, count, device_id)
    }

    /// Read `count` holding registers (function code `0x03`).
    pub fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        self.read_registers(
            READ_HOLDING_REGISTERS,
            address,
            count,
            MAX_READ_REGISTERS,
            device_id,
        )
    }

    /// Read `count` input registers (function code `0x04`).
    pub fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        self.read_registers(
            READ_INPUT_REGISTERS,
            address,
            count,
            MAX_READ_REGISTERS,
            device_id,
        )
    }

    fn write_request(
        &mut self,
        function_code: u8,
        data: &[u8],
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        let (device_id, response) = self.request(function_code, data, device_id)?;
        Ok(ModbusPdu {
            device_id,
            function_code,
            data: response[1..].to_vec(),
        })
    }

    /// Switch a single coil on or off (function code `0x05`). The response echoes the request.
    pub fn write_coil(
        &mut self,
        address: u16,
        value: bool,
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        self.write_request(WRITE_SINGLE_COIL, &data, device_id)
    }

    /// Switch consecutive coils (function code `0x0F`). The response holds the start address
    /// and the number of coils.
    pub fn write_coils(
        &mut self,
        address: u16,
        values: &[bool],
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        if values.is_empty() || values.len() > MAX_WRITE_COILS {
            return Err(EquipmentError::InvalidArgument(format!(
                "Cannot write {} Modbus coil(s), must be in the range [1, {MAX_WRITE_COILS}]",
                values.len()
            )));
        }
        let packed: Vec<u8> = values
            .chunks(8)
            .map(|bits| {
                bits.iter()
                    .enumerate()
                    .fold(0u8, |byte, (i, &bit)| byte | (u8::from(bit) << i))
            })
            .collect();
        let mut data = address.to_be_bytes().to_vec();
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push(packed.len() as u8);
        data.extend_from_slice(&packed);
        self.write_request(WRITE_MULTIPLE_COILS, &data, device_id)
    }

    /// Write a single holding register (function code `0x06`). The response echoes the request.
    pub fn write_register(
        &mut self,
        address: u16,
        value: u16,
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend_from_slice(&value.to_be_bytes());
        self.write_request(WRITE_SINGLE_REGISTER, &data, device_id)
    }

    /// Write consecutive holding registers (function code `0x10`). See [`to_registers`] to
    /// write other types than `u16`. The response holds the start address and the number of
    /// registers.
    pub fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
        device_id: u8,
    ) -> Result<ModbusPdu, EquipmentError> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(EquipmentError::InvalidArgument(format!(
                "Cannot write {} Modbus register(s), must be in the range [1, {MAX_WRITE_REGISTERS}]",
                values.len()
            )));
        }
        let mut data = address.to_be_bytes().to_vec();
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push((2 * values.len()) as u8);
        for value in values {
            data.extend_from_slice(&value.to_be_bytes());
        }
        self.write_request(WRITE_MULTIPLE_REGISTERS, &data, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
    }

    #[test]
    fn test_lrc() {
        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert_eq!(lrc(&frame), 0x7E);
    }

    #[test]
    fn test_hex_decode() {
        assert_eq!(hex_decode(b"01FF").unwrap(), vec![0x01, 0xFF]);
        assert!(hex_decode(b"0").is_err());
        assert!(hex_decode(b"0G").is_err());
    }
}

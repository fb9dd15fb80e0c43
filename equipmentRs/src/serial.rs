//! This module provides the transport for equipment that is connected through a serial port.
//!
//! It is a blocking implementation using the `serialport` crate. It is also used to talk to
//! Prologix GPIB-USB controllers, which appear as a serial port.

use std::{
    any::Any,
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, DataBits, SerialPort};

use crate::{
    Address, AddressFields, Chunk, ConnectOptions, EquipmentError, FlowControl, Parity,
    SerialOptions, StopBits, Transport, transport::io_error,
};

/// `serialport` needs a finite timeout, blocking reads wait in steps of this length.
const BLOCKING_STEP: Duration = Duration::from_secs(1);

/// A blocking serial port implementation using the `serialport` crate.
#[derive(Debug)]
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    inter_byte_timeout: Option<Duration>,
}

impl SerialTransport {
    /// Open the serial port of a `COM`, `ASRL` or `ASRLCOM` address.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Serial { port } = address.fields() else {
            return Err(EquipmentError::connection(address, "not a serial address"));
        };
        Self::open_port(port, &options.serial, options.timeout)
            .map_err(|e| EquipmentError::connection(address, e))
    }

    /// Open a serial port by its name, e.g., `COM3` or `/dev/ttyUSB0`.
    ///
    /// # Arguments
    /// * `port` - Name of the serial port.
    /// * `serial` - Baud rate, data bits, parity, stop bits and flow control.
    /// * `timeout` - Initial read and write timeout, `None` blocks forever.
    pub fn open_port(
        port: &str,
        serial: &SerialOptions,
        timeout: Option<Duration>,
    ) -> Result<Self, EquipmentError> {
        let builder = serialport::new(port, serial.baud_rate)
            .data_bits(data_bits(serial.data_bits)?)
            .parity(parity(serial.parity)?)
            .stop_bits(stop_bits(serial.stop_bits)?)
            .flow_control(flow_control(serial.flow_control)?)
            .timeout(timeout.unwrap_or(BLOCKING_STEP));
        let port_handle = builder.open()?;
        log::debug!(
            "Opened serial port {port} ({} baud, {}{:?}{:?}, flow control {:?})",
            serial.baud_rate,
            serial.data_bits,
            serial.parity,
            serial.stop_bits,
            serial.flow_control
        );
        Ok(SerialTransport {
            port: port_handle,
            inter_byte_timeout: serial.inter_byte_timeout,
        })
    }

    /// The underlying serial port, e.g., to change the baud rate or to toggle the DTR line.
    pub fn port_mut(&mut self) -> &mut dyn SerialPort {
        self.port.as_mut()
    }

    /// Read into `buf`, waiting at most `timeout` for the first byte.
    fn read_some(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, EquipmentError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let step = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(1)),
                None => BLOCKING_STEP,
            };
            self.port.set_timeout(step)?;
            match self.port.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut && deadline.is_none() => continue,
                Err(e) => return Err(io_error(e, timeout)),
            }
        }
    }
}

fn data_bits(bits: u8) -> Result<DataBits, EquipmentError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(EquipmentError::InvalidArgument(format!(
            "Unsupported number of data bits {bits}, must be 5, 6, 7 or 8"
        ))),
    }
}

fn parity(parity: Parity) -> Result<serialport::Parity, EquipmentError> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Mark | Parity::Space => Err(EquipmentError::InvalidArgument(format!(
            "{parity:?} parity is not supported by serial ports"
        ))),
    }
}

fn stop_bits(stop_bits: StopBits) -> Result<serialport::StopBits, EquipmentError> {
    match stop_bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        StopBits::OnePointFive => Err(EquipmentError::InvalidArgument(
            "1.5 stop bits are not supported by serial ports".to_string(),
        )),
    }
}

fn flow_control(flow_control: FlowControl) -> Result<serialport::FlowControl, EquipmentError> {
    match flow_control {
        FlowControl::None => Ok(serialport::FlowControl::None),
        FlowControl::RtsCts => Ok(serialport::FlowControl::Hardware),
        FlowControl::XonXoff => Ok(serialport::FlowControl::Software),
        FlowControl::DsrDtr => Err(EquipmentError::InvalidArgument(
            "DSR/DTR flow control is not supported by serial ports".to_string(),
        )),
    }
}

impl Transport for SerialTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        let mut buf = vec![0u8; max_bytes.max(1)];
        let mut n = self.read_some(&mut buf, timeout)?;
        if n == 0 {
            return Ok(Chunk::eof());
        }

        // keep reading while the bytes arrive closer together than the inter-byte timeout
        if let Some(gap) = self.inter_byte_timeout {
            while n < buf.len() {
                match self.read_some(&mut buf[n..], Some(gap)) {
                    Ok(0) => break,
                    Ok(more) => n += more,
                    Err(e) if e.is_timeout() => break,
                    Err(e) => return Err(e),
                }
            }
        }
        buf.truncate(n);
        Ok(Chunk::data(buf))
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        self.port.set_timeout(timeout.unwrap_or(BLOCKING_STEP))?;
        let n = self.port.write(data).map_err(|e| io_error(e, timeout))?;
        self.port.flush().map_err(|e| io_error(e, timeout))?;
        Ok(n)
    }

    /// Discard the bytes in the input and output buffers of the serial port.
    fn clear(&mut self) -> Result<(), EquipmentError> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

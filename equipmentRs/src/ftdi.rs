//! This module provides the transport for equipment with an FTDI USB-to-serial chip, driven
//! directly over libusb (driver number 0 of an `FTDI` address).
//!
//! Every bulk-in packet of an FTDI chip starts with a modem status and a line status byte. The
//! chip sends a packet with only these two bytes at every latency timer tick, so a status-only
//! packet that follows data marks the end of a burst and ends a message. The line settings are
//! taken from the `serial` options table.

use std::{
    any::Any,
    time::{Duration, Instant},
};

use rusb::{Recipient, RequestType};

use crate::{
    Address, AddressFields, Chunk, ConnectOptions, EquipmentError, FlowControl, Parity, StopBits,
    Transport, usb::UsbDevice,
};

// bcdDevice of the chip types
const FT232A: u16 = 0x0200;
const FT2232C: u16 = 0x0500;
const FT2232H: u16 = 0x0700;
const FT4232H: u16 = 0x0800;
const FT232H: u16 = 0x0900;
const FT4232HA: u16 = 0x3600;

// vendor requests
const SIO_RESET: u8 = 0;
const SIO_MODEM_CTRL: u8 = 1;
const SIO_SET_FLOW_CTRL: u8 = 2;
const SIO_SET_BAUDRATE: u8 = 3;
const SIO_SET_DATA: u8 = 4;
const SIO_GET_MODEM_STATUS: u8 = 5;
const SIO_SET_LATENCY_TIMER: u8 = 9;
const SIO_GET_LATENCY_TIMER: u8 = 0x0A;

/// Overrun, parity, framing and FIFO errors in the line status byte.
const LINE_STATUS_ERRORS: u8 = 0x8E;
const STATUS_SIZE: usize = 2;

const XON: u8 = 17;
const XOFF: u8 = 19;

fn invalid_baud(message: String) -> EquipmentError {
    EquipmentError::InvalidArgument(message)
}

/// The index of the baud rate for the original SIO chip.
pub(crate) fn sio_index(baud_rate: u32) -> Result<u32, EquipmentError> {
    const SPEEDS: [u32; 10] = [300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];
    SPEEDS
        .iter()
        .position(|&speed| speed == baud_rate)
        .map(|index| index as u32)
        .ok_or_else(|| {
            invalid_baud(format!(
                "Invalid baud rate {baud_rate}, must be one of: {SPEEDS:?}"
            ))
        })
}

fn check_range(baud_rate: u32, clock: f64) -> Result<(), EquipmentError> {
    if f64::from(baud_rate) > clock {
        return Err(invalid_baud(format!(
            "Invalid baud rate {baud_rate}, must be < {:.1} MBd",
            clock / 1e6
        )));
    }
    let min = clock / 16384.0;
    if f64::from(baud_rate) < min {
        return Err(invalid_baud(format!(
            "Invalid baud rate {baud_rate}, must be > {min:.1} Bd"
        )));
    }
    Ok(())
}

/// The divisor of an FT232AM chip, returns `(actual baud rate, divisor)`.
pub(crate) fn am_divisor(baud_rate: u32) -> Result<(u32, u32), EquipmentError> {
    let clock = 3e6;
    check_range(baud_rate, clock)?;
    let mut divisor3 = ((8.0 * clock) / f64::from(baud_rate)).round() as u32;
    if divisor3 & 0x7 == 7 {
        divisor3 += 1;
    }
    let mut divisor = divisor3 >> 3;
    let fraction = divisor3 & 0x7;
    if divisor == 1 {
        // 2 MBd -> 1, 3 MBd -> 0
        return Ok(if fraction != 0 {
            (2_000_000, 1)
        } else {
            (3_000_000, 0)
        });
    }
    let base = f64::from(divisor);
    let actual = match fraction {
        0 => clock / base,
        1 => {
            divisor |= 0xC000;
            clock / (base + 0.125)
        }
        4.. => {
            divisor |= 0x4000;
            clock / (base + 0.5)
        }
        _ => {
            divisor |= 0x8000;
            clock / (base + 0.25)
        }
    };
    Ok((actual.round() as u32, divisor))
}

/// The divisor of FT232BM and later chips, returns `(actual baud rate, divisor)`.
///
/// The H-series chips use the 12 MHz clock for baud rates of 1200 Bd and above.
pub(crate) fn bm_divisor(baud_rate: u32, device_version: u16) -> Result<(u32, u32), EquipmentError> {
    const FRACTION: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];
    let hi_speed = baud_rate >= 1200
        && matches!(device_version, FT2232H | FT4232H | FT232H | FT4232HA);
    let clock = if hi_speed { 12e6 } else { 3e6 };
    check_range(baud_rate, clock)?;
    let divisor3 = ((8.0 * clock) / f64::from(baud_rate)).round() as u32;
    let actual = ((8.0 * clock) as u32 + divisor3 / 2) / divisor3;
    let mut divisor = (divisor3 >> 3) | (FRACTION[(divisor3 & 0x7) as usize] << 14);
    if divisor == 1 {
        divisor = 0;
    } else if divisor == 0x4001 {
        divisor = 1;
    }
    if hi_speed {
        divisor |= 1 << 17;
    }
    Ok((actual, divisor))
}

/// The divisor for a baud rate, the actual baud rate must be within 3% of the requested one.
pub(crate) fn divisor(baud_rate: u32, device_version: u16) -> Result<u32, EquipmentError> {
    let (actual, divisor) = if device_version < FT232A {
        (baud_rate, sio_index(baud_rate)?)
    } else if device_version == FT232A {
        am_divisor(baud_rate)?
    } else {
        bm_divisor(baud_rate, device_version)?
    };
    let tolerance = (f64::from(actual) - f64::from(baud_rate)).abs() / f64::from(baud_rate);
    if tolerance > 0.03 {
        return Err(invalid_baud(format!(
            "The actual baud rate ({actual}) is not within 3% of the requested baud rate \
             ({baud_rate})"
        )));
    }
    Ok(divisor)
}

/// An FTDI chip.
#[derive(Debug)]
pub struct FtdiTransport {
    device: Option<UsbDevice>,
    index: u16,
    device_version: u16,
    timeout: Option<Duration>,
    /// The last read stopped at `max_bytes` before the end of the message.
    mid_message: bool,
}

impl FtdiTransport {
    /// Open the chip of an `FTDI` address and apply the line settings of `options.serial`.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Ftdi {
            vendor_id,
            product_id,
            serial_number,
            interface_number,
        } = address.fields()
        else {
            return Err(EquipmentError::connection(address, "not an FTDI address"));
        };
        if address.board() != 0 {
            return Err(EquipmentError::connection(
                address,
                format!(
                    "FTDI driver {} is not supported, only driver 0 (libusb) is",
                    address.board()
                ),
            ));
        }
        let device = UsbDevice::open(
            address,
            *vendor_id,
            *product_id,
            serial_number,
            interface_number.unwrap_or(0),
            options,
        )?;
        let mut ftdi = FtdiTransport {
            index: u16::from(device.interface_number) + 1,
            device_version: device.bcd_device,
            device: Some(device),
            timeout: options.timeout,
            mid_message: false,
        };

        let serial = &options.serial;
        ftdi.set_baud_rate(serial.baud_rate)?;
        ftdi.set_data_characteristics(serial.data_bits, serial.parity, serial.stop_bits)?;
        ftdi.set_flow_control(serial.flow_control)?;
        Ok(ftdi)
    }

    fn device(&self) -> Result<&UsbDevice, EquipmentError> {
        self.device.as_ref().ok_or(EquipmentError::ConnectionClosed)
    }

    fn vendor_out(&self, request: u8, value: u16, index: u16) -> Result<(), EquipmentError> {
        self.device()?
            .control_out(
                RequestType::Vendor,
                Recipient::Device,
                request,
                value,
                index,
                &[],
                self.timeout,
            )
            .map(drop)
    }

    fn vendor_in(&self, request: u8, length: usize) -> Result<Vec<u8>, EquipmentError> {
        self.device()?.control_in(
            RequestType::Vendor,
            Recipient::Device,
            request,
            0,
            self.index,
            length,
            self.timeout,
        )
    }

    /// The `bcdDevice` value, which identifies the chip type.
    pub fn device_version(&self) -> u16 {
        self.device_version
    }

    /// Set the baud rate.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), EquipmentError> {
        let divisor = divisor(baud_rate, self.device_version)?;
        let value = (divisor & 0xFFFF) as u16;
        let mut index = ((divisor >> 16) & 0xFFFF) as u16;
        if self.device_version >= FT2232H || self.device_version == FT2232C {
            index = (index << 8) | self.index;
        }
        self.vendor_out(SIO_SET_BAUDRATE, value, index)
    }

    /// Set the number of data bits (7 or 8), the parity and the stop bits.
    pub fn set_data_characteristics(
        &mut self,
        data_bits: u8,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<(), EquipmentError> {
        if !matches!(data_bits, 7 | 8) {
            return Err(EquipmentError::InvalidArgument(format!(
                "Unsupported data bits {data_bits}, must be either 7 or 8"
            )));
        }
        let parity = match parity {
            Parity::None => 0,
            Parity::Odd => 0x100,
            Parity::Even => 0x200,
            Parity::Mark => 0x300,
            Parity::Space => 0x400,
        };
        let stop_bits = match stop_bits {
            StopBits::One => 0,
            StopBits::OnePointFive => 0x800,
            StopBits::Two => 0x1000,
        };
        self.vendor_out(SIO_SET_DATA, u16::from(data_bits) | parity | stop_bits, self.index)
    }

    /// Set the flow control, XON/XOFF uses the characters 17 and 19.
    pub fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), EquipmentError> {
        let (value, index) = match flow_control {
            FlowControl::None => (0, 0),
            FlowControl::RtsCts => (0, 0x1 << 8),
            FlowControl::DsrDtr => (0, 0x2 << 8),
            FlowControl::XonXoff => ((u16::from(XOFF) << 8) | u16::from(XON), 0x4 << 8),
        };
        self.vendor_out(SIO_SET_FLOW_CTRL, value, index | self.index)
    }

    /// Set the DTR line.
    pub fn set_dtr(&mut self, active: bool) -> Result<(), EquipmentError> {
        self.vendor_out(SIO_MODEM_CTRL, if active { 0x101 } else { 0x100 }, self.index)
    }

    /// Set the RTS line.
    pub fn set_rts(&mut self, active: bool) -> Result<(), EquipmentError> {
        self.vendor_out(SIO_MODEM_CTRL, if active { 0x202 } else { 0x200 }, self.index)
    }

    /// The latency timer in milliseconds, fixed at 16 ms for old chips.
    pub fn latency_timer(&self) -> Result<u8, EquipmentError> {
        if self.device_version <= FT232A {
            return Ok(16);
        }
        let data = self.vendor_in(SIO_GET_LATENCY_TIMER, 1)?;
        data.first()
            .copied()
            .ok_or_else(|| EquipmentError::Protocol("empty latency timer response".to_string()))
    }

    /// Set the latency timer, 1 to 255 milliseconds.
    pub fn set_latency_timer(&mut self, milliseconds: u8) -> Result<(), EquipmentError> {
        if milliseconds == 0 {
            return Err(EquipmentError::InvalidArgument(
                "Invalid latency timer value 0, must be in the range [1, 255]".to_string(),
            ));
        }
        if self.device_version <= FT232A {
            if milliseconds == 16 {
                return Ok(());
            }
            return Err(EquipmentError::InvalidArgument(
                "The latency timer of this chip is fixed at 16 ms".to_string(),
            ));
        }
        self.vendor_out(SIO_SET_LATENCY_TIMER, u16::from(milliseconds), self.index)
    }

    /// The `(modem, line)` status bytes.
    pub fn poll_status(&self) -> Result<(u8, u8), EquipmentError> {
        let length = if self.device_version < FT232A { 1 } else { 2 };
        let data = self.vendor_in(SIO_GET_MODEM_STATUS, length)?;
        let modem = data.first().copied().unwrap_or(0);
        let line = data.get(1).copied().unwrap_or(0);
        Ok((modem, line))
    }

    /// Purge the receive and transmit buffers of the chip.
    pub fn purge_buffers(&mut self) -> Result<(), EquipmentError> {
        self.vendor_out(SIO_RESET, 1, self.index)?;
        self.vendor_out(SIO_RESET, 2, self.index)
    }

    /// Reset the chip.
    pub fn reset_device(&mut self) -> Result<(), EquipmentError> {
        self.vendor_out(SIO_RESET, 0, self.index)
    }
}

impl Transport for FtdiTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let packet = self.device()?.bulk_in.max_packet_size;
        let mut data = Vec::new();
        loop {
            let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if left.is_some_and(|left| left.is_zero()) {
                if data.is_empty() {
                    return Err(EquipmentError::Timeout {
                        timeout: timeout.unwrap_or_default(),
                        partial: Vec::new(),
                    });
                }
                return Ok(Chunk::data(data));
            }
            let received = self.device()?.read_bulk(packet, left)?;
            if received.len() > STATUS_SIZE {
                if received[1] & LINE_STATUS_ERRORS != 0 {
                    return Err(EquipmentError::Protocol(format!(
                        "FTDI read error, line status 0b{:08b}",
                        received[1]
                    )));
                }
                data.extend_from_slice(&received[STATUS_SIZE..]);
                if data.len() >= max_bytes {
                    self.mid_message = true;
                    return Ok(Chunk::data(data));
                }
            } else if !data.is_empty() || self.mid_message {
                self.mid_message = false;
                return Ok(Chunk::end(data));
            }
        }
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        if self.device_version < FT232A {
            return Err(EquipmentError::InterfaceCommandNotSupported);
        }
        self.device()?.write_bulk(data, timeout)
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        if let Some(device) = self.device.take() {
            device.release();
        }
        Ok(())
    }

    /// Purge the buffers of the chip.
    fn clear(&mut self) -> Result<(), EquipmentError> {
        self.purge_buffers()
    }

    fn marks_end(&self) -> bool {
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for FtdiTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

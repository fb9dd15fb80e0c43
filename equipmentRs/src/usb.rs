//! This module provides the raw USB and the USBTMC transports, both on top of libusb.
//!
//! A `USB::vid::pid::serial::RAW` address moves bytes over the bulk endpoints of the interface
//! as they are. Any other `USB` address speaks the USB Test & Measurement Class protocol: every
//! write is one `DEV_DEP_MSG_OUT` transfer and every read requests a `DEV_DEP_MSG_IN` transfer,
//! whose EOM bit ends the message.
//!
//! The serial number part of the address selects the device. It may also be `IGNORE` (the first
//! device with the vendor and product ID) or `bus=<n>,address=<m>`.

use std::{any::Any, thread, time::Duration};

use rusb::{
    Device, DeviceHandle, Direction, GlobalContext, Recipient, RequestType, TransferType, Version,
};

use crate::{
    Address, AddressFields, Backend, Chunk, ConnectOptions, EquipmentError, MessageBased, Session,
    Transport, UsbMode,
};

// USBTMC message IDs
const DEV_DEP_MSG_OUT: u8 = 1;
const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
const DEV_DEP_MSG_IN: u8 = 2;
const TRIGGER: u8 = 128;

// USBTMC class requests
const INITIATE_ABORT_BULK_OUT: u8 = 1;
const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
const INITIATE_ABORT_BULK_IN: u8 = 3;
const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
const INITIATE_CLEAR: u8 = 5;
const CHECK_CLEAR_STATUS: u8 = 6;
const GET_CAPABILITIES: u8 = 7;
const INDICATOR_PULSE: u8 = 64;
const READ_STATUS_BYTE: u8 = 128;
const REN_CONTROL: u8 = 160;
const GO_TO_LOCAL: u8 = 161;
const LOCAL_LOCKOUT: u8 = 162;

// USBTMC status values
const STATUS_SUCCESS: u8 = 0x01;
const STATUS_PENDING: u8 = 0x02;
const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;

const HEADER_SIZE: usize = 12;
const PENDING_RETRIES: usize = 100;
const PENDING_DELAY: Duration = Duration::from_millis(50);

/// The backend that the registry uses for the `USB` family.
///
/// Raw connections use the message family terminations, USBTMC connections end messages with the
/// EOM bit and use none.
pub(crate) fn backend() -> Backend {
    Backend::new("usb", |address, options| {
        let (read_termination, write_termination): (&[u8], &[u8]) = match address.fields() {
            AddressFields::Usb {
                mode: UsbMode::Raw, ..
            } => (b"\n", b"\r\n"),
            _ => (b"", b""),
        };
        let transport: Box<dyn Transport> = Box::new(UsbTransport::open(address, options)?);
        let engine =
            MessageBased::with_options(transport, options, read_termination, write_termination)?;
        Ok(Session::Message(engine))
    })
}

/// Map a libusb error, a timeout keeps the timeout that was exceeded.
pub(crate) fn usb_error(err: rusb::Error, timeout: Option<Duration>) -> EquipmentError {
    match err {
        rusb::Error::Timeout => EquipmentError::Timeout {
            timeout: timeout.unwrap_or_default(),
            partial: Vec::new(),
        },
        rusb::Error::NoDevice => EquipmentError::ConnectionClosed,
        e => EquipmentError::Usb(e),
    }
}

/// libusb waits forever for a zero timeout.
pub(crate) fn usb_timeout(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(timeout) => timeout.max(Duration::from_millis(1)),
        None => Duration::ZERO,
    }
}

/// The `bcdDevice` value of a device descriptor.
pub(crate) fn bcd_device(version: Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

/// Address and packet size of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub(crate) address: u8,
    pub(crate) max_packet_size: usize,
}

/// An opened USB device with a claimed interface.
pub(crate) struct UsbDevice {
    pub(crate) handle: DeviceHandle<GlobalContext>,
    pub(crate) interface_number: u8,
    pub(crate) bulk_in: Endpoint,
    pub(crate) bulk_out: Endpoint,
    pub(crate) intr_in: Option<Endpoint>,
    pub(crate) bcd_device: u16,
    detached: bool,
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("interface_number", &self.interface_number)
            .field("bulk_in", &self.bulk_in)
            .field("bulk_out", &self.bulk_out)
            .field("intr_in", &self.intr_in)
            .field("bcd_device", &format_args!("0x{:04x}", self.bcd_device))
            .finish()
    }
}

fn matches_serial(
    device: &Device<GlobalContext>,
    descriptor: &rusb::DeviceDescriptor,
    serial: &str,
) -> bool {
    if serial.eq_ignore_ascii_case("IGNORE") {
        return true;
    }
    if let Some((bus, address)) = serial
        .strip_prefix("bus=")
        .and_then(|rest| rest.split_once(",address="))
    {
        return bus.parse() == Ok(device.bus_number()) && address.parse() == Ok(device.address());
    }
    device
        .open()
        .and_then(|handle| handle.read_serial_number_string_ascii(descriptor))
        .is_ok_and(|number| number == serial)
}

impl UsbDevice {
    /// Find the device, claim the interface and look up its endpoints.
    pub(crate) fn open(
        address: &Address,
        vendor_id: u16,
        product_id: u16,
        serial: &str,
        interface_number: u8,
        options: &ConnectOptions,
    ) -> Result<Self, EquipmentError> {
        let device = rusb::devices()?
            .iter()
            .find(|device| {
                device.device_descriptor().is_ok_and(|descriptor| {
                    descriptor.vendor_id() == vendor_id
                        && descriptor.product_id() == product_id
                        && matches_serial(device, &descriptor, serial)
                })
            })
            .ok_or_else(|| {
                let mut message = "the USB device was not found".to_string();
                if cfg!(target_os = "linux") {
                    message.push_str(" (check the permissions or create a udev rule)");
                }
                EquipmentError::connection(address, message)
            })?;
        let descriptor = device.device_descriptor()?;
        let mut handle = device
            .open()
            .map_err(|e| EquipmentError::connection(address, e))?;

        let mut detached = false;
        if handle.kernel_driver_active(interface_number).unwrap_or(false) {
            handle.detach_kernel_driver(interface_number)?;
            detached = true;
        }

        let active = handle.active_configuration().ok();
        if let Some(configuration) = options.usb.configuration
            && active != Some(configuration)
        {
            handle.set_active_configuration(configuration).map_err(|e| {
                EquipmentError::connection(
                    address,
                    format!("cannot set the configuration to {configuration}, {e}"),
                )
            })?;
        }
        let config = device.active_config_descriptor()?;
        let alternate_setting = options.usb.alternate_setting;
        let interface = config
            .interfaces()
            .flat_map(|interface| interface.descriptors().collect::<Vec<_>>())
            .find(|d| {
                d.interface_number() == interface_number && d.setting_number() == alternate_setting
            })
            .ok_or_else(|| {
                EquipmentError::connection(
                    address,
                    format!(
                        "the device has no interface {interface_number} with alternate setting \
                         {alternate_setting}"
                    ),
                )
            })?;

        let find = |direction: Direction, kind: TransferType| {
            interface
                .endpoint_descriptors()
                .find(|ep| ep.direction() == direction && ep.transfer_type() == kind)
                .map(|ep| Endpoint {
                    address: ep.address(),
                    max_packet_size: usize::from(ep.max_packet_size()).max(1),
                })
        };
        let bulk_in = find(Direction::In, TransferType::Bulk).ok_or_else(|| {
            EquipmentError::connection(address, "cannot find a bulk-IN endpoint")
        })?;
        let bulk_out = find(Direction::Out, TransferType::Bulk).ok_or_else(|| {
            EquipmentError::connection(address, "cannot find a bulk-OUT endpoint")
        })?;
        let intr_in = find(Direction::In, TransferType::Interrupt);

        handle
            .claim_interface(interface_number)
            .map_err(|e| EquipmentError::connection(address, e))?;
        if alternate_setting != 0 {
            handle.set_alternate_setting(interface_number, alternate_setting)?;
        }
        log::debug!(
            "Claimed interface {interface_number} of USB device {vendor_id:04x}:{product_id:04x} \
             (bulk-in 0x{:02x}, bulk-out 0x{:02x})",
            bulk_in.address,
            bulk_out.address
        );

        Ok(UsbDevice {
            handle,
            interface_number,
            bulk_in,
            bulk_out,
            intr_in,
            bcd_device: bcd_device(descriptor.device_version()),
            detached,
        })
    }

    pub(crate) fn read_bulk(
        &self,
        size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, EquipmentError> {
        let mut buf = vec![0u8; size.max(self.bulk_in.max_packet_size)];
        let n = self
            .handle
            .read_bulk(self.bulk_in.address, &mut buf, usb_timeout(timeout))
            .map_err(|e| usb_error(e, timeout))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn write_bulk(
        &self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        let n = self
            .handle
            .write_bulk(self.bulk_out.address, data, usb_timeout(timeout))
            .map_err(|e| usb_error(e, timeout))?;
        if n == 0 && !data.is_empty() {
            return Err(EquipmentError::Protocol(
                "USB bulk-OUT wrote 0 bytes".to_string(),
            ));
        }
        Ok(n)
    }

    /// A control transfer from the device to the host.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn control_in(
        &self,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, EquipmentError> {
        let request_type = rusb::request_type(Direction::In, kind, recipient);
        log::debug!(
            "usb.control_in(0x{request_type:02x}, 0x{request:02x}, 0x{value:04x}, \
             0x{index:04x}, {length})"
        );
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, usb_timeout(timeout))
            .map_err(|e| usb_error(e, timeout))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// A control transfer from the host to the device.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn control_out(
        &self,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        let request_type = rusb::request_type(Direction::Out, kind, recipient);
        log::debug!(
            "usb.control_out(0x{request_type:02x}, 0x{request:02x}, 0x{value:04x}, \
             0x{index:04x}, {data:?})"
        );
        self.handle
            .write_control(request_type, request, value, index, data, usb_timeout(timeout))
            .map_err(|e| usb_error(e, timeout))
    }

    pub(crate) fn clear_halt(&mut self, endpoint: u8) -> Result<(), EquipmentError> {
        log::debug!("usb.clear_halt(0x{endpoint:02x})");
        Ok(self.handle.clear_halt(endpoint)?)
    }

    pub(crate) fn reset(&mut self) -> Result<(), EquipmentError> {
        log::debug!("usb.reset()");
        Ok(self.handle.reset()?)
    }

    /// Release the interface and give it back to the kernel driver. Errors are logged.
    pub(crate) fn release(mut self) {
        if let Err(e) = self.handle.release_interface(self.interface_number) {
            log::warn!("Releasing USB interface {} failed: {e}", self.interface_number);
        }
        if self.detached
            && let Err(e) = self.handle.attach_kernel_driver(self.interface_number)
        {
            log::warn!("Re-attaching the kernel driver failed: {e}");
        }
    }
}

/// The capabilities that a USBTMC device reports in its `GET_CAPABILITIES` response.
///
/// A device may not strictly follow the rules of the standard. The fields are public, so a
/// capability can be enabled by hand if a device refuses a request it actually supports.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsbtmcCapabilities {
    /// The raw response.
    pub data: Vec<u8>,
    /// The interface accepts the `INDICATOR_PULSE` request.
    pub accepts_indicator_pulse: bool,
    /// The interface accepts `REN_CONTROL`, `GO_TO_LOCAL` and `LOCAL_LOCKOUT` requests.
    pub accepts_remote_local: bool,
    /// The device accepts a service request.
    pub accepts_service_request: bool,
    /// The device can end a bulk-IN transfer at a termination character.
    pub accepts_term_char: bool,
    /// The device accepts the `TRIGGER` request.
    pub accepts_trigger: bool,
    /// The device is an IEEE 488.2 interface.
    pub is_488_interface: bool,
    /// The interface only listens.
    pub is_listen_only: bool,
    /// The interface only talks.
    pub is_talk_only: bool,
}

impl UsbtmcCapabilities {
    /// Interpret a `GET_CAPABILITIES` response, an unsuccessful response enables nothing.
    pub fn from_response(data: &[u8]) -> Self {
        let byte = |i: usize| data.get(i).copied().unwrap_or(0);
        let (iface, device, iface_488, device_488) = if byte(0) == STATUS_SUCCESS {
            (byte(4), byte(5), byte(14), byte(15))
        } else {
            (0, 0, 0, 0)
        };
        let is_488 = iface_488 & 0b100 != 0;
        let scpi = device_488 & 0b1000 != 0;
        let sr = device_488 & 0b100 != 0;
        UsbtmcCapabilities {
            data: data.to_vec(),
            accepts_indicator_pulse: iface & 0b100 != 0,
            is_talk_only: iface & 0b10 != 0,
            is_listen_only: iface & 0b1 != 0,
            accepts_term_char: device & 0b1 != 0,
            accepts_trigger: device_488 & 0b1 != 0 || iface_488 & 0b1 != 0,
            accepts_remote_local: device_488 & 0b10 != 0 || iface_488 & 0b10 != 0,
            accepts_service_request: is_488 || sr,
            is_488_interface: scpi || (sr && is_488),
        }
    }
}

/// The bTag sequence and capabilities of a USBTMC session.
#[derive(Debug)]
struct Usbtmc {
    tag: u8,
    tag_status: u8,
    capabilities: UsbtmcCapabilities,
}

impl Usbtmc {
    fn next_tag(&mut self) -> u8 {
        self.tag = (self.tag % 255) + 1;
        self.tag
    }

    fn dev_dep_msg_out(&mut self, message: &[u8]) -> Vec<u8> {
        let tag = self.next_tag();
        let mut out = Vec::with_capacity(HEADER_SIZE + message.len() + 3);
        out.extend_from_slice(&[DEV_DEP_MSG_OUT, tag, !tag, 0]);
        out.extend_from_slice(&(message.len() as u32).to_le_bytes());
        out.extend_from_slice(&[1, 0, 0, 0]); // EOM
        out.extend_from_slice(message);
        out.resize(out.len() + (4 - message.len() % 4) % 4, 0);
        out
    }

    fn request_dev_dep_msg_in(&mut self, size: u32) -> [u8; HEADER_SIZE] {
        let tag = self.next_tag();
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&[REQUEST_DEV_DEP_MSG_IN, tag, !tag, 0]);
        out[4..8].copy_from_slice(&size.to_le_bytes());
        out
    }

    fn trigger(&mut self) -> [u8; HEADER_SIZE] {
        let tag = self.next_tag();
        let mut out = [0u8; HEADER_SIZE];
        out[..3].copy_from_slice(&[TRIGGER, tag, !tag]);
        out
    }

    fn next_tag_status(&mut self) -> u8 {
        self.tag_status += 1;
        if self.tag_status > 127 {
            self.tag_status = 2;
        }
        self.tag_status
    }
}

/// A raw USB or USBTMC device.
#[derive(Debug)]
pub struct UsbTransport {
    device: Option<UsbDevice>,
    tmc: Option<Usbtmc>,
    buffer_size: usize,
    timeout: Option<Duration>,
}

impl UsbTransport {
    /// Open the device of a `USB` address and claim its interface.
    ///
    /// For USBTMC the capabilities of the device are requested.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Usb {
            vendor_id,
            product_id,
            serial_number,
            interface_number,
            mode,
        } = address.fields()
        else {
            return Err(EquipmentError::connection(address, "not a USB address"));
        };
        let device = UsbDevice::open(
            address,
            *vendor_id,
            *product_id,
            serial_number,
            interface_number.unwrap_or(0),
            options,
        )?;
        let mut transport = UsbTransport {
            device: Some(device),
            tmc: None,
            buffer_size: options.usb.buffer_size.max(1),
            timeout: options.timeout,
        };
        if *mode == UsbMode::Tmc {
            let data = transport.class_request(GET_CAPABILITIES, 0, 0x18)?;
            let capabilities = UsbtmcCapabilities::from_response(&data);
            log::debug!("USBTMC capabilities {capabilities:?}");
            transport.tmc = Some(Usbtmc {
                tag: 0,
                tag_status: 1,
                capabilities,
            });
        }
        Ok(transport)
    }

    fn device(&self) -> Result<&UsbDevice, EquipmentError> {
        self.device.as_ref().ok_or(EquipmentError::ConnectionClosed)
    }

    fn device_mut(&mut self) -> Result<&mut UsbDevice, EquipmentError> {
        self.device.as_mut().ok_or(EquipmentError::ConnectionClosed)
    }

    fn tmc(&mut self) -> Result<&mut Usbtmc, EquipmentError> {
        self.tmc.as_mut().ok_or(EquipmentError::InterfaceCommandNotSupported)
    }

    /// The capabilities of a USBTMC device, `None` for a raw connection.
    pub fn capabilities(&self) -> Option<&UsbtmcCapabilities> {
        self.tmc.as_ref().map(|tmc| &tmc.capabilities)
    }

    /// Mutable access to the capabilities of a USBTMC device.
    pub fn capabilities_mut(&mut self) -> Option<&mut UsbtmcCapabilities> {
        self.tmc.as_mut().map(|tmc| &mut tmc.capabilities)
    }

    /// The `bcdDevice` release number of the device.
    pub fn device_version(&self) -> Result<u16, EquipmentError> {
        Ok(self.device()?.bcd_device)
    }

    /// The timeout of control transfers.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Perform a class or vendor control transfer that reads `length` bytes.
    pub fn control_in(
        &self,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<Vec<u8>, EquipmentError> {
        self.device()?
            .control_in(kind, recipient, request, value, index, length, self.timeout)
    }

    /// Perform a class or vendor control transfer that sends `data`.
    pub fn control_out(
        &self,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, EquipmentError> {
        self.device()?
            .control_out(kind, recipient, request, value, index, data, self.timeout)
    }

    /// Perform a USB port reset of the device.
    pub fn reset_device(&mut self) -> Result<(), EquipmentError> {
        self.device_mut()?.reset()
    }

    fn class_request(
        &self,
        request: u8,
        value: u16,
        length: usize,
    ) -> Result<Vec<u8>, EquipmentError> {
        let index = u16::from(self.device()?.interface_number);
        self.control_in(
            RequestType::Class,
            Recipient::Interface,
            request,
            value,
            index,
            length,
        )
    }

    /// A class request whose first response byte must be `STATUS_SUCCESS`.
    fn checked_class_request(
        &self,
        request: u8,
        value: u16,
        length: usize,
    ) -> Result<Vec<u8>, EquipmentError> {
        let data = self.class_request(request, value, length)?;
        match data.first() {
            Some(&STATUS_SUCCESS) => Ok(data),
            status => Err(EquipmentError::Protocol(format!(
                "The USBTMC request 0x{request:02x} was not successful (status {status:?})"
            ))),
        }
    }

    fn require(
        &self,
        capable: impl Fn(&UsbtmcCapabilities) -> bool,
        what: &str,
    ) -> Result<(), EquipmentError> {
        match self.capabilities() {
            Some(capabilities) if capable(capabilities) => Ok(()),
            Some(_) => Err(EquipmentError::Protocol(format!(
                "The USBTMC device does not accept the {what} request"
            ))),
            None => Err(EquipmentError::InterfaceCommandNotSupported),
        }
    }

    /// Turn on the activity indicator of a USBTMC device for about a second.
    pub fn indicator_pulse(&mut self) -> Result<(), EquipmentError> {
        self.require(|c| c.accepts_indicator_pulse, "indicator-pulse")?;
        self.checked_class_request(INDICATOR_PULSE, 0, 1).map(drop)
    }

    /// Assert REN and put the USBTMC device in local lockout.
    pub fn local_lockout(&mut self) -> Result<(), EquipmentError> {
        self.require(|c| c.accepts_remote_local, "remote-local")?;
        self.checked_class_request(REN_CONTROL, 1, 1)?;
        self.checked_class_request(LOCAL_LOCKOUT, 0, 1).map(drop)
    }

    /// Abort the pending bulk transfer in one direction. Failures are logged.
    fn abort_transfer(&mut self, direction: Direction) {
        if let Err(e) = self.try_abort_transfer(direction) {
            log::warn!("Aborting the USBTMC {direction:?} transfer failed: {e}");
        }
    }

    fn try_abort_transfer(&mut self, direction: Direction) -> Result<(), EquipmentError> {
        log::debug!("Aborting the USBTMC {direction:?} transfer");
        let device = self.device()?;
        let (initiate, check, endpoint) = match direction {
            Direction::Out => (
                INITIATE_ABORT_BULK_OUT,
                CHECK_ABORT_BULK_OUT_STATUS,
                device.bulk_out.address,
            ),
            Direction::In => (
                INITIATE_ABORT_BULK_IN,
                CHECK_ABORT_BULK_IN_STATUS,
                device.bulk_in.address,
            ),
        };
        let index = u16::from(endpoint);
        let tag = self.tmc.as_ref().map_or(0, |tmc| tmc.tag);
        let mut response = self.control_in(
            RequestType::Class,
            Recipient::Endpoint,
            initiate,
            u16::from(tag),
            index,
            2,
        )?;
        if response.first() == Some(&STATUS_TRANSFER_NOT_IN_PROGRESS) {
            // retry with the tag of the transfer that the device has in progress
            let current = response.get(1).copied().unwrap_or(0);
            response = self.control_in(
                RequestType::Class,
                Recipient::Endpoint,
                initiate,
                u16::from(current),
                index,
                2,
            )?;
        }
        if response.first() != Some(&STATUS_SUCCESS) {
            return Ok(());
        }

        let packet = self.device()?.bulk_in.max_packet_size;
        let drain = |device: &UsbDevice| {
            let _ = device.read_bulk(packet, Some(Duration::from_secs(1)));
        };
        if direction == Direction::In {
            drain(self.device()?);
        }
        for _ in 0..PENDING_RETRIES {
            let status =
                self.control_in(RequestType::Class, Recipient::Endpoint, check, 0, index, 8)?;
            if status.first() == Some(&STATUS_PENDING) {
                thread::sleep(PENDING_DELAY);
                if direction == Direction::In && status.get(1).is_some_and(|&fifo| fifo & 1 != 0) {
                    drain(self.device()?);
                }
                continue;
            }
            if direction == Direction::Out {
                let address = self.device()?.bulk_out.address;
                self.device_mut()?.clear_halt(address)?;
            }
            return Ok(());
        }
        Ok(())
    }

    fn tmc_read(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        self.require(|c| !c.is_listen_only, "read")?;
        let size = max_bytes.clamp(1, self.buffer_size);
        let request = self.tmc()?.request_dev_dep_msg_in(size as u32);
        let tag = request[1];
        self.device()?.write_bulk(&request, timeout)?;

        let packet = self.device()?.bulk_in.max_packet_size;
        let wanted = (HEADER_SIZE + size + 3).div_ceil(packet) * packet;
        let mut received = self.device()?.read_bulk(wanted, timeout)?;
        if received.len() < HEADER_SIZE {
            return Err(EquipmentError::Protocol(format!(
                "USBTMC response of {} byte(s) is shorter than its header",
                received.len()
            )));
        }
        if received[0] != DEV_DEP_MSG_IN || received[1] != tag {
            return Err(EquipmentError::Protocol(format!(
                "Unexpected USBTMC response header, MsgID {} (expect {DEV_DEP_MSG_IN}), bTag {} \
                 (expect {tag})",
                received[0], received[1]
            )));
        }
        let transfer_size =
            u32::from_le_bytes([received[4], received[5], received[6], received[7]]) as usize;
        let eom = received[8] & 1 != 0;
        while received.len() < HEADER_SIZE + transfer_size {
            let more = self.device()?.read_bulk(wanted, timeout)?;
            if more.is_empty() {
                break;
            }
            received.extend_from_slice(&more);
        }
        let end = (HEADER_SIZE + transfer_size).min(received.len());
        let data = received[HEADER_SIZE..end].to_vec();
        Ok(if eom { Chunk::end(data) } else { Chunk::data(data) })
    }
}

impl Transport for UsbTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        if self.tmc.is_some() {
            return self.tmc_read(max_bytes, timeout).inspect_err(|e| {
                if !matches!(e, EquipmentError::ConnectionClosed) {
                    self.abort_transfer(Direction::In);
                }
            });
        }
        let size = max_bytes.clamp(1, self.buffer_size);
        loop {
            let data = self.device()?.read_bulk(size, timeout)?;
            // zero-length packets carry nothing
            if !data.is_empty() {
                return Ok(Chunk::data(data));
            }
        }
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        if self.tmc.is_none() {
            return self.device()?.write_bulk(data, timeout);
        }
        self.require(|c| !c.is_talk_only, "write")?;
        let message = self.tmc()?.dev_dep_msg_out(data);
        match self.device()?.write_bulk(&message, timeout) {
            Ok(_) => Ok(data.len()),
            Err(e) => {
                if !matches!(e, EquipmentError::ConnectionClosed) {
                    self.abort_transfer(Direction::Out);
                }
                Err(e)
            }
        }
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        if let Some(device) = self.device.take() {
            device.release();
        }
        Ok(())
    }

    /// Raw: clear the halt condition of both bulk endpoints. USBTMC: clear the device buffers
    /// with `INITIATE_CLEAR` and `CHECK_CLEAR_STATUS`.
    fn clear(&mut self) -> Result<(), EquipmentError> {
        let (bulk_in, bulk_out) = {
            let device = self.device()?;
            (device.bulk_in, device.bulk_out)
        };
        if self.tmc.is_none() {
            self.device_mut()?.clear_halt(bulk_in.address)?;
            return self.device_mut()?.clear_halt(bulk_out.address);
        }
        self.checked_class_request(INITIATE_CLEAR, 0, 1)?;
        for _ in 0..PENDING_RETRIES {
            let status = self.class_request(CHECK_CLEAR_STATUS, 0, 2)?;
            if status.first() == Some(&STATUS_PENDING) {
                thread::sleep(PENDING_DELAY);
                if status.get(1).is_some_and(|&clear| clear & 1 != 0) {
                    let _ = self
                        .device()?
                        .read_bulk(bulk_in.max_packet_size, Some(Duration::from_secs(1)));
                }
                continue;
            }
            break;
        }
        self.device_mut()?.clear_halt(bulk_out.address)
    }

    fn trigger(&mut self) -> Result<(), EquipmentError> {
        self.require(|c| c.accepts_trigger, "trigger")?;
        let message = self.tmc()?.trigger();
        let timeout = self.timeout;
        self.device()?.write_bulk(&message, timeout).map(drop)
    }

    /// `READ_STATUS_BYTE`, the status byte comes from the interrupt-IN endpoint if the device has
    /// one.
    fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        self.require(|c| c.is_488_interface, "serial-poll")?;
        let tag = self.tmc()?.next_tag_status();
        let response = self.checked_class_request(READ_STATUS_BYTE, u16::from(tag), 3)?;
        let received = response.get(1).copied().unwrap_or(0);
        if received != tag {
            return Err(EquipmentError::Protocol(format!(
                "USBTMC status byte request: sent bTag {tag} != received bTag {received}"
            )));
        }
        let device = self.device()?;
        let Some(intr_in) = device.intr_in else {
            return Ok(response.get(2).copied().unwrap_or(0));
        };
        let mut notify = [0u8; 2];
        device
            .handle
            .read_interrupt(intr_in.address, &mut notify, usb_timeout(self.timeout))
            .map_err(|e| usb_error(e, self.timeout))?;
        if notify[0] & 0x80 == 0 || notify[0] & 0x7F != tag {
            return Err(EquipmentError::Protocol(format!(
                "Invalid USBTMC interrupt-IN packet {notify:?} for bTag {tag}"
            )));
        }
        Ok(notify[1])
    }

    fn remote(&mut self) -> Result<(), EquipmentError> {
        self.require(|c| c.accepts_remote_local, "remote-local")?;
        self.checked_class_request(REN_CONTROL, 1, 1).map(drop)
    }

    fn local(&mut self) -> Result<(), EquipmentError> {
        self.require(|c| c.accepts_remote_local, "remote-local")?;
        self.checked_class_request(GO_TO_LOCAL, 0, 1)?;
        self.checked_class_request(REN_CONTROL, 0, 1).map(drop)
    }

    fn marks_end(&self) -> bool {
        self.tmc.is_some()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

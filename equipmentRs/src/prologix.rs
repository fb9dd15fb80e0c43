//! This module provides the transport for GPIB devices that are attached to a Prologix
//! GPIB-ETHERNET or GPIB-USB controller.
//!
//! Several GPIB devices can hang off one controller. All connections to the same controller share
//! one socket (or serial port) through a process-wide map keyed by the hardware address. The
//! controller remembers which GPIB address is selected, so `++addr` is only sent when a different
//! device is talked to. The controller is closed when the last connection that uses it closes.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    Address, AddressFields, Chunk, ConnectOptions, EquipmentError, PrologixOptions,
    SocketTransport, Transport,
};

/// `++read_tmo_ms` accepts 1 to 3000 milliseconds.
const READ_TMO_MS: std::ops::RangeInclusive<u16> = 1..=3000;

/// A Prologix controller that is shared by all of its GPIB devices.
struct Controller {
    key: String,
    transport: Box<dyn Transport>,
    /// The `++addr` command of the device that is currently selected.
    selected: String,
    users: usize,
}

type SharedController = Arc<Mutex<Controller>>;

static CONTROLLERS: OnceLock<RwLock<HashMap<String, SharedController>>> = OnceLock::new();

fn controllers() -> &'static RwLock<HashMap<String, SharedController>> {
    CONTROLLERS.get_or_init(|| RwLock::new(HashMap::new()))
}

impl Controller {
    fn open(
        address: &Address,
        hw_address: &str,
        enet_port: Option<u16>,
        options: &ConnectOptions,
    ) -> Result<Self, EquipmentError> {
        let transport: Box<dyn Transport> = match enet_port {
            Some(port) => {
                let socket = Address::parse(&format!("TCP::{hw_address}::{port}"))?;
                Box::new(
                    SocketTransport::open(&socket, options)
                        .map_err(|e| EquipmentError::connection(address, e))?,
                )
            }
            None => open_serial(address, hw_address, options)?,
        };
        let mut controller = Controller {
            key: controller_key(hw_address, enet_port),
            transport,
            selected: String::new(),
            users: 0,
        };
        controller.configure(&options.prologix, options.timeout)?;
        log::debug!("Created Prologix controller {}", controller.key);
        Ok(controller)
    }

    fn configure(
        &mut self,
        options: &PrologixOptions,
        timeout: Option<Duration>,
    ) -> Result<(), EquipmentError> {
        self.command(&format!("++mode {}", options.mode), timeout)?;
        if let Some(eoi) = options.eoi {
            self.command(&format!("++eoi {}", u8::from(eoi)), timeout)?;
        }
        if let Some(eos) = options.eos {
            if eos > 3 {
                return Err(EquipmentError::InvalidArgument(format!(
                    "Invalid Prologix eos {eos}, must be 0, 1, 2 or 3"
                )));
            }
            self.command(&format!("++eos {eos}"), timeout)?;
        }
        if let Some(enable) = options.eot_enable {
            self.command(&format!("++eot_enable {}", u8::from(enable)), timeout)?;
        }
        if let Some(eot_char) = options.eot_char {
            self.command(&format!("++eot_char {eot_char}"), timeout)?;
        }
        if let Some(read_tmo_ms) = options.read_tmo_ms {
            if !READ_TMO_MS.contains(&read_tmo_ms) {
                return Err(EquipmentError::InvalidArgument(format!(
                    "Invalid Prologix read_tmo_ms {read_tmo_ms}, must be between 1 and 3000"
                )));
            }
            self.command(&format!("++read_tmo_ms {read_tmo_ms}"), timeout)?;
        }
        Ok(())
    }

    /// Send a line to the controller.
    fn command(&mut self, command: &str, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        log::debug!("{} <- {command}", self.key);
        let mut line = command.as_bytes().to_vec();
        line.push(b'\n');
        self.write_all(&line, timeout)
    }

    fn write_all(&mut self, mut data: &[u8], timeout: Option<Duration>) -> Result<(), EquipmentError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        while !data.is_empty() {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(EquipmentError::Timeout {
                    timeout: timeout.unwrap_or_default(),
                    partial: Vec::new(),
                });
            }
            let n = self.transport.write_raw(data, remaining)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Read one line that the controller answers to a `++` command, without the line ending.
    fn read_line(&mut self, timeout: Option<Duration>) -> Result<String, EquipmentError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut line = Vec::new();
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining.is_some_and(|r| r.is_zero()) {
                return Err(EquipmentError::Timeout {
                    timeout: timeout.unwrap_or_default(),
                    partial: line,
                });
            }
            let chunk = self.transport.read_raw(1, remaining)?;
            if chunk.is_eof() {
                return Err(EquipmentError::ConnectionClosed);
            }
            line.extend_from_slice(&chunk.data);
            if line.ends_with(b"\n") {
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end().to_string());
            }
        }
    }

    fn select(&mut self, address_command: &str, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        if self.selected != address_command {
            self.command(address_command, timeout)?;
            self.selected = address_command.to_string();
        }
        Ok(())
    }
}

#[cfg(feature = "serial")]
fn open_serial(
    address: &Address,
    hw_address: &str,
    options: &ConnectOptions,
) -> Result<Box<dyn Transport>, EquipmentError> {
    let port = crate::SerialTransport::open_port(hw_address, &options.serial, options.timeout)
        .map_err(|e| EquipmentError::connection(address, e))?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
fn open_serial(
    address: &Address,
    _hw_address: &str,
    _options: &ConnectOptions,
) -> Result<Box<dyn Transport>, EquipmentError> {
    Err(EquipmentError::connection(
        address,
        "a Prologix GPIB-USB controller needs the `serial` feature",
    ))
}

fn controller_key(hw_address: &str, enet_port: Option<u16>) -> String {
    match enet_port {
        Some(port) => format!("{hw_address}:{port}"),
        None => hw_address.to_string(),
    }
}

/// The `++addr` command that selects a GPIB device. Secondary addresses are sent as 96 to 126.
fn address_command(pad: u8, sad: Option<u8>) -> String {
    match sad {
        Some(sad) if sad < 0x60 => format!("++addr {pad} {}", sad + 0x60),
        Some(sad) => format!("++addr {pad} {sad}"),
        None => format!("++addr {pad}"),
    }
}

/// A GPIB device behind a Prologix controller.
pub struct PrologixTransport {
    key: String,
    address_command: String,
    controller: Option<SharedController>,
    read_requested: bool,
    timeout: Option<Duration>,
}

impl PrologixTransport {
    /// Open (or reuse) the controller of a `Prologix::` address.
    ///
    /// The controller options are sent when the controller is created. A connection that reuses
    /// an open controller does not configure it again.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Prologix {
            hw_address,
            enet_port,
            pad,
            sad,
        } = address.fields()
        else {
            return Err(EquipmentError::connection(address, "not a Prologix address"));
        };
        let key = controller_key(hw_address, *enet_port);

        let existing = controllers().read().get(&key).cloned();
        let controller = match existing {
            Some(controller) => {
                log::debug!("Reusing Prologix controller {key}");
                controller
            }
            None => {
                let mut map = controllers().write();
                match map.get(&key) {
                    Some(controller) => controller.clone(),
                    None => {
                        let controller = Arc::new(Mutex::new(Controller::open(
                            address,
                            hw_address,
                            *enet_port,
                            options,
                        )?));
                        map.insert(key.clone(), controller.clone());
                        controller
                    }
                }
            }
        };
        controller.lock().users += 1;

        let mut transport = PrologixTransport {
            key,
            address_command: address_command(*pad, *sad),
            controller: Some(controller),
            read_requested: false,
            timeout: options.timeout,
        };
        transport.with_selected(|_, _| Ok(()))?;
        Ok(transport)
    }

    /// The number of Prologix controllers that are currently open in this process.
    pub fn open_controllers() -> usize {
        CONTROLLERS.get().map_or(0, |map| map.read().len())
    }

    /// The `++addr` command of this device.
    pub fn address_command(&self) -> &str {
        &self.address_command
    }

    /// Send a `++` command (or any other line) to the controller without selecting this device.
    pub fn controller_command(&mut self, command: &str) -> Result<(), EquipmentError> {
        let timeout = self.timeout;
        self.controller()?.lock().command(command, timeout)
    }

    /// Send a `++` command that the controller answers and return the answer.
    pub fn controller_query(&mut self, command: &str) -> Result<String, EquipmentError> {
        let timeout = self.timeout;
        let controller = self.controller()?;
        let mut controller = controller.lock();
        controller.command(command, timeout)?;
        controller.read_line(timeout)
    }

    /// Send the Group Execute Trigger to the devices at `addresses` (primary addresses, each
    /// optionally followed by its secondary address). No address triggers this device.
    pub fn group_execute_trigger(&mut self, addresses: &[u8]) -> Result<(), EquipmentError> {
        if addresses.len() > 15 {
            return Err(EquipmentError::InvalidArgument(
                "At most 15 addresses can be triggered at once".to_string(),
            ));
        }
        if addresses.is_empty() {
            return self.trigger();
        }
        let list: Vec<String> = addresses.iter().map(u8::to_string).collect();
        self.controller_command(&format!("++trg {}", list.join(" ")))
    }

    fn controller(&self) -> Result<&SharedController, EquipmentError> {
        self.controller.as_ref().ok_or(EquipmentError::ConnectionClosed)
    }

    /// Lock the controller, select this device and run `f`.
    fn with_selected<R>(
        &mut self,
        f: impl FnOnce(&mut Controller, Option<Duration>) -> Result<R, EquipmentError>,
    ) -> Result<R, EquipmentError> {
        let timeout = self.timeout;
        let controller = self.controller()?;
        let mut controller = controller.lock();
        controller.select(&self.address_command, timeout)?;
        f(&mut controller, timeout)
    }
}

impl std::fmt::Debug for PrologixTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrologixTransport")
            .field("controller", &self.key)
            .field("address_command", &self.address_command)
            .finish()
    }
}

impl Transport for PrologixTransport {
    /// The first read after a write asks the controller to address the device to talk with
    /// `++read eoi`.
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        let request = !self.read_requested;
        self.read_requested = true;
        self.with_selected(|controller, command_timeout| {
            if request {
                controller.command("++read eoi", command_timeout)?;
            }
            controller.transport.read_raw(max_bytes, timeout)
        })
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        self.read_requested = false;
        self.with_selected(|controller, _| controller.transport.write_raw(data, timeout))
    }

    /// Release this device. The controller is closed if no other device uses it.
    fn close(&mut self) -> Result<(), EquipmentError> {
        let Some(controller) = self.controller.take() else {
            return Ok(());
        };
        let mut map = controllers().write();
        let mut guard = controller.lock();
        guard.users = guard.users.saturating_sub(1);
        if guard.users > 0 {
            return Ok(());
        }
        map.remove(&self.key);
        log::debug!("Closing Prologix controller {}", guard.key);
        guard.transport.close()
    }

    fn clear(&mut self) -> Result<(), EquipmentError> {
        self.read_requested = false;
        self.with_selected(|controller, timeout| controller.command("++clr", timeout))
    }

    fn trigger(&mut self) -> Result<(), EquipmentError> {
        self.with_selected(|controller, timeout| controller.command("++trg", timeout))
    }

    fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        let reply = self.with_selected(|controller, timeout| {
            controller.command("++spoll", timeout)?;
            controller.read_line(timeout)
        })?;
        reply.parse().map_err(|_| {
            EquipmentError::Protocol(format!("Invalid serial poll reply {reply:?}"))
        })
    }

    fn interface_clear(&mut self) -> Result<(), EquipmentError> {
        self.controller_command("++ifc")
    }

    fn local(&mut self) -> Result<(), EquipmentError> {
        self.with_selected(|controller, timeout| controller.command("++loc", timeout))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for PrologixTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Releasing Prologix controller {} failed: {e}", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_command() {
        assert_eq!(address_command(6, None), "++addr 6");
        assert_eq!(address_command(6, Some(96)), "++addr 6 96");
        assert_eq!(address_command(22, Some(0)), "++addr 22 96");
    }

    #[test]
    fn test_controller_key() {
        assert_eq!(controller_key("192.168.1.70", Some(1234)), "192.168.1.70:1234");
        assert_eq!(controller_key("COM3", None), "COM3");
    }
}

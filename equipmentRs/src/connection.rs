//! The connection facade that ties the address, the registry, the transport and the protocol
//! engine together.

use std::fmt;

use serde::{Deserialize, Serialize};

#[cfg(feature = "sdk")]
use crate::SdkLibrary;
use crate::{
    AbortHandle, Address, ConnectOptions, Encoding, EquipmentError, MessageBased,
    MessageInterface, Registry, Transport,
};

/// An open session with a piece of equipment.
pub enum Session {
    /// A message-based transport wrapped in the protocol engine.
    Message(MessageBased<Box<dyn Transport>>),
    /// A vendor library, which is not message-based.
    #[cfg(feature = "sdk")]
    Sdk(SdkLibrary),
}

impl Session {
    fn close(self) -> Result<(), EquipmentError> {
        match self {
            Session::Message(mut engine) => engine.close(),
            #[cfg(feature = "sdk")]
            Session::Sdk(library) => {
                drop(library);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Session::Message(engine) => f.debug_tuple("Message").field(&engine.name()).finish(),
            #[cfg(feature = "sdk")]
            Session::Sdk(library) => f.debug_tuple("Sdk").field(library).finish(),
        }
    }
}

/// Parse `address`, select the implementation with the global [`Registry`] and connect.
///
/// # Example
///
/// ```no_run
/// use equipmentrs::{ConnectOptions, MessageInterface, connect};
///
/// let options = ConnectOptions::default().with_manufacturer("Keysight");
/// let mut dmm = connect("TCPIP::192.168.1.20::INSTR", options).unwrap();
/// let idn = dmm.query_str("*IDN?").unwrap();
/// dmm.disconnect().unwrap();
/// ```
pub fn connect(address: &str, options: ConnectOptions) -> Result<Connection, EquipmentError> {
    Registry::global().connect(address, options)
}

/// A connection to a piece of equipment.
///
/// The connection is closed when it goes out of scope. [`Connection::disconnect`] closes it
/// earlier, it can be called any number of times and releases the transport exactly once.
/// Afterwards, every I/O operation fails with [`EquipmentError::ConnectionClosed`].
pub struct Connection {
    address: Address,
    options: ConnectOptions,
    name: String,
    session: Option<Session>,
}

impl Connection {
    pub(crate) fn new(address: Address, options: ConnectOptions, mut session: Session) -> Self {
        let name = format!(
            "{}<{}|{}|{} at {}>",
            address.family(),
            options.manufacturer.as_deref().unwrap_or_default(),
            options.model.as_deref().unwrap_or_default(),
            options.serial_number.as_deref().unwrap_or_default(),
            address.raw()
        );
        if let Session::Message(engine) = &mut session {
            engine.set_name(&name);
        }
        log::debug!("Connected to {name}");
        Connection {
            address,
            options,
            name,
            session: Some(session),
        }
    }

    /// The address of the equipment.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The options the connection was opened with.
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// The description `Family<manufacturer|model|serial at address>` used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `false` after [`Connection::disconnect`] was called.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Close the connection. Calling it again does nothing.
    pub fn disconnect(&mut self) -> Result<(), EquipmentError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        log::debug!("Disconnecting from {}", self.name);
        session.close()
    }

    /// The protocol engine, e.g., to change the timeout or the terminations.
    pub fn message_based(
        &mut self,
    ) -> Result<&mut MessageBased<Box<dyn Transport>>, EquipmentError> {
        match self.session.as_mut() {
            Some(Session::Message(engine)) => Ok(engine),
            #[cfg(feature = "sdk")]
            Some(Session::Sdk(_)) => Err(EquipmentError::InterfaceCommandNotSupported),
            None => Err(EquipmentError::ConnectionClosed),
        }
    }

    /// The concrete transport, for family specific operations.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use equipmentrs::{ConnectOptions, Vxi11Transport, connect};
    ///
    /// let mut conn = connect("TCPIP::192.168.1.20::INSTR", ConnectOptions::default()).unwrap();
    /// conn.transport_mut::<Vxi11Transport>().unwrap().lock().unwrap();
    /// ```
    pub fn transport_mut<T: Transport + 'static>(&mut self) -> Result<&mut T, EquipmentError> {
        let name = self.name.clone();
        self.message_based()?
            .transport_mut()
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| {
                EquipmentError::InvalidArgument(format!(
                    "The transport of {name} is not a {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    /// The vendor library of an `SDK` connection.
    #[cfg(feature = "sdk")]
    pub fn sdk(&self) -> Result<&SdkLibrary, EquipmentError> {
        match self.session.as_ref() {
            Some(Session::Sdk(library)) => Ok(library),
            Some(Session::Message(_)) => Err(EquipmentError::InterfaceCommandNotSupported),
            None => Err(EquipmentError::ConnectionClosed),
        }
    }

    /// A handle that aborts a blocked read from another thread, if the transport supports it.
    pub fn abort_handle(&mut self) -> Option<AbortHandle> {
        self.message_based().ok()?.transport().abort_handle()
    }

    /// Clear the device.
    pub fn clear(&mut self) -> Result<(), EquipmentError> {
        let engine = self.message_based()?;
        engine.clear_buffer();
        engine.transport_mut().clear()
    }

    /// Trigger the device.
    pub fn trigger(&mut self) -> Result<(), EquipmentError> {
        self.message_based()?.transport_mut().trigger()
    }

    /// Read the status byte of the device.
    pub fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        self.message_based()?.transport_mut().read_stb()
    }

    /// Put the device into the remote state.
    pub fn remote(&mut self) -> Result<(), EquipmentError> {
        self.message_based()?.transport_mut().remote()
    }

    /// Put the device into the local state.
    pub fn local(&mut self) -> Result<(), EquipmentError> {
        self.message_based()?.transport_mut().local()
    }

    /// Clear the interface (IFC).
    pub fn interface_clear(&mut self) -> Result<(), EquipmentError> {
        self.message_based()?.transport_mut().interface_clear()
    }
}

impl MessageInterface for Connection {
    fn write(&mut self, data: &[u8]) -> Result<usize, EquipmentError> {
        self.message_based()?.write(data)
    }

    fn read(&mut self) -> Result<Vec<u8>, EquipmentError> {
        self.message_based()?.read()
    }

    fn read_exact(&mut self, size: usize) -> Result<Vec<u8>, EquipmentError> {
        self.message_based()?.read_exact(size)
    }

    fn encoding(&self) -> Encoding {
        match &self.session {
            Some(Session::Message(engine)) => engine.encoding(),
            _ => self.options.encoding,
        }
    }

    fn rstrip(&self) -> bool {
        match &self.session {
            Some(Session::Message(engine)) => engine.rstrip(),
            _ => self.options.rstrip,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            log::warn!("Error while disconnecting from {}: {e}", self.name);
        }
    }
}

/// The identity and connection information of one piece of equipment, as stored in an equipment
/// register.
///
/// # Example
///
/// ```
/// use equipmentrs::EquipmentRecord;
///
/// let record = EquipmentRecord {
///     manufacturer: "Keysight".to_string(),
///     model: "34465A".to_string(),
///     serial: "MY123".to_string(),
///     address: "TCPIP::192.168.1.20::INSTR".to_string(),
///     ..Default::default()
/// };
/// assert_eq!(record.options().model.as_deref(), Some("34465A"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentRecord {
    /// Manufacturer of the equipment.
    pub manufacturer: String,
    /// Model of the equipment.
    pub model: String,
    /// Serial number of the equipment.
    pub serial: String,
    /// The address string.
    pub address: String,
    /// Connection properties.
    pub properties: ConnectOptions,
}

impl EquipmentRecord {
    /// The connection properties with the identity of this record filled in.
    pub fn options(&self) -> ConnectOptions {
        let mut options = self.properties.clone();
        let fill = |value: &str, field: &mut Option<String>| {
            if !value.is_empty() {
                *field = Some(value.to_string());
            }
        };
        fill(&self.manufacturer, &mut options.manufacturer);
        fill(&self.model, &mut options.model);
        fill(&self.serial, &mut options.serial_number);
        options
    }

    /// Connect to the equipment with the global [`Registry`].
    pub fn connect(&self) -> Result<Connection, EquipmentError> {
        self.connect_with(Registry::global())
    }

    /// Connect to the equipment with the given registry.
    pub fn connect_with(&self, registry: &Registry) -> Result<Connection, EquipmentError> {
        registry.connect(&self.address, self.options())
    }
}

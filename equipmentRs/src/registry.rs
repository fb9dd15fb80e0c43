//! The interface registry selects the implementation that opens a connection.
//!
//! Registrations are checked in the order in which they were registered. The first registration
//! whose family accepts the address and whose manufacturer and model patterns both match wins. If
//! no registration matches, the default implementation of the address family is used. Registration
//! order is therefore part of the behaviour: register the more specific patterns first.
//!
//! # Example
//!
//! ```
//! use equipmentrs::{Backend, EchoTransport, Family, MessageBased, Registration, Registry, Session};
//!
//! let registry = Registry::empty();
//! let echo = Backend::new("echo", |_, _| {
//!     Ok(Session::Message(MessageBased::new(Box::new(EchoTransport::new()))))
//! });
//! registry
//!     .register(Registration::new(echo).family(Family::Socket).manufacturer("^Acme").unwrap())
//!     .unwrap();
//!
//! let backend = registry.resolve(Family::Socket, Some("ACME Corp"), None).unwrap();
//! assert_eq!(backend.name(), "echo");
//! assert!(registry.resolve(Family::Socket, Some("Other"), None).is_err());
//! ```

use std::{collections::HashMap, fmt, sync::Arc, sync::LazyLock};

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};

use crate::{
    Address, ConnectOptions, Connection, EquipmentError, Family, MessageBased, Session, Transport,
};

type OpenFn = dyn Fn(&Address, &ConnectOptions) -> Result<Session, EquipmentError> + Send + Sync;

/// A named function that opens a session for an address.
#[derive(Clone)]
pub struct Backend {
    name: String,
    open: Arc<OpenFn>,
}

impl Backend {
    /// Create a backend from a name (used in log messages) and an open function.
    pub fn new(
        name: &str,
        open: impl Fn(&Address, &ConnectOptions) -> Result<Session, EquipmentError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Backend {
            name: name.to_string(),
            open: Arc::new(open),
        }
    }

    /// A backend for a message-based transport.
    ///
    /// The transport is wrapped in the [`MessageBased`] engine, `read_termination` and
    /// `write_termination` are the defaults of the interface family.
    pub fn message<T, F>(
        name: &str,
        open: F,
        read_termination: &'static [u8],
        write_termination: &'static [u8],
    ) -> Self
    where
        T: Transport + 'static,
        F: Fn(&Address, &ConnectOptions) -> Result<T, EquipmentError> + Send + Sync + 'static,
    {
        Backend::new(name, move |address, options| {
            let transport: Box<dyn Transport> = Box::new(open(address, options)?);
            let engine =
                MessageBased::with_options(transport, options, read_termination, write_termination)?;
            Ok(Session::Message(engine))
        })
    }

    /// The name of the backend.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a session.
    pub fn open(
        &self,
        address: &Address,
        options: &ConnectOptions,
    ) -> Result<Session, EquipmentError> {
        (self.open)(address, options)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("name", &self.name).finish()
    }
}

/// Binds manufacturer and model patterns (and optionally a family) to a [`Backend`].
///
/// Patterns are regular expressions that are matched case-insensitively anywhere in the
/// manufacturer or model, use `^` and `$` to anchor them.
#[derive(Clone, Debug)]
pub struct Registration {
    backend: Backend,
    family: Option<Family>,
    manufacturer: Option<Regex>,
    model: Option<Regex>,
}

impl Registration {
    /// Create a registration that accepts every family, manufacturer and model.
    ///
    /// At least one pattern must be added before it can be registered.
    pub fn new(backend: Backend) -> Self {
        Registration {
            backend,
            family: None,
            manufacturer: None,
            model: None,
        }
    }

    /// Only accept addresses of this family.
    pub fn family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    /// Only accept equipment whose manufacturer matches `pattern`.
    pub fn manufacturer(mut self, pattern: &str) -> Result<Self, EquipmentError> {
        self.manufacturer = Some(compile(pattern)?);
        Ok(self)
    }

    /// Only accept equipment whose model matches `pattern`.
    pub fn model(mut self, pattern: &str) -> Result<Self, EquipmentError> {
        self.model = Some(compile(pattern)?);
        Ok(self)
    }

    /// The backend that is used if this registration matches.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn matches(&self, family: Family, manufacturer: Option<&str>, model: Option<&str>) -> bool {
        if self.family.is_some_and(|f| f != family) {
            return false;
        }
        let accepts = |pattern: &Option<Regex>, value: Option<&str>| match pattern {
            None => true,
            Some(regex) => value.is_some_and(|v| regex.is_match(v)),
        };
        accepts(&self.manufacturer, manufacturer) && accepts(&self.model, model)
    }
}

fn compile(pattern: &str) -> Result<Regex, EquipmentError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| EquipmentError::InvalidArgument(format!("Invalid pattern {pattern:?}: {e}")))
}

/// An ordered list of registrations plus a default backend per family.
#[derive(Debug, Default)]
pub struct Registry {
    registrations: RwLock<Vec<Registration>>,
    defaults: RwLock<HashMap<Family, Backend>>,
}

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::with_builtin_defaults);

impl Registry {
    /// A registry without any registrations or defaults.
    pub fn empty() -> Self {
        Registry::default()
    }

    /// A registry with the default backends of all families that are compiled in.
    pub fn with_builtin_defaults() -> Self {
        let registry = Registry::empty();
        for (family, backend) in builtin_defaults() {
            registry.set_default(family, backend);
        }
        registry
    }

    /// The process-wide registry that [`crate::connect`] uses.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Append a registration. It is checked after all registrations that came before it.
    pub fn register(&self, registration: Registration) -> Result<(), EquipmentError> {
        if registration.manufacturer.is_none() && registration.model.is_none() {
            return Err(EquipmentError::InvalidArgument(format!(
                "The registration of {:?} needs a manufacturer or a model pattern",
                registration.backend.name
            )));
        }
        log::debug!(
            "Registered {:?} (family={:?}, manufacturer={:?}, model={:?})",
            registration.backend.name,
            registration.family,
            registration.manufacturer.as_ref().map(Regex::as_str),
            registration.model.as_ref().map(Regex::as_str),
        );
        self.registrations.write().push(registration);
        Ok(())
    }

    /// Declare the generic backend of a family, replacing the previous one.
    pub fn set_default(&self, family: Family, backend: Backend) {
        self.defaults.write().insert(family, backend);
    }

    /// Find the backend for the family, manufacturer and model.
    pub fn resolve(
        &self,
        family: Family,
        manufacturer: Option<&str>,
        model: Option<&str>,
    ) -> Result<Backend, EquipmentError> {
        let found = self
            .registrations
            .read()
            .iter()
            .find(|r| r.matches(family, manufacturer, model))
            .map(|r| r.backend.clone());
        if let Some(backend) = found {
            return Ok(backend);
        }
        self.defaults
            .read()
            .get(&family)
            .cloned()
            .ok_or_else(|| EquipmentError::Resolution {
                family,
                manufacturer: manufacturer.map(str::to_string),
                model: model.map(str::to_string),
            })
    }

    /// Parse the address, resolve the backend and open a connection.
    pub fn connect(
        &self,
        address: &str,
        options: ConnectOptions,
    ) -> Result<Connection, EquipmentError> {
        let address = Address::parse(address)?;
        options.validate()?;
        let backend = self.resolve(
            address.family(),
            options.manufacturer.as_deref(),
            options.model.as_deref(),
        )?;
        log::debug!("Connecting to {address} using {:?}", backend.name());
        let session = backend.open(&address, &options)?;
        Ok(Connection::new(address, options, session))
    }
}

fn builtin_defaults() -> Vec<(Family, Backend)> {
    let mut defaults = vec![
        (
            Family::Socket,
            Backend::message("socket", crate::SocketTransport::open, b"\n", b"\r\n"),
        ),
        (
            Family::Vxi11,
            Backend::message("vxi11", crate::Vxi11Transport::open, b"", b""),
        ),
        (
            Family::Hislip,
            Backend::message("hislip", crate::HislipTransport::open, b"", b""),
        ),
        (
            Family::Prologix,
            Backend::message("prologix", crate::PrologixTransport::open, b"\n", b"\n"),
        ),
        (
            Family::Zmq,
            Backend::message("zmq", crate::ZmqTransport::open, b"", b""),
        ),
    ];
    #[cfg(feature = "serial")]
    defaults.push((
        Family::Serial,
        Backend::message("serial", crate::SerialTransport::open, b"\n", b"\r\n"),
    ));
    #[cfg(feature = "gpib")]
    defaults.push((
        Family::Gpib,
        Backend::message("gpib", crate::GpibTransport::open, b"", b""),
    ));
    #[cfg(feature = "usb")]
    {
        defaults.push((Family::Usb, crate::usb::backend()));
        defaults.push((
            Family::Ftdi,
            Backend::message("ftdi", crate::FtdiTransport::open, b"", b""),
        ));
    }
    #[cfg(feature = "sdk")]
    defaults.push((
        Family::Sdk,
        Backend::new("sdk", |address, _| {
            crate::SdkLibrary::open(address).map(Session::Sdk)
        }),
    ));
    defaults
}

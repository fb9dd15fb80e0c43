//! The byte-level [`Transport`] trait that all interface drivers implement.
//!
//! A transport only moves bytes. Framing, termination characters and timeouts that span several
//! calls are handled by the [`crate::MessageBased`] protocol engine on top of it.

use std::{
    any::Any,
    fmt, io,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use crate::{Address, EquipmentError};

/// Bytes returned by a single [`Transport::read_raw`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    /// The received bytes, possibly fewer than requested.
    pub data: Vec<u8>,
    /// The transport signalled the end of a message with these bytes, e.g., the END reason of a
    /// VXI-11 read, a HiSLIP `DataEnd` message, EOI on a GPIB bus or a complete UDP datagram.
    pub end: bool,
}

impl Chunk {
    /// A chunk of bytes that does not end a message.
    pub fn data(data: Vec<u8>) -> Self {
        Chunk { data, end: false }
    }

    /// A chunk of bytes that ends a message.
    pub fn end(data: Vec<u8>) -> Self {
        Chunk { data, end: true }
    }

    /// The peer closed the connection.
    pub fn eof() -> Self {
        Chunk::default()
    }

    /// Returns `true` if this chunk signals that the peer closed the connection.
    pub fn is_eof(&self) -> bool {
        self.data.is_empty() && !self.end
    }
}

/// A handle that closes the underlying OS resource of a transport from another thread.
///
/// A read that is blocked in the transport fails promptly with
/// [`EquipmentError::ConnectionClosed`] once the handle was used. This is the only way to cancel
/// an operation that is in progress.
#[derive(Clone)]
pub struct AbortHandle {
    abort: Arc<dyn Fn() + Send + Sync>,
}

impl AbortHandle {
    /// Create an abort handle from a closure that closes the resource.
    pub fn new(abort: impl Fn() + Send + Sync + 'static) -> Self {
        AbortHandle {
            abort: Arc::new(abort),
        }
    }

    /// Create an abort handle that shuts down a TCP stream.
    pub fn for_tcp(stream: &TcpStream) -> Result<Self, EquipmentError> {
        let stream = stream.try_clone()?;
        Ok(AbortHandle::new(move || {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::debug!("Shutting down the aborted stream failed: {e}");
            }
        }))
    }

    /// Close the resource.
    pub fn abort(&self) {
        (self.abort)()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle").finish_non_exhaustive()
    }
}

/// Byte-level access to a piece of equipment.
///
/// Implementations are opened by their own `open` function and are then driven by the
/// [`crate::MessageBased`] engine. The controller operations (`clear`, `trigger`, ...) are distinct
/// calls that never go through the message protocol. Their default implementation returns
/// [`EquipmentError::InterfaceCommandNotSupported`].
pub trait Transport: Send {
    /// Read at most `max_bytes` bytes, blocking at most `timeout` (`None` blocks forever).
    ///
    /// Returning fewer bytes than requested is not an error. An empty chunk that does not end a
    /// message means that the peer closed the connection. If no byte arrives within the timeout,
    /// an [`EquipmentError::Timeout`] is returned.
    fn read_raw(&mut self, max_bytes: usize, timeout: Option<Duration>)
    -> Result<Chunk, EquipmentError>;

    /// Write (a part of) `data`, blocking at most `timeout`, and return the number of bytes
    /// written.
    fn write_raw(&mut self, data: &[u8], timeout: Option<Duration>)
    -> Result<usize, EquipmentError>;

    /// Close the transport and release its OS resources.
    fn close(&mut self) -> Result<(), EquipmentError> {
        Ok(())
    }

    /// Returns `true` if every message ends with a chunk that is marked as its end (EOI, END or
    /// EOM), `false` for byte streams.
    fn marks_end(&self) -> bool {
        false
    }

    /// Clear the device (selected device clear).
    fn clear(&mut self) -> Result<(), EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// Trigger the device (group execute trigger).
    fn trigger(&mut self) -> Result<(), EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// Read the status byte of the device (serial poll).
    fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// Clear the interface (IFC), only for bus controllers.
    fn interface_clear(&mut self) -> Result<(), EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// Put the device into the remote state.
    fn remote(&mut self) -> Result<(), EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// Put the device into the local state.
    fn local(&mut self) -> Result<(), EquipmentError> {
        Err(EquipmentError::InterfaceCommandNotSupported)
    }

    /// A handle that aborts blocked operations by closing the OS resource, if supported.
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }

    /// The concrete transport, for family specific operations.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        (**self).read_raw(max_bytes, timeout)
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        (**self).write_raw(data, timeout)
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        (**self).close()
    }

    fn marks_end(&self) -> bool {
        (**self).marks_end()
    }

    fn clear(&mut self) -> Result<(), EquipmentError> {
        (**self).clear()
    }

    fn trigger(&mut self) -> Result<(), EquipmentError> {
        (**self).trigger()
    }

    fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        (**self).read_stb()
    }

    fn interface_clear(&mut self) -> Result<(), EquipmentError> {
        (**self).interface_clear()
    }

    fn remote(&mut self) -> Result<(), EquipmentError> {
        (**self).remote()
    }

    fn local(&mut self) -> Result<(), EquipmentError> {
        (**self).local()
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        (**self).abort_handle()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        (**self).as_any_mut()
    }
}

/// `std::net` rejects a zero timeout, so very short remaining times are rounded up.
pub(crate) fn socket_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|t| t.max(Duration::from_millis(1)))
}

/// Convert an I/O error, mapping the timeout kinds to [`EquipmentError::Timeout`].
pub(crate) fn io_error(err: io::Error, timeout: Option<Duration>) -> EquipmentError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => EquipmentError::Timeout {
            timeout: timeout.unwrap_or_default(),
            partial: Vec::new(),
        },
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => EquipmentError::ConnectionClosed,
        _ => EquipmentError::Io(err),
    }
}

/// Open a TCP connection to `host:port`. Failures are reported as connection errors for
/// `address`.
pub(crate) fn connect_tcp(
    address: &Address,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream, EquipmentError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| EquipmentError::connection(address, e))?;

    let mut last_error = None;
    for addr in addrs {
        let result = match socket_timeout(timeout) {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match result {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) => EquipmentError::connection(address, e),
        None => EquipmentError::connection(address, format!("{host} did not resolve")),
    })
}

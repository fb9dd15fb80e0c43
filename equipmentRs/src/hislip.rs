//! This module provides the transport for the HiSLIP (IVI-6.1) LAN instrument protocol.
//!
//! A HiSLIP session uses two TCP connections to the same port: the synchronous channel carries the
//! data messages and the trigger, the asynchronous channel carries the controller operations such
//! as device clear, the status query and locking. Every message starts with a 16-byte header:
//! the prologue `HS`, the message type, a control code, a 32-bit parameter and the 64-bit length
//! of the payload that follows.

use std::{
    any::Any,
    io::{Read, Write},
    net::{Shutdown, TcpStream},
    time::Duration,
};

use crate::{
    AbortHandle, Address, AddressFields, Chunk, ConnectOptions, EquipmentError, Transport,
    transport::{connect_tcp, io_error, socket_timeout},
};

const PROLOGUE: &[u8; 2] = b"HS";
const HEADER_SIZE: usize = 16;

// message types
const INITIALIZE: u8 = 0;
const INITIALIZE_RESPONSE: u8 = 1;
const FATAL_ERROR: u8 = 2;
const ERROR: u8 = 3;
const ASYNC_LOCK: u8 = 4;
const ASYNC_LOCK_RESPONSE: u8 = 5;
const DATA: u8 = 6;
const DATA_END: u8 = 7;
const DEVICE_CLEAR_COMPLETE: u8 = 8;
const DEVICE_CLEAR_ACKNOWLEDGE: u8 = 9;
const ASYNC_REMOTE_LOCAL_CONTROL: u8 = 10;
const ASYNC_REMOTE_LOCAL_RESPONSE: u8 = 11;
const TRIGGER: u8 = 12;
const INTERRUPTED: u8 = 13;
const ASYNC_INTERRUPTED: u8 = 14;
const ASYNC_MAXIMUM_MESSAGE_SIZE: u8 = 15;
const ASYNC_MAXIMUM_MESSAGE_SIZE_RESPONSE: u8 = 16;
const ASYNC_INITIALIZE: u8 = 17;
const ASYNC_INITIALIZE_RESPONSE: u8 = 18;
const ASYNC_DEVICE_CLEAR: u8 = 19;
const ASYNC_SERVICE_REQUEST: u8 = 20;
const ASYNC_STATUS_QUERY: u8 = 21;
const ASYNC_STATUS_RESPONSE: u8 = 22;
const ASYNC_DEVICE_CLEAR_ACKNOWLEDGE: u8 = 23;
const ASYNC_LOCK_INFO: u8 = 24;
const ASYNC_LOCK_INFO_RESPONSE: u8 = 25;

// InitializeResponse control code bits
const OVERLAP_MODE: u8 = 0x01;
const ENCRYPTION_MODE: u8 = 0x02;
const INITIAL_ENCRYPTION: u8 = 0x04;

// AsyncLockResponse control codes
const LOCK_SUCCESS: u8 = 1;
const LOCK_SHARED_RELEASED: u8 = 2;
const LOCK_ERROR: u8 = 3;

/// The client sends its first message with this id, ids then increase by 2.
const INITIAL_MESSAGE_ID: u32 = 0xFFFF_FF00;
/// The server uses this id for data that does not belong to a specific request.
const UNKNOWN_MESSAGE_ID: u32 = 0xFFFF_FFFF;

const PROTOCOL_VERSION: (u8, u8) = (1, 0);
const VENDOR_ID: &[u8; 2] = b"RS";

/// Used when the maximum message size was not negotiated yet.
const DEFAULT_MAXIMUM_MESSAGE_SIZE: u64 = 1 << 20;

/// Used as the lock timeout when a lock request should block forever.
const ONE_DAY_MS: u32 = 86_400_000;

/// Description of the control code of a `FatalError` message.
pub(crate) fn fatal_error_message(code: u8) -> &'static str {
    match code {
        1 => "Poorly formed message header",
        2 => "Attempt to use connection without both channels established",
        3 => "Invalid initialization sequence",
        4 => "Server refused connection due to maximum number of clients exceeded",
        _ => "Unidentified error",
    }
}

/// Description of the control code of an `Error` message.
pub(crate) fn error_message(code: u8) -> &'static str {
    match code {
        1 => "Unrecognized message type",
        2 => "Unrecognized control code",
        3 => "Unrecognized vendor defined message",
        4 => "Message too large",
        5 => "Authentication failed",
        _ => "Unidentified error",
    }
}

/// A message without its prologue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Message {
    kind: u8,
    control: u8,
    parameter: u32,
    payload: Vec<u8>,
}

impl Message {
    fn new(kind: u8, control: u8, parameter: u32) -> Self {
        Message {
            kind,
            control,
            parameter,
            payload: Vec::new(),
        }
    }

    fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        data.extend_from_slice(PROLOGUE);
        data.push(self.kind);
        data.push(self.control);
        data.extend_from_slice(&self.parameter.to_be_bytes());
        data.extend_from_slice(&(self.payload.len() as u64).to_be_bytes());
        data.extend_from_slice(&self.payload);
        data
    }
}

/// Parse a header into `(type, control code, parameter, payload length)`.
fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(u8, u8, u32, u64), EquipmentError> {
    if &header[..2] != PROLOGUE {
        return Err(EquipmentError::Hislip {
            code: 1,
            message: format!("{}, prologue is {:?}", fatal_error_message(1), &header[..2]),
        });
    }
    let mut parameter = [0u8; 4];
    parameter.copy_from_slice(&header[4..8]);
    let mut length = [0u8; 8];
    length.copy_from_slice(&header[8..16]);
    Ok((
        header[2],
        header[3],
        u32::from_be_bytes(parameter),
        u64::from_be_bytes(length),
    ))
}

/// One of the two TCP connections of a session.
#[derive(Debug)]
struct Channel {
    stream: TcpStream,
    maximum_message_size: u64,
    chunk_size: usize,
}

impl Channel {
    fn connect(
        address: &Address,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        chunk_size: usize,
    ) -> Result<Self, EquipmentError> {
        let stream = connect_tcp(address, host, port, timeout)?;
        Ok(Channel {
            stream,
            maximum_message_size: DEFAULT_MAXIMUM_MESSAGE_SIZE,
            chunk_size,
        })
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        self.stream.set_read_timeout(socket_timeout(timeout))?;
        self.stream.set_write_timeout(socket_timeout(timeout))?;
        Ok(())
    }

    fn send(&mut self, message: &Message) -> Result<(), EquipmentError> {
        let size = (HEADER_SIZE + message.payload.len()) as u64;
        if size > self.maximum_message_size {
            return Err(EquipmentError::Hislip {
                code: 4,
                message: format!(
                    "{}, {size} > {} bytes",
                    error_message(4),
                    self.maximum_message_size
                ),
            });
        }
        self.stream.write_all(&message.encode())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive the next message. `Error` and `FatalError` messages are returned as errors.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Message, EquipmentError> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream
            .read_exact(&mut header)
            .map_err(|e| eof_or_io(e, timeout))?;
        let (kind, control, parameter, length) = decode_header(&header)?;

        let length = usize::try_from(length).map_err(|_| {
            EquipmentError::Protocol(format!("HiSLIP payload of {length} bytes is too large"))
        })?;
        let mut payload = Vec::with_capacity(length.min(self.chunk_size));
        while payload.len() < length {
            let start = payload.len();
            let request = (length - start).min(self.chunk_size);
            payload.resize(start + request, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .map_err(|e| eof_or_io(e, timeout))?;
        }

        match kind {
            FATAL_ERROR => Err(EquipmentError::Hislip {
                code: control,
                message: server_reason(fatal_error_message(control), &payload),
            }),
            ERROR => Err(EquipmentError::Hislip {
                code: control,
                message: server_reason(error_message(control), &payload),
            }),
            _ => Ok(Message {
                kind,
                control,
                parameter,
                payload,
            }),
        }
    }

    /// Receive the response of an asynchronous request, skipping service requests and
    /// interrupted notifications.
    fn receive_response(
        &mut self,
        kind: u8,
        timeout: Option<Duration>,
    ) -> Result<Message, EquipmentError> {
        loop {
            let message = self.receive(timeout)?;
            match message.kind {
                k if k == kind => return Ok(message),
                ASYNC_SERVICE_REQUEST | ASYNC_INTERRUPTED => {
                    log::debug!("Skipped asynchronous HiSLIP message of type {}", message.kind);
                }
                other => {
                    return Err(EquipmentError::Hislip {
                        code: 1,
                        message: format!("Expected message type {kind}, received {other}"),
                    });
                }
            }
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Shutting down a HiSLIP channel failed: {e}");
        }
    }
}

fn server_reason(description: &str, payload: &[u8]) -> String {
    if payload.is_empty() {
        description.to_string()
    } else {
        format!("{description}, {}", String::from_utf8_lossy(payload))
    }
}

/// An unexpected EOF in the middle of a message means that the server closed the connection.
fn eof_or_io(err: std::io::Error, timeout: Option<Duration>) -> EquipmentError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        EquipmentError::ConnectionClosed
    } else {
        io_error(err, timeout)
    }
}

/// The lock state of a HiSLIP server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockInfo {
    /// Whether a client holds the exclusive lock.
    pub exclusive: bool,
    /// The number of clients that hold a lock.
    pub num_locks: u32,
}

/// A GPIB-like remote/local request of [`HislipTransport::remote_local_control`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteLocal {
    /// Disable remote.
    Deassert = 0,
    /// Enable remote.
    Assert = 1,
    /// Disable remote and go to local.
    DeassertGtl = 2,
    /// Enable remote and go to remote.
    AssertAddress = 3,
    /// Enable remote and lock out local.
    AssertLlo = 4,
    /// Enable remote, go to remote and set local lockout.
    AssertAddressLlo = 5,
    /// Go to local without changing the remote enable or lockout state.
    AddressGtl = 6,
}

/// A session with a HiSLIP server.
#[derive(Debug)]
pub struct HislipTransport {
    address: Address,
    host: String,
    port: u16,
    sub_address: String,
    sync: Option<Channel>,
    asynchronous: Option<Channel>,
    session_id: u16,
    server_vendor_id: u16,
    overlap: bool,
    message_id: u32,
    previous_message_id: u32,
    rmt_delivered: bool,
    pending: Vec<u8>,
    pending_end: bool,
    discard_data: bool,
    buffer_size: usize,
    max_read_size: usize,
    timeout: Option<Duration>,
    lock_timeout: Duration,
}

impl HislipTransport {
    /// Connect both channels and initialize the session with the server.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Hislip {
            host,
            sub_address,
            port,
        } = address.fields()
        else {
            return Err(EquipmentError::connection(address, "not a HiSLIP address"));
        };
        let mut transport = HislipTransport {
            address: address.clone(),
            host: host.clone(),
            port: *port,
            sub_address: sub_address.clone(),
            sync: None,
            asynchronous: None,
            session_id: 0,
            server_vendor_id: 0,
            overlap: false,
            message_id: INITIAL_MESSAGE_ID,
            previous_message_id: INITIAL_MESSAGE_ID.wrapping_sub(2),
            rmt_delivered: false,
            pending: Vec::new(),
            pending_end: false,
            discard_data: false,
            buffer_size: options.hislip.buffer_size.max(1),
            max_read_size: options.max_read_size,
            timeout: options.timeout,
            lock_timeout: options.hislip.lock_timeout,
        };
        transport.connect()?;
        Ok(transport)
    }

    fn connect(&mut self) -> Result<(), EquipmentError> {
        let mut sync = Channel::connect(
            &self.address,
            &self.host,
            self.port,
            self.timeout,
            self.buffer_size,
        )?;
        sync.set_timeout(self.timeout)?;
        self.reset_message_id();

        let (major, minor) = PROTOCOL_VERSION;
        let parameter = u32::from_be_bytes([major, minor, VENDOR_ID[0], VENDOR_ID[1]]);
        sync.send(
            &Message::new(INITIALIZE, 0, parameter).with_payload(self.sub_address.as_bytes()),
        )?;
        let response = sync
            .receive_response(INITIALIZE_RESPONSE, self.timeout)
            .map_err(|e| EquipmentError::connection(&self.address, e))?;
        if response.control & (ENCRYPTION_MODE | INITIAL_ENCRYPTION) != 0 {
            sync.shutdown();
            return Err(EquipmentError::connection(
                &self.address,
                "the HiSLIP server requires encryption, which is not supported",
            ));
        }
        let [server_major, server_minor, id_hi, id_lo] = response.parameter.to_be_bytes();
        self.session_id = u16::from_be_bytes([id_hi, id_lo]);
        self.overlap = response.control & OVERLAP_MODE != 0;

        let mut asynchronous = Channel::connect(
            &self.address,
            &self.host,
            self.port,
            self.timeout,
            self.buffer_size,
        )?;
        asynchronous.set_timeout(self.timeout)?;
        asynchronous.send(&Message::new(
            ASYNC_INITIALIZE,
            0,
            u32::from(self.session_id),
        ))?;
        let response = asynchronous
            .receive_response(ASYNC_INITIALIZE_RESPONSE, self.timeout)
            .map_err(|e| EquipmentError::connection(&self.address, e))?;
        self.server_vendor_id = response.parameter as u16;
        log::debug!(
            "HiSLIP initialize {}:{} {:?} -> version {server_major}.{server_minor}, session_id={}, overlap={}",
            self.host,
            self.port,
            self.sub_address,
            self.session_id,
            self.overlap
        );

        self.sync = Some(sync);
        self.asynchronous = Some(asynchronous);
        self.exchange_maximum_message_size()
    }

    /// Tell the server the largest message the client accepts and learn the server's limit.
    fn exchange_maximum_message_size(&mut self) -> Result<(), EquipmentError> {
        let size = self.max_read_size as u64;
        let timeout = self.timeout;
        let asynchronous = self.async_channel()?;
        asynchronous.send(
            &Message::new(ASYNC_MAXIMUM_MESSAGE_SIZE, 0, 0).with_payload(&size.to_be_bytes()),
        )?;
        let response =
            asynchronous.receive_response(ASYNC_MAXIMUM_MESSAGE_SIZE_RESPONSE, timeout)?;
        let bytes: [u8; 8] = response.payload.as_slice().try_into().map_err(|_| {
            EquipmentError::Protocol(format!(
                "AsyncMaximumMessageSizeResponse has a payload of {} bytes",
                response.payload.len()
            ))
        })?;
        let server_size = u64::from_be_bytes(bytes).max(HEADER_SIZE as u64 + 1);
        asynchronous.maximum_message_size = server_size;
        if let Some(sync) = self.sync.as_mut() {
            sync.maximum_message_size = server_size;
        }
        log::debug!("HiSLIP maximum message size of the server is {server_size} bytes");
        Ok(())
    }

    /// Close both channels and connect again.
    ///
    /// # Arguments
    /// * `max_attempts` - The maximum number of attempts, 0 keeps trying until it succeeds.
    pub fn reconnect(&mut self, max_attempts: usize) -> Result<(), EquipmentError> {
        self.close()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connect() {
                Ok(()) => return Ok(()),
                Err(e) if max_attempts > 0 && attempt >= max_attempts => return Err(e),
                Err(e) => log::debug!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
    }

    /// The session id that the server assigned.
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// The vendor id of the server.
    pub fn server_vendor_id(&self) -> u16 {
        self.server_vendor_id
    }

    /// The largest message the server accepts, including the header.
    pub fn maximum_server_message_size(&self) -> u64 {
        self.sync
            .as_ref()
            .map_or(DEFAULT_MAXIMUM_MESSAGE_SIZE, |c| c.maximum_message_size)
    }

    /// The id of the most recent message that was sent with `Data`, `DataEnd` or `Trigger`.
    pub fn message_id(&self) -> u32 {
        self.previous_message_id
    }

    /// Set the I/O timeout of the controller operations, `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        crate::options::validate_timeout(timeout)?;
        self.timeout = timeout;
        for channel in [self.sync.as_ref(), self.asynchronous.as_ref()]
            .into_iter()
            .flatten()
        {
            channel.set_timeout(timeout)?;
        }
        Ok(())
    }

    /// Set how long to wait for a lock that is held by another client, zero waits forever.
    pub fn set_lock_timeout(&mut self, lock_timeout: Duration) {
        self.lock_timeout = lock_timeout;
    }

    /// Set the largest message the client accepts and renegotiate it with the server.
    pub fn set_max_read_size(&mut self, max_read_size: usize) -> Result<(), EquipmentError> {
        self.max_read_size = max_read_size;
        self.exchange_maximum_message_size()
    }

    fn reset_message_id(&mut self) {
        self.message_id = INITIAL_MESSAGE_ID;
        self.previous_message_id = INITIAL_MESSAGE_ID.wrapping_sub(2);
        self.pending.clear();
        self.pending_end = false;
        self.discard_data = false;
    }

    /// Must be called after a `Data`, `DataEnd` or `Trigger` message was sent.
    fn increment_message_id(&mut self) {
        self.rmt_delivered = false;
        self.previous_message_id = self.message_id;
        self.message_id = self.message_id.wrapping_add(2);
    }

    fn sync_channel(&mut self) -> Result<&mut Channel, EquipmentError> {
        self.sync.as_mut().ok_or(EquipmentError::ConnectionClosed)
    }

    fn async_channel(&mut self) -> Result<&mut Channel, EquipmentError> {
        self.asynchronous
            .as_mut()
            .ok_or(EquipmentError::ConnectionClosed)
    }

    /// Send a request on the asynchronous channel and wait for the response of type `kind`.
    fn async_request(&mut self, request: Message, kind: u8) -> Result<Message, EquipmentError> {
        let timeout = self.timeout;
        let asynchronous = self.async_channel()?;
        asynchronous.send(&request)?;
        asynchronous.receive_response(kind, timeout)
    }

    /// The client detected a protocol violation. Tell the server on both channels and close.
    fn fatal_error(&mut self, err: EquipmentError) -> EquipmentError {
        let reason = err.to_string();
        let message = Message::new(FATAL_ERROR, 0, 0).with_payload(reason.as_bytes());
        for channel in [self.sync.as_mut(), self.asynchronous.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = channel.send(&message) {
                log::warn!("Sending FatalError to {}:{} failed: {e}", self.host, self.port);
            }
        }
        if let Err(e) = self.close() {
            log::warn!("Closing the HiSLIP session failed: {e}");
        }
        err
    }

    /// Acquire the lock of the device.
    ///
    /// An empty `lock_string` requests the exclusive lock, otherwise it identifies a shared lock.
    /// Returns whether the lock was granted.
    pub fn lock(&mut self, lock_string: &str) -> Result<bool, EquipmentError> {
        if lock_string.len() > 256 || !lock_string.is_ascii() {
            return Err(EquipmentError::InvalidArgument(
                "The lock string must be ASCII and not longer than 256 characters".to_string(),
            ));
        }
        let lock_ms = if self.lock_timeout.is_zero() {
            ONE_DAY_MS
        } else {
            u32::try_from(self.lock_timeout.as_millis()).unwrap_or(ONE_DAY_MS)
        };
        // the socket must wait longer than the server waits for the lock
        let socket_wait = self
            .timeout
            .map(|_| Duration::from_millis(u64::from(lock_ms)) + Duration::from_secs(10));
        self.async_channel()?.set_timeout(socket_wait)?;
        let response = self.async_request(
            Message::new(ASYNC_LOCK, 1, lock_ms).with_payload(lock_string.as_bytes()),
            ASYNC_LOCK_RESPONSE,
        );
        let timeout = self.timeout;
        self.async_channel()?.set_timeout(timeout)?;
        lock_status(response?.control)
    }

    /// Release the lock acquired by [`HislipTransport::lock`]. Returns whether a lock was
    /// released.
    pub fn unlock(&mut self) -> Result<bool, EquipmentError> {
        let message_id = self.previous_message_id;
        let response =
            self.async_request(Message::new(ASYNC_LOCK, 0, message_id), ASYNC_LOCK_RESPONSE)?;
        lock_status(response.control)
    }

    /// Ask the server which locks are held.
    pub fn lock_info(&mut self) -> Result<LockInfo, EquipmentError> {
        let response = self.async_request(
            Message::new(ASYNC_LOCK_INFO, 0, 0),
            ASYNC_LOCK_INFO_RESPONSE,
        )?;
        Ok(LockInfo {
            exclusive: response.control == 1,
            num_locks: response.parameter,
        })
    }

    /// Send a GPIB-like remote/local request.
    pub fn remote_local_control(&mut self, request: RemoteLocal) -> Result<(), EquipmentError> {
        let message_id = self.previous_message_id;
        self.async_request(
            Message::new(ASYNC_REMOTE_LOCAL_CONTROL, request as u8, message_id),
            ASYNC_REMOTE_LOCAL_RESPONSE,
        )?;
        Ok(())
    }
}

fn lock_status(control: u8) -> Result<bool, EquipmentError> {
    match control {
        LOCK_SUCCESS | LOCK_SHARED_RELEASED => Ok(true),
        LOCK_ERROR => Err(EquipmentError::Protocol(
            "Invalid attempt to release a lock that was not acquired or to request a lock that \
             was already granted"
                .to_string(),
        )),
        _ => Ok(false),
    }
}

impl Transport for HislipTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        let max_bytes = max_bytes.max(1);
        loop {
            if !self.pending.is_empty() || self.pending_end {
                let n = max_bytes.min(self.pending.len());
                let data: Vec<u8> = self.pending.drain(..n).collect();
                if self.pending.is_empty() && self.pending_end {
                    self.pending_end = false;
                    return Ok(Chunk::end(data));
                }
                return Ok(Chunk::data(data));
            }

            let expected = self.previous_message_id;
            let sync = self.sync_channel()?;
            sync.stream.set_read_timeout(socket_timeout(timeout))?;
            let message = match sync.receive(timeout) {
                Ok(message) => message,
                Err(e @ EquipmentError::Hislip { .. }) => return Err(self.fatal_error(e)),
                Err(e) => return Err(e),
            };
            match message.kind {
                DATA | DATA_END if self.discard_data => {}
                DATA if message.parameter != UNKNOWN_MESSAGE_ID
                    && message.parameter != expected =>
                {
                    log::debug!("Discarded stale HiSLIP Data with id {:#x}", message.parameter);
                }
                DATA_END if message.parameter != expected => {
                    log::debug!("Discarded stale HiSLIP DataEnd with id {:#x}", message.parameter);
                }
                DATA => self.pending = message.payload,
                DATA_END => {
                    self.rmt_delivered = true;
                    self.pending = message.payload;
                    self.pending_end = true;
                }
                INTERRUPTED => {
                    log::debug!("HiSLIP server interrupted message {:#x}", message.parameter);
                    self.discard_data = false;
                }
                ASYNC_INTERRUPTED => self.discard_data = true,
                other => log::debug!("Ignored HiSLIP message of type {other} on the sync channel"),
            }
        }
    }

    /// Send `data` as one message, split into `Data` messages and a final `DataEnd` message at
    /// the maximum message size of the server.
    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        let max_payload = self
            .maximum_server_message_size()
            .saturating_sub(HEADER_SIZE as u64)
            .max(1);
        let max_payload = usize::try_from(max_payload).unwrap_or(usize::MAX);
        self.sync_channel()?
            .stream
            .set_write_timeout(socket_timeout(timeout))?;

        let blocks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(max_payload).collect()
        };
        let last = blocks.len() - 1;
        for (index, block) in blocks.into_iter().enumerate() {
            let kind = if index < last { DATA } else { DATA_END };
            let message = Message::new(kind, u8::from(self.rmt_delivered), self.message_id)
                .with_payload(block);
            match self.sync_channel()?.send(&message) {
                Ok(()) => {}
                Err(e @ EquipmentError::Hislip { .. }) => return Err(self.fatal_error(e)),
                Err(EquipmentError::Io(e)) => return Err(io_error(e, timeout)),
                Err(e) => return Err(e),
            }
            self.increment_message_id();
        }
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        if let Some(channel) = self.asynchronous.take() {
            channel.shutdown();
        }
        if let Some(channel) = self.sync.take() {
            channel.shutdown();
            log::debug!("Closed HiSLIP session {} to {}:{}", self.session_id, self.host, self.port);
        }
        Ok(())
    }

    /// Device clear: `AsyncDeviceClear` on the asynchronous channel, then `DeviceClearComplete`
    /// on the synchronous channel. The message id starts over.
    fn clear(&mut self) -> Result<(), EquipmentError> {
        let acknowledge = self.async_request(
            Message::new(ASYNC_DEVICE_CLEAR, 0, 0),
            ASYNC_DEVICE_CLEAR_ACKNOWLEDGE,
        )?;
        let timeout = self.timeout;
        let sync = self.sync_channel()?;
        sync.send(&Message::new(DEVICE_CLEAR_COMPLETE, acknowledge.control, 0))?;
        loop {
            let message = sync.receive(timeout)?;
            if message.kind == DEVICE_CLEAR_ACKNOWLEDGE {
                self.overlap = message.control & OVERLAP_MODE != 0;
                break;
            }
            log::debug!("Discarded HiSLIP message of type {} during device clear", message.kind);
        }
        self.reset_message_id();
        Ok(())
    }

    fn trigger(&mut self) -> Result<(), EquipmentError> {
        let message = Message::new(TRIGGER, u8::from(self.rmt_delivered), self.message_id);
        self.sync_channel()?.send(&message)?;
        self.increment_message_id();
        Ok(())
    }

    fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        let message = Message::new(
            ASYNC_STATUS_QUERY,
            u8::from(self.rmt_delivered),
            self.previous_message_id,
        );
        let response = self.async_request(message, ASYNC_STATUS_RESPONSE)?;
        Ok(response.control)
    }

    fn remote(&mut self) -> Result<(), EquipmentError> {
        self.remote_local_control(RemoteLocal::AssertAddress)
    }

    fn local(&mut self) -> Result<(), EquipmentError> {
        self.remote_local_control(RemoteLocal::AddressGtl)
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        self.sync
            .as_ref()
            .and_then(|channel| AbortHandle::for_tcp(&channel.stream).ok())
    }

    fn marks_end(&self) -> bool {
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

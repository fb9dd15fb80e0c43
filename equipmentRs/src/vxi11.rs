//! This module provides the transport for the VXI-11 LAN instrument protocol.
//!
//! VXI-11 calls remote procedures of the `Device Core` program on the equipment. The calls are
//! ONC RPC (RFC 1057) messages, encoded with XDR (RFC 1014) and sent with record marking over a
//! TCP connection. The port of the `Device Core` program is asked from the portmapper on port 111,
//! unless it is configured. A link to the LAN device is created when the transport opens and is
//! destroyed when it closes.
//!
//! [`find_vxi11`] broadcasts the same portmapper request over UDP to find the devices on a
//! network.

use std::{
    any::Any,
    io::{self, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use crate::{
    AbortHandle, Address, AddressFields, Chunk, ConnectOptions, EquipmentError, Transport,
    transport::{connect_tcp, io_error, socket_timeout},
};

// RPC
const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const LAST_FRAGMENT: u32 = 0x8000_0000;

// portmapper
const PMAP_PORT: u16 = 111;
const PMAP_PROG: u32 = 100_000;
const PMAP_VERS: u32 = 2;
const PMAPPROC_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

// VXI-11 programs
const DEVICE_CORE: u32 = 0x0607AF;
const DEVICE_ASYNC: u32 = 0x0607B0;
const DEVICE_VERSION: u32 = 1;

// VXI-11 procedures
const DEVICE_ABORT: u32 = 1;
const CREATE_LINK: u32 = 10;
const DEVICE_WRITE: u32 = 11;
const DEVICE_READ: u32 = 12;
const DEVICE_READSTB: u32 = 13;
const DEVICE_TRIGGER: u32 = 14;
const DEVICE_CLEAR: u32 = 15;
const DEVICE_REMOTE: u32 = 16;
const DEVICE_LOCAL: u32 = 17;
const DEVICE_LOCK: u32 = 18;
const DEVICE_UNLOCK: u32 = 19;
const DEVICE_ENABLE_SRQ: u32 = 20;
const DEVICE_DOCMD: u32 = 22;
const DESTROY_LINK: u32 = 23;

// operation flags
const FLAG_WAITLOCK: u32 = 0x01;
const FLAG_END: u32 = 0x08;
const FLAG_TERMCHRSET: u32 = 0x80;

// reasons why a read completed
const RX_CHR: u32 = 0x02;
const RX_END: u32 = 0x04;

const ERROR_IO_TIMEOUT: u32 = 15;

/// Used as the I/O timeout when a call should block forever.
const ONE_DAY_MS: u32 = 86_400_000;

/// Upper limit of the data size per `device_write`.
const MAX_WRITE_SIZE: usize = 65_536;

/// Description of a VXI-11 error code.
pub(crate) fn error_message(code: u32) -> &'static str {
    match code {
        0 => "No error",
        1 => "Syntax error",
        3 => "Device not accessible",
        4 => "Invalid link identifier",
        5 => "Parameter error",
        6 => "Channel not established",
        8 => "Operation not supported",
        9 => "Out of resources",
        11 => "Device locked by another link",
        12 => "No lock held by this link",
        15 => "I/O timeout",
        17 => "I/O error",
        21 => "Invalid address",
        23 => "Abort",
        29 => "Channel already established",
        _ => "Undefined error",
    }
}

/// Appends XDR encoded values to a message body.
#[derive(Debug, Default)]
struct XdrWriter {
    data: Vec<u8>,
}

impl XdrWriter {
    fn u32(mut self, value: u32) -> Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn i32(mut self, value: i32) -> Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Variable-length opaque data, padded to a multiple of four bytes.
    fn opaque(mut self, value: &[u8]) -> Self {
        // opaque data is limited to u32::MAX bytes by the protocol
        self.data
            .extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.data.extend_from_slice(value);
        self.data.resize(self.data.len().next_multiple_of(4), 0);
        self
    }
}

/// Reads XDR encoded values from a reply.
struct XdrReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        XdrReader { data, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32, EquipmentError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| EquipmentError::Protocol("RPC reply is too short".to_string()))?;
        self.pos += 4;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn opaque(&mut self) -> Result<&'a [u8], EquipmentError> {
        let len = self.u32()? as usize;
        let value = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| EquipmentError::Protocol("RPC opaque data is too short".to_string()))?;
        self.pos += len.next_multiple_of(4);
        Ok(value)
    }

    fn rest(&self) -> &'a [u8] {
        self.data.get(self.pos..).unwrap_or_default()
    }
}

/// The header of a call without authentication, followed by `args`.
fn call_message(xid: u32, prog: u32, vers: u32, proc: u32, args: &[u8]) -> Vec<u8> {
    let mut message = XdrWriter::default()
        .u32(xid)
        .u32(MSG_CALL)
        .u32(RPC_VERSION)
        .u32(prog)
        .u32(vers)
        .u32(proc)
        // credentials and verifier, VXI-11 does not use authentication
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .data;
    message.extend_from_slice(args);
    message
}

/// Check the reply header, returns `None` if the reply belongs to another transaction.
fn check_reply(xid: u32, reply: &[u8]) -> Result<Option<&[u8]>, EquipmentError> {
    let mut reader = XdrReader::new(reply);
    if reader.u32()? != xid {
        return Ok(None);
    }
    let message_type = reader.u32()?;
    if message_type != MSG_REPLY {
        return Err(EquipmentError::Protocol(format!(
            "RPC message type is not REPLY, got {message_type}"
        )));
    }
    match reader.u32()? {
        // MSG_ACCEPTED
        0 => {
            let _flavor = reader.u32()?;
            let _verifier = reader.opaque()?;
            match reader.u32()? {
                0 => Ok(Some(reader.rest())),
                2 => {
                    let (low, high) = (reader.u32()?, reader.u32()?);
                    Err(EquipmentError::Protocol(format!(
                        "RPC call failed: PROG_MISMATCH (low={low}, high={high})"
                    )))
                }
                status => Err(EquipmentError::Protocol(format!(
                    "RPC call failed: {}",
                    match status {
                        1 => "PROG_UNAVAIL",
                        3 => "PROC_UNAVAIL",
                        4 => "GARBAGE_ARGS",
                        _ => "unknown accept status",
                    }
                ))),
            }
        }
        // MSG_DENIED
        1 => match reader.u32()? {
            0 => {
                let (low, high) = (reader.u32()?, reader.u32()?);
                Err(EquipmentError::Protocol(format!(
                    "RPC call failed: RPC_MISMATCH (low={low}, high={high})"
                )))
            }
            1 => Err(EquipmentError::Protocol(format!(
                "RPC authentication failed (status={})",
                reader.u32()?
            ))),
            _ => Err(EquipmentError::Protocol(
                "RPC MSG_DENIED reply status is not RPC_MISMATCH nor AUTH_ERROR".to_string(),
            )),
        },
        _ => Err(EquipmentError::Protocol(
            "RPC reply is not MSG_ACCEPTED nor MSG_DENIED".to_string(),
        )),
    }
}

/// An ONC RPC client over a TCP connection.
#[derive(Debug)]
struct RpcClient {
    stream: TcpStream,
    xid: u32,
}

impl RpcClient {
    fn connect(
        address: &Address,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self, EquipmentError> {
        let stream = connect_tcp(address, host, port, timeout)?;
        Ok(RpcClient {
            stream,
            // the transaction id only needs to differ between calls
            xid: std::process::id(),
        })
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        self.stream.set_read_timeout(socket_timeout(timeout))?;
        self.stream.set_write_timeout(socket_timeout(timeout))?;
        Ok(())
    }

    /// Call a procedure and return the procedure specific data of the reply.
    fn call(&mut self, prog: u32, vers: u32, proc: u32, args: &[u8]) -> Result<Vec<u8>, EquipmentError> {
        self.xid = self.xid.wrapping_add(1);
        let mut message = call_message(self.xid, prog, vers, proc, args);

        let header = LAST_FRAGMENT | message.len() as u32;
        let mut record = header.to_be_bytes().to_vec();
        record.append(&mut message);
        self.stream.write_all(&record).map_err(|e| io_error(e, None))?;

        loop {
            let reply = self.read_record()?;
            if let Some(body) = check_reply(self.xid, &reply)? {
                return Ok(body.to_vec());
            }
            log::debug!("Ignoring an RPC reply of another transaction");
        }
    }

    /// Read all fragments of one record.
    fn read_record(&mut self) -> Result<Vec<u8>, EquipmentError> {
        let mut message = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .map_err(|e| io_error(e, None))?;
            let header = u32::from_be_bytes(header);
            let start = message.len();
            message.resize(start + (header & !LAST_FRAGMENT) as usize, 0);
            self.stream
                .read_exact(&mut message[start..])
                .map_err(|e| io_error(e, None))?;
            if header & LAST_FRAGMENT != 0 {
                return Ok(message);
            }
        }
    }

    /// Call a VXI-11 procedure and check its error code.
    fn device_call(&mut self, prog: u32, proc: u32, args: &[u8]) -> Result<Vec<u8>, EquipmentError> {
        let mut reply = self.call(prog, DEVICE_VERSION, proc, args)?;
        let code = XdrReader::new(&reply).u32()?;
        match code {
            0 => Ok(reply.split_off(4)),
            ERROR_IO_TIMEOUT => Err(EquipmentError::Timeout {
                timeout: Duration::ZERO,
                partial: Vec::new(),
            }),
            code => Err(EquipmentError::Vxi11 {
                code,
                message: error_message(code),
            }),
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Shutting down the RPC connection failed: {e}");
        }
    }
}

/// Ask the portmapper of `host` for the port of the `Device Core` program.
fn core_port(address: &Address, host: &str, timeout: Option<Duration>) -> Result<u16, EquipmentError> {
    let mut client = RpcClient::connect(address, host, PMAP_PORT, timeout)?;
    client.set_timeout(timeout)?;
    let args = XdrWriter::default()
        .u32(DEVICE_CORE)
        .u32(DEVICE_VERSION)
        .u32(IPPROTO_TCP)
        .u32(0)
        .data;
    let reply = client.call(PMAP_PROG, PMAP_VERS, PMAPPROC_GETPORT, &args);
    client.shutdown();
    let port = XdrReader::new(&reply?).u32()?;
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(EquipmentError::connection(
            address,
            format!("the portmapper returned an invalid port {port} for the VXI-11 core program"),
        )),
    }
}

fn millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        Some(timeout) => u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
        None => ONE_DAY_MS,
    }
}

/// A link to a VXI-11 LAN device.
#[derive(Debug)]
pub struct Vxi11Transport {
    address: Address,
    host: String,
    device_name: String,
    core_port: u16,
    core: Option<RpcClient>,
    abort_client: Option<RpcClient>,
    link_id: Option<i32>,
    abort_port: u16,
    max_recv_size: usize,
    buffer_size: usize,
    timeout: Option<Duration>,
    lock_timeout: Duration,
    term_char: Option<u8>,
}

impl Vxi11Transport {
    /// Connect to the `Device Core` program and create a link to the LAN device.
    ///
    /// If the read termination of the options is a single byte, the device is asked to stop
    /// reading at it.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Vxi11 { host, device_name } = address.fields() else {
            return Err(EquipmentError::connection(address, "not a VXI-11 address"));
        };
        let term = options.read_termination_or(b"");
        let mut transport = Vxi11Transport {
            address: address.clone(),
            host: host.clone(),
            device_name: device_name.clone(),
            core_port: options.vxi11.port.unwrap_or(0),
            core: None,
            abort_client: None,
            link_id: None,
            abort_port: 0,
            max_recv_size: MAX_WRITE_SIZE,
            buffer_size: options.vxi11.buffer_size.max(1),
            timeout: options.timeout,
            lock_timeout: options.vxi11.lock_timeout,
            term_char: match term.as_slice() {
                [c] => Some(*c),
                _ => None,
            },
        };
        transport.connect()?;
        Ok(transport)
    }

    fn connect(&mut self) -> Result<(), EquipmentError> {
        if self.core_port == 0 {
            self.core_port = core_port(&self.address, &self.host, self.timeout)?;
        }
        let mut core = RpcClient::connect(&self.address, &self.host, self.core_port, self.timeout)?;
        core.set_timeout(self.socket_timeout())?;

        // client id, lock device, lock timeout, device name
        let args = XdrWriter::default()
            .i32((std::process::id() & 0x7FFF_FFFF) as i32)
            .u32(0)
            .u32(self.lock_timeout_ms())
            .opaque(self.device_name.as_bytes())
            .data;
        let reply = core
            .device_call(DEVICE_CORE, CREATE_LINK, &args)
            .map_err(|e| EquipmentError::connection(&self.address, e))?;
        let mut reader = XdrReader::new(&reply);
        let link_id = reader.u32()? as i32;
        let abort_port = reader.u32()?;
        let max_recv_size = reader.u32()? as usize;
        log::debug!(
            "create_link({:?}) -> link_id={link_id}, abort_port={abort_port}, max_recv_size={max_recv_size}",
            self.device_name
        );

        self.link_id = Some(link_id);
        self.abort_port = u16::try_from(abort_port).unwrap_or(0);
        self.max_recv_size = max_recv_size.clamp(1, MAX_WRITE_SIZE);
        self.core = Some(core);
        Ok(())
    }

    /// Close the link and connect again.
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

    /// The link id that the device assigned, `None` if the link is closed.
    pub fn link_id(&self) -> Option<i32> {
        self.link_id
    }

    /// The maximum number of bytes the device accepts per `device_write`.
    pub fn max_recv_size(&self) -> usize {
        self.max_recv_size
    }

    /// Set the I/O timeout of the controller operations, `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        crate::options::validate_timeout(timeout)?;
        self.timeout = timeout;
        if let Some(core) = &self.core {
            core.set_timeout(self.socket_timeout())?;
        }
        Ok(())
    }

    /// Set how long to wait for a lock that is held by another link.
    pub fn set_lock_timeout(&mut self, lock_timeout: Duration) -> Result<(), EquipmentError> {
        self.lock_timeout = lock_timeout;
        if let Some(core) = &self.core {
            core.set_timeout(self.socket_timeout())?;
        }
        Ok(())
    }

    /// Set the termination character the device stops reading at, `None` reads until END.
    pub fn set_term_char(&mut self, term_char: Option<u8>) {
        self.term_char = term_char;
    }

    fn lock_timeout_ms(&self) -> u32 {
        millis(Some(self.lock_timeout))
    }

    fn flags(&self) -> u32 {
        if self.lock_timeout.is_zero() {
            0
        } else {
            FLAG_WAITLOCK
        }
    }

    /// The socket must wait longer than the device waits for I/O and for the lock.
    fn socket_timeout(&self) -> Option<Duration> {
        self.timeout
            .map(|t| t + self.lock_timeout + Duration::from_secs(1))
    }

    fn link(&mut self) -> Result<(&mut RpcClient, i32), EquipmentError> {
        match (self.core.as_mut(), self.link_id) {
            (Some(core), Some(link_id)) => Ok((core, link_id)),
            _ => Err(EquipmentError::ConnectionClosed),
        }
    }

    /// Call a procedure with the `link id, flags, lock timeout, I/O timeout` arguments.
    fn generic_call(&mut self, proc: u32) -> Result<Vec<u8>, EquipmentError> {
        let flags = self.flags();
        let lock_timeout = self.lock_timeout_ms();
        let io_timeout = millis(self.timeout);
        let timeout = self.timeout;
        let (core, link_id) = self.link()?;
        let args = XdrWriter::default()
            .i32(link_id)
            .u32(flags)
            .u32(lock_timeout)
            .u32(io_timeout)
            .data;
        core.device_call(DEVICE_CORE, proc, &args)
            .map_err(|e| with_timeout(e, timeout))
    }

    /// Acquire the lock of the device.
    pub fn lock(&mut self) -> Result<(), EquipmentError> {
        let flags = self.flags();
        let lock_timeout = self.lock_timeout_ms();
        let (core, link_id) = self.link()?;
        let args = XdrWriter::default()
            .i32(link_id)
            .u32(flags)
            .u32(lock_timeout)
            .data;
        core.device_call(DEVICE_CORE, DEVICE_LOCK, &args)?;
        Ok(())
    }

    /// Release the lock acquired by [`Vxi11Transport::lock`].
    pub fn unlock(&mut self) -> Result<(), EquipmentError> {
        let (core, link_id) = self.link()?;
        let args = XdrWriter::default().i32(link_id).data;
        core.device_call(DEVICE_CORE, DEVICE_UNLOCK, &args)?;
        Ok(())
    }

    /// Enable or disable service requests of the device. `handle` is host specific data of at
    /// most 40 bytes that the device sends back with the interrupt.
    pub fn enable_srq(&mut self, enable: bool, handle: &[u8]) -> Result<(), EquipmentError> {
        if handle.len() > 40 {
            return Err(EquipmentError::InvalidArgument(
                "The SRQ handle must not be longer than 40 bytes".to_string(),
            ));
        }
        let (core, link_id) = self.link()?;
        let args = XdrWriter::default()
            .i32(link_id)
            .u32(u32::from(enable))
            .opaque(handle)
            .data;
        core.device_call(DEVICE_CORE, DEVICE_ENABLE_SRQ, &args)?;
        Ok(())
    }

    /// Execute a command of the device, e.g., `0x08` sends the Group Execute Trigger.
    ///
    /// # Arguments
    /// * `cmd` - The command.
    /// * `data_size` - Size of the individual data elements in bytes.
    /// * `data` - The input parameters in network byte order.
    pub fn docmd(&mut self, cmd: u32, data_size: u32, data: &[u8]) -> Result<Vec<u8>, EquipmentError> {
        let flags = self.flags();
        let lock_timeout = self.lock_timeout_ms();
        let io_timeout = millis(self.timeout);
        let (core, link_id) = self.link()?;
        let args = XdrWriter::default()
            .i32(link_id)
            .u32(flags)
            .u32(io_timeout)
            .u32(lock_timeout)
            .u32(cmd)
            .u32(1)
            .u32(data_size)
            .opaque(data)
            .data;
        let reply = core.device_call(DEVICE_CORE, DEVICE_DOCMD, &args)?;
        Ok(XdrReader::new(&reply).opaque()?.to_vec())
    }

    /// Stop an in-progress call through the `Device Async` program.
    pub fn abort(&mut self) -> Result<(), EquipmentError> {
        let link_id = self.link_id.ok_or(EquipmentError::ConnectionClosed)?;
        if self.abort_client.is_none() {
            let client =
                RpcClient::connect(&self.address, &self.host, self.abort_port, self.timeout)?;
            client.set_timeout(self.socket_timeout())?;
            self.abort_client = Some(client);
        }
        if let Some(client) = self.abort_client.as_mut() {
            let args = XdrWriter::default().i32(link_id).data;
            client.device_call(DEVICE_ASYNC, DEVICE_ABORT, &args)?;
        }
        Ok(())
    }
}

/// The I/O timeout error of the device does not know the configured timeout.
fn with_timeout(err: EquipmentError, timeout: Option<Duration>) -> EquipmentError {
    match err {
        EquipmentError::Timeout { partial, .. } => EquipmentError::Timeout {
            timeout: timeout.unwrap_or_default(),
            partial,
        },
        err => err,
    }
}

impl Transport for Vxi11Transport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        let mut flags = self.flags();
        if self.term_char.is_some() {
            flags |= FLAG_TERMCHRSET;
        }
        let request_size = max_bytes.min(self.buffer_size).max(1) as u32;
        let lock_timeout = self.lock_timeout_ms();
        let term_char = u32::from(self.term_char.unwrap_or(0));
        let (core, link_id) = self.link()?;
        loop {
            let args = XdrWriter::default()
                .i32(link_id)
                .u32(request_size)
                .u32(millis(timeout))
                .u32(lock_timeout)
                .u32(flags)
                .u32(term_char)
                .data;
            let reply = core
                .device_call(DEVICE_CORE, DEVICE_READ, &args)
                .map_err(|e| with_timeout(e, timeout))?;
            let mut reader = XdrReader::new(&reply);
            let reason = reader.u32()?;
            let data = reader.opaque()?.to_vec();
            if reason & RX_END != 0 {
                return Ok(Chunk::end(data));
            }
            if !data.is_empty() || reason & RX_CHR != 0 {
                return Ok(Chunk::data(data));
            }
        }
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        let block = &data[..data.len().min(self.max_recv_size)];
        let mut flags = self.flags();
        if block.len() == data.len() {
            flags |= FLAG_END;
        }
        let lock_timeout = self.lock_timeout_ms();
        let (core, link_id) = self.link()?;
        let args = XdrWriter::default()
            .i32(link_id)
            .u32(millis(timeout))
            .u32(lock_timeout)
            .u32(flags)
            .opaque(block)
            .data;
        let reply = core
            .device_call(DEVICE_CORE, DEVICE_WRITE, &args)
            .map_err(|e| with_timeout(e, timeout))?;
        let size = XdrReader::new(&reply).u32()? as usize;
        if size == 0 && !block.is_empty() {
            return Err(EquipmentError::Protocol(
                "The device accepted none of the bytes".to_string(),
            ));
        }
        Ok(size.min(block.len()))
    }

    /// Destroy the link and close the connections. Errors are logged, not returned, so that the
    /// sockets are always closed.
    fn close(&mut self) -> Result<(), EquipmentError> {
        if let Some(client) = self.abort_client.take() {
            client.shutdown();
        }
        if let Some(mut core) = self.core.take() {
            if let Some(link_id) = self.link_id.take() {
                let args = XdrWriter::default().i32(link_id).data;
                match core.device_call(DEVICE_CORE, DESTROY_LINK, &args) {
                    Ok(_) => log::debug!("destroy_link({link_id})"),
                    Err(e) => log::warn!("destroy_link({link_id}) of {} failed: {e}", self.host),
                }
            }
            core.shutdown();
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), EquipmentError> {
        self.generic_call(DEVICE_CLEAR).map(drop)
    }

    fn trigger(&mut self) -> Result<(), EquipmentError> {
        self.generic_call(DEVICE_TRIGGER).map(drop)
    }

    fn read_stb(&mut self) -> Result<u8, EquipmentError> {
        let reply = self.generic_call(DEVICE_READSTB)?;
        // the status byte is sent as an unsigned integer
        Ok(XdrReader::new(&reply).u32()? as u8)
    }

    fn remote(&mut self) -> Result<(), EquipmentError> {
        self.generic_call(DEVICE_REMOTE).map(drop)
    }

    fn local(&mut self) -> Result<(), EquipmentError> {
        self.generic_call(DEVICE_LOCAL).map(drop)
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        self.core
            .as_ref()
            .and_then(|core| AbortHandle::for_tcp(&core.stream).ok())
    }

    fn marks_end(&self) -> bool {
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A device that answered a VXI-11 discovery broadcast.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Vxi11Device {
    /// IP address of the device.
    pub ip: Ipv4Addr,
    /// Port of the `Device Core` program.
    pub core_port: u16,
}

impl Vxi11Device {
    /// The address to connect to the device.
    pub fn address(&self) -> String {
        format!("TCPIP::{}::inst0::INSTR", self.ip)
    }
}

/// Broadcasts a portmapper request for the `Device Core` program and collects the answers.
///
/// # Example
///
/// ```no_run
/// use std::{net::Ipv4Addr, time::Duration};
///
/// use equipmentrs::Vxi11Discovery;
///
/// let devices = Vxi11Discovery::default()
///     .with_interfaces(vec![Ipv4Addr::new(192, 168, 1, 10)])
///     .with_timeout(Duration::from_millis(500))
///     .run()
///     .unwrap();
/// for device in devices {
///     println!("{}", device.address());
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Vxi11Discovery {
    interfaces: Vec<Ipv4Addr>,
    destination: SocketAddrV4,
    timeout: Duration,
}

impl Default for Vxi11Discovery {
    fn default() -> Self {
        Vxi11Discovery {
            interfaces: vec![Ipv4Addr::UNSPECIFIED],
            destination: SocketAddrV4::new(Ipv4Addr::BROADCAST, PMAP_PORT),
            timeout: Duration::from_secs(1),
        }
    }
}

impl Vxi11Discovery {
    /// The local IPv4 addresses to broadcast from, all interfaces of the default route by
    /// default.
    pub fn with_interfaces(mut self, interfaces: Vec<Ipv4Addr>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Where the request is sent, `255.255.255.255:111` by default. Only answers from this port
    /// are accepted.
    pub fn with_destination(mut self, destination: SocketAddrV4) -> Self {
        self.destination = destination;
        self
    }

    /// How long to wait for answers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Broadcast from every interface in parallel and return the devices, sorted by IP address.
    ///
    /// An interface that cannot broadcast is skipped with a warning.
    pub fn run(&self) -> Result<Vec<Vxi11Device>, EquipmentError> {
        if self.timeout.is_zero() {
            return Err(EquipmentError::InvalidArgument(
                "the discovery timeout must be larger than zero".to_string(),
            ));
        }
        log::debug!(
            "find VXI-11 devices: interfaces={:?}, timeout={:?}",
            self.interfaces,
            self.timeout
        );
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .interfaces
                .iter()
                .map(|&interface| (interface, scope.spawn(move || self.broadcast(interface))))
                .collect();
            handles
                .into_iter()
                .map(|(interface, handle)| (interface, handle.join()))
                .collect()
        });

        let mut devices = Vec::new();
        for (interface, result) in results {
            match result {
                Ok(Ok(found)) => devices.extend(found),
                Ok(Err(e)) => log::warn!("VXI-11 discovery from {interface} failed: {e}"),
                Err(_) => log::warn!("VXI-11 discovery from {interface} panicked"),
            }
        }
        devices.sort();
        devices.dedup_by_key(|device| device.ip);
        Ok(devices)
    }

    fn broadcast(&self, interface: Ipv4Addr) -> Result<Vec<Vxi11Device>, EquipmentError> {
        let xid = std::process::id();
        let args = XdrWriter::default()
            .u32(DEVICE_CORE)
            .u32(DEVICE_VERSION)
            .u32(IPPROTO_TCP)
            .u32(0)
            .data;
        let message = call_message(xid, PMAP_PROG, PMAP_VERS, PMAPPROC_GETPORT, &args);

        let socket = UdpSocket::bind((interface, 0))?;
        socket.set_broadcast(true)?;
        socket.send_to(&message, self.destination)?;

        let deadline = Instant::now() + self.timeout;
        let mut devices = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(left))?;
            let (n, peer) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let SocketAddr::V4(peer) = peer else {
                continue;
            };
            if peer.port() != self.destination.port() {
                continue;
            }
            let body = match check_reply(xid, &buf[..n]) {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("Ignoring the answer of {peer}: {e}");
                    continue;
                }
            };
            match XdrReader::new(body).u32().map(u16::try_from) {
                Ok(Ok(port)) if port != 0 => {
                    log::debug!("found VXI-11 device {} (core port {port})", peer.ip());
                    devices.push(Vxi11Device {
                        ip: *peer.ip(),
                        core_port: port,
                    });
                }
                // not a VXI-11 device
                _ => {}
            }
        }
        Ok(devices)
    }
}

/// Find the VXI-11 devices on the network of the default interface.
pub fn find_vxi11(timeout: Duration) -> Result<Vec<Vxi11Device>, EquipmentError> {
    Vxi11Discovery::default().with_timeout(timeout).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_is_padded() {
        let data = XdrWriter::default().opaque(b"inst0").data;
        assert_eq!(data, b"\0\0\0\x05inst0\0\0\0");
        let mut reader = XdrReader::new(&data);
        assert_eq!(reader.opaque().unwrap(), b"inst0");
        assert!(reader.rest().is_empty());
    }

    #[test]
    fn test_millis() {
        assert_eq!(millis(None), ONE_DAY_MS);
        assert_eq!(millis(Some(Duration::from_millis(1500))), 1500);
    }

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(11), "Device locked by another link");
        assert_eq!(error_message(99), "Undefined error");
    }
}

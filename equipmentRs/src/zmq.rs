//! This module provides the transport for equipment that talks ZeroMQ.
//!
//! It speaks ZMTP 3.0 with the NULL security mechanism over TCP, as a `REQ` or a `DEALER` socket
//! with a single peer. A `REQ` socket prefixes every request with an empty delimiter frame and
//! expects it in front of every reply. Each received message is returned as one chunk that ends a
//! message, so ZeroMQ connections do not use termination characters.

use std::{
    any::Any,
    io::{Read, Write},
    net::{Shutdown, TcpStream},
    time::Duration,
};

use crate::{
    AbortHandle, Address, AddressFields, Chunk, ConnectOptions, EquipmentError, Transport,
    ZmqSocketType,
    transport::{connect_tcp, io_error, socket_timeout},
};

const GREETING_SIZE: usize = 64;
const MECHANISM_NULL: &[u8] = b"NULL";

// frame flags
const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;

/// The greeting that starts every ZMTP 3.0 connection.
fn greeting() -> [u8; GREETING_SIZE] {
    let mut greeting = [0u8; GREETING_SIZE];
    greeting[0] = 0xFF;
    greeting[9] = 0x7F;
    greeting[10] = 3;
    greeting[11] = 0;
    greeting[12..12 + MECHANISM_NULL.len()].copy_from_slice(MECHANISM_NULL);
    greeting
}

fn check_greeting(greeting: &[u8; GREETING_SIZE]) -> Result<(), EquipmentError> {
    if greeting[0] != 0xFF || greeting[9] != 0x7F {
        return Err(EquipmentError::Protocol(
            "The peer did not send a ZMTP signature".to_string(),
        ));
    }
    if greeting[10] < 3 {
        return Err(EquipmentError::Protocol(format!(
            "ZMTP {}.{} is not supported, the peer must speak ZMTP 3",
            greeting[10], greeting[11]
        )));
    }
    let mechanism = &greeting[12..32];
    let end = mechanism.iter().position(|&b| b == 0).unwrap_or(mechanism.len());
    if &mechanism[..end] != MECHANISM_NULL {
        return Err(EquipmentError::Protocol(format!(
            "The {:?} security mechanism is not supported",
            String::from_utf8_lossy(&mechanism[..end])
        )));
    }
    Ok(())
}

/// Encode one frame, using the long form for bodies of 256 bytes or more.
fn encode_frame(flags: u8, body: &[u8], out: &mut Vec<u8>) {
    match u8::try_from(body.len()) {
        Ok(size) => {
            out.push(flags);
            out.push(size);
        }
        Err(_) => {
            out.push(flags | FLAG_LONG);
            out.extend_from_slice(&(body.len() as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(body);
}

/// The body of a `READY` command with the `Socket-Type` property.
fn ready_command(socket_type: ZmqSocketType) -> Vec<u8> {
    let value: &[u8] = match socket_type {
        ZmqSocketType::Req => b"REQ",
        ZmqSocketType::Dealer => b"DEALER",
    };
    let mut body = Vec::new();
    body.push(5);
    body.extend_from_slice(b"READY");
    body.push(11);
    body.extend_from_slice(b"Socket-Type");
    body.extend_from_slice(&(value.len() as u32).to_be_bytes());
    body.extend_from_slice(value);
    body
}

/// The name of a command frame.
fn command_name(body: &[u8]) -> &[u8] {
    match body.split_first() {
        Some((&size, rest)) => &rest[..rest.len().min(usize::from(size))],
        None => &[],
    }
}

/// A ZeroMQ socket connected to one peer.
#[derive(Debug)]
pub struct ZmqTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    socket_type: ZmqSocketType,
    max_read_size: usize,
}

impl ZmqTransport {
    /// Connect to a `ZMQ::host::port` address and complete the ZMTP handshake.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Zmq { host, port } = address.fields() else {
            return Err(EquipmentError::connection(address, "not a ZeroMQ address"));
        };
        let mut stream = connect_tcp(address, host, *port, options.timeout)?;
        stream.set_read_timeout(socket_timeout(options.timeout))?;
        stream.set_write_timeout(socket_timeout(options.timeout))?;
        handshake(&mut stream, options.zmq.socket_type)
            .map_err(|e| EquipmentError::connection(address, e))?;
        log::debug!(
            "Opened ZeroMQ {:?} socket to {host}:{port}",
            options.zmq.socket_type
        );
        Ok(ZmqTransport {
            host: host.clone(),
            port: *port,
            stream: Some(stream),
            socket_type: options.zmq.socket_type,
            max_read_size: options.max_read_size,
        })
    }

    /// Set the largest message that is accepted from the peer.
    pub fn set_max_read_size(&mut self, max_read_size: usize) {
        self.max_read_size = max_read_size;
    }

    fn stream(&mut self) -> Result<&mut TcpStream, EquipmentError> {
        self.stream.as_mut().ok_or(EquipmentError::ConnectionClosed)
    }

    /// Read one frame, returns `(flags, body)`.
    fn read_frame(&mut self, timeout: Option<Duration>) -> Result<(u8, Vec<u8>), EquipmentError> {
        let max_read_size = self.max_read_size;
        let stream = self.stream()?;
        let mut head = [0u8; 1];
        read_full(stream, &mut head, timeout)?;
        let flags = head[0];
        let size = if flags & FLAG_LONG != 0 {
            let mut size = [0u8; 8];
            read_full(stream, &mut size, timeout)?;
            u64::from_be_bytes(size)
        } else {
            let mut size = [0u8; 1];
            read_full(stream, &mut size, timeout)?;
            u64::from(size[0])
        };
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        if size > max_read_size {
            return Err(EquipmentError::MaxReadSizeExceeded {
                size,
                max: max_read_size,
            });
        }
        let mut body = vec![0u8; size];
        read_full(stream, &mut body, timeout)?;
        Ok((flags, body))
    }
}

fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<(), EquipmentError> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => EquipmentError::ConnectionClosed,
        _ => io_error(e, timeout),
    })
}

fn handshake(stream: &mut TcpStream, socket_type: ZmqSocketType) -> Result<(), EquipmentError> {
    stream.write_all(&greeting())?;
    let mut peer = [0u8; GREETING_SIZE];
    stream.read_exact(&mut peer)?;
    check_greeting(&peer)?;

    let mut frame = Vec::new();
    encode_frame(FLAG_COMMAND, &ready_command(socket_type), &mut frame);
    stream.write_all(&frame)?;
    stream.flush()?;

    let mut head = [0u8; 1];
    stream.read_exact(&mut head)?;
    let size = if head[0] & FLAG_LONG != 0 {
        let mut size = [0u8; 8];
        stream.read_exact(&mut size)?;
        usize::try_from(u64::from_be_bytes(size)).unwrap_or(usize::MAX)
    } else {
        let mut size = [0u8; 1];
        stream.read_exact(&mut size)?;
        usize::from(size[0])
    };
    let mut body = vec![0u8; size.min(1 << 16)];
    stream.read_exact(&mut body)?;
    if head[0] & FLAG_COMMAND == 0 || command_name(&body) != b"READY" {
        return Err(EquipmentError::Protocol(
            "The peer did not answer with a READY command".to_string(),
        ));
    }
    Ok(())
}

impl Transport for ZmqTransport {
    /// Receive one complete message. The frames of a multi-part message are joined.
    fn read_raw(
        &mut self,
        _max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        self.stream()?.set_read_timeout(socket_timeout(timeout))?;
        let mut message = Vec::new();
        let mut first = true;
        loop {
            let (flags, body) = self.read_frame(timeout)?;
            if flags & FLAG_COMMAND != 0 {
                log::debug!(
                    "Ignored ZMTP command {:?}",
                    String::from_utf8_lossy(command_name(&body))
                );
                continue;
            }
            let skip_delimiter =
                first && self.socket_type == ZmqSocketType::Req && body.is_empty();
            first = false;
            if !skip_delimiter {
                message.extend_from_slice(&body);
                if message.len() > self.max_read_size {
                    return Err(EquipmentError::MaxReadSizeExceeded {
                        size: message.len(),
                        max: self.max_read_size,
                    });
                }
            }
            if flags & FLAG_MORE == 0 {
                return Ok(Chunk::end(message));
            }
        }
    }

    /// Send `data` as one message.
    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        let mut frames = Vec::with_capacity(data.len() + 11);
        if self.socket_type == ZmqSocketType::Req {
            encode_frame(FLAG_MORE, &[], &mut frames);
        }
        encode_frame(0, data, &mut frames);
        let stream = self.stream()?;
        stream.set_write_timeout(socket_timeout(timeout))?;
        stream.write_all(&frames).map_err(|e| io_error(e, timeout))?;
        stream.flush()?;
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        if let Some(stream) = self.stream.take()
            && let Err(e) = stream.shutdown(Shutdown::Both)
        {
            log::debug!("Shutting down the ZeroMQ socket to {}:{} failed: {e}", self.host, self.port);
        }
        Ok(())
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        self.stream
            .as_ref()
            .and_then(|stream| AbortHandle::for_tcp(stream).ok())
    }

    fn marks_end(&self) -> bool {
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting() {
        let greeting = greeting();
        assert!(check_greeting(&greeting).is_ok());
        assert_eq!(&greeting[12..16], b"NULL");
    }

    #[test]
    fn test_frame_size_forms() {
        let mut short = Vec::new();
        encode_frame(0, b"abc", &mut short);
        assert_eq!(short, b"\x00\x03abc");

        let mut long = Vec::new();
        encode_frame(FLAG_MORE, &[0u8; 300], &mut long);
        assert_eq!(long[0], FLAG_MORE | FLAG_LONG);
        assert_eq!(&long[1..9], &300u64.to_be_bytes());
        assert_eq!(long.len(), 9 + 300);
    }

    #[test]
    fn test_ready_command() {
        let body = ready_command(ZmqSocketType::Dealer);
        assert_eq!(command_name(&body), b"READY");
        assert!(body.ends_with(b"\x00\x00\x00\x06DEALER"));
    }
}

//! This module provides the transport for equipment that is connected through a raw TCP or UDP
//! socket.
//!
//! A TCP socket is a byte stream, so a read returns whatever has arrived. Every UDP datagram is a
//! complete message and is returned as a chunk that ends a message.

use std::{
    any::Any,
    io::{Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use crate::{
    AbortHandle, Address, AddressFields, Chunk, ConnectOptions, EquipmentError, SocketProtocol,
    Transport,
    transport::{connect_tcp, io_error, socket_timeout},
};

/// Largest payload of a UDP datagram over IPv4.
const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug)]
enum Socket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// A blocking TCP or UDP socket.
#[derive(Debug)]
pub struct SocketTransport {
    address: Address,
    host: String,
    port: u16,
    protocol: SocketProtocol,
    socket: Socket,
    buffer_size: usize,
    connect_timeout: Option<Duration>,
}

impl SocketTransport {
    /// Open the socket of a `TCP::`, `UDP::` or `TCPIP::host::port::SOCKET` address.
    ///
    /// A TCP connection is established within the timeout of the options. A UDP socket is bound
    /// to an ephemeral local port and only accepts datagrams from the equipment.
    pub fn open(address: &Address, options: &ConnectOptions) -> Result<Self, EquipmentError> {
        let AddressFields::Socket {
            protocol,
            host,
            port,
        } = address.fields()
        else {
            return Err(EquipmentError::connection(address, "not a socket address"));
        };
        let socket = connect(address, *protocol, host, *port, options.timeout)?;
        log::debug!("Opened {protocol:?} socket to {host}:{port}");
        Ok(SocketTransport {
            address: address.clone(),
            host: host.clone(),
            port: *port,
            protocol: *protocol,
            socket,
            buffer_size: options.socket.buffer_size.max(1),
            connect_timeout: options.timeout,
        })
    }

    /// Close the socket and connect again.
    ///
    /// # Arguments
    /// * `max_attempts` - The maximum number of attempts, 0 keeps trying until it succeeds.
    pub fn reconnect(&mut self, max_attempts: usize) -> Result<(), EquipmentError> {
        self.close()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match connect(
                &self.address,
                self.protocol,
                &self.host,
                self.port,
                self.connect_timeout,
            ) {
                Ok(socket) => {
                    self.socket = socket;
                    return Ok(());
                }
                Err(e) if max_attempts > 0 && attempt >= max_attempts => return Err(e),
                Err(e) => log::debug!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
    }

    /// The underlying TCP stream, `None` for a UDP socket.
    pub fn tcp_stream(&self) -> Option<&TcpStream> {
        match &self.socket {
            Socket::Tcp(stream) => Some(stream),
            Socket::Udp(_) => None,
        }
    }
}

fn connect(
    address: &Address,
    protocol: SocketProtocol,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<Socket, EquipmentError> {
    match protocol {
        SocketProtocol::Tcp => Ok(Socket::Tcp(connect_tcp(address, host, port, timeout)?)),
        SocketProtocol::Udp => {
            let peer = (host, port)
                .to_socket_addrs()
                .map_err(|e| EquipmentError::connection(address, e))?
                .next()
                .ok_or_else(|| {
                    EquipmentError::connection(address, format!("{host} did not resolve"))
                })?;
            let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(local).map_err(|e| EquipmentError::connection(address, e))?;
            socket
                .connect(peer)
                .map_err(|e| EquipmentError::connection(address, e))?;
            Ok(Socket::Udp(socket))
        }
    }
}

impl Transport for SocketTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        let mut buf = vec![0u8; max_bytes.min(self.buffer_size).max(1)];
        match &mut self.socket {
            Socket::Tcp(stream) => {
                stream.set_read_timeout(socket_timeout(timeout))?;
                let n = stream.read(&mut buf).map_err(|e| io_error(e, timeout))?;
                if n == 0 {
                    return Ok(Chunk::eof());
                }
                buf.truncate(n);
                Ok(Chunk::data(buf))
            }
            Socket::Udp(socket) => {
                // a datagram cannot be split across reads
                buf.resize(MAX_DATAGRAM_SIZE, 0);
                socket.set_read_timeout(socket_timeout(timeout))?;
                let n = socket.recv(&mut buf).map_err(|e| io_error(e, timeout))?;
                buf.truncate(n);
                Ok(Chunk::end(buf))
            }
        }
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        match &mut self.socket {
            Socket::Tcp(stream) => {
                stream.set_write_timeout(socket_timeout(timeout))?;
                let n = stream.write(data).map_err(|e| io_error(e, timeout))?;
                stream.flush()?;
                Ok(n)
            }
            Socket::Udp(socket) => {
                socket.set_write_timeout(socket_timeout(timeout))?;
                socket.send(data).map_err(|e| io_error(e, timeout))
            }
        }
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        if let Socket::Tcp(stream) = &self.socket
            && let Err(e) = stream.shutdown(Shutdown::Both)
        {
            log::debug!("Shutting down the socket to {}:{} failed: {e}", self.host, self.port);
        }
        Ok(())
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        match &self.socket {
            Socket::Tcp(stream) => AbortHandle::for_tcp(stream).ok(),
            Socket::Udp(_) => None,
        }
    }

    fn marks_end(&self) -> bool {
        matches!(self.socket, Socket::Udp(_))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

//! This module provides the message-based protocol engine.
//!
//! It can be used with any type that implements [`Transport`], e.g., a socket, a serial port or a
//! VXI-11 link. The engine appends the write termination to outgoing messages, splits the incoming
//! byte stream into messages at the read termination, keeps bytes that were read past a
//! termination for the next read and suspends the termination search inside IEEE 488.2 binary
//! blocks.
//!
//! A message that contains a definite length block `#<n><length><payload>` is returned without
//! the `#<n><length>` header, the payload bytes are returned verbatim even if they contain the
//! read termination.

use std::time::{Duration, Instant};

use crate::{
    BlockDetection, ConnectOptions, Encoding, EquipmentError, MessageInterface, Transport,
    block::BlockHeader, options::DEFAULT_MAX_READ_SIZE, options::validate_timeout,
};

/// Number of bytes requested from the transport per read call by default.
const DEFAULT_CHUNK_SIZE: usize = 4096;

/// A general message-based interface that can be built with any [`Transport`].
///
/// # Example
///
/// The following shows how to wrap a transport and query the equipment. Use
/// [`crate::connect`] to let the address decide which transport to open.
///
/// ```
/// use equipmentrs::{EchoTransport, MessageBased, MessageInterface};
///
/// let mut inst = MessageBased::new(EchoTransport::new());
/// inst.set_write_termination(b"\n");
/// inst.set_read_termination(b"\n");
/// assert_eq!(inst.query(b"*IDN?").unwrap(), b"*IDN?");
/// ```
pub struct MessageBased<T: Transport> {
    transport: T,
    name: String,
    timeout: Option<Duration>,
    read_termination: Vec<u8>,
    write_termination: Vec<u8>,
    encoding: Encoding,
    max_read_size: usize,
    rstrip: bool,
    chunk_size: usize,
    buffer: ReadBuffer,
}

impl<T: Transport> MessageBased<T> {
    /// Create a new instance of [`MessageBased`] with a given transport.
    ///
    /// The read termination is `"\n"`, the write termination is `"\r\n"` and reads block forever
    /// until a timeout is set.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            name: "MessageBased".to_string(),
            timeout: None,
            read_termination: b"\n".to_vec(),
            write_termination: b"\r\n".to_vec(),
            encoding: Encoding::Utf8,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            rstrip: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer: ReadBuffer::new(BlockDetection::Leading),
        }
    }

    /// Create a new instance configured by `options`.
    ///
    /// `read_termination` and `write_termination` are the defaults of the interface family, they
    /// are used unless the options override them.
    pub fn with_options(
        transport: T,
        options: &ConnectOptions,
        read_termination: &[u8],
        write_termination: &[u8],
    ) -> Result<Self, EquipmentError> {
        options.validate()?;
        let mut engine = Self::new(transport);
        engine.timeout = options.timeout;
        engine.read_termination = options.read_termination_or(read_termination);
        engine.write_termination = options.write_termination_or(write_termination);
        engine.encoding = options.encoding;
        engine.max_read_size = options.max_read_size;
        engine.rstrip = options.rstrip;
        engine.buffer = ReadBuffer::new(options.block_detection);
        Ok(engine)
    }

    /// The name that is used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the name that is used in log messages.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// The timeout of every read and write, `None` blocks forever.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the timeout. A timeout of zero is not allowed, use `None` to block forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), EquipmentError> {
        validate_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    /// The read termination, empty if messages are not terminated.
    pub fn read_termination(&self) -> &[u8] {
        &self.read_termination
    }

    /// Set the read termination, an empty slice disables it.
    pub fn set_read_termination(&mut self, termination: &[u8]) {
        self.read_termination = termination.to_vec();
        self.buffer.rescan();
    }

    /// The write termination, empty if nothing is appended.
    pub fn write_termination(&self) -> &[u8] {
        &self.write_termination
    }

    /// Set the write termination, an empty slice disables it.
    pub fn set_write_termination(&mut self, termination: &[u8]) {
        self.write_termination = termination.to_vec();
    }

    /// Set both the read and the write termination.
    pub fn set_termination(&mut self, termination: &[u8]) {
        self.set_read_termination(termination);
        self.set_write_termination(termination);
    }

    /// Set the text codec.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    /// The maximum number of bytes a single read may return.
    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    /// Set the maximum number of bytes a single read may return.
    pub fn set_max_read_size(&mut self, max_read_size: usize) -> Result<(), EquipmentError> {
        if max_read_size == 0 {
            return Err(EquipmentError::InvalidArgument(
                "max_read_size must be larger than zero".to_string(),
            ));
        }
        self.max_read_size = max_read_size;
        Ok(())
    }

    /// Remove trailing whitespace from strings that are read.
    pub fn set_rstrip(&mut self, rstrip: bool) {
        self.rstrip = rstrip;
    }

    /// Set where binary blocks are detected.
    pub fn set_block_detection(&mut self, block_detection: BlockDetection) {
        self.buffer.detection = block_detection;
        self.buffer.rescan();
    }

    /// Set the number of bytes requested from the transport per read call.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, e.g., for controller operations.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Discard bytes that were received but not yet returned by a read.
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Close the transport. Received bytes that were not read yet are discarded.
    pub fn close(&mut self) -> Result<(), EquipmentError> {
        self.buffer.clear();
        self.transport.close()
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    fn timeout_error(&mut self) -> EquipmentError {
        let partial = self.buffer.take_all();
        log::debug!(
            "{}.read() timed out with {} byte(s) received",
            self.name,
            partial.len()
        );
        EquipmentError::Timeout {
            timeout: self.timeout.unwrap_or_default(),
            partial,
        }
    }

    /// Read one chunk from the transport into the buffer, returns `false` on EOF.
    fn fill(&mut self, max_bytes: usize, deadline: Option<Instant>) -> Result<bool, EquipmentError> {
        if expired(deadline) {
            return Err(self.timeout_error());
        }
        let chunk = match self.transport.read_raw(max_bytes, time_left(deadline)) {
            Ok(chunk) => chunk,
            Err(e) if e.is_timeout() => return Err(self.timeout_error()),
            Err(e) => return Err(e),
        };
        if chunk.is_eof() {
            return Ok(false);
        }
        self.buffer.extend(&chunk.data, chunk.end);
        Ok(true)
    }

    fn read_message(&mut self) -> Result<Vec<u8>, EquipmentError> {
        let deadline = self.deadline();
        loop {
            let marks_end = self.transport.marks_end();
            if let Some(message) = self.buffer.next_message(&self.read_termination, marks_end)? {
                if message.len() > self.max_read_size {
                    return Err(EquipmentError::MaxReadSizeExceeded {
                        size: message.len(),
                        max: self.max_read_size,
                    });
                }
                return Ok(message);
            }
            if self.buffer.len() > self.max_read_size {
                let size = self.buffer.len();
                self.buffer.clear();
                return Err(EquipmentError::MaxReadSizeExceeded {
                    size,
                    max: self.max_read_size,
                });
            }

            if !self.fill(self.chunk_size, deadline)? {
                return self.buffer.finish_at_eof(&self.read_termination);
            }
        }
    }
}

impl<T: Transport> MessageInterface for MessageBased<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize, EquipmentError> {
        let mut payload = data.to_vec();
        if !self.write_termination.is_empty() && !payload.ends_with(&self.write_termination) {
            payload.extend_from_slice(&self.write_termination);
        }
        log::debug!(
            "{}.write({:?})",
            self.name,
            String::from_utf8_lossy(&payload)
        );

        let deadline = self.deadline();
        let mut sent = 0;
        while sent < payload.len() {
            let result = if expired(deadline) {
                Err(EquipmentError::Timeout {
                    timeout: Duration::ZERO,
                    partial: Vec::new(),
                })
            } else {
                self.transport.write_raw(&payload[sent..], time_left(deadline))
            };
            let n = match result {
                Ok(n) => n,
                Err(e) if e.is_timeout() => {
                    log::debug!(
                        "{}.write() timed out after {sent} of {} byte(s)",
                        self.name,
                        payload.len()
                    );
                    return Err(EquipmentError::Timeout {
                        timeout: self.timeout.unwrap_or_default(),
                        partial: Vec::new(),
                    });
                }
                Err(e) => return Err(e),
            };
            if n == 0 {
                return Err(EquipmentError::ConnectionClosed);
            }
            sent += n;
        }
        Ok(sent)
    }

    fn read(&mut self) -> Result<Vec<u8>, EquipmentError> {
        let message = self.read_message()?;
        log::debug!(
            "{}.read() -> {:?}",
            self.name,
            String::from_utf8_lossy(&message)
        );
        Ok(message)
    }

    fn read_exact(&mut self, size: usize) -> Result<Vec<u8>, EquipmentError> {
        if size > self.max_read_size {
            return Err(EquipmentError::MaxReadSizeExceeded {
                size,
                max: self.max_read_size,
            });
        }

        let deadline = self.deadline();
        while self.buffer.len() < size {
            let wanted = (size - self.buffer.len()).min(self.chunk_size);
            if !self.fill(wanted, deadline)? {
                log::debug!(
                    "{}.read({size}) -> connection closed after {} byte(s)",
                    self.name,
                    self.buffer.len()
                );
                self.buffer.clear();
                return Err(EquipmentError::ConnectionClosed);
            }
        }

        let message = self.buffer.take(size);
        log::debug!(
            "{}.read({size}) -> {:?}",
            self.name,
            String::from_utf8_lossy(&message)
        );
        Ok(message)
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn rstrip(&self) -> bool {
        self.rstrip
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Time left until `deadline`, `None` without a deadline.
fn time_left(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Where the framing scan of the message at the start of the buffer stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scan {
    /// Searching for the termination (and block headers) from this position.
    Text(usize),
    /// Inside a definite length block that ends at this position.
    Block(usize),
}

/// Accumulates received bytes until they form a complete message.
///
/// The first byte of `data` is always the first byte of the next message. Bytes of a message that
/// was returned are removed, bytes received after its termination stay.
#[derive(Debug)]
struct ReadBuffer {
    data: Vec<u8>,
    scan: Scan,
    /// Length of the buffer when the transport signalled the end of a message.
    end_at: Option<usize>,
    /// Position and length of the header of the block in the current message.
    header: Option<(usize, usize)>,
    detection: BlockDetection,
}

impl ReadBuffer {
    fn new(detection: BlockDetection) -> Self {
        ReadBuffer {
            data: Vec::new(),
            scan: Scan::Text(0),
            end_at: None,
            header: None,
            detection,
        }
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn extend(&mut self, data: &[u8], end: bool) {
        self.data.extend_from_slice(data);
        if end {
            self.end_at = Some(self.data.len());
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.end_at = None;
        self.rescan();
    }

    /// Forget the scan progress, e.g., because the termination changed.
    fn rescan(&mut self) {
        self.scan = Scan::Text(0);
        self.header = None;
    }

    fn take_all(&mut self) -> Vec<u8> {
        let data = std::mem::take(&mut self.data);
        self.clear();
        data
    }

    /// Remove the first `size` bytes.
    fn take(&mut self, size: usize) -> Vec<u8> {
        let rest = self.data.split_off(size);
        let message = std::mem::replace(&mut self.data, rest);
        self.consumed(size);
        message
    }

    /// Remove `consumed` bytes of which the first `len` are the message, without the block
    /// header.
    fn take_message(&mut self, len: usize, consumed: usize) -> Vec<u8> {
        let header = self.header.take();
        let mut message = self.take(consumed);
        message.truncate(len);
        if let Some((start, header_len)) = header
            && start + header_len <= message.len()
        {
            message.drain(start..start + header_len);
        }
        message
    }

    fn consumed(&mut self, count: usize) {
        self.end_at = self
            .end_at
            .and_then(|end| end.checked_sub(count))
            .filter(|&end| end > 0);
        self.rescan();
    }

    /// Can a binary block start at `pos`?
    fn block_allowed(&self, pos: usize) -> bool {
        if self.header.is_some() {
            return false;
        }
        match self.detection {
            BlockDetection::Disabled => false,
            BlockDetection::Leading => pos == 0,
            BlockDetection::Anywhere => true,
        }
    }

    /// Return the next complete message, if the buffer contains one.
    ///
    /// With `marks_end`, a message without a termination lasts until the end mark of the
    /// transport, bytes that follow a binary block up to the end mark are dropped.
    fn next_message(
        &mut self,
        termination: &[u8],
        marks_end: bool,
    ) -> Result<Option<Vec<u8>>, EquipmentError> {
        loop {
            match self.scan {
                Scan::Block(until) => {
                    if self.data.len() < until {
                        break;
                    }
                    if termination.is_empty() {
                        match self.end_at {
                            Some(end) if end >= until => {
                                if end > until {
                                    log::debug!(
                                        "Dropped {} byte(s) after a binary block",
                                        end - until
                                    );
                                }
                                return Ok(Some(self.take_message(until, end)));
                            }
                            Some(_) => break,
                            None if marks_end => break,
                            None => return Ok(Some(self.take_message(until, until))),
                        }
                    }
                    self.scan = Scan::Text(until);
                }
                Scan::Text(from) => match self.scan_text(from, termination)? {
                    TextScan::Message { len, consumed } => {
                        return Ok(Some(self.take_message(len, consumed)));
                    }
                    TextScan::Block {
                        start,
                        header_len,
                        until,
                    } => {
                        self.header = Some((start, header_len));
                        self.scan = Scan::Block(until);
                    }
                    TextScan::Incomplete(resume) => {
                        self.scan = Scan::Text(resume);
                        break;
                    }
                },
            }
        }

        // The transport marked the end of a message that carries no termination.
        if let Some(end) = self.end_at {
            if let Scan::Block(until) = self.scan
                && until > end
            {
                log::warn!(
                    "End of message received inside a binary block ({end} of {until} byte(s))"
                );
            }
            let len = if self.data[..end].ends_with(termination) {
                end - termination.len()
            } else {
                end
            };
            return Ok(Some(self.take_message(len, end)));
        }
        Ok(None)
    }

    fn scan_text(&self, from: usize, termination: &[u8]) -> Result<TextScan, EquipmentError> {
        let data = &self.data;
        let mut pos = from;
        while pos < data.len() {
            if !termination.is_empty() && data[pos..].starts_with(termination) {
                return Ok(TextScan::Message {
                    len: pos,
                    consumed: pos + termination.len(),
                });
            }
            if data[pos] == b'#' && self.block_allowed(pos) {
                match data.get(pos + 1) {
                    None => return Ok(TextScan::Incomplete(pos)),
                    Some(digit) if digit.is_ascii_digit() => {
                        match BlockHeader::parse(&data[pos..])? {
                            None => return Ok(TextScan::Incomplete(pos)),
                            Some(BlockHeader::Definite {
                                header_len,
                                data_len,
                            }) => {
                                return Ok(TextScan::Block {
                                    start: pos,
                                    header_len,
                                    until: pos + header_len + data_len,
                                });
                            }
                            // best effort, the termination ends the block
                            Some(BlockHeader::Indefinite) => {
                                pos += 2;
                                continue;
                            }
                        }
                    }
                    Some(_) => {}
                }
            }
            pos += 1;
        }

        // A termination may be split across two reads, resume where it could begin.
        let resume = data
            .len()
            .saturating_sub(termination.len().saturating_sub(1))
            .max(from);
        Ok(TextScan::Incomplete(resume))
    }

    /// The transport reached EOF, decide what to do with the buffered bytes.
    fn finish_at_eof(&mut self, termination: &[u8]) -> Result<Vec<u8>, EquipmentError> {
        if self.data.is_empty() {
            return Err(EquipmentError::ConnectionClosed);
        }
        if !termination.is_empty() {
            return Err(EquipmentError::TerminatorNotFound {
                partial: self.take_all(),
            });
        }
        if let Scan::Block(until) = self.scan
            && until > self.data.len()
        {
            let received = self.data.len();
            self.clear();
            return Err(EquipmentError::Protocol(format!(
                "connection closed inside a binary block ({received} of {until} byte(s))"
            )));
        }
        let len = self.data.len();
        Ok(self.take_message(len, len))
    }
}

/// Result of scanning text for the termination.
enum TextScan {
    /// A message of `len` bytes, `consumed` bytes including the termination.
    Message { len: usize, consumed: usize },
    /// A definite length block.
    Block {
        start: usize,
        header_len: usize,
        until: usize,
    },
    /// Need more bytes, resume the scan at this position.
    Incomplete(usize),
}

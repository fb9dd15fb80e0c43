//! The loopback module provides equipment simulators for testing purposes.
//!
//! The [`LoopbackTransport`] plays back a script of bytes that are expected from the host and bytes
//! that the equipment answers with, and panics on any deviation. The [`EchoTransport`] sends back
//! whatever was written to it. Both implement [`Transport`], so they can be wrapped in a
//! [`crate::MessageBased`] engine or registered as a backend.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::{AbortHandle, Chunk, EquipmentError, Transport};

/// A self-incrementing index structure that by default starts at 0 and increments whenever `next`
/// is called.
#[derive(Debug, Default)]
struct IncrIndex {
    index: usize,
}

impl IncrIndex {
    fn next(&mut self) -> usize {
        let current = self.index;
        self.index += 1;
        current
    }
}

/// A scripted transport to write tests for equipment drivers and the protocol engine.
///
/// Provide a list of byte strings that are expected to go from the host to the equipment, and a
/// list of byte strings that the equipment sends back. Every `write_raw` must match the next
/// expected byte string exactly, and every `read_raw` returns (a part of) the next answer. When the
/// [`LoopbackTransport`] is dropped, `finalize` checks that the whole script was used and panics
/// otherwise. This way, your tests can ensure easily that all bytes that you have provided are
/// used in the correct order.
///
/// # Example
///
/// ```
/// use equipmentrs::{LoopbackTransport, MessageBased, MessageInterface};
///
/// let transport = LoopbackTransport::new(vec![b"*IDN?\r\n".to_vec()], vec![b"ACME,1\n".to_vec()]);
/// let mut inst = MessageBased::new(transport);
/// assert_eq!(inst.query_str("*IDN?").unwrap(), "ACME,1");
/// ```
#[derive(Debug)]
pub struct LoopbackTransport {
    from_host: Vec<Vec<u8>>,
    from_inst: Vec<Vec<u8>>,
    from_host_index: IncrIndex,
    from_inst_index: IncrIndex,
    curr_bytes: VecDeque<u8>,
    chunk_size: Option<usize>,
    end_marks: bool,
    closed: bool,
}

impl LoopbackTransport {
    /// Create a new loopback transport with given bytes to and from the equipment.
    ///
    /// # Arguments:
    /// * `from_host` - Expected bytes from host to equipment, one entry per `write_raw` call.
    /// * `from_inst` - Bytes from equipment to host, one entry per answer.
    pub fn new(from_host: Vec<Vec<u8>>, from_inst: Vec<Vec<u8>>) -> Self {
        LoopbackTransport {
            from_host,
            from_inst,
            from_host_index: IncrIndex::default(),
            from_inst_index: IncrIndex::default(),
            curr_bytes: VecDeque::new(),
            chunk_size: None,
            end_marks: false,
            closed: false,
        }
    }

    /// Return at most `chunk_size` bytes per read, to test reassembly of messages.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Mark the last chunk of every answer as the end of a message, like message-oriented
    /// transports (VXI-11, HiSLIP, GPIB) do.
    pub fn with_end_marks(mut self) -> Self {
        self.end_marks = true;
        self
    }

    /// Returns `true` if `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// This command panics if not all bytes in the [`LoopbackTransport`] have been used.
    ///
    /// It is automatically called when the [`LoopbackTransport`] is dropped, but you can also call
    /// it manually to ensure that all bytes have been used.
    pub fn finalize(&mut self) {
        let from_host_leftover = self.from_host.get(self.from_host_index.next());
        let from_inst_leftover = self.from_inst.get(self.from_inst_index.next());
        if let Some(fil) = from_host_leftover {
            panic!(
                "Leftover expected bytes found from host to equipment: {:?}",
                String::from_utf8_lossy(fil)
            );
        }
        if !self.curr_bytes.is_empty() {
            panic!(
                "Leftover bytes of an answer from equipment to host: {:?}",
                self.curr_bytes
            );
        }
        if let Some(fil) = from_inst_leftover {
            panic!(
                "Leftover bytes found from equipment to host: {:?}",
                String::from_utf8_lossy(fil)
            );
        }
    }

    /// Get the next bytes from host to equipment, or panic.
    fn get_next_from_host(&mut self) -> &Vec<u8> {
        self.from_host
            .get(self.from_host_index.next())
            .expect("No more bytes were expected from host to equipment.")
    }

    /// Get the next bytes from equipment to host, or panic.
    fn get_next_from_inst(&mut self) -> &Vec<u8> {
        self.from_inst
            .get(self.from_inst_index.next())
            .expect("No more bytes were expected from equipment to host.")
    }
}

impl Transport for LoopbackTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        _timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        if self.closed {
            return Err(EquipmentError::ConnectionClosed);
        }
        if self.curr_bytes.is_empty() {
            let next = self.get_next_from_inst().clone();
            self.curr_bytes = next.into();
        }
        let count = self
            .chunk_size
            .unwrap_or(usize::MAX)
            .min(max_bytes)
            .min(self.curr_bytes.len());
        let data: Vec<u8> = self.curr_bytes.drain(..count).collect();
        let end = self.end_marks && self.curr_bytes.is_empty();
        Ok(Chunk { data, end })
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        if self.closed {
            return Err(EquipmentError::ConnectionClosed);
        }
        let exp = self.get_next_from_host().as_slice();
        assert_eq!(
            exp,
            data,
            "Expected write {:?}, got {:?}",
            String::from_utf8_lossy(exp),
            String::from_utf8_lossy(data)
        );
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        self.closed = true;
        Ok(())
    }

    fn marks_end(&self) -> bool {
        self.end_marks
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.finalize();
        }
    }
}

/// A transport that returns everything that is written to it.
///
/// A read without pending bytes waits for the full timeout and then fails, like equipment that
/// never answers. The transport counts how often it was closed, which allows tests to check that
/// a connection releases its transport exactly once.
#[derive(Debug)]
pub struct EchoTransport {
    pending: VecDeque<u8>,
    chunk_size: usize,
    write_limit: usize,
    aborted: Arc<AtomicBool>,
    close_count: Arc<AtomicUsize>,
}

impl Default for EchoTransport {
    fn default() -> Self {
        EchoTransport::new()
    }
}

impl EchoTransport {
    /// Create a new echo transport.
    pub fn new() -> Self {
        EchoTransport {
            pending: VecDeque::new(),
            chunk_size: usize::MAX,
            write_limit: usize::MAX,
            aborted: Arc::new(AtomicBool::new(false)),
            close_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return at most `chunk_size` bytes per read.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Accept at most `write_limit` bytes per write, like a socket with a full send buffer.
    pub fn with_write_limit(mut self, write_limit: usize) -> Self {
        self.write_limit = write_limit.max(1);
        self
    }

    /// Bytes that equipment sends without being asked.
    pub fn with_pending(mut self, data: &[u8]) -> Self {
        self.pending.extend(data);
        self
    }

    /// A counter of how often `close` was called, shared with this transport.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.close_count)
    }
}

impl Transport for EchoTransport {
    fn read_raw(
        &mut self,
        max_bytes: usize,
        timeout: Option<Duration>,
    ) -> Result<Chunk, EquipmentError> {
        if self.pending.is_empty() {
            let start = Instant::now();
            loop {
                if self.aborted.load(Ordering::SeqCst) {
                    return Err(EquipmentError::ConnectionClosed);
                }
                if let Some(timeout) = timeout
                    && start.elapsed() >= timeout
                {
                    return Err(EquipmentError::Timeout {
                        timeout,
                        partial: Vec::new(),
                    });
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        let count = self.chunk_size.min(max_bytes).min(self.pending.len());
        Ok(Chunk::data(self.pending.drain(..count).collect()))
    }

    fn write_raw(
        &mut self,
        data: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<usize, EquipmentError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(EquipmentError::ConnectionClosed);
        }
        let count = self.write_limit.min(data.len());
        self.pending.extend(&data[..count]);
        Ok(count)
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let aborted = Arc::clone(&self.aborted);
        Some(AbortHandle::new(move || aborted.store(true, Ordering::SeqCst)))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

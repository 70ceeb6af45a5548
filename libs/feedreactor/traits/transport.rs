//! Transport adapter interface
//!
//! The reactor never touches sockets itself. It drives anything that
//! implements [`Transport`]: handshake polling, framed reads, buffered
//! writes with asynchronous flush, pings and readiness notification.

use crate::core::config::ConnectionTarget;
use crate::traits::error::ReactorError;
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Bytes reserved in front of every message inside a packed buffer
pub const PACKED_HEADER_LEN: usize = 2;

/// Errors reported by transport implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("No buffers available")]
    NoBuffers,

    #[error("Buffer of {capacity} bytes cannot hold {needed} bytes")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Requested {requested} bytes exceeds maximum buffer size {max}")]
    BufferSizeExceeded { requested: usize, max: usize },

    #[error("No pending connection")]
    NoPendingConnection,

    #[error("Transport failure: {0}")]
    Failed(String),
}

impl From<TransportError> for ReactorError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoBuffers => ReactorError::NoBuffers(err.to_string()),
            TransportError::BufferTooSmall { needed, .. } => ReactorError::BufferTooSmall(needed),
            TransportError::BufferSizeExceeded { .. } => {
                ReactorError::ParameterOutOfRange(err.to_string())
            }
            other => ReactorError::Transport(other.to_string()),
        }
    }
}

/// Opaque readiness handle, the equivalent of a socket descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadinessHandle(pub u64);

impl fmt::Display for ReadinessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd#{}", self.0)
    }
}

/// Wakes the reactor when a transport has data to read
///
/// Transports keep the notifier they were registered with and call
/// [`ReadinessNotifier::notify`] whenever inbound data arrives.
#[derive(Clone)]
pub struct ReadinessNotifier {
    handle: ReadinessHandle,
    tx: Sender<ReadinessHandle>,
}

impl ReadinessNotifier {
    pub(crate) fn new(handle: ReadinessHandle, tx: Sender<ReadinessHandle>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> ReadinessHandle {
        self.handle
    }

    /// Signal readiness; a reactor that has gone away is ignored
    pub fn notify(&self) {
        let _ = self.tx.send(self.handle);
    }
}

impl fmt::Debug for ReadinessNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessNotifier")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Progress of the connection handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProgress {
    InProgress,
    /// Handshake finished; carries the negotiated ping timeout
    Complete { ping_timeout: Duration },
}

/// Result of a single read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete message
    Message(Vec<u8>),
    /// A protocol ping from the peer
    Ping,
    /// Nothing available right now
    WouldBlock,
    /// The readiness handle was replaced without closing the connection
    HandleChanged {
        old: ReadinessHandle,
        new: ReadinessHandle,
    },
}

/// Result of handing a buffer to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything reached the wire
    Complete,
    /// Accepted, but this many bytes still wait for a flush
    Pending(usize),
    /// Accepted under congestion; the caller must not resubmit and should
    /// back off until the pending bytes are flushed
    CallAgain(usize),
}

/// Result of one flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Drained,
    /// Bytes remain queued; flush again later
    Pending(usize),
}

/// Output buffer obtained from a transport
///
/// In packed mode every message is preceded by a two byte length header,
/// and [`TransportBuffer::seal`] closes the message being composed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBuffer {
    data: Vec<u8>,
    capacity: usize,
    packed: bool,
    sealed: Vec<usize>,
    segment_start: usize,
}

impl TransportBuffer {
    pub fn new(capacity: usize, packed: bool) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            packed,
            sealed: Vec::new(),
            segment_start: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Bytes written so far, excluding packed headers
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes of payload still available for the message being composed
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// Number of messages already sealed in a packed buffer
    pub fn sealed_count(&self) -> usize {
        self.sealed.len()
    }

    fn used(&self) -> usize {
        if self.packed {
            // Header of the open segment is reserved up front.
            self.data.len() + PACKED_HEADER_LEN * (self.sealed.len() + 1)
        } else {
            self.data.len()
        }
    }

    /// Append bytes to the message being composed
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let needed = self.used() + bytes.len();
        if needed > self.capacity {
            return Err(TransportError::BufferTooSmall {
                needed,
                capacity: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Close the open message of a packed buffer and return the remaining
    /// capacity for the next one
    pub fn seal(&mut self) -> usize {
        if !self.packed {
            return self.remaining();
        }
        let segment_len = self.data.len() - self.segment_start;
        if segment_len > 0 {
            self.sealed.push(segment_len);
            self.segment_start = self.data.len();
        }
        self.remaining()
    }

    /// Wire representation: raw bytes, or length-prefixed segments when packed
    pub fn into_wire_bytes(mut self) -> Vec<u8> {
        if !self.packed {
            return self.data;
        }
        self.seal();
        let mut out = Vec::with_capacity(self.data.len() + PACKED_HEADER_LEN * self.sealed.len());
        let mut offset = 0;
        for len in &self.sealed {
            out.extend_from_slice(&(*len as u16).to_be_bytes());
            out.extend_from_slice(&self.data[offset..offset + len]);
            offset += len;
        }
        out
    }
}

/// Split a packed wire payload back into its messages
pub fn unpack_segments(bytes: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
    let mut segments = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        if offset + PACKED_HEADER_LEN > bytes.len() {
            return Err(TransportError::Malformed(format!(
                "truncated packed header at offset {}",
                offset
            )));
        }
        let len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        offset += PACKED_HEADER_LEN;
        if offset + len > bytes.len() {
            return Err(TransportError::Malformed(format!(
                "packed segment of {} bytes overruns frame",
                len
            )));
        }
        segments.push(bytes[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(segments)
}

/// Connection primitives consumed by the reactor
///
/// Methods take `&self` because the worker thread flushes and pings while
/// the dispatch thread reads and writes. Implementations synchronise
/// internally.
pub trait Transport: Send + Sync {
    /// Advance the handshake
    fn init(&self) -> Result<InitProgress, TransportError>;

    /// Read the next message, if any
    fn read(&self) -> Result<ReadOutcome, TransportError>;

    /// Whether more data is already buffered for reading
    fn readable(&self) -> bool;

    /// Obtain an output buffer of at least `size` bytes
    fn get_buffer(&self, size: usize, packed: bool) -> Result<TransportBuffer, TransportError>;

    /// Seal the current message of a packed buffer, returning remaining capacity
    fn pack(&self, buffer: &mut TransportBuffer) -> Result<usize, TransportError> {
        if !buffer.is_packed() {
            return Err(TransportError::Failed("buffer is not packed".to_string()));
        }
        Ok(buffer.seal())
    }

    /// Hand a buffer over for sending
    fn write(&self, buffer: TransportBuffer) -> Result<WriteOutcome, TransportError>;

    /// Push queued output toward the wire
    fn flush(&self) -> Result<FlushOutcome, TransportError>;

    /// Send a protocol ping
    fn ping(&self) -> Result<(), TransportError>;

    /// Give back a buffer that will not be written
    fn release_buffer(&self, buffer: TransportBuffer);

    fn readiness_handle(&self) -> ReadinessHandle;

    /// Install the notifier used to signal inbound data
    fn register_readiness(&self, notifier: ReadinessNotifier);

    fn close(&self);

    /// Largest buffer [`Transport::get_buffer`] will hand out
    fn max_buffer_size(&self) -> usize;
}

/// Opens client connections
pub trait Connector: Send + Sync {
    fn connect(&self, target: &ConnectionTarget) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Produces server side connections
pub trait Listener: Send + Sync {
    fn accept(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

//! In-process loopback transport
//!
//! Connections live entirely in memory: a [`LoopbackNetwork`] maps
//! `address:port` endpoints to listeners, and each connection is a pair of
//! byte pipes carrying length-prefixed frames:
//!
//! ```text
//! ┌──────┬───────────────┬───────────┐
//! │ kind │ length u32 BE │ payload   │
//! └──────┴───────────────┴───────────┘
//! kind: 0x01 message, 0x02 packed messages, 0x03 ping, 0x04 handle change
//! ```
//!
//! Congestion, flush failures and stalled handshakes can be switched on per
//! connection, which makes the transport usable for exercising the
//! reactor's failure paths.

use crate::core::config::ConnectionTarget;
use crate::traits::transport::{
    unpack_segments, Connector, FlushOutcome, InitProgress, Listener, ReadOutcome,
    ReadinessHandle, ReadinessNotifier, Transport, TransportBuffer, TransportError,
    WriteOutcome,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const FRAME_HEADER_LEN: usize = 5;
const KIND_MESSAGE: u8 = 0x01;
const KIND_PACKED: u8 = 0x02;
const KIND_PING: u8 = 0x03;
const KIND_HANDLE_CHANGE: u8 = 0x04;

/// How writes behave when they cannot go straight to the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Congestion {
    /// Every write is delivered immediately
    #[default]
    None,
    /// Writes are queued until flushed
    Queue,
    /// Writes are queued and the caller is told to back off
    CallAgain,
}

/// Behaviour of connections made to one listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// `init` calls a client needs after being accepted
    #[serde(default = "default_init_steps")]
    pub init_steps: u32,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default)]
    pub congestion: Congestion,
    /// Output buffers a connection may hold at once
    #[serde(default = "default_max_output_buffers")]
    pub max_output_buffers: usize,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// The client handshake never finishes
    #[serde(default)]
    pub never_complete: bool,
}

fn default_init_steps() -> u32 {
    2
}

fn default_ping_timeout_ms() -> u64 {
    30_000
}

fn default_max_output_buffers() -> usize {
    32
}

fn default_max_buffer_size() -> usize {
    6144
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            init_steps: default_init_steps(),
            ping_timeout_ms: default_ping_timeout_ms(),
            congestion: Congestion::None,
            max_output_buffers: default_max_output_buffers(),
            max_buffer_size: default_max_buffer_size(),
            never_complete: false,
        }
    }
}

impl LoopbackConfig {
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_congestion(mut self, congestion: Congestion) -> Self {
        self.congestion = congestion;
        self
    }

    pub fn with_max_output_buffers(mut self, count: usize) -> Self {
        self.max_output_buffers = count;
        self
    }

    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn with_never_complete(mut self) -> Self {
        self.never_complete = true;
        self
    }

    fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Network and listeners
// ---------------------------------------------------------------------------

struct Endpoint {
    config: LoopbackConfig,
    pending: VecDeque<Arc<LoopbackTransport>>,
    clients: Vec<Arc<LoopbackTransport>>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, Endpoint>,
}

/// A set of in-memory endpoints; cloning shares the network
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    handles: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint_name(address: &str, port: &str) -> String {
        format!("{}:{}", address, port)
    }


    pub fn listen(&self, address: &str, port: &str) -> LoopbackListener {
        self.listen_with(address, port, LoopbackConfig::default())
    }

    /// Start listening; replaces any listener on the same endpoint
    pub fn listen_with(&self, address: &str, port: &str, config: LoopbackConfig) -> LoopbackListener {
        let endpoint = Self::endpoint_name(address, port);
        debug!("Loopback listening on {}", endpoint);
        self.state.lock().endpoints.insert(
            endpoint.clone(),
            Endpoint {
                config,
                pending: VecDeque::new(),
                clients: Vec::new(),
            },
        );
        LoopbackListener {
            network: self.clone(),
            endpoint,
        }
    }

    pub fn is_listening(&self, address: &str, port: &str) -> bool {
        self.state
            .lock()
            .endpoints
            .contains_key(&Self::endpoint_name(address, port))
    }

    /// Client ends of every connection made to an endpoint, oldest first
    pub fn client_ends(&self, address: &str, port: &str) -> Vec<Arc<LoopbackTransport>> {
        self.state
            .lock()
            .endpoints
            .get(&Self::endpoint_name(address, port))
            .map(|e| e.clients.clone())
            .unwrap_or_default()
    }

    pub fn last_client(&self, address: &str, port: &str) -> Option<Arc<LoopbackTransport>> {
        self.client_ends(address, port).pop()
    }
}

impl Connector for LoopbackNetwork {
    fn connect(&self, target: &ConnectionTarget) -> Result<Arc<dyn Transport>, TransportError> {
        let name = Self::endpoint_name(&target.address, &target.port);
        let mut state = self.state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&name)
            .ok_or_else(|| TransportError::ConnectionRefused(name.clone()))?;

        let link = Arc::new(Link::default());
        let client = Arc::new(LoopbackTransport::new(
            Side::Client,
            link.clone(),
            self.handles.clone(),
            endpoint.config.clone(),
        ));
        let server = Arc::new(LoopbackTransport::new(
            Side::Server,
            link,
            self.handles.clone(),
            endpoint.config.clone(),
        ));
        endpoint.pending.push_back(server);
        endpoint.clients.push(client.clone());
        debug!("Loopback connection to {} on {}", name, client.readiness_handle());
        Ok(client)
    }
}

/// Accepts connections made to one endpoint; stops listening when dropped
pub struct LoopbackListener {
    network: LoopbackNetwork,
    endpoint: String,
}

impl LoopbackListener {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Connections waiting to be accepted
    pub fn pending(&self) -> usize {
        self.network
            .state
            .lock()
            .endpoints
            .get(&self.endpoint)
            .map_or(0, |e| e.pending.len())
    }

    /// Accept the next connection as a raw transport
    pub fn accept_peer(&self) -> Result<Arc<LoopbackTransport>, TransportError> {
        let server = self
            .network
            .state
            .lock()
            .endpoints
            .get_mut(&self.endpoint)
            .and_then(|e| e.pending.pop_front())
            .ok_or(TransportError::NoPendingConnection)?;
        server.link.accepted.store(true, Ordering::Release);
        debug!("Loopback accepted on {}", self.endpoint);
        Ok(server)
    }
}

impl Listener for LoopbackListener {
    fn accept(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let server: Arc<dyn Transport> = self.accept_peer()?;
        Ok(server)
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        debug!("Loopback no longer listening on {}", self.endpoint);
        self.network.state.lock().endpoints.remove(&self.endpoint);
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    /// The writing end closed
    closed: bool,
    notifier: Option<ReadinessNotifier>,
}

impl Pipe {
    fn push(&mut self, bytes: &[u8]) {
        self.bytes.extend(bytes.iter().copied());
        self.notify();
    }

    fn notify(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }
    }

    fn has_data(&self) -> bool {
        !self.bytes.is_empty() || self.closed
    }

    /// Next complete frame, if one is buffered
    fn pop_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, TransportError> {
        let Some(&kind) = self.bytes.front() else {
            return Ok(None);
        };
        if !(KIND_MESSAGE..=KIND_HANDLE_CHANGE).contains(&kind) {
            return Err(TransportError::Malformed(format!(
                "unknown frame kind {:#04x}",
                kind
            )));
        }
        if self.bytes.len() < FRAME_HEADER_LEN {
            return self.incomplete();
        }
        let len_bytes: Vec<u8> = self.bytes.range(1..FRAME_HEADER_LEN).copied().collect();
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if self.bytes.len() < FRAME_HEADER_LEN + len {
            return self.incomplete();
        }
        self.bytes.drain(..FRAME_HEADER_LEN);
        let payload = self.bytes.drain(..len).collect();
        Ok(Some((kind, payload)))
    }

    /// A partial frame is only an error once the writer is gone
    fn incomplete(&self) -> Result<Option<(u8, Vec<u8>)>, TransportError> {
        if self.closed {
            return Err(TransportError::Malformed(format!(
                "{} bytes of truncated frame",
                self.bytes.len()
            )));
        }
        Ok(None)
    }
}

#[derive(Default)]
struct Link {
    to_client: Mutex<Pipe>,
    to_server: Mutex<Pipe>,
    accepted: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

struct EndpointState {
    init_steps_left: u32,
    buffers_in_use: usize,
    /// Frames written under congestion, awaiting flush
    pending: VecDeque<Vec<u8>>,
    /// Messages split out of a packed frame, not yet returned
    unpacked: VecDeque<Vec<u8>>,
    frame_sizes: Vec<usize>,
    congestion: Congestion,
    closed: bool,
}

/// One end of a loopback connection
pub struct LoopbackTransport {
    side: Side,
    link: Arc<Link>,
    handles: Arc<AtomicU64>,
    config: LoopbackConfig,
    handle: Mutex<ReadinessHandle>,
    fail_flush: AtomicBool,
    state: Mutex<EndpointState>,
}

fn next_handle(handles: &AtomicU64) -> ReadinessHandle {
    ReadinessHandle(handles.fetch_add(1, Ordering::Relaxed) + 1)
}

fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

impl LoopbackTransport {
    fn new(side: Side, link: Arc<Link>, handles: Arc<AtomicU64>, config: LoopbackConfig) -> Self {
        let handle = next_handle(&handles);
        let init_steps_left = match side {
            Side::Client => config.init_steps,
            Side::Server => 1,
        };
        Self {
            side,
            link,
            handles,
            handle: Mutex::new(handle),
            fail_flush: AtomicBool::new(false),
            state: Mutex::new(EndpointState {
                init_steps_left,
                buffers_in_use: 0,
                pending: VecDeque::new(),
                unpacked: VecDeque::new(),
                frame_sizes: Vec::new(),
                congestion: config.congestion,
                closed: false,
            }),
            config,
        }
    }

    fn inbound(&self) -> &Mutex<Pipe> {
        match self.side {
            Side::Client => &self.link.to_client,
            Side::Server => &self.link.to_server,
        }
    }

    fn outbound(&self) -> &Mutex<Pipe> {
        match self.side {
            Side::Client => &self.link.to_server,
            Side::Server => &self.link.to_client,
        }
    }

    fn deliver(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut pipe = self.outbound().lock();
        if pipe.closed {
            return Err(TransportError::Closed("peer closed".to_string()));
        }
        pipe.push(bytes);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().closed {
            Err(TransportError::Closed("closed locally".to_string()))
        } else {
            Ok(())
        }
    }

    /// Send one message frame, bypassing buffers and congestion
    pub fn send_frame(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.deliver(&frame(KIND_MESSAGE, payload))
    }

    /// Put arbitrary bytes on the wire
    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.deliver(bytes)
    }

    /// Tell the peer its readiness handle changed
    pub fn send_handle_change(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.deliver(&frame(KIND_HANDLE_CHANGE, &[]))
    }

    /// Drive `init` until the handshake finishes
    pub fn complete_handshake(&self) -> Result<Duration, TransportError> {
        loop {
            if let InitProgress::Complete { ping_timeout } = self.init()? {
                return Ok(ping_timeout);
            }
            if self.config.never_complete {
                return Err(TransportError::Failed("handshake never completes".to_string()));
            }
        }
    }

    /// Read the next message, skipping pings
    pub fn recv_message(&self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.read()? {
                ReadOutcome::Message(bytes) => return Ok(Some(bytes)),
                ReadOutcome::Ping | ReadOutcome::HandleChanged { .. } => continue,
                ReadOutcome::WouldBlock => return Ok(None),
            }
        }
    }

    pub fn set_flush_failure(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::Relaxed);
    }

    pub fn set_congestion(&self, congestion: Congestion) {
        self.state.lock().congestion = congestion;
    }

    /// Payload sizes of the message frames received so far
    pub fn received_frame_sizes(&self) -> Vec<usize> {
        self.state.lock().frame_sizes.clone()
    }

    pub fn buffers_in_use(&self) -> usize {
        self.state.lock().buffers_in_use
    }

    pub fn pending_frames(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The other end closed the connection
    pub fn peer_closed(&self) -> bool {
        self.inbound().lock().closed
    }
}

impl Transport for LoopbackTransport {
    fn init(&self) -> Result<InitProgress, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed("closed locally".to_string()));
        }
        if self.inbound().lock().closed {
            return Err(TransportError::Closed("peer closed during handshake".to_string()));
        }
        if self.side == Side::Client {
            if self.config.never_complete || !self.link.accepted.load(Ordering::Acquire) {
                return Ok(InitProgress::InProgress);
            }
        }
        state.init_steps_left = state.init_steps_left.saturating_sub(1);
        if state.init_steps_left > 0 {
            return Ok(InitProgress::InProgress);
        }
        Ok(InitProgress::Complete {
            ping_timeout: self.config.ping_timeout(),
        })
    }

    fn read(&self) -> Result<ReadOutcome, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed("closed locally".to_string()));
        }
        if let Some(message) = state.unpacked.pop_front() {
            return Ok(ReadOutcome::Message(message));
        }

        let mut pipe = self.inbound().lock();
        let Some((kind, payload)) = pipe.pop_frame()? else {
            if pipe.closed {
                return Err(TransportError::Closed("peer closed".to_string()));
            }
            return Ok(ReadOutcome::WouldBlock);
        };
        drop(pipe);

        match kind {
            KIND_MESSAGE => {
                state.frame_sizes.push(payload.len());
                Ok(ReadOutcome::Message(payload))
            }
            KIND_PACKED => {
                state.frame_sizes.push(payload.len());
                let mut segments: VecDeque<Vec<u8>> = unpack_segments(&payload)?.into();
                let first = segments.pop_front();
                state.unpacked.extend(segments);
                match first {
                    Some(message) => Ok(ReadOutcome::Message(message)),
                    None => Ok(ReadOutcome::WouldBlock),
                }
            }
            KIND_PING => {
                trace!("Loopback ping on {}", *self.handle.lock());
                Ok(ReadOutcome::Ping)
            }
            KIND_HANDLE_CHANGE => {
                let new = next_handle(&self.handles);
                let old = std::mem::replace(&mut *self.handle.lock(), new);
                Ok(ReadOutcome::HandleChanged { old, new })
            }
            other => Err(TransportError::Malformed(format!(
                "unknown frame kind {:#04x}",
                other
            ))),
        }
    }

    fn readable(&self) -> bool {
        let state = self.state.lock();
        !state.closed && (!state.unpacked.is_empty() || self.inbound().lock().has_data())
    }

    fn get_buffer(&self, size: usize, packed: bool) -> Result<TransportBuffer, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed("closed locally".to_string()));
        }
        if size > self.config.max_buffer_size {
            return Err(TransportError::BufferSizeExceeded {
                requested: size,
                max: self.config.max_buffer_size,
            });
        }
        if state.buffers_in_use >= self.config.max_output_buffers {
            return Err(TransportError::NoBuffers);
        }
        state.buffers_in_use += 1;
        Ok(TransportBuffer::new(size, packed))
    }

    fn write(&self, buffer: TransportBuffer) -> Result<WriteOutcome, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed("closed locally".to_string()));
        }
        let kind = if buffer.is_packed() { KIND_PACKED } else { KIND_MESSAGE };
        let bytes = frame(kind, &buffer.into_wire_bytes());

        match state.congestion {
            Congestion::None => {
                state.buffers_in_use = state.buffers_in_use.saturating_sub(1);
                drop(state);
                self.deliver(&bytes)?;
                Ok(WriteOutcome::Complete)
            }
            congestion => {
                state.pending.push_back(bytes);
                let pending: usize = state.pending.iter().map(Vec::len).sum();
                if congestion == Congestion::CallAgain {
                    Ok(WriteOutcome::CallAgain(pending))
                } else {
                    Ok(WriteOutcome::Pending(pending))
                }
            }
        }
    }

    fn flush(&self) -> Result<FlushOutcome, TransportError> {
        if self.fail_flush.load(Ordering::Relaxed) {
            return Err(TransportError::Failed("flush failed".to_string()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed("closed locally".to_string()));
        }
        if let Some(bytes) = state.pending.pop_front() {
            state.buffers_in_use = state.buffers_in_use.saturating_sub(1);
            self.deliver(&bytes)?;
        }
        if state.pending.is_empty() {
            Ok(FlushOutcome::Drained)
        } else {
            Ok(FlushOutcome::Pending(state.pending.iter().map(Vec::len).sum()))
        }
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.deliver(&frame(KIND_PING, &[]))
    }

    fn release_buffer(&self, _buffer: TransportBuffer) {
        let mut state = self.state.lock();
        state.buffers_in_use = state.buffers_in_use.saturating_sub(1);
    }

    fn readiness_handle(&self) -> ReadinessHandle {
        *self.handle.lock()
    }

    fn register_readiness(&self, notifier: ReadinessNotifier) {
        let ready = !self.state.lock().unpacked.is_empty();
        let mut pipe = self.inbound().lock();
        if ready || pipe.has_data() {
            notifier.notify();
        }
        pipe.notifier = Some(notifier);
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.clear();
            state.unpacked.clear();
        }
        let mut pipe = self.outbound().lock();
        pipe.closed = true;
        pipe.notify();
        debug!("Loopback {:?} end {} closed", self.side, *self.handle.lock());
    }

    fn max_buffer_size(&self) -> usize {
        self.config.max_buffer_size
    }
}

//! Common test utilities for FeedReactor integration tests
//!
//! Provides an event recorder, role builders wired to it, and a scripted
//! server that plays the far end of a loopback connection.

#![allow(dead_code)]

use feedreactor::rdm::{DictionaryMsg, DirectoryMsg, LoginMsg, RdmMsg};
use feedreactor::{
    CallbackReturn, ChannelEventType, ChannelId, DispatchOptions, ErrorInfo, JsonFrameCodec,
    LoopbackListener, LoopbackNetwork, LoopbackTransport, Msg, Reactor, ReactorOptions,
    ReadinessHandle, Role, WireCodec,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// Everything the callbacks of a role observed
#[derive(Default)]
pub struct Recorded {
    pub events: Vec<(ChannelId, ChannelEventType)>,
    /// When each entry of `events` was delivered
    pub event_times: Vec<Instant>,
    pub errors: Vec<(ChannelEventType, ErrorInfo)>,
    pub fd_changes: Vec<(ReadinessHandle, ReadinessHandle)>,
    /// Readiness handle still registered when a down event arrived
    pub registered_at_down: Vec<bool>,
    pub default_msgs: Vec<Msg>,
    pub login_msgs: Vec<LoginMsg>,
    pub directory_msgs: Vec<DirectoryMsg>,
    pub dictionary_msgs: Vec<DictionaryMsg>,
}

#[derive(Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Recorded>>,
    /// Handle of the connection that last came up
    last_handle: Arc<Mutex<Option<ReadinessHandle>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_types(&self) -> Vec<ChannelEventType> {
        self.inner.lock().events.iter().map(|(_, t)| *t).collect()
    }

    pub fn events_for(&self, channel: ChannelId) -> Vec<ChannelEventType> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, t)| *t)
            .collect()
    }

    /// Every event with its delivery time
    pub fn timeline(&self) -> Vec<(ChannelEventType, Instant)> {
        let log = self.inner.lock();
        log.events
            .iter()
            .map(|(_, t)| *t)
            .zip(log.event_times.iter().copied())
            .collect()
    }

    pub fn count(&self, event_type: ChannelEventType) -> usize {
        self.event_types().iter().filter(|t| **t == event_type).count()
    }

    pub fn has(&self, event_type: ChannelEventType) -> bool {
        self.count(event_type) > 0
    }

    pub fn errors(&self) -> Vec<(ChannelEventType, ErrorInfo)> {
        self.inner.lock().errors.clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&Recorded) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Consumer role that records every callback
    pub fn consumer(&self) -> Role {
        self.attach(Role::consumer())
    }

    /// Attach recording callbacks to any role
    pub fn attach(&self, role: Role) -> Role {
        let events = self.inner.clone();
        let last_handle = self.last_handle.clone();
        let default_log = self.inner.clone();
        let login_log = self.inner.clone();
        let directory_log = self.inner.clone();
        let dictionary_log = self.inner.clone();

        role.on_channel_event(move |ctx, event| {
            verbose_println!("  event {} on {}", event.event_type, event.channel);
            let mut log = events.lock();
            log.events.push((event.channel, event.event_type));
            log.event_times.push(Instant::now());
            if let Some(error) = &event.error {
                log.errors.push((event.event_type, error.clone()));
            }
            match event.event_type {
                ChannelEventType::ChannelUp => {
                    *last_handle.lock() = ctx.channel_info().and_then(|i| i.readiness_handle);
                }
                ChannelEventType::FdChange => {
                    if let (Some(old), Some(new)) = (event.old_handle, event.new_handle) {
                        log.fd_changes.push((old, new));
                        *last_handle.lock() = Some(new);
                    }
                }
                ChannelEventType::ChannelDown | ChannelEventType::ChannelDownReconnecting => {
                    let registered = last_handle
                        .lock()
                        .map_or(false, |handle| ctx.is_registered(handle));
                    log.registered_at_down.push(registered);
                }
                _ => {}
            }
            CallbackReturn::Success
        })
        .on_default_msg(move |_, event| {
            default_log.lock().default_msgs.push(event.msg.clone());
            CallbackReturn::Success
        })
        .on_login_msg(move |_, event| {
            login_log.lock().login_msgs.push(event.login.clone());
            CallbackReturn::Success
        })
        .on_directory_msg(move |_, event| {
            directory_log.lock().directory_msgs.push(event.directory.clone());
            CallbackReturn::Success
        })
        .on_dictionary_msg(move |_, event| {
            dictionary_log.lock().dictionary_msgs.push(event.dictionary.clone());
            CallbackReturn::Success
        })
    }
}

pub fn new_reactor(network: &LoopbackNetwork) -> Reactor {
    Reactor::new(
        ReactorOptions::default(),
        Arc::new(network.clone()),
        Arc::new(JsonFrameCodec::new()),
    )
    .expect("reactor starts")
}

/// Dispatch until `done` holds or `timeout` passes; returns whether it held
pub fn pump_until(reactor: &mut Reactor, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    let options = DispatchOptions::default().with_timeout(Duration::from_millis(5));
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        reactor.dispatch(&options).expect("dispatch");
    }
    done()
}

/// Dispatch for a fixed time
pub fn pump_for(reactor: &mut Reactor, duration: Duration) {
    pump_until(reactor, duration, || false);
}

/// The far end of a loopback connection, driven by the test
pub struct ScriptedServer {
    pub transport: Arc<LoopbackTransport>,
    codec: JsonFrameCodec,
}

impl ScriptedServer {
    /// Accept a connection, dispatching while waiting for it to arrive
    pub fn accept(reactor: &mut Reactor, listener: &LoopbackListener, timeout: Duration) -> Self {
        assert!(
            pump_until(reactor, timeout, || listener.pending() > 0),
            "no connection reached {}",
            listener.endpoint()
        );
        let transport = listener.accept_peer().expect("pending connection");
        transport.complete_handshake().expect("server handshake");
        Self {
            transport,
            codec: JsonFrameCodec::new(),
        }
    }

    pub fn send(&self, msg: &Msg) {
        let bytes = self.codec.to_bytes(msg).expect("encode");
        self.transport.send_frame(&bytes).expect("send");
    }

    pub fn send_rdm(&self, msg: RdmMsg) {
        self.send(&msg.to_msg().expect("rdm to msg"));
    }

    pub fn try_recv(&self) -> Option<Msg> {
        let bytes = self.transport.recv_message().expect("server read")?;
        Some(self.codec.decode(&bytes).expect("decode"))
    }

    /// Wait for the next message, dispatching the reactor meanwhile
    pub fn recv(&self, reactor: &mut Reactor, timeout: Duration) -> Msg {
        let mut received = None;
        pump_until(reactor, timeout, || {
            if received.is_none() {
                received = self.try_recv();
            }
            received.is_some()
        });
        received.expect("server expected a message")
    }

    pub fn close(&self) {
        use feedreactor::Transport;
        self.transport.close();
    }
}

pub const WAIT: Duration = Duration::from_secs(3);

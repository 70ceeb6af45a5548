//! The reactor
//!
//! Owns every channel, the readiness registry and the worker thread. All
//! application callbacks run on the thread that calls into the reactor,
//! one at a time.

use crate::core::channel::{Channel, ChannelId, ChannelInfo, ChannelStats};
use crate::core::config::{
    AcceptOptions, ConnectOptions, DispatchOptions, ReactorOptions, SubmitOptions,
};
use crate::core::events::{
    ChannelEvent, ChannelEventType, DictionaryMsgEvent, DirectoryMsgEvent, LoginMsgEvent, MsgEvent,
};
use crate::core::readiness::ReadinessRegistry;
use crate::core::state::ChannelState;
use crate::core::submit::{Payload, SubmitStatus};
use crate::session::role::Role;
use crate::traits::callback::CallbackReturn;
use crate::traits::codec::WireCodec;
use crate::traits::error::{ErrorInfo, ReactorError, Result};
use crate::traits::transport::{Connector, Listener, ReadinessHandle, Transport, TransportBuffer};
use crate::worker::event::{WorkerCommand, WorkerEvent};
use crate::worker::queue::{bidirectional, ReactorEnd};
use crate::worker::worker;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) struct ReactorCore {
    pub options: ReactorOptions,
    pub connector: Arc<dyn Connector>,
    pub codec: Arc<dyn WireCodec>,
    pub channels: HashMap<ChannelId, Channel>,
    next_id: u64,
    pub registry: ReadinessRegistry,
    pub queue: ReactorEnd,
    worker_thread: Option<JoinHandle<()>>,
    /// Events produced on the dispatch thread, handled on the next dispatch
    pub deferred: VecDeque<WorkerEvent>,
    /// Channels with data left over from an exhausted dispatch budget
    pub ready_queue: VecDeque<ChannelId>,
    pub shutdown: bool,
}

/// Handle given to callbacks for acting on the reactor
///
/// Operations default to the channel the callback was invoked for.
pub struct CallbackContext<'a> {
    core: &'a mut ReactorCore,
    channel: ChannelId,
}

impl<'a> CallbackContext<'a> {
    pub(crate) fn new(core: &'a mut ReactorCore, channel: ChannelId) -> Self {
        Self { core, channel }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn submit(&mut self, payload: Payload, options: &SubmitOptions) -> Result<SubmitStatus> {
        self.core.submit(self.channel, payload, options)
    }

    /// Submit on another channel of the same reactor
    pub fn submit_to(
        &mut self,
        channel: ChannelId,
        payload: Payload,
        options: &SubmitOptions,
    ) -> Result<SubmitStatus> {
        self.core.submit(channel, payload, options)
    }

    pub fn get_buffer(&mut self, size: usize, packed: bool) -> Result<TransportBuffer> {
        self.core.get_buffer(self.channel, size, packed)
    }

    pub fn pack_buffer(&mut self, buffer: &mut TransportBuffer) -> Result<usize> {
        self.core.pack_buffer(self.channel, buffer)
    }

    pub fn release_buffer(&mut self, buffer: TransportBuffer) -> Result<()> {
        self.core.release_buffer(self.channel, buffer)
    }

    pub fn close_channel(&mut self) -> Result<()> {
        self.core.close_channel(self.channel)
    }

    pub fn channel_info(&self) -> Option<ChannelInfo> {
        self.core.channels.get(&self.channel).map(Channel::info)
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.core.channels.get(&self.channel).map(|c| c.state)
    }

    /// Whether a readiness handle is still registered with the reactor
    pub fn is_registered(&self, handle: ReadinessHandle) -> bool {
        self.core.registry.is_registered(handle)
    }

    pub fn reactor_user_spec(&self) -> Option<&serde_json::Value> {
        self.core.options.user_spec.as_ref()
    }
}

impl ReactorCore {
    fn new(
        options: ReactorOptions,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn WireCodec>,
    ) -> Result<Self> {
        let (queue, worker_end) = bidirectional();
        let worker_thread = worker::spawn(worker_end, options.worker_tick())?;
        info!("Reactor created, worker tick {:?}", options.worker_tick());
        Ok(Self {
            options,
            connector,
            codec,
            channels: HashMap::new(),
            next_id: 1,
            registry: ReadinessRegistry::new(),
            queue,
            worker_thread: Some(worker_thread),
            deferred: VecDeque::new(),
            ready_queue: VecDeque::new(),
            shutdown: false,
        })
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.shutdown {
            Err(ReactorError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .get(&id)
            .ok_or(ReactorError::UnknownChannel(id.0))
    }

    /// Still on the same connection attempt and not down
    pub fn is_live(&self, id: ChannelId, epoch: u64) -> bool {
        self.channels
            .get(&id)
            .map_or(false, |c| c.epoch == epoch && c.state.is_active())
    }

    pub fn epoch_of(&self, id: ChannelId) -> Option<u64> {
        self.channels.get(&id).map(|c| c.epoch)
    }

    /// Transport of a channel that is up or ready
    pub fn active_transport(&self, id: ChannelId) -> Result<Arc<dyn Transport>> {
        let channel = self.channel(id)?;
        if !channel.state.is_active() {
            return Err(ReactorError::ChannelInert(format!(
                "channel {} is {}",
                id, channel.state
            )));
        }
        channel
            .transport()
            .ok_or_else(|| ReactorError::ChannelInert(format!("channel {} has no transport", id)))
    }

    pub fn enqueue_ready(&mut self, id: ChannelId) {
        if !self.ready_queue.contains(&id) {
            self.ready_queue.push_back(id);
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn connect(&mut self, options: ConnectOptions, role: Role) -> Result<ChannelId> {
        self.ensure_running()?;
        options.validate()?;
        role.validate_for_connect()?;

        let id = self.allocate_id();
        let channel = Channel::client(id, Arc::new(role), &options)?;
        info!(
            "Channel {} opening as {} to {}",
            id,
            channel.role.name(),
            channel
                .cursor
                .as_ref()
                .map(|c| c.current().target.endpoint())
                .unwrap_or_default()
        );
        self.channels.insert(id, channel);

        self.emit(ChannelEvent::new(ChannelEventType::ChannelOpened, id))?;
        if self.channels.get(&id).map(|c| c.state) != Some(ChannelState::Opened) {
            return Ok(id);
        }

        self.start_connection(id)?;
        match self.channels.get(&id).map(|c| c.state) {
            Some(ChannelState::Down) => Err(ReactorError::Transport(format!(
                "channel {} could not connect and has no recovery attempts left",
                id
            ))),
            _ => Ok(id),
        }
    }

    pub fn accept(
        &mut self,
        listener: &dyn Listener,
        options: AcceptOptions,
        role: Role,
    ) -> Result<ChannelId> {
        self.ensure_running()?;
        options.validate()?;
        role.validate_for_accept()?;

        let transport = listener.accept()?;
        let id = self.allocate_id();
        let channel = Channel::server(id, Arc::new(role), transport.clone(), &options);
        let epoch = channel.epoch;
        let ping = channel.ping.clone();
        let init_timeout = channel.init_timeout;
        self.channels.insert(id, channel);
        info!("Channel {} accepted on {}", id, transport.readiness_handle());

        if let Err(e) = self.queue.send(WorkerCommand::NewChannel {
            channel: id,
            epoch,
            transport,
            init_timeout,
            ping,
        }) {
            return Err(self.worker_queue_failure(id, e));
        }
        Ok(id)
    }

    /// Close a channel; closing an unknown or closed channel is a no-op,
    /// as is closing after shutdown released every channel
    pub fn close_channel(&mut self, id: ChannelId) -> Result<()> {
        if self.shutdown {
            debug!("Reactor shut down, channel {} already released", id);
            return Ok(());
        }
        let Some(mut channel) = self.channels.remove(&id) else {
            debug!("Channel {} already closed", id);
            return Ok(());
        };

        if let Some(handle) = channel.readiness.take() {
            self.registry.cancel(handle);
        }
        if let Some(transport) = channel.transport.take() {
            transport.close();
        }
        channel.transition(ChannelState::Closed);
        if let Err(e) = self.queue.send(WorkerCommand::ChannelClose { channel: id }) {
            debug!("Worker not notified of close of channel {}: {}", id, e);
        }
        self.ready_queue.retain(|c| *c != id);
        self.deferred.retain(|e| e.channel() != id);
        info!("Channel {} closed", id);
        Ok(())
    }

    /// Stop the worker and release every channel without invoking callbacks
    pub fn shutdown_internal(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;

        for (id, mut channel) in self.channels.drain() {
            if let Some(handle) = channel.readiness.take() {
                self.registry.cancel(handle);
            }
            if let Some(transport) = channel.transport.take() {
                transport.close();
            }
            debug!("Channel {} released by shutdown", id);
        }
        self.ready_queue.clear();
        self.deferred.clear();

        if let Err(e) = self.queue.send(WorkerCommand::Shutdown) {
            debug!("Worker already stopped: {}", e);
        }
        if let Some(handle) = self.worker_thread.take() {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Reactor shut down");
    }

    /// A command could not reach the worker: the channel goes down at once
    pub fn worker_queue_failure(&mut self, id: ChannelId, err: ReactorError) -> ReactorError {
        error!("Channel {} worker queue failure: {}", id, err);
        if let Some(channel) = self.channels.get_mut(&id) {
            if let Some(handle) = channel.readiness.take() {
                self.registry.cancel(handle);
            }
            if let Some(transport) = channel.transport.take() {
                transport.close();
            }
            channel.transition(ChannelState::Down);
        }
        let event = ChannelEvent::new(ChannelEventType::ChannelDown, id)
            .with_error(ErrorInfo::from_error("Reactor.sendWorkerEvent", &err));
        match self.emit(event) {
            Ok(()) => err,
            Err(callback_err) => callback_err,
        }
    }

    // -----------------------------------------------------------------------
    // Callback delivery
    // -----------------------------------------------------------------------

    /// Fatal callback result: shut down and report
    pub fn callback_failure(&mut self, location: &str, reason: String) -> ReactorError {
        error!("{} failed: {}", location, reason);
        self.shutdown_internal();
        ReactorError::CallbackFailure {
            location: location.to_string(),
            reason,
        }
    }

    /// Deliver a channel event; anything but success shuts the reactor down
    pub fn emit(&mut self, event: ChannelEvent) -> Result<()> {
        let id = event.channel;
        let Some(channel) = self.channels.get(&id) else {
            return Ok(());
        };
        let callback = channel.role.callbacks().channel_event.clone();
        match &event.error {
            Some(error) => warn!("Channel {} {}: {}", id, event.event_type, error),
            None => info!("Channel {} {}", id, event.event_type),
        }

        let Some(callback) = callback else {
            return Ok(());
        };
        let ret = {
            let mut ctx = CallbackContext::new(self, id);
            callback(&mut ctx, &event)
        };
        match ret {
            CallbackReturn::Success => Ok(()),
            other => Err(self.callback_failure(
                "Reactor.channelEventCallback",
                format!("returned {:?} for {}", other, event.event_type),
            )),
        }
    }

    pub fn deliver_default(&mut self, event: &MsgEvent) -> Result<()> {
        let Some(channel) = self.channels.get(&event.channel) else {
            return Ok(());
        };
        let Some(callback) = channel.role.callbacks().default_msg.clone() else {
            return Ok(());
        };
        let ret = {
            let mut ctx = CallbackContext::new(self, event.channel);
            callback(&mut ctx, event)
        };
        if ret.is_failure() {
            return Err(self.callback_failure(
                "Reactor.defaultMsgCallback",
                format!("returned FAILURE for stream {}", event.msg.stream_id),
            ));
        }
        Ok(())
    }

    /// Apply a domain callback result: RAISE also reaches the default callback
    fn finish_domain_callback(
        &mut self,
        location: &str,
        ret: CallbackReturn,
        base: &MsgEvent,
    ) -> Result<()> {
        match ret {
            CallbackReturn::Success => Ok(()),
            CallbackReturn::Raise => self.deliver_default(base),
            CallbackReturn::Failure => Err(self.callback_failure(
                location,
                format!("returned FAILURE for stream {}", base.msg.stream_id),
            )),
        }
    }

    pub fn deliver_login(&mut self, event: &LoginMsgEvent) -> Result<()> {
        let id = event.base.channel;
        let callback = match self.channels.get(&id) {
            Some(channel) => channel.role.callbacks().login_msg.clone(),
            None => return Ok(()),
        };
        let ret = match callback {
            Some(callback) => callback(&mut CallbackContext::new(self, id), event),
            None => CallbackReturn::Raise,
        };
        self.finish_domain_callback("Reactor.loginMsgCallback", ret, &event.base)
    }

    pub fn deliver_directory(&mut self, event: &DirectoryMsgEvent) -> Result<()> {
        let id = event.base.channel;
        let callback = match self.channels.get(&id) {
            Some(channel) => channel.role.callbacks().directory_msg.clone(),
            None => return Ok(()),
        };
        let ret = match callback {
            Some(callback) => callback(&mut CallbackContext::new(self, id), event),
            None => CallbackReturn::Raise,
        };
        self.finish_domain_callback("Reactor.directoryMsgCallback", ret, &event.base)
    }

    pub fn deliver_dictionary(&mut self, event: &DictionaryMsgEvent) -> Result<()> {
        let id = event.base.channel;
        let callback = match self.channels.get(&id) {
            Some(channel) => channel.role.callbacks().dictionary_msg.clone(),
            None => return Ok(()),
        };
        let ret = match callback {
            Some(callback) => callback(&mut CallbackContext::new(self, id), event),
            None => CallbackReturn::Raise,
        };
        self.finish_domain_callback("Reactor.dictionaryMsgCallback", ret, &event.base)
    }

    #[cfg(test)]
    pub(crate) fn stop_worker(&mut self) {
        let _ = self.queue.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Connection reactor
///
/// # Example
///
/// ```rust,ignore
/// let network = LoopbackNetwork::new();
/// let mut reactor = Reactor::new(
///     ReactorOptions::default(),
///     Arc::new(network.clone()),
///     Arc::new(JsonFrameCodec),
/// )?;
/// let role = Role::consumer()
///     .with_login(LoginRequest::new("user"))
///     .on_channel_event(|_, event| { println!("{}", event.event_type); CallbackReturn::Success })
///     .on_default_msg(|_, _| CallbackReturn::Success);
/// let channel = reactor.connect(ConnectOptions::single(target), role)?;
/// loop {
///     reactor.dispatch(&DispatchOptions::default().with_timeout(Duration::from_millis(100)))?;
/// }
/// ```
pub struct Reactor {
    core: ReactorCore,
}

impl Reactor {
    /// Create a reactor and start its worker thread
    pub fn new(
        options: ReactorOptions,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn WireCodec>,
    ) -> Result<Self> {
        Ok(Self {
            core: ReactorCore::new(options, connector, codec)?,
        })
    }

    /// Open a client channel
    ///
    /// Emits CHANNEL_OPENED, then hands the handshake to the worker.
    /// Returns an error when the channel went down for good during the call.
    pub fn connect(&mut self, options: ConnectOptions, role: Role) -> Result<ChannelId> {
        self.core.connect(options, role)
    }

    /// Take a pending server side connection from `listener`
    pub fn accept(
        &mut self,
        listener: &dyn Listener,
        options: AcceptOptions,
        role: Role,
    ) -> Result<ChannelId> {
        self.core.accept(listener, options, role)
    }

    /// Deliver pending worker events and read ready channels
    ///
    /// Returns the number of events and messages processed. Waits up to the
    /// configured timeout when nothing is pending.
    pub fn dispatch(&mut self, options: &DispatchOptions) -> Result<usize> {
        self.core.dispatch(options)
    }

    /// Like [`Reactor::dispatch`], but reads only the given readiness handles
    pub fn dispatch_all(
        &mut self,
        ready: &[ReadinessHandle],
        options: &DispatchOptions,
    ) -> Result<usize> {
        self.core.dispatch_all(ready, options)
    }

    /// Like [`Reactor::dispatch`], but reads only one channel
    pub fn dispatch_channel(&mut self, id: ChannelId, options: &DispatchOptions) -> Result<usize> {
        self.core.dispatch_channel(id, options)
    }

    pub fn submit(
        &mut self,
        id: ChannelId,
        payload: impl Into<Payload>,
        options: &SubmitOptions,
    ) -> Result<SubmitStatus> {
        self.core.submit(id, payload.into(), options)
    }

    pub fn get_buffer(&mut self, id: ChannelId, size: usize, packed: bool) -> Result<TransportBuffer> {
        self.core.get_buffer(id, size, packed)
    }

    /// Seal the current message of a packed buffer; returns remaining capacity
    pub fn pack_buffer(&mut self, id: ChannelId, buffer: &mut TransportBuffer) -> Result<usize> {
        self.core.pack_buffer(id, buffer)
    }

    pub fn release_buffer(&mut self, id: ChannelId, buffer: TransportBuffer) -> Result<()> {
        self.core.release_buffer(id, buffer)
    }

    pub fn close_channel(&mut self, id: ChannelId) -> Result<()> {
        self.core.close_channel(id)
    }

    /// Move a channel back to its preferred target now
    pub fn fallback_preferred_host(&mut self, id: ChannelId) -> Result<()> {
        self.core.fallback_preferred_host(id)
    }

    pub fn channel_info(&self, id: ChannelId) -> Result<ChannelInfo> {
        self.core.ensure_running()?;
        self.core.channel(id).map(Channel::info)
    }

    pub fn channel_state(&self, id: ChannelId) -> Result<ChannelState> {
        self.core.ensure_running()?;
        self.core.channel(id).map(|c| c.state)
    }

    pub fn channel_stats(&self, id: ChannelId) -> Result<ChannelStats> {
        self.core.ensure_running()?;
        self.core.channel(id).map(|c| c.stats.clone())
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.core.channels.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Handles currently registered for readiness, for use with `dispatch_all`
    pub fn readiness_handles(&self) -> Vec<ReadinessHandle> {
        self.core.registry.registered_handles()
    }

    pub fn is_registered(&self, handle: ReadinessHandle) -> bool {
        self.core.registry.is_registered(handle)
    }

    pub fn user_spec(&self) -> Option<&serde_json::Value> {
        self.core.options.user_spec.as_ref()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown
    }

    /// Stop the worker and release every channel; safe to call repeatedly
    pub fn shutdown(&mut self) -> Result<()> {
        self.core.shutdown_internal();
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.core.shutdown_internal();
    }
}

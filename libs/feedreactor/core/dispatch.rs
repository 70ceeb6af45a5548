//! Dispatch loop
//!
//! One pass handles, in order:
//!
//! 1. events deferred by earlier calls and events posted by the worker
//! 2. reads from channels whose readiness fired, round robin, one message
//!    per channel per turn
//!
//! Both share the `max_messages` budget. When a pass finds nothing, the
//! call blocks on the worker queue and the readiness stream for at most
//! the dispatch timeout, then runs one more pass.

use crate::core::channel::ChannelId;
use crate::core::config::DispatchOptions;
use crate::core::events::{ChannelEvent, ChannelEventType};
use crate::core::reactor::ReactorCore;
use crate::core::state::ChannelState;
use crate::traits::error::{ErrorInfo, ReactorError, Result};
use crate::traits::transport::{ReadOutcome, ReadinessHandle};
use crate::worker::event::{WorkerCommand, WorkerEvent};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which channels a pass may read from
enum ReadScope {
    /// Whatever the readiness registry reports
    Registry,
    /// Only these channels
    Channels(Vec<ChannelId>),
}

impl ReactorCore {
    pub(crate) fn dispatch(&mut self, options: &DispatchOptions) -> Result<usize> {
        self.dispatch_scoped(ReadScope::Registry, options)
    }

    pub(crate) fn dispatch_all(
        &mut self,
        ready: &[ReadinessHandle],
        options: &DispatchOptions,
    ) -> Result<usize> {
        self.ensure_running()?;
        let mut channels = Vec::new();
        for handle in ready {
            match self.registry.resolve(*handle) {
                Some(id) if !channels.contains(&id) => channels.push(id),
                Some(_) => {}
                None => debug!("Ignoring unregistered handle {}", handle),
            }
        }
        self.dispatch_scoped(ReadScope::Channels(channels), options)
    }

    pub(crate) fn dispatch_channel(&mut self, id: ChannelId, options: &DispatchOptions) -> Result<usize> {
        self.ensure_running()?;
        let channel = self.channel(id)?;
        if channel.state.is_terminal() {
            return Err(ReactorError::ChannelInert(format!(
                "channel {} is {}",
                id, channel.state
            )));
        }
        self.dispatch_scoped(ReadScope::Channels(vec![id]), options)
    }

    fn dispatch_scoped(&mut self, scope: ReadScope, options: &DispatchOptions) -> Result<usize> {
        self.ensure_running()?;
        options.validate()?;

        let processed = self.dispatch_pass(&scope, options.max_messages)?;
        if processed > 0 || options.timeout_ms == 0 || self.shutdown {
            return Ok(processed);
        }
        if !self.wait_for_activity(options.timeout()) {
            return Ok(0);
        }
        self.dispatch_pass(&scope, options.max_messages)
    }

    /// Block until the worker posts an event or a transport becomes
    /// readable; returns false on timeout
    fn wait_for_activity(&mut self, timeout: Duration) -> bool {
        let events = self.queue.events().clone();
        let readiness = self.registry.receiver().clone();
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => {
                    self.deferred.push_back(event);
                    true
                }
                Err(_) => {
                    warn!("Worker event queue closed");
                    false
                }
            },
            recv(readiness) -> handle => {
                if let Ok(handle) = handle {
                    if let Some(id) = self.registry.resolve(handle) {
                        self.enqueue_ready(id);
                    }
                }
                true
            },
            default(timeout) => false,
        }
    }

    fn dispatch_pass(&mut self, scope: &ReadScope, budget: usize) -> Result<usize> {
        let mut processed = 0;

        while processed < budget {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => match self.queue.try_recv() {
                    Some(event) => event,
                    None => break,
                },
            };
            processed += 1;
            self.process_worker_event(event)?;
        }

        match scope {
            ReadScope::Registry => {
                for id in self.registry.drain_ready() {
                    self.enqueue_ready(id);
                }
                while processed < budget {
                    let Some(id) = self.ready_queue.pop_front() else {
                        break;
                    };
                    let (progressed, more) = self.read_channel(id)?;
                    if progressed {
                        processed += 1;
                        if more {
                            self.enqueue_ready(id);
                        }
                    }
                }
            }
            ReadScope::Channels(channels) => {
                let mut turn: VecDeque<ChannelId> = channels.iter().copied().collect();
                while processed < budget {
                    let Some(id) = turn.pop_front() else {
                        break;
                    };
                    let (progressed, more) = self.read_channel(id)?;
                    if progressed {
                        processed += 1;
                        if more {
                            turn.push_back(id);
                        }
                    }
                }
                // Left for a later unscoped dispatch
                for id in turn {
                    self.enqueue_ready(id);
                }
            }
        }

        Ok(processed)
    }

    /// Read one unit from a channel; returns (made progress, more to read)
    fn read_channel(&mut self, id: ChannelId) -> Result<(bool, bool)> {
        let Some(channel) = self.channels.get(&id) else {
            return Ok((false, false));
        };
        if !channel.state.is_active() {
            return Ok((false, false));
        }
        let Some(transport) = channel.transport() else {
            return Ok((false, false));
        };
        let epoch = channel.epoch;
        let ping = channel.ping.clone();

        match transport.read() {
            Ok(ReadOutcome::Message(bytes)) => {
                ping.record_received();
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.stats.messages_read += 1;
                }
                match self.codec.decode(&bytes) {
                    Ok(msg) => self.process_inbound(id, msg, bytes)?,
                    Err(e) => {
                        if let Some(channel) = self.channels.get_mut(&id) {
                            channel.stats.decode_failures += 1;
                        }
                        let err = ReactorError::from(e);
                        self.emit(
                            ChannelEvent::new(ChannelEventType::Warning, id)
                                .with_error(ErrorInfo::from_error("Reactor.decode", &err)),
                        )?;
                    }
                }
                Ok((true, self.is_live(id, epoch) && transport.readable()))
            }
            Ok(ReadOutcome::Ping) => {
                ping.record_received();
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.stats.pings_received += 1;
                }
                debug!("Channel {} received ping", id);
                Ok((true, transport.readable()))
            }
            Ok(ReadOutcome::WouldBlock) => Ok((false, false)),
            Ok(ReadOutcome::HandleChanged { old, new }) => {
                self.handle_fd_change(id, old, new)?;
                Ok((true, self.is_live(id, epoch) && transport.readable()))
            }
            Err(e) => {
                warn!("Channel {} read failed: {}", id, e);
                let err = ReactorError::from(e);
                self.channel_down(id, ErrorInfo::from_error("Reactor.read", &err))?;
                Ok((true, false))
            }
        }
    }

    /// The transport moved to a new readiness handle
    fn handle_fd_change(
        &mut self,
        id: ChannelId,
        old: ReadinessHandle,
        new: ReadinessHandle,
    ) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let Some(transport) = channel.transport() else {
            return Ok(());
        };
        self.registry.cancel(old);
        let notifier = self.registry.register(new, id);
        channel.readiness = Some(new);
        let epoch = channel.epoch;
        transport.register_readiness(notifier);
        info!("Channel {} readiness handle {} -> {}", id, old, new);

        if let Err(e) = self.queue.send(WorkerCommand::FdChange {
            channel: id,
            epoch,
            new_handle: new,
        }) {
            return Err(self.worker_queue_failure(id, e));
        }
        self.emit(ChannelEvent::fd_change(id, old, new))
    }

    pub(crate) fn process_worker_event(&mut self, event: WorkerEvent) -> Result<()> {
        let id = event.channel();
        let Some(channel) = self.channels.get(&id) else {
            debug!("Dropping {:?} for closed channel", event);
            return Ok(());
        };
        if channel.epoch != event.epoch() {
            debug!(
                "Dropping stale event for channel {} (epoch {} != {})",
                id,
                event.epoch(),
                channel.epoch
            );
            return Ok(());
        }

        match event {
            WorkerEvent::ChannelUp { ping_timeout, .. } => self.on_transport_up(id, ping_timeout),
            WorkerEvent::FlushDone { .. } => self.on_flush_done(id),
            WorkerEvent::PingTimerExpired { timeout, .. } => {
                let err = ReactorError::PingTimeout(timeout.as_millis() as u64);
                self.channel_down(id, ErrorInfo::from_error("Reactor.ping", &err))
            }
            WorkerEvent::InitTimeout { timeout, .. } => {
                let err = ReactorError::InitializationTimeout(timeout.as_millis() as u64);
                self.channel_down(id, ErrorInfo::from_error("Reactor.initializeChannel", &err))
            }
            WorkerEvent::ReconnectTimerExpired { .. } => self.on_reconnect_timer(id),
            WorkerEvent::FallbackTimerExpired { .. } => self.on_fallback_timer(id),
            WorkerEvent::ChannelDown { error, .. } => self.channel_down(id, error),
        }
    }

    /// Handshake finished: register for reads and start the session
    fn on_transport_up(&mut self, id: ChannelId, ping_timeout: Duration) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.state != ChannelState::Initializing {
            return Ok(());
        }
        let Some(transport) = channel.transport() else {
            return Ok(());
        };

        channel.ping_timeout = Some(ping_timeout);
        channel.reconnect_attempts = 0;
        let handle = transport.readiness_handle();
        let notifier = self.registry.register(handle, id);
        channel.readiness = Some(handle);
        channel.transition(ChannelState::Up);
        if let Some(origin) = channel.current_origin() {
            channel.standby.on_connected(origin);
        }
        let epoch = channel.epoch;
        transport.register_readiness(notifier);

        self.emit(ChannelEvent::new(ChannelEventType::ChannelUp, id))?;
        if !self.is_live(id, epoch) {
            return Ok(());
        }
        self.on_session_up(id)
    }
}

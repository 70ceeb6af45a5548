//! Connection recovery
//!
//! ```text
//! INITIALIZING/UP/READY ──failure──► DOWN_RECONNECTING ──timer──► INITIALIZING
//!          │                              │
//!          │ no attempts left             │ scheduling failed
//!          ▼                              ▼
//!        DOWN ◄───────────────────────────┘
//! ```
//!
//! Every failure advances the target cursor, so successive attempts walk
//! the warm standby members and the connection list in order.

use crate::core::channel::{ChannelId, FlushState};
use crate::core::events::{ChannelEvent, ChannelEventType};
use crate::core::reactor::ReactorCore;
use crate::core::state::ChannelState;
use crate::core::submit::Payload;
use crate::core::config::SubmitOptions;
use crate::traits::error::{ErrorInfo, ReactorError, Result};
use crate::worker::event::WorkerCommand;
use tracing::{debug, info, warn};

impl ReactorCore {
    /// Open a transport to the cursor's current target and hand the
    /// handshake to the worker
    pub(crate) fn start_connection(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let Some(slot) = channel.cursor.as_ref().map(|c| c.current().clone()) else {
            return Ok(());
        };
        channel.epoch += 1;
        channel.transition(ChannelState::Initializing);
        channel.ping.reset();
        channel.ping_timeout = None;
        channel.flush = FlushState::default();
        channel.session.reset();
        channel.init_timeout = slot.target.init_timeout();
        let epoch = channel.epoch;
        info!(
            "Channel {} connecting to {} ({}), epoch {}",
            id,
            slot.target.endpoint(),
            slot.origin,
            epoch
        );

        let transport = match self.connector.connect(&slot.target) {
            Ok(transport) => transport,
            Err(e) => {
                let err = ReactorError::from(e);
                warn!("Channel {} connect to {} failed: {}", id, slot.target.endpoint(), err);
                return self.channel_down(id, ErrorInfo::from_error("Reactor.connect", &err));
            }
        };

        let Some(channel) = self.channels.get_mut(&id) else {
            transport.close();
            return Ok(());
        };
        channel.transport = Some(transport.clone());
        let command = WorkerCommand::NewChannel {
            channel: id,
            epoch,
            transport,
            init_timeout: channel.init_timeout,
            ping: channel.ping.clone(),
        };
        if let Err(e) = self.queue.send(command) {
            return Err(self.worker_queue_failure(id, e));
        }
        Ok(())
    }

    /// Tear down the current connection and either schedule recovery or
    /// finish the channel; repeated failures of one connection are ignored
    pub(crate) fn channel_down(&mut self, id: ChannelId, error: ErrorInfo) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if !channel.state.can_go_down() {
            debug!("Channel {} already {}, ignoring failure", id, channel.state);
            return Ok(());
        }

        // Deregister before the application hears about it
        if let Some(handle) = channel.readiness.take() {
            self.registry.cancel(handle);
        }
        let transport = channel.transport.take();
        channel.ping.reset();
        channel.flush = FlushState::default();
        channel.session.reset();
        if channel.preferred.fallback_in_progress() {
            warn!("Channel {} preferred host fallback failed", id);
            channel.preferred.abandon();
        }

        let reconnect = !channel.server && channel.recovery.should_reconnect(channel.reconnect_attempts);
        let (state, event_type) = if reconnect {
            (ChannelState::DownReconnecting, ChannelEventType::ChannelDownReconnecting)
        } else {
            (ChannelState::Down, ChannelEventType::ChannelDown)
        };
        channel.transition(state);

        if let Some(transport) = transport {
            transport.close();
        }
        if let Err(e) = self.queue.send(WorkerCommand::ChannelDown { channel: id }) {
            debug!("Worker not told about channel {} going down: {}", id, e);
        }
        self.ready_queue.retain(|c| *c != id);

        self.emit(ChannelEvent::new(event_type, id).with_error(error))?;
        if reconnect {
            self.schedule_reconnect(id)?;
        }
        Ok(())
    }

    /// Arm the backoff timer for the next attempt
    fn schedule_reconnect(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.state != ChannelState::DownReconnecting {
            return Ok(());
        }
        let delay = channel
            .recovery
            .next_delay(channel.reconnect_attempts)
            .unwrap_or_default();
        channel.reconnect_attempts += 1;
        if let Some(cursor) = channel.cursor.as_mut() {
            let next = cursor.advance();
            info!(
                "Channel {} reconnect attempt {} to {} in {:?}",
                id,
                channel.reconnect_attempts,
                next.target.endpoint(),
                delay
            );
        }
        let epoch = channel.epoch;

        if let Err(e) = self.queue.send(WorkerCommand::ArmReconnect {
            channel: id,
            epoch,
            delay,
        }) {
            warn!("Channel {} could not schedule reconnect: {}", id, e);
            if let Some(channel) = self.channels.get_mut(&id) {
                channel.transition(ChannelState::Down);
            }
            self.emit(
                ChannelEvent::new(ChannelEventType::ChannelDown, id)
                    .with_error(ErrorInfo::from_error("Reactor.reconnect", &e)),
            )?;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn on_reconnect_timer(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.state != ChannelState::DownReconnecting {
            return Ok(());
        }
        channel.stats.reconnects += 1;
        self.start_connection(id)
    }

    /// Re-send every open request after a reconnection
    ///
    /// Service names are resolved against the new connection's directory. A
    /// stream that cannot be re-sent raises one WARNING and stays open for
    /// the next reconnection; the remaining streams are still replayed.
    pub(crate) fn replay_subscriptions(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get(&id) else {
            return Ok(());
        };
        let epoch = channel.epoch;
        let requests = channel.subscriptions.replay();
        info!("Channel {} replaying {} open requests", id, requests.len());

        for request in requests {
            let stream_id = request.msg.stream_id;
            let options = SubmitOptions {
                service_name: request.service_name,
            };
            match self.submit(id, Payload::Msg(request.msg), &options) {
                Ok(_) => {}
                Err(e @ (ReactorError::Shutdown | ReactorError::CallbackFailure { .. })) => {
                    return Err(e)
                }
                Err(e) => {
                    warn!("Channel {} replay of stream {} failed: {}", id, stream_id, e);
                    self.emit(ChannelEvent::new(ChannelEventType::Warning, id).with_error(
                        ErrorInfo::new(
                            e.code(),
                            "Reactor.replay",
                            format!("stream {}: {}", stream_id, e),
                        ),
                    ))?;
                }
            }
            if !self.is_live(id, epoch) {
                break;
            }
        }
        Ok(())
    }

    /// Arm the periodic check for a return to the preferred target
    pub(crate) fn arm_preferred_host_detection(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get(&id) else {
            return Ok(());
        };
        let (Some(position), Some(delay)) =
            (channel.position(), channel.preferred.detection_interval())
        else {
            return Ok(());
        };
        if !channel.preferred.needs_fallback(position) {
            return Ok(());
        }
        let epoch = channel.epoch;
        debug!("Channel {} preferred host check in {:?}", id, delay);
        if let Err(e) = self.queue.send(WorkerCommand::ArmFallback {
            channel: id,
            epoch,
            delay,
        }) {
            return Err(self.worker_queue_failure(id, e));
        }
        Ok(())
    }

    pub(crate) fn on_fallback_timer(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get(&id) else {
            return Ok(());
        };
        if channel.state != ChannelState::Ready {
            return Ok(());
        }
        match channel.position() {
            Some(position) if channel.preferred.needs_fallback(position) => self.start_fallback(id),
            _ => Ok(()),
        }
    }

    /// Application initiated return to the preferred target
    pub(crate) fn fallback_preferred_host(&mut self, id: ChannelId) -> Result<()> {
        self.ensure_running()?;
        let channel = self.channel(id)?;
        if !channel.preferred.is_enabled() {
            return Err(ReactorError::ParameterInvalid(format!(
                "preferred host is not enabled on channel {}",
                id
            )));
        }
        if !channel.state.is_active() {
            return Err(ReactorError::ChannelInert(format!(
                "channel {} is {}",
                id, channel.state
            )));
        }
        match channel.position() {
            Some(position) if channel.preferred.needs_fallback(position) => self.start_fallback(id),
            _ => {
                debug!("Channel {} already on its preferred target", id);
                Ok(())
            }
        }
    }

    /// Drop the current connection without a down event and reconnect to
    /// the preferred target
    fn start_fallback(&mut self, id: ChannelId) -> Result<()> {
        let Some(epoch) = self.epoch_of(id) else {
            return Ok(());
        };
        self.emit(ChannelEvent::new(
            ChannelEventType::PreferredHostStartingFallback,
            id,
        ))?;
        if !self.is_live(id, epoch) {
            return Ok(());
        }

        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let Some(position) = channel.preferred.begin_fallback() else {
            return Ok(());
        };
        if let Some(handle) = channel.readiness.take() {
            self.registry.cancel(handle);
        }
        if let Some(transport) = channel.transport.take() {
            transport.close();
        }
        if let Some(cursor) = channel.cursor.as_mut() {
            cursor.move_to(position);
        }
        channel.reconnect_attempts = 0;
        self.ready_queue.retain(|c| *c != id);
        info!("Channel {} falling back to preferred target", id);

        if let Err(e) = self.queue.send(WorkerCommand::ChannelDown { channel: id }) {
            return Err(self.worker_queue_failure(id, e));
        }
        self.start_connection(id)
    }
}

//! Submit path: encode, write, and request flushes from the worker

use crate::core::channel::ChannelId;
use crate::core::config::SubmitOptions;
use crate::core::reactor::ReactorCore;
use crate::rdm::RdmMsg;
use crate::traits::codec::{CodecError, Msg};
use crate::traits::error::{ErrorInfo, ReactorError, Result};
use crate::traits::transport::{Transport, TransportBuffer, WriteOutcome};
use crate::worker::event::{WorkerCommand, WorkerEvent};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the application hands to `submit`
#[derive(Debug)]
pub enum Payload {
    /// Pre-encoded bytes from `get_buffer`
    Buffer(TransportBuffer),
    /// A message for the reactor to encode
    Msg(Msg),
    /// A session control record for the reactor to encode
    Rdm(RdmMsg),
}

impl From<Msg> for Payload {
    fn from(msg: Msg) -> Self {
        Payload::Msg(msg)
    }
}

impl From<RdmMsg> for Payload {
    fn from(msg: RdmMsg) -> Self {
        Payload::Rdm(msg)
    }
}

impl From<TransportBuffer> for Payload {
    fn from(buffer: TransportBuffer) -> Self {
        Payload::Buffer(buffer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Success,
    /// Accepted, but the transport is congested; back off until flushed
    WriteCallAgain,
}

impl ReactorCore {
    pub(crate) fn submit(
        &mut self,
        id: ChannelId,
        payload: Payload,
        options: &SubmitOptions,
    ) -> Result<SubmitStatus> {
        self.ensure_running()?;
        let transport = self.active_transport(id)?;

        let (buffer, sent) = match payload {
            Payload::Buffer(buffer) => (buffer, None),
            Payload::Msg(msg) => {
                let msg = self.resolve_service(id, msg, options)?;
                (self.encode(&transport, &msg)?, Some(msg))
            }
            Payload::Rdm(rdm) => {
                let msg = self.resolve_service(id, rdm.to_msg()?, options)?;
                (self.encode(&transport, &msg)?, Some(msg))
            }
        };
        let status = self.write_buffer(id, &transport, buffer)?;

        // Only streams that reached the transport are replayed after failover
        if let (Some(msg), Some(channel)) = (sent, self.channels.get_mut(&id)) {
            channel
                .subscriptions
                .record(&msg, options.service_name.as_deref());
        }
        Ok(status)
    }

    /// Address the message to the service named in the options
    fn resolve_service(&self, id: ChannelId, mut msg: Msg, options: &SubmitOptions) -> Result<Msg> {
        let channel = self.channel(id)?;
        if let Some(name) = &options.service_name {
            let service_id = channel.session.service_id(name).ok_or_else(|| {
                ReactorError::ParameterInvalid(format!(
                    "service {} is not in the directory of channel {}",
                    name, id
                ))
            })?;
            msg.service_id = Some(service_id);
        }
        Ok(msg)
    }

    /// Encode into a transport buffer, growing it until the message fits
    fn encode(&self, transport: &Arc<dyn Transport>, msg: &Msg) -> Result<TransportBuffer> {
        let max = transport.max_buffer_size();
        let mut size = self.codec.encoded_size_hint(msg).clamp(1, max.max(1));
        loop {
            let mut buffer = transport.get_buffer(size, false)?;
            match self.codec.encode(msg, &mut buffer) {
                Ok(()) => return Ok(buffer),
                Err(CodecError::BufferTooSmall { needed, .. }) => {
                    transport.release_buffer(buffer);
                    if size >= max {
                        return Err(ReactorError::BufferTooSmall(needed));
                    }
                    let grown = size.saturating_mul(2).max(needed).min(max);
                    debug!("Encode buffer grown from {} to {} bytes", size, grown);
                    size = grown;
                }
                Err(e) => {
                    transport.release_buffer(buffer);
                    return Err(e.into());
                }
            }
        }
    }

    fn write_buffer(
        &mut self,
        id: ChannelId,
        transport: &Arc<dyn Transport>,
        buffer: TransportBuffer,
    ) -> Result<SubmitStatus> {
        let outcome = transport.write(buffer);
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(ReactorError::UnknownChannel(id.0));
        };
        match outcome {
            Ok(outcome) => {
                channel.ping.record_sent();
                channel.stats.messages_written += 1;
                match outcome {
                    WriteOutcome::Complete => Ok(SubmitStatus::Success),
                    WriteOutcome::Pending(pending) => {
                        debug!("Channel {} has {} bytes pending", id, pending);
                        self.request_flush(id)?;
                        Ok(SubmitStatus::Success)
                    }
                    WriteOutcome::CallAgain(pending) => {
                        debug!("Channel {} congested with {} bytes pending", id, pending);
                        self.request_flush(id)?;
                        Ok(SubmitStatus::WriteCallAgain)
                    }
                }
            }
            Err(e) => {
                let err = ReactorError::from(e);
                warn!("Channel {} write failed: {}", id, err);
                self.deferred.push_back(WorkerEvent::ChannelDown {
                    channel: id,
                    epoch: channel.epoch,
                    error: ErrorInfo::from_error("Reactor.submit", &err),
                });
                Err(err)
            }
        }
    }

    /// Ask the worker to flush; a request made while one is running is
    /// folded into a single follow-up cycle
    pub(crate) fn request_flush(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.flush.requested {
            channel.flush.again = true;
            return Ok(());
        }
        channel.flush.requested = true;
        channel.stats.flushes_requested += 1;
        let epoch = channel.epoch;
        if let Err(e) = self.queue.send(WorkerCommand::FlushRequest { channel: id, epoch }) {
            return Err(self.worker_queue_failure(id, e));
        }
        Ok(())
    }

    pub(crate) fn on_flush_done(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        channel.flush.requested = false;
        channel.stats.flushes_completed += 1;
        if channel.flush.again {
            channel.flush.again = false;
            return self.request_flush(id);
        }
        Ok(())
    }

    pub(crate) fn get_buffer(&mut self, id: ChannelId, size: usize, packed: bool) -> Result<TransportBuffer> {
        self.ensure_running()?;
        if size == 0 {
            return Err(ReactorError::ParameterInvalid(
                "buffer size must be positive".to_string(),
            ));
        }
        let transport = self.active_transport(id)?;
        Ok(transport.get_buffer(size, packed)?)
    }

    pub(crate) fn pack_buffer(&mut self, id: ChannelId, buffer: &mut TransportBuffer) -> Result<usize> {
        self.ensure_running()?;
        let transport = self.active_transport(id)?;
        Ok(transport.pack(buffer)?)
    }

    /// Return an unsubmitted buffer; buffers of inactive channels are dropped
    pub(crate) fn release_buffer(&mut self, id: ChannelId, buffer: TransportBuffer) -> Result<()> {
        self.ensure_running()?;
        match self.active_transport(id) {
            Ok(transport) => transport.release_buffer(buffer),
            Err(ReactorError::UnknownChannel(channel)) => {
                return Err(ReactorError::UnknownChannel(channel))
            }
            Err(_) => debug!("Channel {} inactive, dropping released buffer", id),
        }
        Ok(())
    }
}

//! Session setup pipeline
//!
//! Drives a channel from UP to READY by exchanging the configured session
//! messages. The order for a consumer:
//!
//! ```text
//! CHANNEL_UP
//!     │ login request
//!     ▼
//! login refresh (OPEN/OK) ──► directory request (if configured)
//!     │                            │
//!     │ no directory               ▼
//!     │                      directory refresh ──► dictionary requests (if downloading)
//!     │                            │                     │
//!     ▼                            ▼                     ▼
//! CHANNEL_READY ◄──────────────────┴─────────── both dictionaries complete
//! ```
//!
//! Session messages are still delivered to the application callbacks; the
//! pipeline only decides what to send next.

use crate::core::channel::ChannelId;
use crate::core::config::SubmitOptions;
use crate::core::events::{
    ChannelEvent, ChannelEventType, DictionaryMsgEvent, DirectoryMsgEvent, LoginMsgEvent, MsgEvent,
};
use crate::core::reactor::ReactorCore;
use crate::core::state::ChannelState;
use crate::core::submit::Payload;
use crate::rdm::{
    ends_stream, find_dictionary_service, DictionaryMsg, DictionaryRequest, DirectoryMsg, LoginMsg,
    RdmMsg, ServiceInfo, DIRECTORY_STREAM_ID, ENUM_DICTIONARY_STREAM_ID,
    FIELD_DICTIONARY_STREAM_ID, LOGIN_STREAM_ID,
};
use crate::session::role::{DictionaryDownloadMode, RoleKind};
use crate::traits::codec::{DomainType, Msg};
use crate::traits::error::{ErrorInfo, ReactorError, Result};
use tracing::{debug, info, warn};

/// Which session response the pipeline is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetupStage {
    #[default]
    Idle,
    Login,
    Directory,
    Dictionary,
    Done,
}

/// Per-connection session state, reset whenever the connection is lost
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionProgress {
    pub stage: SetupStage,
    /// Services from the latest directory refresh and updates
    pub services: Vec<ServiceInfo>,
    pub dictionary_service: Option<u16>,
    pub field_dictionary_received: bool,
    pub enum_dictionary_received: bool,
}

impl SessionProgress {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn service_id(&self, name: &str) -> Option<u16> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.service_id)
    }

    /// Merge a directory update into the known services
    fn merge_services(&mut self, services: &[ServiceInfo]) {
        for service in services {
            match self
                .services
                .iter_mut()
                .find(|s| s.service_id == service.service_id)
            {
                Some(existing) => *existing = service.clone(),
                None => self.services.push(service.clone()),
            }
        }
    }
}

/// Errors that end the dispatch call instead of the channel
fn is_fatal(err: &ReactorError) -> bool {
    matches!(
        err,
        ReactorError::Shutdown | ReactorError::CallbackFailure { .. }
    )
}

impl ReactorCore {
    /// Entry point once the transport handshake finished
    pub(crate) fn on_session_up(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let role = channel.role.clone();
        let login = match role.kind() {
            RoleKind::Consumer(consumer) => consumer.login_request.clone().map(|mut login| {
                login.supports_rtt |= consumer.rtt;
                login
            }),
            RoleKind::NiProvider(ni) => ni.login_request.clone(),
            RoleKind::Provider => None,
        };

        match login {
            Some(login) => {
                channel.session.stage = SetupStage::Login;
                debug!("Channel {} sending login for {}", id, login.user_name);
                self.submit_session(id, RdmMsg::Login(LoginMsg::Request(login)), "Reactor.sendLogin")
            }
            None => self.channel_ready(id),
        }
    }

    /// Submit a session message; failures take the channel down
    fn submit_session(&mut self, id: ChannelId, msg: RdmMsg, location: &str) -> Result<()> {
        match self.submit(id, Payload::Rdm(msg), &SubmitOptions::default()) {
            Ok(_) => Ok(()),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                warn!("Channel {} session message failed: {}", id, e);
                self.channel_down(id, ErrorInfo::from_error(location, &e))
            }
        }
    }

    /// Route one decoded inbound message
    pub(crate) fn process_inbound(&mut self, id: ChannelId, msg: Msg, raw: Vec<u8>) -> Result<()> {
        let base = MsgEvent {
            channel: id,
            msg,
            raw,
        };
        match base.msg.domain {
            DomainType::Login => self.process_login(base),
            DomainType::Source => self.process_directory(base),
            DomainType::Dictionary => self.process_dictionary(base),
            _ => {
                if ends_stream(&base.msg) {
                    if let Some(channel) = self.channels.get_mut(&id) {
                        if channel.subscriptions.forget(base.msg.stream_id) {
                            debug!("Channel {} stream {} closed by provider", id, base.msg.stream_id);
                        }
                    }
                }
                self.deliver_default(&base)
            }
        }
    }

    fn session_warning(&mut self, id: ChannelId, location: &str, text: String) -> Result<()> {
        warn!("Channel {} {}", id, text);
        self.emit(
            ChannelEvent::new(ChannelEventType::Warning, id)
                .with_error(ErrorInfo::failure(location, text)),
        )
    }

    /// True while the pipeline on this connection still waits for `stage`
    fn awaiting(&self, id: ChannelId, epoch: u64, stage: SetupStage) -> bool {
        self.is_live(id, epoch)
            && self.channels.get(&id).map_or(false, |c| {
                c.state == ChannelState::Up && c.session.stage == stage
            })
    }

    fn process_login(&mut self, base: MsgEvent) -> Result<()> {
        let id = base.channel;
        let Some(epoch) = self.epoch_of(id) else {
            return Ok(());
        };
        let login = match LoginMsg::from_msg(&base.msg) {
            Ok(login) => login,
            Err(e) => {
                return self.session_warning(
                    id,
                    "Reactor.processLoginMsg",
                    format!("undecodable login message: {}", e),
                )
            }
        };

        if matches!(login, LoginMsg::Rtt(_)) && !self.handle_rtt(id, &base.msg)? {
            return Ok(());
        }

        let event = LoginMsgEvent { base, login };
        self.deliver_login(&event)?;
        if !self.awaiting(id, epoch, SetupStage::Login) {
            return Ok(());
        }

        let LoginMsg::Refresh(refresh) = &event.login else {
            return Ok(());
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let login_stream = channel
            .role
            .login_request()
            .map_or(LOGIN_STREAM_ID, |l| l.stream_id);
        if refresh.stream_id != login_stream {
            return Ok(());
        }
        if !refresh.state.is_open_ok() {
            warn!(
                "Channel {} login not accepted: {}",
                id, refresh.state.text
            );
            return Ok(());
        }
        info!("Channel {} logged in as {}", id, refresh.user_name);

        let role = channel.role.clone();
        match role.kind() {
            RoleKind::Consumer(consumer) => match &consumer.directory_request {
                Some(request) => {
                    channel.session.stage = SetupStage::Directory;
                    self.submit_session(
                        id,
                        RdmMsg::Directory(DirectoryMsg::Request(request.clone())),
                        "Reactor.sendDirectoryRequest",
                    )
                }
                None => self.channel_ready(id),
            },
            RoleKind::NiProvider(ni) => {
                if let Some(refresh) = &ni.directory_refresh {
                    self.submit_session(
                        id,
                        RdmMsg::Directory(DirectoryMsg::Refresh(refresh.clone())),
                        "Reactor.sendDirectoryRefresh",
                    )?;
                    if !self.awaiting(id, epoch, SetupStage::Login) {
                        return Ok(());
                    }
                }
                self.channel_ready(id)
            }
            RoleKind::Provider => Ok(()),
        }
    }

    /// Apply the round trip latency policy; returns whether the message is
    /// also delivered to the application
    fn handle_rtt(&mut self, id: ChannelId, msg: &Msg) -> Result<bool> {
        let Some(channel) = self.channels.get(&id) else {
            return Ok(false);
        };
        let role = channel.role.clone();
        match role.kind() {
            RoleKind::Provider => Ok(true),
            RoleKind::Consumer(consumer) if consumer.rtt => {
                match self.submit(id, Payload::Msg(msg.clone()), &SubmitOptions::default()) {
                    Ok(_) => debug!("Channel {} echoed RTT message", id),
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => warn!("Channel {} RTT echo failed: {}", id, e),
                }
                Ok(true)
            }
            _ => {
                debug!("Channel {} dropping RTT message", id);
                Ok(false)
            }
        }
    }

    fn process_directory(&mut self, base: MsgEvent) -> Result<()> {
        let id = base.channel;
        let Some(epoch) = self.epoch_of(id) else {
            return Ok(());
        };
        let directory = match DirectoryMsg::from_msg(&base.msg) {
            Ok(directory) => directory,
            Err(e) => {
                return self.session_warning(
                    id,
                    "Reactor.processDirectoryMsg",
                    format!("undecodable directory message: {}", e),
                )
            }
        };

        if let Some(channel) = self.channels.get_mut(&id) {
            match &directory {
                DirectoryMsg::Refresh(refresh) => channel.session.services = refresh.services.clone(),
                DirectoryMsg::Update(update) => channel.session.merge_services(&update.services),
                _ => {}
            }
        }

        let event = DirectoryMsgEvent { base, directory };
        self.deliver_directory(&event)?;
        if !self.awaiting(id, epoch, SetupStage::Directory) {
            return Ok(());
        }

        let DirectoryMsg::Refresh(refresh) = &event.directory else {
            return Ok(());
        };
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let role = channel.role.clone();
        let RoleKind::Consumer(consumer) = role.kind() else {
            return Ok(());
        };
        let directory_stream = consumer
            .directory_request
            .as_ref()
            .map_or(DIRECTORY_STREAM_ID, |d| d.stream_id);
        if refresh.stream_id != directory_stream {
            return Ok(());
        }

        match consumer.dictionary_download {
            DictionaryDownloadMode::None => self.channel_ready(id),
            DictionaryDownloadMode::FirstAvailable => {
                let service = find_dictionary_service(
                    &channel.session.services,
                    &consumer.field_dictionary_name,
                    &consumer.enum_dictionary_name,
                );
                let Some(service_id) = service else {
                    self.session_warning(
                        id,
                        "Reactor.processDirectoryMsg",
                        "Dictionary download not supported by the indicated provider".to_string(),
                    )?;
                    if !self.awaiting(id, epoch, SetupStage::Directory) {
                        return Ok(());
                    }
                    return self.channel_ready(id);
                };

                info!("Channel {} downloading dictionaries from service {}", id, service_id);
                channel.session.stage = SetupStage::Dictionary;
                channel.session.dictionary_service = Some(service_id);
                let requests = [
                    DictionaryRequest::new(
                        FIELD_DICTIONARY_STREAM_ID,
                        service_id,
                        consumer.field_dictionary_name.clone(),
                    ),
                    DictionaryRequest::new(
                        ENUM_DICTIONARY_STREAM_ID,
                        service_id,
                        consumer.enum_dictionary_name.clone(),
                    ),
                ];
                for request in requests {
                    self.submit_session(
                        id,
                        RdmMsg::Dictionary(DictionaryMsg::Request(request)),
                        "Reactor.sendDictionaryRequest",
                    )?;
                    if !self.awaiting(id, epoch, SetupStage::Dictionary) {
                        return Ok(());
                    }
                }
                Ok(())
            }
        }
    }

    fn process_dictionary(&mut self, base: MsgEvent) -> Result<()> {
        let id = base.channel;
        let Some(epoch) = self.epoch_of(id) else {
            return Ok(());
        };
        let dictionary = match DictionaryMsg::from_msg(&base.msg) {
            Ok(dictionary) => dictionary,
            Err(e) => {
                return self.session_warning(
                    id,
                    "Reactor.processDictionaryMsg",
                    format!("undecodable dictionary message: {}", e),
                )
            }
        };

        let event = DictionaryMsgEvent { base, dictionary };
        self.deliver_dictionary(&event)?;
        if !self.awaiting(id, epoch, SetupStage::Dictionary) {
            return Ok(());
        }

        let DictionaryMsg::Refresh(refresh) = &event.dictionary else {
            return Ok(());
        };
        if !refresh.complete {
            return Ok(());
        }
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        match refresh.stream_id {
            FIELD_DICTIONARY_STREAM_ID => channel.session.field_dictionary_received = true,
            ENUM_DICTIONARY_STREAM_ID => channel.session.enum_dictionary_received = true,
            other => {
                debug!("Channel {} ignoring dictionary stream {}", id, other);
                return Ok(());
            }
        }
        if !(channel.session.field_dictionary_received && channel.session.enum_dictionary_received) {
            return Ok(());
        }

        info!("Channel {} dictionaries downloaded", id);
        for stream_id in [FIELD_DICTIONARY_STREAM_ID, ENUM_DICTIONARY_STREAM_ID] {
            self.submit_session(
                id,
                RdmMsg::Dictionary(DictionaryMsg::Close { stream_id }),
                "Reactor.sendDictionaryClose",
            )?;
            if !self.awaiting(id, epoch, SetupStage::Dictionary) {
                return Ok(());
            }
        }
        self.channel_ready(id)
    }

    /// Enter READY: notify, replay subscriptions, and look after the
    /// preferred host
    pub(crate) fn channel_ready(&mut self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let epoch = channel.epoch;
        channel.session.stage = SetupStage::Done;
        channel.transition(ChannelState::Ready);
        channel.ready_cycles += 1;
        let replay = channel.ready_cycles > 1 && !channel.subscriptions.is_empty();
        let fallback_complete = match channel.position() {
            Some(position) => channel.preferred.complete_if_preferred(position),
            None => false,
        };

        self.emit(ChannelEvent::new(ChannelEventType::ChannelReady, id))?;
        if !self.is_live(id, epoch) {
            return Ok(());
        }
        if replay {
            self.replay_subscriptions(id)?;
            if !self.is_live(id, epoch) {
                return Ok(());
            }
        }
        if fallback_complete {
            self.emit(ChannelEvent::new(ChannelEventType::PreferredHostComplete, id))?;
            if !self.is_live(id, epoch) {
                return Ok(());
            }
        }
        self.arm_preferred_host_detection(id)
    }
}

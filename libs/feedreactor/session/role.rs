//! Channel roles and their callbacks
//!
//! A role decides which session setup exchanges the reactor performs on a
//! channel and which application callbacks receive its events. Roles are
//! built once, handed to `connect`/`accept`, and shared by reference with
//! the channel from then on.

use crate::core::events::{ChannelEvent, DictionaryMsgEvent, DirectoryMsgEvent, LoginMsgEvent, MsgEvent};
use crate::core::reactor::CallbackContext;
use crate::rdm::{
    DirectoryRefresh, DirectoryRequest, LoginRequest, DEFAULT_ENUM_DICTIONARY_NAME,
    DEFAULT_FIELD_DICTIONARY_NAME,
};
use crate::traits::callback::CallbackReturn;
use crate::traits::error::{ReactorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type ChannelEventCallback =
    Arc<dyn Fn(&mut CallbackContext<'_>, &ChannelEvent) -> CallbackReturn + Send + Sync>;
pub type DefaultMsgCallback =
    Arc<dyn Fn(&mut CallbackContext<'_>, &MsgEvent) -> CallbackReturn + Send + Sync>;
pub type LoginMsgCallback =
    Arc<dyn Fn(&mut CallbackContext<'_>, &LoginMsgEvent) -> CallbackReturn + Send + Sync>;
pub type DirectoryMsgCallback =
    Arc<dyn Fn(&mut CallbackContext<'_>, &DirectoryMsgEvent) -> CallbackReturn + Send + Sync>;
pub type DictionaryMsgCallback =
    Arc<dyn Fn(&mut CallbackContext<'_>, &DictionaryMsgEvent) -> CallbackReturn + Send + Sync>;

/// Callbacks attached to a role
///
/// The channel event and default message callbacks are mandatory. A missing
/// domain callback behaves as if it returned [`CallbackReturn::Raise`].
#[derive(Clone, Default)]
pub struct Callbacks {
    pub channel_event: Option<ChannelEventCallback>,
    pub default_msg: Option<DefaultMsgCallback>,
    pub login_msg: Option<LoginMsgCallback>,
    pub directory_msg: Option<DirectoryMsgCallback>,
    pub dictionary_msg: Option<DictionaryMsgCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DictionaryDownloadMode {
    #[default]
    None,
    /// Download from the first service that provides both dictionaries
    FirstAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub login_request: Option<LoginRequest>,
    pub directory_request: Option<DirectoryRequest>,
    pub dictionary_download: DictionaryDownloadMode,
    pub field_dictionary_name: String,
    pub enum_dictionary_name: String,
    /// Echo round trip latency messages from the provider
    pub rtt: bool,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            login_request: None,
            directory_request: None,
            dictionary_download: DictionaryDownloadMode::None,
            field_dictionary_name: DEFAULT_FIELD_DICTIONARY_NAME.to_string(),
            enum_dictionary_name: DEFAULT_ENUM_DICTIONARY_NAME.to_string(),
            rtt: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NiProviderSettings {
    pub login_request: Option<LoginRequest>,
    /// Published right after login succeeds
    pub directory_refresh: Option<DirectoryRefresh>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleKind {
    Consumer(ConsumerSettings),
    Provider,
    NiProvider(NiProviderSettings),
}

pub struct Role {
    kind: RoleKind,
    callbacks: Callbacks,
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Role").field("kind", &self.kind).finish()
    }
}

impl Role {
    pub fn consumer() -> Self {
        Self::new(RoleKind::Consumer(ConsumerSettings::default()))
    }

    pub fn provider() -> Self {
        Self::new(RoleKind::Provider)
    }

    pub fn ni_provider() -> Self {
        Self::new(RoleKind::NiProvider(NiProviderSettings::default()))
    }

    fn new(kind: RoleKind) -> Self {
        Self {
            kind,
            callbacks: Callbacks::default(),
        }
    }

    pub fn kind(&self) -> &RoleKind {
        &self.kind
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            RoleKind::Consumer(_) => "consumer",
            RoleKind::Provider => "provider",
            RoleKind::NiProvider(_) => "non-interactive provider",
        }
    }

    pub fn login_request(&self) -> Option<&LoginRequest> {
        match &self.kind {
            RoleKind::Consumer(c) => c.login_request.as_ref(),
            RoleKind::NiProvider(n) => n.login_request.as_ref(),
            RoleKind::Provider => None,
        }
    }

    /// Login request to send on a consumer or non-interactive provider
    pub fn with_login(mut self, request: LoginRequest) -> Self {
        match &mut self.kind {
            RoleKind::Consumer(c) => c.login_request = Some(request),
            RoleKind::NiProvider(n) => n.login_request = Some(request),
            RoleKind::Provider => {}
        }
        self
    }

    /// Directory request sent after login; consumers only
    pub fn with_directory(mut self, request: DirectoryRequest) -> Self {
        if let RoleKind::Consumer(c) = &mut self.kind {
            c.directory_request = Some(request);
        }
        self
    }

    /// Directory refresh published after login; non-interactive providers only
    pub fn with_directory_refresh(mut self, refresh: DirectoryRefresh) -> Self {
        if let RoleKind::NiProvider(n) = &mut self.kind {
            n.directory_refresh = Some(refresh);
        }
        self
    }

    pub fn with_dictionary_download(mut self, mode: DictionaryDownloadMode) -> Self {
        if let RoleKind::Consumer(c) = &mut self.kind {
            c.dictionary_download = mode;
        }
        self
    }

    pub fn with_dictionary_names(
        mut self,
        field_dictionary_name: impl Into<String>,
        enum_dictionary_name: impl Into<String>,
    ) -> Self {
        if let RoleKind::Consumer(c) = &mut self.kind {
            c.field_dictionary_name = field_dictionary_name.into();
            c.enum_dictionary_name = enum_dictionary_name.into();
        }
        self
    }

    pub fn with_rtt(mut self, enabled: bool) -> Self {
        if let RoleKind::Consumer(c) = &mut self.kind {
            c.rtt = enabled;
            if let Some(login) = c.login_request.as_mut() {
                login.supports_rtt = enabled;
            }
        }
        self
    }

    pub fn on_channel_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackContext<'_>, &ChannelEvent) -> CallbackReturn + Send + Sync + 'static,
    {
        self.callbacks.channel_event = Some(Arc::new(f));
        self
    }

    pub fn on_default_msg<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackContext<'_>, &MsgEvent) -> CallbackReturn + Send + Sync + 'static,
    {
        self.callbacks.default_msg = Some(Arc::new(f));
        self
    }

    pub fn on_login_msg<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackContext<'_>, &LoginMsgEvent) -> CallbackReturn + Send + Sync + 'static,
    {
        self.callbacks.login_msg = Some(Arc::new(f));
        self
    }

    pub fn on_directory_msg<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackContext<'_>, &DirectoryMsgEvent) -> CallbackReturn + Send + Sync + 'static,
    {
        self.callbacks.directory_msg = Some(Arc::new(f));
        self
    }

    pub fn on_dictionary_msg<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut CallbackContext<'_>, &DictionaryMsgEvent) -> CallbackReturn + Send + Sync + 'static,
    {
        self.callbacks.dictionary_msg = Some(Arc::new(f));
        self
    }

    fn validate_callbacks(&self) -> Result<()> {
        if self.callbacks.channel_event.is_none() {
            return Err(ReactorError::ParameterInvalid(format!(
                "{} role has no channel event callback",
                self.name()
            )));
        }
        if self.callbacks.default_msg.is_none() {
            return Err(ReactorError::ParameterInvalid(format!(
                "{} role has no default message callback",
                self.name()
            )));
        }
        Ok(())
    }

    /// Client channels take consumer and non-interactive provider roles
    pub(crate) fn validate_for_connect(&self) -> Result<()> {
        if matches!(self.kind, RoleKind::Provider) {
            return Err(ReactorError::ParameterInvalid(
                "provider role cannot connect; use accept".to_string(),
            ));
        }
        self.validate_callbacks()
    }

    /// Server channels take the provider role
    pub(crate) fn validate_for_accept(&self) -> Result<()> {
        if !matches!(self.kind, RoleKind::Provider) {
            return Err(ReactorError::ParameterInvalid(format!(
                "{} role cannot accept; use connect",
                self.name()
            )));
        }
        self.validate_callbacks()
    }
}

//! Per-connection bookkeeping owned by the reactor

use crate::core::config::{AcceptOptions, ConnectOptions, ConnectionTarget};
use crate::core::ping::PingTracker;
use crate::core::state::ChannelState;
use crate::failover::connection_list::{TargetCursor, TargetOrigin};
use crate::failover::preferred_host::PreferredHost;
use crate::failover::subscriptions::SubscriptionBook;
use crate::failover::warm_standby::WarmStandbyState;
use crate::rdm::ServiceInfo;
use crate::session::role::Role;
use crate::session::setup::SessionProgress;
use crate::traits::error::Result;
use crate::traits::reconnect::{ExponentialBackoff, NeverReconnect, ReconnectionStrategy};
use crate::traits::transport::{ReadinessHandle, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identifies a channel within its reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-channel counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_read: u64,
    pub messages_written: u64,
    pub pings_received: u64,
    pub flushes_requested: u64,
    pub flushes_completed: u64,
    pub decode_failures: u64,
    pub reconnects: u64,
}

/// Snapshot returned by `Reactor::channel_info`
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub state: ChannelState,
    pub server: bool,
    pub target: Option<ConnectionTarget>,
    pub target_origin: Option<TargetOrigin>,
    pub reconnect_attempts: u32,
    pub readiness_handle: Option<ReadinessHandle>,
    pub ping_timeout: Option<Duration>,
    pub flush_pending: bool,
    /// (group, member) of the warm standby server in use
    pub active_standby: Option<(usize, usize)>,
    pub open_subscriptions: usize,
    pub services: Vec<ServiceInfo>,
    pub user_spec: Option<serde_json::Value>,
}

/// Flush coalescing: one cycle at a time, with a follow-up if more bytes
/// were queued while it ran
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlushState {
    pub requested: bool,
    pub again: bool,
}

pub(crate) struct Channel {
    pub id: ChannelId,
    pub state: ChannelState,
    pub server: bool,
    pub role: Arc<Role>,
    pub transport: Option<Arc<dyn Transport>>,
    pub readiness: Option<ReadinessHandle>,
    /// Bumped on every connection attempt
    pub epoch: u64,
    pub cursor: Option<TargetCursor>,
    pub recovery: Box<dyn ReconnectionStrategy>,
    pub reconnect_attempts: u32,
    pub ping: Arc<PingTracker>,
    pub ping_timeout: Option<Duration>,
    pub init_timeout: Duration,
    pub flush: FlushState,
    pub session: SessionProgress,
    pub subscriptions: SubscriptionBook,
    pub standby: WarmStandbyState,
    pub preferred: PreferredHost,
    /// Times this channel reached READY
    pub ready_cycles: u64,
    pub user_spec: Option<serde_json::Value>,
    pub stats: ChannelStats,
}

impl Channel {
    pub fn client(id: ChannelId, role: Arc<Role>, options: &ConnectOptions) -> Result<Self> {
        let cursor = TargetCursor::from_options(options)?;
        let preferred = PreferredHost::new(
            options.preferred_host.clone(),
            &cursor,
            !options.warm_standby_groups.is_empty(),
        );
        let recovery = ExponentialBackoff::from_limit(
            options.reconnect_min_delay(),
            options.reconnect_max_delay(),
            options.reconnect_attempt_limit,
        );
        let init_timeout = cursor.current().target.init_timeout();
        Ok(Self {
            id,
            state: ChannelState::Opened,
            server: false,
            role,
            transport: None,
            readiness: None,
            epoch: 0,
            cursor: Some(cursor),
            recovery: Box::new(recovery),
            reconnect_attempts: 0,
            ping: Arc::new(PingTracker::new()),
            ping_timeout: None,
            init_timeout,
            flush: FlushState::default(),
            session: SessionProgress::default(),
            subscriptions: SubscriptionBook::default(),
            standby: WarmStandbyState::default(),
            preferred,
            ready_cycles: 0,
            user_spec: options.user_spec.clone(),
            stats: ChannelStats::default(),
        })
    }

    pub fn server(
        id: ChannelId,
        role: Arc<Role>,
        transport: Arc<dyn Transport>,
        options: &AcceptOptions,
    ) -> Self {
        Self {
            id,
            state: ChannelState::Initializing,
            server: true,
            role,
            transport: Some(transport),
            readiness: None,
            epoch: 1,
            cursor: None,
            recovery: Box::new(NeverReconnect),
            reconnect_attempts: 0,
            ping: Arc::new(PingTracker::new()),
            ping_timeout: None,
            init_timeout: Duration::from_secs(options.init_timeout_secs),
            flush: FlushState::default(),
            session: SessionProgress::default(),
            subscriptions: SubscriptionBook::default(),
            standby: WarmStandbyState::default(),
            preferred: PreferredHost::default(),
            ready_cycles: 0,
            user_spec: options.user_spec.clone(),
            stats: ChannelStats::default(),
        }
    }

    pub fn transition(&mut self, next: ChannelState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "Channel {} unexpected transition {} -> {}",
                self.id, self.state, next
            );
        }
        debug!("Channel {} {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    /// Current cursor position, for client channels
    pub fn position(&self) -> Option<usize> {
        self.cursor.as_ref().map(|c| c.position())
    }

    pub fn current_origin(&self) -> Option<TargetOrigin> {
        self.cursor.as_ref().map(|c| c.current().origin)
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.clone()
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            state: self.state,
            server: self.server,
            target: self.cursor.as_ref().map(|c| c.current().target.clone()),
            target_origin: self.current_origin(),
            reconnect_attempts: self.reconnect_attempts,
            readiness_handle: self.readiness,
            ping_timeout: self.ping_timeout,
            flush_pending: self.flush.requested,
            active_standby: self.standby.active(),
            open_subscriptions: self.subscriptions.len(),
            services: self.session.services.clone(),
            user_spec: self.user_spec.clone(),
        }
    }
}

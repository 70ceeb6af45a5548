//! Reactor and connection configuration
//!
//! Everything here is plain serde data so it can be built in code or loaded
//! from YAML. Millisecond fields carry a `_ms` suffix; the initialization
//! timeout is in seconds.

use crate::traits::error::{ReactorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_MESSAGES: usize = 100;
pub const DEFAULT_WORKER_TICK_MS: u64 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ReactorError),
}

fn default_init_timeout_secs() -> u64 {
    DEFAULT_INIT_TIMEOUT_SECS
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

fn default_worker_tick_ms() -> u64 {
    DEFAULT_WORKER_TICK_MS
}

/// One server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub address: String,
    pub port: String,
    /// Seconds the handshake may take before the attempt is abandoned
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
}

impl ConnectionTarget {
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
            init_timeout_secs: DEFAULT_INIT_TIMEOUT_SECS,
        }
    }

    pub fn with_init_timeout(mut self, secs: u64) -> Self {
        self.init_timeout_secs = secs;
        self
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// An active server and the standbys that take over when it fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmStandbyGroup {
    pub starting_active: ConnectionTarget,
    #[serde(default)]
    pub standby: Vec<ConnectionTarget>,
}

impl WarmStandbyGroup {
    pub fn new(starting_active: ConnectionTarget) -> Self {
        Self {
            starting_active,
            standby: Vec::new(),
        }
    }

    pub fn with_standby(mut self, target: ConnectionTarget) -> Self {
        self.standby.push(target);
        self
    }

    pub fn len(&self) -> usize {
        1 + self.standby.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Automatic return to a preferred server
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreferredHostOptions {
    #[serde(default)]
    pub enabled: bool,
    /// How often to check whether a fallback is due; 0 leaves it manual
    #[serde(default)]
    pub detection_interval_ms: u64,
    #[serde(default)]
    pub connection_list_index: usize,
    #[serde(default)]
    pub warm_standby_group_index: usize,
}

/// Options for a client connection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default)]
    pub connection_list: Vec<ConnectionTarget>,
    #[serde(default)]
    pub warm_standby_groups: Vec<WarmStandbyGroup>,
    /// Recovery attempts before the channel goes down for good; -1 retries forever
    #[serde(default)]
    pub reconnect_attempt_limit: i32,
    #[serde(default)]
    pub reconnect_min_delay_ms: u64,
    #[serde(default)]
    pub reconnect_max_delay_ms: u64,
    #[serde(default)]
    pub preferred_host: PreferredHostOptions,
    /// Opaque application value returned with the channel info
    #[serde(default)]
    pub user_spec: Option<serde_json::Value>,
}

impl ConnectOptions {
    pub fn single(target: ConnectionTarget) -> Self {
        Self {
            connection_list: vec![target],
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: ConnectionTarget) -> Self {
        self.connection_list.push(target);
        self
    }

    pub fn with_warm_standby_group(mut self, group: WarmStandbyGroup) -> Self {
        self.warm_standby_groups.push(group);
        self
    }

    pub fn with_reconnect(mut self, attempt_limit: i32, min_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.reconnect_attempt_limit = attempt_limit;
        self.reconnect_min_delay_ms = min_delay_ms;
        self.reconnect_max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_preferred_host(mut self, preferred_host: PreferredHostOptions) -> Self {
        self.preferred_host = preferred_host;
        self
    }

    pub fn with_user_spec(mut self, user_spec: serde_json::Value) -> Self {
        self.user_spec = Some(user_spec);
        self
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Reject unusable combinations before any channel exists
    pub fn validate(&self) -> Result<()> {
        if self.connection_list.is_empty() && self.warm_standby_groups.is_empty() {
            return Err(ReactorError::ParameterInvalid(
                "no connection targets configured".to_string(),
            ));
        }
        if self.reconnect_attempt_limit < -1 {
            return Err(ReactorError::ParameterOutOfRange(format!(
                "reconnect_attempt_limit {} is below -1",
                self.reconnect_attempt_limit
            )));
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return Err(ReactorError::ParameterOutOfRange(format!(
                "reconnect_min_delay_ms {} exceeds reconnect_max_delay_ms {}",
                self.reconnect_min_delay_ms, self.reconnect_max_delay_ms
            )));
        }

        let all_targets = self
            .warm_standby_groups
            .iter()
            .flat_map(|g| std::iter::once(&g.starting_active).chain(g.standby.iter()))
            .chain(self.connection_list.iter());
        for target in all_targets {
            if target.address.is_empty() {
                return Err(ReactorError::ParameterInvalid(
                    "connection target without address".to_string(),
                ));
            }
            if target.init_timeout_secs == 0 {
                return Err(ReactorError::ParameterOutOfRange(format!(
                    "init_timeout_secs of {} must be positive",
                    target.endpoint()
                )));
            }
        }

        if self.preferred_host.enabled {
            if self.warm_standby_groups.is_empty() {
                if self.preferred_host.connection_list_index >= self.connection_list.len() {
                    return Err(ReactorError::ParameterOutOfRange(format!(
                        "preferred connection_list_index {} with {} targets",
                        self.preferred_host.connection_list_index,
                        self.connection_list.len()
                    )));
                }
            } else if self.preferred_host.warm_standby_group_index
                >= self.warm_standby_groups.len()
            {
                return Err(ReactorError::ParameterOutOfRange(format!(
                    "preferred warm_standby_group_index {} with {} groups",
                    self.preferred_host.warm_standby_group_index,
                    self.warm_standby_groups.len()
                )));
            }
        }
        Ok(())
    }
}

/// Options for a server side channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptOptions {
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default)]
    pub user_spec: Option<serde_json::Value>,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self {
            init_timeout_secs: DEFAULT_INIT_TIMEOUT_SECS,
            user_spec: None,
        }
    }
}

impl AcceptOptions {
    pub fn validate(&self) -> Result<()> {
        if self.init_timeout_secs == 0 {
            return Err(ReactorError::ParameterOutOfRange(
                "init_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reactor wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactorOptions {
    /// Worker timer resolution
    #[serde(default = "default_worker_tick_ms")]
    pub worker_tick_ms: u64,
    #[serde(default)]
    pub user_spec: Option<serde_json::Value>,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            worker_tick_ms: DEFAULT_WORKER_TICK_MS,
            user_spec: None,
        }
    }
}

impl ReactorOptions {
    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms.max(1))
    }
}

/// Options for one dispatch call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOptions {
    /// Upper bound on events and messages handled per call
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// How long to wait when nothing is pending; 0 returns immediately
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            timeout_ms: 0,
        }
    }
}

impl DispatchOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_messages == 0 {
            return Err(ReactorError::ParameterOutOfRange(
                "max_messages must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for one submit call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Resolve this service name against the channel's directory and
    /// address the message to it
    #[serde(default)]
    pub service_name: Option<String>,
}

impl SubmitOptions {
    pub fn for_service(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
        }
    }
}

/// Root of a YAML configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactorConfig {
    #[serde(default)]
    pub reactor: ReactorOptions,
    pub connect: ConnectOptions,
    #[serde(default)]
    pub dispatch: DispatchOptions,
}

impl ReactorConfig {
    /// Load and validate a configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml_content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&yaml_content)?;
        info!("Loaded reactor configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> std::result::Result<Self, ConfigError> {
        let config: ReactorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.connect.validate()?;
        self.dispatch.validate()
    }
}

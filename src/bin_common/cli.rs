//! Command line and config path handling for the binaries
//!
//! A config path comes from `--config <path>` when given, then from the
//! config type's environment variable, then from its default location.

use anyhow::{bail, Context};
use feedreactor::ReactorConfig;
use std::path::{Path, PathBuf};

/// Which configuration file a binary wants
#[derive(Debug, Clone)]
pub enum ConfigType {
    /// `config/reactor.yaml`, overridable through `REACTOR_CONFIG_PATH`
    Reactor,
    /// Explicit location, overridable through `CONFIG_PATH`
    Custom(String),
}

impl ConfigType {
    pub fn default_path(&self) -> &str {
        match self {
            ConfigType::Reactor => "config/reactor.yaml",
            ConfigType::Custom(path) => path,
        }
    }

    pub fn env_var_name(&self) -> &str {
        match self {
            ConfigType::Reactor => "REACTOR_CONFIG_PATH",
            ConfigType::Custom(_) => "CONFIG_PATH",
        }
    }
}

/// Resolve a config path from the environment, falling back to the default
///
/// ```
/// use market_feed_reactor::bin_common::{load_config_from_env, ConfigType};
///
/// let path = load_config_from_env(ConfigType::Reactor);
/// assert!(path.to_string_lossy().ends_with(".yaml"));
/// ```
pub fn load_config_from_env(config_type: ConfigType) -> PathBuf {
    match std::env::var(config_type.env_var_name()) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(config_type.default_path()),
    }
}

/// Resolve a config path, letting `--config <path>` win over the environment
pub fn resolve_config_path(args: &[String], config_type: ConfigType) -> anyhow::Result<PathBuf> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            return match iter.next() {
                Some(path) => Ok(PathBuf::from(path)),
                None => bail!("--config needs a path"),
            };
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(load_config_from_env(config_type))
}

/// Load and validate a reactor configuration file
pub fn load_reactor_config(path: &Path) -> anyhow::Result<ReactorConfig> {
    ReactorConfig::from_yaml_file(path)
        .with_context(|| format!("loading reactor config from {}", path.display()))
}

/// Program arguments without the program name
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

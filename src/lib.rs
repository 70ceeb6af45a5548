//! Market Feed Reactor - Main Library
//!
//! This crate wires the `feedreactor` library into runnable binaries.
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (CLI, logging, runners)
//! - **feedreactor**: The connection reactor (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust,no_run
//! use market_feed_reactor::bin_common::{load_config_from_env, load_reactor_config, ConfigType};
//!
//! let path = load_config_from_env(ConfigType::Reactor);
//! let config = load_reactor_config(&path).unwrap();
//! ```

// Re-export workspace libraries for convenience
pub use feedreactor;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod logging;
    pub mod runner;

    pub use cli::{
        load_config_from_env, load_reactor_config, parse_args, resolve_config_path, ConfigType,
    };
    pub use logging::init_tracing;
    pub use runner::{run_dispatch_loop, RunConfig, RunSummary};
}

//! Logging initialization

use tracing_subscriber::EnvFilter;

/// Initialize tracing, honouring `RUST_LOG` and falling back to `default_level`
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .init();
}

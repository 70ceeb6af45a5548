//! Binary runner utilities
//!
//! Provides a standardized way to drive a reactor from a binary with
//! banners, a heartbeat log line and a bounded run time.

use feedreactor::{DispatchOptions, Reactor, ReactorError};
use std::time::{Duration, Instant};
use tracing::info;

/// Configuration for running a dispatch loop
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Name of the binary (for logging)
    pub name: String,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Stop after this long; run until stopped otherwise
    pub run_for: Option<Duration>,
    pub dispatch: DispatchOptions,
}

impl RunConfig {
    /// Create a new run configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            heartbeat_interval_secs: 300, // 5 minutes default
            run_for: None,
            dispatch: DispatchOptions::default().with_timeout(Duration::from_millis(100)),
        }
    }

    /// Set heartbeat interval
    pub fn with_heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Bound the run time
    pub fn with_run_for(mut self, duration: Duration) -> Self {
        self.run_for = Some(duration);
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchOptions) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// What a finished dispatch loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub processed: u64,
    pub elapsed: Duration,
}

/// Dispatch until `stop` returns true, the run time elapses or the reactor
/// shuts down
pub fn run_dispatch_loop(
    reactor: &mut Reactor,
    config: &RunConfig,
    mut stop: impl FnMut(&Reactor) -> bool,
) -> anyhow::Result<RunSummary> {
    print_banner(&config.name);
    let started = Instant::now();
    let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let mut last_beat = started;
    let mut summary = RunSummary {
        iterations: 0,
        processed: 0,
        elapsed: Duration::ZERO,
    };

    while !stop(reactor) {
        if config.run_for.map_or(false, |limit| started.elapsed() >= limit) {
            info!("{} run time elapsed", config.name);
            break;
        }
        match reactor.dispatch(&config.dispatch) {
            Ok(count) => summary.processed += count as u64,
            Err(ReactorError::Shutdown) => {
                info!("{} reactor shut down", config.name);
                break;
            }
            Err(e) => return Err(e.into()),
        }
        summary.iterations += 1;

        if last_beat.elapsed() >= heartbeat {
            info!(
                "Heartbeat: {} channels, {} events processed",
                reactor.channel_ids().len(),
                summary.processed
            );
            last_beat = Instant::now();
        }
    }

    summary.elapsed = started.elapsed();
    print_shutdown(
        &config.name,
        &format!(
            "{} dispatch calls, {} events in {:?}",
            summary.iterations, summary.processed, summary.elapsed
        ),
    );
    Ok(summary)
}

fn print_banner(name: &str) {
    info!("");
    info!("========================================");
    info!("Starting {}", name);
    info!("Press Ctrl+C to stop");
    info!("========================================");
    info!("");
}

fn print_shutdown(name: &str, stats: &str) {
    info!("");
    info!("========================================");
    info!("{} stopped gracefully", name);
    info!("{}", stats);
    info!("========================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedreactor::{JsonFrameCodec, LoopbackNetwork, ReactorOptions};
    use std::sync::Arc;

    #[test]
    fn test_run_config_builder() {
        let config = RunConfig::new("test-binary")
            .with_heartbeat(120)
            .with_run_for(Duration::from_secs(5));

        assert_eq!(config.name, "test-binary");
        assert_eq!(config.heartbeat_interval_secs, 120);
        assert_eq!(config.run_for, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_default_config() {
        let config = RunConfig::new("default");
        assert_eq!(config.heartbeat_interval_secs, 300);
        assert_eq!(config.run_for, None);
        assert_eq!(config.dispatch.timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_loop_stops_on_shutdown() {
        let mut reactor = Reactor::new(
            ReactorOptions::default(),
            Arc::new(LoopbackNetwork::new()),
            Arc::new(JsonFrameCodec::new()),
        )
        .unwrap();
        reactor.shutdown().unwrap();

        let config = RunConfig::new("stopped").with_run_for(Duration::from_secs(5));
        let summary = run_dispatch_loop(&mut reactor, &config, |_| false).unwrap();
        assert_eq!(summary.iterations, 0);
    }

    #[test]
    fn test_loop_respects_run_time() {
        let mut reactor = Reactor::new(
            ReactorOptions::default(),
            Arc::new(LoopbackNetwork::new()),
            Arc::new(JsonFrameCodec::new()),
        )
        .unwrap();
        let config = RunConfig::new("bounded")
            .with_run_for(Duration::from_millis(50))
            .with_dispatch(DispatchOptions::default().with_timeout(Duration::from_millis(5)));

        let summary = run_dispatch_loop(&mut reactor, &config, |_| false).unwrap();
        assert!(summary.elapsed >= Duration::from_millis(50));
        assert!(summary.iterations > 0);
    }
}

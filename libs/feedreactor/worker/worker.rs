//! Worker thread
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐  WorkerCommand (tokio mpsc)   ┌────────────────────┐
//! │  Reactor (dispatch       │ ────────────────────────────> │  Worker thread     │
//! │  thread)                 │                               │  current-thread rt │
//! │                          │ <──────────────────────────── │  tick every N ms:  │
//! └──────────────────────────┘  WorkerEvent (crossbeam)      │  - poll handshakes │
//!                                                            │  - flush           │
//!                                                            │  - ping / timeout  │
//!                                                            │  - timers          │
//!                                                            └────────────────────┘
//! ```
//!
//! The worker owns the initialization deadlines, ping enforcement, flush
//! retries and the reconnect/fallback timers. It never calls application
//! code; everything it observes is posted back as a [`WorkerEvent`].

use crate::core::channel::ChannelId;
use crate::core::ping::PingTracker;
use crate::traits::error::{ErrorInfo, ReactorError, Result};
use crate::traits::transport::{FlushOutcome, InitProgress, ReadinessHandle, Transport};
use crate::worker::event::{WorkerCommand, WorkerEvent};
use crate::worker::queue::WorkerEnd;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

enum Phase {
    Initializing { deadline: Instant, timeout: Duration },
    Active,
}

struct TrackedChannel {
    epoch: u64,
    transport: Arc<dyn Transport>,
    handle: ReadinessHandle,
    ping: Arc<PingTracker>,
    phase: Phase,
    flushing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reconnect,
    Fallback,
}

struct Timer {
    channel: ChannelId,
    epoch: u64,
    at: Instant,
    kind: TimerKind,
}

/// Outcome of servicing one channel for one tick
#[derive(Default)]
struct Step {
    events: Vec<WorkerEvent>,
    remove: bool,
}

impl Step {
    fn down(mut self, event: WorkerEvent) -> Self {
        self.events.push(event);
        self.remove = true;
        self
    }
}

struct Worker {
    end: WorkerEnd,
    tick: Duration,
    channels: HashMap<ChannelId, TrackedChannel>,
    timers: Vec<Timer>,
}

/// Start the worker on its own thread
pub fn spawn(end: WorkerEnd, tick: Duration) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("feedreactor-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Failed to build worker runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(Worker::new(end, tick).run());
        })
        .map_err(|e| ReactorError::WorkerQueue(format!("failed to spawn worker thread: {}", e)))
}

impl Worker {
    fn new(end: WorkerEnd, tick: Duration) -> Self {
        Self {
            end,
            tick,
            channels: HashMap::new(),
            timers: Vec::new(),
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Worker started with tick {:?}", self.tick);

        loop {
            tokio::select! {
                command = self.end.commands.recv() => {
                    match command {
                        Some(WorkerCommand::Shutdown) => {
                            debug!("Worker received shutdown");
                            break;
                        }
                        Some(command) => {
                            if !self.handle_command(command) {
                                break;
                            }
                        }
                        None => {
                            debug!("Worker command queue closed");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !self.service(Instant::now()) {
                        break;
                    }
                }
            }
        }

        self.channels.clear();
        self.timers.clear();
        info!("Worker stopped");
    }

    /// Returns false once the reactor side of the queue is gone
    fn post_all(&self, events: Vec<WorkerEvent>) -> bool {
        for event in events {
            if !self.end.post(event) {
                warn!("Reactor side of worker queue closed");
                return false;
            }
        }
        true
    }

    fn handle_command(&mut self, command: WorkerCommand) -> bool {
        debug!("Worker command: {:?}", command);
        match command {
            WorkerCommand::NewChannel {
                channel,
                epoch,
                transport,
                init_timeout,
                ping,
            } => {
                let handle = transport.readiness_handle();
                self.channels.insert(
                    channel,
                    TrackedChannel {
                        epoch,
                        transport,
                        handle,
                        ping,
                        phase: Phase::Initializing {
                            deadline: Instant::now() + init_timeout,
                            timeout: init_timeout,
                        },
                        flushing: false,
                    },
                );
                self.service_one(channel, Instant::now())
            }
            WorkerCommand::FlushRequest { channel, epoch } => {
                match self.channels.get_mut(&channel) {
                    Some(tracked) if tracked.epoch == epoch => {
                        tracked.flushing = true;
                    }
                    _ => {
                        debug!("Flush request for untracked channel {} ignored", channel);
                        return true;
                    }
                }
                self.service_one(channel, Instant::now())
            }
            WorkerCommand::FdChange {
                channel,
                epoch,
                new_handle,
            } => {
                if let Some(tracked) = self.channels.get_mut(&channel) {
                    if tracked.epoch == epoch {
                        debug!(
                            "Channel {} readiness handle {} -> {}",
                            channel, tracked.handle, new_handle
                        );
                        tracked.handle = new_handle;
                    }
                }
                true
            }
            WorkerCommand::ChannelDown { channel } => {
                self.channels.remove(&channel);
                true
            }
            WorkerCommand::ChannelClose { channel } => {
                self.channels.remove(&channel);
                self.timers.retain(|t| t.channel != channel);
                true
            }
            WorkerCommand::ArmReconnect {
                channel,
                epoch,
                delay,
            } => {
                self.arm(channel, epoch, delay, TimerKind::Reconnect);
                true
            }
            WorkerCommand::ArmFallback {
                channel,
                epoch,
                delay,
            } => {
                self.arm(channel, epoch, delay, TimerKind::Fallback);
                true
            }
            WorkerCommand::Shutdown => false,
        }
    }

    fn arm(&mut self, channel: ChannelId, epoch: u64, delay: Duration, kind: TimerKind) {
        self.timers
            .retain(|t| !(t.channel == channel && t.kind == kind));
        debug!(
            "Channel {} {:?} timer armed for {:?}",
            channel, kind, delay
        );
        self.timers.push(Timer {
            channel,
            epoch,
            at: Instant::now() + delay,
            kind,
        });
    }

    fn service(&mut self, now: Instant) -> bool {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            if !self.service_one(id, now) {
                return false;
            }
        }

        let mut due = Vec::new();
        self.timers.retain(|timer| {
            if timer.at <= now {
                due.push(match timer.kind {
                    TimerKind::Reconnect => WorkerEvent::ReconnectTimerExpired {
                        channel: timer.channel,
                        epoch: timer.epoch,
                    },
                    TimerKind::Fallback => WorkerEvent::FallbackTimerExpired {
                        channel: timer.channel,
                        epoch: timer.epoch,
                    },
                });
                false
            } else {
                true
            }
        });
        self.post_all(due)
    }

    fn service_one(&mut self, id: ChannelId, now: Instant) -> bool {
        let Some(tracked) = self.channels.get_mut(&id) else {
            return true;
        };
        let step = step_channel(id, tracked, now);
        if step.remove {
            self.channels.remove(&id);
        }
        self.post_all(step.events)
    }
}

fn down_event(id: ChannelId, epoch: u64, location: &str, error: ReactorError) -> WorkerEvent {
    WorkerEvent::ChannelDown {
        channel: id,
        epoch,
        error: ErrorInfo::from_error(location, &error),
    }
}

fn step_channel(id: ChannelId, tracked: &mut TrackedChannel, now: Instant) -> Step {
    let mut step = Step::default();
    let epoch = tracked.epoch;

    if let Phase::Initializing { deadline, timeout } = tracked.phase {
        match tracked.transport.init() {
            Ok(InitProgress::Complete { ping_timeout }) => {
                info!(
                    "Channel {} handshake complete, ping timeout {:?}",
                    id, ping_timeout
                );
                tracked.ping.start(ping_timeout);
                tracked.phase = Phase::Active;
                step.events.push(WorkerEvent::ChannelUp {
                    channel: id,
                    epoch,
                    ping_timeout,
                });
            }
            Ok(InitProgress::InProgress) => {
                if now >= deadline {
                    warn!("Channel {} initialization timed out after {:?}", id, timeout);
                    return step.down(WorkerEvent::InitTimeout {
                        channel: id,
                        epoch,
                        timeout,
                    });
                }
            }
            Err(e) => {
                warn!("Channel {} handshake failed: {}", id, e);
                return step.down(down_event(id, epoch, "Worker.initializeChannel", e.into()));
            }
        }
        return step;
    }

    if tracked.flushing {
        match tracked.transport.flush() {
            Ok(FlushOutcome::Drained) => {
                debug!("Channel {} flush drained", id);
                tracked.flushing = false;
                step.events.push(WorkerEvent::FlushDone { channel: id, epoch });
            }
            Ok(FlushOutcome::Pending(remaining)) => {
                debug!("Channel {} flush pending, {} bytes left", id, remaining);
            }
            Err(e) => {
                warn!("Channel {} flush failed: {}", id, e);
                return step.down(down_event(id, epoch, "Worker.flush", e.into()));
            }
        }
    }

    if tracked.ping.expired() {
        let timeout = tracked.ping.timeout();
        warn!(
            "Channel {} ping timeout: nothing received for {:?}",
            id,
            tracked.ping.time_since_last_receive()
        );
        return step.down(WorkerEvent::PingTimerExpired {
            channel: id,
            epoch,
            timeout,
        });
    }

    if tracked.ping.send_due() {
        match tracked.transport.ping() {
            Ok(()) => tracked.ping.record_sent(),
            Err(e) => {
                warn!("Channel {} ping send failed: {}", id, e);
                return step.down(down_event(id, epoch, "Worker.ping", e.into()));
            }
        }
    }

    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::transport::{
        ReadOutcome, ReadinessNotifier, TransportBuffer, TransportError, WriteOutcome,
    };
    use crate::worker::queue::{bidirectional, ReactorEnd};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct StubTransport {
        init_steps: AtomicU32,
        never_init: bool,
        pending_flushes: AtomicU32,
        fail_flush: AtomicBool,
        pings: AtomicU32,
        ping_timeout: Duration,
    }

    impl StubTransport {
        fn new(init_steps: u32, ping_timeout: Duration) -> Self {
            Self {
                init_steps: AtomicU32::new(init_steps),
                never_init: false,
                pending_flushes: AtomicU32::new(0),
                fail_flush: AtomicBool::new(false),
                pings: AtomicU32::new(0),
                ping_timeout,
            }
        }
    }

    impl Transport for StubTransport {
        fn init(&self) -> std::result::Result<InitProgress, TransportError> {
            if self.never_init {
                return Ok(InitProgress::InProgress);
            }
            let left = self.init_steps.load(Ordering::SeqCst);
            if left > 0 {
                self.init_steps.store(left - 1, Ordering::SeqCst);
                return Ok(InitProgress::InProgress);
            }
            Ok(InitProgress::Complete {
                ping_timeout: self.ping_timeout,
            })
        }
        fn read(&self) -> std::result::Result<ReadOutcome, TransportError> {
            Ok(ReadOutcome::WouldBlock)
        }
        fn readable(&self) -> bool {
            false
        }
        fn get_buffer(
            &self,
            size: usize,
            packed: bool,
        ) -> std::result::Result<TransportBuffer, TransportError> {
            Ok(TransportBuffer::new(size, packed))
        }
        fn write(&self, _buffer: TransportBuffer) -> std::result::Result<WriteOutcome, TransportError> {
            Ok(WriteOutcome::Complete)
        }
        fn flush(&self) -> std::result::Result<FlushOutcome, TransportError> {
            if self.fail_flush.load(Ordering::SeqCst) {
                return Err(TransportError::Closed("reset".into()));
            }
            let left = self.pending_flushes.load(Ordering::SeqCst);
            if left > 0 {
                self.pending_flushes.store(left - 1, Ordering::SeqCst);
                return Ok(FlushOutcome::Pending(left as usize));
            }
            Ok(FlushOutcome::Drained)
        }
        fn ping(&self) -> std::result::Result<(), TransportError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn release_buffer(&self, _buffer: TransportBuffer) {}
        fn readiness_handle(&self) -> ReadinessHandle {
            ReadinessHandle(1)
        }
        fn register_readiness(&self, _notifier: ReadinessNotifier) {}
        fn close(&self) {}
        fn max_buffer_size(&self) -> usize {
            1024
        }
    }

    fn start() -> (ReactorEnd, JoinHandle<()>) {
        let (reactor, worker) = bidirectional();
        let handle = spawn(worker, Duration::from_millis(2)).unwrap();
        (reactor, handle)
    }

    fn new_channel(
        reactor: &ReactorEnd,
        transport: Arc<StubTransport>,
        init_timeout: Duration,
    ) -> Arc<PingTracker> {
        let ping = Arc::new(PingTracker::new());
        reactor
            .send(WorkerCommand::NewChannel {
                channel: ChannelId(1),
                epoch: 1,
                transport,
                init_timeout,
                ping: ping.clone(),
            })
            .unwrap();
        ping
    }

    fn next_event(reactor: &ReactorEnd) -> WorkerEvent {
        reactor
            .events()
            .recv_timeout(Duration::from_secs(5))
            .expect("worker event")
    }

    fn stop(reactor: ReactorEnd, handle: JoinHandle<()>) {
        reactor.send(WorkerCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_handshake_completes_after_steps() {
        let (reactor, handle) = start();
        let transport = Arc::new(StubTransport::new(3, Duration::from_secs(30)));
        let ping = new_channel(&reactor, transport, Duration::from_secs(5));

        match next_event(&reactor) {
            WorkerEvent::ChannelUp { ping_timeout, .. } => {
                assert_eq!(ping_timeout, Duration::from_secs(30))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ping.is_started());
        stop(reactor, handle);
    }

    #[test]
    fn test_init_timeout() {
        let (reactor, handle) = start();
        let mut stub = StubTransport::new(0, Duration::from_secs(30));
        stub.never_init = true;
        let started = Instant::now();
        new_channel(&reactor, Arc::new(stub), Duration::from_millis(60));

        assert!(matches!(
            next_event(&reactor),
            WorkerEvent::InitTimeout { .. }
        ));
        assert!(started.elapsed() >= Duration::from_millis(60));
        stop(reactor, handle);
    }

    #[test]
    fn test_flush_retries_until_drained() {
        let (reactor, handle) = start();
        let transport = Arc::new(StubTransport::new(0, Duration::from_secs(30)));
        new_channel(&reactor, transport.clone(), Duration::from_secs(5));
        assert!(matches!(next_event(&reactor), WorkerEvent::ChannelUp { .. }));

        transport.pending_flushes.store(3, Ordering::SeqCst);
        reactor
            .send(WorkerCommand::FlushRequest {
                channel: ChannelId(1),
                epoch: 1,
            })
            .unwrap();
        assert!(matches!(next_event(&reactor), WorkerEvent::FlushDone { .. }));
        // exactly one completion for one request
        std::thread::sleep(Duration::from_millis(30));
        assert!(reactor.try_recv().is_none());
        stop(reactor, handle);
    }

    #[test]
    fn test_flush_failure_reports_down() {
        let (reactor, handle) = start();
        let transport = Arc::new(StubTransport::new(0, Duration::from_secs(30)));
        new_channel(&reactor, transport.clone(), Duration::from_secs(5));
        assert!(matches!(next_event(&reactor), WorkerEvent::ChannelUp { .. }));

        transport.fail_flush.store(true, Ordering::SeqCst);
        reactor
            .send(WorkerCommand::FlushRequest {
                channel: ChannelId(1),
                epoch: 1,
            })
            .unwrap();
        match next_event(&reactor) {
            WorkerEvent::ChannelDown { error, .. } => assert_eq!(error.location, "Worker.flush"),
            other => panic!("unexpected {:?}", other),
        }
        stop(reactor, handle);
    }

    #[test]
    fn test_pings_then_timeout() {
        let (reactor, handle) = start();
        let transport = Arc::new(StubTransport::new(0, Duration::from_millis(90)));
        new_channel(&reactor, transport.clone(), Duration::from_secs(5));
        assert!(matches!(next_event(&reactor), WorkerEvent::ChannelUp { .. }));

        assert!(matches!(
            next_event(&reactor),
            WorkerEvent::PingTimerExpired { .. }
        ));
        assert!(transport.pings.load(Ordering::SeqCst) >= 1);
        stop(reactor, handle);
    }

    #[test]
    fn test_reconnect_timer_never_early() {
        let (reactor, handle) = start();
        let started = Instant::now();
        reactor
            .send(WorkerCommand::ArmReconnect {
                channel: ChannelId(4),
                epoch: 2,
                delay: Duration::from_millis(80),
            })
            .unwrap();
        match next_event(&reactor) {
            WorkerEvent::ReconnectTimerExpired { channel, epoch } => {
                assert_eq!(channel, ChannelId(4));
                assert_eq!(epoch, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
        stop(reactor, handle);
    }

    #[test]
    fn test_close_cancels_timers() {
        let (reactor, handle) = start();
        reactor
            .send(WorkerCommand::ArmReconnect {
                channel: ChannelId(5),
                epoch: 1,
                delay: Duration::from_millis(40),
            })
            .unwrap();
        reactor
            .send(WorkerCommand::ChannelClose {
                channel: ChannelId(5),
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(reactor.try_recv().is_none());
        stop(reactor, handle);
    }
}

//! Physical I/O poller.
//!
//! Samples the raw bit image from the driver at a fixed period, diffs it
//! against the last known image and emits one [`InputEvent`] per changed
//! bit in ascending bit order. Events produced before the platform signals
//! boot completion are queued by the [`BootGate`] and replayed once.
//!
//! ```text
//!   driver.read_bits() ──► detect_edges(last, current) ──► BootGate ──► sink
//!                                                            │
//!                                              (pre-boot) queue ──► replay
//! ```

use egm_common::consts::{MAX_PHYSICAL_BITS, width_mask};
use egm_common::device::{
    DeviceKind, DisableReasonTracker, DisabledReasons, EnabledReason, LifecycleState,
};
use egm_common::event::{EventSink, HardwareFault, InputEvent, PlatformEvent, timestamp_us};
use egm_common::hal::config::BoardSettings;
use egm_common::hal::driver::{HalError, IoDriver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Events produced by one poll cycle. At most one per physical bit.
pub type CycleEdges = heapless::Vec<InputEvent, MAX_PHYSICAL_BITS>;

/// Errors raised by the poller.
#[derive(Debug, Error)]
pub enum PollerError {
    /// Driver failure during initialization.
    #[error(transparent)]
    Hal(#[from] HalError),

    /// `start` called twice.
    #[error("Poller loop already running")]
    AlreadyRunning,

    /// Loop thread could not be spawned.
    #[error("Failed to spawn poller thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Logical state of the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Self test not yet passed.
    Uninitialized,
    /// Polling.
    Idle,
    /// At least one disable reason set.
    Disabled,
}

impl LifecycleState for PollerState {
    const UNINITIALIZED: Self = PollerState::Uninitialized;
    const IDLE: Self = PollerState::Idle;
    const DISABLED: Self = PollerState::Disabled;
}

/// Compute the input events between two images.
///
/// One event per bit set in `(current ^ last) & mask`, ascending bit order,
/// all stamped with `timestamp_us`.
pub fn detect_edges(last: u64, current: u64, mask: u64, timestamp_us: u64) -> CycleEdges {
    let mut edges = CycleEdges::new();
    let mut changed = (current ^ last) & mask;
    while changed != 0 {
        let bit = changed.trailing_zeros() as u8;
        let is_on = current & (1u64 << bit) != 0;
        // capacity equals the number of bits in the image
        let _ = edges.push(InputEvent::new(bit, is_on, timestamp_us));
        changed &= changed - 1;
    }
    edges
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum GatePhase {
    #[default]
    Closed,
    Replaying,
    Open,
}

#[derive(Debug, Default)]
struct BootGateState {
    phase: GatePhase,
    queued: Vec<InputEvent>,
    deferred: Vec<InputEvent>,
    last_live: HashMap<u8, u64>,
}

impl BootGateState {
    fn record_live(&mut self, event: &InputEvent) {
        let last = self.last_live.entry(event.physical_id).or_insert(0);
        *last = (*last).max(event.timestamp_us);
    }
}

/// Holds input events back until the platform has booted.
///
/// Closed, the gate queues every event. [`open`](Self::open) hands the
/// queue out for replay; live events arriving during the replay are held
/// back and handed out by [`take_deferred`](Self::take_deferred), so they
/// always reach consumers after the replayed ones.
#[derive(Debug, Default)]
pub struct BootGate {
    state: Mutex<BootGateState>,
}

impl BootGate {
    /// Create a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `event` may be published live, otherwise holds it.
    pub fn admit(&self, event: InputEvent) -> bool {
        let mut state = self.state.lock();
        match state.phase {
            GatePhase::Closed => {
                state.queued.push(event);
                false
            }
            GatePhase::Replaying => {
                state.record_live(&event);
                state.deferred.push(event);
                false
            }
            GatePhase::Open => {
                state.record_live(&event);
                true
            }
        }
    }

    /// Start the replay and take the queued events. `None` if boot was
    /// already handled.
    pub fn open(&self) -> Option<Vec<InputEvent>> {
        let mut state = self.state.lock();
        if state.phase != GatePhase::Closed {
            return None;
        }
        state.phase = GatePhase::Replaying;
        Some(std::mem::take(&mut state.queued))
    }

    /// Take the live events held back during the replay.
    ///
    /// Once none are left the gate opens and later events pass straight
    /// through.
    pub fn take_deferred(&self) -> Vec<InputEvent> {
        let mut state = self.state.lock();
        if state.deferred.is_empty() && state.phase == GatePhase::Replaying {
            state.phase = GatePhase::Open;
        }
        std::mem::take(&mut state.deferred)
    }

    /// Whether a live event for `physical_id` at or after `timestamp_us`
    /// already arrived.
    pub fn is_covered(&self, physical_id: u8, timestamp_us: u64) -> bool {
        self.state
            .lock()
            .last_live
            .get(&physical_id)
            .is_some_and(|&live| live >= timestamp_us)
    }

    /// Whether boot completed and the replay finished.
    pub fn is_open(&self) -> bool {
        self.state.lock().phase == GatePhase::Open
    }

    /// Number of events waiting for boot.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }
}

/// Loop timing statistics.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    /// Number of cycles executed
    pub cycle_count: u64,
    /// Number of cycles that actually sampled the board
    pub sampled_cycles: u64,
    /// Number of input events produced
    pub events: u64,
    /// Number of cycles that exceeded the period
    pub timing_violations: u64,
    /// Maximum observed cycle time
    pub max_cycle_time_us: u64,
}

/// Samples the physical bit image and emits ordered input events.
pub struct PhysicalIoPoller {
    driver: Arc<dyn IoDriver>,
    sink: Arc<dyn EventSink>,
    period: Duration,
    input_mask: u64,
    lifecycle: Mutex<DisableReasonTracker<PollerState>>,
    last_known: Mutex<u64>,
    boot: BootGate,
    running: AtomicBool,
    dependent_stopped: AtomicBool,
    inspection_failure_posted: AtomicBool,
    stats: Mutex<PollStats>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PhysicalIoPoller {
    /// Create a poller. Call [`initialize`](Self::initialize) before polling.
    pub fn new(driver: Arc<dyn IoDriver>, sink: Arc<dyn EventSink>, board: &BoardSettings) -> Self {
        Self {
            lifecycle: Mutex::new(DisableReasonTracker::new(DeviceKind::IoBoard, sink.clone())),
            driver,
            sink,
            period: board.poll_period(),
            input_mask: width_mask(board.physical_width),
            last_known: Mutex::new(0),
            boot: BootGate::new(),
            running: AtomicBool::new(false),
            dependent_stopped: AtomicBool::new(false),
            inspection_failure_posted: AtomicBool::new(false),
            stats: Mutex::new(PollStats::default()),
            thread: Mutex::new(None),
        }
    }

    /// Run the board self test and enter the quiescent configured state.
    ///
    /// On success the poller is initialized and immediately disabled for
    /// `CONFIGURATION`; enable it with [`EnabledReason::Configuration`] once
    /// every consumer has subscribed. On failure it is disabled for `ERROR`
    /// and one inspection-failure event is posted per uninitialized period.
    pub fn initialize(&self) -> Result<(), PollerError> {
        match self.driver.self_test() {
            Ok(()) => {
                self.inspection_failure_posted.store(false, Ordering::SeqCst);
                let mut lifecycle = self.lifecycle.lock();
                lifecycle.initialize();
                lifecycle.disable(DisabledReasons::CONFIGURATION);
                let cleared = lifecycle.reasons().contains(DisabledReasons::ERROR);
                if cleared {
                    lifecycle.enable(EnabledReason::Reset);
                }
                drop(lifecycle);
                if cleared {
                    info!("I/O board self test passed, inspection fault cleared");
                    self.sink.publish(PlatformEvent::HardwareFaultCleared {
                        device: DeviceKind::IoBoard,
                    });
                }
                info!(
                    "I/O poller initialized (driver {} v{}, period {:?})",
                    self.driver.name(),
                    self.driver.version(),
                    self.period
                );
                Ok(())
            }
            Err(e) => {
                error!("I/O board self test failed: {}", e);
                {
                    let mut lifecycle = self.lifecycle.lock();
                    if !lifecycle.reasons().contains(DisabledReasons::ERROR) {
                        lifecycle.disable(DisabledReasons::ERROR);
                    }
                }
                if !self.inspection_failure_posted.swap(true, Ordering::SeqCst) {
                    self.sink.publish(PlatformEvent::InspectionFailed {
                        device: DeviceKind::IoBoard,
                    });
                    self.sink.publish(PlatformEvent::HardwareFault {
                        device: DeviceKind::IoBoard,
                        fault: HardwareFault::SelfTestFailed(e.to_string()),
                    });
                }
                Err(e.into())
            }
        }
    }

    /// Remove a disable reason.
    pub fn enable(&self, reason: EnabledReason) -> bool {
        self.lifecycle.lock().enable(reason)
    }

    /// Add a disable reason.
    pub fn disable(&self, reason: DisabledReasons) {
        self.lifecycle.lock().disable(reason);
    }

    /// Whether the poller is enabled.
    pub fn is_enabled(&self) -> bool {
        self.lifecycle.lock().is_enabled()
    }

    /// Current disable reasons.
    pub fn reasons(&self) -> DisabledReasons {
        self.lifecycle.lock().reasons()
    }

    /// Current logical state.
    pub fn state(&self) -> PollerState {
        self.lifecycle.lock().state()
    }

    /// Last sampled bit image.
    pub fn last_known(&self) -> u64 {
        *self.last_known.lock()
    }

    /// Boot gate of this poller.
    pub fn boot_gate(&self) -> &BootGate {
        &self.boot
    }

    /// Snapshot of the loop statistics.
    pub fn stats(&self) -> PollStats {
        self.stats.lock().clone()
    }

    fn should_poll(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.is_enabled()
            || (self.dependent_stopped.load(Ordering::SeqCst)
                && lifecycle.reasons() == DisabledReasons::ERROR)
    }

    /// Execute one sample/diff/emit cycle.
    ///
    /// Returns the number of events produced, or `None` when the poller is
    /// quiescent or the read failed.
    pub fn poll_once(&self) -> Option<usize> {
        if !self.should_poll() {
            return None;
        }

        let current = match self.driver.read_bits() {
            Ok(bits) => bits & self.input_mask,
            Err(e) => {
                self.report_read_failure(e);
                return None;
            }
        };

        let edges = {
            let mut last = self.last_known.lock();
            let edges = detect_edges(*last, current, self.input_mask, timestamp_us());
            *last = current;
            edges
        };

        for edge in &edges {
            if self.boot.admit(*edge) {
                trace!("input {} -> {}", edge.physical_id, edge.is_on);
                self.sink.publish(PlatformEvent::Input(*edge));
            } else {
                debug!(
                    "input {} -> {} held back until boot replay completes",
                    edge.physical_id, edge.is_on
                );
            }
        }

        let mut stats = self.stats.lock();
        stats.sampled_cycles += 1;
        stats.events += edges.len() as u64;
        Some(edges.len())
    }

    fn report_read_failure(&self, e: HalError) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.reasons().contains(DisabledReasons::ERROR) {
            debug!("I/O read failed while already faulted: {}", e);
            return;
        }
        warn!("I/O read failed: {}", e);
        lifecycle.disable(DisabledReasons::ERROR);
        drop(lifecycle);
        self.sink.publish(PlatformEvent::HardwareFault {
            device: DeviceKind::IoBoard,
            fault: HardwareFault::CommunicationTimeout(e.to_string()),
        });
    }

    /// Release events queued before boot, exactly once.
    ///
    /// A queued event is skipped when a live event for the same bit with a
    /// timestamp at or after the last queued one already arrived. Live
    /// events sampled during the replay are published after it.
    pub fn boot_completed(&self) -> usize {
        let Some(queued) = self.boot.open() else {
            debug!("Boot completion already handled");
            return 0;
        };

        let mut last_queued: HashMap<u8, u64> = HashMap::new();
        for event in &queued {
            last_queued.insert(event.physical_id, event.timestamp_us);
        }

        let total = queued.len();
        let mut replayed = 0;
        for event in queued {
            let newest = last_queued
                .get(&event.physical_id)
                .copied()
                .unwrap_or(event.timestamp_us);
            if self.boot.is_covered(event.physical_id, newest) {
                trace!("replay of input {} already covered", event.physical_id);
                continue;
            }
            self.sink.publish(PlatformEvent::Input(event));
            replayed += 1;
        }

        loop {
            let deferred = self.boot.take_deferred();
            if deferred.is_empty() {
                break;
            }
            debug!("Publishing {} inputs sampled during replay", deferred.len());
            for event in deferred {
                self.sink.publish(PlatformEvent::Input(event));
            }
        }
        info!("Boot completed: replayed {} of {} queued inputs", replayed, total);
        replayed
    }

    /// A dependent meter bank stopped responding.
    ///
    /// The poller is disabled for `ERROR` but keeps sampling so recovery
    /// can be observed.
    pub fn on_dependent_stopped_responding(&self) {
        self.dependent_stopped.store(true, Ordering::SeqCst);
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.reasons().contains(DisabledReasons::ERROR) {
            lifecycle.disable(DisabledReasons::ERROR);
        }
    }

    /// A dependent meter bank recovered.
    pub fn on_dependent_started_responding(&self) {
        if self.dependent_stopped.swap(false, Ordering::SeqCst) {
            self.lifecycle.lock().enable(EnabledReason::Reset);
        }
    }

    /// Spawn the poll loop thread.
    pub fn start(self: &Arc<Self>) -> Result<(), PollerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PollerError::AlreadyRunning);
        }
        let poller = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("egm-io-poller".to_string())
            .spawn(move || poller.run_loop())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                PollerError::Spawn(e)
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn run_loop(&self) {
        info!("Starting I/O poll loop (period={:?})", self.period);

        while self.running.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();

            self.poll_once();

            let cycle_time_us = cycle_start.elapsed().as_micros() as u64;
            {
                let mut stats = self.stats.lock();
                stats.cycle_count += 1;
                stats.max_cycle_time_us = stats.max_cycle_time_us.max(cycle_time_us);
                if cycle_time_us > self.period.as_micros() as u64 {
                    stats.timing_violations += 1;
                    if stats.timing_violations <= 10 || stats.timing_violations % 1000 == 0 {
                        warn!(
                            "Timing violation #{}: cycle took {}us (period {:?})",
                            stats.timing_violations, cycle_time_us, self.period
                        );
                    }
                }
                if stats.cycle_count % 1000 == 0 {
                    debug!(
                        "Poll loop: {} cycles, {} sampled, {} events, max={}us",
                        stats.cycle_count,
                        stats.sampled_cycles,
                        stats.events,
                        stats.max_cycle_time_us
                    );
                }
            }

            let elapsed = cycle_start.elapsed();
            if elapsed < self.period {
                thread::sleep(self.period - elapsed);
            }
        }

        info!("I/O poll loop stopped");
    }

    /// Stop the loop and wait for the thread to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("I/O poller thread panicked");
            }
        }
    }

    /// Whether the loop thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl EventSink for PhysicalIoPoller {
    fn publish(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::BootCompleted => {
                self.boot_completed();
            }
            PlatformEvent::StoppedResponding {
                source: DeviceKind::MechanicalMeter,
            } => self.on_dependent_stopped_responding(),
            PlatformEvent::StartedResponding {
                source: DeviceKind::MechanicalMeter,
            } => self.on_dependent_started_responding(),
            _ => {}
        }
    }
}

//! Meter bank behaviour against the simulated board.

use egm_common::device::{DeviceKind, DisabledReasons};
use egm_common::event::{EventSink, HardwareFault, MemorySink, PlatformEvent};
use egm_common::hal::config::{DeviceDescriptor, IoBoardConfig};
use egm_common::hal::driver::{HalError, IoDriver};
use egm_common::persistence::PersistentStore;
use egm_hal::drivers::simulation::SimulationDriver;
use egm_hal::meters::{CycleOutcome, LEDGER_BLOCK, MechanicalMeterActuator};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const METER: u32 = 3;
const METER_BIT: u8 = 3;

fn meter(logical_id: u32, physical_id: u8, tick: i64) -> DeviceDescriptor {
    DeviceDescriptor {
        logical_id,
        physical_id,
        name: format!("meter-{}", logical_id),
        kind: DeviceKind::MechanicalMeter,
        default_tick_value: tick,
        enabled_by_default: true,
    }
}

fn config() -> IoBoardConfig {
    let mut config = IoBoardConfig::default();
    config.board.health_probe_interval_ms = 20;
    config.meters = vec![meter(1, 0, 1), meter(METER, METER_BIT, 10)];
    config
}

fn simulated() -> Arc<SimulationDriver> {
    let driver = Arc::new(SimulationDriver::new());
    driver.init(&config()).unwrap();
    driver
}

fn actuator(
    driver: Arc<dyn IoDriver>,
    store: Arc<PersistentStore>,
    sink: Arc<MemorySink>,
) -> MechanicalMeterActuator {
    MechanicalMeterActuator::initialize(driver, store, sink, &config()).unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn whole_ticks_become_pulses() {
    let driver = simulated();
    let sink = Arc::new(MemorySink::new());
    let meters = actuator(driver.clone(), PersistentStore::in_memory(), sink.clone());

    meters.advance_meter(METER, 50, None).unwrap();
    assert_eq!(meters.run_pending().unwrap(), CycleOutcome::Idle);

    assert_eq!(driver.board().pulses(METER_BIT), 5);
    assert_eq!(meters.committed_count(METER).unwrap(), 50);
    assert_eq!(meters.pending_ledger(METER).unwrap(), 0);
    assert_eq!(meters.remaining(METER).unwrap(), 0);
    assert!(sink.contains(|e| matches!(e, PlatformEvent::TickStopped { meter_id: METER })));
}

#[test]
fn failed_pulse_rolls_back_and_keeps_the_rest_pending() {
    let driver = simulated();
    let sink = Arc::new(MemorySink::new());
    let meters = actuator(driver.clone(), PersistentStore::in_memory(), sink.clone());

    driver.board().fail_raise(3);
    meters.advance_meter(METER, 50, None).unwrap();
    assert_eq!(meters.run_pending().unwrap(), CycleOutcome::Faulted);

    assert_eq!(driver.board().pulses(METER_BIT), 2);
    assert_eq!(meters.committed_count(METER).unwrap(), 20);
    assert_eq!(meters.remaining(METER).unwrap(), 30);
    assert_eq!(meters.reasons(), DisabledReasons::ERROR);
    assert!(sink.contains(|e| matches!(
        e,
        PlatformEvent::HardwareFault {
            device: DeviceKind::MechanicalMeter,
            fault: HardwareFault::HandshakeMismatch { expected: 0b1000, actual: 0 },
        }
    )));
    assert!(sink.contains(|e| matches!(
        e,
        PlatformEvent::StoppedResponding {
            source: DeviceKind::MechanicalMeter
        }
    )));

    // Nothing moves while faulted.
    assert_eq!(meters.run_pending().unwrap(), CycleOutcome::Disabled);
    assert_eq!(driver.board().pulses(METER_BIT), 2);

    assert!(meters.probe_health());
    assert!(meters.is_enabled());
    assert_eq!(meters.run_pending().unwrap(), CycleOutcome::Idle);
    assert_eq!(driver.board().pulses(METER_BIT), 5);
    assert_eq!(meters.committed_count(METER).unwrap(), 50);
}

#[test]
fn committed_count_matches_completed_pulses_across_faults() {
    let driver = simulated();
    let meters = actuator(
        driver.clone(),
        PersistentStore::in_memory(),
        Arc::new(MemorySink::new()),
    );

    meters.advance_meter(METER, 100, None).unwrap();
    for nth in [2, 1, 4] {
        driver.board().fail_raise(nth);
        meters.run_pending().unwrap();
        let pulses = driver.board().pulses(METER_BIT) as i64;
        assert_eq!(meters.committed_count(METER).unwrap(), pulses * 10);
        assert_eq!(
            meters.committed_count(METER).unwrap() + meters.remaining(METER).unwrap(),
            100
        );
        meters.probe_health();
    }

    meters.run_pending().unwrap();
    assert_eq!(driver.board().pulses(METER_BIT), 10);
    assert_eq!(meters.committed_count(METER).unwrap(), 100);
}

#[test]
fn advance_in_caller_transaction_waits_for_commit() {
    let driver = simulated();
    let store = PersistentStore::in_memory();
    let meters = actuator(driver.clone(), store.clone(), Arc::new(MemorySink::new()));

    let mut tx = store.begin();
    meters.advance_meter(METER, 20, Some(&mut tx)).unwrap();
    assert_eq!(meters.pending_ledger(METER).unwrap(), 0);
    meters.run_pending().unwrap();
    assert_eq!(driver.board().pulses(METER_BIT), 0);

    tx.commit().unwrap();
    assert_eq!(meters.pending_ledger(METER).unwrap(), 20);
    meters.run_pending().unwrap();
    assert_eq!(driver.board().pulses(METER_BIT), 2);
}

#[test]
fn rolled_back_caller_transaction_leaves_no_trace() {
    let driver = simulated();
    let store = PersistentStore::in_memory();
    let meters = actuator(driver.clone(), store.clone(), Arc::new(MemorySink::new()));

    let mut tx = store.begin();
    meters.advance_meter(METER, 20, Some(&mut tx)).unwrap();
    tx.rollback();

    assert_eq!(meters.pending_ledger(METER).unwrap(), 0);
    meters.run_pending().unwrap();
    assert_eq!(driver.board().pulses(METER_BIT), 0);
    assert_eq!(meters.committed_count(METER).unwrap(), 0);
}

/// Forwards to the simulated board and, on each raise, checks that the
/// raised meter's ledger slot is empty before injecting a further advance.
struct LedgerCheckingDriver {
    inner: Arc<SimulationDriver>,
    store: Arc<PersistentStore>,
    injections: AtomicUsize,
    violations: AtomicUsize,
}

impl IoDriver for LedgerCheckingDriver {
    fn name(&self) -> &'static str {
        "ledger_check"
    }

    fn version(&self) -> &'static str {
        "0.0.0"
    }

    fn init(&self, config: &IoBoardConfig) -> Result<(), HalError> {
        self.inner.init(config)
    }

    fn self_test(&self) -> Result<(), HalError> {
        self.inner.self_test()
    }

    fn read_bits(&self) -> Result<u64, HalError> {
        self.inner.read_bits()
    }

    fn set_meter_bits(&self, mask: u64) -> Result<(), HalError> {
        let ledger = self.store.block(LEDGER_BLOCK).unwrap();
        if self.store.read(&ledger, 1).unwrap() != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        if self
            .injections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let mut tx = self.store.begin();
            tx.add(&ledger, 1, 10).unwrap();
            tx.commit().unwrap();
        }
        self.inner.set_meter_bits(mask)
    }

    fn clear_meter_bits(&self, mask: u64) -> Result<(), HalError> {
        self.inner.clear_meter_bits(mask)
    }

    fn status_meter_bits(&self, mask: u64) -> Result<u64, HalError> {
        self.inner.status_meter_bits(mask)
    }

    fn shutdown(&self) -> Result<(), HalError> {
        self.inner.shutdown()
    }
}

#[test]
fn ledger_is_drained_before_every_pulse() {
    let inner = simulated();
    let store = PersistentStore::in_memory();
    let driver = Arc::new(LedgerCheckingDriver {
        inner: inner.clone(),
        store: store.clone(),
        injections: AtomicUsize::new(3),
        violations: AtomicUsize::new(0),
    });
    let meters = actuator(driver.clone(), store, Arc::new(MemorySink::new()));

    meters.advance_meter(METER, 50, None).unwrap();
    meters.run_pending().unwrap();

    assert_eq!(driver.violations.load(Ordering::SeqCst), 0);
    assert_eq!(inner.board().pulses(METER_BIT), 8);
    assert_eq!(meters.committed_count(METER).unwrap(), 80);
    assert_eq!(meters.pending_ledger(METER).unwrap(), 0);
}

#[test]
fn counts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meters.bin");
    let driver = simulated();

    {
        let store = PersistentStore::open(&path).unwrap();
        let meters = actuator(driver.clone(), store, Arc::new(MemorySink::new()));
        meters.advance_meter(METER, 25, None).unwrap();
        meters.run_pending().unwrap();
        meters.advance_meter(1, 4, None).unwrap();
    }

    let store = PersistentStore::open(&path).unwrap();
    let meters = actuator(driver.clone(), store, Arc::new(MemorySink::new()));
    assert_eq!(meters.committed_count(METER).unwrap(), 20);
    assert_eq!(meters.remaining(METER).unwrap(), 5);
    assert_eq!(meters.pending_ledger(1).unwrap(), 4);

    meters.run_pending().unwrap();
    assert_eq!(driver.board().pulses(0), 4);
    assert_eq!(meters.committed_count(1).unwrap(), 4);
}

#[test]
fn worker_pulses_and_recovers_in_background() {
    let driver = simulated();
    let sink = Arc::new(MemorySink::new());
    let meters = Arc::new(actuator(
        driver.clone(),
        PersistentStore::in_memory(),
        sink.clone(),
    ));
    meters.start().unwrap();

    meters.advance_meter(METER, 30, None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        meters.committed_count(METER).unwrap() == 30
    }));

    driver.board().fail_raise(1);
    meters.advance_meter(METER, 20, None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        meters.committed_count(METER).unwrap() == 50
    }));
    assert!(sink.contains(|e| matches!(
        e,
        PlatformEvent::HardwareFaultCleared {
            device: DeviceKind::MechanicalMeter
        }
    )));

    meters.stop();
    assert!(!meters.is_running());
    assert_eq!(driver.board().pulses(METER_BIT), 5);
}

#[test]
fn worker_announces_persistence_failures() {
    let driver = simulated();
    let sink = Arc::new(MemorySink::new());
    let meters = Arc::new(actuator(
        driver.clone(),
        PersistentStore::in_memory(),
        sink.clone(),
    ));
    meters.suspend_meter(1).unwrap();
    meters.start().unwrap();

    meters.advance_meter(1, 5, None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        meters.remaining(1).unwrap() == 5
    }));

    // Draining this on top of the pending 5 cannot be represented.
    meters.advance_meter(1, i64::MAX, None).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        sink.contains(|e| matches!(
            e,
            PlatformEvent::HardwareFault {
                device: DeviceKind::MechanicalMeter,
                fault: HardwareFault::PersistenceFailure(_),
            }
        ))
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        sink.contains(|e| matches!(
            e,
            PlatformEvent::StoppedResponding {
                source: DeviceKind::MechanicalMeter
            }
        ))
    }));

    meters.stop();
    assert_eq!(meters.pending_ledger(1).unwrap(), i64::MAX);
    assert_eq!(meters.remaining(1).unwrap(), 5);
    assert_eq!(driver.board().pulses(0), 0);
}

#[test]
fn property_change_pauses_the_bank() {
    let driver = simulated();
    let meters = actuator(
        driver.clone(),
        PersistentStore::in_memory(),
        Arc::new(MemorySink::new()),
    );

    meters.publish(PlatformEvent::PropertyChanged {
        key: "MechanicalMeters.Enabled".to_string(),
        enabled: false,
    });
    meters.advance_meter(METER, 10, None).unwrap();
    assert_eq!(meters.run_pending().unwrap(), CycleOutcome::Disabled);

    meters.publish(PlatformEvent::PropertyChanged {
        key: "MechanicalMeters.Enabled".to_string(),
        enabled: true,
    });
    assert_eq!(meters.run_pending().unwrap(), CycleOutcome::Idle);
    assert_eq!(driver.board().pulses(METER_BIT), 1);
}

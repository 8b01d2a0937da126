//! Ledger-to-pulse actuation.
//!
//! Each physical pulse runs in its own transaction:
//!
//! 1. the meter's ledger slot must be empty (otherwise re-drain first)
//! 2. the meter's status bit must read clear
//! 3. one tick moves from remaining to committed and is committed
//! 4. raise the bit; status over all meter bits must be exactly this bit
//! 5. lower the bit; status over all meter bits must be zero
//!
//! A failed step 4 or 5 rolls the tick back, disables the bank with
//! `ERROR` and abandons the batch. Remaining ticks stay persisted and are
//! retried after the health monitor re-enables the bank.

use super::ledger::MeterLedger;
use super::wake::WakeSignal;
use super::{LogicalMeter, MeterBankState, MeterError};
use egm_common::consts::METERS_ENABLED_PROPERTY;
use egm_common::device::{DeviceKind, DisableReasonTracker, DisabledReasons, EnabledReason};
use egm_common::event::{EventSink, HardwareFault, PlatformEvent};
use egm_common::hal::config::IoBoardConfig;
use egm_common::hal::driver::IoDriver;
use egm_common::persistence::{PersistenceError, PersistentStore, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Result of one [`MechanicalMeterActuator::run_pending`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// All whole ticks pulsed, or nothing to do.
    Idle,
    /// Bank disabled; pending work kept.
    Disabled,
    /// A pulse failed; the batch was abandoned.
    Faulted,
    /// Stop requested between pulses.
    Stopped,
}

enum PulseOutcome {
    Pulsed { remaining: i64 },
    NothingDue,
    LedgerDirty,
    Disabled,
    Failed,
}

/// Mechanical meter bank.
pub struct MechanicalMeterActuator {
    driver: Arc<dyn IoDriver>,
    sink: Arc<dyn EventSink>,
    meters: Vec<LogicalMeter>,
    by_logical_id: HashMap<u32, usize>,
    full_mask: u64,
    ledger: MeterLedger,
    lifecycle: Mutex<DisableReasonTracker<MeterBankState>>,
    /// Serializes every coil access: worker pulses, manual pulses and
    /// health probes.
    actuation: Mutex<()>,
    pub(super) wake: Arc<WakeSignal>,
    pub(super) monitor_wake: WakeSignal,
    pub(super) stopping: AtomicBool,
    pub(super) started: AtomicBool,
    pub(super) health_interval: Duration,
    pub(super) threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MechanicalMeterActuator {
    /// Build the bank from the meter section of `config`.
    ///
    /// Creates (or reopens) the persisted blocks and wakes the worker if a
    /// previous run left pulses pending.
    pub fn initialize(
        driver: Arc<dyn IoDriver>,
        store: Arc<PersistentStore>,
        sink: Arc<dyn EventSink>,
        config: &IoBoardConfig,
    ) -> Result<Self, MeterError> {
        if config.meters.is_empty() {
            return Err(MeterError::ConfigurationMissing);
        }
        config.validate_meters()?;

        let meters: Vec<LogicalMeter> = config
            .meters
            .iter()
            .map(LogicalMeter::from_descriptor)
            .collect();
        let by_logical_id = meters
            .iter()
            .enumerate()
            .map(|(index, meter)| (meter.logical_id, index))
            .collect();
        let full_mask = meters.iter().fold(0u64, |mask, meter| mask | meter.bit());
        let ledger = MeterLedger::open(store, meters.len())?;

        let mut lifecycle = DisableReasonTracker::new(DeviceKind::MechanicalMeter, sink.clone());
        lifecycle.initialize();

        let actuator = Self {
            driver,
            sink,
            meters,
            by_logical_id,
            full_mask,
            ledger,
            lifecycle: Mutex::new(lifecycle),
            actuation: Mutex::new(()),
            wake: Arc::new(WakeSignal::new()),
            monitor_wake: WakeSignal::new(),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            health_interval: config.board.health_probe_interval(),
            threads: Mutex::new(Vec::new()),
        };

        let mut recovered = false;
        for (index, meter) in actuator.meters.iter().enumerate() {
            let ledger = actuator.ledger.ledger(index)?;
            let remaining = actuator.ledger.remaining(index)?;
            if ledger != 0 || remaining != 0 {
                info!(
                    "Meter {} ({}) resumes with ledger {} and {} pending",
                    meter.logical_id, meter.name, ledger, remaining
                );
                recovered = true;
            }
        }
        if recovered {
            actuator.wake.notify();
        }

        info!(
            "Meter bank initialized: {} meters, mask {:#x}",
            actuator.meters.len(),
            actuator.full_mask
        );
        Ok(actuator)
    }

    /// Record `amount` value units for `logical_id`.
    ///
    /// With `scope`, the amount is staged in the caller's transaction and
    /// the worker is woken only if that transaction commits. Without it a
    /// private transaction is committed immediately. Advances are accepted
    /// while the bank is disabled; they are pulsed after recovery.
    pub fn advance_meter(
        &self,
        logical_id: u32,
        amount: i64,
        scope: Option<&mut Transaction>,
    ) -> Result<(), MeterError> {
        if amount <= 0 {
            return Err(MeterError::InvalidAmount(amount));
        }
        let index = self.index_of(logical_id)?;

        match scope {
            Some(tx) => {
                self.ledger.stage_advance(tx, index, amount)?;
                let wake = self.wake.clone();
                tx.on_completed(move |committed| {
                    if committed {
                        wake.notify();
                    }
                });
                debug!("Meter {} advance of {} staged", logical_id, amount);
            }
            None => {
                let mut tx = self.ledger.begin();
                self.ledger.stage_advance(&mut tx, index, amount)?;
                tx.commit().map_err(|e| match e {
                    PersistenceError::Overflow { .. } => MeterError::InvalidAmount(amount),
                    e => e.into(),
                })?;
                self.wake.notify();
                debug!("Meter {} advanced by {}", logical_id, amount);
            }
        }
        Ok(())
    }

    /// Drain the ledger and pulse every whole tick that is due.
    ///
    /// Called by the worker after each wake; tests call it directly.
    pub fn run_pending(&self) -> Result<CycleOutcome, MeterError> {
        'drain: loop {
            if !self.set_state(MeterBankState::Draining) {
                return Ok(CycleOutcome::Disabled);
            }
            self.ledger.drain()?;

            let due = self.due_meters()?;
            if due.is_empty() {
                self.set_state(MeterBankState::Idle);
                return Ok(CycleOutcome::Idle);
            }
            self.set_state(MeterBankState::Actuating);

            for index in due {
                loop {
                    if self.stopping.load(Ordering::SeqCst) {
                        return Ok(CycleOutcome::Stopped);
                    }
                    match self.pulse(index)? {
                        PulseOutcome::Pulsed { remaining } => {
                            let meter = &self.meters[index];
                            if remaining < meter.tick_value {
                                debug!("Meter {} ticking stopped", meter.logical_id);
                                self.sink.publish(PlatformEvent::TickStopped {
                                    meter_id: meter.logical_id,
                                });
                                break;
                            }
                        }
                        PulseOutcome::NothingDue => break,
                        PulseOutcome::LedgerDirty => continue 'drain,
                        PulseOutcome::Disabled => return Ok(CycleOutcome::Disabled),
                        PulseOutcome::Failed => return Ok(CycleOutcome::Faulted),
                    }
                }
            }
        }
    }

    fn due_meters(&self) -> Result<Vec<usize>, MeterError> {
        let mut due = Vec::new();
        for (index, meter) in self.meters.iter().enumerate() {
            if meter.tick_value <= 0 || meter.is_suspended() {
                continue;
            }
            if self.ledger.remaining(index)? >= meter.tick_value {
                due.push(index);
            }
        }
        Ok(due)
    }

    fn pulse(&self, index: usize) -> Result<PulseOutcome, MeterError> {
        let _actuation = self.actuation.lock();
        if !self.is_enabled() {
            return Ok(PulseOutcome::Disabled);
        }

        let meter = &self.meters[index];
        let bit = meter.bit();
        let tick = meter.tick_value;

        let mut tx = self.ledger.begin();
        if self.ledger.ledger_in(&tx, index)? != 0 {
            trace!("Meter {} ledger changed, draining again", meter.logical_id);
            return Ok(PulseOutcome::LedgerDirty);
        }
        let remaining = self.ledger.remaining_in(&tx, index)?;
        if tick <= 0 || meter.is_suspended() || remaining < tick {
            return Ok(PulseOutcome::NothingDue);
        }

        if let Err(fault) = self.expect_status(bit, 0) {
            self.report_fault(fault);
            return Ok(PulseOutcome::Failed);
        }

        self.ledger.stage_pulse(&mut tx, index, tick)?;
        tx.commit()?;

        if let Err(fault) = self.handshake(bit) {
            warn!(
                "Meter {} ({}) pulse failed: {:?}",
                meter.logical_id, meter.name, fault
            );
            if let Err(e) = self.driver.clear_meter_bits(bit) {
                warn!("Failed to lower meter bit {}: {}", meter.physical_id, e);
            }
            self.roll_back_pulse(index, tick)?;
            self.report_fault(fault);
            return Ok(PulseOutcome::Failed);
        }

        trace!(
            "Meter {} pulsed, {} left",
            meter.logical_id,
            remaining - tick
        );
        Ok(PulseOutcome::Pulsed {
            remaining: remaining - tick,
        })
    }

    fn handshake(&self, bit: u64) -> Result<(), HardwareFault> {
        self.driver
            .set_meter_bits(bit)
            .map_err(|e| HardwareFault::CommunicationTimeout(e.to_string()))?;
        self.expect_status(self.full_mask, bit)?;
        self.driver
            .clear_meter_bits(bit)
            .map_err(|e| HardwareFault::CommunicationTimeout(e.to_string()))?;
        self.expect_status(self.full_mask, 0)
    }

    fn expect_status(&self, mask: u64, expected: u64) -> Result<(), HardwareFault> {
        let actual = self
            .driver
            .status_meter_bits(mask)
            .map_err(|e| HardwareFault::CommunicationTimeout(e.to_string()))?;
        if actual != expected {
            return Err(HardwareFault::HandshakeMismatch { expected, actual });
        }
        Ok(())
    }

    fn roll_back_pulse(&self, index: usize, tick: i64) -> Result<(), MeterError> {
        let mut tx = self.ledger.begin();
        self.ledger.stage_rollback(&mut tx, index, tick)?;
        tx.commit()?;
        debug!(
            "Meter {} tick rolled back, committed {}",
            self.meters[index].logical_id,
            self.ledger.committed(index)?
        );
        Ok(())
    }

    /// Disable with `ERROR` and announce the fault, once per fault period.
    pub(super) fn report_fault(&self, fault: HardwareFault) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.reasons().contains(DisabledReasons::ERROR) {
                trace!("Meter fault already reported: {:?}", fault);
                return;
            }
            lifecycle.disable(DisabledReasons::ERROR);
        }
        error!("Mechanical meter fault: {:?}", fault);
        self.sink.publish(PlatformEvent::HardwareFault {
            device: DeviceKind::MechanicalMeter,
            fault,
        });
        self.sink.publish(PlatformEvent::StoppedResponding {
            source: DeviceKind::MechanicalMeter,
        });
    }

    /// Check that no meter coil is energized.
    ///
    /// A failing probe disables the bank with `ERROR`; a passing probe
    /// while `ERROR` is set clears it and wakes the worker. Returns whether
    /// the hardware answered as expected.
    pub fn probe_health(&self) -> bool {
        let _actuation = self.actuation.lock();
        match self.expect_status(self.full_mask, 0) {
            Ok(()) => {
                let recovered = {
                    let mut lifecycle = self.lifecycle.lock();
                    if lifecycle.reasons().contains(DisabledReasons::ERROR) {
                        lifecycle.enable(EnabledReason::Reset);
                        true
                    } else {
                        false
                    }
                };
                if recovered {
                    info!("Mechanical meters responding again");
                    self.sink.publish(PlatformEvent::HardwareFaultCleared {
                        device: DeviceKind::MechanicalMeter,
                    });
                    self.sink.publish(PlatformEvent::StartedResponding {
                        source: DeviceKind::MechanicalMeter,
                    });
                    self.wake.notify();
                }
                true
            }
            Err(fault) => {
                self.report_fault(fault);
                false
            }
        }
    }

    /// Pulse one meter for diagnostics without touching its counts.
    ///
    /// Returns `Ok(false)` if the handshake failed, in which case the bank
    /// is faulted as for a worker pulse.
    pub fn manual_pulse(&self, logical_id: u32) -> Result<bool, MeterError> {
        let index = self.index_of(logical_id)?;
        let _actuation = self.actuation.lock();
        {
            let lifecycle = self.lifecycle.lock();
            if !lifecycle.is_enabled() {
                return Err(MeterError::Disabled(lifecycle.reasons()));
            }
        }

        let meter = &self.meters[index];
        info!("Manual pulse on meter {} ({})", meter.logical_id, meter.name);
        let bit = meter.bit();
        let result = self
            .expect_status(bit, 0)
            .and_then(|()| self.handshake(bit));
        match result {
            Ok(()) => Ok(true),
            Err(fault) => {
                if let Err(e) = self.driver.clear_meter_bits(bit) {
                    warn!("Failed to lower meter bit {}: {}", meter.physical_id, e);
                }
                self.report_fault(fault);
                Ok(false)
            }
        }
    }

    /// Stop pulsing one meter. Its advances keep accumulating.
    pub fn suspend_meter(&self, logical_id: u32) -> Result<(), MeterError> {
        let index = self.index_of(logical_id)?;
        self.meters[index].set_suspended(true);
        info!("Meter {} suspended", logical_id);
        Ok(())
    }

    /// Resume pulsing one meter.
    pub fn resume_meter(&self, logical_id: u32) -> Result<(), MeterError> {
        let index = self.index_of(logical_id)?;
        self.meters[index].set_suspended(false);
        info!("Meter {} resumed", logical_id);
        self.wake.notify();
        Ok(())
    }

    /// Add a disable reason to the bank.
    pub fn disable(&self, reason: DisabledReasons) {
        self.lifecycle.lock().disable(reason);
    }

    /// Remove a disable reason; wakes the worker if the bank is enabled.
    pub fn enable(&self, reason: EnabledReason) -> bool {
        let enabled = self.lifecycle.lock().enable(reason);
        if enabled {
            self.wake.notify();
        }
        enabled
    }

    fn set_state(&self, state: MeterBankState) -> bool {
        self.lifecycle.lock().set_state(state)
    }

    /// Whether the bank is enabled.
    pub fn is_enabled(&self) -> bool {
        self.lifecycle.lock().is_enabled()
    }

    /// Current disable reasons.
    pub fn reasons(&self) -> DisabledReasons {
        self.lifecycle.lock().reasons()
    }

    /// Current bank state.
    pub fn state(&self) -> MeterBankState {
        self.lifecycle.lock().state()
    }

    /// Configured meters in slot order.
    pub fn meters(&self) -> &[LogicalMeter] {
        &self.meters
    }

    /// Output mask covering every configured meter.
    pub fn full_mask(&self) -> u64 {
        self.full_mask
    }

    /// Count confirmed by completed pulses.
    pub fn committed_count(&self, logical_id: u32) -> Result<i64, MeterError> {
        Ok(self.ledger.committed(self.index_of(logical_id)?)?)
    }

    /// Drained value still waiting for pulses.
    pub fn remaining(&self, logical_id: u32) -> Result<i64, MeterError> {
        Ok(self.ledger.remaining(self.index_of(logical_id)?)?)
    }

    /// Requested value not yet drained.
    pub fn pending_ledger(&self, logical_id: u32) -> Result<i64, MeterError> {
        Ok(self.ledger.ledger(self.index_of(logical_id)?)?)
    }

    fn index_of(&self, logical_id: u32) -> Result<usize, MeterError> {
        self.by_logical_id
            .get(&logical_id)
            .copied()
            .ok_or(MeterError::UnknownMeter(logical_id))
    }
}

impl EventSink for MechanicalMeterActuator {
    fn publish(&self, event: PlatformEvent) {
        if let PlatformEvent::PropertyChanged { key, enabled } = event {
            if key != METERS_ENABLED_PROPERTY {
                return;
            }
            if enabled {
                self.enable(EnabledReason::Configuration);
            } else {
                self.disable(DisabledReasons::CONFIGURATION);
            }
        }
    }
}

//! Background threads of the meter bank.

use super::{MechanicalMeterActuator, MeterError};
use egm_common::event::HardwareFault;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::{debug, error, info};

impl MechanicalMeterActuator {
    /// Spawn the pulse worker and the health monitor.
    pub fn start(self: &Arc<Self>) -> Result<(), MeterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MeterError::AlreadyRunning);
        }
        self.stopping.store(false, Ordering::SeqCst);

        let worker = {
            let meters = Arc::clone(self);
            thread::Builder::new()
                .name("egm-meter-worker".to_string())
                .spawn(move || meters.worker_loop())
                .map_err(MeterError::Spawn)?
        };
        let monitor = {
            let meters = Arc::clone(self);
            thread::Builder::new()
                .name("egm-meter-health".to_string())
                .spawn(move || meters.monitor_loop())
        };

        let mut threads = self.threads.lock();
        threads.push(worker);
        match monitor {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                drop(threads);
                self.stop();
                return Err(MeterError::Spawn(e));
            }
        }
        Ok(())
    }

    /// Stop both threads. An in-flight pulse completes first.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake.notify();
        self.monitor_wake.notify();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Meter thread panicked");
            }
        }
        if self.started.swap(false, Ordering::SeqCst) {
            info!("Meter bank stopped");
        }
    }

    /// Whether the threads are running.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn worker_loop(&self) {
        info!("Meter worker started");
        while !self.stopping.load(Ordering::SeqCst) {
            match self.run_pending() {
                Ok(outcome) => debug!("Meter cycle finished: {:?}", outcome),
                Err(e) => {
                    // Persistence failures leave the bank disabled until
                    // the health monitor resets it.
                    error!("Meter cycle failed: {}", e);
                    self.report_fault(HardwareFault::PersistenceFailure(e.to_string()));
                }
            }
            self.wake.wait(&self.stopping);
        }
        info!("Meter worker stopped");
    }

    fn monitor_loop(&self) {
        info!(
            "Meter health monitor started ({:?} interval)",
            self.health_interval
        );
        loop {
            self.monitor_wake.wait_timeout(self.health_interval);
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            self.probe_health();
        }
        info!("Meter health monitor stopped");
    }
}

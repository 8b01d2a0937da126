//! I/O core wiring.
//!
//! `IoCore` owns the driver, the persistent store, the event bus and the
//! three services built on top of them (poller, logical inputs, meters),
//! and drives their startup and shutdown order.

use egm_common::config::{ConfigError, ConfigLoader};
use egm_common::device::EnabledReason;
use egm_common::event::{EventBus, EventSink, LogSink, PlatformEvent};
use egm_common::hal::config::IoBoardConfig;
use egm_common::hal::driver::{HalError, IoDriver};
use egm_common::persistence::{PersistenceError, PersistentStore};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::driver_registry::DriverRegistry;
use crate::inputs::LogicalInputService;
use crate::meters::{MechanicalMeterActuator, MeterError};
use crate::poller::{PhysicalIoPoller, PollerError};

/// How often `run` checks the running flag.
const RUN_TICK: Duration = Duration::from_millis(50);

/// Startup and shutdown errors of the I/O core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Driver creation or initialization failed.
    #[error(transparent)]
    Hal(#[from] HalError),

    /// State file could not be opened.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Meter bank failed to initialize or start.
    #[error(transparent)]
    Meter(#[from] MeterError),

    /// Poller thread failed to start.
    #[error(transparent)]
    Poller(#[from] PollerError),

    /// `run` or an accessor was used before `init`.
    #[error("I/O core not initialized")]
    NotInitialized,
}

/// Initialized services.
struct Services {
    driver: Arc<dyn IoDriver>,
    store: Arc<PersistentStore>,
    inputs: Arc<LogicalInputService>,
    poller: Arc<PhysicalIoPoller>,
    meters: Option<Arc<MechanicalMeterActuator>>,
}

/// I/O core: driver, store, bus and services.
pub struct IoCore {
    config: IoBoardConfig,
    bus: Arc<EventBus>,
    services: Option<Services>,
    running: Arc<AtomicBool>,
}

impl IoCore {
    /// Create a core for a validated configuration.
    pub fn new(config: IoBoardConfig) -> Result<Self, CoreError> {
        config.validate()?;
        info!(
            "IoCore created: {} inputs, {} meters, poll period {}ms",
            config.inputs.len(),
            config.meters.len(),
            config.board.poll_period_ms
        );
        Ok(Self {
            config,
            bus: Arc::new(EventBus::new()),
            services: None,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Load the board configuration from a TOML file.
    pub fn load_config(path: &Path) -> Result<IoBoardConfig, CoreError> {
        info!("Loading configuration from {:?}", path);
        let config = IoBoardConfig::load(path)?;
        info!(
            "Loaded config: {} inputs, {} meters",
            config.inputs.len(),
            config.meters.len()
        );
        Ok(config)
    }

    /// Create the driver, open the store, wire the services onto the bus
    /// and start their threads.
    ///
    /// A failed board self test is logged and leaves the poller disabled
    /// for `ERROR`; every other failure aborts initialization.
    pub fn init(&mut self, registry: &DriverRegistry, driver_name: &str) -> Result<(), CoreError> {
        info!("Initializing IoCore with driver '{}'...", driver_name);

        let driver = registry.create_driver(driver_name)?;
        info!("Created driver: {} v{}", driver.name(), driver.version());
        driver.init(&self.config)?;

        let store = match &self.config.board.state_file {
            Some(path) => PersistentStore::open(path)?,
            None => {
                warn!("No state_file configured, meter counts are kept in memory only");
                PersistentStore::in_memory()
            }
        };

        let sink: Arc<dyn EventSink> = self.bus.clone();
        self.bus.subscribe(Arc::new(LogSink));

        let inputs = Arc::new(LogicalInputService::new(&self.config.inputs, sink.clone()));
        self.bus.subscribe(inputs.clone());

        let poller = Arc::new(PhysicalIoPoller::new(
            driver.clone(),
            sink.clone(),
            &self.config.board,
        ));
        self.bus.subscribe(poller.clone());
        if let Err(e) = poller.initialize() {
            warn!("I/O board inspection failed: {}", e);
        }

        let meters = if self.config.meters.is_empty() {
            warn!("No mechanical meters configured, meter bank not started");
            None
        } else {
            let meters = Arc::new(MechanicalMeterActuator::initialize(
                driver.clone(),
                store.clone(),
                sink,
                &self.config,
            )?);
            self.bus.subscribe(meters.clone());
            Some(meters)
        };

        poller.start()?;
        if let Some(meters) = &meters {
            meters.start()?;
        }
        poller.enable(EnabledReason::Configuration);

        self.services = Some(Services {
            driver,
            store,
            inputs,
            poller,
            meters,
        });
        info!("IoCore initialized successfully");
        Ok(())
    }

    /// Block until the running flag is cleared.
    ///
    /// The flag starts set when the core is created, so a shutdown signal
    /// received during `init` makes `run` return immediately.
    ///
    /// With `boot_delay`, `BootCompleted` is published once that much time
    /// has passed; otherwise the platform is expected to publish it.
    pub fn run(&self, boot_delay: Option<Duration>) -> Result<(), CoreError> {
        if self.services.is_none() {
            return Err(CoreError::NotInitialized);
        }

        if detect_rt_mode() {
            info!("Running in real-time mode");
        } else {
            info!("Running in standard (non-RT) mode");
        }

        let started = Instant::now();
        let mut boot_pending = boot_delay;
        while self.running.load(Ordering::SeqCst) {
            if let Some(delay) = boot_pending {
                if started.elapsed() >= delay {
                    info!("Publishing boot completed after {:?}", delay);
                    self.bus.publish(PlatformEvent::BootCompleted);
                    boot_pending = None;
                }
            }
            std::thread::sleep(RUN_TICK);
        }

        if let Some(services) = &self.services {
            let stats = services.poller.stats();
            info!(
                "IoCore stopping after {} poll cycles (violations: {})",
                stats.cycle_count, stats.timing_violations
            );
        }
        Ok(())
    }

    /// Stop the service threads and shut the driver down.
    pub fn shutdown(&mut self) -> Result<(), CoreError> {
        info!("Shutdown requested");
        self.running.store(false, Ordering::SeqCst);

        let Some(services) = self.services.take() else {
            debug!("Shutdown before init, nothing to stop");
            return Ok(());
        };
        services.poller.stop();
        if let Some(meters) = &services.meters {
            meters.stop();
        }
        services.driver.shutdown()?;
        debug!("Store released: {:?}", services.store.path());
        Ok(())
    }

    /// Publish an event onto the platform bus.
    pub fn publish(&self, event: PlatformEvent) {
        self.bus.publish(event);
    }

    /// Subscribe an additional consumer to the platform bus.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSink>) {
        self.bus.subscribe(subscriber);
    }

    /// Get the running flag for signal handlers.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Loaded configuration.
    pub fn config(&self) -> &IoBoardConfig {
        &self.config
    }

    /// The poller, once initialized.
    pub fn poller(&self) -> Result<&Arc<PhysicalIoPoller>, CoreError> {
        Ok(&self.services()?.poller)
    }

    /// The meter bank, once initialized and if any meter is configured.
    pub fn meters(&self) -> Result<Option<&Arc<MechanicalMeterActuator>>, CoreError> {
        Ok(self.services()?.meters.as_ref())
    }

    /// The logical input service, once initialized.
    pub fn inputs(&self) -> Result<&Arc<LogicalInputService>, CoreError> {
        Ok(&self.services()?.inputs)
    }

    /// The active driver, once initialized.
    pub fn driver(&self) -> Result<&Arc<dyn IoDriver>, CoreError> {
        Ok(&self.services()?.driver)
    }

    fn services(&self) -> Result<&Services, CoreError> {
        self.services.as_ref().ok_or(CoreError::NotInitialized)
    }
}

/// Detect if running in real-time mode by checking scheduler policy.
fn detect_rt_mode() -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{SCHED_FIFO, SCHED_RR, sched_getscheduler};
        // SAFETY: sched_getscheduler(0) only queries the calling thread.
        unsafe {
            let policy = sched_getscheduler(0);
            policy == SCHED_FIFO || policy == SCHED_RR
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = IoBoardConfig::default();
        config.board.poll_period_ms = 0;
        assert!(matches!(IoCore::new(config), Err(CoreError::Config(_))));
    }

    #[test]
    fn run_requires_init() {
        let core = IoCore::new(IoBoardConfig::default()).unwrap();
        assert!(matches!(
            core.run(None),
            Err(CoreError::NotInitialized)
        ));
        assert!(core.poller().is_err());
    }

    #[test]
    fn unknown_driver_fails_init() {
        let mut core = IoCore::new(IoBoardConfig::default()).unwrap();
        let registry = DriverRegistry::with_builtin_drivers();
        assert!(matches!(
            core.init(&registry, "ethercat"),
            Err(CoreError::Hal(HalError::DriverNotFound(_)))
        ));
    }

    #[test]
    fn stop_signal_during_init_ends_run() {
        let mut core = IoCore::new(IoBoardConfig::default()).unwrap();
        let running = core.running_flag();
        assert!(running.load(Ordering::SeqCst));

        running.store(false, Ordering::SeqCst);
        core.init(&DriverRegistry::with_builtin_drivers(), "simulation")
            .unwrap();
        core.run(Some(Duration::from_secs(60))).unwrap();
        assert!(!running.load(Ordering::SeqCst));
        core.shutdown().unwrap();
    }

    #[test]
    fn shutdown_before_init_is_noop() {
        let mut core = IoCore::new(IoBoardConfig::default()).unwrap();
        core.shutdown().unwrap();
    }
}

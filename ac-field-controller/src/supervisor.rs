//! Supervisory loop
//!
//! ```text
//!  every tick          read_ac_params (mirror unit -> state)
//!  every N ticks       login, exchange report for directive,
//!                      apply directive, write_ac_params(primary),
//!                      write_ac_params(auxiliary) on a `rented` transition
//!  every tick          restart the telemetry poller if it died
//! ```
//!
//! Nothing that happens inside a tick stops the loop. Each tick produces a
//! [`TickReport`] that is logged, and the next tick starts on schedule.

use crate::config::AppConfig;
use crate::remote::{PanelDirective, RemoteAuthority, RemoteError};
use crate::resources::SharedState;
use crate::synchronizer::{AcSynchronizer, ReadReport, WriteReport};
use crate::telemetry::{PollerHandle, TelemetryBus, TelemetryError};
use embedded_hal::digital::OutputPin;
use log::{debug, error, info, warn};
use rtdnet_rs::SerialChannel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Fires on the first call, then every `reload` calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prescaler {
    remaining: u32,
}

impl Default for Prescaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Prescaler {
    pub fn new() -> Self {
        Self { remaining: 1 }
    }

    /// Count one tick; `reload` is re-read every time the prescaler fires
    pub fn tick(&mut self, reload: u32) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = reload.max(1);
            true
        } else {
            false
        }
    }
}

/// Detects transitions of a boolean flag; starts out `false`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeDetector {
    last: bool,
}

impl EdgeDetector {
    /// Returns true if `value` differs from the previous one
    pub fn update(&mut self, value: bool) -> bool {
        let changed = value != self.last;
        self.last = value;
        changed
    }

    pub fn value(&self) -> bool {
        self.last
    }
}

/// Result of a remote reconciliation
#[derive(Debug)]
pub struct ReconcileReport {
    pub directive: PanelDirective,
    pub primary: WriteReport,
    /// Present only when `rented` changed
    pub auxiliary: Option<WriteReport>,
}

/// Everything that happened during one tick
#[derive(Debug)]
pub struct TickReport {
    pub tick: u64,
    pub refresh: ReadReport,
    /// Present on ticks where the prescaler fired
    pub reconcile: Option<Result<ReconcileReport, RemoteError>>,
    /// Present when the poller was found dead and restarted
    pub watchdog: Option<Result<(), TelemetryError>>,
}

impl TickReport {
    /// Number of failed steps in this tick
    pub fn failure_count(&self) -> usize {
        let mut count = self.refresh.failures().count();
        match &self.reconcile {
            Some(Ok(reconcile)) => {
                count += reconcile.primary.failures().count();
                count += reconcile
                    .auxiliary
                    .as_ref()
                    .map_or(0, |aux| aux.failures().count());
            }
            Some(Err(_)) => count += 1,
            None => {}
        }
        if matches!(self.watchdog, Some(Err(_))) {
            count += 1;
        }
        count
    }

    pub fn log(&self) {
        for (step, err) in self.refresh.failures() {
            warn!("Tick {}: reading {} failed: {}", self.tick, step, err);
        }
        if self.refresh.changed {
            info!("Tick {}: AC unit reported new settings", self.tick);
        }
        match &self.reconcile {
            Some(Err(e)) => error!("Tick {}: remote reconciliation failed: {}", self.tick, e),
            Some(Ok(reconcile)) => {
                let auxiliary = reconcile.auxiliary.as_ref();
                debug!(
                    "Tick {}: reconciled, relays 0x{:03X}, primary 0x{:02X} {}, auxiliary {}",
                    self.tick,
                    reconcile.directive.relay_mask(),
                    reconcile.primary.address,
                    if reconcile.primary.is_complete() { "ok" } else { "incomplete" },
                    match auxiliary {
                        Some(aux) if aux.is_complete() => "ok",
                        Some(_) => "incomplete",
                        None => "untouched",
                    }
                );
            }
            None => {}
        }
        if let Some(Err(e)) = &self.watchdog {
            error!("Tick {}: {}", self.tick, e);
        }

        let failures = self.failure_count();
        if failures > 0 {
            warn!("Tick {}: {} step(s) failed", self.tick, failures);
        }
    }
}

/// Sequences refresh, reconciliation and the poller watchdog
pub struct Supervisor<C, D, R, T: TelemetryBus> {
    config: AppConfig,
    state: SharedState,
    sync: AcSynchronizer<C, D>,
    remote: R,
    telemetry: T,
    poller: Option<T::Handle>,
    prescaler: Prescaler,
    rented: EdgeDetector,
    ticks: u64,
}

impl<C, D, R, T> Supervisor<C, D, R, T>
where
    C: SerialChannel,
    D: OutputPin,
    R: RemoteAuthority,
    T: TelemetryBus,
{
    /// Set up the telemetry modules and start the first poller
    pub fn new(
        config: AppConfig,
        state: SharedState,
        sync: AcSynchronizer<C, D>,
        remote: R,
        mut telemetry: T,
    ) -> Self {
        if let Err(e) = telemetry.initiate_modules() {
            error!("Telemetry initialisation failed: {}", e);
        }
        let poller = match telemetry.start_updates(state.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("{}", e);
                None
            }
        };

        Self {
            config,
            state,
            sync,
            remote,
            telemetry,
            poller,
            prescaler: Prescaler::new(),
            rented: EdgeDetector::default(),
            ticks: 0,
        }
    }

    /// Run one tick
    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;

        let refresh = self.sync.read_ac_params(&self.state);
        let snapshot = self.state.snapshot();
        debug!(
            "Measured temperature {:?}, output currents {:?}",
            snapshot.temperature, snapshot.output_currents
        );

        let reconcile = if self.prescaler.tick(self.config.logger.prescaler) {
            Some(self.reconcile())
        } else {
            None
        };

        let watchdog = self.watchdog();

        TickReport {
            tick: self.ticks,
            refresh,
            reconcile,
            watchdog,
        }
    }

    fn reconcile(&mut self) -> Result<ReconcileReport, RemoteError> {
        let token = self.remote.authenticate()?;
        let report = self.state.snapshot().report();
        let directive = self.remote.exchange(&token, &report)?;

        self.state.update(|r| r.apply_directive(&directive));
        let primary = self
            .sync
            .write_ac_params(&self.state, self.config.addresses.primary);

        // The auxiliary unit follows the rental status, not every directive
        let auxiliary = if self.rented.update(directive.rented) {
            info!(
                "Rental status changed to {}, updating auxiliary AC 0x{:02X}",
                directive.rented, self.config.addresses.auxiliary
            );
            Some(
                self.sync
                    .write_ac_params(&self.state, self.config.addresses.auxiliary),
            )
        } else {
            None
        };

        Ok(ReconcileReport {
            directive,
            primary,
            auxiliary,
        })
    }

    fn watchdog(&mut self) -> Option<Result<(), TelemetryError>> {
        if self.poller.as_ref().is_some_and(|p| p.is_alive()) {
            return None;
        }

        warn!("Telemetry poller is not running, restarting");
        Some(match self.telemetry.start_updates(self.state.clone()) {
            Ok(handle) => {
                self.poller = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.poller = None;
                Err(e)
            }
        })
    }

    /// Tick until `shutdown` is raised
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let period = self.config.refresh_period();
        info!(
            "Supervisor running for AC 0x{:02X}, tick {:?}, remote every {} ticks",
            self.sync.primary(),
            period,
            self.config.logger.prescaler
        );

        while !shutdown.load(Ordering::SeqCst) {
            let report = self.tick();
            report.log();
            thread::sleep(period);
        }

        info!(
            "Supervisor stopped after {} ticks (rented: {})",
            self.ticks,
            self.rented.value()
        );
    }

    pub fn synchronizer(&self) -> &AcSynchronizer<C, D> {
        &self.sync
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }
}

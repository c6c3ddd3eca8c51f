//! AC parameter synchronization
//!
//! Pushes the control values from [`SharedState`] to an AC unit and mirrors the
//! unit's own values back. Each register or coil access is a separate
//! transaction whose outcome is reported on its own; one failing step never
//! stops the others and nothing is rolled back.

use crate::resources::SharedState;
use chrono::Local;
use embedded_hal::digital::OutputPin;
use log::{info, warn};
use rtdnet_rs::registry::{Register, FIXED_OPERATING_MODE};
use rtdnet_rs::{ProtocolEngine, ProtocolError, SerialChannel};

/// Outcome of one write pass
#[derive(Debug)]
pub struct WriteReport {
    pub address: u8,
    pub setpoint: Result<(), ProtocolError>,
    pub mode: Result<(), ProtocolError>,
    pub power: Result<(), ProtocolError>,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Failed steps with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &ProtocolError)> {
        [
            ("setpoint", &self.setpoint),
            ("mode", &self.mode),
            ("on/off", &self.power),
        ]
        .into_iter()
        .filter_map(|(step, result)| result.as_ref().err().map(|e| (step, e)))
    }
}

/// Outcome of one read pass
#[derive(Debug)]
pub struct ReadReport {
    pub setpoint: Result<u16, ProtocolError>,
    pub mode: Result<u16, ProtocolError>,
    pub fan_speed: Result<u16, ProtocolError>,
    pub power: Result<bool, ProtocolError>,
    /// A mirrored value changed and the change timestamp moved
    pub changed: bool,
}

impl ReadReport {
    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &ProtocolError)> {
        [
            ("setpoint", self.setpoint.as_ref().err()),
            ("mode", self.mode.as_ref().err()),
            ("fan speed", self.fan_speed.as_ref().err()),
            ("on/off", self.power.as_ref().err()),
        ]
        .into_iter()
        .filter_map(|(step, err)| err.map(|e| (step, e)))
    }
}

/// Reads and writes AC parameters through a protocol engine
pub struct AcSynchronizer<C, D> {
    engine: ProtocolEngine<C, D>,
    primary: u8,
}

impl<C: SerialChannel, D: OutputPin> AcSynchronizer<C, D> {
    /// `primary` is the unit mirrored by [`read_ac_params`](Self::read_ac_params)
    pub fn new(engine: ProtocolEngine<C, D>, primary: u8) -> Self {
        Self { engine, primary }
    }

    /// Write setpoint, operating mode and on/off state to the unit at `address`
    pub fn write_ac_params(&mut self, state: &SharedState, address: u8) -> WriteReport {
        let desired = state.snapshot().desired();

        let setpoint = self
            .engine
            .write_register(address, Register::Setpoint, desired.setpoint);
        let mode = self
            .engine
            .write_register(address, Register::Mode, FIXED_OPERATING_MODE);
        let power = self
            .engine
            .write_coil(address, Register::OnOff, desired.on);

        let report = WriteReport {
            address,
            setpoint,
            mode,
            power,
        };
        for (step, err) in report.failures() {
            warn!("Writing {} to AC 0x{:02X} failed: {}", step, address, err);
        }
        report
    }

    /// Read the primary unit's parameters and mirror setpoint and on/off into `state`
    pub fn read_ac_params(&mut self, state: &SharedState) -> ReadReport {
        let address = self.primary;
        let mut changed = false;

        let setpoint = self.engine.read_register(address, Register::Setpoint);
        if let Ok(value) = setpoint {
            info!("Setpoint temperature: {}", value);
            changed |= state.update(|r| r.mirror_setpoint(value, Local::now()));
        }

        let mode = self.engine.read_register(address, Register::Mode);
        if let Ok(value) = mode {
            info!("AC mode: {}", value);
        }

        let fan_speed = self.engine.read_register(address, Register::FanSpeed);
        if let Ok(value) = fan_speed {
            info!("AC fan speed level: {}", value);
        }

        let power = self.engine.read_coil(address, Register::OnOff);
        if let Ok(on) = power {
            info!("AC state on/off: {}", u8::from(on));
            changed |= state.update(|r| r.mirror_power(on, Local::now()));
        }

        ReadReport {
            setpoint,
            mode,
            fan_speed,
            power,
            changed,
        }
    }

    /// Check that the unit at `address` answers: setpoint read, then mode read
    pub fn probe(&mut self, address: u8) -> Result<(), ProtocolError> {
        match self.engine.read_register(address, Register::Setpoint) {
            Ok(setpoint) => {
                info!("AC interface 0x{:02X} alive (setpoint {})", address, setpoint);
                let mode = self.engine.read_register(address, Register::Mode)?;
                info!("AC interface 0x{:02X} mode {}", address, mode);
                Ok(())
            }
            Err(e) => {
                warn!("AC interface 0x{:02X} is dead: {}", address, e);
                Err(e)
            }
        }
    }

    pub fn primary(&self) -> u8 {
        self.primary
    }

    pub fn engine(&self) -> &ProtocolEngine<C, D> {
        &self.engine
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::{AcTarget, Resources};
    use rtdnet_rs::sim::{BusLog, Fault, RecordingPin, SimulatedBus};
    use rtdnet_rs::transport::{BusTiming, HalfDuplexTransport};
    use std::time::Duration;

    pub(crate) type SimSynchronizer = AcSynchronizer<SimulatedBus, RecordingPin>;

    /// Synchronizer on a simulated bus with zero turnaround delays
    pub(crate) fn sim_synchronizer(addresses: &[u8]) -> (SimSynchronizer, SimulatedBus, BusLog) {
        let _ = env_logger::builder().is_test(true).try_init();
        let log = BusLog::new();
        let bus = SimulatedBus::with_units(&log, addresses);
        let timing = BusTiming {
            settle: Duration::ZERO,
            drain: Duration::ZERO,
            rx_timeout: Duration::from_millis(100),
        };
        let transport = HalfDuplexTransport::new(bus.clone(), RecordingPin::new(&log), timing).unwrap();
        (AcSynchronizer::new(ProtocolEngine::new(transport), 0x01), bus, log)
    }

    #[test]
    fn test_write_pushes_all_three_values() {
        let (mut sync, bus, _log) = sim_synchronizer(&[0x01]);
        bus.set_register(0x01, Register::Mode, 1);
        let state = SharedState::new(Resources::new(10));
        state.update(|r| {
            r.target = Some(AcTarget {
                setpoint: 19,
                on: true,
            })
        });

        let report = sync.write_ac_params(&state, 0x01);

        assert!(report.is_complete());
        assert_eq!(bus.register(0x01, Register::Setpoint), Some(19));
        assert_eq!(bus.register(0x01, Register::Mode), Some(5));
        assert_eq!(bus.coil(0x01, Register::OnOff), Some(true));
    }

    #[test]
    fn test_failed_write_step_does_not_stop_the_rest() {
        let (mut sync, bus, _log) = sim_synchronizer(&[0x01]);
        bus.inject(Fault::Silent);
        let state = SharedState::new(Resources::new(10));
        state.update(|r| r.temp_on = true);

        // No target yet: the mirrored values are written back
        let report = sync.write_ac_params(&state, 0x01);

        assert!(report.setpoint.is_err());
        assert!(report.mode.is_ok());
        assert!(report.power.is_ok());
        assert_eq!(report.failures().map(|(step, _)| step).collect::<Vec<_>>(), vec!["setpoint"]);
        assert_eq!(bus.coil(0x01, Register::OnOff), Some(true));
    }

    #[test]
    fn test_read_mirrors_changes_and_stamps() {
        let (mut sync, bus, _log) = sim_synchronizer(&[0x01]);
        bus.set_register(0x01, Register::Setpoint, 25);
        let state = SharedState::new(Resources::new(10));

        let report = sync.read_ac_params(&state);

        assert!(report.changed);
        assert_eq!(report.fan_speed.unwrap(), 1);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.ac_temp, 25);
        assert!(!snapshot.temp_on);
        assert!(snapshot.last_change.is_some());
    }

    #[test]
    fn test_read_without_change_keeps_stamp() {
        let (mut sync, _bus, _log) = sim_synchronizer(&[0x01]);
        let state = SharedState::new(Resources::new(10));

        // Unit and local state agree on setpoint 22 and off
        let report = sync.read_ac_params(&state);

        assert!(!report.changed);
        assert_eq!(state.snapshot().last_change, None);
    }

    #[test]
    fn test_short_register_reply_leaves_state_untouched() {
        let (mut sync, bus, _log) = sim_synchronizer(&[0x01]);
        bus.set_register(0x01, Register::Setpoint, 30);
        bus.inject(Fault::Truncate(1));
        let state = SharedState::new(Resources::new(10));

        let report = sync.read_ac_params(&state);

        assert!(matches!(report.setpoint, Err(ProtocolError::ShortRead { expected: 7, actual: 6 })));
        assert!(report.mode.is_ok());
        let snapshot = state.snapshot();
        assert_eq!(snapshot.ac_temp, 22);
        assert_eq!(snapshot.last_change, None);
    }

    #[test]
    fn test_probe() {
        let (mut sync, _bus, log) = sim_synchronizer(&[0x01]);
        sync.probe(0x01).unwrap();
        assert_eq!(log.writes().len(), 2);

        let err = sync.probe(0x05).unwrap_err();
        assert!(err.is_no_response());
        // A dead unit is not asked for its mode
        assert_eq!(log.writes().len(), 3);
    }
}

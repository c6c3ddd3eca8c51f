//! Shared controller state ("resources")
//!
//! One [`Resources`] value holds everything the controller knows: measured
//! values written by the telemetry poller, and control values that are mirrored
//! from the AC unit or set by the remote panel.
//!
//! [`SharedState`] guards it with a single mutex. The lock is only ever held for
//! a field update or a snapshot copy, never across bus or network I/O.

use crate::remote::PanelDirective;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Format of the last-change timestamp in reports
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Number of relay outputs driven from the panel
pub const RELAY_COUNT: usize = 10;

/// Controller state
#[derive(Debug, Clone, PartialEq)]
pub struct Resources {
    /// Last measured room temperature
    pub temperature: Option<f32>,
    /// Last measured output currents
    pub output_currents: Vec<f32>,
    history: VecDeque<f32>,
    max_samples: usize,

    /// Setpoint last reported by the AC unit
    pub ac_temp: u16,
    /// On/off state last reported by the AC unit
    pub temp_on: bool,
    /// Values the panel asked for, until then the unit's own values are kept
    pub target: Option<AcTarget>,
    pub anti_freeze: bool,
    /// Relay outputs, bit `n` = output `n + 1`
    pub relays: u16,
    /// When a mirrored value last changed
    pub last_change: Option<DateTime<Local>>,
}

impl Default for Resources {
    fn default() -> Self {
        Self::new(300)
    }
}

impl Resources {
    pub fn new(max_samples: usize) -> Self {
        Self {
            temperature: None,
            output_currents: Vec::new(),
            history: VecDeque::with_capacity(max_samples),
            max_samples,
            ac_temp: 22,
            temp_on: false,
            target: None,
            anti_freeze: false,
            relays: 0,
            last_change: None,
        }
    }

    /// Record a temperature sample; the oldest sample is dropped once the history is full
    pub fn push_temperature(&mut self, value: f32) {
        self.temperature = Some(value);
        self.history.push_back(value);
        while self.history.len() > self.max_samples {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = f32> + '_ {
        self.history.iter().copied()
    }

    /// Mirror the setpoint read back from the unit; returns true if it changed
    pub fn mirror_setpoint(&mut self, value: u16, now: DateTime<Local>) -> bool {
        if self.ac_temp == value {
            return false;
        }
        self.ac_temp = value;
        self.last_change = Some(now);
        true
    }

    /// Mirror the on/off state read back from the unit; returns true if it changed
    pub fn mirror_power(&mut self, on: bool, now: DateTime<Local>) -> bool {
        if self.temp_on == on {
            return false;
        }
        self.temp_on = on;
        self.last_change = Some(now);
        true
    }

    /// Take over the control values sent by the panel.
    ///
    /// Setpoint and on/off become the target written to the unit; the mirrored
    /// values only move once the unit reports them.
    pub fn apply_directive(&mut self, directive: &PanelDirective) {
        self.relays = directive.relay_mask();
        self.anti_freeze = directive.freeze_protect;
        self.target = Some(AcTarget {
            setpoint: directive.temp_set,
            on: directive.temp_on,
        });
    }

    /// What the AC unit should be set to
    pub fn desired(&self) -> AcTarget {
        self.target.unwrap_or(AcTarget {
            setpoint: self.ac_temp,
            on: self.temp_on,
        })
    }

    /// Snapshot sent to the panel
    pub fn report(&self) -> StateReport {
        StateReport {
            temperature: self.temperature,
            output_currents: self.output_currents.clone(),
            temperature_history: self.history().collect(),
            ac_temp: self.ac_temp,
            temp_on: self.temp_on,
            anti_freeze: self.anti_freeze,
            relays: self.relays,
            last_change: self
                .last_change
                .map(|t| t.format(TIMESTAMP_FORMAT).to_string()),
        }
    }
}

/// Setpoint and on/off state requested for the AC unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcTarget {
    pub setpoint: u16,
    pub on: bool,
}

/// State as reported to the remote panel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateReport {
    pub temperature: Option<f32>,
    pub output_currents: Vec<f32>,
    pub temperature_history: Vec<f32>,
    pub ac_temp: u16,
    pub temp_on: bool,
    pub anti_freeze: bool,
    pub relays: u16,
    pub last_change: Option<String>,
}

/// Mutex-guarded [`Resources`] shared between the supervisor and the telemetry poller
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<Resources>>,
}

impl SharedState {
    pub fn new(resources: Resources) -> Self {
        Self {
            inner: Arc::new(Mutex::new(resources)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Resources> {
        // A panicking writer leaves at worst one stale field behind
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> Resources {
        self.lock().clone()
    }

    /// Apply `f` under the lock
    pub fn update<R>(&self, f: impl FnOnce(&mut Resources) -> R) -> R {
        f(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 17, 12, 0, secs).unwrap()
    }

    #[test]
    fn test_history_is_bounded() {
        let mut resources = Resources::new(3);
        for value in [20.0, 20.5, 21.0, 21.5, 22.0] {
            resources.push_temperature(value);
        }

        assert_eq!(resources.history().collect::<Vec<_>>(), vec![21.0, 21.5, 22.0]);
        assert_eq!(resources.temperature, Some(22.0));
    }

    #[test]
    fn test_mirror_stamps_only_on_change() {
        let mut resources = Resources::new(10);

        assert!(!resources.mirror_setpoint(22, at(0)));
        assert_eq!(resources.last_change, None);

        assert!(resources.mirror_setpoint(24, at(1)));
        assert_eq!(resources.last_change, Some(at(1)));

        assert!(!resources.mirror_setpoint(24, at(2)));
        assert_eq!(resources.last_change, Some(at(1)));

        assert!(resources.mirror_power(true, at(3)));
        assert_eq!(resources.last_change, Some(at(3)));
    }

    #[test]
    fn test_directive_sets_target_not_mirror() {
        let mut resources = Resources::new(10);
        assert_eq!(resources.desired(), AcTarget { setpoint: 22, on: false });

        let directive = PanelDirective {
            outputs: [true, false, true, false, false, false, false, false, false, false],
            temp_set: 24,
            temp_on: true,
            freeze_protect: true,
            rented: false,
        };
        resources.apply_directive(&directive);

        assert_eq!(resources.desired(), AcTarget { setpoint: 24, on: true });
        assert_eq!(resources.ac_temp, 22);
        assert!(!resources.temp_on);
        assert_eq!(resources.relays, 0b101);
        assert!(resources.anti_freeze);
        assert_eq!(resources.last_change, None);
    }

    #[test]
    fn test_report_formats_timestamp() {
        let mut resources = Resources::new(10);
        resources.mirror_power(true, at(7));

        let report = resources.report();
        assert_eq!(report.last_change.as_deref(), Some("2024-05-17 12:00:07"));
        assert!(report.temp_on);
    }

    #[test]
    fn test_shared_state_snapshot_is_a_copy() {
        let state = SharedState::new(Resources::new(10));
        let before = state.snapshot();

        state.update(|r| r.relays = 0b101);

        assert_eq!(before.relays, 0);
        assert_eq!(state.snapshot().relays, 0b101);
    }
}

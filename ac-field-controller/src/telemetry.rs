//! Telemetry bus and background poller
//!
//! Measured values (room temperature, output currents) are collected on a
//! background thread and written into [`SharedState`]. The supervisor only sees
//! the poller through [`PollerHandle::is_alive`] and restarts it when it dies.

use crate::resources::SharedState;
use log::{debug, error, info};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Telemetry errors
#[derive(Debug)]
pub enum TelemetryError {
    /// Poller thread could not be started
    Spawn(io::Error),
    /// Measurement source failed
    Source(String),
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelemetryError::Spawn(e) => write!(f, "Failed to start telemetry poller: {}", e),
            TelemetryError::Source(msg) => write!(f, "Measurement source error: {}", msg),
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Liveness of a running poller
pub trait PollerHandle {
    fn is_alive(&self) -> bool;
}

/// Source of measured values
pub trait TelemetryBus {
    type Handle: PollerHandle;

    /// One-time setup of the measurement modules
    fn initiate_modules(&mut self) -> Result<(), TelemetryError>;

    /// Start a poller that keeps `state` updated
    fn start_updates(&mut self, state: SharedState) -> Result<Self::Handle, TelemetryError>;
}

/// One set of measured values
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Measurement {
    pub temperature: Option<f32>,
    #[serde(default)]
    pub output_currents: Vec<f32>,
}

/// Produces measurements on demand
pub trait MeasurementSource: Clone + Send + 'static {
    fn measure(&mut self) -> Result<Measurement, TelemetryError>;
}

/// Measurements from a JSON snapshot file kept up to date by the I/O module daemon
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl MeasurementSource for FileSource {
    fn measure(&mut self) -> Result<Measurement, TelemetryError> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| TelemetryError::Source(format!("{}: {}", self.path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| TelemetryError::Source(format!("{}: {}", self.path.display(), e)))
    }
}

/// One poll of the background thread
pub trait Sampler: Clone + Send + 'static {
    fn sample(&mut self, state: &SharedState) -> Result<(), TelemetryError>;
}

/// Stores each measurement and appends the temperature to the chart history
#[derive(Debug, Clone)]
pub struct HistorySampler<M> {
    source: M,
}

impl<M: MeasurementSource> HistorySampler<M> {
    pub fn new(source: M) -> Self {
        Self { source }
    }
}

impl<M: MeasurementSource> Sampler for HistorySampler<M> {
    fn sample(&mut self, state: &SharedState) -> Result<(), TelemetryError> {
        let measurement = self.source.measure()?;
        state.update(|r| {
            if let Some(temperature) = measurement.temperature {
                r.push_temperature(temperature);
            }
            r.output_currents = measurement.output_currents;
        });
        Ok(())
    }
}

/// Handle to a poller thread
#[derive(Debug)]
pub struct ThreadHandle {
    thread: JoinHandle<()>,
}

impl PollerHandle for ThreadHandle {
    fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Runs a [`Sampler`] on a named thread at a fixed interval.
///
/// A sampler error ends the thread; the supervisor's watchdog starts a new one.
pub struct ThreadedTelemetry<S> {
    sampler: S,
    interval: Duration,
    stop: Arc<AtomicBool>,
    starts: u32,
}

impl<S: Sampler> ThreadedTelemetry<S> {
    pub fn new(sampler: S, interval: Duration) -> Self {
        Self {
            sampler,
            interval,
            stop: Arc::new(AtomicBool::new(false)),
            starts: 0,
        }
    }

    /// Ask running pollers to finish after their current sample
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// How many pollers have been started so far
    pub fn starts(&self) -> u32 {
        self.starts
    }
}

impl<S: Sampler> TelemetryBus for ThreadedTelemetry<S> {
    type Handle = ThreadHandle;

    fn initiate_modules(&mut self) -> Result<(), TelemetryError> {
        info!("Telemetry poller configured, interval {:?}", self.interval);
        Ok(())
    }

    fn start_updates(&mut self, state: SharedState) -> Result<ThreadHandle, TelemetryError> {
        let mut sampler = self.sampler.clone();
        let interval = self.interval;
        let stop = Arc::clone(&self.stop);

        let thread = thread::Builder::new()
            .name("telemetry".to_string())
            .spawn(move || {
                debug!("Telemetry poller started");
                while !stop.load(Ordering::SeqCst) {
                    if let Err(e) = sampler.sample(&state) {
                        error!("Telemetry poller stopped: {}", e);
                        return;
                    }
                    thread::sleep(interval);
                }
                debug!("Telemetry poller finished");
            })
            .map_err(TelemetryError::Spawn)?;

        self.starts += 1;
        Ok(ThreadHandle { thread })
    }
}

//! Controller configuration loaded from a TOML file
//!
//! Every section and key is optional; missing values fall back to the defaults
//! below. The file is read once at startup. If it cannot be read or parsed the
//! controller keeps retrying until it can, so a controller booted before its
//! configuration is provisioned simply waits for it.

use anyhow::{bail, Context};
use log::{info, warn};
use rtdnet_rs::serial::{SerialSettings, SUPPORTED_BAUD_RATES};
use rtdnet_rs::transport::BusTiming;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ac-field-controller/config.toml";

/// Controller configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub parameters: Parameters,
    pub logger: LoggerConfig,
    pub charts: ChartsConfig,
    pub addresses: Addresses,
    pub serial: SerialConfig,
    pub telemetry: TelemetryConfig,
    pub remote: RemoteConfig,
}

/// Supervisor timing
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Parameters {
    /// Base tick of the supervisor loop
    pub refresh_period_ms: u64,
    /// Pause between initialisation and the first tick
    pub startup_delay_secs: u64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            refresh_period_ms: 1000,
            startup_delay_secs: 5,
        }
    }
}

/// Remote reconciliation cadence
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerConfig {
    /// Reconcile with the remote panel every N ticks
    pub prescaler: u32,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { prescaler: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChartsConfig {
    /// Temperature samples kept for charting
    pub max_samples: usize,
}

impl Default for ChartsConfig {
    fn default() -> Self {
        Self { max_samples: 300 }
    }
}

/// Bus addresses of the primary and auxiliary AC units
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Addresses {
    pub primary: u8,
    pub auxiliary: u8,
}

impl Default for Addresses {
    fn default() -> Self {
        Self {
            primary: 0x01,
            auxiliary: 0x02,
        }
    }
}

/// How the RS-485 driver is keyed
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DirectionLine {
    /// Port's RTS signal
    Rts,
    /// GPIO exported through sysfs
    Gpio { line: u32 },
}

impl Default for DirectionLine {
    fn default() -> Self {
        DirectionLine::Gpio { line: 22 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    pub device: PathBuf,
    pub baud_rate: u32,
    pub direction: DirectionLine,
    pub settle_ms: u64,
    pub drain_ms: u64,
    pub rx_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(rtdnet_rs::serial::DEFAULT_PORT),
            baud_rate: 9600,
            direction: DirectionLine::default(),
            settle_ms: 6,
            drain_ms: 4,
            rx_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Measurement snapshot written by the I/O module daemon
    pub source: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("/run/ac-field-controller/measurements.json"),
            poll_interval_ms: 1000,
        }
    }
}

/// Remote control panel endpoint and credentials
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    pub base_url: String,
    pub login_path: String,
    pub exchange_path: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            login_path: "login".to_string(),
            exchange_path: "exchange".to_string(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Parse and validate a configuration document
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("can't read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Keep trying to load `path` until it succeeds.
    ///
    /// Returns `None` only if `shutdown` is raised while waiting.
    pub fn load_with_retry(path: &Path, retry_delay: Duration, shutdown: &AtomicBool) -> Option<Self> {
        loop {
            match Self::load(path) {
                Ok(config) => {
                    info!("Config file loaded from {}", path.display());
                    return Some(config);
                }
                Err(e) => warn!("Config file issue: {:#}", e),
            }

            if shutdown.load(Ordering::SeqCst) {
                return None;
            }
            thread::sleep(retry_delay);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.logger.prescaler == 0 {
            bail!("logger.prescaler must be at least 1");
        }
        if self.parameters.refresh_period_ms == 0 {
            bail!("parameters.refresh_period_ms must be positive");
        }
        if self.charts.max_samples == 0 {
            bail!("charts.max_samples must be positive");
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            bail!(
                "serial.baud_rate {} is not supported (use one of {:?})",
                self.serial.baud_rate,
                SUPPORTED_BAUD_RATES
            );
        }
        if self.remote.timeout_secs == 0 {
            bail!("remote.timeout_secs must be positive");
        }
        if self.addresses.primary == self.addresses.auxiliary {
            bail!("addresses.primary and addresses.auxiliary must differ");
        }
        Ok(())
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.parameters.refresh_period_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.parameters.startup_delay_secs)
    }

    pub fn bus_timing(&self) -> BusTiming {
        BusTiming {
            settle: Duration::from_millis(self.serial.settle_ms),
            drain: Duration::from_millis(self.serial.drain_ms),
            rx_timeout: Duration::from_millis(self.serial.rx_timeout_ms),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        let mut settings =
            SerialSettings::new(self.serial.device.to_string_lossy(), self.serial.baud_rate);
        settings.timeout = Duration::from_millis(self.serial.rx_timeout_ms);
        settings
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

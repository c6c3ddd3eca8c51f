//! Serial port backends.
//!
//! [`SerialLink`] wraps a `serialport` device as a [`SerialChannel`]. A link can
//! be created while the adapter is missing; it then tries to reopen the port on
//! every access, so a controller started before its USB adapter keeps running
//! and picks the adapter up later.
//!
//! Two direction lines are provided: [`RtsDirection`] drives the port's RTS
//! signal (adapters that key the RS-485 driver from RTS) and
//! [`SysfsGpioDirection`] drives a GPIO through `/sys/class/gpio`.
//!
//! The link and its RTS line share one port slot. Whichever side notices that
//! the device went away drops the handle, and whichever side touches the slot
//! next reopens it and puts RTS back to the level last requested.

use crate::transport::SerialChannel;
use embedded_hal::digital::{self, ErrorKind, ErrorType, OutputPin};
use log::{error, info, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Baud rates the AC interface supports
pub const SUPPORTED_BAUD_RATES: [u32; 2] = [9600, 38400];

/// Default device path of the RS-485 adapter
pub const DEFAULT_PORT: &str = "/dev/ttySC1";

/// Attempts at configuring a freshly exported GPIO
const GPIO_SETUP_ATTEMPTS: u32 = 10;

/// Pause between GPIO setup attempts while udev adjusts the new node
const GPIO_SETUP_RETRY: Duration = Duration::from_millis(50);

/// Serial line settings (8N1, no flow control)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    /// Timeout applied to blocking reads when no explicit one is given
    pub timeout: Duration,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout: crate::transport::RX_TIMEOUT,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, 9600)
    }
}

/// What the link needs from an open device
pub trait SerialDevice: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Fill `buf` until full or `timeout` has elapsed; returns the byte count
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn discard_input(&mut self) -> io::Result<()>;

    /// Drive RTS; `true` asserts it
    fn set_rts(&mut self, asserted: bool) -> io::Result<()>;
}

impl SerialDevice for Box<dyn SerialPort> {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(self, bytes)?;
        Write::flush(self)
    }

    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        read_until(&mut **self, buf, timeout)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn set_rts(&mut self, asserted: bool) -> io::Result<()> {
        self.write_request_to_send(asserted).map_err(io::Error::from)
    }
}

/// Opens a device for the given settings
pub type Connector<P> = Box<dyn FnMut(&SerialSettings) -> io::Result<P> + Send>;

fn connect(settings: &SerialSettings) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(&settings.path, settings.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(settings.timeout)
        .open()
}

fn serialport_connector() -> Connector<Box<dyn SerialPort>> {
    Box::new(|settings: &SerialSettings| connect(settings).map_err(io::Error::from))
}

/// Port handle shared by a link and its RTS line
struct PortSlot<P> {
    settings: SerialSettings,
    port: Option<P>,
    connect: Connector<P>,
    /// RTS level last requested by a direction line
    rts: Option<bool>,
}

impl<P: SerialDevice> PortSlot<P> {
    fn not_connected(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            format!("{} is not open", self.settings.path),
        )
    }

    fn port(&mut self) -> io::Result<&mut P> {
        if self.port.is_none() {
            match (self.connect)(&self.settings) {
                Ok(mut port) => {
                    info!("Reopened serial port {}", self.settings.path);
                    // A new handle comes up with the driver's default RTS level
                    if let Some(asserted) = self.rts {
                        if let Err(e) = port.set_rts(asserted) {
                            warn!("Can't restore RTS on {}: {}", self.settings.path, e);
                        }
                    }
                    self.port = Some(port);
                }
                Err(e) => {
                    warn!("Serial port {} still unavailable: {}", self.settings.path, e);
                }
            }
        }
        let missing = self.not_connected();
        self.port.as_mut().ok_or(missing)
    }

    /// Run `op` on the port, reopening it first if needed
    fn with_port<R>(&mut self, op: impl FnOnce(&mut P) -> io::Result<R>) -> io::Result<R> {
        let result = op(self.port()?);
        if let Err(e) = &result {
            self.drop_if_gone(e);
        }
        result
    }

    /// Forget the port after an error that means the device went away
    fn drop_if_gone(&mut self, err: &io::Error) {
        if matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
        ) {
            warn!("Serial port {} lost: {}", self.settings.path, err);
            self.port = None;
        }
    }
}

type SharedSlot<P> = Arc<Mutex<PortSlot<P>>>;

fn lock<P>(slot: &SharedSlot<P>) -> MutexGuard<'_, PortSlot<P>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serial channel with lazy reopen
pub struct SerialLink<P = Box<dyn SerialPort>> {
    slot: SharedSlot<P>,
}

impl SerialLink {
    /// Open the port, failing if it is not available
    pub fn open(settings: SerialSettings) -> Result<Self, serialport::Error> {
        let port = connect(&settings)?;
        info!("Opened {} at {} baud", settings.path, settings.baud_rate);
        Ok(Self::from_parts(settings, Some(port), serialport_connector()))
    }

    /// Create a link whether or not the port can be opened right now
    pub fn open_lazy(settings: SerialSettings) -> Self {
        let port = match connect(&settings) {
            Ok(port) => {
                info!("Opened {} at {} baud", settings.path, settings.baud_rate);
                Some(port)
            }
            Err(e) => {
                error!("Can't open serial port {}: {}", settings.path, e);
                None
            }
        };
        Self::from_parts(settings, port, serialport_connector())
    }
}

impl<P: SerialDevice> SerialLink<P> {
    /// Link that opens its device through `connect`, starting closed
    pub fn with_connector(settings: SerialSettings, connect: Connector<P>) -> Self {
        Self::from_parts(settings, None, connect)
    }

    fn from_parts(settings: SerialSettings, port: Option<P>, connect: Connector<P>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(PortSlot {
                settings,
                port,
                connect,
                rts: None,
            })),
        }
    }

    pub fn settings(&self) -> SerialSettings {
        lock(&self.slot).settings.clone()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.slot).port.is_some()
    }
}

impl<P> fmt::Debug for SerialLink<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = lock(&self.slot);
        f.debug_struct("SerialLink")
            .field("settings", &slot.settings)
            .field("open", &slot.port.is_some())
            .finish()
    }
}

impl<P: SerialDevice> SerialChannel for SerialLink<P> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        lock(&self.slot).with_port(|port| port.write_bytes(bytes))
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        lock(&self.slot).with_port(|port| port.read_bytes(buf, timeout))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut slot = lock(&self.slot);
        let result = match slot.port.as_mut() {
            Some(port) => port.discard_input(),
            None => Ok(()),
        };
        if let Err(e) = &result {
            slot.drop_if_gone(e);
        }
        result
    }
}

/// Fill `buf` from `port` until full or `timeout` has elapsed
fn read_until(port: &mut dyn SerialPort, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        port.set_timeout(remaining)?;

        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Direction line error
#[derive(Debug)]
pub struct LineError(pub io::Error);

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "direction line: {}", self.0)
    }
}

impl std::error::Error for LineError {}

impl digital::Error for LineError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Direction line on the port's RTS signal.
///
/// RTS is asserted while transmitting (line logic low) and released for
/// receive (line logic high). The line goes through the link's port slot, so a
/// reopened port gets its RTS level back.
pub struct RtsDirection<P = Box<dyn SerialPort>> {
    slot: SharedSlot<P>,
}

impl<P: SerialDevice> RtsDirection<P> {
    pub fn from_link(link: &SerialLink<P>) -> Self {
        Self {
            slot: Arc::clone(&link.slot),
        }
    }

    fn drive(&mut self, asserted: bool) -> Result<(), LineError> {
        let mut slot = lock(&self.slot);
        match slot.with_port(|port| port.set_rts(asserted)) {
            Ok(()) => {
                slot.rts = Some(asserted);
                Ok(())
            }
            // Without a port there is no driver to release
            Err(_) if !asserted && slot.port.is_none() => {
                slot.rts = Some(false);
                Ok(())
            }
            Err(e) => Err(LineError(e)),
        }
    }
}

impl<P> ErrorType for RtsDirection<P> {
    type Error = LineError;
}

impl<P: SerialDevice> OutputPin for RtsDirection<P> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(true)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(false)
    }
}

/// Direction line on a GPIO exported through sysfs
#[derive(Debug, Clone)]
pub struct SysfsGpioDirection {
    value_path: PathBuf,
}

impl SysfsGpioDirection {
    /// Export `line` under `/sys/class/gpio` and configure it as an output
    pub fn export(line: u32) -> io::Result<Self> {
        Self::export_at(Path::new("/sys/class/gpio"), line)
    }

    /// Same as [`export`](Self::export) under a different sysfs root
    pub fn export_at(root: &Path, line: u32) -> io::Result<Self> {
        let gpio = root.join(format!("gpio{line}"));
        if !gpio.exists() {
            fs::write(root.join("export"), line.to_string())?;
        }

        // udev creates the node and fixes its permissions after the export returns
        let direction = gpio.join("direction");
        let mut attempt = 1;
        // "high" configures the pin as an output that starts in receive mode
        while let Err(e) = fs::write(&direction, "high") {
            let transient = matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            );
            if !transient || attempt >= GPIO_SETUP_ATTEMPTS {
                return Err(e);
            }
            attempt += 1;
            thread::sleep(GPIO_SETUP_RETRY);
        }
        info!("GPIO {} configured as RS-485 direction line", line);

        Ok(Self {
            value_path: gpio.join("value"),
        })
    }

    fn write_level(&self, high: bool) -> Result<(), LineError> {
        fs::write(&self.value_path, if high { "1" } else { "0" }).map_err(LineError)
    }
}

impl ErrorType for SysfsGpioDirection {
    type Error = LineError;
}

impl OutputPin for SysfsGpioDirection {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write_level(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write_level(true)
    }
}

//! In-memory AC interface units on a simulated bus.
//!
//! [`SimulatedBus`] answers requests the way a unit on the RS-485 link would,
//! and can be told to misbehave on the next reply (stay silent, drop bytes,
//! corrupt the CRC, deliver bytes late). [`RecordingPin`] stands in for the
//! direction line. Both write into a shared [`BusLog`] so tests can check the
//! exact order of line changes, writes, reads and flushes.
//!
//! A request written while the line is in receive mode is never heard by the
//! units, the same as on real hardware.

use crate::frame::{self, Frame, FrameData, FrameShape};
use crate::registry::{Opcode, Register, COIL_ON};
use crate::transport::SerialChannel;
use embedded_hal::digital::{ErrorType, OutputPin};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Something observable that happened on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Direction line driven low
    Transmit,
    /// Direction line driven high
    Receive,
    Write(Vec<u8>),
    Read { requested: usize, returned: usize },
    ClearInput,
}

#[derive(Debug)]
struct LogInner {
    events: Vec<(Instant, BusEvent)>,
    receiving: bool,
}

/// Shared, timestamped record of bus activity
#[derive(Debug, Clone)]
pub struct BusLog {
    inner: Arc<Mutex<LogInner>>,
}

impl Default for BusLog {
    fn default() -> Self {
        Self::new()
    }
}

impl BusLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                events: Vec::new(),
                receiving: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: BusEvent) {
        let mut inner = self.lock();
        match event {
            BusEvent::Transmit => inner.receiving = false,
            BusEvent::Receive => inner.receiving = true,
            _ => {}
        }
        inner.events.push((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.lock().events.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn timed_events(&self) -> Vec<(Instant, BusEvent)> {
        self.lock().events.clone()
    }

    /// Every frame written to the bus, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .events
            .iter()
            .filter_map(|(_, e)| match e {
                BusEvent::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&BusEvent) -> bool) -> usize {
        self.lock().events.iter().filter(|(_, e)| pred(e)).count()
    }

    /// Whether the direction line is currently in receive mode
    pub fn is_receiving(&self) -> bool {
        self.lock().receiving
    }

    pub fn clear(&self) {
        self.lock().events.clear();
    }
}

/// Direction line that records its level changes
#[derive(Debug, Clone)]
pub struct RecordingPin {
    log: BusLog,
}

impl RecordingPin {
    pub fn new(log: &BusLog) -> Self {
        Self { log: log.clone() }
    }
}

impl ErrorType for RecordingPin {
    type Error = Infallible;
}

impl OutputPin for RecordingPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.log.record(BusEvent::Transmit);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.log.record(BusEvent::Receive);
        Ok(())
    }
}

/// Misbehaviour applied to the next reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// No reply at all
    Silent,
    /// Drop this many bytes from the end of the reply
    Truncate(usize),
    /// Flip a bit in the CRC
    CorruptCrc,
    /// Only the first N bytes arrive in time; the rest land after the read
    Late(usize),
    /// Answer a write with a different value than was written
    WrongEcho,
    /// Append stray bytes after the reply
    Trailing(Vec<u8>),
    /// Reply with another address and command byte, CRC intact
    ForeignHeader { address: u8, command: u8 },
}

/// State of one AC interface unit
#[derive(Debug, Clone)]
pub struct UnitState {
    pub registers: HashMap<u16, u16>,
    pub coils: HashMap<u16, bool>,
    /// Requests this unit heard and answered
    pub requests: Vec<Frame>,
}

impl Default for UnitState {
    fn default() -> Self {
        let mut registers = HashMap::new();
        registers.insert(Register::Mode.code(), 5);
        registers.insert(Register::FanSpeed.code(), 1);
        registers.insert(Register::Setpoint.code(), 22);

        let mut coils = HashMap::new();
        coils.insert(Register::OnOff.code(), false);

        Self {
            registers,
            coils,
            requests: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    units: BTreeMap<u8, UnitState>,
    faults: VecDeque<Fault>,
    rx: VecDeque<u8>,
    late: Vec<u8>,
    broken: bool,
}

/// Simulated RS-485 bus with any number of units attached.
///
/// Clones share the same bus, so a test can keep a handle while the transport
/// owns another.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
    log: BusLog,
}

impl SimulatedBus {
    /// Empty bus
    pub fn new(log: &BusLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            log: log.clone(),
        }
    }

    /// Bus with default units at the given addresses
    pub fn with_units(log: &BusLog, addresses: &[u8]) -> Self {
        let bus = Self::new(log);
        for &address in addresses {
            bus.attach(address, UnitState::default());
        }
        bus
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, address: u8, unit: UnitState) {
        self.lock().units.insert(address, unit);
    }

    pub fn detach(&self, address: u8) {
        self.lock().units.remove(&address);
    }

    /// Queue a fault for the next reply
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Make every write fail with an I/O error, as an unplugged adapter would
    pub fn set_broken(&self, broken: bool) {
        self.lock().broken = broken;
    }

    pub fn set_register(&self, address: u8, register: Register, value: u16) {
        if let Some(unit) = self.lock().units.get_mut(&address) {
            unit.registers.insert(register.code(), value);
        }
    }

    pub fn register(&self, address: u8, register: Register) -> Option<u16> {
        self.lock()
            .units
            .get(&address)
            .and_then(|u| u.registers.get(&register.code()).copied())
    }

    pub fn set_coil(&self, address: u8, register: Register, on: bool) {
        if let Some(unit) = self.lock().units.get_mut(&address) {
            unit.coils.insert(register.code(), on);
        }
    }

    pub fn coil(&self, address: u8, register: Register) -> Option<bool> {
        self.lock()
            .units
            .get(&address)
            .and_then(|u| u.coils.get(&register.code()).copied())
    }

    /// Requests heard by the unit at `address`
    pub fn requests(&self, address: u8) -> Vec<Frame> {
        self.lock()
            .units
            .get(&address)
            .map(|u| u.requests.clone())
            .unwrap_or_default()
    }

    /// Bytes waiting in the receive buffer
    pub fn pending_input(&self) -> usize {
        self.lock().rx.len()
    }

    fn answer(unit: &mut UnitState, request: &Frame) -> Option<Frame> {
        let register = request.register()?;
        let value = request.register_value();
        let reply = match Opcode::from_u8(request.command())? {
            Opcode::ReadRegister => {
                let current = unit.registers.get(&register).copied().unwrap_or(0);
                let [hi, lo] = current.to_be_bytes();
                Frame::new(request.address(), request.command(), FrameData::Register([2, hi, lo]))
            }
            Opcode::ReadCoil => {
                let on = unit.coils.get(&register).copied().unwrap_or(false);
                Frame::new(request.address(), request.command(), FrameData::Coil([1, u8::from(on)]))
            }
            Opcode::WriteRegister => {
                unit.registers.insert(register, value);
                *request
            }
            Opcode::WriteCoil => {
                unit.coils.insert(register, value == COIL_ON);
                *request
            }
        };
        unit.requests.push(*request);
        Some(reply)
    }
}

impl SerialChannel for SimulatedBus {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated adapter unplugged"));
        }

        self.log.record(BusEvent::Write(bytes.to_vec()));
        if self.log.is_receiving() {
            // Transmitter not keyed: nobody hears this
            return Ok(());
        }

        let request = match frame::decode(bytes, FrameShape::Request) {
            Ok(request) if frame::validate(&request) => request,
            _ => return Ok(()),
        };
        let reply = match state.units.get_mut(&request.address()) {
            Some(unit) => Self::answer(unit, &request),
            None => None,
        };
        let Some(mut reply) = reply else {
            return Ok(());
        };

        let fault = state.faults.pop_front();
        if fault == Some(Fault::WrongEcho) && reply.shape() == FrameShape::Request {
            let wrong = reply.register_value().wrapping_add(1).to_be_bytes();
            reply = Frame::request(
                reply.address(),
                reply.command(),
                reply.register().unwrap_or_default(),
                wrong[0],
                wrong[1],
            );
        }

        if let Some(Fault::ForeignHeader { address, command }) = fault {
            reply = Frame::new(address, command, *reply.data());
        }

        let mut out = frame::encode(&reply);
        match fault {
            Some(Fault::Silent) => return Ok(()),
            Some(Fault::Truncate(n)) => out.truncate(out.len().saturating_sub(n)),
            Some(Fault::CorruptCrc) => {
                if let Some(last) = out.last_mut() {
                    *last ^= 0x01;
                }
            }
            Some(Fault::Late(n)) => {
                let late = out.split_off(n.min(out.len()));
                state.late = late;
            }
            Some(Fault::Trailing(extra)) => out.extend_from_slice(&extra),
            Some(Fault::WrongEcho) | Some(Fault::ForeignHeader { .. }) | None => {}
        }
        state.rx.extend(out);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut state = self.lock();
        let count = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
            *slot = byte;
        }
        // Late bytes show up once the reader has given up
        let late = std::mem::take(&mut state.late);
        state.rx.extend(late);

        self.log.record(BusEvent::Read {
            requested: buf.len(),
            returned: count,
        });
        Ok(count)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.lock().rx.clear();
        self.log.record(BusEvent::ClearInput);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(log: &BusLog) -> RecordingPin {
        let mut pin = RecordingPin::new(log);
        pin.set_low().unwrap();
        pin
    }

    #[test]
    fn test_unit_answers_register_read() {
        let log = BusLog::new();
        let mut bus = SimulatedBus::with_units(&log, &[0x01]);
        let _pin = keyed(&log);

        let request = Frame::request(0x01, Opcode::ReadRegister.code(), Register::Setpoint.code(), 0, 1);
        bus.write_all(&frame::encode(&request)).unwrap();

        let mut buf = [0u8; 7];
        assert_eq!(bus.read_timeout(&mut buf, Duration::ZERO).unwrap(), 7);
        assert_eq!(buf, [0x01, 0x03, 0x02, 0x00, 0x16, 0x39, 0x8A]);
    }

    #[test]
    fn test_request_unheard_while_receiving() {
        let log = BusLog::new();
        let mut bus = SimulatedBus::with_units(&log, &[0x01]);

        let request = Frame::request(0x01, Opcode::ReadRegister.code(), Register::Setpoint.code(), 0, 1);
        bus.write_all(&frame::encode(&request)).unwrap();

        assert_eq!(bus.pending_input(), 0);
        assert!(bus.requests(0x01).is_empty());
    }

    #[test]
    fn test_unknown_address_stays_silent() {
        let log = BusLog::new();
        let mut bus = SimulatedBus::with_units(&log, &[0x01]);
        let _pin = keyed(&log);

        let request = Frame::request(0x07, Opcode::ReadCoil.code(), Register::OnOff.code(), 0, 1);
        bus.write_all(&frame::encode(&request)).unwrap();

        assert_eq!(bus.pending_input(), 0);
    }

    #[test]
    fn test_write_coil_updates_state() {
        let log = BusLog::new();
        let mut bus = SimulatedBus::with_units(&log, &[0x02]);
        let _pin = keyed(&log);

        let request = Frame::request(0x02, Opcode::WriteCoil.code(), Register::OnOff.code(), 0xFF, 0x00);
        bus.write_all(&frame::encode(&request)).unwrap();

        assert_eq!(bus.coil(0x02, Register::OnOff), Some(true));
        assert_eq!(bus.pending_input(), 8);
    }

    #[test]
    fn test_late_bytes_arrive_after_read() {
        let log = BusLog::new();
        let mut bus = SimulatedBus::with_units(&log, &[0x01]);
        let _pin = keyed(&log);
        bus.inject(Fault::Late(4));

        let request = Frame::request(0x01, Opcode::ReadRegister.code(), Register::Setpoint.code(), 0, 1);
        bus.write_all(&frame::encode(&request)).unwrap();

        let mut buf = [0u8; 7];
        assert_eq!(bus.read_timeout(&mut buf, Duration::ZERO).unwrap(), 4);
        assert_eq!(bus.pending_input(), 3);
    }
}

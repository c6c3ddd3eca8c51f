//! Half-duplex transport for an RS-485 style channel.
//!
//! One physical channel carries both directions, so the driver has to be keyed
//! explicitly through a direction-control line:
//!
//! ```text
//!  line:   HIGH (rx) ──┐                               ┌── HIGH (rx)
//!                      └── LOW (tx) ───────────────────┘
//!                      |<- settle ->|<- bytes ->|<- drain ->|
//! ```
//!
//! The settle delay lets the line driver stabilise before the first byte goes out
//! and the drain delay lets the last byte clear the wire before the driver is
//! released. Both are part of the bus contract; shortening them corrupts frames
//! on real hardware.
//!
//! Reads are bounded by a short timeout. A short read is a normal outcome ("no
//! response"), not an error. After every read the input buffer is flushed so
//! stale bytes from a late or partial reply cannot leak into the next frame.

use embedded_hal::digital::{ErrorKind, OutputPin};
use log::{trace, warn};
use std::io;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Delay between keying the transmitter and the first byte
pub const TX_SETTLE_DELAY: Duration = Duration::from_millis(6);

/// Delay between the last byte and releasing the transmitter
pub const TX_DRAIN_DELAY: Duration = Duration::from_millis(4);

/// Upper bound on a single receive
pub const RX_TIMEOUT: Duration = Duration::from_millis(100);

/// Turnaround timing of the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    pub settle: Duration,
    pub drain: Duration,
    pub rx_timeout: Duration,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            settle: TX_SETTLE_DELAY,
            drain: TX_DRAIN_DELAY,
            rx_timeout: RX_TIMEOUT,
        }
    }
}

/// Byte-level access to a serial channel
pub trait SerialChannel {
    /// Write every byte of `bytes`
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read until `buf` is full or `timeout` expires; returns the byte count.
    ///
    /// Running out of time is not an error.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard everything waiting in the input buffer
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port is not open: {0}")]
    PortClosed(String),
    #[error("serial I/O error: {0}")]
    Io(io::Error),
    #[error("direction line error: {0:?}")]
    Direction(ErrorKind),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotConnected => TransportError::PortClosed(err.to_string()),
            _ => TransportError::Io(err),
        }
    }
}

fn direction_error<E: embedded_hal::digital::Error>(err: E) -> TransportError {
    TransportError::Direction(err.kind())
}

/// Half-duplex transport over a serial channel and a direction line.
///
/// Direction line: logic high = receive, logic low = transmit.
pub struct HalfDuplexTransport<C, D> {
    channel: C,
    direction: D,
    timing: BusTiming,
}

impl<C: SerialChannel, D: OutputPin> HalfDuplexTransport<C, D> {
    /// Create a transport and put the line in receive mode
    pub fn new(channel: C, mut direction: D, timing: BusTiming) -> Result<Self, TransportError> {
        direction.set_high().map_err(direction_error)?;

        Ok(Self {
            channel,
            direction,
            timing,
        })
    }

    /// Key the transmitter, write `bytes`, release the transmitter.
    ///
    /// The line is returned to receive even if the write fails.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.direction.set_low().map_err(direction_error)?;
        thread::sleep(self.timing.settle);

        let written = self.channel.write_all(bytes);
        if written.is_ok() {
            thread::sleep(self.timing.drain);
        }

        let released = self.direction.set_high().map_err(direction_error);

        if let Err(e) = written {
            warn!("TX failed after keying transmitter: {}", e);
            return Err(e.into());
        }
        trace!("TX {} bytes: {:02X?}", bytes.len(), bytes);
        released
    }

    /// Read up to `n` bytes within the receive timeout, then flush the input buffer.
    ///
    /// Returns fewer than `n` bytes when the timeout expires first.
    pub fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        let read = self.channel.read_timeout(&mut buf, self.timing.rx_timeout);

        // Next transaction starts from a clean buffer, whatever happened above
        let flushed = self.channel.clear_input();

        let count = read?;
        flushed?;
        buf.truncate(count);

        if count < n {
            trace!("RX short: {}/{} bytes: {:02X?}", count, n, buf);
        } else {
            trace!("RX {} bytes: {:02X?}", count, buf);
        }
        Ok(buf)
    }

    pub fn timing(&self) -> &BusTiming {
        &self.timing
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_parts(self) -> (C, D) {
        (self.channel, self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BusEvent, BusLog, RecordingPin};
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Channel that replays canned input and records writes into the bus log
    struct CannedChannel {
        log: BusLog,
        input: VecDeque<u8>,
        fail_writes: bool,
    }

    impl CannedChannel {
        fn new(log: &BusLog, input: &[u8]) -> Self {
            Self {
                log: log.clone(),
                input: input.iter().copied().collect(),
                fail_writes: false,
            }
        }
    }

    impl SerialChannel for CannedChannel {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable unplugged"));
            }
            self.log.record(BusEvent::Write(bytes.to_vec()));
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            let count = buf.len().min(self.input.len());
            for slot in buf.iter_mut().take(count) {
                *slot = self.input.pop_front().unwrap_or_default();
            }
            self.log.record(BusEvent::Read {
                requested: buf.len(),
                returned: count,
            });
            Ok(count)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.input.clear();
            self.log.record(BusEvent::ClearInput);
            Ok(())
        }
    }

    #[test]
    fn test_new_puts_line_in_receive() {
        let log = BusLog::new();
        let _transport =
            HalfDuplexTransport::new(CannedChannel::new(&log, &[]), RecordingPin::new(&log), BusTiming::default())
                .unwrap();

        assert_eq!(log.events(), vec![BusEvent::Receive]);
    }

    #[test]
    fn test_send_keys_line_around_write() {
        let log = BusLog::new();
        let mut transport =
            HalfDuplexTransport::new(CannedChannel::new(&log, &[]), RecordingPin::new(&log), BusTiming::default())
                .unwrap();
        log.clear();

        transport.send(&[0x01, 0x03]).unwrap();

        assert_eq!(
            log.events(),
            vec![BusEvent::Transmit, BusEvent::Write(vec![0x01, 0x03]), BusEvent::Receive]
        );
    }

    #[test]
    fn test_send_honours_settle_and_drain() {
        let log = BusLog::new();
        let mut transport =
            HalfDuplexTransport::new(CannedChannel::new(&log, &[]), RecordingPin::new(&log), BusTiming::default())
                .unwrap();
        log.clear();

        transport.send(&[0xAA]).unwrap();

        let timed = log.timed_events();
        assert_eq!(timed.len(), 3);
        let keyed: Instant = timed[0].0;
        let written: Instant = timed[1].0;
        let released: Instant = timed[2].0;
        assert!(written.duration_since(keyed) >= TX_SETTLE_DELAY);
        assert!(released.duration_since(written) >= TX_DRAIN_DELAY);
    }

    #[test]
    fn test_failed_write_still_releases_line() {
        let log = BusLog::new();
        let mut channel = CannedChannel::new(&log, &[]);
        channel.fail_writes = true;
        let mut transport =
            HalfDuplexTransport::new(channel, RecordingPin::new(&log), BusTiming::default()).unwrap();
        log.clear();

        let result = transport.send(&[0x01]);

        assert!(matches!(result, Err(TransportError::Io(_))));
        assert_eq!(log.events(), vec![BusEvent::Transmit, BusEvent::Receive]);
        assert!(log.is_receiving());
    }

    #[test]
    fn test_receive_short_read_is_not_an_error() {
        let log = BusLog::new();
        let mut transport = HalfDuplexTransport::new(
            CannedChannel::new(&log, &[0x01, 0x03, 0x02]),
            RecordingPin::new(&log),
            BusTiming::default(),
        )
        .unwrap();

        let bytes = transport.receive(7).unwrap();
        assert_eq!(bytes, vec![0x01, 0x03, 0x02]);
    }

    #[test]
    fn test_receive_always_flushes_input() {
        let log = BusLog::new();
        let mut transport = HalfDuplexTransport::new(
            CannedChannel::new(&log, &[1, 2, 3, 4, 5, 6, 7, 8, 9]),
            RecordingPin::new(&log),
            BusTiming::default(),
        )
        .unwrap();
        log.clear();

        let first = transport.receive(6).unwrap();
        assert_eq!(first, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(
            log.events(),
            vec![BusEvent::Read { requested: 6, returned: 6 }, BusEvent::ClearInput]
        );

        // Leftover bytes 7..9 were discarded
        let second = transport.receive(6).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_not_connected_maps_to_port_closed() {
        let err: TransportError = io::Error::new(io::ErrorKind::NotConnected, "/dev/ttySC1").into();
        assert!(matches!(err, TransportError::PortClosed(_)));

        let err: TransportError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, TransportError::Io(_)));
    }
}

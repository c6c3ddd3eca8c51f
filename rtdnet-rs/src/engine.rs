//! Protocol engine: one request, one reply.
//!
//! Every transaction sends exactly one request frame and performs exactly one
//! bounded read for the reply shape that belongs to it:
//!
//! | Transaction                | Reply shape                    | Bytes read |
//! |----------------------------|--------------------------------|------------|
//! | [`register_transaction`]   | [`FrameShape::RegisterReply`]  | 7          |
//! | [`coil_transaction`]       | [`FrameShape::CoilReply`]      | 6          |
//! | [`write_transaction`]      | [`FrameShape::Request`] (echo) | 8          |
//!
//! There are no retries at this level. A missing or partial reply is reported
//! as [`ProtocolError::ShortRead`] and a reply whose CRC does not match as
//! [`ProtocolError::CrcMismatch`]. A well-formed reply from the wrong unit or
//! for the wrong command is [`ProtocolError::UnexpectedReply`]. The caller
//! decides what to do next.
//!
//! [`register_transaction`]: ProtocolEngine::register_transaction
//! [`coil_transaction`]: ProtocolEngine::coil_transaction
//! [`write_transaction`]: ProtocolEngine::write_transaction

use crate::frame::{self, CodecError, Frame, FrameShape};
use crate::registry::{Opcode, Register, COIL_OFF, COIL_ON, READ_QUANTITY};
use crate::transport::{HalfDuplexTransport, SerialChannel, TransportError};
use embedded_hal::digital::OutputPin;
use log::{debug, trace, warn};
use thiserror::Error;

/// Transaction errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// No reply, or fewer bytes than the reply shape requires
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("CRC mismatch: calculated 0x{calculated:04X}, received 0x{received:04X}")]
    CrcMismatch { calculated: u16, received: u16 },
    /// A valid frame came back from another address or for another command
    #[error(
        "unexpected reply: expected 0x{expected_address:02X}/0x{expected_command:02X}, \
         received 0x{address:02X}/0x{command:02X}"
    )]
    UnexpectedReply {
        expected_address: u8,
        expected_command: u8,
        address: u8,
        command: u8,
    },
    /// A write was answered with something other than its own echo
    #[error("write echo mismatch: sent {sent}, received {received}")]
    EchoMismatch { sent: Frame, received: Frame },
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ShortRead { expected, actual } => ProtocolError::ShortRead { expected, actual },
        }
    }
}

impl ProtocolError {
    /// Whether the unit simply did not answer (nothing or a partial frame)
    pub fn is_no_response(&self) -> bool {
        matches!(self, ProtocolError::ShortRead { .. })
    }
}

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub short_reads: u64,
    pub crc_errors: u64,
    pub echo_mismatches: u64,
    pub unexpected_replies: u64,
    pub transport_errors: u64,
}

/// Register/coil protocol engine over a half-duplex transport
pub struct ProtocolEngine<C, D> {
    transport: HalfDuplexTransport<C, D>,
    stats: EngineStats,
}

impl<C: SerialChannel, D: OutputPin> ProtocolEngine<C, D> {
    pub fn new(transport: HalfDuplexTransport<C, D>) -> Self {
        Self {
            transport,
            stats: EngineStats::default(),
        }
    }

    /// Send one request and read a 7-byte register reply
    pub fn register_transaction(
        &mut self,
        address: u8,
        opcode: Opcode,
        register: u16,
        value_high: u8,
        value_low: u8,
    ) -> Result<Frame, ProtocolError> {
        let request = Frame::request(address, opcode.code(), register, value_high, value_low);
        self.round_trip(&request, FrameShape::RegisterReply)
    }

    /// Send one request and read a 6-byte coil reply
    pub fn coil_transaction(
        &mut self,
        address: u8,
        opcode: Opcode,
        register: u16,
        value_high: u8,
        value_low: u8,
    ) -> Result<Frame, ProtocolError> {
        let request = Frame::request(address, opcode.code(), register, value_high, value_low);
        self.round_trip(&request, FrameShape::CoilReply)
    }

    /// Send one write request and read its 8-byte echo.
    ///
    /// The echo must be byte-for-byte identical to the request.
    pub fn write_transaction(
        &mut self,
        address: u8,
        opcode: Opcode,
        register: u16,
        value_high: u8,
        value_low: u8,
    ) -> Result<Frame, ProtocolError> {
        let request = Frame::request(address, opcode.code(), register, value_high, value_low);
        let echo = self.round_trip(&request, FrameShape::Request)?;

        if echo != request {
            self.stats.echo_mismatches += 1;
            warn!("Write echo mismatch: sent {}, received {}", request, echo);
            return Err(ProtocolError::EchoMismatch {
                sent: request,
                received: echo,
            });
        }
        Ok(echo)
    }

    /// Read a holding register's value
    pub fn read_register(&mut self, address: u8, register: Register) -> Result<u16, ProtocolError> {
        let [hi, lo] = READ_QUANTITY.to_be_bytes();
        self.register_transaction(address, Opcode::ReadRegister, register.code(), hi, lo)
            .map(|reply| reply.register_value())
    }

    /// Read a coil's state
    pub fn read_coil(&mut self, address: u8, register: Register) -> Result<bool, ProtocolError> {
        let [hi, lo] = READ_QUANTITY.to_be_bytes();
        self.coil_transaction(address, Opcode::ReadCoil, register.code(), hi, lo)
            .map(|reply| reply.coil_state())
    }

    /// Write a holding register
    pub fn write_register(&mut self, address: u8, register: Register, value: u16) -> Result<(), ProtocolError> {
        let [hi, lo] = value.to_be_bytes();
        self.write_transaction(address, Opcode::WriteRegister, register.code(), hi, lo)
            .map(|_| ())
    }

    /// Switch a coil on or off
    pub fn write_coil(&mut self, address: u8, register: Register, on: bool) -> Result<(), ProtocolError> {
        let value = if on { COIL_ON } else { COIL_OFF };
        let [hi, lo] = value.to_be_bytes();
        self.write_transaction(address, Opcode::WriteCoil, register.code(), hi, lo)
            .map(|_| ())
    }

    fn round_trip(&mut self, request: &Frame, reply: FrameShape) -> Result<Frame, ProtocolError> {
        let bytes = frame::encode(request);
        trace!("Request {}", request);

        if let Err(e) = self.transport.send(&bytes) {
            self.stats.transport_errors += 1;
            warn!("Failed to send request to 0x{:02X}: {}", request.address(), e);
            return Err(e.into());
        }
        self.stats.tx_frames += 1;

        let received = match self.transport.receive(reply.wire_len()) {
            Ok(received) => received,
            Err(e) => {
                self.stats.transport_errors += 1;
                warn!("Failed to read reply from 0x{:02X}: {}", request.address(), e);
                return Err(e.into());
            }
        };

        let frame = match frame::decode(&received, reply) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.short_reads += 1;
                debug!(
                    "No response from 0x{:02X} ({}): {:02X?}",
                    request.address(),
                    e,
                    received
                );
                return Err(e.into());
            }
        };

        if !frame::validate(&frame) {
            self.stats.crc_errors += 1;
            let calculated = frame::checksum(frame.address(), frame.command(), frame.data());
            warn!(
                "CRC mismatch from 0x{:02X}: calculated 0x{:04X}, received 0x{:04X}",
                request.address(),
                calculated,
                frame.crc()
            );
            return Err(ProtocolError::CrcMismatch {
                calculated,
                received: frame.crc(),
            });
        }

        if frame.address() != request.address() || frame.command() != request.command() {
            self.stats.unexpected_replies += 1;
            warn!("Unexpected reply to {}: {}", request, frame);
            return Err(ProtocolError::UnexpectedReply {
                expected_address: request.address(),
                expected_command: request.command(),
                address: frame.address(),
                command: frame.command(),
            });
        }

        self.stats.rx_frames += 1;
        trace!("Reply {}", frame);
        Ok(frame)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = EngineStats::default();
    }

    pub fn transport(&self) -> &HalfDuplexTransport<C, D> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut HalfDuplexTransport<C, D> {
        &mut self.transport
    }
}

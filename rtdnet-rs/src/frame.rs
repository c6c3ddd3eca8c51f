//! RTD-NET frame codec.
//!
//! Every frame on the bus has the same four fields:
//!
//! ```text
//! +---------+---------+----------------------+--------+--------+
//! | address | command | data (4, 3 or 2 B)   | crc_lo | crc_hi |
//! +---------+---------+----------------------+--------+--------+
//! ```
//!
//! The data field is not length-prefixed on the wire. Its size is implied by the
//! transaction the frame belongs to, so the codec works with three fixed shapes:
//!
//! | Shape                       | Data bytes                           | Wire length |
//! |-----------------------------|--------------------------------------|-------------|
//! | [`FrameShape::Request`]     | `reg_hi, reg_lo, val_hi, val_lo`     | 8           |
//! | [`FrameShape::RegisterReply`] | `byte_count, val_hi, val_lo`       | 7           |
//! | [`FrameShape::CoilReply`]   | `byte_count, coil_bits`              | 6           |
//!
//! Write echoes use the request shape. The CRC is CRC-16/MODBUS (reflected
//! polynomial 0xA001, initial value 0xFFFF) over address, command and data, sent
//! low byte first.

use crc::{Crc, CRC_16_MODBUS};
use std::fmt;
use thiserror::Error;

/// CRC calculator shared by the codec and the bus simulator
pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Longest frame on the wire (request / write echo)
pub const MAX_FRAME_LEN: usize = FrameShape::Request.wire_len();

/// Codec errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Fewer bytes than the shape requires; nothing was parsed
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Fixed wire shapes of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameShape {
    Request,
    RegisterReply,
    CoilReply,
}

impl FrameShape {
    /// Size of the data field for this shape
    pub const fn data_len(self) -> usize {
        match self {
            FrameShape::Request => 4,
            FrameShape::RegisterReply => 3,
            FrameShape::CoilReply => 2,
        }
    }

    /// Total bytes on the wire, CRC included
    pub const fn wire_len(self) -> usize {
        2 + self.data_len() + 2
    }
}

/// Data field of a frame, sized by its shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameData {
    /// `[register_hi, register_lo, value_hi, value_lo]`
    Request([u8; 4]),
    /// `[byte_count, value_hi, value_lo]`
    Register([u8; 3]),
    /// `[byte_count, coil_bits]`
    Coil([u8; 2]),
}

impl FrameData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FrameData::Request(d) => d,
            FrameData::Register(d) => d,
            FrameData::Coil(d) => d,
        }
    }

    pub fn shape(&self) -> FrameShape {
        match self {
            FrameData::Request(_) => FrameShape::Request,
            FrameData::Register(_) => FrameShape::RegisterReply,
            FrameData::Coil(_) => FrameShape::CoilReply,
        }
    }
}

/// One protocol frame.
///
/// Frames built locally always carry the CRC of their contents. Decoded frames
/// carry the CRC that was received; use [`validate`] before trusting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    address: u8,
    command: u8,
    data: FrameData,
    crc: u16,
}

impl Frame {
    /// Build a frame and compute its CRC
    pub fn new(address: u8, command: u8, data: FrameData) -> Self {
        let crc = checksum(address, command, &data);
        Self {
            address,
            command,
            data,
            crc,
        }
    }

    /// Build a request frame for `register` carrying `value_high:value_low`
    pub fn request(address: u8, command: u8, register: u16, value_high: u8, value_low: u8) -> Self {
        let [reg_hi, reg_lo] = register.to_be_bytes();
        Self::new(
            address,
            command,
            FrameData::Request([reg_hi, reg_lo, value_high, value_low]),
        )
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn data(&self) -> &FrameData {
        &self.data
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    pub fn shape(&self) -> FrameShape {
        self.data.shape()
    }

    /// Register number carried by a request or write echo
    pub fn register(&self) -> Option<u16> {
        match self.data {
            FrameData::Request([hi, lo, _, _]) => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    /// Byte count field of a register or coil reply
    pub fn byte_count(&self) -> Option<u8> {
        match self.data {
            FrameData::Register([count, _, _]) | FrameData::Coil([count, _]) => Some(count),
            FrameData::Request(_) => None,
        }
    }

    /// 16-bit value carried by the frame.
    ///
    /// For coil replies this is the raw coil status byte.
    pub fn register_value(&self) -> u16 {
        match self.data {
            FrameData::Request([_, _, hi, lo]) | FrameData::Register([_, hi, lo]) => {
                u16::from_be_bytes([hi, lo])
            }
            FrameData::Coil([_, bits]) => u16::from(bits),
        }
    }

    /// Coil state: bit 0 of a coil reply, `0xFF00` in a write-coil request
    pub fn coil_state(&self) -> bool {
        match self.data {
            FrameData::Coil([_, bits]) => bits & 0x01 != 0,
            FrameData::Request([_, _, hi, _]) => hi == 0xFF,
            FrameData::Register([_, _, lo]) => lo != 0,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr=0x{:02X} cmd=0x{:02X} data={:02X?} crc=0x{:04X}",
            self.address,
            self.command,
            self.data.as_slice(),
            self.crc
        )
    }
}

/// CRC-16/MODBUS over address, command and data
pub fn checksum(address: u8, command: u8, data: &FrameData) -> u16 {
    let mut digest = CRC_MODBUS.digest();
    digest.update(&[address, command]);
    digest.update(data.as_slice());
    digest.finalize()
}

/// Serialize a frame: header, data, then the CRC low byte and high byte
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.shape().wire_len());
    bytes.push(frame.address);
    bytes.push(frame.command);
    bytes.extend_from_slice(frame.data.as_slice());
    bytes.extend_from_slice(&frame.crc.to_le_bytes());
    bytes
}

/// Parse `bytes` as a frame of the given shape.
///
/// Input shorter than the shape's wire length is rejected without parsing.
/// Trailing bytes beyond the wire length are ignored. The CRC is taken as
/// received and is not checked here.
pub fn decode(bytes: &[u8], shape: FrameShape) -> Result<Frame, CodecError> {
    let expected = shape.wire_len();
    if bytes.len() < expected {
        return Err(CodecError::ShortRead {
            expected,
            actual: bytes.len(),
        });
    }

    let data = &bytes[2..2 + shape.data_len()];
    let data = match shape {
        FrameShape::Request => FrameData::Request([data[0], data[1], data[2], data[3]]),
        FrameShape::RegisterReply => FrameData::Register([data[0], data[1], data[2]]),
        FrameShape::CoilReply => FrameData::Coil([data[0], data[1]]),
    };
    let crc_at = expected - 2;

    Ok(Frame {
        address: bytes[0],
        command: bytes[1],
        data,
        crc: u16::from_le_bytes([bytes[crc_at], bytes[crc_at + 1]]),
    })
}

/// Recompute the CRC and compare it with the one the frame carries
pub fn validate(frame: &Frame) -> bool {
    checksum(frame.address, frame.command, &frame.data) == frame.crc
}

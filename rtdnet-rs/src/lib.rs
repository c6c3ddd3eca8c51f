//! RTD-NET protocol engine for AC interface units.
//!
//! This crate implements the serial side of an air-conditioning field controller:
//! a fixed-length, CRC-checked, Modbus-style register/coil protocol spoken over a
//! half-duplex RS-485 link.
//!
//! # Layers
//!
//! - [`frame`]: the 4-field frame (`address`, `command`, `data`, `crc`) and its
//!   three fixed wire shapes
//! - [`registry`]: opcode and register tables of the AC interface
//! - [`transport`]: direction-line handling and turnaround timing for a
//!   half-duplex channel
//! - [`serial`]: `serialport`-backed channel plus RTS and sysfs GPIO direction lines
//! - [`engine`]: one-round-trip register, coil and write transactions
//!
//! # Example
//!
//! ```no_run
//! use rtdnet_rs::engine::ProtocolEngine;
//! use rtdnet_rs::registry::{Opcode, Register};
//! use rtdnet_rs::serial::{RtsDirection, SerialLink, SerialSettings};
//! use rtdnet_rs::transport::{BusTiming, HalfDuplexTransport};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let link = SerialLink::open(SerialSettings::new("/dev/ttySC1", 9600))?;
//! let direction = RtsDirection::from_link(&link);
//! let transport = HalfDuplexTransport::new(link, direction, BusTiming::default())?;
//! let mut engine = ProtocolEngine::new(transport);
//!
//! let reply = engine.register_transaction(0x01, Opcode::ReadRegister, Register::Setpoint.code(), 0x00, 0x01)?;
//! println!("setpoint = {}", reply.register_value());
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod frame;
pub mod registry;
pub mod serial;
pub mod transport;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(test)]
mod crc_tests;

pub use engine::{EngineStats, ProtocolEngine, ProtocolError};
pub use frame::{CodecError, Frame, FrameShape};
pub use registry::{Opcode, Register};
pub use transport::{BusTiming, HalfDuplexTransport, SerialChannel, TransportError};

//! Command and register tables of the AC interface.
//!
//! The values are fixed by the interface's register map and never change at
//! runtime. Registers are addressed with a 16-bit number; the AC interface only
//! uses the low byte.

/// Function codes placed in a frame's `command` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    ReadCoil = 0x01,
    ReadRegister = 0x03,
    WriteCoil = 0x05,
    WriteRegister = 0x06,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoil),
            0x03 => Some(Self::ReadRegister),
            0x05 => Some(Self::WriteCoil),
            0x06 => Some(Self::WriteRegister),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the opcode addresses a coil rather than a register
    pub fn is_coil(self) -> bool {
        matches!(self, Self::ReadCoil | Self::WriteCoil)
    }

    /// Whether the device answers with an echo of the request
    pub fn is_write(self) -> bool {
        matches!(self, Self::WriteCoil | Self::WriteRegister)
    }
}

/// Named registers and coils of the AC interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Unit on/off (coil)
    OnOff,
    /// Operating mode (holding register)
    Mode,
    /// Fan speed level (holding register)
    FanSpeed,
    /// Target temperature in whole degrees (holding register)
    Setpoint,
}

impl Register {
    pub const ALL: [Register; 4] = [
        Register::OnOff,
        Register::Mode,
        Register::FanSpeed,
        Register::Setpoint,
    ];

    pub fn code(self) -> u16 {
        match self {
            Register::OnOff => 0x0000,
            Register::Mode => 0x0001,
            Register::FanSpeed => 0x0002,
            Register::Setpoint => 0x0003,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::OnOff => "on-off",
            Register::Mode => "mode",
            Register::FanSpeed => "fan-speed",
            Register::Setpoint => "setpoint",
        }
    }
}

/// Quantity field of a single-value read
pub const READ_QUANTITY: u16 = 0x0001;

/// Value written to a coil to switch it on
pub const COIL_ON: u16 = 0xFF00;

/// Value written to a coil to switch it off
pub const COIL_OFF: u16 = 0x0000;

/// Operating mode the controller always writes to the unit
pub const FIXED_OPERATING_MODE: u16 = 5;

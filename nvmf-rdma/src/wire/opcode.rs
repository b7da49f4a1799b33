//! Command opcodes
//!
//! Bits 1:0 of an opcode give the data transfer direction, bits 6:2 the
//! function and bit 7 marks vendor/generic commands. Fabrics commands share
//! opcode 0x7f and are told apart by the command type at SQE byte 4.

use crate::error::{NvmfError, Result};

/// Opcode shared by every fabrics command
pub const FABRICS_OPCODE: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTransfer {
    None,
    HostToController,
    ControllerToHost,
    Bidirectional,
}

impl DataTransfer {
    pub fn of(opcode: u8) -> Self {
        match opcode & 0x3 {
            0x0 => DataTransfer::None,
            0x1 => DataTransfer::HostToController,
            0x2 => DataTransfer::ControllerToHost,
            _ => DataTransfer::Bidirectional,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdminOpcode {
    GetLogPage = 0x02,
    Identify = 0x06,
    Abort = 0x08,
    SetFeatures = 0x09,
    GetFeatures = 0x0a,
    AsyncEventRequest = 0x0c,
    KeepAlive = 0x18,
}

impl TryFrom<u8> for AdminOpcode {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        use AdminOpcode::*;
        Ok(match value {
            0x02 => GetLogPage,
            0x06 => Identify,
            0x08 => Abort,
            0x09 => SetFeatures,
            0x0a => GetFeatures,
            0x0c => AsyncEventRequest,
            0x18 => KeepAlive,
            _ => return Err(NvmfError::invalid_wire("admin opcode", value)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NvmOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
    WriteZeroes = 0x08,
    DatasetManagement = 0x09,
}

impl TryFrom<u8> for NvmOpcode {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        use NvmOpcode::*;
        Ok(match value {
            0x00 => Flush,
            0x01 => Write,
            0x02 => Read,
            0x08 => WriteZeroes,
            0x09 => DatasetManagement,
            _ => return Err(NvmfError::invalid_wire("NVM opcode", value)),
        })
    }
}

/// Fabrics command type (FCTYPE, SQE byte 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FabricsCommandType {
    PropertySet = 0x00,
    Connect = 0x01,
    PropertyGet = 0x04,
    AuthenticationSend = 0x05,
    AuthenticationReceive = 0x06,
}

impl TryFrom<u8> for FabricsCommandType {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        use FabricsCommandType::*;
        Ok(match value {
            0x00 => PropertySet,
            0x01 => Connect,
            0x04 => PropertyGet,
            0x05 => AuthenticationSend,
            0x06 => AuthenticationReceive,
            _ => return Err(NvmfError::invalid_wire("fabrics command type", value)),
        })
    }
}

/// Anything that can go in SQE byte 0
pub trait CommandOpcode: Copy {
    fn opcode(self) -> u8;

    fn data_transfer(self) -> DataTransfer {
        DataTransfer::of(self.opcode())
    }
}

impl CommandOpcode for AdminOpcode {
    fn opcode(self) -> u8 {
        self as u8
    }
}

impl CommandOpcode for NvmOpcode {
    fn opcode(self) -> u8 {
        self as u8
    }
}

impl CommandOpcode for FabricsCommandType {
    fn opcode(self) -> u8 {
        FABRICS_OPCODE
    }

    // the shared opcode says bidirectional; the real direction is per type
    fn data_transfer(self) -> DataTransfer {
        match self {
            FabricsCommandType::PropertySet
            | FabricsCommandType::Connect
            | FabricsCommandType::AuthenticationSend => DataTransfer::HostToController,
            FabricsCommandType::PropertyGet => DataTransfer::None,
            FabricsCommandType::AuthenticationReceive => DataTransfer::ControllerToHost,
        }
    }
}

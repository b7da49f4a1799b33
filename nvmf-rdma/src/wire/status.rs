//! Completion status field and status code tables
//!
//! The status field is the little-endian word at bytes 14..16 of a
//! completion entry:
//! - bits 8:1   status code (SC)
//! - bits 11:9  status code type (SCT)
//! - bit 14     more
//! - bit 15     do not retry

use crate::error::{NvmfError, Result};
use std::fmt;

const STATUS_CODE_SHIFT: u16 = 1;
const STATUS_CODE_TYPE_SHIFT: u16 = 9;
const MORE_BIT: u16 = 1 << 14;
const DO_NOT_RETRY_BIT: u16 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCodeType {
    Generic = 0x0,
    CommandSpecific = 0x1,
    MediaError = 0x2,
    PathRelated = 0x3,
    VendorSpecific = 0x7,
}

impl TryFrom<u8> for StatusCodeType {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(StatusCodeType::Generic),
            0x1 => Ok(StatusCodeType::CommandSpecific),
            0x2 => Ok(StatusCodeType::MediaError),
            0x3 => Ok(StatusCodeType::PathRelated),
            0x7 => Ok(StatusCodeType::VendorSpecific),
            _ => Err(NvmfError::invalid_wire("status code type", value)),
        }
    }
}

/// Generic command status (SCT 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GenericStatusCode {
    Success = 0x00,
    InvalidCommandOpcode = 0x01,
    InvalidFieldInCommand = 0x02,
    CommandIdConflict = 0x03,
    DataTransferError = 0x04,
    AbortedPowerLoss = 0x05,
    InternalError = 0x06,
    AbortRequested = 0x07,
    AbortedSqDeletion = 0x08,
    AbortedFailedFused = 0x09,
    AbortedMissingFused = 0x0a,
    InvalidNamespaceOrFormat = 0x0b,
    CommandSequenceError = 0x0c,
    InvalidSglSegmentDescriptor = 0x0d,
    InvalidNumberOfSglDescriptors = 0x0e,
    DataSglLengthInvalid = 0x0f,
    MetadataSglLengthInvalid = 0x10,
    SglDescriptorTypeInvalid = 0x11,
    InvalidUseOfControllerMemoryBuffer = 0x12,
    PrpOffsetInvalid = 0x13,
    AtomicWriteUnitExceeded = 0x14,
    OperationDenied = 0x15,
    SglOffsetInvalid = 0x16,
    HostIdentifierInconsistentFormat = 0x18,
    KeepAliveTimeoutExpired = 0x19,
    KeepAliveTimeoutInvalid = 0x1a,
    AbortedPreemptAndAbort = 0x1b,
    SanitizeFailed = 0x1c,
    SanitizeInProgress = 0x1d,
    SglDataBlockGranularityInvalid = 0x1e,
    CommandNotSupportedForQueueInCmb = 0x1f,
    LbaOutOfRange = 0x80,
    CapacityExceeded = 0x81,
    NamespaceNotReady = 0x82,
    ReservationConflict = 0x83,
    FormatInProgress = 0x84,
}

impl TryFrom<u8> for GenericStatusCode {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        use GenericStatusCode::*;
        Ok(match value {
            0x00 => Success,
            0x01 => InvalidCommandOpcode,
            0x02 => InvalidFieldInCommand,
            0x03 => CommandIdConflict,
            0x04 => DataTransferError,
            0x05 => AbortedPowerLoss,
            0x06 => InternalError,
            0x07 => AbortRequested,
            0x08 => AbortedSqDeletion,
            0x09 => AbortedFailedFused,
            0x0a => AbortedMissingFused,
            0x0b => InvalidNamespaceOrFormat,
            0x0c => CommandSequenceError,
            0x0d => InvalidSglSegmentDescriptor,
            0x0e => InvalidNumberOfSglDescriptors,
            0x0f => DataSglLengthInvalid,
            0x10 => MetadataSglLengthInvalid,
            0x11 => SglDescriptorTypeInvalid,
            0x12 => InvalidUseOfControllerMemoryBuffer,
            0x13 => PrpOffsetInvalid,
            0x14 => AtomicWriteUnitExceeded,
            0x15 => OperationDenied,
            0x16 => SglOffsetInvalid,
            0x18 => HostIdentifierInconsistentFormat,
            0x19 => KeepAliveTimeoutExpired,
            0x1a => KeepAliveTimeoutInvalid,
            0x1b => AbortedPreemptAndAbort,
            0x1c => SanitizeFailed,
            0x1d => SanitizeInProgress,
            0x1e => SglDataBlockGranularityInvalid,
            0x1f => CommandNotSupportedForQueueInCmb,
            0x80 => LbaOutOfRange,
            0x81 => CapacityExceeded,
            0x82 => NamespaceNotReady,
            0x83 => ReservationConflict,
            0x84 => FormatInProgress,
            _ => return Err(NvmfError::invalid_wire("generic status code", value)),
        })
    }
}

/// Command-specific status of fabrics connect and discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FabricsStatusCode {
    ConnectIncompatibleFormat = 0x80,
    ConnectControllerBusy = 0x81,
    ConnectInvalidParameters = 0x82,
    ConnectRestartDiscovery = 0x83,
    ConnectInvalidHost = 0x84,
    DiscoverRestart = 0x90,
    AuthenticationRequired = 0x91,
}

impl TryFrom<u8> for FabricsStatusCode {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        use FabricsStatusCode::*;
        Ok(match value {
            0x80 => ConnectIncompatibleFormat,
            0x81 => ConnectControllerBusy,
            0x82 => ConnectInvalidParameters,
            0x83 => ConnectRestartDiscovery,
            0x84 => ConnectInvalidHost,
            0x90 => DiscoverRestart,
            0x91 => AuthenticationRequired,
            _ => return Err(NvmfError::invalid_wire("fabrics status code", value)),
        })
    }
}

/// Decoded status field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusField {
    pub code_type: StatusCodeType,
    pub code: u8,
    pub more: bool,
    pub do_not_retry: bool,
}

impl StatusField {
    pub const SUCCESS: StatusField = StatusField {
        code_type: StatusCodeType::Generic,
        code: 0,
        more: false,
        do_not_retry: false,
    };

    pub fn decode(raw: u16) -> Result<Self> {
        let code_type = ((raw >> STATUS_CODE_TYPE_SHIFT) & 0x7) as u8;
        Ok(Self {
            code_type: StatusCodeType::try_from(code_type)?,
            code: (raw >> STATUS_CODE_SHIFT) as u8,
            more: raw & MORE_BIT != 0,
            do_not_retry: raw & DO_NOT_RETRY_BIT != 0,
        })
    }

    pub fn encode(&self) -> u16 {
        let mut raw = (self.code as u16) << STATUS_CODE_SHIFT;
        raw |= (self.code_type as u16) << STATUS_CODE_TYPE_SHIFT;
        if self.more {
            raw |= MORE_BIT;
        }
        if self.do_not_retry {
            raw |= DO_NOT_RETRY_BIT;
        }
        raw
    }

    pub fn is_success(&self) -> bool {
        self.code_type == StatusCodeType::Generic && self.code == 0
    }

    /// Generic status code; `InvalidArgument` for other status code types
    pub fn generic(&self) -> Result<GenericStatusCode> {
        if self.code_type != StatusCodeType::Generic {
            return Err(NvmfError::invalid_argument(format!(
                "status code type {:?} is not generic",
                self.code_type
            )));
        }
        GenericStatusCode::try_from(self.code)
    }

    /// Fabrics command-specific status; only meaningful for connect and
    /// discovery commands
    pub fn fabrics(&self) -> Result<FabricsStatusCode> {
        if self.code_type != StatusCodeType::CommandSpecific {
            return Err(NvmfError::invalid_argument(format!(
                "status code type {:?} is not command specific",
                self.code_type
            )));
        }
        FabricsStatusCode::try_from(self.code)
    }
}

impl fmt::Display for StatusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/0x{:02x}", self.code_type, self.code)?;
        if self.more {
            write!(f, " (more)")?;
        }
        if self.do_not_retry {
            write!(f, " (dnr)")?;
        }
        Ok(())
    }
}

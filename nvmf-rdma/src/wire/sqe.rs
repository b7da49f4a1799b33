//! Submission queue entry (64 bytes) and command capsule sizing
//!
//! 0       opcode
//! 1       fused operation (bits 1:0), SGL data transfer (bit 6)
//! 2..4    command identifier
//! 4..8    namespace id, or fabrics command type at byte 4
//! 24..40  SGL descriptor 1
//! 40..64  command dwords 10-15

use super::opcode::{CommandOpcode, FabricsCommandType};
use super::sgl::{SglDescriptor, SGL_DESCRIPTOR_SIZE};
use super::{read_u16, read_u32, read_u8, write_u16, write_u32, write_u8, zero};
use crate::error::{NvmfError, Result};

pub const SUBMISSION_ENTRY_SIZE: usize = 64;

const OPCODE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const COMMAND_ID_OFFSET: usize = 2;
const NAMESPACE_ID_OFFSET: usize = 4;
const FABRICS_COMMAND_TYPE_OFFSET: usize = 4;
const SGL1_OFFSET: usize = 24;
const DWORD10_OFFSET: usize = 40;

const FUSED_MASK: u8 = 0x3;
const SGL_DATA_TRANSFER_BIT: u8 = 1 << 6;

/// Capsule size for the given layout: the entry plus additional SGLs, or
/// the entry plus in-capsule data, whichever is larger
pub fn command_capsule_size(
    additional_sgls: u32,
    in_capsule_data_offset: u32,
    in_capsule_data_size: u32,
) -> Result<usize> {
    let overflow = || NvmfError::invalid_argument("command capsule size overflows");
    let with_sgls = (additional_sgls as usize)
        .checked_mul(SGL_DESCRIPTOR_SIZE)
        .and_then(|n| n.checked_add(SUBMISSION_ENTRY_SIZE))
        .ok_or_else(overflow)?;
    if in_capsule_data_size == 0 {
        return Ok(with_sgls);
    }
    let with_data = SUBMISSION_ENTRY_SIZE
        .checked_add(in_capsule_data_offset as usize)
        .and_then(|n| n.checked_add(in_capsule_data_size as usize))
        .filter(|n| u32::try_from(*n).is_ok())
        .ok_or_else(overflow)?;
    Ok(with_sgls.max(with_data))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FusedOperation {
    Normal = 0x0,
    First = 0x1,
    Second = 0x2,
}

impl TryFrom<u8> for FusedOperation {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(FusedOperation::Normal),
            0x1 => Ok(FusedOperation::First),
            0x2 => Ok(FusedOperation::Second),
            _ => Err(NvmfError::invalid_wire("fused operation", value)),
        }
    }
}

fn check_len(len: usize) -> Result<()> {
    if len < SUBMISSION_ENTRY_SIZE {
        return Err(NvmfError::OutOfBounds {
            index: 0,
            len: SUBMISSION_ENTRY_SIZE,
            capacity: len,
        });
    }
    Ok(())
}

fn dword_offset(index: usize) -> Result<usize> {
    match index {
        10..=15 => Ok(DWORD10_OFFSET + (index - 10) * 4),
        _ => Err(NvmfError::invalid_argument(format!(
            "command dword {} is not command specific",
            index
        ))),
    }
}

/// Read-only view of a submission entry
#[derive(Debug, Clone, Copy)]
pub struct SubmissionEntry<'a> {
    bytes: &'a [u8],
}

impl<'a> SubmissionEntry<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        check_len(bytes.len())?;
        Ok(Self { bytes })
    }

    pub fn opcode(&self) -> Result<u8> {
        read_u8(self.bytes, OPCODE_OFFSET)
    }

    pub fn command_id(&self) -> Result<u16> {
        read_u16(self.bytes, COMMAND_ID_OFFSET)
    }

    pub fn namespace_id(&self) -> Result<u32> {
        read_u32(self.bytes, NAMESPACE_ID_OFFSET)
    }

    pub fn fabrics_command_type(&self) -> Result<FabricsCommandType> {
        FabricsCommandType::try_from(read_u8(self.bytes, FABRICS_COMMAND_TYPE_OFFSET)?)
    }

    pub fn fused(&self) -> Result<FusedOperation> {
        FusedOperation::try_from(read_u8(self.bytes, FLAGS_OFFSET)? & FUSED_MASK)
    }

    pub fn uses_sgl(&self) -> Result<bool> {
        Ok(read_u8(self.bytes, FLAGS_OFFSET)? & SGL_DATA_TRANSFER_BIT != 0)
    }

    pub fn sgl1(&self) -> Result<SglDescriptor> {
        SglDescriptor::decode(&self.bytes[SGL1_OFFSET..SGL1_OFFSET + SGL_DESCRIPTOR_SIZE])
    }

    pub fn dword(&self, index: usize) -> Result<u32> {
        read_u32(self.bytes, dword_offset(index)?)
    }
}

/// Writable view of a submission entry
#[derive(Debug)]
pub struct SubmissionEntryMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> SubmissionEntryMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Result<Self> {
        check_len(bytes.len())?;
        Ok(Self { bytes })
    }

    /// Zero the entry and mark data transfer as SGL based
    pub fn initialize(&mut self) -> Result<()> {
        zero(self.bytes, 0, SUBMISSION_ENTRY_SIZE)?;
        write_u8(self.bytes, FLAGS_OFFSET, SGL_DATA_TRANSFER_BIT)
    }

    pub fn as_entry(&self) -> SubmissionEntry<'_> {
        SubmissionEntry { bytes: &*self.bytes }
    }

    pub fn set_opcode(&mut self, opcode: impl CommandOpcode) -> Result<()> {
        write_u8(self.bytes, OPCODE_OFFSET, opcode.opcode())
    }

    /// Fabrics opcode plus command type
    pub fn set_fabrics_command(&mut self, command_type: FabricsCommandType) -> Result<()> {
        self.set_opcode(command_type)?;
        write_u8(self.bytes, FABRICS_COMMAND_TYPE_OFFSET, command_type as u8)
    }

    pub fn set_command_id(&mut self, command_id: u16) -> Result<()> {
        write_u16(self.bytes, COMMAND_ID_OFFSET, command_id)
    }

    pub fn set_namespace_id(&mut self, namespace_id: u32) -> Result<()> {
        write_u32(self.bytes, NAMESPACE_ID_OFFSET, namespace_id)
    }

    pub fn set_fused(&mut self, fused: FusedOperation) -> Result<()> {
        let flags = read_u8(self.bytes, FLAGS_OFFSET)? & !FUSED_MASK;
        write_u8(self.bytes, FLAGS_OFFSET, flags | fused as u8)
    }

    pub fn set_sgl1(&mut self, descriptor: &SglDescriptor) -> Result<()> {
        descriptor.encode(&mut self.bytes[SGL1_OFFSET..SGL1_OFFSET + SGL_DESCRIPTOR_SIZE])
    }

    pub fn set_dword(&mut self, index: usize, value: u32) -> Result<()> {
        write_u32(self.bytes, dword_offset(index)?, value)
    }
}

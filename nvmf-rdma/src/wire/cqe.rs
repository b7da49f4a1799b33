//! Completion queue entry (16 bytes)
//!
//! 0..8    command specific
//! 8..10   SQ head pointer
//! 10..12  SQ identifier
//! 12..14  command identifier
//! 14..16  status field

use super::status::StatusField;
use super::{read_u16, read_u64, write_u16, write_u64};
use crate::error::Result;

pub const COMPLETION_ENTRY_SIZE: usize = 16;

const COMMAND_SPECIFIC_OFFSET: usize = 0;
const SQ_HEAD_OFFSET: usize = 8;
const SQ_ID_OFFSET: usize = 10;
const COMMAND_ID_OFFSET: usize = 12;
const STATUS_OFFSET: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEntry {
    pub command_specific: u64,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    pub status: StatusField,
}

impl CompletionEntry {
    /// Command identifier only; readable before the rest is validated
    pub fn command_id_of(bytes: &[u8]) -> Result<u16> {
        read_u16(bytes, COMMAND_ID_OFFSET)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            command_specific: read_u64(bytes, COMMAND_SPECIFIC_OFFSET)?,
            sq_head: read_u16(bytes, SQ_HEAD_OFFSET)?,
            sq_id: read_u16(bytes, SQ_ID_OFFSET)?,
            command_id: Self::command_id_of(bytes)?,
            status: StatusField::decode(read_u16(bytes, STATUS_OFFSET)?)?,
        })
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        write_u64(out, COMMAND_SPECIFIC_OFFSET, self.command_specific)?;
        write_u16(out, SQ_HEAD_OFFSET, self.sq_head)?;
        write_u16(out, SQ_ID_OFFSET, self.sq_id)?;
        write_u16(out, COMMAND_ID_OFFSET, self.command_id)?;
        write_u16(out, STATUS_OFFSET, self.status.encode())
    }

    /// Low dword of the command-specific field
    pub fn dword0(&self) -> u32 {
        self.command_specific as u32
    }

    pub fn dword1(&self) -> u32 {
        (self.command_specific >> 32) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NvmfError;
    use crate::wire::status::{GenericStatusCode, StatusCodeType};

    #[test]
    fn test_decode_layout() {
        let mut bytes = [0u8; COMPLETION_ENTRY_SIZE];
        bytes[0..4].copy_from_slice(&0x0001_0002u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0xffff_0000u32.to_le_bytes());
        bytes[8..10].copy_from_slice(&17u16.to_le_bytes());
        bytes[10..12].copy_from_slice(&1u16.to_le_bytes());
        bytes[12..14].copy_from_slice(&0x0203u16.to_le_bytes());
        bytes[14..16].copy_from_slice(&((0x0b << 1) as u16).to_le_bytes());

        let cqe = CompletionEntry::decode(&bytes).unwrap();
        assert_eq!(cqe.dword0(), 0x0001_0002);
        assert_eq!(cqe.dword1(), 0xffff_0000);
        assert_eq!(cqe.sq_head, 17);
        assert_eq!(cqe.sq_id, 1);
        assert_eq!(cqe.command_id, 0x0203);
        assert_eq!(cqe.status.code_type, StatusCodeType::Generic);
        assert_eq!(
            cqe.status.generic().unwrap(),
            GenericStatusCode::InvalidNamespaceOrFormat
        );
        assert_eq!(CompletionEntry::command_id_of(&bytes).unwrap(), 0x0203);

        let mut out = [0u8; COMPLETION_ENTRY_SIZE];
        cqe.encode(&mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_decode_rejects_short_and_reserved() {
        assert!(matches!(
            CompletionEntry::decode(&[0u8; 12]),
            Err(NvmfError::OutOfBounds { .. })
        ));

        let mut bytes = [0u8; COMPLETION_ENTRY_SIZE];
        bytes[14..16].copy_from_slice(&(5u16 << 9).to_le_bytes());
        assert!(matches!(
            CompletionEntry::decode(&bytes),
            Err(NvmfError::InvalidWireValue { .. })
        ));
        // identifier is still recoverable for correlation
        assert_eq!(CompletionEntry::command_id_of(&bytes).unwrap(), 0);
    }
}

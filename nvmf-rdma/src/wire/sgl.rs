//! Scatter/gather list descriptors
//!
//! 16 bytes; byte 15 holds the descriptor type in its high nibble and the
//! subtype in its low nibble.
//!
//! Data block:        address 0..8, length 8..12 (u32)
//! Keyed data block:  address 0..8, length 8..11 (24 bit), key 11..15

use super::{read_u32, read_u64, read_u8, write_u16, write_u32, write_u64, write_u8, zero};
use crate::error::{NvmfError, Result};
use crate::pool::KeyedBuffer;

pub const SGL_DESCRIPTOR_SIZE: usize = 16;

const ADDRESS_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 8;
const KEY_OFFSET: usize = 11;
const IDENTIFIER_OFFSET: usize = 15;
const TYPE_SHIFT: u8 = 4;

/// Largest length a keyed descriptor can carry
pub const MAX_KEYED_LENGTH: u32 = 0x00ff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SglType {
    DataBlock = 0x0,
    KeyedDataBlock = 0x4,
}

impl TryFrom<u8> for SglType {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(SglType::DataBlock),
            0x4 => Ok(SglType::KeyedDataBlock),
            _ => Err(NvmfError::invalid_wire("SGL descriptor type", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataBlockSubtype {
    /// Address is a 64-bit host address
    Address = 0x0,
    /// Address is an offset into in-capsule data
    Offset = 0x1,
}

impl TryFrom<u8> for DataBlockSubtype {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(DataBlockSubtype::Address),
            0x1 => Ok(DataBlockSubtype::Offset),
            _ => Err(NvmfError::invalid_wire("data block SGL subtype", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyedSubtype {
    Address = 0x0,
    /// Controller should remotely invalidate the key once done
    InvalidateKey = 0xf,
}

impl TryFrom<u8> for KeyedSubtype {
    type Error = NvmfError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(KeyedSubtype::Address),
            0xf => Ok(KeyedSubtype::InvalidateKey),
            _ => Err(NvmfError::invalid_wire("keyed SGL subtype", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SglDescriptor {
    DataBlock {
        subtype: DataBlockSubtype,
        address: u64,
        length: u32,
    },
    Keyed {
        subtype: KeyedSubtype,
        address: u64,
        length: u32,
        key: u32,
    },
}

impl SglDescriptor {
    /// Keyed descriptor covering the remaining window of `buffer`
    pub fn keyed(buffer: &impl KeyedBuffer) -> Result<Self> {
        let length = u32::try_from(buffer.data_length())
            .ok()
            .filter(|len| *len <= MAX_KEYED_LENGTH)
            .ok_or_else(|| {
                NvmfError::invalid_argument(format!(
                    "keyed SGL length {} exceeds 24 bits",
                    buffer.data_length()
                ))
            })?;
        Ok(SglDescriptor::Keyed {
            subtype: KeyedSubtype::Address,
            address: buffer.data_address(),
            length,
            key: buffer.remote_key(),
        })
    }

    /// Data block pointing `offset` bytes into the in-capsule data
    pub fn in_capsule(offset: u64, length: u32) -> Self {
        SglDescriptor::DataBlock {
            subtype: DataBlockSubtype::Offset,
            address: offset,
            length,
        }
    }

    pub fn sgl_type(&self) -> SglType {
        match self {
            SglDescriptor::DataBlock { .. } => SglType::DataBlock,
            SglDescriptor::Keyed { .. } => SglType::KeyedDataBlock,
        }
    }

    pub fn address(&self) -> u64 {
        match *self {
            SglDescriptor::DataBlock { address, .. } | SglDescriptor::Keyed { address, .. } => {
                address
            }
        }
    }

    pub fn length(&self) -> u32 {
        match *self {
            SglDescriptor::DataBlock { length, .. } | SglDescriptor::Keyed { length, .. } => length,
        }
    }

    /// Write all 16 bytes at the start of `out`
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        zero(out, 0, SGL_DESCRIPTOR_SIZE)?;
        match *self {
            SglDescriptor::DataBlock {
                subtype,
                address,
                length,
            } => {
                write_u64(out, ADDRESS_OFFSET, address)?;
                write_u32(out, LENGTH_OFFSET, length)?;
                write_u8(out, IDENTIFIER_OFFSET, identifier(SglType::DataBlock, subtype as u8))
            }
            SglDescriptor::Keyed {
                subtype,
                address,
                length,
                key,
            } => {
                if length > MAX_KEYED_LENGTH {
                    return Err(NvmfError::invalid_argument(format!(
                        "keyed SGL length {} exceeds 24 bits",
                        length
                    )));
                }
                write_u64(out, ADDRESS_OFFSET, address)?;
                write_u16(out, LENGTH_OFFSET, length as u16)?;
                write_u8(out, LENGTH_OFFSET + 2, (length >> 16) as u8)?;
                write_u32(out, KEY_OFFSET, key)?;
                write_u8(
                    out,
                    IDENTIFIER_OFFSET,
                    identifier(SglType::KeyedDataBlock, subtype as u8),
                )
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let id = read_u8(bytes, IDENTIFIER_OFFSET)?;
        let address = read_u64(bytes, ADDRESS_OFFSET)?;
        let subtype = id & 0x0f;
        match SglType::try_from(id >> TYPE_SHIFT)? {
            SglType::DataBlock => Ok(SglDescriptor::DataBlock {
                subtype: DataBlockSubtype::try_from(subtype)?,
                address,
                length: read_u32(bytes, LENGTH_OFFSET)?,
            }),
            SglType::KeyedDataBlock => Ok(SglDescriptor::Keyed {
                subtype: KeyedSubtype::try_from(subtype)?,
                address,
                length: read_u32(bytes, LENGTH_OFFSET)? & MAX_KEYED_LENGTH,
                key: read_u32(bytes, KEY_OFFSET)?,
            }),
        }
    }
}

fn identifier(sgl_type: SglType, subtype: u8) -> u8 {
    ((sgl_type as u8) << TYPE_SHIFT) | (subtype & 0x0f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::RegisteredBuffer;
    use crate::transport::loopback::LoopbackRegistrar;

    #[test]
    fn test_keyed_round_trip() {
        let descriptor = SglDescriptor::Keyed {
            subtype: KeyedSubtype::Address,
            address: 0x1122_3344_5566_7788,
            length: 0x00ab_cdef,
            key: 0xdead_beef,
        };
        let mut bytes = [0xffu8; SGL_DESCRIPTOR_SIZE];
        descriptor.encode(&mut bytes).unwrap();

        assert_eq!(bytes[15], 0x40);
        assert_eq!(&bytes[8..11], &[0xef, 0xcd, 0xab]);
        assert_eq!(&bytes[11..15], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(SglDescriptor::decode(&bytes).unwrap(), descriptor);
    }

    #[test]
    fn test_keyed_length_limit() {
        let descriptor = SglDescriptor::Keyed {
            subtype: KeyedSubtype::InvalidateKey,
            address: 0,
            length: MAX_KEYED_LENGTH + 1,
            key: 1,
        };
        let mut bytes = [0u8; SGL_DESCRIPTOR_SIZE];
        assert!(matches!(
            descriptor.encode(&mut bytes),
            Err(NvmfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalidate_key_identifier() {
        let descriptor = SglDescriptor::Keyed {
            subtype: KeyedSubtype::InvalidateKey,
            address: 0x1000,
            length: 4096,
            key: 7,
        };
        let mut bytes = [0u8; SGL_DESCRIPTOR_SIZE];
        descriptor.encode(&mut bytes).unwrap();
        assert_eq!(bytes[15], 0x4f);
        assert_eq!(SglDescriptor::decode(&bytes).unwrap(), descriptor);
    }

    #[test]
    fn test_data_block_offset() {
        let descriptor = SglDescriptor::in_capsule(0, 512);
        let mut bytes = [0u8; SGL_DESCRIPTOR_SIZE];
        descriptor.encode(&mut bytes).unwrap();
        assert_eq!(bytes[15], 0x01);
        assert_eq!(&bytes[8..12], &512u32.to_le_bytes());
        assert_eq!(descriptor.sgl_type(), SglType::DataBlock);
        assert_eq!(SglDescriptor::decode(&bytes).unwrap(), descriptor);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = [0u8; SGL_DESCRIPTOR_SIZE];
        bytes[15] = 0x20;
        assert!(matches!(
            SglDescriptor::decode(&bytes),
            Err(NvmfError::InvalidWireValue { value: 0x2, .. })
        ));
        bytes[15] = 0x43;
        assert!(SglDescriptor::decode(&bytes).is_err());
        assert!(SglDescriptor::decode(&bytes[..8]).is_err());
    }

    #[test]
    fn test_keyed_from_buffer() {
        let registrar = LoopbackRegistrar::new();
        let mut buffer = RegisteredBuffer::register(&registrar, vec![0u8; 8192]).unwrap();
        buffer.set_window(512..4608).unwrap();

        let descriptor = SglDescriptor::keyed(&buffer).unwrap();
        assert_eq!(descriptor.address(), buffer.address() + 512);
        assert_eq!(descriptor.length(), 4096);
        assert!(matches!(
            descriptor,
            SglDescriptor::Keyed { key, .. } if key == buffer.remote_key()
        ));
    }
}

//! NVMe over Fabrics wire formats
//!
//! Every multi-byte field is little-endian. Views and codecs here work on
//! plain byte slices so they apply equally to pool elements, registered
//! buffers and test arrays.

pub mod cqe;
pub mod opcode;
pub mod private_data;
pub mod sgl;
pub mod sqe;
pub mod status;

use crate::error::{NvmfError, Result};

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    let bytes = offset
        .checked_add(N)
        .and_then(|end| buf.get(offset..end))
        .ok_or(NvmfError::OutOfBounds {
            index: offset,
            len: N,
            capacity: buf.len(),
        })?;
    let mut raw = [0u8; N];
    raw.copy_from_slice(bytes);
    Ok(raw)
}

fn field_mut(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8]> {
    let capacity = buf.len();
    offset
        .checked_add(len)
        .and_then(move |end| buf.get_mut(offset..end))
        .ok_or(NvmfError::OutOfBounds {
            index: offset,
            len,
            capacity,
        })
}

pub(crate) fn read_u8(buf: &[u8], offset: usize) -> Result<u8> {
    Ok(field::<1>(buf, offset)?[0])
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    field(buf, offset).map(u16::from_le_bytes)
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    field(buf, offset).map(u32::from_le_bytes)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    field(buf, offset).map(u64::from_le_bytes)
}

pub(crate) fn write_u8(buf: &mut [u8], offset: usize, value: u8) -> Result<()> {
    field_mut(buf, offset, 1)?[0] = value;
    Ok(())
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<()> {
    field_mut(buf, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    field_mut(buf, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<()> {
    field_mut(buf, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Zero `len` bytes at `offset`
pub(crate) fn zero(buf: &mut [u8], offset: usize, len: usize) -> Result<()> {
    field_mut(buf, offset, len)?.fill(0);
    Ok(())
}

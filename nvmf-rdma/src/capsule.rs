//! Command capsules
//!
//! A capsule is one pool element laid out as
//! - the 64-byte submission entry
//! - additional SGL descriptors, 16 bytes each
//! - in-capsule data, `offset` bytes past the entry
//!
//! The queue pair stamps the command identifier at submit time; everything
//! else is up to the caller.

use crate::error::{NvmfError, Result};
use crate::pool::{BufferSliceMut, ByteAccess, ByteAccessMut, KeyedBuffer, PoolElement};
use crate::wire::sgl::{SglDescriptor, SGL_DESCRIPTOR_SIZE};
use crate::wire::sqe::{
    command_capsule_size, SubmissionEntry, SubmissionEntryMut, SUBMISSION_ENTRY_SIZE,
};

/// Geometry shared by every capsule of one queue pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsuleLayout {
    pub size: usize,
    pub additional_sgls: u32,
    pub in_capsule_data_offset: u32,
    pub in_capsule_data_size: u32,
}

impl CapsuleLayout {
    pub fn new(
        additional_sgls: u32,
        in_capsule_data_offset: u32,
        in_capsule_data_size: u32,
    ) -> Result<Self> {
        Ok(Self {
            size: command_capsule_size(
                additional_sgls,
                in_capsule_data_offset,
                in_capsule_data_size,
            )?,
            additional_sgls,
            in_capsule_data_offset,
            in_capsule_data_size,
        })
    }
}

pub struct CommandCapsule {
    element: PoolElement,
    layout: CapsuleLayout,
    inline: bool,
}

impl CommandCapsule {
    pub(crate) fn new(mut element: PoolElement, layout: CapsuleLayout) -> Result<Self> {
        if element.capacity() < layout.size {
            return Err(NvmfError::invalid_argument(format!(
                "element of {} bytes cannot hold a {}-byte capsule",
                element.capacity(),
                layout.size
            )));
        }
        SubmissionEntryMut::new(element.bytes_mut()?)?.initialize()?;
        Ok(Self {
            element,
            layout,
            inline: false,
        })
    }

    pub fn layout(&self) -> &CapsuleLayout {
        &self.layout
    }

    pub fn size(&self) -> usize {
        self.layout.size
    }

    pub fn entry(&self) -> Result<SubmissionEntry<'_>> {
        SubmissionEntry::new(&self.element.bytes()?[..SUBMISSION_ENTRY_SIZE])
    }

    pub fn entry_mut(&mut self) -> Result<SubmissionEntryMut<'_>> {
        SubmissionEntryMut::new(&mut self.element.bytes_mut()?[..SUBMISSION_ENTRY_SIZE])
    }

    /// Fill additional SGL slot `index`
    pub fn set_additional_sgl(&mut self, index: u32, descriptor: &SglDescriptor) -> Result<()> {
        if index >= self.layout.additional_sgls {
            return Err(NvmfError::invalid_argument(format!(
                "additional SGL {} out of range ({} configured)",
                index, self.layout.additional_sgls
            )));
        }
        let offset = SUBMISSION_ENTRY_SIZE + index as usize * SGL_DESCRIPTOR_SIZE;
        let bytes = self.element.bytes_mut()?;
        descriptor.encode(&mut bytes[offset..offset + SGL_DESCRIPTOR_SIZE])
    }

    /// Writable in-capsule data area
    pub fn in_capsule_data(&mut self) -> Result<BufferSliceMut<'_>> {
        if self.layout.in_capsule_data_size == 0 {
            return Err(NvmfError::invalid_argument(
                "capsule carries no in-capsule data",
            ));
        }
        let start = SUBMISSION_ENTRY_SIZE + self.layout.in_capsule_data_offset as usize;
        let end = start + self.layout.in_capsule_data_size as usize;
        self.element.slice_mut(start..end)
    }

    /// Request an inline send; checked against the transport at submit
    pub fn set_inline(&mut self, inline: bool) {
        self.inline = inline;
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub(crate) fn address(&self) -> u64 {
        self.element.address()
    }

    pub(crate) fn local_key(&self) -> u32 {
        self.element.local_key()
    }

    pub fn is_valid(&self) -> bool {
        self.element.is_valid()
    }

    /// Give the buffer back to the command pool
    pub fn release(mut self) -> Result<()> {
        self.element.release()
    }
}

impl std::fmt::Debug for CommandCapsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCapsule")
            .field("element", &self.element)
            .field("layout", &self.layout)
            .field("inline", &self.inline)
            .finish()
    }
}

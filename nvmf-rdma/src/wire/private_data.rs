//! RDMA-CM private data records exchanged at connect time (32 bytes each)

use super::{read_u16, write_u16};
use crate::error::{NvmfError, Result};
use std::fmt;

pub const PRIVATE_DATA_SIZE: usize = 32;

const RECORD_FORMAT_OFFSET: usize = 0;
const REQUEST_QUEUE_ID_OFFSET: usize = 2;
const REQUEST_RECEIVE_QUEUE_SIZE_OFFSET: usize = 4;
const REQUEST_SEND_QUEUE_SIZE_OFFSET: usize = 6;
const ACCEPT_RECEIVE_QUEUE_SIZE_OFFSET: usize = 2;

const RECORD_FORMAT: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u16);

impl QueueId {
    pub const ADMIN: QueueId = QueueId(0);

    pub fn is_admin(self) -> bool {
        self == Self::ADMIN
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_admin() {
            write!(f, "admin")
        } else {
            write!(f, "io{}", self.0)
        }
    }
}

/// Host connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub queue_id: QueueId,
    /// Host receive queue size (HRQSIZE)
    pub receive_queue_size: u16,
}

impl ConnectRequest {
    /// HSQSIZE; one less than the receive queue because the controller
    /// never answers its own keep-alives
    pub fn send_queue_size(&self) -> u16 {
        self.receive_queue_size.saturating_sub(1)
    }

    pub fn encode(&self) -> Result<[u8; PRIVATE_DATA_SIZE]> {
        let mut out = [0u8; PRIVATE_DATA_SIZE];
        write_u16(&mut out, RECORD_FORMAT_OFFSET, RECORD_FORMAT)?;
        write_u16(&mut out, REQUEST_QUEUE_ID_OFFSET, self.queue_id.0)?;
        write_u16(
            &mut out,
            REQUEST_RECEIVE_QUEUE_SIZE_OFFSET,
            self.receive_queue_size,
        )?;
        write_u16(
            &mut out,
            REQUEST_SEND_QUEUE_SIZE_OFFSET,
            self.send_queue_size(),
        )?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_record_format(bytes)?;
        Ok(Self {
            queue_id: QueueId(read_u16(bytes, REQUEST_QUEUE_ID_OFFSET)?),
            receive_queue_size: read_u16(bytes, REQUEST_RECEIVE_QUEUE_SIZE_OFFSET)?,
        })
    }
}

/// Controller accept record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAccept {
    /// Controller receive queue size (CRQSIZE)
    pub receive_queue_size: u16,
}

impl ConnectAccept {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_record_format(bytes)?;
        Ok(Self {
            receive_queue_size: read_u16(bytes, ACCEPT_RECEIVE_QUEUE_SIZE_OFFSET)?,
        })
    }

    pub fn encode(&self) -> Result<[u8; PRIVATE_DATA_SIZE]> {
        let mut out = [0u8; PRIVATE_DATA_SIZE];
        write_u16(&mut out, RECORD_FORMAT_OFFSET, RECORD_FORMAT)?;
        write_u16(
            &mut out,
            ACCEPT_RECEIVE_QUEUE_SIZE_OFFSET,
            self.receive_queue_size,
        )?;
        Ok(out)
    }
}

fn check_record_format(bytes: &[u8]) -> Result<()> {
    match read_u16(bytes, RECORD_FORMAT_OFFSET)? {
        RECORD_FORMAT => Ok(()),
        other => Err(NvmfError::invalid_wire("private data record format", other)),
    }
}

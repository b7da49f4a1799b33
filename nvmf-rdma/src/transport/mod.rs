//! Transport layer abstraction for the queue pair engine
//!
//! The engine only needs four things from a reliable-connection transport:
//! - post a send of a registered buffer
//! - post a receive into a registered buffer
//! - poll a bounded batch of work completions
//! - register memory so both sides can address it
//!
//! Backends:
//! - Loopback: in-process, no hardware; also the controller double for tests
//! - RDMA: ibverbs + RDMA-CM, behind the `rdma` feature

use crate::error::{NvmfError, Result};
use std::fmt;

pub mod loopback;

/// Memory region handle for zero-copy transfers
pub trait MemoryRegion: Send + Sync {
    /// Get the local key for this region (used by the local transport)
    fn lkey(&self) -> u32;

    /// Get the remote key for this region (used by the peer for RDMA READ/WRITE)
    fn rkey(&self) -> u32;

    /// Get the base address
    fn addr(&self) -> *mut u8;

    /// Get the length in bytes
    fn length(&self) -> usize;
}

impl fmt::Debug for dyn MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &self.addr())
            .field("length", &self.length())
            .field("lkey", &self.lkey())
            .field("rkey", &self.rkey())
            .finish()
    }
}

/// Registers memory with a protection domain
pub trait MemoryRegistrar: Send + Sync {
    /// Register `length` bytes at `addr` for local write and remote read/write
    ///
    /// The memory must stay mapped until the returned region is dropped.
    fn register_memory(&self, addr: *mut u8, length: usize) -> Result<Box<dyn MemoryRegion>>;

    /// Identifies the protection domain; pools are shared per domain
    fn domain_id(&self) -> u64;
}

/// Scatter/gather element of a work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Signaled SEND work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub wr_id: u64,
    pub sge: Sge,
    pub inline: bool,
}

/// Receive work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub wr_id: u64,
    pub sge: Sge,
}

/// Work completion status (`enum ibv_wc_status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WcStatus {
    Success = 0,
    LocLenErr = 1,
    LocQpOpErr = 2,
    LocEecOpErr = 3,
    LocProtErr = 4,
    WrFlushErr = 5,
    MwBindErr = 6,
    BadRespErr = 7,
    LocAccessErr = 8,
    RemInvReqErr = 9,
    RemAccessErr = 10,
    RemOpErr = 11,
    RetryExcErr = 12,
    RnrRetryExcErr = 13,
    LocRddViolErr = 14,
    RemInvRdReqErr = 15,
    RemAbortErr = 16,
    InvEecnErr = 17,
    InvEecStateErr = 18,
    FatalErr = 19,
    RespTimeoutErr = 20,
    GeneralErr = 21,
    TmErr = 22,
    TmRndvIncomplete = 23,
}

impl TryFrom<u32> for WcStatus {
    type Error = NvmfError;

    fn try_from(value: u32) -> Result<Self> {
        use WcStatus::*;
        Ok(match value {
            0 => Success,
            1 => LocLenErr,
            2 => LocQpOpErr,
            3 => LocEecOpErr,
            4 => LocProtErr,
            5 => WrFlushErr,
            6 => MwBindErr,
            7 => BadRespErr,
            8 => LocAccessErr,
            9 => RemInvReqErr,
            10 => RemAccessErr,
            11 => RemOpErr,
            12 => RetryExcErr,
            13 => RnrRetryExcErr,
            14 => LocRddViolErr,
            15 => RemInvRdReqErr,
            16 => RemAbortErr,
            17 => InvEecnErr,
            18 => InvEecStateErr,
            19 => FatalErr,
            20 => RespTimeoutErr,
            21 => GeneralErr,
            22 => TmErr,
            23 => TmRndvIncomplete,
            _ => return Err(NvmfError::invalid_wire("work completion status", value)),
        })
    }
}

/// Work completion opcode (`enum ibv_wc_opcode`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WcOpcode {
    Send = 0,
    RdmaWrite = 1,
    RdmaRead = 2,
    CompSwap = 3,
    FetchAdd = 4,
    BindMw = 5,
    LocalInv = 6,
    Tso = 7,
    Recv = 128,
    RecvRdmaWithImm = 129,
}

impl TryFrom<u32> for WcOpcode {
    type Error = NvmfError;

    fn try_from(value: u32) -> Result<Self> {
        use WcOpcode::*;
        Ok(match value {
            0 => Send,
            1 => RdmaWrite,
            2 => RdmaRead,
            3 => CompSwap,
            4 => FetchAdd,
            5 => BindMw,
            6 => LocalInv,
            7 => Tso,
            128 => Recv,
            129 => RecvRdmaWithImm,
            _ => return Err(NvmfError::invalid_wire("work completion opcode", value)),
        })
    }
}

/// One raw completion record from the shared completion queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    /// Only meaningful when `status` is `Success`
    pub opcode: Option<WcOpcode>,
    pub byte_len: u32,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Reliable-connection queue transport
///
/// One instance backs one queue pair: a send queue, a receive queue and a
/// single completion queue shared by both. Not required to be `Sync`; the
/// engine drives it from one poller thread.
pub trait QueueTransport: Send {
    /// Post a signaled SEND
    fn post_send(&mut self, request: SendRequest) -> Result<()>;

    /// Post a receive buffer
    fn post_receive(&mut self, request: ReceiveRequest) -> Result<()>;

    /// Poll at most `batch` completions, appending them to `out` in
    /// delivery order. Never blocks.
    fn poll_completions(&mut self, out: &mut Vec<WorkCompletion>, batch: usize) -> Result<usize>;

    /// Connect to the controller, sending the connection private data
    ///
    /// Called once after all receives have been posted.
    fn establish(&mut self, private_data: &[u8]) -> Result<()>;

    /// Tear the connection down; posted receives are flushed and their
    /// buffers are no longer written to once this returns
    fn disconnect(&mut self) -> Result<()>;

    /// Largest send that may be posted inline
    fn max_inline_data(&self) -> usize;

    /// Registrar for the protection domain this transport's QP lives in
    fn registrar(&self) -> std::sync::Arc<dyn MemoryRegistrar>;
}

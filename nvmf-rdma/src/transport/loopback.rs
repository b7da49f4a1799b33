//! In-process loopback transport
//!
//! Stands in for an RDMA queue pair and the remote controller behind it.
//! Works anywhere, no hardware or kernel modules needed.
//!
//! The transport half is handed to the engine; the [`LoopbackHandle`] plays
//! the controller:
//! - sends are copied at post time, like the HCA would read them
//! - responses are written straight into posted receive buffers
//! - completions are delivered in the order the handle produces them
//! - failures can be injected on either side

use super::{
    MemoryRegion, MemoryRegistrar, QueueTransport, ReceiveRequest, SendRequest, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::error::{NvmfError, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const DEFAULT_MAX_INLINE: usize = 256;
const COMPLETION_ENTRY_SIZE: usize = 16;

static NEXT_DOMAIN: AtomicU64 = AtomicU64::new(1);

/// Heap "registration": hands out unique keys, pins nothing
pub struct LoopbackRegistrar {
    domain: u64,
    next_key: AtomicU32,
}

impl LoopbackRegistrar {
    pub fn new() -> Self {
        Self {
            domain: NEXT_DOMAIN.fetch_add(1, Ordering::Relaxed),
            next_key: AtomicU32::new(1),
        }
    }
}

impl Default for LoopbackRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistrar for LoopbackRegistrar {
    fn register_memory(&self, addr: *mut u8, length: usize) -> Result<Box<dyn MemoryRegion>> {
        if addr.is_null() || length == 0 {
            return Err(NvmfError::invalid_argument(format!(
                "Cannot register {} bytes at {:?}",
                length, addr
            )));
        }
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Loopback registration: addr={:?}, len={}, key=0x{:x}",
            addr, length, key
        );
        Ok(Box::new(LoopbackMemoryRegion { addr, length, key }))
    }

    fn domain_id(&self) -> u64 {
        self.domain
    }
}

/// Loopback memory region (tracks address and key only)
struct LoopbackMemoryRegion {
    addr: *mut u8,
    length: usize,
    key: u32,
}

unsafe impl Send for LoopbackMemoryRegion {}
unsafe impl Sync for LoopbackMemoryRegion {}

impl MemoryRegion for LoopbackMemoryRegion {
    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        // distinct from lkey so mixups show up in tests
        self.key | 0x8000_0000
    }

    fn addr(&self) -> *mut u8 {
        self.addr
    }

    fn length(&self) -> usize {
        self.length
    }
}

/// Send seen by the controller, with the bytes it carried
#[derive(Debug, Clone)]
pub struct PostedSend {
    pub wr_id: u64,
    pub payload: Vec<u8>,
    pub inline: bool,
}

impl PostedSend {
    /// Command identifier at bytes 2..4 of the submission entry
    pub fn command_id(&self) -> Option<u16> {
        self.payload
            .get(2..4)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn opcode(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

#[derive(Default)]
struct State {
    sends: VecDeque<PostedSend>,
    receives: VecDeque<ReceiveRequest>,
    completions: VecDeque<WorkCompletion>,
    /// Auto-responses waiting for a receive buffer
    undelivered: VecDeque<[u8; COMPLETION_ENTRY_SIZE]>,
    private_data: Option<Vec<u8>>,
    disconnected: bool,
    fail_next_post: bool,
    reject_connect: bool,
    auto_respond: bool,
    sq_head: u16,
    total_sends: u64,
    total_receives: u64,
}

impl State {
    fn take_post_failure(&mut self) -> Result<()> {
        if self.disconnected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "loopback disconnected",
            )
            .into());
        }
        if std::mem::take(&mut self.fail_next_post) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected post failure",
            )
            .into());
        }
        Ok(())
    }

    fn completion_entry(&mut self, command_id: u16, status: u16) -> [u8; COMPLETION_ENTRY_SIZE] {
        self.sq_head = self.sq_head.wrapping_add(1);
        let mut cqe = [0u8; COMPLETION_ENTRY_SIZE];
        cqe[8..10].copy_from_slice(&self.sq_head.to_le_bytes());
        cqe[12..14].copy_from_slice(&command_id.to_le_bytes());
        cqe[14..16].copy_from_slice(&status.to_le_bytes());
        cqe
    }

    /// Write `cqe` into the oldest posted receive and complete it
    fn deliver(&mut self, cqe: &[u8; COMPLETION_ENTRY_SIZE]) -> bool {
        let Some(receive) = self.receives.pop_front() else {
            return false;
        };
        let len = COMPLETION_ENTRY_SIZE.min(receive.sge.length as usize);
        // Safety: the receive was posted over registered memory that the
        // poster keeps alive until the receive completes, and nothing else
        // touches it while posted.
        unsafe {
            std::ptr::copy_nonoverlapping(cqe.as_ptr(), receive.sge.addr as *mut u8, len);
        }
        self.completions.push_back(WorkCompletion {
            wr_id: receive.wr_id,
            status: WcStatus::Success,
            opcode: Some(WcOpcode::Recv),
            byte_len: len as u32,
        });
        true
    }

    fn complete_send(&mut self, wr_id: u64, status: WcStatus) -> bool {
        let Some(index) = self.sends.iter().position(|s| s.wr_id == wr_id) else {
            return false;
        };
        self.sends.remove(index);
        self.completions.push_back(WorkCompletion {
            wr_id,
            status,
            opcode: (status == WcStatus::Success).then_some(WcOpcode::Send),
            byte_len: 0,
        });
        true
    }
}

/// Engine-facing half of the loopback pair
pub struct LoopbackTransport {
    state: Arc<Mutex<State>>,
    registrar: Arc<LoopbackRegistrar>,
    max_inline: usize,
}

impl LoopbackTransport {
    /// Create a transport and the controller handle that drives it
    pub fn new() -> (Self, LoopbackHandle) {
        Self::with_max_inline(DEFAULT_MAX_INLINE)
    }

    pub fn with_max_inline(max_inline: usize) -> (Self, LoopbackHandle) {
        let state = Arc::new(Mutex::new(State::default()));
        let transport = Self {
            state: Arc::clone(&state),
            registrar: Arc::new(LoopbackRegistrar::new()),
            max_inline,
        };
        (transport, LoopbackHandle { state })
    }
}

impl QueueTransport for LoopbackTransport {
    fn post_send(&mut self, request: SendRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.take_post_failure()?;

        // Safety: the engine keeps the capsule alive and unmodified until
        // the send completes; copying here mirrors the HCA reading it.
        let payload = unsafe {
            std::slice::from_raw_parts(request.sge.addr as *const u8, request.sge.length as usize)
        }
        .to_vec();
        let send = PostedSend {
            wr_id: request.wr_id,
            payload,
            inline: request.inline,
        };
        debug!(
            "Loopback send: wr_id={}, cid={:?}, len={}",
            send.wr_id,
            send.command_id(),
            request.sge.length
        );
        state.total_sends += 1;

        if state.auto_respond {
            let cqe = send
                .command_id()
                .map(|cid| state.completion_entry(cid, 0));
            state.sends.push_back(send);
            state.complete_send(request.wr_id, WcStatus::Success);
            match cqe {
                Some(cqe) if !state.deliver(&cqe) => state.undelivered.push_back(cqe),
                Some(_) => {}
                None => warn!("Auto-respond: send {} too short for a command", request.wr_id),
            }
        } else {
            state.sends.push_back(send);
        }
        Ok(())
    }

    fn post_receive(&mut self, request: ReceiveRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.take_post_failure()?;
        state.total_receives += 1;
        state.receives.push_back(request);
        if let Some(cqe) = state.undelivered.pop_front() {
            state.deliver(&cqe);
        }
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<WorkCompletion>, batch: usize) -> Result<usize> {
        let mut state = self.state.lock();
        let count = batch.min(state.completions.len());
        out.extend(state.completions.drain(..count));
        Ok(count)
    }

    fn establish(&mut self, private_data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.private_data.is_some() {
            return Err(NvmfError::invalid_argument("Loopback already established"));
        }
        if state.reject_connect {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "loopback rejected connect",
            )
            .into());
        }
        info!(
            "Loopback connection established ({} receives posted)",
            state.receives.len()
        );
        state.private_data = Some(private_data.to_vec());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.disconnected {
            info!(
                "Loopback disconnected ({} receives flushed, {} sends dropped)",
                state.receives.len(),
                state.sends.len()
            );
        }
        state.disconnected = true;
        state.receives.clear();
        state.sends.clear();
        state.undelivered.clear();
        Ok(())
    }

    fn max_inline_data(&self) -> usize {
        self.max_inline
    }

    fn registrar(&self) -> Arc<dyn MemoryRegistrar> {
        Arc::clone(&self.registrar) as Arc<dyn MemoryRegistrar>
    }
}

/// Controller-facing half of the loopback pair
#[derive(Clone)]
pub struct LoopbackHandle {
    state: Arc<Mutex<State>>,
}

impl LoopbackHandle {
    /// Answer every command as soon as it is posted with a successful
    /// completion echoing its identifier
    pub fn set_auto_respond(&self, enabled: bool) {
        self.state.lock().auto_respond = enabled;
    }

    /// Make the next post (send or receive) fail
    pub fn fail_next_post(&self) {
        self.state.lock().fail_next_post = true;
    }

    /// Refuse the connect request, as a controller rejecting it would
    pub fn reject_connect(&self) {
        self.state.lock().reject_connect = true;
    }

    /// Private data the engine connected with
    pub fn private_data(&self) -> Option<Vec<u8>> {
        self.state.lock().private_data.clone()
    }

    /// Sends posted and not yet completed, oldest first
    pub fn pending_sends(&self) -> Vec<PostedSend> {
        self.state.lock().sends.iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state.lock();
        state.private_data.is_some() && !state.disconnected
    }

    pub fn posted_receives(&self) -> usize {
        self.state.lock().receives.len()
    }

    pub fn total_sends(&self) -> u64 {
        self.state.lock().total_sends
    }

    pub fn total_receives(&self) -> u64 {
        self.state.lock().total_receives
    }

    pub fn complete_send(&self, wr_id: u64) -> bool {
        self.state.lock().complete_send(wr_id, WcStatus::Success)
    }

    pub fn fail_send(&self, wr_id: u64, status: WcStatus) -> bool {
        self.state.lock().complete_send(wr_id, status)
    }

    /// Complete every pending send successfully
    pub fn complete_all_sends(&self) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.sends.iter().map(|s| s.wr_id).collect();
        for wr_id in &ids {
            state.complete_send(*wr_id, WcStatus::Success);
        }
        ids.len()
    }

    /// Deliver a completion entry for `command_id` with the raw status
    /// field; false if no receive buffer is posted
    pub fn respond(&self, command_id: u16, status: u16) -> bool {
        let mut state = self.state.lock();
        let cqe = state.completion_entry(command_id, status);
        state.deliver(&cqe)
    }

    /// Deliver arbitrary completion entry bytes
    pub fn respond_raw(&self, cqe: [u8; COMPLETION_ENTRY_SIZE]) -> bool {
        self.state.lock().deliver(&cqe)
    }

    /// Complete the oldest posted receive successfully with only `len`
    /// bytes written; the buffer keeps whatever it held before
    pub fn respond_truncated(&self, len: usize) -> bool {
        let mut state = self.state.lock();
        let Some(receive) = state.receives.pop_front() else {
            return false;
        };
        state.completions.push_back(WorkCompletion {
            wr_id: receive.wr_id,
            status: WcStatus::Success,
            opcode: Some(WcOpcode::Recv),
            byte_len: len as u32,
        });
        true
    }

    /// Fail the oldest posted receive; the buffer is consumed, as with a
    /// flushed receive on a broken connection
    pub fn fail_receive(&self, status: WcStatus) -> bool {
        let mut state = self.state.lock();
        let Some(receive) = state.receives.pop_front() else {
            return false;
        };
        state.completions.push_back(WorkCompletion {
            wr_id: receive.wr_id,
            status,
            opcode: None,
            byte_len: 0,
        });
        true
    }

    /// Queue a raw completion record
    pub fn inject(&self, completion: WorkCompletion) {
        self.state.lock().completions.push_back(completion);
    }
}

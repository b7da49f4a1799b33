//! Queue pair engine
//!
//! Multiplexes commands over one send queue, one receive queue and the
//! completion queue they share:
//! - `submit` reserves a command identifier, stamps it into the capsule and
//!   posts the send
//! - `poll` (see `poller`) matches completions back to their futures
//! - the identifier is reusable once both the send and the response have
//!   completed
//!
//! Not thread-safe: one thread posts and polls per queue pair.

use crate::capsule::{CapsuleLayout, CommandCapsule};
use crate::command_id::CommandIdTable;
use crate::config::QueuePairConfig;
use crate::error::{NvmfError, Result};
use crate::operation::{operation, CommandFuture, Completer, ResponseFuture};
use crate::pool::{KeyedBuffer, MemoryPool, PoolElement, PoolRegistry, RegisteredBuffer};
use crate::transport::{QueueTransport, ReceiveRequest, SendRequest, Sge, WorkCompletion};
use crate::wire::cqe::{CompletionEntry, COMPLETION_ENTRY_SIZE};
use crate::wire::private_data::{ConnectRequest, QueueId};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};

/// Receive work requests carry this bit so completions can be classified
/// by `wr_id` alone
pub(crate) const RECEIVE_WR_TAG: u64 = 1 << 63;

static NEXT_QUEUE_PAIR: AtomicU64 = AtomicU64::new(0);

pub(crate) struct InFlightCommand {
    pub(crate) capsule: CommandCapsule,
    pub(crate) completer: Completer<CommandCapsule>,
}

pub(crate) struct InFlightResponse {
    /// Taken when a receive failure is broadcast; the slot stays occupied
    pub(crate) completer: Option<Completer<CompletionEntry>>,
}

/// Identifier reserved with [`QueuePair::reserve_identifier`]
///
/// Must be passed to [`QueuePair::post`] or handed back with
/// [`QueuePair::unreserve`] on the queue pair that issued it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reserved identifier is lost unless posted or unreserved"]
pub struct Reservation {
    owner: u64,
    cid: u16,
}

impl Reservation {
    pub fn command_id(&self) -> u16 {
        self.cid
    }
}

pub struct QueuePair {
    pub(crate) transport: Box<dyn QueueTransport>,
    config: QueuePairConfig,
    layout: CapsuleLayout,
    command_pool: MemoryPool,
    /// Indexed by receive number (`wr_id` without the tag)
    pub(crate) receives: Vec<PoolElement>,
    pub(crate) table: CommandIdTable<InFlightCommand, InFlightResponse>,
    /// Reused batch buffer for the poller
    pub(crate) completions: Vec<WorkCompletion>,
    /// Tags reservations issued by this queue pair
    serial: u64,
    valid: bool,
}

impl QueuePair {
    /// Set up buffers, post every receive and connect
    ///
    /// One receive is posted per submission queue slot so that every
    /// in-flight command has a buffer for its response.
    pub fn new(
        transport: Box<dyn QueueTransport>,
        config: QueuePairConfig,
        pools: &PoolRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let layout = CapsuleLayout::new(
            config.additional_sgls,
            config.in_capsule_data_offset,
            config.in_capsule_data_size,
        )?;

        let registrar = transport.registrar();
        let command_pool = pools.get_pool(&registrar, layout.size)?;
        let response_pool = pools.get_pool(&registrar, COMPLETION_ENTRY_SIZE)?;

        let depth = config.submission_queue_size;
        let receives = (0..depth)
            .map(|_| response_pool.allocate())
            .collect::<Result<Vec<_>>>()?;

        let mut queue_pair = Self {
            transport,
            layout,
            command_pool,
            receives,
            table: CommandIdTable::new(depth),
            completions: Vec::with_capacity(crate::poller::POLL_BATCH_SIZE),
            serial: NEXT_QUEUE_PAIR.fetch_add(1, Ordering::Relaxed),
            valid: false,
            config,
        };

        if let Err(e) = queue_pair.connect() {
            // receives may already be posted
            let _ = queue_pair.shut_down();
            return Err(e);
        }
        queue_pair.valid = true;

        info!(
            "Queue pair {} connected: depth={}, capsule={} bytes, icd={} bytes",
            queue_pair.queue_id(),
            depth,
            layout.size,
            queue_pair.config.in_capsule_data_size
        );
        Ok(queue_pair)
    }

    fn connect(&mut self) -> Result<()> {
        for index in 0..self.receives.len() {
            self.post_receive(index)?;
        }
        let private_data = ConnectRequest {
            queue_id: self.queue_id(),
            receive_queue_size: self.config.submission_queue_size,
        }
        .encode()?;
        self.transport.establish(&private_data)
    }

    /// Disconnect the transport and let go of the receive buffers
    fn shut_down(&mut self) -> Result<()> {
        let disconnected = self.transport.disconnect();
        if let Err(ref e) = disconnected {
            // the buffers may still be targeted by the device
            warn!("Queue pair {} disconnect failed: {}", self.queue_id(), e);
            std::mem::forget(std::mem::take(&mut self.receives));
        } else {
            self.receives.clear();
        }
        disconnected
    }

    fn check_owner(&self, reservation: &Reservation) -> Result<()> {
        if reservation.owner != self.serial {
            return Err(NvmfError::invalid_argument(format!(
                "command identifier {} was reserved on another queue pair",
                reservation.cid
            )));
        }
        Ok(())
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if !self.valid {
            return Err(NvmfError::QueuePairReleased);
        }
        Ok(())
    }

    /// (Re)post receive buffer `index`
    pub(crate) fn post_receive(&mut self, index: usize) -> Result<()> {
        let element = self.receives.get(index).ok_or_else(|| {
            NvmfError::invalid_argument(format!("no receive buffer {}", index))
        })?;
        let request = ReceiveRequest {
            wr_id: RECEIVE_WR_TAG | index as u64,
            sge: Sge {
                addr: element.address(),
                length: element.capacity() as u32,
                lkey: element.local_key(),
            },
        };
        self.transport.post_receive(request)
    }

    /// Capsule sized for this queue pair, from the shared command pool
    pub fn allocate_command_capsule(&self) -> Result<CommandCapsule> {
        self.ensure_valid()?;
        CommandCapsule::new(self.command_pool.allocate()?, self.layout)
    }

    /// Register caller memory with this queue pair's protection domain
    pub fn register_memory(&self, data: Vec<u8>) -> Result<RegisteredBuffer> {
        self.ensure_valid()?;
        RegisteredBuffer::register(self.transport.registrar().as_ref(), data)
    }

    /// Reserve a free command identifier
    ///
    /// Fails with `QueueFull` when every identifier is in flight; poll and
    /// retry.
    pub fn reserve_identifier(&mut self) -> Result<Reservation> {
        self.ensure_valid()?;
        let cid = self.table.reserve()?;
        Ok(Reservation {
            owner: self.serial,
            cid,
        })
    }

    /// Return an identifier that will not be posted
    pub fn unreserve(&mut self, reservation: Reservation) -> Result<()> {
        self.check_owner(&reservation)?;
        self.table.unreserve(reservation.cid);
        Ok(())
    }

    /// Reserve an identifier and post `capsule`
    pub fn submit(&mut self, capsule: CommandCapsule) -> Result<(CommandFuture, ResponseFuture)> {
        self.check_inline(&capsule)?;
        let reservation = self.reserve_identifier()?;
        self.post(reservation, capsule)
    }

    /// Post `capsule` under a reserved identifier
    ///
    /// If the transport refuses the send the error is returned and the
    /// command and response stay in the tables until a completion for the
    /// identifier is seen or the queue pair is released.
    pub fn post(
        &mut self,
        reservation: Reservation,
        mut capsule: CommandCapsule,
    ) -> Result<(CommandFuture, ResponseFuture)> {
        self.check_owner(&reservation)?;
        let cid = reservation.cid;
        let prepared = self
            .ensure_valid()
            .and_then(|_| self.check_inline(&capsule))
            .and_then(|_| capsule.entry_mut()?.set_command_id(cid));
        if let Err(e) = prepared {
            self.table.unreserve(cid);
            return Err(e);
        }

        let (command_completer, command_future) = operation();
        let (response_completer, response_future) = operation();
        let request = SendRequest {
            wr_id: cid as u64,
            sge: Sge {
                addr: capsule.address(),
                length: capsule.size() as u32,
                lkey: capsule.local_key(),
            },
            inline: capsule.is_inline(),
        };

        self.table.insert(
            cid,
            InFlightCommand {
                capsule,
                completer: command_completer,
            },
            InFlightResponse {
                completer: Some(response_completer),
            },
        );

        debug!(
            "Posting command {} on queue {} ({} bytes{})",
            cid,
            self.queue_id(),
            request.sge.length,
            if request.inline { ", inline" } else { "" }
        );
        self.transport.post_send(request)?;
        Ok((command_future, response_future))
    }

    fn check_inline(&self, capsule: &CommandCapsule) -> Result<()> {
        if capsule.is_inline() && capsule.size() > self.transport.max_inline_data() {
            return Err(NvmfError::invalid_argument(format!(
                "capsule of {} bytes exceeds max inline size {}",
                capsule.size(),
                self.transport.max_inline_data()
            )));
        }
        Ok(())
    }

    /// Invalidate the queue pair
    ///
    /// Disconnects the transport, drops every in-flight entry (pending
    /// futures resolve with `QueuePairReleased`) and returns the receive
    /// buffers to their pool. Further calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        self.valid = false;

        let outstanding = self.table.outstanding_responses();
        let disconnected = self.shut_down();
        self.table.clear();

        info!(
            "Queue pair {} released ({} responses outstanding)",
            self.queue_id(),
            outstanding
        );
        disconnected
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn queue_id(&self) -> QueueId {
        self.config.queue_id()
    }

    pub fn submission_queue_size(&self) -> u16 {
        self.config.submission_queue_size
    }

    pub fn in_capsule_data_size(&self) -> u32 {
        self.config.in_capsule_data_size
    }

    pub fn max_additional_sgls(&self) -> u32 {
        self.config.additional_sgls
    }

    pub fn command_capsule_size(&self) -> usize {
        self.layout.size
    }

    pub fn max_inline_data(&self) -> usize {
        self.transport.max_inline_data()
    }

    pub fn outstanding_commands(&self) -> usize {
        self.table.outstanding_commands()
    }

    pub fn outstanding_responses(&self) -> usize {
        self.table.outstanding_responses()
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::transport::loopback::{LoopbackHandle, LoopbackTransport};
    use crate::wire::opcode::AdminOpcode;

    fn queue_pair(depth: u16) -> (QueuePair, LoopbackHandle) {
        let (transport, handle) = LoopbackTransport::new();
        let config = QueuePairConfig {
            submission_queue_size: depth,
            ..Default::default()
        };
        let pools = PoolRegistry::new(PoolConfig::default()).unwrap();
        let queue_pair = QueuePair::new(Box::new(transport), config, &pools).unwrap();
        (queue_pair, handle)
    }

    #[test]
    fn test_new_posts_receives_then_connects() {
        let (queue_pair, handle) = queue_pair(8);
        assert!(queue_pair.is_valid());
        assert_eq!(handle.posted_receives(), 8);
        assert!(handle.is_connected());

        let private_data = handle.private_data().unwrap();
        let request = ConnectRequest::decode(&private_data).unwrap();
        assert_eq!(request.queue_id, QueueId::ADMIN);
        assert_eq!(request.receive_queue_size, 8);
        assert_eq!(request.send_queue_size(), 7);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let (transport, _handle) = LoopbackTransport::new();
        let config = QueuePairConfig {
            submission_queue_size: 1,
            ..Default::default()
        };
        let pools = PoolRegistry::new(PoolConfig::default()).unwrap();
        assert!(matches!(
            QueuePair::new(Box::new(transport), config, &pools),
            Err(NvmfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_submit_stamps_identifier() {
        let (mut queue_pair, handle) = queue_pair(4);
        let mut capsule = queue_pair.allocate_command_capsule().unwrap();
        capsule
            .entry_mut()
            .unwrap()
            .set_opcode(AdminOpcode::KeepAlive)
            .unwrap();
        let _futures = queue_pair.submit(capsule).unwrap();

        let sends = handle.pending_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].wr_id, 0);
        assert_eq!(sends[0].command_id(), Some(0));
        assert_eq!(sends[0].opcode(), Some(0x18));
        assert_eq!(sends[0].payload.len(), 64);
        assert_eq!(queue_pair.outstanding_commands(), 1);
        assert_eq!(queue_pair.outstanding_responses(), 1);
    }

    #[test]
    fn test_depth_two_queue_full() {
        let (mut queue_pair, handle) = queue_pair(2);
        let a = queue_pair
            .submit(queue_pair.allocate_command_capsule().unwrap())
            .unwrap();
        let b = queue_pair
            .submit(queue_pair.allocate_command_capsule().unwrap())
            .unwrap();
        let ids: Vec<_> = handle
            .pending_sends()
            .iter()
            .map(|s| s.command_id())
            .collect();
        assert_eq!(ids, vec![Some(0), Some(1)]);
        assert!(matches!(
            queue_pair.reserve_identifier(),
            Err(NvmfError::QueueFull)
        ));

        assert!(handle.complete_send(0));
        assert!(handle.respond(0, 0));
        let (command, response) = a;
        command.get(&mut queue_pair).unwrap();
        assert!(response.get(&mut queue_pair).unwrap().status.is_success());

        let reservation = queue_pair.reserve_identifier().unwrap();
        assert_eq!(reservation.command_id(), 0);
        queue_pair.unreserve(reservation).unwrap();
        drop(b);
    }

    #[test]
    fn test_post_failure_keeps_entries() {
        let (mut queue_pair, handle) = queue_pair(4);
        handle.fail_next_post();
        let capsule = queue_pair.allocate_command_capsule().unwrap();
        assert!(matches!(queue_pair.submit(capsule), Err(NvmfError::Io(_))));
        assert_eq!(queue_pair.outstanding_commands(), 1);
        assert_eq!(queue_pair.outstanding_responses(), 1);
        assert!(handle.pending_sends().is_empty());
    }

    #[test]
    fn test_foreign_reservation_rejected() {
        let (mut deep, _deep_handle) = queue_pair(8);
        let (mut shallow, shallow_handle) = queue_pair(2);
        let reservations: Vec<_> = (0..8).map(|_| deep.reserve_identifier().unwrap()).collect();
        let mut reservations = reservations.into_iter();

        let capsule = shallow.allocate_command_capsule().unwrap();
        let last = reservations.next_back().unwrap();
        assert_eq!(last.command_id(), 7);
        assert!(matches!(
            shallow.post(last, capsule),
            Err(NvmfError::InvalidArgument(_))
        ));
        assert!(matches!(
            shallow.unreserve(reservations.next().unwrap()),
            Err(NvmfError::InvalidArgument(_))
        ));
        assert_eq!(shallow.outstanding_commands(), 0);
        assert!(shallow_handle.pending_sends().is_empty());

        // the shallow queue pair's own identifiers are untouched
        let own: Vec<_> = (0..2)
            .map(|_| shallow.reserve_identifier().unwrap().command_id())
            .collect();
        assert_eq!(own, vec![0, 1]);
        assert!(matches!(
            shallow.reserve_identifier(),
            Err(NvmfError::QueueFull)
        ));
        for reservation in reservations {
            deep.unreserve(reservation).unwrap();
        }
    }

    #[test]
    fn test_rejected_connect_flushes_receives() {
        let (transport, handle) = LoopbackTransport::new();
        handle.reject_connect();
        let config = QueuePairConfig {
            submission_queue_size: 4,
            ..Default::default()
        };
        let pools = PoolRegistry::new(PoolConfig::default()).unwrap();
        assert!(matches!(
            QueuePair::new(Box::new(transport), config, &pools),
            Err(NvmfError::Io(_))
        ));
        assert_eq!(handle.posted_receives(), 0);
        assert!(!handle.is_connected());
        // nothing left for the controller to write into
        assert!(!handle.respond(0, 0));
    }

    #[test]
    fn test_inline_limit() {
        let (transport, handle) = LoopbackTransport::with_max_inline(32);
        let pools = PoolRegistry::new(PoolConfig::default()).unwrap();
        let mut queue_pair =
            QueuePair::new(Box::new(transport), QueuePairConfig::default(), &pools).unwrap();

        let mut capsule = queue_pair.allocate_command_capsule().unwrap();
        capsule.set_inline(true);
        assert!(matches!(
            queue_pair.submit(capsule),
            Err(NvmfError::InvalidArgument(_))
        ));
        // identifier was not consumed
        assert_eq!(queue_pair.outstanding_commands(), 0);
        assert_eq!(queue_pair.reserve_identifier().unwrap().command_id(), 0);
        assert!(handle.pending_sends().is_empty());
    }

    #[test]
    fn test_inline_send() {
        let (mut queue_pair, handle) = queue_pair(4);
        let mut capsule = queue_pair.allocate_command_capsule().unwrap();
        capsule.set_inline(true);
        let _futures = queue_pair.submit(capsule).unwrap();
        assert!(handle.pending_sends()[0].inline);
    }

    #[test]
    fn test_release() {
        let (mut queue_pair, handle) = queue_pair(4);
        let (command, response) = queue_pair
            .submit(queue_pair.allocate_command_capsule().unwrap())
            .unwrap();

        queue_pair.release().unwrap();
        assert!(!queue_pair.is_valid());
        assert!(!handle.is_connected());
        assert_eq!(queue_pair.outstanding_commands(), 0);
        assert!(matches!(
            command.get(&mut queue_pair),
            Err(NvmfError::QueuePairReleased)
        ));
        assert!(matches!(
            response.get(&mut queue_pair),
            Err(NvmfError::QueuePairReleased)
        ));
        assert!(matches!(
            queue_pair.allocate_command_capsule(),
            Err(NvmfError::QueuePairReleased)
        ));
        assert!(matches!(
            queue_pair.poll(),
            Err(NvmfError::QueuePairReleased)
        ));

        // idempotent
        queue_pair.release().unwrap();
    }

    #[test]
    fn test_introspection() {
        let (transport, _handle) = LoopbackTransport::new();
        let config = QueuePairConfig {
            queue_id: 2,
            submission_queue_size: 16,
            additional_sgls: 1,
            in_capsule_data_size: 512,
            ..Default::default()
        };
        let pools = PoolRegistry::new(PoolConfig::default()).unwrap();
        let queue_pair = QueuePair::new(Box::new(transport), config, &pools).unwrap();
        assert_eq!(queue_pair.queue_id(), QueueId(2));
        assert_eq!(queue_pair.submission_queue_size(), 16);
        assert_eq!(queue_pair.max_additional_sgls(), 1);
        assert_eq!(queue_pair.in_capsule_data_size(), 512);
        assert_eq!(queue_pair.command_capsule_size(), 576);
        assert_eq!(queue_pair.max_inline_data(), 256);
    }

    #[test]
    fn test_register_memory() {
        let (queue_pair, _handle) = queue_pair(2);
        let mut buffer = queue_pair.register_memory(vec![0u8; 4096]).unwrap();
        assert_ne!(buffer.remote_key(), 0);
        buffer.release().unwrap();
    }
}

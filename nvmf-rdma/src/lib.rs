//! NVMe over Fabrics host queue pair engine for RDMA
//!
//! Multiplexes NVMe commands over reliable-connection queue pairs:
//! - Memory: registered region pools carved into fixed-size elements
//! - Engine: command identifier tables, posting, completion polling
//! - Wire: 64-byte submission entries, 16-byte completions, SGLs,
//!   connection private data
//!
//! Transports:
//! - Loopback: in-process controller double, no hardware required
//! - RDMA: ibverbs + RDMA-CM (feature `rdma`)
//!
//! Progress is pull-based: nothing runs in the background, completions are
//! only observed when a caller polls (directly or through `Operation::get`).

pub mod capsule;
mod command_id;
pub mod config;
pub mod error;
pub mod operation;
pub mod poller;
pub mod pool;
pub mod queue_pair;
pub mod transport;
pub mod wire;

#[cfg(feature = "rdma")]
pub mod rdma;

pub use capsule::{CapsuleLayout, CommandCapsule};
pub use config::{PoolConfig, QueuePairConfig};
pub use error::{NvmfError, Result, WorkCompletionError};
pub use operation::{CommandFuture, Operation, ResponseFuture};
pub use pool::{
    BufferSlice, BufferSliceMut, ByteAccess, ByteAccessMut, ByteOrder, KeyedBuffer, MemoryPool,
    PoolElement, PoolRegistry, RegisteredBuffer,
};
pub use queue_pair::{QueuePair, Reservation};
pub use transport::loopback::{LoopbackHandle, LoopbackTransport};
pub use transport::{MemoryRegion, MemoryRegistrar, QueueTransport};
pub use wire::cqe::CompletionEntry;
pub use wire::private_data::QueueId;
pub use wire::status::StatusField;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::opcode::{AdminOpcode, NvmOpcode};
    use crate::wire::sgl::SglDescriptor;

    // Full path a caller takes: capsule, keyed SGL to its own buffer,
    // submit, wait for both halves.
    #[test]
    fn test_read_command_end_to_end() {
        let (transport, handle) = LoopbackTransport::new();
        let config = QueuePairConfig {
            queue_id: 1,
            submission_queue_size: 8,
            ..Default::default()
        };
        let pools = PoolRegistry::new(PoolConfig::default()).unwrap();
        let mut queue_pair = QueuePair::new(Box::new(transport), config, &pools).unwrap();
        assert_eq!(queue_pair.queue_id().to_string(), "io1");

        let data = queue_pair.register_memory(vec![0u8; 4096]).unwrap();
        let mut capsule = queue_pair.allocate_command_capsule().unwrap();
        {
            let mut entry = capsule.entry_mut().unwrap();
            entry.set_opcode(NvmOpcode::Read).unwrap();
            entry.set_namespace_id(1).unwrap();
            entry.set_sgl1(&SglDescriptor::keyed(&data).unwrap()).unwrap();
            entry.set_dword(12, 7).unwrap();
        }
        let (command, response) = queue_pair.submit(capsule).unwrap();

        let sent = handle.pending_sends().remove(0);
        assert_eq!(sent.opcode(), Some(0x02));
        let echoed = wire::sqe::SubmissionEntry::new(&sent.payload).unwrap();
        assert_eq!(echoed.sgl1().unwrap().length(), 4096);

        handle.complete_send(sent.wr_id);
        handle.respond(0, 0);
        let entry = response.get(&mut queue_pair).unwrap();
        assert!(entry.status.is_success());
        command.get(&mut queue_pair).unwrap().release().unwrap();

        // admin opcodes go through the same path
        let mut capsule = queue_pair.allocate_command_capsule().unwrap();
        capsule
            .entry_mut()
            .unwrap()
            .set_opcode(AdminOpcode::Identify)
            .unwrap();
        let _pending = queue_pair.submit(capsule).unwrap();
        assert_eq!(queue_pair.outstanding_commands(), 1);
    }
}

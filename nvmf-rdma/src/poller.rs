//! Completion poller
//!
//! Send and receive work requests share one completion queue. Receive
//! `wr_id`s carry `RECEIVE_WR_TAG`, send `wr_id`s are the command
//! identifier, so records are classified without looking at the opcode
//! (undefined for failed completions).

use crate::error::{NvmfError, Result, WorkCompletionError};
use crate::pool::ByteAccess;
use crate::queue_pair::{InFlightCommand, QueuePair, RECEIVE_WR_TAG};
use crate::transport::{WcOpcode, WorkCompletion};
use crate::wire::cqe::{CompletionEntry, COMPLETION_ENTRY_SIZE};
use log::{debug, warn};

/// Completions drained per `poll` call
pub const POLL_BATCH_SIZE: usize = 32;

impl QueuePair {
    /// Process at most one batch of completions
    ///
    /// Returns the number of records processed. Every record in the batch
    /// is handled even if one of them is a protocol error; the first such
    /// error is returned once the batch is done.
    pub fn poll(&mut self) -> Result<usize> {
        self.ensure_valid()?;

        let mut batch = std::mem::take(&mut self.completions);
        let result = self
            .transport
            .poll_completions(&mut batch, POLL_BATCH_SIZE)
            .and_then(|count| {
                let mut first_error = None;
                for completion in batch.drain(..) {
                    let handled = if completion.wr_id & RECEIVE_WR_TAG != 0 {
                        self.handle_receive(&completion)
                    } else {
                        self.handle_send(&completion)
                    };
                    if let Err(e) = handled {
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(count), Err)
            });
        batch.clear();
        self.completions = batch;
        result
    }

    fn handle_send(&mut self, completion: &WorkCompletion) -> Result<()> {
        let cid = u16::try_from(completion.wr_id).map_err(|_| {
            NvmfError::invalid_argument(format!("send wr_id {:#x} out of range", completion.wr_id))
        })?;
        let Some(InFlightCommand { capsule, completer }) = self.table.release_on_send_complete(cid)
        else {
            warn!(
                "Send completion for unknown command {} on queue {}",
                cid,
                self.queue_id()
            );
            return Err(NvmfError::UnknownCommandIdentifier(cid));
        };

        if completion.is_success() {
            completer.complete(capsule);
        } else {
            let error = WorkCompletionError {
                opcode: WcOpcode::Send,
                status: completion.status,
            };
            warn!("Command {} on queue {}: {}", cid, self.queue_id(), error);
            // capsule goes back to the pool
            completer.fail(error.into());
        }
        Ok(())
    }

    fn handle_receive(&mut self, completion: &WorkCompletion) -> Result<()> {
        if !completion.is_success() {
            let error = WorkCompletionError {
                opcode: WcOpcode::Recv,
                status: completion.status,
            };
            let mut failed = 0;
            for response in self.table.responses_mut() {
                if let Some(completer) = response.completer.take() {
                    completer.fail(error.into());
                    failed += 1;
                }
            }
            // no identifier to correlate with; the receive stays consumed
            warn!(
                "Receive failed on queue {}: {}; failed {} outstanding responses",
                self.queue_id(),
                error,
                failed
            );
            return Ok(());
        }

        let index = (completion.wr_id & !RECEIVE_WR_TAG) as usize;
        if (completion.byte_len as usize) < COMPLETION_ENTRY_SIZE {
            // the buffer still holds an older response; nothing to match
            warn!(
                "Short receive of {} bytes on queue {}",
                completion.byte_len,
                self.queue_id()
            );
            self.post_receive(index)?;
            return Err(NvmfError::invalid_wire("completion length", completion.byte_len));
        }
        let parsed = self
            .receives
            .get(index)
            .ok_or_else(|| {
                NvmfError::invalid_argument(format!("receive completion for unknown buffer {}", index))
            })
            .and_then(|element| element.bytes())
            .and_then(|bytes| Ok((CompletionEntry::command_id_of(bytes)?, CompletionEntry::decode(bytes))));
        let (cid, entry) = parsed?;

        // keep the receive queue fully posted before anything else can fail
        self.post_receive(index)?;

        let Some(response) = self.table.release_on_receive_complete(cid) else {
            warn!(
                "Response for unknown command {} on queue {}",
                cid,
                self.queue_id()
            );
            return Err(NvmfError::UnknownCommandIdentifier(cid));
        };
        debug!("Response for command {} on queue {}", cid, self.queue_id());

        match (response.completer, entry) {
            (Some(completer), Ok(entry)) => completer.complete(entry),
            (Some(completer), Err(e)) => completer.fail(e),
            // already failed by an earlier receive error
            (None, _) => {}
        }
        Ok(())
    }
}

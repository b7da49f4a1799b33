//! Completion futures for in-flight commands and responses
//!
//! Every submitted command yields two operations: one resolved by the send
//! completion, one by the matching receive. Each is a one-shot channel; the
//! completing half is consumed when used, so an operation resolves at most
//! once. No waiting primitive is involved: `get` drives the queue pair's
//! poller until the result shows up.

use crate::capsule::CommandCapsule;
use crate::error::{NvmfError, Result};
use crate::queue_pair::QueuePair;
use crate::wire::cqe::CompletionEntry;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::debug;
use std::time::{Duration, Instant};

/// Resolved by the send completion; hands the capsule back
pub type CommandFuture = Operation<CommandCapsule>;

/// Resolved by the receive completion carrying the command's response
pub type ResponseFuture = Operation<CompletionEntry>;

/// Resolving half, owned by the queue pair's tables
pub(crate) struct Completer<T> {
    tx: Sender<Result<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, value: T) {
        // the future may have been dropped; nothing to tell then
        let _ = self.tx.send(Ok(value));
    }

    pub(crate) fn fail(self, error: NvmfError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Create a started operation and its completer
pub(crate) fn operation<T>() -> (Completer<T>, Operation<T>) {
    let (tx, rx) = bounded(1);
    (
        Completer { tx },
        Operation {
            rx,
            consumed: false,
        },
    )
}

/// Waiting half of one in-flight operation
#[must_use = "an operation does nothing unless its result is retrieved"]
pub struct Operation<T> {
    rx: Receiver<Result<T>>,
    consumed: bool,
}

impl<T> Operation<T> {
    /// True once a result (or failure) is ready to be taken
    pub fn is_done(&self) -> bool {
        !self.consumed && !self.rx.is_empty()
    }

    /// Take the result if it is ready, without polling
    pub fn try_take(&mut self) -> Result<Option<T>> {
        if self.consumed {
            return Err(NvmfError::ResultConsumed);
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.consumed = true;
                result.map(Some)
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.consumed = true;
                Err(NvmfError::QueuePairReleased)
            }
        }
    }

    /// Poll `queue_pair` until this operation resolves
    ///
    /// Protocol errors the poller reports for other records do not end the
    /// wait; transport errors and release of the queue pair do.
    pub fn get(mut self, queue_pair: &mut QueuePair) -> Result<T> {
        loop {
            if let Some(value) = self.step(queue_pair)? {
                return Ok(value);
            }
        }
    }

    /// Like `get`, bounded by `timeout`
    ///
    /// On `Timeout` the command stays in flight and this operation can be
    /// waited on again.
    pub fn get_timeout(&mut self, queue_pair: &mut QueuePair, timeout: Duration) -> Result<T> {
        let start = Instant::now();
        loop {
            if let Some(value) = self.step(queue_pair)? {
                return Ok(value);
            }
            if start.elapsed() >= timeout {
                return Err(NvmfError::Timeout(timeout));
            }
        }
    }

    fn step(&mut self, queue_pair: &mut QueuePair) -> Result<Option<T>> {
        if let Some(value) = self.try_take()? {
            return Ok(Some(value));
        }
        let polled = queue_pair.poll();
        if let Some(value) = self.try_take()? {
            return Ok(Some(value));
        }
        match polled {
            Ok(0) => std::hint::spin_loop(),
            Ok(_) => {}
            // belongs to some other record; ours is still in the tables
            Err(e) if e.is_protocol_error() => debug!("Still waiting after poll error: {}", e),
            Err(e) => return Err(e),
        }
        Ok(None)
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("done", &self.is_done())
            .field("consumed", &self.consumed)
            .finish()
    }
}

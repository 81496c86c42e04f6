use std::io;

use thiserror::Error;

use crate::reactor::Direction;
use crate::sys::Descriptor;
use crate::task::Cancel;

/// Everything that can end a task or the scheduler loop.
///
/// Would-block is not represented here: at the socket boundary it is
/// `Ok(None)` and inside a task it becomes a [`Wait`](crate::Wait).
/// A peer closing its side is a normal completion, not an error either.
#[derive(Debug, Error)]
pub enum Error {
    /// Descriptor-level fault, delivered to the task owning the descriptor.
    #[error("I/O fault: {0}")]
    Io(#[from] io::Error),

    /// The readiness multiplexer failed; this terminates [`Scheduler::run`](crate::Scheduler::run).
    #[error("multiplexer fault: {0}")]
    Multiplexer(#[source] io::Error),

    /// The task was cancelled, either explicitly or by an expired deadline.
    #[error("task cancelled ({0:?})")]
    Cancelled(Cancel),

    /// A second task tried to wait on a descriptor/direction that already has a waiter.
    #[error("{descriptor:?} already has a {direction:?} waiter")]
    DuplicateWaiter {
        descriptor: Descriptor,
        direction: Direction,
    },

    /// The task was resumed with a cancellation request and suspended again.
    #[error("task ignored its cancellation and suspended again")]
    CancellationIgnored,

    /// Application-level protocol violation reported by a connection handler.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

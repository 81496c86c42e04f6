//! A single-threaded cooperative task scheduler driven by the [select] readiness call.
//!
//! Tasks are explicit state machines ([`Routine`]s). A task runs until it needs a
//! descriptor to become readable or writable, then returns a [`Step::Wait`] instead of
//! blocking. The [`Scheduler`] keeps a FIFO queue of runnable tasks and a table of
//! waiting ones; once the queue is empty it asks the [`Multiplexer`] which descriptors
//! are ready and requeues exactly the tasks waiting on them.
//!
//! # Examples
//!
//! A server answering every packet with `Hello world!`:
//!
//! ```no_run
//! use select_sched::{AcceptLoop, EchoLoop, Listener, Reply, Scheduler, HELLO};
//!
//! let listener = Listener::bind("127.0.0.1:5000")?;
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.spawn(AcceptLoop::new(listener, |stream, _peer| {
//!     EchoLoop::new(stream, Reply::Fixed(HELLO))
//! }));
//! scheduler.run()?;
//! # Ok::<(), select_sched::Error>(())
//! ```
//!
//! [select]: https://man7.org/linux/man-pages/man2/select.2.html

#![allow(unknown_lints)]
#![allow(clippy::needless_maybe_sized)]

macro_rules! syscall_los {
    ($ret:expr) => {{
        let ret = $ret;

        if ret < 0 {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }};
}

pub use error::Error;
pub use handler::{AcceptLoop, EchoLoop, Packet, Recv, Reply, SendAll, BUF_SIZE, HELLO};
pub use net::{Listener, Stream};
pub use reactor::{Direction, Interest, Multiplexer, PollError, Readiness, Select};
pub use scheduler::{Config, Outcome, Phase, Scheduler, Stats, TaskState};
pub use sys::{is_open, Descriptor, FD_LIMIT};
pub use task::{
    from_fn, Cancel, Context, Delegate, FromFn, Routine, Signal, Step, Task, TaskHandle, TaskId,
    Wait,
};

mod error;
mod handler;
mod net;
mod reactor;
mod scheduler;
mod sys;
mod task;
mod timer;

//! Tasks are explicit state machines resumed by the [`Scheduler`](crate::Scheduler).
//!
//! A [`Routine`] runs from one suspension point to the next inside
//! [`Routine::resume`]. Instead of blocking, it returns a [`Step::Wait`] naming the
//! descriptor and direction it needs; the scheduler resumes it again with a
//! [`Signal`] once that condition holds (or a cancellation arrives).

use core::fmt;
use core::time::Duration;

use std::io;
use std::time::Instant;

use crate::error::Error;
use crate::reactor::Direction;
use crate::sys::Descriptor;
use crate::timer;

/// Unique identifier of a spawned task. Identifiers are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Returned by `spawn`; names the task in `cancel` and the scheduler's introspection calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) TaskId);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0
    }
}

/// Why a task was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cancel {
    /// `cancel` was called on the task's handle.
    Requested,
    /// The deadline attached to its wait expired first.
    TimedOut,
}

/// What a task is told when it is resumed.
#[derive(Debug)]
pub enum Signal {
    /// First resumption after spawn.
    Start,
    /// The descriptor it waited on is ready in this direction.
    Ready(Direction),
    /// The deadline of a [`Wait::Sleep`] passed.
    Elapsed,
    /// The pending wait was withdrawn; the task should wind down.
    Cancelled(Cancel),
    /// The waited descriptor turned out to be invalid and was evicted from the readiness set.
    Fault(io::Error),
}

/// A suspension request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    Io {
        descriptor: Descriptor,
        direction: Direction,
        deadline: Option<Instant>,
    },
    Sleep(Instant),
}

impl Wait {
    pub fn readable(descriptor: Descriptor) -> Self {
        Self::io(descriptor, Direction::Read)
    }

    pub fn writable(descriptor: Descriptor) -> Self {
        Self::io(descriptor, Direction::Write)
    }

    pub fn io(descriptor: Descriptor, direction: Direction) -> Self {
        Self::Io {
            descriptor,
            direction,
            deadline: None,
        }
    }

    /// Suspends for `duration`. Durations too large to represent never elapse.
    pub fn sleep(duration: Duration) -> Self {
        Self::Sleep(timer::deadline_after(duration).unwrap_or_else(timer::far_future))
    }

    pub fn sleep_until(instant: Instant) -> Self {
        Self::Sleep(instant)
    }

    /// Bounds an I/O wait: if the descriptor is not ready within `duration`, the task
    /// is resumed with [`Cancel::TimedOut`] instead.
    pub fn timeout(self, duration: Duration) -> Self {
        match timer::deadline_after(duration) {
            Some(deadline) => self.deadline(deadline),
            None => self,
        }
    }

    pub fn deadline(self, instant: Instant) -> Self {
        match self {
            Self::Io {
                descriptor,
                direction,
                ..
            } => Self::Io {
                descriptor,
                direction,
                deadline: Some(instant),
            },
            Self::Sleep(_) => Self::Sleep(instant),
        }
    }

    pub fn expires_at(&self) -> Option<Instant> {
        match self {
            Self::Io { deadline, .. } => *deadline,
            Self::Sleep(instant) => Some(*instant),
        }
    }
}

/// Outcome of a single resumption.
#[derive(Debug)]
pub enum Step<T = ()> {
    Wait(Wait),
    Done(T),
    Failed(Error),
}

impl<T> Step<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Step<U> {
        match self {
            Self::Wait(wait) => Step::Wait(wait),
            Self::Done(value) => Step::Done(f(value)),
            Self::Failed(error) => Step::Failed(error),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Self::Wait(_))
    }
}

impl<T> From<Wait> for Step<T> {
    fn from(wait: Wait) -> Self {
        Self::Wait(wait)
    }
}

impl<T, E: Into<Error>> From<Result<T, E>> for Step<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Done(value),
            Err(error) => Self::Failed(error.into()),
        }
    }
}

/// A suspendable sequence of steps.
pub trait Routine {
    type Output;

    fn resume(&mut self, cx: &mut Context<'_>, signal: Signal) -> Step<Self::Output>;
}

impl<R: Routine + ?Sized> Routine for Box<R> {
    type Output = R::Output;

    fn resume(&mut self, cx: &mut Context<'_>, signal: Signal) -> Step<Self::Output> {
        (**self).resume(cx, signal)
    }
}

/// A top-level routine, schedulable on its own.
pub trait Task: Routine<Output = ()> {}

impl<R: Routine<Output = ()> + ?Sized> Task for R {}

/// Routine backed by a closure; handy for small tasks and tests.
pub struct FromFn<F>(F);

pub fn from_fn<T, F>(f: F) -> FromFn<F>
where
    F: FnMut(&mut Context<'_>, Signal) -> Step<T>,
{
    FromFn(f)
}

impl<T, F> Routine for FromFn<F>
where
    F: FnMut(&mut Context<'_>, Signal) -> Step<T>,
{
    type Output = T;

    fn resume(&mut self, cx: &mut Context<'_>, signal: Signal) -> Step<T> {
        (self.0)(cx, signal)
    }
}

/// Drives a nested routine as if its steps were inline in the outer one.
///
/// While the inner routine is active every signal the outer routine receives is
/// forwarded to it, so a cancellation or fault reaches the innermost suspended
/// step before the outer routine sees the outcome.
pub struct Delegate<R> {
    inner: Option<R>,
}

impl<R: Routine> Delegate<R> {
    pub const fn idle() -> Self {
        Self { inner: None }
    }

    /// Starts `routine` and runs it to its first suspension point right away.
    pub fn start(cx: &mut Context<'_>, routine: R) -> (Self, Step<R::Output>) {
        let mut this = Self {
            inner: Some(routine),
        };

        let step = this.resume(cx, Signal::Start);

        (this, step)
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    /// Resumes the inner routine; once it is done or failed it is dropped.
    ///
    /// Resuming an idle delegate fails: with [`Error::Cancelled`] if the signal was a
    /// cancellation, with a protocol error otherwise.
    pub fn resume(&mut self, cx: &mut Context<'_>, signal: Signal) -> Step<R::Output> {
        let Some(inner) = self.inner.as_mut() else {
            return match signal {
                Signal::Cancelled(cancel) => Step::Failed(Error::Cancelled(cancel)),
                _ => Step::Failed(Error::Protocol("resumed an idle delegate".into())),
            };
        };

        let step = inner.resume(cx, signal);

        if !step.is_wait() {
            self.inner = None;
        }

        step
    }
}

impl<R: Routine> Default for Delegate<R> {
    fn default() -> Self {
        Self::idle()
    }
}

/// Request issued from within a running task, applied by the scheduler once the
/// task's `resume` call returns.
pub(crate) enum Request {
    Spawn(TaskId, Box<dyn Task>),
    Cancel(TaskId),
    Shutdown,
}

/// The running task's only channel to its scheduler.
pub struct Context<'a> {
    current: TaskId,
    next_id: &'a mut u64,
    requests: &'a mut Vec<Request>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(current: TaskId, next_id: &'a mut u64, requests: &'a mut Vec<Request>) -> Self {
        Self {
            current,
            next_id,
            requests,
        }
    }

    pub fn current(&self) -> TaskId {
        self.current
    }

    /// Spawns a task to the back of the ready queue.
    pub fn spawn<T: Task + 'static>(&mut self, task: T) -> TaskHandle {
        let id = allocate(self.next_id);

        self.requests.push(Request::Spawn(id, Box::new(task)));

        TaskHandle(id)
    }

    /// Cancels another task (or the current one, which then sees the cancellation
    /// at its next resumption).
    pub fn cancel(&mut self, handle: TaskHandle) {
        self.requests.push(Request::Cancel(handle.0));
    }

    /// Asks the scheduler to tear down every task and return from `run`.
    pub fn shutdown(&mut self) {
        self.requests.push(Request::Shutdown);
    }
}

pub(crate) fn allocate(next_id: &mut u64) -> TaskId {
    let id = TaskId(*next_id);
    *next_id += 1;

    id
}

/// Unwraps a finished [`Step`], returning early from the enclosing `resume` on
/// `Wait` and `Failed`.
#[macro_export]
macro_rules! step {
    ($e:expr $(,)?) => {
        match $e {
            $crate::Step::Done(value) => value,
            $crate::Step::Wait(wait) => return $crate::Step::Wait(wait),
            $crate::Step::Failed(error) => return $crate::Step::Failed(error),
        }
    };
}

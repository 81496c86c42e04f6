use core::mem;
use core::time::Duration;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::thread;
use std::time::Instant;

use enumset::EnumSet;
use log::{debug, error, info, trace, warn};

use libc as sys;

use crate::error::Error;
use crate::reactor::{Direction, Interest, Multiplexer, PollError, Readiness, Select};
use crate::sys::Descriptor;
use crate::task::{allocate, Cancel, Context, Request, Signal, Step, Task, TaskHandle, TaskId, Wait};
use crate::timer::Deadlines;

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Label used in log lines.
    pub name: &'static str,
    /// Upper bound on a single multiplexer wait; `None` blocks until readiness or the next deadline.
    pub poll_interval: Option<Duration>,
    /// Initial capacity of the task tables.
    pub capacity: usize,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            name: "select-sched",
            poll_interval: None,
            capacity: 64,
        }
    }

    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub const fn with_poll_interval(mut self, poll_interval: Option<Duration>) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the main loop stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No task is runnable and none is waiting; `run` returns.
    Idle,
    /// The ready queue is non-empty.
    Draining,
    /// Only suspended tasks remain; the next step blocks on the multiplexer.
    Waiting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    Runnable,
    Suspended(Direction),
    Sleeping,
    Completed,
    Failed,
    Cancelled,
    /// Never spawned here, or already reaped.
    Unknown,
}

/// How a task left the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Task accounting. At every observable point
/// `ready + waiting + finished == spawned - reaped`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub spawned: u64,
    pub reaped: u64,
    pub ready: usize,
    pub waiting: usize,
    pub finished: usize,
    /// Number of (descriptor, direction) wait entries.
    pub wait_entries: usize,
    pub resumes: u64,
}

impl Stats {
    pub fn is_balanced(&self) -> bool {
        (self.ready + self.waiting + self.finished) as u64 == self.spawned - self.reaped
    }
}

enum SlotState {
    Ready(Signal),
    Waiting(Wait),
    Running,
}

struct Slot {
    task: Box<dyn Task>,
    state: SlotState,
    started: bool,
    /// Set once a requested cancellation has been delivered.
    cancel_delivered: bool,
}

/// Descriptor × direction → waiting task. At most one waiter per pair.
#[derive(Default)]
struct WaitTable {
    entries: BTreeMap<Descriptor, [Option<TaskId>; 2]>,
    len: usize,
}

impl WaitTable {
    fn insert(&mut self, descriptor: Descriptor, direction: Direction, task: TaskId) -> Result<(), TaskId> {
        let waiters = self.entries.entry(descriptor).or_default();

        if let Some(existing) = waiters[direction as usize] {
            return Err(existing);
        }

        waiters[direction as usize] = Some(task);
        self.len += 1;

        Ok(())
    }

    fn get(&self, descriptor: Descriptor, direction: Direction) -> Option<TaskId> {
        self.entries
            .get(&descriptor)
            .and_then(|waiters| waiters[direction as usize])
    }

    /// Removes the entry only if `task` is the one waiting on it.
    fn remove(&mut self, descriptor: Descriptor, direction: Direction, task: TaskId) -> bool {
        let Some(waiters) = self.entries.get_mut(&descriptor) else {
            return false;
        };

        if waiters[direction as usize] != Some(task) {
            return false;
        }

        waiters[direction as usize] = None;
        self.len -= 1;

        if waiters.iter().all(Option::is_none) {
            self.entries.remove(&descriptor);
        }

        true
    }

    fn interest(&self) -> Vec<Interest> {
        self.entries
            .iter()
            .map(|(descriptor, waiters)| {
                let directions = EnumSet::<Direction>::all()
                    .iter()
                    .filter(|direction| waiters[*direction as usize].is_some())
                    .collect();

                Interest {
                    descriptor: *descriptor,
                    directions,
                }
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }
}

type FailureReporter = Box<dyn FnMut(TaskId, &Error)>;

/// Single-threaded cooperative scheduler.
///
/// Runs every ready task until none is left, then blocks on the [`Multiplexer`] for
/// the descriptors the suspended tasks wait on, moves the tasks whose descriptors
/// became ready to the back of the ready queue, and repeats until no task is left.
pub struct Scheduler<M = Select> {
    config: Config,
    multiplexer: M,
    tasks: HashMap<TaskId, Slot>,
    ready: VecDeque<TaskId>,
    waits: WaitTable,
    deadlines: Deadlines,
    finished: BTreeMap<TaskId, Outcome>,
    requests: Vec<Request>,
    next_id: u64,
    spawned: u64,
    reaped: u64,
    resumes: u64,
    shutdown: bool,
    on_failure: Option<FailureReporter>,
}

impl Scheduler<Select> {
    pub fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_multiplexer(Select::new(), config)
    }
}

impl Default for Scheduler<Select> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Multiplexer> Scheduler<M> {
    pub fn with_multiplexer(multiplexer: M, config: Config) -> Self {
        Self {
            tasks: HashMap::with_capacity(config.capacity),
            ready: VecDeque::with_capacity(config.capacity),
            config,
            multiplexer,
            waits: WaitTable::default(),
            deadlines: Deadlines::new(),
            finished: BTreeMap::new(),
            requests: Vec::new(),
            next_id: 0,
            spawned: 0,
            reaped: 0,
            resumes: 0,
            shutdown: false,
            on_failure: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn multiplexer_mut(&mut self) -> &mut M {
        &mut self.multiplexer
    }

    /// Replaces the default failure reporting (a `warn!` line) with `reporter`.
    ///
    /// Cancellations are not failures and are not reported.
    pub fn on_failure<F>(&mut self, reporter: F)
    where
        F: FnMut(TaskId, &Error) + 'static,
    {
        self.on_failure = Some(Box::new(reporter));
    }

    /// Enqueues `task` at the back of the ready queue.
    pub fn spawn<T: Task + 'static>(&mut self, task: T) -> TaskHandle {
        let id = allocate(&mut self.next_id);

        self.admit(id, Box::new(task));

        TaskHandle(id)
    }

    /// Cancels a live task. It is resumed with [`Cancel::Requested`] at its next
    /// resumption, and a pending wait is withdrawn right away.
    ///
    /// Returns `false` if the task already finished.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.cancel_task(handle.0, Cancel::Requested)
    }

    /// Drops every live task (closing the descriptors they own) and records them as cancelled.
    pub fn shutdown(&mut self) {
        let ids = self.tasks.keys().copied().collect::<Vec<_>>();

        for id in ids {
            self.tasks.remove(&id);
            self.finished.insert(id, Outcome::Cancelled);
        }

        self.ready.clear();
        self.waits.clear();
        self.deadlines.clear();
        self.requests.clear();
        self.shutdown = false;

        debug!("{}: shut down", self.config.name);
    }

    /// Runs until no task is runnable or waiting, or until a task requests shutdown.
    ///
    /// Only a multiplexer fault ends the loop with an error; failing tasks are
    /// isolated and reported.
    pub fn run(&mut self) -> Result<(), Error> {
        info!("{}: running", self.config.name);

        let result = loop {
            self.drain();

            if self.tasks.is_empty() {
                break Ok(());
            }

            if let Err(e) = self.turn(None) {
                break Err(e);
            }
        };

        info!("{}: stopped, {:?}", self.config.name, self.stats());

        result
    }

    /// Resumes ready tasks, front to back, until the ready queue is empty.
    ///
    /// Tasks spawned or woken meanwhile join the back of the queue and are resumed
    /// in the same pass. Returns the number of resumptions.
    pub fn drain(&mut self) -> usize {
        let mut resumed = 0;

        while let Some(id) = self.ready.pop_front() {
            self.resume(id);
            resumed += 1;

            if self.shutdown {
                self.shutdown();
                break;
            }
        }

        resumed
    }

    /// One multiplexer round over the current wait entries, followed by deadline expiry.
    ///
    /// `timeout` further bounds the wait. Returns how many tasks became ready.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        let interest = self.waits.interest();

        let timeout = [
            timeout,
            self.config.poll_interval,
            self.deadlines.timeout(Instant::now()),
        ]
        .into_iter()
        .flatten()
        .min();

        let mut woken = 0;

        let readiness = if interest.is_empty() {
            // Only sleepers (if anything): park until the earliest deadline.
            if !self.deadlines.is_empty() {
                if let Some(timeout) = timeout.filter(|timeout| !timeout.is_zero()) {
                    trace!("{}: sleeping {timeout:?}", self.config.name);
                    thread::sleep(timeout);
                }
            }

            Readiness::new()
        } else {
            match self.poll(&interest, timeout)? {
                Ok(readiness) => readiness,
                Err(invalid) => {
                    woken += self.evict(&invalid);
                    Readiness::new()
                }
            }
        };

        for (descriptor, ready) in readiness.iter() {
            for direction in ready {
                if let Some(id) = self.waits.get(descriptor, direction) {
                    self.wake(id, Signal::Ready(direction));
                    woken += 1;
                }
            }
        }

        woken += self.expire(Instant::now());

        trace!("{}: {woken} tasks woken", self.config.name);

        Ok(woken)
    }

    pub fn phase(&self) -> Phase {
        if !self.ready.is_empty() {
            Phase::Draining
        } else if self.tasks.is_empty() {
            Phase::Idle
        } else {
            Phase::Waiting
        }
    }

    pub fn task_state(&self, handle: TaskHandle) -> TaskState {
        if let Some(slot) = self.tasks.get(&handle.0) {
            return match &slot.state {
                _ if !slot.started => TaskState::NotStarted,
                SlotState::Ready(_) | SlotState::Running => TaskState::Runnable,
                SlotState::Waiting(Wait::Io { direction, .. }) => TaskState::Suspended(*direction),
                SlotState::Waiting(Wait::Sleep(_)) => TaskState::Sleeping,
            };
        }

        match self.finished.get(&handle.0) {
            Some(Outcome::Completed) => TaskState::Completed,
            Some(Outcome::Failed(_)) => TaskState::Failed,
            Some(Outcome::Cancelled) => TaskState::Cancelled,
            None => TaskState::Unknown,
        }
    }

    /// The task waiting on `descriptor` in `direction`, if any.
    pub fn waiter(&self, descriptor: Descriptor, direction: Direction) -> Option<TaskId> {
        self.waits.get(descriptor, direction)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            spawned: self.spawned,
            reaped: self.reaped,
            ready: self.ready.len(),
            waiting: self
                .tasks
                .values()
                .filter(|slot| matches!(slot.state, SlotState::Waiting(_)))
                .count(),
            finished: self.finished.len(),
            wait_entries: self.waits.len(),
            resumes: self.resumes,
        }
    }

    /// Takes the records of every task finished since the last call.
    pub fn reap(&mut self) -> Vec<(TaskId, Outcome)> {
        let finished = mem::take(&mut self.finished);

        self.reaped += finished.len() as u64;

        finished.into_iter().collect()
    }

    fn admit(&mut self, id: TaskId, task: Box<dyn Task>) {
        self.tasks.insert(
            id,
            Slot {
                task,
                state: SlotState::Ready(Signal::Start),
                started: false,
                cancel_delivered: false,
            },
        );
        self.ready.push_back(id);
        self.spawned += 1;

        debug!("{}: spawned {id}", self.config.name);
    }

    fn resume(&mut self, id: TaskId) {
        let Some(mut slot) = self.tasks.remove(&id) else {
            return;
        };

        let signal = match mem::replace(&mut slot.state, SlotState::Running) {
            SlotState::Ready(signal) => signal,
            state => {
                error!("{}: {id} queued while not ready", self.config.name);
                slot.state = state;
                self.tasks.insert(id, slot);
                return;
            }
        };

        trace!("{}: resuming {id} with {signal:?}", self.config.name);

        slot.started = true;
        slot.cancel_delivered |= matches!(signal, Signal::Cancelled(Cancel::Requested));
        self.resumes += 1;

        let step = {
            let mut cx = Context::new(id, &mut self.next_id, &mut self.requests);
            slot.task.resume(&mut cx, signal)
        };

        match step {
            Step::Wait(_) if slot.cancel_delivered => {
                error!("{}: {id} suspended again after being cancelled", self.config.name);
                self.finish(id, slot, Err(Error::CancellationIgnored));
            }
            Step::Wait(wait) => self.suspend(id, slot, wait),
            Step::Done(()) => self.finish(id, slot, Ok(())),
            Step::Failed(e) => self.finish(id, slot, Err(e)),
        }

        self.apply_requests();
    }

    fn suspend(&mut self, id: TaskId, mut slot: Slot, wait: Wait) {
        match wait {
            Wait::Io {
                descriptor,
                direction,
                deadline,
            } => {
                if let Err(existing) = self.waits.insert(descriptor, direction, id) {
                    error!(
                        "{}: {id} waits on {descriptor:?} {direction:?}, already awaited by {existing}",
                        self.config.name
                    );
                    return self.finish(
                        id,
                        slot,
                        Err(Error::DuplicateWaiter {
                            descriptor,
                            direction,
                        }),
                    );
                }

                if let Some(deadline) = deadline {
                    self.deadlines.insert(deadline, id);
                }
            }
            Wait::Sleep(deadline) => self.deadlines.insert(deadline, id),
        }

        trace!("{}: {id} waits for {wait:?}", self.config.name);

        slot.state = SlotState::Waiting(wait);
        self.tasks.insert(id, slot);
    }

    fn finish(&mut self, id: TaskId, slot: Slot, result: Result<(), Error>) {
        // Dropping the task releases the descriptors it owns.
        drop(slot);

        let outcome = match result {
            Ok(()) => Outcome::Completed,
            Err(Error::Cancelled(cancel)) => {
                debug!("{}: {id} cancelled ({cancel:?})", self.config.name);
                Outcome::Cancelled
            }
            Err(e) => {
                match self.on_failure.as_mut() {
                    Some(reporter) => reporter(id, &e),
                    None => warn!("{}: {id} failed: {e}", self.config.name),
                }

                Outcome::Failed(e.to_string())
            }
        };

        debug!("{}: {id} finished: {outcome:?}", self.config.name);

        self.finished.insert(id, outcome);
    }

    fn apply_requests(&mut self) {
        for request in mem::take(&mut self.requests) {
            match request {
                Request::Spawn(id, task) => self.admit(id, task),
                Request::Cancel(id) => {
                    self.cancel_task(id, Cancel::Requested);
                }
                Request::Shutdown => self.shutdown = true,
            }
        }
    }

    fn cancel_task(&mut self, id: TaskId, cancel: Cancel) -> bool {
        let Some(slot) = self.tasks.get(&id) else {
            return false;
        };

        debug!("{}: cancelling {id} ({cancel:?})", self.config.name);

        match slot.state {
            SlotState::Waiting(_) => self.wake(id, Signal::Cancelled(cancel)),
            SlotState::Ready(_) | SlotState::Running => {
                if let Some(slot) = self.tasks.get_mut(&id) {
                    slot.state = SlotState::Ready(Signal::Cancelled(cancel));
                }
            }
        }

        true
    }

    /// Withdraws the task's wait entry and deadline and moves it to the back of the ready queue.
    fn wake(&mut self, id: TaskId, signal: Signal) {
        let Some(slot) = self.tasks.get_mut(&id) else {
            return;
        };

        let SlotState::Waiting(wait) = mem::replace(&mut slot.state, SlotState::Ready(signal)) else {
            return;
        };

        if let Wait::Io {
            descriptor,
            direction,
            ..
        } = wait
        {
            self.waits.remove(descriptor, direction, id);
        }

        if let Some(deadline) = wait.expires_at() {
            self.deadlines.remove(deadline, id);
        }

        self.ready.push_back(id);
    }

    fn expire(&mut self, now: Instant) -> usize {
        let expired = self.deadlines.expire(now);
        let count = expired.len();

        for id in expired {
            let signal = match self.tasks.get(&id).map(|slot| &slot.state) {
                Some(SlotState::Waiting(Wait::Sleep(_))) => Signal::Elapsed,
                _ => Signal::Cancelled(Cancel::TimedOut),
            };

            self.wake(id, signal);
        }

        count
    }

    /// Polls the multiplexer, retrying interrupted waits.
    ///
    /// The inner `Err` carries descriptors the multiplexer rejected as invalid.
    fn poll(
        &mut self,
        interest: &[Interest],
        timeout: Option<Duration>,
    ) -> Result<Result<Readiness, Vec<Descriptor>>, Error> {
        loop {
            match self.multiplexer.poll(interest, timeout) {
                Ok(readiness) => break Ok(Ok(readiness)),
                Err(PollError::Interrupted) => {
                    trace!("{}: poll interrupted, retrying", self.config.name);
                }
                Err(PollError::InvalidDescriptors(invalid)) => break Ok(Err(invalid)),
                Err(PollError::Fatal(e)) => {
                    error!("{}: multiplexer fault: {e}", self.config.name);
                    break Err(Error::Multiplexer(e));
                }
            }
        }
    }

    /// Removes invalid descriptors from the wait table, resuming their waiters with a fault.
    fn evict(&mut self, invalid: &[Descriptor]) -> usize {
        let mut woken = 0;

        for descriptor in invalid {
            for direction in EnumSet::<Direction>::all() {
                if let Some(id) = self.waits.get(*descriptor, direction) {
                    warn!(
                        "{}: evicting invalid {descriptor:?}, waited on by {id}",
                        self.config.name
                    );

                    self.wake(id, Signal::Fault(io::Error::from_raw_os_error(sys::EBADF)));
                    woken += 1;
                }
            }
        }

        woken
    }
}

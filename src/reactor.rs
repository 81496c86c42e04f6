use core::time::Duration;

use std::io;
use std::mem::MaybeUninit;

use enumset::{EnumSet, EnumSetType};
use log::trace;
use thiserror::Error;

use libc as sys;

use crate::sys::{is_open, Descriptor};

/// Readiness direction a task can wait for.
#[derive(EnumSetType, Debug, Hash)]
pub enum Direction {
    Read = 0,
    Write = 1,
}

/// The directions a single descriptor is waited on in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest {
    pub descriptor: Descriptor,
    pub directions: EnumSet<Direction>,
}

impl Interest {
    pub fn new(descriptor: Descriptor, directions: impl Into<EnumSet<Direction>>) -> Self {
        Self {
            descriptor,
            directions: directions.into(),
        }
    }
}

/// Result of one multiplexer round: which descriptors became ready in which directions.
///
/// Entries keep the order in which the multiplexer reported them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    entries: Vec<(Descriptor, EnumSet<Direction>)>,
}

impl Readiness {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Marks `descriptor` as ready in `direction`, merging with an earlier entry.
    pub fn insert(&mut self, descriptor: Descriptor, direction: impl Into<EnumSet<Direction>>) {
        let direction = direction.into();

        if let Some((_, ready)) = self.entries.iter_mut().find(|(fd, _)| *fd == descriptor) {
            *ready |= direction;
        } else if !direction.is_empty() {
            self.entries.push((descriptor, direction));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of descriptors reported ready in at least one direction.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Descriptor, EnumSet<Direction>)> + '_ {
        self.entries.iter().copied()
    }

    pub fn readable(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.ready_in(Direction::Read)
    }

    pub fn writable(&self) -> impl Iterator<Item = Descriptor> + '_ {
        self.ready_in(Direction::Write)
    }

    pub fn contains(&self, descriptor: Descriptor, direction: Direction) -> bool {
        self.entries
            .iter()
            .any(|(fd, ready)| *fd == descriptor && ready.contains(direction))
    }

    fn ready_in(&self, direction: Direction) -> impl Iterator<Item = Descriptor> + '_ {
        self.entries
            .iter()
            .filter(move |(_, ready)| ready.contains(direction))
            .map(|(fd, _)| *fd)
    }
}

impl FromIterator<(Descriptor, Direction)> for Readiness {
    fn from_iter<I: IntoIterator<Item = (Descriptor, Direction)>>(iter: I) -> Self {
        let mut readiness = Self::new();

        for (descriptor, direction) in iter {
            readiness.insert(descriptor, direction);
        }

        readiness
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    /// The wait was interrupted before anything became ready; retry it.
    #[error("readiness wait interrupted")]
    Interrupted,

    /// These descriptors are closed or cannot be represented in the readiness set.
    #[error("invalid descriptors in the readiness set: {0:?}")]
    InvalidDescriptors(Vec<Descriptor>),

    #[error("readiness wait failed: {0}")]
    Fatal(#[source] io::Error),
}

/// A readiness-based I/O demultiplexer.
pub trait Multiplexer {
    /// Blocks until at least one descriptor in `interest` is ready in one of its
    /// directions, or `timeout` elapses (`None` blocks indefinitely).
    ///
    /// An empty `interest` must return an empty [`Readiness`] immediately.
    fn poll(
        &mut self,
        interest: &[Interest],
        timeout: Option<Duration>,
    ) -> Result<Readiness, PollError>;
}

impl<M: Multiplexer + ?Sized> Multiplexer for &mut M {
    fn poll(
        &mut self,
        interest: &[Interest],
        timeout: Option<Duration>,
    ) -> Result<Readiness, PollError> {
        (**self).poll(interest, timeout)
    }
}

struct Fds {
    read: MaybeUninit<sys::fd_set>,
    write: MaybeUninit<sys::fd_set>,
    except: MaybeUninit<sys::fd_set>,
}

impl Fds {
    fn new() -> Self {
        let mut fds = Self {
            read: MaybeUninit::uninit(),
            write: MaybeUninit::uninit(),
            except: MaybeUninit::uninit(),
        };

        unsafe {
            sys::FD_ZERO(fds.read.as_mut_ptr());
            sys::FD_ZERO(fds.write.as_mut_ptr());
            sys::FD_ZERO(fds.except.as_mut_ptr());
        }

        fds
    }

    fn is_set(&self, descriptor: Descriptor, direction: Direction) -> bool {
        unsafe { sys::FD_ISSET(descriptor.as_raw(), self.fd_set(direction)) }
    }

    fn set(&mut self, descriptor: Descriptor, direction: Direction) {
        unsafe { sys::FD_SET(descriptor.as_raw(), self.fd_set_mut(direction)) }
    }

    fn is_except(&self, descriptor: Descriptor) -> bool {
        unsafe { sys::FD_ISSET(descriptor.as_raw(), self.except.assume_init_ref()) }
    }

    fn set_except(&mut self, descriptor: Descriptor) {
        unsafe { sys::FD_SET(descriptor.as_raw(), self.except.assume_init_mut()) }
    }

    fn fd_set(&self, direction: Direction) -> &sys::fd_set {
        unsafe {
            match direction {
                Direction::Read => self.read.assume_init_ref(),
                Direction::Write => self.write.assume_init_ref(),
            }
        }
    }

    fn fd_set_mut(&mut self, direction: Direction) -> &mut sys::fd_set {
        unsafe {
            match direction {
                Direction::Read => self.read.assume_init_mut(),
                Direction::Write => self.write.assume_init_mut(),
            }
        }
    }
}

/// [`Multiplexer`] backed by the `select(2)` syscall.
///
/// Exceptional conditions are reported as read readiness, so that a pending
/// socket error surfaces through the next receive attempt of the read waiter.
#[derive(Debug, Default)]
pub struct Select(());

impl Select {
    pub const fn new() -> Self {
        Self(())
    }

    fn classify(error: io::Error, interest: &[Interest]) -> PollError {
        match error.raw_os_error() {
            Some(sys::EINTR) => PollError::Interrupted,
            Some(sys::EBADF) => {
                let closed = interest
                    .iter()
                    .map(|interest| interest.descriptor)
                    .filter(|descriptor| !is_open(*descriptor))
                    .collect::<Vec<_>>();

                if closed.is_empty() {
                    PollError::Fatal(error)
                } else {
                    PollError::InvalidDescriptors(closed)
                }
            }
            _ => PollError::Fatal(error),
        }
    }
}

impl Multiplexer for Select {
    fn poll(
        &mut self,
        interest: &[Interest],
        timeout: Option<Duration>,
    ) -> Result<Readiness, PollError> {
        let unfit = interest
            .iter()
            .map(|interest| interest.descriptor)
            .filter(|descriptor| !descriptor.fits())
            .collect::<Vec<_>>();

        if !unfit.is_empty() {
            return Err(PollError::InvalidDescriptors(unfit));
        }

        let mut fds = Fds::new();
        let mut max: Option<Descriptor> = None;

        for entry in interest.iter().filter(|entry| !entry.directions.is_empty()) {
            for direction in entry.directions {
                fds.set(entry.descriptor, direction);
            }

            if entry.directions.contains(Direction::Read) {
                fds.set_except(entry.descriptor);
            }

            max = Some(max.map_or(entry.descriptor, |max| max.max(entry.descriptor)));
        }

        let Some(max) = max else {
            return Ok(Readiness::new());
        };

        let mut timeval = timeout.map(to_timeval);

        trace!("select: {} descriptors, max {max}, timeout {timeout:?}", interest.len());

        let count = syscall_los!(unsafe {
            sys::select(
                max.as_raw() + 1,
                fds.read.assume_init_mut(),
                fds.write.assume_init_mut(),
                fds.except.assume_init_mut(),
                timeval
                    .as_mut()
                    .map_or(core::ptr::null_mut(), |timeval| timeval as *mut _),
            )
        })
        .map_err(|error| Self::classify(error, interest))?;

        let mut readiness = Readiness::new();

        if count > 0 {
            for entry in interest {
                for direction in entry.directions {
                    if fds.is_set(entry.descriptor, direction) {
                        readiness.insert(entry.descriptor, direction);
                    }
                }

                if entry.directions.contains(Direction::Read) && fds.is_except(entry.descriptor) {
                    readiness.insert(entry.descriptor, Direction::Read);
                }
            }
        }

        trace!("select: {} ready", readiness.len());

        Ok(readiness)
    }
}

fn to_timeval(timeout: Duration) -> sys::timeval {
    // Round up so that a sub-microsecond remainder does not turn into a busy poll.
    let mut secs = timeout.as_secs();
    let mut micros = (timeout.subsec_nanos() as u64 + 999) / 1000;

    if micros == 1_000_000 {
        secs = secs.saturating_add(1);
        micros = 0;
    }

    sys::timeval {
        tv_sec: secs.min(sys::time_t::MAX as u64) as sys::time_t,
        tv_usec: micros as sys::suseconds_t,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    use super::*;

    #[test]
    fn empty_interest_returns_immediately() {
        let start = Instant::now();

        let readiness = Select::new().poll(&[], None).unwrap();

        assert!(readiness.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn interest_without_directions_is_empty() {
        let (a, _b) = UnixStream::pair().unwrap();

        let readiness = Select::new()
            .poll(&[Interest::new(Descriptor::of(&a), EnumSet::empty())], None)
            .unwrap();

        assert!(readiness.is_empty());
    }

    #[test]
    fn reports_write_then_read_readiness() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let (fa, fb) = (Descriptor::of(&a), Descriptor::of(&b));

        let mut select = Select::new();

        let readiness = select
            .poll(
                &[
                    Interest::new(fa, Direction::Write),
                    Interest::new(fb, Direction::Read),
                ],
                Some(Duration::from_secs(1)),
            )
            .unwrap();

        assert_eq!(readiness.writable().collect::<Vec<_>>(), vec![fa]);
        assert_eq!(readiness.readable().count(), 0);

        a.write_all(b"ping").unwrap();

        let readiness = select
            .poll(
                &[Interest::new(fb, Direction::Read)],
                Some(Duration::from_secs(1)),
            )
            .unwrap();

        assert!(readiness.contains(fb, Direction::Read));
        assert!(!readiness.contains(fb, Direction::Write));
    }

    #[test]
    fn times_out_without_readiness() {
        let (_a, b) = UnixStream::pair().unwrap();

        let start = Instant::now();

        let readiness = Select::new()
            .poll(
                &[Interest::new(Descriptor::of(&b), Direction::Read)],
                Some(Duration::from_millis(20)),
            )
            .unwrap();

        assert!(readiness.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn out_of_range_descriptor_is_invalid() {
        let bogus = Descriptor::from_raw(-1);

        let result = Select::new().poll(&[Interest::new(bogus, Direction::Read)], None);

        assert!(matches!(result, Err(PollError::InvalidDescriptors(fds)) if fds == vec![bogus]));
    }

    #[test]
    fn readiness_merges_directions() {
        let fd = Descriptor::from_raw(3);

        let readiness: Readiness = [(fd, Direction::Read), (fd, Direction::Write)]
            .into_iter()
            .collect();

        assert_eq!(readiness.len(), 1);
        assert!(readiness.contains(fd, Direction::Read));
        assert!(readiness.contains(fd, Direction::Write));
    }

    #[test]
    fn timeval_rounds_up() {
        let timeval = to_timeval(Duration::from_nanos(1));
        assert_eq!((timeval.tv_sec, timeval.tv_usec), (0, 1));

        let timeval = to_timeval(Duration::new(2, 999_999_999));
        assert_eq!((timeval.tv_sec, timeval.tv_usec), (3, 0));
    }
}

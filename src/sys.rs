use core::fmt;

use std::os::fd::{AsRawFd, RawFd};

use libc as sys;

/// Highest descriptor number (exclusive) that fits into an `fd_set`.
pub const FD_LIMIT: usize = sys::FD_SETSIZE;

/// An opaque, identity-comparable handle to a socket.
///
/// A `Descriptor` does not own anything: closing happens when the owning
/// [`Stream`](crate::net::Stream) or [`Listener`](crate::net::Listener) is dropped.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(RawFd);

impl Descriptor {
    pub const fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn of<T: AsRawFd + ?Sized>(source: &T) -> Self {
        Self(source.as_raw_fd())
    }

    pub const fn as_raw(self) -> RawFd {
        self.0
    }

    /// Whether the descriptor can be placed into an `fd_set` at all.
    pub(crate) fn fits(self) -> bool {
        self.0 >= 0 && (self.0 as usize) < FD_LIMIT
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd#{}", self.0)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<RawFd> for Descriptor {
    fn from(fd: RawFd) -> Self {
        Self(fd)
    }
}

/// Probes the descriptor with `fcntl(F_GETFD)`.
///
/// Used after `select` fails with `EBADF` to find out which of the
/// descriptors in the set is the offending one.
pub fn is_open(descriptor: Descriptor) -> bool {
    syscall_los!(unsafe { sys::fcntl(descriptor.as_raw(), sys::F_GETFD) }).is_ok()
}

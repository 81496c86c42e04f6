//! Non-blocking sockets exposing the `try_*` operations tasks are written against.
//!
//! Every operation returns `Ok(None)` when it would block. A receive of `Some(0)`
//! means the peer closed its side; any `Err` is a descriptor-level fault.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use crate::sys::Descriptor;

fn nonblocking<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(None),
        Err(e) => Err(e),
    }
}

/// A listening TCP socket in non-blocking mode.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::from_std(TcpListener::bind(addr)?)
    }

    pub fn from_std(inner: TcpListener) -> io::Result<Self> {
        inner.set_nonblocking(true)?;

        Ok(Self { inner })
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::of(&self.inner)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts one pending connection, already switched to non-blocking mode.
    pub fn try_accept(&self) -> io::Result<Option<(Stream, SocketAddr)>> {
        let Some((stream, peer)) = nonblocking(self.inner.accept())? else {
            return Ok(None);
        };

        Ok(Some((Stream::from_std(stream)?, peer)))
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A connected TCP socket in non-blocking mode.
#[derive(Debug)]
pub struct Stream {
    inner: TcpStream,
}

impl Stream {
    pub fn from_std(inner: TcpStream) -> io::Result<Self> {
        inner.set_nonblocking(true)?;

        Ok(Self { inner })
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::of(&self.inner)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        nonblocking((&self.inner).read(buf))
    }

    pub fn try_send(&self, buf: &[u8]) -> io::Result<Option<usize>> {
        nonblocking((&self.inner).write(buf))
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

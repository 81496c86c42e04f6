//! Connection-handling routines: an accept loop spawning one task per client, and
//! an echo loop built from a receive and a send-all sub-routine.

use core::marker::PhantomData;
use core::time::Duration;

use std::io::ErrorKind;
use std::net::SocketAddr;

use log::{debug, info, trace, warn};

use crate::error::Error;
use crate::net::{Listener, Stream};
use crate::step;
use crate::task::{Cancel, Context, Delegate, Routine, Signal, Step, Task, Wait};

/// Size of a single receive, and the capacity of the pending-output buffer.
pub const BUF_SIZE: usize = 4 * 1024;

/// Fixed reply of the hello server.
pub const HELLO: &[u8] = b"Hello world!\n";

pub type Packet = heapless::Vec<u8, BUF_SIZE>;

/// Accepts connections forever, spawning the task returned by `factory` for each.
///
/// One connection is accepted per readiness report; further pending connections keep
/// the listener readable. The loop ends (successfully) when cancelled.
pub struct AcceptLoop<F, T> {
    listener: Listener,
    factory: F,
    accepted: u64,
    _task: PhantomData<fn() -> T>,
}

impl<F, T> AcceptLoop<F, T>
where
    F: FnMut(Stream, SocketAddr) -> T,
    T: Task + 'static,
{
    pub fn new(listener: Listener, factory: F) -> Self {
        Self {
            listener,
            factory,
            accepted: 0,
            _task: PhantomData,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    fn wait(&self) -> Step {
        Step::Wait(Wait::readable(self.listener.descriptor()))
    }
}

impl<F, T> Routine for AcceptLoop<F, T>
where
    F: FnMut(Stream, SocketAddr) -> T,
    T: Task + 'static,
{
    type Output = ();

    fn resume(&mut self, cx: &mut Context<'_>, signal: Signal) -> Step {
        match signal {
            Signal::Start | Signal::Elapsed => return self.wait(),
            Signal::Cancelled(cancel) => {
                info!("{}: stopped accepting ({cancel:?})", cx.current());
                return Step::Done(());
            }
            Signal::Fault(e) => return Step::Failed(e.into()),
            Signal::Ready(_) => (),
        }

        match self.listener.try_accept() {
            Ok(Some((stream, peer))) => {
                info!("Connection from {peer}");

                let handle = cx.spawn((self.factory)(stream, peer));
                self.accepted += 1;

                debug!("{}: {peer} handled by {}", cx.current(), handle.id());
            }
            Ok(None) => trace!("{}: spurious accept readiness", cx.current()),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                ) =>
            {
                warn!("{}: connection lost before accept: {e}", cx.current());
            }
            Err(e) => return Step::Failed(e.into()),
        }

        self.wait()
    }
}

/// Receives one packet of up to [`BUF_SIZE`] bytes.
///
/// Finishes with the stream and `Some(packet)`, or `None` once the peer closed its side.
pub struct Recv {
    stream: Option<Stream>,
    idle_timeout: Option<Duration>,
}

impl Recv {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: Some(stream),
            idle_timeout: None,
        }
    }

    /// Times the receive out (with [`Cancel::TimedOut`]) if nothing arrives within `timeout`.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn wait(&self, stream: &Stream) -> Step<(Stream, Option<Packet>)> {
        let wait = Wait::readable(stream.descriptor());

        match self.idle_timeout {
            Some(timeout) => Step::Wait(wait.timeout(timeout)),
            None => Step::Wait(wait),
        }
    }
}

impl Routine for Recv {
    type Output = (Stream, Option<Packet>);

    fn resume(&mut self, _cx: &mut Context<'_>, signal: Signal) -> Step<Self::Output> {
        let Some(stream) = self.stream.as_ref() else {
            return Step::Failed(Error::Protocol("receive resumed after completion".into()));
        };

        match signal {
            Signal::Start | Signal::Elapsed => return self.wait(stream),
            Signal::Cancelled(cancel) => return Step::Failed(Error::Cancelled(cancel)),
            Signal::Fault(e) => return Step::Failed(e.into()),
            Signal::Ready(_) => (),
        }

        let mut buf = [0; BUF_SIZE];

        let packet = match stream.try_recv(&mut buf) {
            Ok(None) => return self.wait(stream),
            Ok(Some(0)) => None,
            Ok(Some(len)) => match Packet::from_slice(&buf[..len]) {
                Ok(packet) => Some(packet),
                Err(()) => return Step::Failed(Error::Protocol("oversized packet".into())),
            },
            Err(e) => return Step::Failed(e.into()),
        };

        match self.stream.take() {
            Some(stream) => Step::Done((stream, packet)),
            None => Step::Failed(Error::Protocol("receive lost its stream".into())),
        }
    }
}

/// Sends a buffer in full, suspending on write readiness between partial sends.
///
/// Finishes with the stream once every byte is out.
pub struct SendAll {
    stream: Option<Stream>,
    pending: Packet,
    sent: usize,
}

impl SendAll {
    pub fn new(stream: Stream, data: &[u8]) -> Result<Self, Error> {
        let pending = Packet::from_slice(data).map_err(|()| {
            Error::Protocol(format!(
                "reply of {} bytes exceeds {BUF_SIZE} bytes",
                data.len()
            ))
        })?;

        Ok(Self {
            stream: Some(stream),
            pending,
            sent: 0,
        })
    }

    /// Bytes not yet handed to the socket.
    pub fn remaining(&self) -> &[u8] {
        &self.pending[self.sent..]
    }
}

impl Routine for SendAll {
    type Output = Stream;

    fn resume(&mut self, _cx: &mut Context<'_>, signal: Signal) -> Step<Stream> {
        let Some(stream) = self.stream.as_ref() else {
            return Step::Failed(Error::Protocol("send resumed after completion".into()));
        };

        let wait = Step::Wait(Wait::writable(stream.descriptor()));

        match signal {
            Signal::Start | Signal::Elapsed => return wait,
            Signal::Cancelled(cancel) => return Step::Failed(Error::Cancelled(cancel)),
            Signal::Fault(e) => return Step::Failed(e.into()),
            Signal::Ready(_) => (),
        }

        match stream.try_send(self.remaining()) {
            Ok(Some(len)) => self.sent += len,
            Ok(None) => (),
            Err(e) => return Step::Failed(e.into()),
        }

        if !self.remaining().is_empty() {
            return wait;
        }

        match self.stream.take() {
            Some(stream) => Step::Done(stream),
            None => Step::Failed(Error::Protocol("send lost its stream".into())),
        }
    }
}

/// What an [`EchoLoop`] answers with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// The received packet, unchanged.
    Echo,
    /// The same bytes for every packet.
    Fixed(&'static [u8]),
}

/// Per-connection loop: receive a packet, send the reply, repeat until the peer closes.
///
/// The connection is closed when the loop finishes, whichever way it finishes.
pub struct EchoLoop {
    fresh: Option<Stream>,
    recv: Delegate<Recv>,
    send: Delegate<SendAll>,
    reply: Reply,
    idle_timeout: Option<Duration>,
}

impl EchoLoop {
    pub fn new(stream: Stream, reply: Reply) -> Self {
        Self {
            fresh: Some(stream),
            recv: Delegate::idle(),
            send: Delegate::idle(),
            reply,
            idle_timeout: None,
        }
    }

    /// Closes the connection (normally) after `timeout` without a packet.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    fn receive(&mut self, cx: &mut Context<'_>, stream: Stream) -> Step {
        let (recv, step) = Delegate::start(cx, Recv::new(stream).idle_timeout(self.idle_timeout));
        self.recv = recv;

        // A receive always suspends when started.
        step.map(|_| ())
    }
}

impl Routine for EchoLoop {
    type Output = ();

    fn resume(&mut self, cx: &mut Context<'_>, signal: Signal) -> Step {
        if let Some(stream) = self.fresh.take() {
            if let Signal::Cancelled(cancel) = signal {
                return Step::Failed(Error::Cancelled(cancel));
            }

            return self.receive(cx, stream);
        }

        let stream = if self.send.is_active() {
            step!(self.send.resume(cx, signal))
        } else {
            let (stream, packet) = match self.recv.resume(cx, signal) {
                Step::Failed(Error::Cancelled(Cancel::TimedOut)) => {
                    debug!("{}: idle, closing", cx.current());
                    return Step::Done(());
                }
                step => step!(step),
            };

            let Some(packet) = packet else {
                debug!("{}: peer closed", cx.current());
                return Step::Done(());
            };

            trace!("{}: received {} bytes", cx.current(), packet.len());

            let reply = match self.reply {
                Reply::Echo => &packet[..],
                Reply::Fixed(bytes) => bytes,
            };

            let send = match SendAll::new(stream, reply) {
                Ok(send) => send,
                Err(e) => return Step::Failed(e),
            };

            let (send, step) = Delegate::start(cx, send);
            self.send = send;

            step!(step)
        };

        self.receive(cx, stream)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    use super::*;
    use crate::task::{Request, TaskId};
    use crate::Direction;

    fn with_context<R>(f: impl FnOnce(&mut Context<'_>) -> R) -> (R, Vec<Request>) {
        let mut next_id = 1;
        let mut requests = Vec::new();

        let result = f(&mut Context::new(TaskId(0), &mut next_id, &mut requests));

        (result, requests)
    }

    fn pair() -> (Stream, TcpStream) {
        let listener = Listener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        loop {
            if let Some((stream, _)) = listener.try_accept().unwrap() {
                return (stream, client);
            }

            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Resumes with `Ready(direction)` until the routine stops waiting.
    fn settle<R: Routine>(routine: &mut R, direction: Direction) -> Step<R::Output> {
        loop {
            let (step, _) = with_context(|cx| routine.resume(cx, Signal::Ready(direction)));

            if !step.is_wait() {
                return step;
            }

            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn recv_waits_then_yields_packet() {
        let (stream, mut client) = pair();
        let descriptor = stream.descriptor();
        let mut recv = Recv::new(stream);

        let (step, _) = with_context(|cx| recv.resume(cx, Signal::Start));
        assert!(matches!(
            step,
            Step::Wait(Wait::Io { descriptor: d, direction: Direction::Read, deadline: None }) if d == descriptor
        ));

        client.write_all(b"ping").unwrap();

        let Step::Done((_, Some(packet))) = settle(&mut recv, Direction::Read) else {
            panic!("expected a packet");
        };
        assert_eq!(&packet[..], b"ping");
    }

    #[test]
    fn recv_reports_peer_close() {
        let (stream, client) = pair();
        let mut recv = Recv::new(stream);

        drop(client);

        assert!(matches!(
            settle(&mut recv, Direction::Read),
            Step::Done((_, None))
        ));
    }

    #[test]
    fn recv_with_idle_timeout_sets_deadline() {
        let (stream, _client) = pair();
        let mut recv = Recv::new(stream).idle_timeout(Some(Duration::from_secs(5)));

        let (step, _) = with_context(|cx| recv.resume(cx, Signal::Start));
        let Step::Wait(wait) = step else {
            panic!("expected a wait");
        };
        assert!(wait.expires_at().is_some());

        let (step, _) = with_context(|cx| recv.resume(cx, Signal::Cancelled(Cancel::TimedOut)));
        assert!(matches!(
            step,
            Step::Failed(Error::Cancelled(Cancel::TimedOut))
        ));
    }

    #[test]
    fn send_all_delivers_everything() {
        let (stream, mut client) = pair();
        let mut send = SendAll::new(stream, HELLO).unwrap();

        let (step, _) = with_context(|cx| send.resume(cx, Signal::Start));
        assert!(step.is_wait());

        assert!(matches!(settle(&mut send, Direction::Write), Step::Done(_)));
        assert!(send.remaining().is_empty());

        let mut buf = [0; HELLO.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, HELLO);
    }

    #[test]
    fn send_all_rejects_oversized_reply() {
        let (stream, _client) = pair();

        assert!(matches!(
            SendAll::new(stream, &[0; BUF_SIZE + 1]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn echo_loop_cancelled_before_start() {
        let (stream, _client) = pair();
        let mut echo = EchoLoop::new(stream, Reply::Echo);

        let (step, _) = with_context(|cx| echo.resume(cx, Signal::Cancelled(Cancel::Requested)));

        assert!(matches!(
            step,
            Step::Failed(Error::Cancelled(Cancel::Requested))
        ));
    }

    #[test]
    fn echo_loop_closes_quietly_on_idle_timeout() {
        let (stream, _client) = pair();
        let mut echo = EchoLoop::new(stream, Reply::Fixed(HELLO)).idle_timeout(Duration::from_millis(10));

        let (step, _) = with_context(|cx| echo.resume(cx, Signal::Start));
        assert!(step.is_wait());

        let (step, _) = with_context(|cx| echo.resume(cx, Signal::Cancelled(Cancel::TimedOut)));
        assert!(step.is_done());
    }

    #[test]
    fn accept_loop_spawns_one_task_per_connection() {
        let listener = Listener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut accept = AcceptLoop::new(listener, |stream, _| EchoLoop::new(stream, Reply::Echo));

        let (step, requests) = with_context(|cx| accept.resume(cx, Signal::Start));
        assert!(step.is_wait());
        assert!(requests.is_empty());

        let _client = TcpStream::connect(addr).unwrap();

        while accept.accepted() == 0 {
            let (step, requests) = with_context(|cx| accept.resume(cx, Signal::Ready(Direction::Read)));
            assert!(step.is_wait());
            assert!(requests.len() <= 1);
            thread::sleep(Duration::from_millis(1));
        }

        let (step, _) = with_context(|cx| accept.resume(cx, Signal::Cancelled(Cancel::Requested)));
        assert!(step.is_done());
    }
}

use std::cell::RefCell;
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use select_sched::{
    from_fn, AcceptLoop, Cancel, Descriptor, EchoLoop, Error, Listener, Outcome, Reply, Scheduler,
    Signal, Step, TaskHandle, TaskState, Wait, HELLO,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn wait_for_readable_times_out() {
    init();

    let (socket, _peer) = UnixStream::pair().unwrap();
    let descriptor = Descriptor::of(&socket);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let mut sched = Scheduler::new();
    let log = seen.clone();
    let handle = sched.spawn(from_fn(move |_, signal| {
        log.borrow_mut().push(format!("{signal:?}"));

        match signal {
            Signal::Start => Step::Wait(Wait::readable(descriptor).timeout(Duration::from_millis(30))),
            Signal::Cancelled(cancel) => Step::Failed(Error::Cancelled(cancel)),
            _ => Step::Done(()),
        }
    }));

    let start = Instant::now();
    sched.run().unwrap();

    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(*seen.borrow(), vec!["Start", "Cancelled(TimedOut)"]);
    assert_eq!(sched.task_state(handle), TaskState::Cancelled);
    assert_eq!(sched.waiter(descriptor, select_sched::Direction::Read), None);
}

#[test]
fn readiness_before_deadline_wins() {
    init();

    let (socket, peer) = UnixStream::pair().unwrap();
    let descriptor = Descriptor::of(&socket);

    let mut sched = Scheduler::new();
    let handle = sched.spawn(from_fn(move |_, signal| match signal {
        Signal::Start => Step::Wait(Wait::readable(descriptor).timeout(Duration::from_secs(5))),
        Signal::Ready(_) => Step::Done(()),
        _ => Step::Failed(Error::Protocol(format!("unexpected {signal:?}"))),
    }));
    sched.drain();

    std::io::Write::write_all(&mut &peer, b"x").unwrap();

    let start = Instant::now();
    sched.run().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(sched.task_state(handle), TaskState::Completed);
}

#[test]
fn sleepers_wake_in_deadline_order() {
    init();

    let woken = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new();

    for millis in [30, 10, 20] {
        let woken = woken.clone();

        sched.spawn(from_fn(move |_, signal| match signal {
            Signal::Start => Step::Wait(Wait::sleep(Duration::from_millis(millis))),
            _ => {
                woken.borrow_mut().push(millis);
                Step::Done(())
            }
        }));
    }

    sched.run().unwrap();

    assert_eq!(*woken.borrow(), vec![10, 20, 30]);
}

#[test]
fn supervisor_cancels_its_group() {
    init();

    let mut sched = Scheduler::new();
    let sockets = (0..3).map(|_| UnixStream::pair().unwrap()).collect::<Vec<_>>();
    let descriptors = sockets
        .iter()
        .map(|(socket, _)| Descriptor::of(socket))
        .collect::<Vec<_>>();

    let members = Rc::new(RefCell::new(Vec::<TaskHandle>::new()));
    let group = members.clone();

    sched.spawn(from_fn(move |cx, signal| match signal {
        Signal::Start => {
            for descriptor in descriptors.iter().copied() {
                let member = cx.spawn(from_fn(move |_, signal| match signal {
                    Signal::Cancelled(cancel) => Step::Failed(Error::Cancelled(cancel)),
                    _ => Step::Wait(Wait::readable(descriptor)),
                }));
                group.borrow_mut().push(member);
            }

            Step::Wait(Wait::sleep(Duration::from_millis(10)))
        }
        _ => {
            for member in group.borrow().iter() {
                cx.cancel(*member);
            }

            Step::Done(())
        }
    }));

    sched.run().unwrap();

    assert_eq!(members.borrow().len(), 3);
    for member in members.borrow().iter() {
        assert_eq!(sched.task_state(*member), TaskState::Cancelled);
    }
    assert_eq!(sched.stats().wait_entries, 0);
    assert!(sched.stats().is_balanced());
}

#[test]
fn idle_connection_is_closed() {
    init();

    let listener = Listener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut sched = Scheduler::new();
    let accept = sched.spawn(AcceptLoop::new(listener, |stream, _| {
        EchoLoop::new(stream, Reply::Fixed(HELLO)).idle_timeout(Duration::from_millis(50))
    }));
    sched.drain();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_nonblocking(true).unwrap();

    let start = Instant::now();
    while sched.stats().finished == 0 {
        assert!(start.elapsed() < Duration::from_secs(10), "connection never timed out");

        sched.turn(Some(Duration::from_millis(10))).unwrap();
        sched.drain();
    }

    assert!(start.elapsed() >= Duration::from_millis(50));

    let reaped = sched.reap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].1, Outcome::Completed);

    // The server side is gone: the client reads end-of-stream.
    let mut buf = [0; 16];
    let eof = loop {
        match client.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("{e}"),
        }
    };
    assert_eq!(eof, 0);

    sched.cancel(accept);
    sched.run().unwrap();
    assert_eq!(sched.task_state(accept), TaskState::Completed);
}

#[test]
fn timed_out_wait_can_be_retried() {
    init();

    let (socket, _peer) = UnixStream::pair().unwrap();
    let descriptor = Descriptor::of(&socket);
    let mut attempts = 0;

    let mut sched = Scheduler::new();
    let handle = sched.spawn(from_fn(move |_, signal| match signal {
        Signal::Start | Signal::Cancelled(Cancel::TimedOut) if attempts < 3 => {
            attempts += 1;
            Step::Wait(Wait::readable(descriptor).timeout(Duration::from_millis(5)))
        }
        _ => Step::Done(()),
    }));

    sched.run().unwrap();

    assert_eq!(sched.task_state(handle), TaskState::Completed);
    assert_eq!(sched.stats().resumes, 4);
}

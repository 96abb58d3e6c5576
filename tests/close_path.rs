use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use evsock::{Conn, Handler, ReadResult, Reactor, WriteItem};
use nix::libc;

#[derive(Default)]
struct CloseObservations {
    fd_open_after_close: Option<bool>,
    in_registry_after_close: Option<bool>,
    deferred_entries: Option<usize>,
}

/// Closes itself on the first readable event and records what the world
/// looks like mid-batch.
struct SelfCloser {
    seen: Rc<RefCell<CloseObservations>>,
}

impl Handler for SelfCloser {
    fn on_readable(&mut self, conn: &Rc<Conn>) {
        let reactor = conn.reactor().clone();
        let fd = conn.fd();
        conn.close("test");

        let mut seen = self.seen.borrow_mut();
        seen.fd_open_after_close = Some(unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1);
        seen.in_registry_after_close = Some(reactor.descriptor_map().contains_key(&fd));
        seen.deferred_entries = Some(
            reactor
                .pending_close()
                .iter()
                .filter(|&&pending| pending == fd)
                .count(),
        );
    }

    fn on_hangup(&mut self, _conn: &Rc<Conn>) {}
}

/// Reads one chunk per readable event, counting invocations.
struct Counter {
    reads: Rc<Cell<u32>>,
}

impl Handler for Counter {
    fn on_readable(&mut self, conn: &Rc<Conn>) {
        self.reads.set(self.reads.get() + 1);
        let _ = conn.read(64);
    }

    fn on_hangup(&mut self, _conn: &Rc<Conn>) {}
}

/// Treats a closed read as a dead peer.
struct CloseOnEof;

impl Handler for CloseOnEof {
    fn on_readable(&mut self, conn: &Rc<Conn>) {
        match conn.read(64) {
            ReadResult::Data(_) | ReadResult::WouldBlock => {}
            ReadResult::Closed => {
                conn.close("peer");
            }
        }
    }

    fn on_hangup(&mut self, _conn: &Rc<Conn>) {}
}

fn nonblocking_pair() -> (UnixStream, UnixStream) {
    let (local, peer) = UnixStream::pair().expect("socketpair");
    local.set_nonblocking(true).expect("nonblocking");
    (local, peer)
}

#[test]
fn close_during_dispatch_defers_the_os_close() {
    let reactor = Reactor::new().expect("reactor");

    let seen = Rc::new(RefCell::new(CloseObservations::default()));
    let (local1, mut peer1) = nonblocking_pair();
    let c1 = Conn::new(
        &reactor,
        local1,
        SelfCloser {
            seen: Rc::clone(&seen),
        },
    )
    .expect("c1");
    c1.watch_read(true);

    let reads = Rc::new(Cell::new(0u32));
    let (local2, mut peer2) = nonblocking_pair();
    let c2 = Conn::new(
        &reactor,
        local2,
        Counter {
            reads: Rc::clone(&reads),
        },
    )
    .expect("c2");
    c2.watch_read(true);

    assert_eq!(reactor.watched_sockets(), 2);

    // Both become readable before the pass so they land in one batch.
    peer1.write_all(b"x").expect("peer1 write");
    peer2.write_all(b"y").expect("peer2 write");
    reactor
        .loop_once(Some(Duration::from_millis(500)))
        .expect("loop pass");

    let seen = seen.borrow();
    assert_eq!(
        seen.fd_open_after_close,
        Some(true),
        "the OS descriptor must outlive close() until the batch ends"
    );
    assert_eq!(seen.in_registry_after_close, Some(false));
    assert_eq!(seen.deferred_entries, Some(1));

    // The other connection in the batch was dispatched normally.
    assert_eq!(reads.get(), 1);

    // The post-batch drain released the socket.
    assert!(reactor.pending_close().is_empty());
    assert_eq!(reactor.watched_sockets(), 1);
    assert!(c1.is_closed());
    assert!(!c2.is_closed());
}

#[test]
fn peer_shutdown_reaches_the_closed_sentinel() {
    let reactor = Reactor::new().expect("reactor");

    let (local, peer) = nonblocking_pair();
    let conn = Conn::new(&reactor, local, CloseOnEof).expect("conn");
    conn.watch_read(true);
    let fd = conn.fd();

    drop(peer);
    reactor
        .loop_once(Some(Duration::from_millis(500)))
        .expect("loop pass");

    assert!(conn.is_closed());
    assert!(!reactor.descriptor_map().contains_key(&fd));
    assert!(reactor.pending_close().is_empty());

    // The post-close lie: writing still reports success without touching
    // the socket.
    assert!(conn.write(WriteItem::from("late")));
    assert_eq!(conn.write_queue_size(), 0);
}

#[test]
fn partial_writes_account_across_dispatches() {
    let reactor = Reactor::new().expect("reactor");

    let (local, mut peer) = nonblocking_pair();
    let conn = Conn::new(&reactor, local, CloseOnEof).expect("conn");

    let payload = vec![0x5cu8; 1024 * 1024];
    assert!(!conn.write(WriteItem::bytes(payload.clone())));

    let total = payload.len();
    let drain = std::thread::spawn(move || {
        use std::io::Read;
        let mut received = vec![0u8; total];
        peer.read_exact(&mut received).expect("peer read");
        received
    });

    let mut passes = 0;
    while conn.write_queue_size() > 0 {
        reactor
            .loop_once(Some(Duration::from_millis(100)))
            .expect("loop pass");
        passes += 1;
        assert!(passes < 10_000, "queue failed to drain");
    }

    // Whatever the kernel accepted per pass, the transmitted total is the
    // whole payload.
    assert_eq!(drain.join().expect("drain thread"), payload);
}

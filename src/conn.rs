use std::any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::Rc;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::socket::{getpeername, recv, send, MsgFlags, SockaddrStorage};

use crate::utils::set_tcp_cork;
use crate::{interest, Interest, Reactor};

/// Protocol callbacks dispatched by the event loop.
///
/// One handler serves one connection for its whole lifetime. All methods
/// run on the loop thread; none may block. The default `on_writable`
/// flushes the pending write queue and drops writable interest once it is
/// empty; the other defaults panic, since a readiness event with no
/// protocol behind it is a missing implementation, not an I/O condition.
pub trait Handler {
    fn on_readable(&mut self, conn: &Rc<Conn>) {
        panic!("{conn}: readable event with no on_readable implementation");
    }

    fn on_writable(&mut self, conn: &Rc<Conn>) {
        if conn.write(None) {
            conn.watch_write(false);
        }
    }

    fn on_error(&mut self, conn: &Rc<Conn>) {
        panic!("{conn}: error event with no on_error implementation");
    }

    fn on_hangup(&mut self, conn: &Rc<Conn>) {
        panic!("{conn}: hangup event with no on_hangup implementation");
    }
}

/// One element of a connection's pending-write queue.
pub enum WriteItem {
    /// An owned byte buffer.
    Bytes(Vec<u8>),
    /// A shared byte buffer; queuing one does not copy it.
    Shared(Rc<[u8]>),
    /// Invoked synchronously when it reaches the front of the queue.
    Callback(Box<dyn FnOnce()>),
}

impl WriteItem {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(data.into())
    }

    pub fn shared(data: Rc<[u8]>) -> Self {
        Self::Shared(data)
    }

    pub fn callback(f: impl FnOnce() + 'static) -> Self {
        Self::Callback(Box::new(f))
    }

    /// Queue-pressure weight: byte count for buffers, 1 for callbacks.
    fn weight(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Shared(b) => b.len(),
            Self::Callback(_) => 1,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Shared(b) => b,
            Self::Callback(_) => unreachable!("callback items carry no bytes"),
        }
    }
}

impl From<Vec<u8>> for WriteItem {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes(data)
    }
}

impl From<&[u8]> for WriteItem {
    fn from(data: &[u8]) -> Self {
        Self::Bytes(data.to_vec())
    }
}

impl From<&str> for WriteItem {
    fn from(data: &str) -> Self {
        Self::Bytes(data.as_bytes().to_vec())
    }
}

impl From<Rc<[u8]>> for WriteItem {
    fn from(data: Rc<[u8]>) -> Self {
        Self::Shared(data)
    }
}

impl fmt::Debug for WriteItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Shared(b) => f.debug_tuple("Shared").field(&b.len()).finish(),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Outcome of a single non-blocking [`Conn::read`].
#[derive(Debug, Eq, PartialEq)]
pub enum ReadResult {
    /// Bytes read from the socket; never empty.
    Data(Vec<u8>),
    /// Nothing to read right now.
    WouldBlock,
    /// Orderly shutdown by the peer, or a read error. The connection
    /// should be closed.
    Closed,
}

#[derive(Default)]
struct WriteQueue {
    items: VecDeque<WriteItem>,
    /// Bytes of the head item already transmitted.
    offset: usize,
    /// Invariant: zero iff `items` is empty.
    size: usize,
}

#[derive(Default)]
struct ReadBuf {
    chunks: VecDeque<Vec<u8>>,
    ahead: usize,
}

enum RawWrite {
    Wrote(usize),
    WouldBlock,
    PeerGone(&'static str),
    Fatal(Errno),
}

/// A non-blocking socket owned by a reactor.
///
/// Created around an already-connected (or accepted) socket, which must be
/// in non-blocking mode. Construction registers the connection with the
/// reactor's backend and descriptor registry; [`close`](Conn::close)
/// reverses both immediately but defers the OS-level close to the end of
/// the current dispatch pass, so a batch of ready events can never observe
/// the fd number recycled.
///
/// The handler type is erased to `dyn Handler` inside the registry;
/// `Rc<Conn<H>>` coerces to `Rc<Conn>` wherever an erased connection is
/// expected.
///
/// Connections are single-threaded like the reactor that owns them;
/// calling into one from another thread is not supported.
pub struct Conn<H: Handler + ?Sized = dyn Handler> {
    reactor: Reactor,
    fd: RawFd,
    label: &'static str,
    closed: Cell<bool>,
    watch: Cell<Interest>,
    sock: RefCell<Option<OwnedFd>>,
    wq: RefCell<WriteQueue>,
    rq: RefCell<ReadBuf>,
    handler: RefCell<H>,
}

impl<H: Handler + 'static> Conn<H> {
    /// Wraps `sock` and registers it with `reactor`.
    ///
    /// The initial interest mask is `ERR | HUP`; protocols call
    /// [`watch_read`](Conn::watch_read) once they are ready for input.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is already owned by a connection or the
    /// backend refuses the registration.
    pub fn new<S>(reactor: &Reactor, sock: S, handler: H) -> io::Result<Rc<Self>>
    where
        S: Into<OwnedFd>,
    {
        let sock = sock.into();
        let fd = sock.as_raw_fd();
        let conn = Rc::new(Conn {
            reactor: reactor.clone(),
            fd,
            label: any::type_name::<H>(),
            closed: Cell::new(false),
            watch: Cell::new(interest().err().hup()),
            sock: RefCell::new(Some(sock)),
            wq: RefCell::new(WriteQueue::default()),
            rq: RefCell::new(ReadBuf::default()),
            handler: RefCell::new(handler),
        });
        let erased: Rc<Conn> = conn.clone();
        reactor.adopt_conn(erased)?;
        Ok(conn)
    }
}

impl<H: Handler + ?Sized> Conn<H> {
    /// The descriptor number. Stable for the connection's lifetime.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// A borrowed view of the underlying socket, for introspection.
    /// `None` once the connection is closed.
    pub fn sock(&self) -> Option<BorrowedFd<'_>> {
        if self.closed.get() {
            return None;
        }
        // While `closed` is false this connection owns the descriptor.
        Some(unsafe { BorrowedFd::borrow_raw(self.fd) })
    }

    /// The reactor this connection is registered with.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// The interest mask currently registered with the backend.
    pub fn interests(&self) -> Interest {
        self.watch.get()
    }

    /// Queue pressure: unsent bytes plus one per queued callback. Zero iff
    /// the write queue is empty.
    pub fn write_queue_size(&self) -> usize {
        self.wq.borrow().size
    }

    /// Bytes currently held in the protocol-level read buffer.
    pub fn read_ahead(&self) -> usize {
        self.rq.borrow().ahead
    }

    /// Queues or transmits `item`, preserving insertion order.
    ///
    /// `None` kicks the queue without adding anything — the default
    /// writable dispatch uses this to flush. Returns `true` when the queue
    /// is empty at return time and writable notifications are not needed;
    /// `false` when bytes remain queued, in which case writable interest
    /// has been enabled. On a closed connection this returns `true`
    /// without touching the socket, which protects callers that re-enter
    /// from a nested close.
    ///
    /// When the queue is empty, a byte item is tried against the kernel
    /// directly and only enqueued if some of it is refused. Callback items
    /// run synchronously when they reach the front; a callback may itself
    /// call `write`, and anything it writes lands behind the items already
    /// queued.
    pub fn write(&self, item: impl Into<Option<WriteItem>>) -> bool {
        self.write_opt(item.into())
    }

    fn write_opt(&self, data: Option<WriteItem>) -> bool {
        if self.closed.get() {
            return true;
        }

        let mut fast = None;
        if let Some(item) = data {
            let mut wq = self.wq.borrow_mut();
            if wq.size > 0 {
                wq.size += item.weight();
                wq.items.push_back(item);
                return false;
            }
            fast = Some(item);
        }

        loop {
            // A callback below may have closed this connection.
            if self.closed.get() {
                return true;
            }

            let fast_item = match fast.take() {
                Some(WriteItem::Callback(f)) => {
                    // Never enqueued, so there is no accounting to undo.
                    f();
                    continue;
                }
                other => other,
            };

            if fast_item.is_none() {
                // Callbacks are popped before they run so they can
                // re-enter write() freely.
                let mut wq = self.wq.borrow_mut();
                match wq.items.front() {
                    None => return true,
                    Some(WriteItem::Callback(_)) => {
                        let Some(WriteItem::Callback(f)) = wq.items.pop_front() else {
                            unreachable!();
                        };
                        wq.size -= 1;
                        drop(wq);
                        f();
                        continue;
                    }
                    Some(_) => {}
                }
            }

            let res = match &fast_item {
                Some(item) => self.raw_write(item.as_bytes()),
                None => {
                    let wq = self.wq.borrow();
                    let head = wq.items.front().expect("non-empty write queue");
                    self.raw_write(&head.as_bytes()[wq.offset..])
                }
            };

            match res {
                RawWrite::Wrote(n) => {
                    if let Some(item) = fast_item {
                        let len = item.as_bytes().len();
                        if n == len {
                            return true;
                        }
                        let mut wq = self.wq.borrow_mut();
                        wq.items.push_back(item);
                        wq.size += len - n;
                        wq.offset = n;
                        drop(wq);
                        self.watch_write(true);
                        return false;
                    }

                    let mut wq = self.wq.borrow_mut();
                    let head_len = wq.items.front().expect("non-empty write queue").as_bytes().len();
                    let remaining = head_len - wq.offset;
                    wq.size -= n;
                    if n == remaining {
                        wq.offset = 0;
                        wq.items.pop_front();
                        continue;
                    }
                    wq.offset += n;
                    drop(wq);
                    self.watch_write(true);
                    return false;
                }
                RawWrite::WouldBlock => {
                    if let Some(item) = fast_item {
                        let mut wq = self.wq.borrow_mut();
                        wq.size += item.weight();
                        wq.items.push_back(item);
                    }
                    self.watch_write(true);
                    return false;
                }
                RawWrite::PeerGone(reason) => return self.close(reason),
                RawWrite::Fatal(errno) => {
                    if self.reactor.debug_level() >= 1 {
                        warn!("{self}: write failed: {errno}");
                    }
                    return self.close("write_error");
                }
            }
        }
    }

    fn raw_write(&self, buf: &[u8]) -> RawWrite {
        loop {
            return match send(self.fd, buf, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => RawWrite::Wrote(n),
                Err(Errno::EAGAIN) => RawWrite::WouldBlock,
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) => RawWrite::PeerGone("broken_pipe"),
                Err(Errno::ECONNRESET) => RawWrite::PeerGone("connection_reset"),
                Err(e) => RawWrite::Fatal(e),
            };
        }
    }

    /// One non-blocking read of at most `max` bytes.
    pub fn read(&self, max: usize) -> ReadResult {
        if self.closed.get() {
            return ReadResult::Closed;
        }
        let mut buf = vec![0u8; max];
        loop {
            return match recv(self.fd, &mut buf, MsgFlags::empty()) {
                Ok(0) => ReadResult::Closed,
                Ok(n) => {
                    buf.truncate(n);
                    ReadResult::Data(buf)
                }
                Err(Errno::EAGAIN) => ReadResult::WouldBlock,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    if self.reactor.debug_level() >= 1 {
                        debug!("{self}: read failed: {e}");
                    }
                    ReadResult::Closed
                }
            };
        }
    }

    /// Appends `data` to the protocol-level read buffer.
    pub fn push_read_buf(&self, data: Vec<u8>) {
        let mut rq = self.rq.borrow_mut();
        rq.ahead += data.len();
        rq.chunks.push_back(data);
    }

    /// Moves every buffered read chunk to `dest`'s write queue, in order.
    /// A building block for protocol-level splicing.
    pub fn drain_read_buf_to<D>(&self, dest: &Conn<D>)
    where
        D: Handler + ?Sized,
    {
        loop {
            let chunk = {
                let mut rq = self.rq.borrow_mut();
                match rq.chunks.pop_front() {
                    Some(chunk) => {
                        rq.ahead -= chunk.len();
                        chunk
                    }
                    None => break,
                }
            };
            dest.write(WriteItem::Bytes(chunk));
        }
    }

    /// Enables or disables readable notifications. No-op on a closed
    /// connection; backend failures are logged, not fatal.
    pub fn watch_read(&self, want: bool) {
        self.update_watch(Interest::READ, want);
    }

    /// Enables or disables writable notifications. The write path enables
    /// this itself on a short or refused write; the only thing that clears
    /// it is an explicit `watch_write(false)`.
    pub fn watch_write(&self, want: bool) {
        self.update_watch(Interest::WRITE, want);
    }

    fn update_watch(&self, bit: Interest, want: bool) {
        if self.closed.get() {
            return;
        }
        let old = self.watch.get();
        let new = if want {
            old.union(bit)
        } else {
            old.difference(bit)
        };
        if new == old {
            return;
        }
        self.watch.set(new);
        if let Err(e) = self.reactor.update_interest(self.fd, new) {
            warn!("{self}: interest update failed: {e}");
        }
    }

    /// Marks the connection closed and schedules the socket for release at
    /// the end of the current dispatch pass.
    ///
    /// Idempotent. Clears the write queue, which also drops any callbacks
    /// holding a reference back to this connection, unregisters from the
    /// backend and the registry, and hands the socket to the reactor's
    /// deferred-close list. Always returns `false` so error paths can
    /// `return conn.close(reason)`.
    pub fn close(&self, reason: &str) -> bool {
        if self.closed.get() {
            return false;
        }
        if self.reactor.debug_level() >= 1 {
            debug!("{self}: closing ({reason})");
        }
        self.closed.set(true);
        {
            let mut wq = self.wq.borrow_mut();
            wq.items.clear();
            wq.size = 0;
            wq.offset = 0;
        }
        self.reactor.forget_conn(self.fd);
        if let Some(sock) = self.sock.borrow_mut().take() {
            self.reactor.defer_close(sock);
        }
        false
    }

    /// Sets or clears `TCP_CORK`. No-op on a closed connection.
    pub fn set_cork(&self, on: bool) -> io::Result<()> {
        if self.closed.get() {
            return Ok(());
        }
        set_tcp_cork(self.fd, on)
    }

    /// The peer address as `"a.b.c.d:port"` (or the IPv6 equivalent), if
    /// the socket has one.
    pub fn peer_addr(&self) -> Option<String> {
        if self.closed.get() {
            return None;
        }
        let addr: SockaddrStorage = getpeername(self.fd).ok()?;
        if let Some(v4) = addr.as_sockaddr_in() {
            return Some(v4.to_string());
        }
        if let Some(v6) = addr.as_sockaddr_in6() {
            return Some(v6.to_string());
        }
        None
    }
}

impl Conn {
    /// Fans one readiness mask out to the handler, readable first, then
    /// writable, error, hangup. Every dispatch re-checks `closed`: any
    /// callback may close the connection and the rest of the mask must
    /// then be dropped.
    pub(crate) fn dispatch(self: &Rc<Self>, ready: Interest) {
        if ready.contains(Interest::READ) && !self.closed.get() {
            self.handler.borrow_mut().on_readable(self);
        }
        if ready.contains(Interest::WRITE) && !self.closed.get() {
            self.handler.borrow_mut().on_writable(self);
        }
        if ready.contains(Interest::ERR) && !self.closed.get() {
            self.handler.borrow_mut().on_error(self);
        }
        if ready.contains(Interest::HUP) && !self.closed.get() {
            self.handler.borrow_mut().on_hangup(self);
        }
    }
}

impl<H: Handler + ?Sized> fmt::Display for Conn<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.closed.get() { "closed" } else { "open" };
        write!(f, "{}: ({state})", self.label)?;
        if let Some(peer) = self.peer_addr() {
            write!(f, " to {peer}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    use super::*;

    struct Sink;

    impl Handler for Sink {}

    fn conn_pair(reactor: &Reactor) -> (Rc<Conn<Sink>>, UnixStream) {
        let (local, peer) = UnixStream::pair().expect("socketpair");
        local.set_nonblocking(true).expect("nonblocking");
        let conn = Conn::new(reactor, local, Sink).expect("conn");
        (conn, peer)
    }

    /// Writes until the kernel refuses, so the queue is guaranteed
    /// non-empty afterwards.
    fn fill_queue(conn: &Conn<Sink>) {
        while conn.write(WriteItem::bytes(vec![0u8; 64 * 1024])) {}
    }

    #[test]
    fn small_write_takes_fast_path() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, mut peer) = conn_pair(&reactor);

        assert!(conn.write(WriteItem::from("hello")));
        assert_eq!(conn.write_queue_size(), 0);
        assert!(!conn.interests().contains(Interest::WRITE));

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn refused_write_queues_and_arms_writable() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);

        fill_queue(&conn);
        assert!(conn.write_queue_size() > 0);
        assert!(conn.interests().contains(Interest::WRITE));
    }

    #[test]
    fn callback_behind_queued_bytes_weighs_one() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);

        fill_queue(&conn);
        let size = conn.write_queue_size();
        assert!(!conn.write(WriteItem::callback(|| {})));
        assert_eq!(conn.write_queue_size(), size + 1);
    }

    #[test]
    fn fast_path_callback_runs_without_accounting() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);

        let fired = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&fired);
        assert!(conn.write(WriteItem::callback(move || seen.set(seen.get() + 1))));
        assert_eq!(fired.get(), 1);
        assert_eq!(conn.write_queue_size(), 0);
    }

    #[test]
    fn close_is_idempotent_and_write_lies_afterwards() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);
        let fd = conn.fd();

        assert!(!conn.close("test"));
        assert!(!conn.close("again"));
        assert!(conn.is_closed());
        assert!(!reactor.descriptor_map().contains_key(&fd));

        assert!(conn.write(WriteItem::from("ignored")));
        assert_eq!(conn.write_queue_size(), 0);
        conn.watch_read(true);
        assert!(!conn.interests().contains(Interest::READ));
    }

    #[test]
    fn close_clears_pending_queue() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);

        fill_queue(&conn);
        conn.write(WriteItem::callback(|| {}));
        assert!(conn.write_queue_size() > 0);
        conn.close("test");
        assert_eq!(conn.write_queue_size(), 0);
    }

    #[test]
    fn watch_read_round_trips_mask() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);

        let before = conn.interests();
        conn.watch_read(true);
        assert!(conn.interests().contains(Interest::READ));
        conn.watch_read(false);
        assert_eq!(conn.interests(), before);
    }

    #[test]
    fn drain_read_buf_moves_chunks_in_order() {
        let reactor = Reactor::new().expect("reactor");
        let (src, _src_peer) = conn_pair(&reactor);
        let (dst, mut dst_peer) = conn_pair(&reactor);

        src.push_read_buf(b"ab".to_vec());
        src.push_read_buf(b"cd".to_vec());
        assert_eq!(src.read_ahead(), 4);

        src.drain_read_buf_to(&dst);
        assert_eq!(src.read_ahead(), 0);

        let mut buf = [0u8; 4];
        dst_peer.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn display_tracks_state() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);

        let open = conn.to_string();
        assert!(open.contains("Sink"), "unexpected label in {open:?}");
        assert!(open.contains("(open)"));

        conn.close("test");
        assert!(conn.to_string().contains("(closed)"));
    }

    fn tcp_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn cork_toggles_on_tcp_sockets() {
        let reactor = Reactor::new().expect("reactor");
        let (client, _server) = tcp_pair();
        client.set_nonblocking(true).expect("nonblocking");
        let conn = Conn::new(&reactor, client, Sink).expect("conn");

        conn.set_cork(true).expect("cork on");
        conn.set_cork(false).expect("cork off");

        conn.close("test");
        assert!(conn.set_cork(true).is_ok());
    }

    #[test]
    fn peer_addr_formats_host_and_port() {
        let reactor = Reactor::new().expect("reactor");
        let (client, server) = tcp_pair();
        let expected = server.local_addr().expect("server addr");
        client.set_nonblocking(true).expect("nonblocking");
        let conn = Conn::new(&reactor, client, Sink).expect("conn");

        assert_eq!(conn.peer_addr(), Some(expected.to_string()));

        conn.close("test");
        assert_eq!(conn.peer_addr(), None);
    }

    #[test]
    fn unix_socket_has_no_peer_addr() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, _peer) = conn_pair(&reactor);
        assert_eq!(conn.peer_addr(), None);
    }

    #[test]
    fn read_reports_data_then_would_block() {
        use std::io::Write;

        let reactor = Reactor::new().expect("reactor");
        let (conn, mut peer) = conn_pair(&reactor);

        peer.write_all(b"ping").expect("write");
        assert_eq!(conn.read(64), ReadResult::Data(b"ping".to_vec()));
        assert_eq!(conn.read(64), ReadResult::WouldBlock);
    }

    #[test]
    fn read_reports_closed_on_peer_shutdown() {
        let reactor = Reactor::new().expect("reactor");
        let (conn, peer) = conn_pair(&reactor);

        drop(peer);
        assert_eq!(conn.read(64), ReadResult::Closed);
    }
}

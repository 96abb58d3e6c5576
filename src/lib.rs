//! A single-threaded, non-blocking socket reactor.
//!
//! The reactor multiplexes many descriptors over one readiness backend —
//! epoll where the system provides it, `poll(2)` otherwise — and fans
//! batches of events out to [`Conn`] objects, each of which wraps one
//! socket together with its pending-write queue. Protocol behavior lives
//! in a [`Handler`] implementation supplied per connection.
//!
//! Three disciplines hold the core together:
//!
//! * **Deferred close.** [`Conn::close`] removes the connection from the
//!   registry and backend immediately, but the OS-level close happens only
//!   after the current dispatch pass. Within one batch of ready events a
//!   closed fd number can therefore never be recycled onto a new
//!   connection and misroute events.
//! * **Write queue in lockstep with interest.** [`Conn::write`] serves
//!   owned buffers, shared buffers and inline callbacks; it tries fresh
//!   data against the kernel directly when the queue is empty and arms
//!   writable interest exactly when bytes are left behind.
//! * **Stale-event skipping.** Every dispatch re-checks the target's
//!   closed flag, because an earlier event in the same batch may have
//!   closed it.
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//! use std::rc::Rc;
//!
//! use evsock::{Conn, Handler, ReadResult, Reactor, WriteItem};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_readable(&mut self, conn: &Rc<Conn>) {
//!         match conn.read(4096) {
//!             ReadResult::Data(data) => {
//!                 conn.write(WriteItem::Bytes(data));
//!             }
//!             ReadResult::WouldBlock => {}
//!             ReadResult::Closed => {
//!                 conn.close("peer_gone");
//!             }
//!         }
//!     }
//!
//!     fn on_error(&mut self, conn: &Rc<Conn>) {
//!         conn.close("socket_error");
//!     }
//!
//!     fn on_hangup(&mut self, conn: &Rc<Conn>) {
//!         conn.close("hangup");
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let reactor = Reactor::new()?;
//!     let (sock, _peer) = UnixStream::pair()?;
//!     sock.set_nonblocking(true)?;
//!     let conn = Conn::new(&reactor, sock, Echo)?;
//!     conn.watch_read(true);
//!     reactor.event_loop();
//!     Ok(())
//! }
//! ```

mod backend;
mod conn;
mod epoll;
mod event;
mod interest;
mod poll;
mod utils;

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use nix::sys::eventfd::{EfdFlags, EventFd};
use rustc_hash::FxHashMap;

pub use crate::backend::BackendKind;
pub use crate::conn::{Conn, Handler, ReadResult, WriteItem};
pub use crate::interest::{interest, Interest};

use crate::backend::Backend;
use crate::event::Event;

/// Upper bound on events taken from the backend per loop pass.
pub(crate) const EVENT_BATCH: usize = 256;

/// The reactor: one readiness backend, a registry of the connections it
/// owns, a map of foreign descriptors watched on behalf of the embedder,
/// and the deferred-close list.
///
/// Cloning is cheap and yields another handle onto the same reactor. All
/// state is single-threaded; one reactor drives one loop.
#[derive(Clone)]
pub struct Reactor {
    shared: Rc<Shared>,
}

struct Shared {
    backend: Backend,
    conns: RefCell<FxHashMap<RawFd, Rc<Conn>>>,
    other_fds: RefCell<FxHashMap<RawFd, OtherFd>>,
    to_close: RefCell<Vec<OwnedFd>>,
    events: RefCell<Vec<Event>>,
    wake: Arc<EventFd>,
    wake_fd: RawFd,
    stopped: Cell<bool>,
    dispatching: Cell<bool>,
    debug: Cell<u8>,
}

/// A raw descriptor the loop watches for readability on behalf of the
/// embedder. The callback is taken out of the entry while it runs so it
/// may add or remove foreign fds itself.
struct OtherFd {
    callback: Option<Box<dyn FnMut()>>,
    registered: bool,
}

/// Stops a running [`Reactor::event_loop`], from any thread.
#[derive(Clone)]
pub struct StopHandle {
    wake: Arc<EventFd>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.wake.write(1);
    }
}

impl Reactor {
    /// Creates a reactor on the preferred backend, falling back to
    /// `poll(2)` when epoll is unavailable. The choice is fixed for the
    /// reactor's lifetime.
    pub fn new() -> io::Result<Self> {
        Self::build(Backend::open())
    }

    /// Creates a reactor on a specific backend instead of probing.
    pub fn with_backend(kind: BackendKind) -> io::Result<Self> {
        Self::build(Backend::open_kind(kind)?)
    }

    fn build(backend: Backend) -> io::Result<Self> {
        let wake = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        let wake_fd = wake.as_fd().as_raw_fd();
        backend.register(wake_fd, interest().read())?;

        Ok(Self {
            shared: Rc::new(Shared {
                backend,
                conns: RefCell::new(FxHashMap::default()),
                other_fds: RefCell::new(FxHashMap::default()),
                to_close: RefCell::new(Vec::new()),
                events: RefCell::new(Vec::with_capacity(EVENT_BATCH)),
                wake: Arc::new(wake),
                wake_fd,
                stopped: Cell::new(false),
                dispatching: Cell::new(false),
                debug: Cell::new(0),
            }),
        })
    }

    /// Which backend this reactor ended up with.
    pub fn backend_kind(&self) -> BackendKind {
        self.shared.backend.kind()
    }

    pub fn uses_epoll(&self) -> bool {
        self.backend_kind() == BackendKind::Epoll
    }

    /// Number of connections currently in the registry.
    pub fn watched_sockets(&self) -> usize {
        self.shared.conns.borrow().len()
    }

    /// A snapshot of the descriptor registry.
    pub fn descriptor_map(&self) -> FxHashMap<RawFd, Rc<Conn>> {
        self.shared.conns.borrow().clone()
    }

    /// Descriptors whose close was deferred and not yet drained.
    pub fn pending_close(&self) -> Vec<RawFd> {
        self.shared
            .to_close
            .borrow()
            .iter()
            .map(|sock| sock.as_raw_fd())
            .collect()
    }

    /// Watches a raw descriptor that is not a full connection; `callback`
    /// runs whenever it turns readable. The fd is registered with the
    /// backend on the next loop pass.
    pub fn add_other_fd(&self, fd: RawFd, callback: impl FnMut() + 'static) {
        self.shared.other_fds.borrow_mut().insert(
            fd,
            OtherFd {
                callback: Some(Box::new(callback)),
                registered: false,
            },
        );
    }

    pub fn remove_other_fd(&self, fd: RawFd) {
        if let Some(entry) = self.shared.other_fds.borrow_mut().remove(&fd) {
            if entry.registered {
                if let Err(e) = self.shared.backend.unregister(fd) {
                    warn!("failed to unregister foreign fd {fd}: {e}");
                }
            }
        }
    }

    /// Number of foreign descriptors currently tracked.
    pub fn other_fds(&self) -> usize {
        self.shared.other_fds.borrow().len()
    }

    /// Diagnostic verbosity. Level 1 reports closes and unexpected socket
    /// errors, level 2 adds per-pass tracing. The records go to the `log`
    /// facade; the embedder picks the transport.
    pub fn set_debug_level(&self, level: u8) {
        self.shared.debug.set(level);
    }

    pub fn debug_level(&self) -> u8 {
        self.shared.debug.get()
    }

    /// A handle that makes [`event_loop`](Reactor::event_loop) return.
    /// Safe to fire from another thread or a signal context.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            wake: Arc::clone(&self.shared.wake),
        }
    }

    /// Runs the loop until a [`StopHandle`] fires. Backend failures are
    /// logged and the wait restarts; they never end the loop.
    pub fn event_loop(&self) {
        while !self.shared.stopped.get() {
            if let Err(e) = self.loop_once(None) {
                warn!("backend wait failed: {e}");
            }
        }
        self.shared.stopped.set(false);
    }

    /// One pass: registers fresh foreign fds, waits for a batch (`None`
    /// blocks until something is ready), dispatches it in backend order,
    /// then releases every socket whose close was deferred during the
    /// batch. Returns the number of events dispatched to connections.
    pub fn loop_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let sh = &*self.shared;
        if sh.dispatching.get() {
            panic!("recursive call to loop_once");
        }

        self.register_other_fds();

        let n = {
            let mut events = sh.events.borrow_mut();
            sh.backend.wait(&mut events, timeout)?
        };
        if sh.debug.get() >= 2 {
            trace!("loop pass: {n} events ready");
        }

        sh.dispatching.set(true);
        let mut dispatched = 0;
        for i in 0..n {
            let ev = sh.events.borrow()[i];

            if ev.fd() == sh.wake_fd {
                let _ = sh.wake.read();
                sh.stopped.set(true);
                continue;
            }

            let owner = sh.conns.borrow().get(&ev.fd()).cloned();
            if let Some(conn) = owner {
                // An earlier event in this batch may have closed the
                // owner; its fd number must not be dispatched again.
                if conn.is_closed() {
                    continue;
                }
                conn.dispatch(ev.ready());
                dispatched += 1;
                continue;
            }

            self.run_other_fd(ev.fd());
        }
        sh.dispatching.set(false);

        self.drain_deferred_close();
        Ok(dispatched)
    }

    fn register_other_fds(&self) {
        let mut others = self.shared.other_fds.borrow_mut();
        for (fd, entry) in others.iter_mut() {
            if entry.registered {
                continue;
            }
            match self.shared.backend.register(*fd, interest().read()) {
                Ok(()) => entry.registered = true,
                Err(e) => warn!("failed to register foreign fd {fd}: {e}"),
            }
        }
    }

    fn run_other_fd(&self, fd: RawFd) {
        let callback = self
            .shared
            .other_fds
            .borrow_mut()
            .get_mut(&fd)
            .and_then(|entry| entry.callback.take());
        let Some(mut callback) = callback else {
            return;
        };
        callback();
        // Restore it unless the entry went away (or was replaced) while
        // the callback ran.
        if let Some(entry) = self.shared.other_fds.borrow_mut().get_mut(&fd) {
            if entry.callback.is_none() {
                entry.callback = Some(callback);
            }
        }
    }

    fn drain_deferred_close(&self) {
        // One at a time: a close performed while we drain must be free to
        // push onto the list.
        loop {
            let sock = self.shared.to_close.borrow_mut().pop();
            match sock {
                Some(sock) => drop(sock),
                None => break,
            }
        }
    }

    pub(crate) fn adopt_conn(&self, conn: Rc<Conn>) -> io::Result<()> {
        let fd = conn.fd();
        if self.shared.conns.borrow().contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already owned by a connection",
            ));
        }
        self.shared.backend.register(fd, conn.interests())?;
        self.shared.conns.borrow_mut().insert(fd, conn);
        Ok(())
    }

    pub(crate) fn forget_conn(&self, fd: RawFd) {
        if let Err(e) = self.shared.backend.unregister(fd) {
            warn!("failed to unregister fd {fd}: {e}");
        }
        self.shared.conns.borrow_mut().remove(&fd);
    }

    pub(crate) fn update_interest(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
        self.shared.backend.modify(fd, mask)
    }

    pub(crate) fn defer_close(&self, sock: OwnedFd) {
        self.shared.to_close.borrow_mut().push(sock);
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new().expect("failed to create reactor")
    }
}

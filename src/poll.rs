use std::cell::RefCell;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::{Event, Interest, EVENT_BATCH};

/// The portable fallback backend over `poll(2)`.
///
/// Interest updates are O(1) against an in-process list; the pollfd array
/// is rebuilt on every wait, which is O(n) in watched descriptors. The
/// readiness semantics are identical to the epoll backend: level
/// triggered, `ERR`/`HUP` reported regardless of the requested mask.
pub(crate) struct PollBackend {
    entries: RefCell<Vec<(RawFd, Interest)>>,
}

impl PollBackend {
    pub(crate) fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
        let mut entries = self.entries.borrow_mut();
        if entries.iter().any(|(f, _)| *f == fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered",
            ));
        }
        entries.push((fd, mask));
        Ok(())
    }

    pub(crate) fn modify(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
        let mut entries = self.entries.borrow_mut();
        match entries.iter_mut().find(|(f, _)| *f == fd) {
            Some(entry) => {
                entry.1 = mask;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered")),
        }
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(f, _)| *f != fd);
        if entries.len() == before {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered"));
        }
        Ok(())
    }

    pub(crate) fn wait(
        &self,
        out: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let snapshot: Vec<(RawFd, Interest)> = self.entries.borrow().clone();

        let mut pollfds: Vec<PollFd> = snapshot
            .iter()
            .map(|(fd, mask)| {
                // The entry list only holds descriptors their owners keep
                // open until the post-batch close drain.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, to_poll(*mask))
            })
            .collect();

        let n = match poll(&mut pollfds, to_timeout(timeout)) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(io::Error::from(e)),
        };

        out.clear();
        if n > 0 {
            for (pfd, (fd, _)) in pollfds.iter().zip(snapshot.iter()) {
                let Some(revents) = pfd.revents() else {
                    continue;
                };
                if revents.is_empty() {
                    continue;
                }
                out.push(Event::new(*fd, from_poll(revents)));
                if out.len() == EVENT_BATCH {
                    break;
                }
            }
        }
        Ok(out.len())
    }
}

fn to_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
    }
}

fn to_poll(mask: Interest) -> PollFlags {
    // POLLERR/POLLHUP are output-only; the kernel reports them on its own.
    let mut flags = PollFlags::empty();
    if mask.contains(Interest::READ) {
        flags |= PollFlags::POLLIN;
    }
    if mask.contains(Interest::WRITE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn from_poll(flags: PollFlags) -> Interest {
    let mut mask = Interest::empty();
    if flags.contains(PollFlags::POLLIN) {
        mask = mask.read();
    }
    if flags.contains(PollFlags::POLLOUT) {
        mask = mask.write();
    }
    if flags.contains(PollFlags::POLLERR) {
        mask = mask.err();
    }
    if flags.contains(PollFlags::POLLHUP) {
        mask = mask.hup();
    }
    mask
}

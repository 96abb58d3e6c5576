use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::utils::epoll_ctl;
use crate::{Event, Interest, EVENT_BATCH};

/// The scalable backend: level-triggered epoll with O(1) interest updates.
///
/// The fd itself rides in `epoll_event.data`, so dispatch needs no side
/// lookup to recover the descriptor a notification belongs to.
pub(crate) struct EpollBackend {
    epoll: Epoll,
}

impl EpollBackend {
    pub(crate) fn open() -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?,
        })
    }

    pub(crate) fn register(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
        let ev = EpollEvent::new(to_epoll(mask), fd as u64);
        epoll_ctl(&self.epoll, libc::EPOLL_CTL_ADD, fd, Some(ev))
    }

    pub(crate) fn modify(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
        let ev = EpollEvent::new(to_epoll(mask), fd as u64);
        epoll_ctl(&self.epoll, libc::EPOLL_CTL_MOD, fd, Some(ev))
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> io::Result<()> {
        // Null event pointer, the documented form for EPOLL_CTL_DEL.
        epoll_ctl(&self.epoll, libc::EPOLL_CTL_DEL, fd, None)
    }

    pub(crate) fn wait(
        &self,
        out: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut buf = [EpollEvent::empty(); EVENT_BATCH];
        let n = match self.epoll.wait(&mut buf, to_timeout(timeout)) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(io::Error::from(e)),
        };

        out.clear();
        for ev in &buf[..n] {
            out.push(Event::new(ev.data() as RawFd, from_epoll(ev.events())));
        }
        Ok(n)
    }
}

fn to_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(d) => EpollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
    }
}

fn to_epoll(mask: Interest) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if mask.contains(Interest::READ) {
        flags |= EpollFlags::EPOLLIN;
    }
    if mask.contains(Interest::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    if mask.contains(Interest::ERR) {
        flags |= EpollFlags::EPOLLERR;
    }
    if mask.contains(Interest::HUP) {
        flags |= EpollFlags::EPOLLHUP;
    }
    flags
}

fn from_epoll(flags: EpollFlags) -> Interest {
    let mut mask = Interest::empty();
    if flags.contains(EpollFlags::EPOLLIN) {
        mask = mask.read();
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        mask = mask.write();
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        mask = mask.err();
    }
    if flags.contains(EpollFlags::EPOLLHUP) {
        mask = mask.hup();
    }
    mask
}

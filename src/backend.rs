use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use log::debug;

use crate::epoll::EpollBackend;
use crate::poll::PollBackend;
use crate::{Event, Interest};

/// Which readiness backend a [`Reactor`](crate::Reactor) ended up with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BackendKind {
    /// The scalable epoll backend.
    Epoll,
    /// The portable `poll(2)` fallback.
    Poll,
}

/// The readiness backend behind a reactor. Selected once at construction
/// and fixed for the reactor's lifetime.
pub(crate) enum Backend {
    Epoll(EpollBackend),
    Poll(PollBackend),
}

impl Backend {
    /// Tries the scalable backend first, falling back to the portable one
    /// when the system refuses it.
    pub(crate) fn open() -> Self {
        match EpollBackend::open() {
            Ok(epoll) => Self::Epoll(epoll),
            Err(e) => {
                debug!("epoll unavailable ({e}), falling back to poll");
                Self::Poll(PollBackend::new())
            }
        }
    }

    pub(crate) fn open_kind(kind: BackendKind) -> io::Result<Self> {
        match kind {
            BackendKind::Epoll => Ok(Self::Epoll(EpollBackend::open()?)),
            BackendKind::Poll => Ok(Self::Poll(PollBackend::new())),
        }
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            Self::Epoll(_) => BackendKind::Epoll,
            Self::Poll(_) => BackendKind::Poll,
        }
    }

    pub(crate) fn register(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
        match self {
            Self::Epoll(b) => b.register(fd, mask),
            Self::Poll(b) => b.register(fd, mask),
        }
    }

    pub(crate) fn modify(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
        match self {
            Self::Epoll(b) => b.modify(fd, mask),
            Self::Poll(b) => b.modify(fd, mask),
        }
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> io::Result<()> {
        match self {
            Self::Epoll(b) => b.unregister(fd),
            Self::Poll(b) => b.unregister(fd),
        }
    }

    /// Blocks until at least one descriptor is ready or the timeout lapses,
    /// filling `out` with the batch. `EINTR` is treated as an empty batch.
    pub(crate) fn wait(
        &self,
        out: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        match self {
            Self::Epoll(b) => b.wait(out, timeout),
            Self::Poll(b) => b.wait(out, timeout),
        }
    }
}

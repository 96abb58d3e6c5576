use std::os::fd::RawFd;

use crate::Interest;

/// One readiness notification: a file descriptor and the conditions that
/// hold for it right now.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Event {
    pub(crate) fd: RawFd,
    pub(crate) ready: Interest,
}

impl Event {
    pub(crate) const fn new(fd: RawFd, ready: Interest) -> Self {
        Self { fd, ready }
    }

    /// The descriptor this event refers to.
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// The raw readiness mask.
    pub const fn ready(&self) -> Interest {
        self.ready
    }

    /// Returns `true` if the descriptor is readable.
    pub const fn is_readable(&self) -> bool {
        self.ready.contains(Interest::READ)
    }

    /// Returns `true` if the descriptor is writable.
    pub const fn is_writable(&self) -> bool {
        self.ready.contains(Interest::WRITE)
    }

    /// Returns `true` if an error condition is pending. Reported even when
    /// not requested.
    pub const fn is_error(&self) -> bool {
        self.ready.contains(Interest::ERR)
    }

    /// Returns `true` if the peer hung up. Reported even when not
    /// requested.
    pub const fn is_hangup(&self) -> bool {
        self.ready.contains(Interest::HUP)
    }
}

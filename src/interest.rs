use bitflags::bitflags;

bitflags! {
    /// The set of readiness conditions registered for a file descriptor.
    ///
    /// Backend-neutral: the epoll backend maps these onto `EPOLL*` flags,
    /// the poll backend onto `POLL*` flags. `ERR` and `HUP` are reported by
    /// the kernel whether or not they were requested; connections carry
    /// them from construction so the registered mask reflects reality.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct Interest: u8 {
        /// The descriptor is readable without blocking.
        const READ = 1 << 0;
        /// The descriptor is writable without blocking.
        const WRITE = 1 << 1;
        /// An error condition is pending on the descriptor.
        const ERR = 1 << 2;
        /// The peer hung up.
        const HUP = 1 << 3;
    }
}

impl Interest {
    const fn add(self, flags: Self) -> Self {
        self.union(flags)
    }

    const fn sub(self, flags: Self) -> Self {
        self.difference(flags)
    }

    /// Adds interest in readable events.
    pub const fn read(self) -> Self {
        self.add(Self::READ)
    }

    /// Adds interest in writable events.
    pub const fn write(self) -> Self {
        self.add(Self::WRITE)
    }

    /// Adds interest in error conditions.
    pub const fn err(self) -> Self {
        self.add(Self::ERR)
    }

    /// Adds interest in peer hangup.
    pub const fn hup(self) -> Self {
        self.add(Self::HUP)
    }

    /// Removes interest in readable events.
    pub const fn remove_read(self) -> Self {
        self.sub(Self::READ)
    }

    /// Removes interest in writable events.
    pub const fn remove_write(self) -> Self {
        self.sub(Self::WRITE)
    }
}

/// Creates a new, empty [`Interest`] set.
///
/// Start here and chain the builder methods:
///
/// ```
/// use evsock::{interest, Interest};
///
/// let mask = interest().read().err().hup();
/// assert!(mask.contains(Interest::READ));
/// assert!(!mask.contains(Interest::WRITE));
/// ```
pub const fn interest() -> Interest {
    Interest::empty()
}

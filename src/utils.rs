use std::os::fd::{AsRawFd, RawFd};
use std::{io, ptr};

use nix::libc;
use nix::sys::epoll::{Epoll, EpollEvent};

/// Thin wrapper over the raw syscall so that delete can pass a null event
/// pointer, the form documented for `EPOLL_CTL_DEL`.
pub(crate) fn epoll_ctl(
    epfd: &Epoll,
    op: i32,
    fd: RawFd,
    mut event: Option<EpollEvent>,
) -> io::Result<()> {
    let event = match &mut event {
        Some(ev) => ev as *mut EpollEvent as *mut libc::epoll_event,
        None => ptr::null_mut(),
    };
    let ret = unsafe { libc::epoll_ctl(epfd.0.as_raw_fd(), op, fd, event) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets or clears `TCP_CORK` on a stream socket.
pub(crate) fn set_tcp_cork(fd: RawFd, on: bool) -> io::Result<()> {
    let val: libc::c_int = on as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

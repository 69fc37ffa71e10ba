//! Shared epoll instance and interest masks.
//!
//! One kernel epoll object is polled concurrently by every reactor worker.
//! Accept and receive readiness are edge-triggered; the send path is
//! level-triggered so a partially drained buffer keeps re-triggering until
//! it empties (the drain handler then drops `EPOLLOUT` interest, since a
//! writable socket would otherwise fire continuously).

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

/// Registered interest for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    /// Recv-only, edge-triggered. The steady state of an idle connection.
    Recv,
    /// Send+recv, level-triggered. Active while the pending-send buffer is
    /// non-empty.
    SendRecv,
}

impl Interest {
    pub(crate) fn mask(self) -> EpollFlags {
        match self {
            Interest::Recv => {
                EpollFlags::EPOLLIN
                    | EpollFlags::EPOLLHUP
                    | EpollFlags::EPOLLRDHUP
                    | EpollFlags::EPOLLET
            }
            Interest::SendRecv => {
                EpollFlags::EPOLLIN
                    | EpollFlags::EPOLLOUT
                    | EpollFlags::EPOLLHUP
                    | EpollFlags::EPOLLRDHUP
            }
        }
    }
}

/// Mask for listening sockets (edge-triggered accept readiness).
pub(crate) fn listener_mask() -> EpollFlags {
    EpollFlags::EPOLLIN
        | EpollFlags::EPOLLPRI
        | EpollFlags::EPOLLHUP
        | EpollFlags::EPOLLRDHUP
        | EpollFlags::EPOLLET
}

/// Mask for the shutdown self-pipe.
pub(crate) fn closer_mask() -> EpollFlags {
    EpollFlags::EPOLLIN
        | EpollFlags::EPOLLPRI
        | EpollFlags::EPOLLHUP
        | EpollFlags::EPOLLRDHUP
        | EpollFlags::EPOLLET
}

/// Thin wrapper over the shared epoll fd.
///
/// All operations take raw fds: registrations outlive any one borrow of the
/// owning socket, and teardown paths race by design (the `forget` path
/// swallows the benign errnos those races produce).
pub(crate) struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll })
    }

    pub(crate) fn register(&self, fd: RawFd, mask: EpollFlags) -> Result<(), Errno> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(borrowed, EpollEvent::new(mask, fd as u64))
    }

    pub(crate) fn modify(&self, fd: RawFd, mask: EpollFlags) -> Result<(), Errno> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(mask, fd as u64);
        self.epoll.modify(borrowed, &mut event)
    }

    /// Drop a registration. `ENOENT`/`EBADF` mean another thread already won
    /// the teardown race and are not errors.
    pub(crate) fn forget(&self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
            Err(err) => {
                tracing::warn!(fd, error = %err, "epoll deregistration failed");
            }
        }
    }

    pub(crate) fn wait(
        &self,
        events: &mut [EpollEvent],
        timeout: EpollTimeout,
    ) -> Result<usize, Errno> {
        self.epoll.wait(events, timeout)
    }
}

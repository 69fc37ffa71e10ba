//! Shutdown self-pipe.
//!
//! A connected socket pair registered in the epoll set lets `close()` break
//! worker threads out of a blocked `epoll_wait` without closing the shared
//! epoll fd under them. One token is sent per worker; the single worker that
//! consumes that wake-up answers with its own index, so the coordinator joins
//! exactly the thread that exited.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

/// Coordinator side of the shutdown handshake.
pub(crate) struct ShutdownCoordinator {
    control: UnixStream,
    worker_side: UnixStream,
}

impl ShutdownCoordinator {
    pub(crate) fn new() -> std::io::Result<Self> {
        let (control, worker_side) = UnixStream::pair()?;
        // A worker that already exited (fatal policy) can never answer;
        // bound the wait so close() falls through to plain joins.
        control.set_read_timeout(Some(std::time::Duration::from_secs(5)))?;
        Ok(Self {
            control,
            worker_side,
        })
    }

    /// The end workers answer on; registered in the epoll set.
    pub(crate) fn worker_side(&self) -> std::io::Result<UnixStream> {
        self.worker_side.try_clone()
    }

    /// One blocking round-trip: send a close token, read back the index of
    /// the worker that consumed it.
    pub(crate) fn request_stop(&mut self) -> std::io::Result<u64> {
        self.control.write_all(b"c")?;
        let mut reply = [0u8; 8];
        self.control.read_exact(&mut reply)?;
        Ok(u64::from_be_bytes(reply))
    }
}

/// Worker-side acknowledgment, written from inside the reactor loop.
pub(crate) fn acknowledge(stream: &UnixStream, worker_index: u64) {
    let mut writer = stream;
    if let Err(err) = writer.write_all(&worker_index.to_be_bytes()) {
        tracing::warn!(worker = worker_index, error = %err, "shutdown ack failed");
    }
}

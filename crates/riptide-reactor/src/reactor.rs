//! The reactor: worker threads sharing one epoll instance.
//!
//! Every worker runs the same dispatch loop over the shared kernel readiness
//! queue. Readiness for a given fd is usually delivered to a single waiting
//! thread per edge, but that is a platform observation, not a guarantee; the
//! per-connection locks in [`Connection`] are what actually serialize the
//! receive and send paths.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::sys::epoll::{EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{accept4, recv, send, shutdown, MsgFlags, Shutdown, SockFlag};
use riptide_config::{EngineConfig, FatalPolicy};
use tracing::{debug, error, info, warn};

use crate::closer;
use crate::event::{Event, EventQueue};
use crate::poller::{closer_mask, listener_mask, Interest, Poller};
use crate::tables::{Connection, Listener, Tables};

/// Shared engine state: one epoll set, the bookkeeping tables, the outbound
/// event queue, and the run/debug flags handed to every worker.
pub(crate) struct Reactor {
    pub(crate) poller: Poller,
    pub(crate) tables: Tables,
    pub(crate) queue: EventQueue,
    pub(crate) running: AtomicBool,
    pub(crate) debug_mode: AtomicBool,
    pub(crate) config: EngineConfig,
    closer: OnceLock<UnixStream>,
}

impl Reactor {
    pub(crate) fn new(config: EngineConfig) -> std::io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            tables: Tables::new(),
            queue: EventQueue::new(),
            running: AtomicBool::new(false),
            debug_mode: AtomicBool::new(false),
            config,
            closer: OnceLock::new(),
        })
    }

    /// Queue a diagnostic event; discarded unless debug mode is on.
    pub(crate) fn debug_event(&self, message: impl Into<String>) {
        if self.debug_mode.load(Ordering::Relaxed) {
            self.queue.push(Event::Debug {
                message: message.into(),
            });
        }
    }

    /// Register the worker-facing end of the shutdown pair.
    pub(crate) fn install_closer(&self, stream: UnixStream) -> Result<(), Errno> {
        use std::os::fd::AsRawFd;
        self.poller.register(stream.as_raw_fd(), closer_mask())?;
        let _ = self.closer.set(stream);
        Ok(())
    }

    fn closer_fd(&self) -> Option<RawFd> {
        use std::os::fd::AsRawFd;
        self.closer.get().map(|stream| stream.as_raw_fd())
    }

    /// Put a listener into the epoll set, once.
    pub(crate) fn register_listener(&self, listener: &Listener) -> Result<(), Errno> {
        if listener.registered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.poller.register(listener.fd(), listener_mask()) {
            listener.registered.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------

    pub(crate) fn run_worker(self: Arc<Self>, index: u64) {
        let mut events = vec![EpollEvent::empty(); self.config.max_events.max(1)];
        let mut alive = true;
        debug!(worker = index, "reactor worker started");

        while alive {
            let ready = match self.poller.wait(&mut events, EpollTimeout::NONE) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    error!(worker = index, error = %err, "epoll_wait failed");
                    break;
                }
            };

            for event in &events[..ready] {
                let fd = event.data() as RawFd;
                let flags = event.events();

                if Some(fd) == self.closer_fd() {
                    if let Some(stream) = self.closer.get() {
                        closer::acknowledge(stream, index);
                    }
                    // Finish the batch before exiting: it may carry teardown
                    // work for sockets this server is shutting down.
                    alive = false;
                    continue;
                }

                if let Err(err) = self.dispatch(fd, flags) {
                    warn!(worker = index, fd, error = %err, "event dispatch failed");
                    self.debug_event(format!("[{fd}] dispatch error: {err}"));
                    if self.config.fatal_policy == FatalPolicy::Terminate {
                        alive = false;
                    }
                }
            }
        }

        debug!(worker = index, "reactor worker exiting");
    }

    /// Handle one readiness notification. `Err` carries only errnos the §7
    /// classification below does not recognize; the worker's fatal policy
    /// decides what happens next.
    fn dispatch(&self, fd: RawFd, flags: EpollFlags) -> Result<(), Errno> {
        if let Some(listener) = self.tables.listener(fd) {
            if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
                self.teardown_listener(&listener);
            } else if flags.contains(EpollFlags::EPOLLIN) {
                self.handle_accept(&listener)?;
            } else {
                self.debug_event(format!(
                    "listener got unknown event mask: {:#06x}",
                    flags.bits()
                ));
            }
            return Ok(());
        }

        if let Some(conn) = self.tables.connection(fd) {
            let mut torn_down = false;

            if flags.contains(EpollFlags::EPOLLOUT) && !self.handle_send(&conn)? {
                torn_down = self.teardown_connection(fd);
            }

            if flags.contains(EpollFlags::EPOLLIN) && !torn_down && !self.handle_recv(&conn)? {
                torn_down = self.teardown_connection(fd);
            }

            if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) && !torn_down {
                self.debug_event(format!("[{fd}] hang-up"));
                self.teardown_connection(fd);
            }
            return Ok(());
        }

        self.debug_event(format!(
            "[{fd}] wake-up for unknown fd, mask {:#06x}",
            flags.bits()
        ));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accept
    // ------------------------------------------------------------------

    fn handle_accept(&self, listener: &Arc<Listener>) -> Result<(), Errno> {
        loop {
            match accept4(
                listener.fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => {
                    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
                    let conn = Arc::new(Connection::new(sock, listener.fd()));
                    self.tables.add_connection(Arc::clone(&conn));
                    // Accepted must hit the queue before any Received can:
                    // push first, then arm the fd.
                    self.queue.push(Event::Accepted { fd });
                    if let Err(err) = self.poller.register(fd, Interest::Recv.mask()) {
                        warn!(fd, error = %err, "failed to register accepted socket");
                        self.teardown_connection(fd);
                        continue;
                    }
                    debug!(fd, listener = listener.fd(), "accepted connection");
                }
                Err(Errno::EAGAIN) => break,
                // Peer gave up between the kernel queue and our accept.
                Err(Errno::ECONNABORTED) => continue,
                // Listener torn down by a racing thread.
                Err(Errno::EBADF) | Err(Errno::EINVAL) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// One `recv` per wake-up, under the connection's receive lock.
    /// Returns `Ok(false)` when the connection should be torn down.
    fn handle_recv(&self, conn: &Arc<Connection>) -> Result<bool, Errno> {
        let _serialized = conn.recv_lock.lock().unwrap();

        let mut connected = true;
        let mut would_block = false;
        let mut received: Option<Vec<u8>> = None;

        let mut buf = vec![0u8; self.config.buffer_size];
        match recv(conn.fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => {
                self.debug_event(format!("[{}] recv returned 0 bytes, peer closed", conn.fd()));
                connected = false;
            }
            Ok(len) => {
                buf.truncate(len);
                received = Some(buf);
            }
            Err(Errno::EAGAIN) => would_block = true,
            Err(Errno::EBADF) => connected = false,
            // Reset mid-read: the kernel will deliver the hang-up next; let
            // that path do the teardown.
            Err(Errno::ECONNRESET) => {
                self.debug_event(format!("[{}] recv connection reset", conn.fd()));
            }
            Err(err) => return Err(err),
        }

        if !would_block && connected {
            // Re-arm the edge: EPOLL_CTL_MOD re-checks readiness, so bytes
            // still queued in the kernel raise a fresh event even though we
            // only read once per wake-up.
            let mask = conn.interest.lock().unwrap().mask();
            match self.poller.modify(conn.fd(), mask) {
                Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
                Err(err) => return Err(err),
            }
        }

        if let Some(bytes) = received {
            self.queue.push(Event::Received { fd: conn.fd(), bytes });
        }

        Ok(connected)
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Append outbound bytes and make sure write-readiness is armed.
    /// Unknown fds are dropped silently: the connection may legitimately be
    /// gone by the time the caller reacts to an event.
    pub(crate) fn send(&self, fd: RawFd, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(conn) = self.tables.connection(fd) else {
            self.debug_event(format!("[{fd}] send on unknown connection, dropped"));
            return;
        };

        conn.send_buffer.lock().unwrap().extend_from_slice(data);

        let _serialized = conn.send_lock.lock().unwrap();
        match self.set_interest(&conn, Interest::SendRecv) {
            Ok(()) => {}
            Err(Errno::ENOENT) | Err(Errno::EBADF) => {
                self.debug_event(format!("[{fd}] send raced connection teardown"));
            }
            Err(err) => {
                warn!(fd, error = %err, "failed to arm write interest");
                self.debug_event(format!("[{fd}] arm write interest: {err}"));
            }
        }
    }

    /// Drain one send attempt, under the connection's send lock.
    /// Returns `Ok(false)` when the connection should be torn down.
    fn handle_send(&self, conn: &Arc<Connection>) -> Result<bool, Errno> {
        let _serialized = conn.send_lock.lock().unwrap();

        let mut connected = true;

        // Swap the whole buffer out; new sends may append while the syscall
        // runs, and any unsent remainder is prefixed back in front of them.
        let outgoing = {
            let mut buffer = conn.send_buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };

        if !outgoing.is_empty() {
            match send(conn.fd(), &outgoing, MsgFlags::MSG_NOSIGNAL) {
                Ok(sent) if sent < outgoing.len() => conn.requeue_front(&outgoing[sent..]),
                Ok(_) => {}
                Err(Errno::EAGAIN) => conn.requeue_front(&outgoing),
                // Reset/broken pipe: swallowed here; the kernel's hang-up
                // notification performs the actual teardown shortly after.
                Err(Errno::ECONNRESET) | Err(Errno::EPIPE) | Err(Errno::ECONNABORTED) => {
                    self.debug_event(format!("[{}] send on reset connection", conn.fd()));
                }
                Err(Errno::EBADF) => connected = false,
                Err(err) => return Err(err),
            }
        }

        if connected {
            let drained = conn.send_buffer.lock().unwrap().is_empty();
            if drained {
                // Writable is the common state; a standing EPOLLOUT interest
                // would fire on every wait, so drop it as soon as we drain.
                match self.set_interest(conn, Interest::Recv) {
                    Ok(()) | Err(Errno::ENOENT) => {}
                    Err(Errno::EBADF) => connected = false,
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(connected)
    }

    fn set_interest(&self, conn: &Connection, want: Interest) -> Result<(), Errno> {
        let mut current = conn.interest.lock().unwrap();
        if *current == want {
            return Ok(());
        }
        self.poller.modify(conn.fd(), want.mask())?;
        *current = want;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Gracefully shut a client down; the resulting hang-up event performs
    /// the table teardown.
    pub(crate) fn shutdown_client(&self, fd: RawFd) {
        let Some(conn) = self.tables.connection(fd) else {
            return;
        };
        match shutdown(conn.fd(), Shutdown::Both) {
            Ok(()) | Err(Errno::ENOTCONN) | Err(Errno::EBADF) => {}
            Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => {
                self.debug_event(format!("[{fd}] shutdown_client on reset connection"));
            }
            Err(err) => {
                warn!(fd, error = %err, "shutdown_client failed");
                self.debug_event(format!("[{fd}] shutdown_client: {err}"));
            }
        }
    }

    /// Remove a connection everywhere and emit its one `ClientClosed`.
    /// Idempotent: only the caller that wins the table removal emits.
    pub(crate) fn teardown_connection(&self, fd: RawFd) -> bool {
        let Some(conn) = self.tables.remove_connection(fd) else {
            return false;
        };
        self.poller.forget(fd);

        // Wait out any in-flight handler so ClientClosed is the last event
        // this connection produces.
        drop(conn.recv_lock.lock().unwrap());
        drop(conn.send_lock.lock().unwrap());

        let unsent = conn.send_buffer.lock().unwrap().len();
        if unsent > 0 {
            self.debug_event(format!("[{fd}] removed with {unsent} unsent bytes"));
        }

        // The socket fd itself closes when the last Arc<Connection> drops.
        self.queue.push(Event::ClientClosed { fd });
        debug!(fd, "connection closed");
        true
    }

    /// Shut down every client a listener owns, then remove the listener.
    pub(crate) fn teardown_listener(&self, listener: &Arc<Listener>) {
        let owned: Vec<RawFd> = listener.clients.iter().map(|entry| *entry).collect();
        for fd in owned {
            self.shutdown_client(fd);
        }
        if self.tables.remove_listener(listener.fd()).is_some() {
            self.poller.forget(listener.fd());
            info!(fd = listener.fd(), addr = %listener.addr, "listener closed");
        }
    }

    /// Teardown for everything the workers did not get to before exiting.
    /// Runs on the `close()` caller after the worker join.
    pub(crate) fn drain_remaining(&self) {
        for fd in self.tables.connection_fds() {
            self.teardown_connection(fd);
        }
        for fd in self.tables.listener_fds() {
            if self.tables.remove_listener(fd).is_some() {
                self.poller.forget(fd);
            }
        }
    }
}

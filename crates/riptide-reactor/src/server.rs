//! Public server façade.
//!
//! `EpollServer` composes the tables, the shared epoll set, the worker pool
//! and the event queue behind the blocking `listen`/`start`/`recv`/`send`
//! surface. `listen` and `start` may be called in either order: listeners
//! added before `start` are registered when the workers spawn, later ones
//! immediately.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::socket::{shutdown, Shutdown};
use riptide_config::EngineConfig;
use socket2::{Domain, Socket, Type};
use tracing::{info, warn};

use crate::closer::ShutdownCoordinator;
use crate::event::Event;
use crate::reactor::Reactor;
use crate::tables::Listener;
use crate::{Result, ServerError};

/// Maximum workers the auto sizing will pick (preserve cores for the
/// application threads consuming the queue).
pub const MAX_WORKER_THREADS: usize = 4;

/// Calculate default worker count: min(cpu_cores / 2, MAX_WORKER_THREADS)
pub fn default_worker_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_WORKER_THREADS)
}

/// The epoll-based multi-threaded TCP reactor engine.
pub struct EpollServer {
    reactor: Arc<Reactor>,
    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
    coordinator: Mutex<Option<ShutdownCoordinator>>,
    spawned: AtomicUsize,
    closed: AtomicBool,
}

impl EpollServer {
    /// Create a server with the globally configured engine settings.
    pub fn new() -> Result<Self> {
        Self::with_config(riptide_config::config().engine.clone())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            reactor: Arc::new(Reactor::new(config)?),
            workers: Mutex::new(HashMap::new()),
            coordinator: Mutex::new(None),
            spawned: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Bind a listening socket. Returns the actual bound address, which is
    /// how callers learn the port when they bind port 0.
    pub fn listen(&self, ip: IpAddr, port: u16) -> Result<SocketAddr> {
        self.listen_with_backlog(ip, port, self.reactor.config.backlog)
    }

    pub fn listen_with_backlog(
        &self,
        ip: IpAddr,
        port: u16,
        backlog: i32,
    ) -> Result<SocketAddr> {
        let addr = SocketAddr::new(ip, port);
        let bind_err = |source: std::io::Error| ServerError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        // Double the kernel buffers; accepted sockets inherit the sizes.
        if let Ok(size) = socket.recv_buffer_size() {
            let _ = socket.set_recv_buffer_size(size * 2);
        }
        if let Ok(size) = socket.send_buffer_size() {
            let _ = socket.set_send_buffer_size(size * 2);
        }
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(backlog).map_err(bind_err)?;

        let std_listener: TcpListener = socket.into();
        let bound = std_listener.local_addr()?;
        let listener = Arc::new(Listener::new(std_listener, bound));
        self.reactor.tables.add_listener(Arc::clone(&listener));

        if self.reactor.running.load(Ordering::SeqCst) {
            self.reactor
                .register_listener(&listener)
                .map_err(|err| ServerError::Io(err.into()))?;
        }

        info!(addr = %bound, "listening");
        Ok(bound)
    }

    /// Stop listening on an address. No-op when nothing is bound there; the
    /// socket shutdown raises a hang-up in the reactor, which tears down the
    /// listener and every client it owns.
    pub fn unlisten(&self, ip: IpAddr, port: u16) {
        let addr = SocketAddr::new(ip, port);
        let Some(fd) = self.reactor.tables.listener_fd_by_addr(addr) else {
            return;
        };
        match shutdown(fd, Shutdown::Both) {
            Ok(()) | Err(Errno::ENOTCONN) | Err(Errno::EBADF) => {}
            Err(err) => warn!(fd, %addr, error = %err, "unlisten shutdown failed"),
        }
    }

    /// Spawn the reactor workers. Repeated calls are no-ops while running;
    /// a closed server cannot be restarted.
    pub fn start(&self, worker_threads: usize, debug: bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServerError::Closed);
        }
        let mut workers = self.workers.lock().unwrap();
        if self.reactor.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.reactor.debug_mode.store(debug, Ordering::SeqCst);

        let coordinator = ShutdownCoordinator::new()?;
        let worker_side = coordinator.worker_side()?;
        self.reactor
            .install_closer(worker_side)
            .map_err(|err| ServerError::Io(err.into()))?;
        *self.coordinator.lock().unwrap() = Some(coordinator);

        let count = worker_threads.max(1);
        for index in 0..count as u64 {
            let reactor = Arc::clone(&self.reactor);
            let handle = thread::Builder::new()
                .name(format!("riptide-worker-{index}"))
                .spawn(move || reactor.run_worker(index))?;
            workers.insert(index, handle);
        }
        self.spawned.store(count, Ordering::SeqCst);

        // Listeners bound before start get registered now.
        let mut register_err = None;
        self.reactor.tables.for_each_listener(|listener| {
            if register_err.is_none() {
                if let Err(err) = self.reactor.register_listener(listener) {
                    register_err = Some(err);
                }
            }
        });
        if let Some(err) = register_err {
            return Err(ServerError::Io(err.into()));
        }

        let debug_val = debug;
        info!(workers = count, debug = debug_val, "reactor started");
        Ok(())
    }

    /// Spawn with the configured worker count (`None` = auto sizing).
    pub fn start_auto(&self, debug: bool) -> Result<()> {
        let count = self
            .reactor
            .config
            .worker_threads
            .unwrap_or_else(default_worker_count);
        self.start(count, debug)
    }

    /// Block for the next event. `None` is the terminal result after
    /// `close()`; observing it re-arms the shutdown chain so every other
    /// blocked caller terminates too.
    pub fn recv(&self) -> Option<Event> {
        if !self.reactor.running.load(Ordering::SeqCst) {
            self.reactor.queue.shutdown();
            return None;
        }
        match self.reactor.queue.pop() {
            Some(event) => Some(event),
            None => {
                self.reactor.running.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Queue bytes for a connection. No-op for empty `data`; silently
    /// dropped (with a debug event) when the connection no longer exists.
    pub fn send(&self, fd: RawFd, data: &[u8]) {
        self.reactor.send(fd, data);
    }

    /// Gracefully shut down one client; teardown completes through the
    /// reactor's hang-up path.
    pub fn shutdown_client(&self, fd: RawFd) {
        self.reactor.shutdown_client(fd);
    }

    /// Block until all worker threads have exited.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Stop accepting, tear everything down, join the workers and unblock
    /// every pending `recv` caller. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if !self.reactor.running.swap(false, Ordering::SeqCst) {
            self.reactor.queue.shutdown();
            return;
        }

        // Listener hang-ups first: workers still in their loop cascade the
        // client teardown while the handshake below reels them in.
        for fd in self.reactor.tables.listener_fds() {
            match shutdown(fd, Shutdown::Both) {
                Ok(()) | Err(Errno::ENOTCONN) | Err(Errno::EBADF) => {}
                Err(err) => warn!(fd, error = %err, "listener shutdown failed"),
            }
        }

        let mut workers = self.workers.lock().unwrap();
        let expected = self.spawned.swap(0, Ordering::SeqCst);
        if let Some(coordinator) = self.coordinator.lock().unwrap().as_mut() {
            // Strictly one token in flight at a time: each wake-up is a
            // fresh edge consumed by exactly one worker, and the reply
            // tells us which join handle to reap.
            for _ in 0..expected {
                match coordinator.request_stop() {
                    Ok(index) => {
                        if let Some(handle) = workers.remove(&index) {
                            let _ = handle.join();
                        }
                    }
                    Err(err) => {
                        // No live worker answered (a Terminate-policy exit
                        // already shrank the pool); the stragglers are dead
                        // and join immediately below.
                        warn!(error = %err, "shutdown handshake got no reply");
                        break;
                    }
                }
            }
        }
        for (_, handle) in workers.drain() {
            let _ = handle.join();
        }
        drop(workers);
        *self.coordinator.lock().unwrap() = None;

        // Anything the workers did not get to before exiting.
        self.reactor.drain_remaining();
        self.reactor.queue.shutdown();
        info!("server closed");
    }
}

impl Drop for EpollServer {
    fn drop(&mut self) {
        self.close();
    }
}

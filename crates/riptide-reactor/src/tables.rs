//! Connection and listener bookkeeping.
//!
//! All per-connection state lives in one struct held in one concurrent map,
//! so a fd's entries cannot drift apart: they are inserted together at accept
//! time and removed together at teardown. Removal is idempotent because the
//! hang-up and send/receive-failure paths race to tear down the same fd.

use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};

use crate::poller::Interest;

/// A client connection and its serialization locks.
///
/// `send_lock` and `recv_lock` guarantee at most one thread inside the send
/// or receive path per connection; `send_buffer`'s own lock covers buffer
/// mutation, which both the send handler and the public `send` touch.
pub(crate) struct Connection {
    /// Owns the socket; the fd closes when the last `Arc<Connection>` drops.
    sock: OwnedFd,
    /// The listener this connection was accepted on, for its whole lifetime.
    pub(crate) listener_fd: RawFd,
    /// Interest registered with epoll. `SendRecv` exactly while
    /// `send_buffer` is non-empty.
    pub(crate) interest: Mutex<Interest>,
    pub(crate) send_buffer: Mutex<Vec<u8>>,
    pub(crate) send_lock: Mutex<()>,
    pub(crate) recv_lock: Mutex<()>,
}

impl Connection {
    pub(crate) fn new(sock: OwnedFd, listener_fd: RawFd) -> Self {
        Self {
            sock,
            listener_fd,
            interest: Mutex::new(Interest::Recv),
            send_buffer: Mutex::new(Vec::new()),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Prefix `remainder` back onto the buffer, ahead of whatever new data
    /// arrived while a send attempt held the swapped-out bytes.
    pub(crate) fn requeue_front(&self, remainder: &[u8]) {
        let mut buffer = self.send_buffer.lock().unwrap();
        let mut merged = Vec::with_capacity(remainder.len() + buffer.len());
        merged.extend_from_slice(remainder);
        merged.extend_from_slice(&buffer);
        *buffer = merged;
    }
}

/// A listening socket and the clients it has accepted.
pub(crate) struct Listener {
    sock: TcpListener,
    pub(crate) addr: SocketAddr,
    pub(crate) clients: DashSet<RawFd>,
    /// Whether the fd is in the epoll set yet. `listen` before `start`
    /// defers registration.
    pub(crate) registered: AtomicBool,
}

impl Listener {
    pub(crate) fn new(sock: TcpListener, addr: SocketAddr) -> Self {
        Self {
            sock,
            addr,
            clients: DashSet::new(),
            registered: AtomicBool::new(false),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// Authoritative bookkeeping; no I/O.
pub(crate) struct Tables {
    connections: DashMap<RawFd, Arc<Connection>>,
    listeners: DashMap<RawFd, Arc<Listener>>,
    listener_by_addr: DashMap<SocketAddr, RawFd>,
}

impl Tables {
    pub(crate) fn new() -> Self {
        Self {
            connections: DashMap::new(),
            listeners: DashMap::new(),
            listener_by_addr: DashMap::new(),
        }
    }

    pub(crate) fn add_listener(&self, listener: Arc<Listener>) {
        self.listener_by_addr.insert(listener.addr, listener.fd());
        self.listeners.insert(listener.fd(), listener);
    }

    /// Idempotent; also clears the address index.
    pub(crate) fn remove_listener(&self, fd: RawFd) -> Option<Arc<Listener>> {
        let (_, listener) = self.listeners.remove(&fd)?;
        self.listener_by_addr
            .remove_if(&listener.addr, |_, mapped| *mapped == fd);
        Some(listener)
    }

    pub(crate) fn listener(&self, fd: RawFd) -> Option<Arc<Listener>> {
        self.listeners.get(&fd).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn listener_fd_by_addr(&self, addr: SocketAddr) -> Option<RawFd> {
        self.listener_by_addr.get(&addr).map(|entry| *entry)
    }

    pub(crate) fn listener_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn for_each_listener(&self, mut f: impl FnMut(&Arc<Listener>)) {
        for entry in self.listeners.iter() {
            f(entry.value());
        }
    }

    pub(crate) fn add_connection(&self, conn: Arc<Connection>) {
        if let Some(listener) = self.listener(conn.listener_fd) {
            listener.clients.insert(conn.fd());
        }
        self.connections.insert(conn.fd(), conn);
    }

    /// Idempotent: `None` for a fd another teardown path already removed.
    pub(crate) fn remove_connection(&self, fd: RawFd) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(&fd)?;
        if let Some(listener) = self.listener(conn.listener_fd) {
            listener.clients.remove(&fd);
        }
        Some(conn)
    }

    pub(crate) fn connection(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.connections
            .get(&fd)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn connection_fds(&self) -> Vec<RawFd> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }
}

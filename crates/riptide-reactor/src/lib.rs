//! # riptide-reactor
//!
//! Epoll-based multi-threaded TCP reactor engine.
//!
//! One shared kernel epoll instance is polled concurrently by a configurable
//! pool of worker threads. Workers drive the per-connection accept / receive
//! / send state machines and publish [`Event`]s to a blocking queue the
//! application consumes with [`EpollServer::recv`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        EpollServer                           │
//! │  listen / unlisten / start / recv / send / close             │
//! │                                                              │
//! │  ┌─────────┐  ┌──────────┐  ┌────────────┐  ┌─────────────┐  │
//! │  │ Poller  │  │  Tables  │  │ EventQueue │  │ Shutdown    │  │
//! │  │ (epoll) │  │ (dashmap)│  │ (crossbeam)│  │ Coordinator │  │
//! │  └────┬────┘  └────┬─────┘  └─────┬──────┘  └──────┬──────┘  │
//! │       └─────┬──────┴──────────────┘                │         │
//! │      worker threads (shared epoll_wait loop) ◄─────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Triggering model
//!
//! Accept and receive readiness are edge-triggered; write readiness is
//! level-triggered and only armed while a connection's pending-send buffer
//! is non-empty. Sockets are almost always writable, so a standing
//! `EPOLLOUT` interest would fire on every wait.

mod closer;
mod event;
mod poller;
mod reactor;
mod server;
mod tables;

pub use event::Event;
pub use riptide_config::{EngineConfig, FatalPolicy};
pub use server::{default_worker_count, EpollServer, MAX_WORKER_THREADS};

use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the server façade
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server was closed and cannot be restarted")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ServerError>;

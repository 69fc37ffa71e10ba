//! Engine events and the blocking event queue.
//!
//! Reactor workers push; application threads block in `pop`. Shutdown uses a
//! chained sentinel: the first consumer that observes it re-pushes it before
//! returning, so every concurrent consumer unblocks exactly once.

use std::os::fd::RawFd;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// An engine event delivered to application code.
///
/// For a given fd, exactly one `Accepted` precedes any `Received` or
/// `ClientClosed`, and exactly one `ClientClosed` is ever emitted.
///
/// Serializes as `{"type": "accept" | "recv" | "close_client" | "debug", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A listener accepted a new connection.
    #[serde(rename = "accept")]
    Accepted { fd: RawFd },
    /// Bytes arrived on a connection.
    #[serde(rename = "recv")]
    Received { fd: RawFd, bytes: Vec<u8> },
    /// A connection was torn down (peer close, error, or server shutdown).
    #[serde(rename = "close_client")]
    ClientClosed { fd: RawFd },
    /// Diagnostic message; only emitted in debug mode.
    #[serde(rename = "debug")]
    Debug { message: String },
}

/// Unbounded MPMC queue between reactor workers and consumers.
pub(crate) struct EventQueue {
    tx: Sender<Option<Event>>,
    rx: Receiver<Option<Event>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Non-blocking; always succeeds while the queue exists.
    pub(crate) fn push(&self, event: Event) {
        let _ = self.tx.send(Some(event));
    }

    /// Enqueue the termination sentinel.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(None);
    }

    /// Block until an event is available. `None` means the queue was shut
    /// down; the sentinel is re-pushed so sibling consumers terminate too.
    pub(crate) fn pop(&self) -> Option<Event> {
        match self.rx.recv() {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                let _ = self.tx.send(None);
                None
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_push_pop_preserves_order() {
        let queue = EventQueue::new();
        queue.push(Event::Accepted { fd: 7 });
        queue.push(Event::Received {
            fd: 7,
            bytes: b"ping".to_vec(),
        });
        queue.push(Event::ClientClosed { fd: 7 });

        assert_eq!(queue.pop(), Some(Event::Accepted { fd: 7 }));
        assert_eq!(
            queue.pop(),
            Some(Event::Received {
                fd: 7,
                bytes: b"ping".to_vec()
            })
        );
        assert_eq!(queue.pop(), Some(Event::ClientClosed { fd: 7 }));
    }

    #[test]
    fn test_shutdown_chains_to_all_consumers() {
        let queue = Arc::new(EventQueue::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || queue.pop()));
        }

        // Give the consumers a moment to block.
        thread::sleep(Duration::from_millis(50));
        queue.shutdown();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }
        // The sentinel must still be parked for late consumers.
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_events_before_sentinel_still_delivered() {
        let queue = EventQueue::new();
        queue.push(Event::Accepted { fd: 3 });
        queue.shutdown();
        assert_eq!(queue.pop(), Some(Event::Accepted { fd: 3 }));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(Event::Accepted { fd: 9 }).unwrap();
        assert_eq!(json["type"], "accept");
        assert_eq!(json["fd"], 9);

        let json = serde_json::to_value(Event::Received {
            fd: 9,
            bytes: vec![1, 2],
        })
        .unwrap();
        assert_eq!(json["type"], "recv");

        let json = serde_json::to_value(Event::ClientClosed { fd: 9 }).unwrap();
        assert_eq!(json["type"], "close_client");

        let json = serde_json::to_value(Event::Debug {
            message: "m".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "debug");
    }
}

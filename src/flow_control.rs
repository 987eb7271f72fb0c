//! Flow-control counter shared between the streaming engine and the demultiplexer.
//!
//! Ping-pong and sliding mode share no state or behavior beyond both
//! counting acknowledgements, so they're modelled as an explicit tagged
//! variant rather than one value doing double duty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Counts `ok` acknowledgements from the controller during a stream.
///
/// Only meaningful while a stream is active; outside of one, `ok` lines are
/// silently ignored.
#[derive(Clone)]
pub enum OkCounter {
    /// Ping-pong mode: one permit per outstanding send, released on `ok`.
    PingPong(Arc<Semaphore>),
    /// Sliding mode: a running count of `ok`s received.
    Sliding(Arc<AtomicU64>),
}

impl OkCounter {
    /// A fresh ping-pong counter with one permit, so the first line may send immediately.
    pub fn new_ping_pong() -> Self {
        OkCounter::PingPong(Arc::new(Semaphore::new(1)))
    }

    /// A fresh sliding counter starting at zero.
    pub fn new_sliding() -> Self {
        OkCounter::Sliding(Arc::new(AtomicU64::new(0)))
    }

    /// Called by the demultiplexer when an `ok` acknowledgement arrives.
    pub fn acknowledge(&self) {
        match self {
            OkCounter::PingPong(sem) => sem.add_permits(1),
            OkCounter::Sliding(count) => {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    pub fn sliding_count(&self) -> u64 {
        match self {
            OkCounter::Sliding(count) => count.load(Ordering::SeqCst),
            OkCounter::PingPong(_) => 0,
        }
    }

    pub fn semaphore(&self) -> Option<&Arc<Semaphore>> {
        match self {
            OkCounter::PingPong(sem) => Some(sem),
            OkCounter::Sliding(_) => None,
        }
    }
}

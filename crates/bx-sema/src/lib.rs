//! Weighted priority semaphore and named admission pools.
//!
//! A [`PrioritySemaphore`] is a capacity-N semaphore whose waiters are
//! released in descending weight order (FIFO among equal weights). A
//! waiter canceled while queued is skipped on the next release; a waiter
//! that loses the cancel-versus-grant race accepts the grant so the slot
//! is never leaked. Slots release through the scoped [`Permit`] guard,
//! which guarantees exactly-once release.

mod limits;

pub use limits::{Limits, LimitsConfig};

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const STATE_WAITING: u8 = 0;
const STATE_ACQUIRED: u8 = 1;
const STATE_CANCELED: u8 = 2;

/// The waiter was canceled before a slot was granted.
#[derive(Debug, thiserror::Error)]
#[error("canceled while waiting for {0}")]
pub struct Canceled(pub String);

struct Waiter {
    weight: i32,
    /// Enqueue sequence; earlier wins among equal weights.
    seq: u64,
    state: Arc<AtomicU8>,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.seq == other.seq
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher weight first, then earlier enqueue.
        self.weight
            .cmp(&other.weight)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner {
    used: usize,
    queue: BinaryHeap<Waiter>,
    next_seq: u64,
}

/// A semaphore that prioritizes waiters by weight.
pub struct PrioritySemaphore {
    name: String,
    capacity: usize,
    inner: Mutex<Inner>,
    waits: AtomicI64,
    reqs: AtomicI64,
}

impl PrioritySemaphore {
    pub fn new(name: &str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: format!("{}/{}", name, capacity),
            capacity,
            inner: Mutex::new(Inner {
                used: 0,
                queue: BinaryHeap::new(),
                next_seq: 0,
            }),
            waits: AtomicI64::new(0),
            reqs: AtomicI64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently in use.
    pub fn num_servs(&self) -> usize {
        self.inner.lock().unwrap().used
    }

    /// Number of queued waiters.
    pub fn num_waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst).max(0) as usize
    }

    /// Cumulative number of grants.
    pub fn num_requests(&self) -> usize {
        self.reqs.load(Ordering::SeqCst) as usize
    }

    /// Acquire a slot, waiting if necessary. Higher weight requests are
    /// prioritized. Returns a guard that releases the slot on drop.
    pub async fn wait_acquire(
        self: &Arc<Self>,
        weight: i32,
        cancel: &CancellationToken,
    ) -> Result<Permit, Canceled> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.used < self.capacity {
                inner.used += 1;
                drop(inner);
                self.reqs.fetch_add(1, Ordering::SeqCst);
                return Ok(Permit {
                    sema: self.clone(),
                });
            }
            let (tx, rx) = oneshot::channel();
            let state = Arc::new(AtomicU8::new(STATE_WAITING));
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.queue.push(Waiter {
                weight,
                seq,
                state: state.clone(),
                tx,
            });
            self.waits.fetch_add(1, Ordering::SeqCst);
            drop(inner);
            (rx, state)
        };
        let (mut rx, state) = rx;

        tokio::select! {
            granted = &mut rx => {
                self.waits.fetch_add(-1, Ordering::SeqCst);
                match granted {
                    Ok(()) => {
                        self.reqs.fetch_add(1, Ordering::SeqCst);
                        Ok(Permit { sema: self.clone() })
                    }
                    // Sender dropped without a grant; treat as canceled.
                    Err(_) => Err(Canceled(self.name.clone())),
                }
            }
            _ = cancel.cancelled() => {
                if state
                    .compare_exchange(
                        STATE_WAITING,
                        STATE_CANCELED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    // Successfully canceled while queued; the release
                    // path will skip this entry.
                    self.waits.fetch_add(-1, Ordering::SeqCst);
                    trace!(sema = %self.name, weight, "canceled while queued");
                    return Err(Canceled(self.name.clone()));
                }
                // Lost the race: the grant is in flight. Accept it so
                // the slot is released exactly once (by our caller).
                self.waits.fetch_add(-1, Ordering::SeqCst);
                match rx.await {
                    Ok(()) => {
                        self.reqs.fetch_add(1, Ordering::SeqCst);
                        Ok(Permit { sema: self.clone() })
                    }
                    Err(_) => Err(Canceled(self.name.clone())),
                }
            }
        }
    }

    /// Run `f` under the semaphore with the given weight.
    pub async fn run<T, F>(
        self: &Arc<Self>,
        weight: i32,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, Canceled>
    where
        F: std::future::Future<Output = T>,
    {
        let permit = self.wait_acquire(weight, cancel).await?;
        let out = f.await;
        drop(permit);
        Ok(out)
    }

    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(waiter) = inner.queue.pop() {
            if waiter
                .state
                .compare_exchange(
                    STATE_WAITING,
                    STATE_ACQUIRED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                if waiter.tx.send(()).is_ok() {
                    // Slot handed over directly.
                    return;
                }
                // Receiver vanished (waiter future dropped); keep going.
                continue;
            }
            // Canceled entry; skip it.
        }
        inner.used -= 1;
    }
}

/// Scoped guard for an acquired slot. Dropping releases the slot; it
/// cannot be released twice.
pub struct Permit {
    sema: Arc<PrioritySemaphore>,
}

impl Permit {
    /// Explicit release, for symmetry with callers that want to record
    /// the completion error before giving the slot back.
    pub fn done(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.sema.release();
    }
}

//! Candidate Oracle: a bounded, non-blocking queue feeding the Verify
//! worker without stalling the hot loop (§4.2).
//!
//! Structurally this is the engine's background-task scheduler cut down
//! to what the Oracle actually needs: one queue, one worker, FIFO order.
//! Unlike a priority scheduler that rejects on backpressure, an
//! over-full Oracle queue drops its *oldest* entry and keeps accepting —
//! `try_enqueue` never blocks and never returns an error the hot loop has
//! to handle.

#![warn(missing_docs)]
#![warn(clippy::all)]

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use vrt_core::embedding::Embedding;
use vrt_core::match_result::NeighborHit;

/// An unknown-frame embedding proposed for verification, with the
/// LabelBank neighbors that made it a candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The embedding that triggered an "unknown" match.
    pub embedding: Embedding,
    /// Top-1 neighbor label guessed by the LabelBank lookup, used as the
    /// proposed label for Verify's gallery comparison.
    pub proposed_label: String,
    /// The full neighbor list from the LabelBank lookup, for diagnostics.
    pub neighbors: Vec<NeighborHit>,
    /// Monotonic frame index this candidate originated from.
    pub frame_index: u64,
}

/// Point-in-time Oracle metrics (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OracleMetrics {
    /// Configured queue capacity.
    pub maxlen: usize,
    /// Entries currently queued, not yet dequeued.
    pub current_depth: usize,
    /// Total entries accepted by `try_enqueue` (including later-shed ones).
    pub enqueued: u64,
    /// Total entries the worker has dequeued and handed to Verify.
    pub dequeued: u64,
    /// Total entries dropped because the queue was full.
    pub shed_count: u64,
}

impl OracleMetrics {
    /// `shed_count / max(1, enqueued)`.
    pub fn shed_rate(&self) -> f64 {
        self.shed_count as f64 / self.enqueued.max(1) as f64
    }
}

struct Inner {
    queue: Mutex<VecDeque<Candidate>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    maxlen: usize,
    depth: AtomicUsize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    shed_count: AtomicU64,
}

/// The Candidate Oracle: a bounded queue plus a single background worker
/// that drains it in FIFO order and invokes a verify callback.
pub struct CandidateOracle {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CandidateOracle {
    /// Start an Oracle with the given queue capacity, dequeuing into
    /// `verify` on a single background thread.
    ///
    /// `verify` runs inside `catch_unwind`: a panicking verify call is
    /// logged and does not kill the worker or lose subsequent candidates.
    pub fn spawn<F>(maxlen: usize, verify: F) -> Self
    where
        F: Fn(Candidate) + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            maxlen,
            depth: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            shed_count: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let verify = Arc::new(verify);
        let handle = std::thread::Builder::new()
            .name("oracle-verify".to_string())
            .spawn(move || worker_loop(worker_inner, verify))
            .expect("failed to spawn oracle worker thread");

        CandidateOracle {
            inner,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a candidate without blocking. If the queue is at capacity,
    /// the oldest queued entry is dropped first and `shed_count` ticks up;
    /// the new entry is always accepted (§4.2 overflow contract).
    pub fn try_enqueue(&self, candidate: Candidate) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.maxlen {
                queue.pop_front();
                self.inner.shed_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.inner.depth.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(candidate);
        }
        self.inner.enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.work_ready.notify_one();
    }

    /// Snapshot current metrics.
    pub fn metrics(&self) -> OracleMetrics {
        OracleMetrics {
            maxlen: self.inner.maxlen,
            current_depth: self.inner.depth.load(Ordering::Relaxed),
            enqueued: self.inner.enqueued.load(Ordering::Relaxed),
            dequeued: self.inner.dequeued.load(Ordering::Relaxed),
            shed_count: self.inner.shed_count.load(Ordering::Relaxed),
        }
    }

    /// Signal shutdown and join the worker. Entries still queued at this
    /// point are abandoned, never handed to Verify (§4.2 cancellation).
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CandidateOracle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(inner: Arc<Inner>, verify: Arc<F>)
where
    F: Fn(Candidate) + Send + Sync + 'static,
{
    loop {
        let candidate = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(candidate) = queue.pop_front() {
                    inner.depth.fetch_sub(1, Ordering::Relaxed);
                    break candidate;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let verify = Arc::clone(&verify);
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            verify(candidate)
        })) {
            tracing::error!(
                panic = ?e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)"),
                "oracle verify callback panicked"
            );
        }
        inner.dequeued.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn unit(vals: &[f32]) -> Embedding {
        let norm = vals.iter().map(|v| v * v).sum::<f32>().sqrt();
        Embedding::new(vals.iter().map(|v| v / norm).collect()).unwrap()
    }

    fn candidate(frame_index: u64) -> Candidate {
        Candidate {
            embedding: unit(&[1.0, 0.0]),
            proposed_label: "red-mug".to_string(),
            neighbors: vec![],
            frame_index,
        }
    }

    fn wait_until_dequeued(oracle: &CandidateOracle, count: usize) {
        for _ in 0..200 {
            if oracle.metrics().dequeued as usize >= count {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn enqueued_entries_are_dequeued_in_fifo_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_writer = Arc::clone(&seen);
        let oracle = CandidateOracle::spawn(16, move |c: Candidate| {
            seen_writer.lock().push(c.frame_index);
        });

        for i in 0..5 {
            oracle.try_enqueue(candidate(i));
        }
        wait_until_dequeued(&oracle, 5);

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn overflow_drops_oldest_and_increments_shed_count() {
        let barrier = Arc::new(Barrier::new(2));
        let worker_barrier = Arc::clone(&barrier);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_writer = Arc::clone(&seen);
        let first = Arc::new(AtomicUsize::new(0));
        let first_writer = Arc::clone(&first);

        let oracle = CandidateOracle::spawn(2, move |c: Candidate| {
            if first_writer.fetch_add(1, Ordering::SeqCst) == 0 {
                worker_barrier.wait();
            }
            seen_writer.lock().push(c.frame_index);
        });

        // First candidate is picked up immediately and blocks on the barrier,
        // holding the worker so the next three queue up behind it.
        oracle.try_enqueue(candidate(0));
        std::thread::sleep(Duration::from_millis(30));
        oracle.try_enqueue(candidate(1));
        oracle.try_enqueue(candidate(2));
        oracle.try_enqueue(candidate(3)); // queue cap 2: drops frame 1

        barrier.wait();
        wait_until_dequeued(&oracle, 3);

        let metrics = oracle.metrics();
        assert_eq!(metrics.shed_count, 1);
        assert_eq!(metrics.enqueued, 4);
        assert_eq!(*seen.lock(), vec![0, 2, 3]);
    }

    #[test]
    fn shed_rate_divides_by_enqueued() {
        let metrics = OracleMetrics {
            maxlen: 64,
            current_depth: 0,
            enqueued: 20,
            dequeued: 15,
            shed_count: 1,
        };
        assert!((metrics.shed_rate() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn shed_rate_with_zero_enqueued_does_not_divide_by_zero() {
        let metrics = OracleMetrics {
            maxlen: 64,
            current_depth: 0,
            enqueued: 0,
            dequeued: 0,
            shed_count: 0,
        };
        assert_eq!(metrics.shed_rate(), 0.0);
    }

    #[test]
    fn shutdown_abandons_pending_entries() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_writer = Arc::clone(&seen);
        let barrier = Arc::new(Barrier::new(2));
        let worker_barrier = Arc::clone(&barrier);

        let oracle = CandidateOracle::spawn(16, move |_c: Candidate| {
            seen_writer.fetch_add(1, Ordering::SeqCst);
            worker_barrier.wait();
        });

        oracle.try_enqueue(candidate(0));
        std::thread::sleep(Duration::from_millis(30));
        for i in 1..5 {
            oracle.try_enqueue(candidate(i));
        }

        // Release the in-flight worker call concurrently with shutdown,
        // since shutdown() blocks joining the worker thread.
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            barrier.wait();
        });
        oracle.shutdown();
        release.join().unwrap();

        // Only the in-flight candidate (frame 0) was ever handed to verify;
        // the rest were abandoned at shutdown.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

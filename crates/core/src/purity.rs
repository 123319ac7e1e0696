//! Hot-loop purity accounting (§5, §7 `PurityViolation`).
//!
//! The hot loop must never perform a network syscall between the first
//! and last frame of a run. The actual audit is an external, out-of-band
//! syscall tracer (strace/seccomp-style), out of scope for this crate per
//! spec.md §1. What lives here is the in-process counterpart: a guard the
//! engine holds open for the run's duration, and a summary it emits into
//! `metrics.json`. Tests exercise it via [`PurityGuard::record_socket_attempt`]
//! rather than a real syscall interceptor.

use std::sync::atomic::{AtomicU64, Ordering};

/// End-of-run purity summary, mirrored into `metrics.json`'s `purity` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PuritySummary {
    /// Count of blocked socket-open attempts observed during the run.
    pub sockets_blocked: u64,
    /// Count of blocked DNS-resolution attempts observed during the run.
    pub dns_blocked: u64,
}

impl PuritySummary {
    /// True when zero network operations were recorded (§5 invariant).
    pub fn is_clean(&self) -> bool {
        self.sockets_blocked == 0 && self.dns_blocked == 0
    }
}

/// Counting guard the hot loop holds open for a run's lifetime.
///
/// Cheap to clone (shares the same atomics) so the engine can pass a
/// handle into collaborators without threading a `&mut` reference through
/// the frame loop.
#[derive(Debug, Default)]
pub struct PurityGuard {
    sockets: AtomicU64,
    dns: AtomicU64,
}

impl PurityGuard {
    /// Create a fresh, zeroed guard for a new run.
    pub fn new() -> Self {
        PurityGuard::default()
    }

    /// Record an attempted socket open. Exposed for fault-injection tests;
    /// production code paths never call this because they never open sockets.
    pub fn record_socket_attempt(&self) {
        self.sockets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempted DNS resolution. See [`Self::record_socket_attempt`].
    pub fn record_dns_attempt(&self) {
        self.dns.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counts accumulated so far into a [`PuritySummary`].
    pub fn summary(&self) -> PuritySummary {
        PuritySummary {
            sockets_blocked: self.sockets.load(Ordering::Relaxed),
            dns_blocked: self.dns.load(Ordering::Relaxed),
        }
    }
}

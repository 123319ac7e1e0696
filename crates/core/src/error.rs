//! Error types for the recognition engine.
//!
//! We use `thiserror` for automatic `Display`/`Error` impls, following the
//! same unified-enum shape as the rest of the pipeline's internal crates.
//!
//! ## Error kinds
//!
//! Ordered innermost to outermost, matching the propagation policy: the
//! hot loop never raises (per-frame failures become `"unknown"` results),
//! background components log and count, and the CLI boundary translates
//! typed errors into process exit codes.

use thiserror::Error;

/// Result type alias for fallible operations in this workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the recognition engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input, empty fixture, or embedding-dimension mismatch.
    #[error("data error: {0}")]
    Data(String),

    /// Invalid config value, or a precedence conflict between sources.
    #[error("config error: {0}")]
    Config(String),

    /// Evidence ledger hash-chain break detected on load.
    #[error("ledger corrupt at sequence {sequence}: {reason}")]
    LedgerCorrupt {
        /// Sequence number of the first entry that failed verification.
        sequence: u64,
        /// Human-readable cause.
        reason: String,
    },

    /// Sustained p95 latency exceeded budget across the full window,
    /// with the gate mode enabled at end-of-run.
    #[error("budget breach: p95 {observed_ms:.2}ms exceeds budget {budget_ms:.2}ms")]
    BudgetBreach {
        /// Observed windowed p95, in milliseconds.
        observed_ms: f64,
        /// Configured budget, in milliseconds.
        budget_ms: f64,
    },

    /// A network syscall was recorded between the first and last frame of a run.
    #[error("purity violation: {sockets_blocked} socket(s), {dns_blocked} dns call(s) recorded in hot loop")]
    PurityViolation {
        /// Number of blocked socket attempts observed.
        sockets_blocked: u64,
        /// Number of blocked DNS attempts observed.
        dns_blocked: u64,
    },

    /// I/O error (shard/ledger/medoid file operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shard open failed because the query/shard embedding dimension disagree.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimMismatch {
        /// Dimension recorded in the shard.
        expected: usize,
        /// Dimension of the offending vector.
        got: usize,
    },

    /// LabelBank shard contains zero exemplar rows.
    #[error("shard is empty")]
    EmptyShard,
}

impl Error {
    /// Process exit code for this error, per the external-interface contract:
    /// `0` success, `2` user/data error, `3` missing optional dependency.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Data(_)
            | Error::Config(_)
            | Error::DimMismatch { .. }
            | Error::EmptyShard
            | Error::BudgetBreach { .. } => 2,
            Error::LedgerCorrupt { .. } => 2,
            // The external-interface contract only enumerates exit codes 0/2/3;
            // a purity breach is a data-validity failure from the gate's view.
            Error::PurityViolation { .. } => 2,
            Error::Io(_) | Error::Serialization(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(Error::Data("x".into()).exit_code(), 2);
        assert_eq!(Error::Config("x".into()).exit_code(), 2);
        assert_eq!(
            Error::PurityViolation {
                sockets_blocked: 1,
                dns_blocked: 0
            }
            .exit_code(),
            2
        );
        assert_eq!(
            Error::LedgerCorrupt {
                sequence: 3,
                reason: "bad hash".into()
            }
            .exit_code(),
            2
        );
    }
}

//! Verify: the curated second-stage gate between an Oracle candidate and
//! the Evidence Ledger (§4.3).
//!
//! The gallery here is intentionally independent of the LabelBank shard
//! (§4.3: "independent of the LabelBank shard") — it holds a small set of
//! trusted reference embeddings per label, curated offline, with its own
//! per-label calibrated threshold. Structurally this mirrors
//! `vrt_labelbank::calibration`'s per-label quantile table, cut down to
//! just the one threshold Verify needs rather than the full quantile +
//! temperature block LabelBank persists.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use vrt_core::embedding::Embedding;

/// Default accept threshold applied to a label with no curated entry of
/// its own. Conservative: higher than the LabelBank fallback, since an
/// accept here writes to the Ledger and ultimately feeds KB promotion.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Outcome of a single `verify` call (§4.3 step 4, §4.6 `VerifyEvidence`).
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    /// The label that was checked.
    pub label: String,
    /// `true` if the max gallery cosine cleared the label's threshold.
    pub accepted: bool,
    /// Single-line reason, always populated on reject.
    pub reason: Option<String>,
    /// The calibrated score used for the decision: max cosine against the
    /// label's gallery, or `0.0` when the label has no gallery entries.
    pub score: f32,
}

/// A curated per-label set of reference embeddings plus calibrated
/// accept thresholds, built offline and loaded read-only at runtime.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    references: HashMap<String, Vec<Embedding>>,
    thresholds: HashMap<String, f32>,
}

impl Gallery {
    /// An empty gallery: every `verify` call rejects with `UnknownLabel`.
    pub fn new() -> Self {
        Gallery::default()
    }

    /// Register (or replace) a label's curated reference embeddings and
    /// accept threshold.
    pub fn add_label(&mut self, label: impl Into<String>, references: Vec<Embedding>, tau: f32) {
        let label = label.into();
        self.references.insert(label.clone(), references);
        self.thresholds.insert(label, tau);
    }

    /// Labels known to this gallery.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(|s| s.as_str())
    }

    fn threshold_for(&self, label: &str) -> f32 {
        self.thresholds
            .get(label)
            .copied()
            .unwrap_or(DEFAULT_THRESHOLD)
    }
}

/// Point-in-time Verify metrics, supporting the calibration-accounting
/// invariant `called == accepted + rejected` (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VerifyMetrics {
    /// Total `verify` invocations.
    pub called: u64,
    /// Total accepts.
    pub accepted: u64,
    /// Total rejects.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    called: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// The Verify gate: holds a [`Gallery`] and runs the accept/reject
/// algorithm against it (§4.3 steps 1–4).
///
/// Re-embedding (§4.3 step 1) is the caller's responsibility: the current
/// spec reuses the candidate's existing embedding, but the interface
/// permits swapping in a distinct re-embedder without changing this
/// type's shape, so `verify` takes an already-produced [`Embedding`]
/// rather than a raw frame.
pub struct VerifyEngine {
    gallery: Gallery,
    counters: Counters,
}

impl VerifyEngine {
    /// Build a Verify engine over a fixed, already-curated gallery.
    pub fn new(gallery: Gallery) -> Self {
        VerifyEngine {
            gallery,
            counters: Counters::default(),
        }
    }

    /// Check a proposed label against its gallery entries (§4.3).
    ///
    /// An unknown label (absent from the gallery) is treated as a reject
    /// with reason `"UnknownLabel"`, never surfaced to the caller as an
    /// error (§4.3 failures).
    pub fn verify(&self, label: &str, embedding: &Embedding) -> VerifyOutcome {
        self.counters.called.fetch_add(1, Ordering::Relaxed);

        let Some(references) = self.gallery.references.get(label) else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return VerifyOutcome {
                label: label.to_string(),
                accepted: false,
                reason: Some("UnknownLabel".to_string()),
                score: 0.0,
            };
        };

        let max_score = references
            .iter()
            .filter_map(|reference| reference.cosine(embedding).ok())
            .fold(f32::NEG_INFINITY, f32::max);
        let max_score = if max_score.is_finite() { max_score } else { -1.0 };

        let tau = self.gallery.threshold_for(label);
        let accepted = max_score >= tau;

        if accepted {
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(label, score = max_score, tau, "verify: accept");
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(label, score = max_score, tau, "verify: reject");
        }

        VerifyOutcome {
            label: label.to_string(),
            accepted,
            reason: if accepted {
                None
            } else {
                Some(format!("score {max_score:.4} below tau {tau:.4}"))
            },
            score: max_score,
        }
    }

    /// Read-only access to the underlying gallery (e.g. for reporting).
    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Snapshot current accounting metrics.
    pub fn metrics(&self) -> VerifyMetrics {
        VerifyMetrics {
            called: self.counters.called.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(vals: &[f32]) -> Embedding {
        let norm = vals.iter().map(|v| v * v).sum::<f32>().sqrt();
        Embedding::new(vals.iter().map(|v| v / norm).collect()).unwrap()
    }

    fn toy_gallery() -> Gallery {
        let mut gallery = Gallery::new();
        gallery.add_label(
            "red-mug",
            vec![unit(&[1.0, 0.0]), unit(&[0.95, 0.05])],
            0.8,
        );
        gallery
    }

    #[test]
    fn accepts_above_threshold() {
        let engine = VerifyEngine::new(toy_gallery());
        let outcome = engine.verify("red-mug", &unit(&[1.0, 0.01]));
        assert!(outcome.accepted);
        assert!(outcome.reason.is_none());
    }

    #[test]
    fn rejects_below_threshold() {
        let engine = VerifyEngine::new(toy_gallery());
        let outcome = engine.verify("red-mug", &unit(&[0.0, 1.0]));
        assert!(!outcome.accepted);
        assert!(outcome.reason.is_some());
    }

    #[test]
    fn unknown_label_rejects_with_reason_not_error() {
        let engine = VerifyEngine::new(toy_gallery());
        let outcome = engine.verify("never-seen", &unit(&[1.0, 0.0]));
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason.as_deref(), Some("UnknownLabel"));
    }

    #[test]
    fn called_equals_accepted_plus_rejected() {
        let engine = VerifyEngine::new(toy_gallery());
        engine.verify("red-mug", &unit(&[1.0, 0.0]));
        engine.verify("red-mug", &unit(&[0.0, 1.0]));
        engine.verify("never-seen", &unit(&[1.0, 0.0]));

        let metrics = engine.metrics();
        assert_eq!(metrics.called, metrics.accepted + metrics.rejected);
        assert_eq!(metrics.called, 3);
    }
}

//! Quantile calibration (§4.4).
//!
//! At build time, for every label we compute the empirical distribution of
//! same-class cosine scores and nearest-other-class cosine scores. From
//! those we derive a per-label accept threshold and a single shard-wide
//! temperature, replacing duck-typed threshold lookups with explicit
//! per-label vectors of floats indexed by label id (§9 design note).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default ε: the maximum tolerated probability that an other-class score
/// clears the accept threshold.
pub const DEFAULT_EPSILON: f64 = 0.01;

/// Target recall: the minimum probability that a same-class score clears
/// the accept threshold.
pub const TARGET_RECALL: f64 = 0.95;

/// Reported quantiles of a label's same-class cosine-score distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantiles {
    /// Median.
    pub q50: f32,
    /// 90th percentile.
    pub q90: f32,
    /// 99th percentile.
    pub q99: f32,
}

/// Calibration data for a single label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEntry {
    /// Reported same-class score quantiles.
    pub quantiles: Quantiles,
    /// Accept threshold: scores at or above this are "known" for this label.
    pub tau: f32,
}

/// Per-shard calibration block: one entry per label, plus a shared
/// temperature for score → probability conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// Per-label-id calibration entries.
    entries: HashMap<u32, CalibrationEntry>,
    /// Temperature `T` for `sigmoid((cos - tau) / T)`.
    pub temperature: f32,
    /// Threshold used for labels with no calibration entry (too few samples).
    pub fallback_tau: f32,
}

impl CalibrationTable {
    /// Look up the accept threshold for a label id, falling back to
    /// [`Self::fallback_tau`] if the label has no calibration entry.
    pub fn tau(&self, label_id: u32) -> f32 {
        self.entries
            .get(&label_id)
            .map(|e| e.tau)
            .unwrap_or(self.fallback_tau)
    }

    /// Look up the reported quantiles for a label id, if calibrated.
    pub fn quantiles(&self, label_id: u32) -> Option<Quantiles> {
        self.entries.get(&label_id).map(|e| e.quantiles)
    }

    /// Convert a raw cosine score into a calibrated probability via the
    /// shared temperature: `sigmoid((cos - tau) / T)`.
    pub fn probability(&self, label_id: u32, cosine: f32) -> f32 {
        let tau = self.tau(label_id);
        let t = self.temperature.max(1e-6);
        sigmoid((cosine - tau) / t)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// NumPy "linear"-interpolation quantile over an already-sorted slice.
///
/// `q` is in `[0, 1]`. Matches the interpolation rule spec.md §4.7 uses
/// for the windowed p95: index at `q * (n - 1)`, linear blend between the
/// floor and ceil elements.
pub fn linear_quantile(sorted: &[f32], q: f64) -> f32 {
    assert!(!sorted.is_empty(), "quantile of empty slice");
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = (pos - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Per-label raw score samples collected at build time: same-class cosine
/// scores for that label, and the label's nearest-other-class scores.
pub struct LabelSamples {
    /// Scores between same-class exemplar pairs.
    pub same_class: Vec<f32>,
    /// Scores between this label's exemplars and the nearest other class.
    pub other_class: Vec<f32>,
}

/// Build a [`CalibrationTable`] from per-label score samples.
///
/// `epsilon` bounds the tolerated other-class acceptance rate; `recall`
/// is the target same-class acceptance rate. Both default to the spec's
/// `0.01` / `0.95` via [`DEFAULT_EPSILON`] / [`TARGET_RECALL`].
pub fn build_calibration(
    samples: &HashMap<u32, LabelSamples>,
    epsilon: f64,
    recall: f64,
) -> CalibrationTable {
    let mut entries = HashMap::with_capacity(samples.len());
    let mut all_same: Vec<f32> = Vec::new();
    let mut all_other: Vec<f32> = Vec::new();

    for (label_id, s) in samples {
        if s.same_class.is_empty() {
            continue;
        }
        let mut same_sorted = s.same_class.clone();
        same_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let quantiles = Quantiles {
            q50: linear_quantile(&same_sorted, 0.5),
            q90: linear_quantile(&same_sorted, 0.9),
            q99: linear_quantile(&same_sorted, 0.99),
        };

        // tau must satisfy P(same >= tau) >= recall, i.e. tau <= the
        // (1 - recall) quantile of the same-class distribution.
        let same_bound = linear_quantile(&same_sorted, 1.0 - recall);

        // tau must satisfy P(other >= tau) <= epsilon, i.e. tau >= the
        // (1 - epsilon) quantile of the other-class distribution. When
        // there are no other-class samples for this label, the recall
        // bound is the only constraint.
        let other_bound = if s.other_class.is_empty() {
            f32::NEG_INFINITY
        } else {
            let mut other_sorted = s.other_class.clone();
            other_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            linear_quantile(&other_sorted, 1.0 - epsilon)
        };

        // The valid range is [other_bound, same_bound]. When satisfiable
        // (other_bound <= same_bound) the minimal, most-permissive tau in
        // that range is other_bound. When infeasible, same_bound is the
        // tighter (smaller) value and becomes the binding constraint,
        // sacrificing the epsilon guarantee in favor of the recall floor.
        let tau = other_bound.min(same_bound);

        entries.insert(*label_id, CalibrationEntry { quantiles, tau });
        all_same.extend_from_slice(&s.same_class);
        all_other.extend_from_slice(&s.other_class);
    }

    let fallback_tau = if all_same.is_empty() {
        0.0
    } else {
        let mut sorted = all_same.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        linear_quantile(&sorted, 1.0 - recall)
    };

    let temperature = fit_temperature(&entries, &all_same, &all_other, samples);

    CalibrationTable {
        entries,
        temperature,
        fallback_tau,
    }
}

/// Fit a single scalar temperature by grid search minimizing binary
/// cross-entropy between `sigmoid((cos - tau_label) / T)` and the
/// same-class indicator, pooled across all labels' calibration samples.
fn fit_temperature(
    entries: &HashMap<u32, CalibrationEntry>,
    _all_same: &[f32],
    _all_other: &[f32],
    samples: &HashMap<u32, LabelSamples>,
) -> f32 {
    // Candidate temperatures, geometric grid; fine enough for a
    // deterministic, dependency-free 1-parameter fit.
    let candidates: Vec<f32> = (1..=60).map(|i| 0.01 * 1.15f32.powi(i)).collect();

    let mut best_t = 1.0f32;
    let mut best_loss = f32::INFINITY;

    for &t in &candidates {
        let mut loss = 0.0f64;
        let mut n = 0usize;
        for (label_id, s) in samples {
            let tau = entries.get(label_id).map(|e| e.tau).unwrap_or(0.0);
            for &score in &s.same_class {
                let p = sigmoid((score - tau) / t).clamp(1e-6, 1.0 - 1e-6);
                loss -= (p as f64).ln();
                n += 1;
            }
            for &score in &s.other_class {
                let p = sigmoid((score - tau) / t).clamp(1e-6, 1.0 - 1e-6);
                loss -= (1.0 - p as f64).ln();
                n += 1;
            }
        }
        if n == 0 {
            continue;
        }
        let mean_loss = (loss / n as f64) as f32;
        if mean_loss < best_loss {
            best_loss = mean_loss;
            best_t = t;
        }
    }
    best_t
}

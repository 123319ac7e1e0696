//! The frozen v0.1 per-frame result contract (§3, §6).
//!
//! `MatchResult` is a single tagged record, not a dynamic dict: "unknown"
//! is encoded as a reserved label string rather than a separate result
//! variant, so the schema stays flat and stable for v0.1 JSON consumers.
//! Additive fields are only allowed under a new `metrics_schema_version`.

use serde::{Deserialize, Serialize};

/// Reserved label value meaning "no known label matched".
pub const UNKNOWN_LABEL: &str = "unknown";

/// One neighbor returned by a top-k lookup against the LabelBank shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborHit {
    /// Candidate label.
    pub label: String,
    /// Cosine similarity score, clamped to `[-1, 1]`.
    pub score: f32,
}

impl NeighborHit {
    /// Construct a neighbor hit, clamping the score into the valid range.
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        NeighborHit {
            label: label.into(),
            score: score.clamp(-1.0, 1.0),
        }
    }
}

/// Per-frame recognition result. Produced exactly once per processed
/// *and* per skipped frame (§4.7 skip semantics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Winning label, or [`UNKNOWN_LABEL`].
    pub label: String,
    /// Confidence of the winning label (top-1 cosine score, or 0 for unknown).
    pub confidence: f32,
    /// Neighbors, sorted strictly descending by score.
    pub neighbors: Vec<NeighborHit>,
    /// Which similarity backend served this lookup.
    pub backend: Backend,
    /// Controller's stride at the time this frame was reported.
    pub stride: u32,
    /// Set when this frame was skipped (or over budget) by the controller.
    pub budget_hit: bool,
    /// Optional bounding box hint carried from the frame source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
    /// Optional frame timestamp, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    /// SDK version this result was produced under.
    pub sdk_version: &'static str,
}

/// Similarity backend tag reported for observability (§4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// BLAS-style matrix-vector kernel.
    Faiss,
    /// Hand-rolled SIMD/scalar kernel.
    Numpy,
}

/// Axis-aligned bounding box hint, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub w: f32,
    /// Height.
    pub h: f32,
}

impl MatchResult {
    /// True if `neighbors` is sorted strictly descending by score (§8 invariant).
    pub fn neighbors_sorted_desc(&self) -> bool {
        self.neighbors.windows(2).all(|w| w[0].score > w[1].score)
    }

    /// True if a non-unknown label always equals the top neighbor's label
    /// whenever neighbors is non-empty (§3 invariant).
    pub fn label_matches_top_neighbor(&self) -> bool {
        if self.label == UNKNOWN_LABEL {
            return true;
        }
        match self.neighbors.first() {
            Some(top) => top.label == self.label,
            None => true,
        }
    }
}

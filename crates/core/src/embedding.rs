//! L2-normalized embedding vectors.
//!
//! Every embedding that enters the pipeline — a frame embedding, a shard
//! row, a gallery reference, a medoid centroid — is validated to unit
//! norm at the boundary (§3 invariants: `||v|| = 1` within `1e-5`). The
//! hot loop never re-validates; `topk` and friends assume the invariant
//! already holds.

use crate::error::Error;

/// Float tolerance for the L2-normalization invariant.
pub const NORM_TOLERANCE: f64 = 1e-5;

/// A fixed-dimension, L2-normalized float embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Build an embedding from raw values, validating the L2-norm invariant.
    ///
    /// Returns [`Error::Data`] if the vector is empty or its norm deviates
    /// from 1.0 by more than [`NORM_TOLERANCE`].
    pub fn new(values: Vec<f32>) -> Result<Self, Error> {
        if values.is_empty() {
            return Err(Error::Data("embedding has zero dimension".into()));
        }
        let norm = l2_norm(&values);
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            return Err(Error::Data(format!(
                "embedding is not L2-normalized: ||v|| = {norm:.6}"
            )));
        }
        Ok(Embedding { values })
    }

    /// Build an embedding without re-validating the norm.
    ///
    /// Only for call sites that already proved the invariant (e.g. a
    /// shard row read back from a structurally-validated file). Debug
    /// builds still assert the invariant to catch grounding bugs early.
    pub fn new_unchecked(values: Vec<f32>) -> Self {
        debug_assert!(
            (l2_norm(&values) - 1.0).abs() <= NORM_TOLERANCE,
            "new_unchecked invariant violated"
        );
        Embedding { values }
    }

    /// Dimensionality of the embedding.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Borrow the raw components.
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Consume and return the raw components.
    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }

    /// Cosine similarity against another embedding of the same dimension.
    ///
    /// Equivalent to the dot product since both operands are L2-normalized.
    /// The result is clamped to `[-1, 1]` to absorb float rounding.
    pub fn cosine(&self, other: &Embedding) -> Result<f32, Error> {
        if self.dim() != other.dim() {
            return Err(Error::DimMismatch {
                expected: self.dim(),
                got: other.dim(),
            });
        }
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        Ok(dot.clamp(-1.0, 1.0))
    }
}

fn l2_norm(values: &[f32]) -> f64 {
    values.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>().sqrt()
}

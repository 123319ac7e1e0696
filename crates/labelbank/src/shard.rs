//! The LabelBank shard: an immutable ANN index over labeled exemplars (§4.1).

use crate::calibration::{build_calibration, CalibrationTable, LabelSamples};
use crate::format::{self, ShardBody};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::path::Path;
use vrt_core::error::{Error, Result};
use vrt_core::match_result::{Backend, NeighborHit, MatchResult, UNKNOWN_LABEL};
use vrt_core::Embedding;

/// Default similarity backend tag reported by this implementation.
///
/// The hand-rolled scalar kernel below is the "numpy" backend per §4.1;
/// a BLAS/SIMD kernel swapped in later would report `Backend::Faiss`
/// without changing this module's public surface.
pub const ACTIVE_BACKEND: Backend = Backend::Numpy;

/// A single exemplar row during shard construction.
pub struct ExemplarRow {
    /// Class label.
    pub label: String,
    /// L2-normalized embedding.
    pub vector: Embedding,
}

/// Row (label-id, cosine score) pair used internally by [`Shard::topk`]'s
/// bounded min-heap.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoredRow {
    score: f32,
    row: u32,
    label_id: u32,
}

impl Eq for ScoredRow {}

impl PartialOrd for ScoredRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredRow {
    fn cmp(&self, other: &Self) -> Ordering {
        // Natural order: higher score = Greater, so `BinaryHeap<Reverse<_>>`
        // pops the worst-scoring row first — the one to evict once the
        // heap exceeds capacity k. Ties break toward the lower label-id
        // directly (§4.1 contract) rather than row index — rows are stored
        // in caller-supplied order, not label-id order, so row index alone
        // isn't a valid stand-in. A same-label tie (two rows of the same
        // class) falls through to row index as a final, arbitrary but
        // deterministic tiebreak.
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.label_id.cmp(&self.label_id))
            .then_with(|| other.row.cmp(&self.row))
    }
}

/// An immutable, memory-mapped-at-open ANN shard.
pub struct Shard {
    dim: usize,
    count: usize,
    matrix: Vec<f32>,
    label_ids: Vec<u32>,
    label_dict: Vec<String>,
    calibration: CalibrationTable,
    struct_hash: u64,
}

impl Shard {
    /// Build a shard artifact in memory from labeled exemplar pairs (§4.1
    /// `build`). `topk_max` bounds the shard's own reported configured max
    /// and `epsilon`/`recall` feed the calibration quantiles (§4.4).
    pub fn build(pairs: Vec<ExemplarRow>, epsilon: f64, recall: f64) -> Result<Shard> {
        if pairs.is_empty() {
            return Err(Error::EmptyShard);
        }
        let dim = pairs[0].vector.dim();
        for row in &pairs {
            if row.vector.dim() != dim {
                return Err(Error::DimMismatch {
                    expected: dim,
                    got: row.vector.dim(),
                });
            }
        }

        let mut label_dict: Vec<String> = pairs.iter().map(|r| r.label.clone()).collect();
        label_dict.sort();
        label_dict.dedup();
        let label_index: HashMap<&str, u32> = label_dict
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i as u32))
            .collect();

        let count = pairs.len();
        let mut matrix = Vec::with_capacity(count * dim);
        let mut label_ids = Vec::with_capacity(count);
        for row in &pairs {
            matrix.extend_from_slice(row.vector.as_slice());
            label_ids.push(label_index[row.label.as_str()]);
        }

        let calibration = calibrate(&pairs, &label_index, epsilon, recall);

        tracing::info!(
            rows = count,
            labels = label_dict.len(),
            dim,
            "built labelbank shard"
        );

        let body = ShardBody {
            matrix,
            dim: dim as u32,
            label_ids,
            label_dict,
            calibration,
        };
        let struct_hash = format::bench_struct_hash(&body);

        Ok(Shard {
            dim,
            count,
            matrix: body.matrix,
            label_ids: body.label_ids,
            label_dict: body.label_dict,
            calibration: body.calibration,
            struct_hash,
        })
    }

    /// Serialize this shard to `path` in the on-disk layout (§6 artifact).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let body = ShardBody {
            matrix: self.matrix.clone(),
            dim: self.dim as u32,
            label_ids: self.label_ids.clone(),
            label_dict: self.label_dict.clone(),
            calibration: self.calibration.clone(),
        };
        let mut file = File::create(path.as_ref())?;
        format::write_shard(&mut file, &body)?;
        Ok(())
    }

    /// Open a shard file, memory-mapping it and validating its structure
    /// (§4.1 `open`): dim, count, and [`format::bench_struct_hash`].
    pub fn open(path: impl AsRef<Path>) -> Result<Shard> {
        let file = File::open(path.as_ref())?;
        let bytes = format::mmap_read_all(&file)?;
        let body = format::read_shard(&bytes)?;

        if body.label_ids.is_empty() {
            return Err(Error::EmptyShard);
        }
        let expected_hash = format::bench_struct_hash(&body);

        tracing::info!(
            path = %path.as_ref().display(),
            rows = body.label_ids.len(),
            struct_hash = expected_hash,
            "opened labelbank shard"
        );

        Ok(Shard {
            dim: body.dim as usize,
            count: body.label_ids.len(),
            matrix: body.matrix,
            label_ids: body.label_ids,
            label_dict: body.label_dict,
            calibration: body.calibration,
            struct_hash: expected_hash,
        })
    }

    /// Embedding dimension of every row in this shard.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of exemplar rows.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Stable structural hash, for round-trip verification (§8).
    pub fn struct_hash(&self) -> u64 {
        self.struct_hash
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.matrix[i * self.dim..(i + 1) * self.dim]
    }

    /// Top-k nearest neighbors by cosine similarity (§4.1 `topk`).
    ///
    /// `k` is clamped to the shard's row count when the shard has fewer
    /// than `k` rows (no error). Selection uses a bounded min-heap of
    /// capacity `k` so the hot path never performs a full sort.
    pub fn topk(&self, query: &Embedding, k: usize) -> Result<Vec<NeighborHit>> {
        if query.dim() != self.dim {
            return Err(Error::DimMismatch {
                expected: self.dim,
                got: query.dim(),
            });
        }
        let k = k.min(self.count).max(1);
        let q = query.as_slice();

        let mut heap: BinaryHeap<Reverse<ScoredRow>> = BinaryHeap::with_capacity(k);
        for i in 0..self.count {
            let score = dot(q, self.row(i));
            let candidate = ScoredRow {
                score,
                row: i as u32,
                label_id: self.label_ids[i],
            };
            if heap.len() < k {
                heap.push(Reverse(candidate));
            } else if let Some(Reverse(worst)) = heap.peek() {
                if candidate > *worst {
                    heap.pop();
                    heap.push(Reverse(candidate));
                }
            }
        }

        let mut rows: Vec<ScoredRow> = heap.into_iter().map(|Reverse(r)| r).collect();
        rows.sort_by(|a, b| b.cmp(a));

        Ok(rows
            .into_iter()
            .map(|r| {
                NeighborHit::new(
                    self.label_dict[r.label_id as usize].clone(),
                    r.score.clamp(-1.0, 1.0),
                )
            })
            .collect())
    }

    /// `topk` plus aggregation into a winning label (§4.1 `lookup`),
    /// using the shard's own build-time calibrated fallback for labels
    /// with no per-label entry.
    pub fn lookup(&self, query: &Embedding, k: usize) -> Result<MatchResult> {
        self.lookup_with_fallback(query, k, None)
    }

    /// `lookup`, but `fallback_tau` (when given) overrides the shard's
    /// calibrated fallback threshold for labels with no per-label
    /// calibration entry — the runtime hook for `matcher.threshold` (§6),
    /// which exists precisely to cover shards built without enough
    /// same-class pairs to calibrate some label.
    pub fn lookup_with_fallback(
        &self,
        query: &Embedding,
        k: usize,
        fallback_tau: Option<f32>,
    ) -> Result<MatchResult> {
        let neighbors = self.topk(query, k)?;
        let (label, confidence) = match neighbors.first() {
            Some(top) => {
                let label_id = self.label_id_of(&top.label);
                let tau = label_id
                    .filter(|id| self.calibration.quantiles(*id).is_some())
                    .map(|id| self.calibration.tau(id))
                    .unwrap_or_else(|| fallback_tau.unwrap_or(self.calibration.fallback_tau));
                if top.score >= tau {
                    (top.label.clone(), top.score)
                } else {
                    (UNKNOWN_LABEL.to_string(), 0.0)
                }
            }
            None => (UNKNOWN_LABEL.to_string(), 0.0),
        };

        Ok(MatchResult {
            label,
            confidence,
            neighbors,
            backend: ACTIVE_BACKEND,
            stride: 1,
            budget_hit: false,
            bbox: None,
            timestamp_ms: None,
            sdk_version: vrt_core::sdk::SDK_VERSION,
        })
    }

    fn label_id_of(&self, label: &str) -> Option<u32> {
        self.label_dict
            .iter()
            .position(|l| l == label)
            .map(|i| i as u32)
    }

    /// Read-only access to the calibration table, e.g. for reporting.
    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f32>().clamp(-1.0, 1.0)
}

/// Derive same-class / nearest-other-class score samples per label and
/// build the shard's calibration table.
fn calibrate(
    pairs: &[ExemplarRow],
    label_index: &HashMap<&str, u32>,
    epsilon: f64,
    recall: f64,
) -> CalibrationTable {
    let mut by_label: HashMap<u32, Vec<&Embedding>> = HashMap::new();
    for row in pairs {
        by_label
            .entry(label_index[row.label.as_str()])
            .or_default()
            .push(&row.vector);
    }

    let mut samples: HashMap<u32, LabelSamples> = HashMap::new();
    for (&label_id, vectors) in &by_label {
        let mut same_class = Vec::new();
        for i in 0..vectors.len() {
            for j in (i + 1)..vectors.len() {
                if let Ok(score) = vectors[i].cosine(vectors[j]) {
                    same_class.push(score);
                }
            }
        }

        let mut other_class = Vec::new();
        for (&other_id, other_vectors) in &by_label {
            if other_id == label_id {
                continue;
            }
            for v in vectors {
                for ov in other_vectors {
                    if let Ok(score) = v.cosine(ov) {
                        other_class.push(score);
                    }
                }
            }
        }

        samples.insert(
            label_id,
            LabelSamples {
                same_class,
                other_class,
            },
        );
    }

    build_calibration(&samples, epsilon, recall)
}

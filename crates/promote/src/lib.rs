//! Offline KB promotion: deterministic herding of accepted Ledger entries
//! into ≤3 int8 medoids per class (§4.5).
//!
//! This crate never runs concurrently with the hot loop (§9 "staging"):
//! it is a batch job a CLI subcommand invokes against a closed Ledger
//! file, writing medoid files the next run's LabelBank shard build can
//! pick up. The file-replace strategy (write-temp, fsync, rename) mirrors
//! the teacher's durability-layer snapshot writer; the content digest
//! uses `blake2`, added for exactly this reason (see DESIGN.md).

#![warn(missing_docs)]
#![warn(clippy::all)]

use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use vrt_core::embedding::Embedding;
use vrt_core::error::{Error, Result};
use vrt_ledger::LedgerEntry;

/// Diversity penalty weight λ in the herding objective (§4.5 step 3).
pub const DEFAULT_LAMBDA: f64 = 0.5;

/// Maximum medoids retained per class (§3, §4.5, §8 invariant).
pub const MAX_MEDOIDS_PER_CLASS: usize = 3;

/// Length in bytes of the trailing content digest.
const DIGEST_LEN: usize = 32;

/// Non-fatal reason a promotion step was skipped (§4.5, §7 `PromotionSkip`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionSkip {
    /// The class had zero accepted Ledger entries.
    EmptyClass {
        /// Skipped class label.
        label: String,
    },
}

impl std::fmt::Display for PromotionSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromotionSkip::EmptyClass { label } => {
                write!(f, "class '{label}' skipped: no accepted entries")
            }
        }
    }
}

/// An accepted Ledger entry, grouped by class for promotion.
#[derive(Debug, Clone)]
pub struct AcceptedEntry {
    /// Class label.
    pub label: String,
    /// L2-normalized float32 embedding.
    pub embedding: Embedding,
    /// Originating Ledger sequence number, used as the herding tie-break.
    pub sequence: u64,
}

/// Group accepted entries from a loaded Ledger by class label, in
/// ascending sequence order within each group (§4.5 tie-break input).
pub fn accepted_by_class(entries: &[LedgerEntry]) -> HashMap<String, Vec<AcceptedEntry>> {
    let mut by_class: HashMap<String, Vec<AcceptedEntry>> = HashMap::new();
    for entry in entries {
        if !entry.accepted {
            continue;
        }
        let Ok(embedding) = Embedding::new(entry.embedding.clone()) else {
            continue;
        };
        by_class
            .entry(entry.label.clone())
            .or_default()
            .push(AcceptedEntry {
                label: entry.label.clone(),
                embedding,
                sequence: entry.sequence,
            });
    }
    for group in by_class.values_mut() {
        group.sort_by_key(|e| e.sequence);
    }
    by_class
}

/// A single chosen medoid, float-precision, before quantization.
struct ChosenMedoid {
    vector: Embedding,
    sequence: u64,
}

/// Greedily select up to [`MAX_MEDOIDS_PER_CLASS`] medoids maximizing
/// `<mu, m_j> - lambda * max_{i<j} <m_i, m_j>` (§4.5 step 3).
fn herd(entries: &[AcceptedEntry], lambda: f64) -> Result<Vec<ChosenMedoid>> {
    let dim = entries[0].embedding.dim();
    let mut sum = vec![0f64; dim];
    for entry in entries {
        for (acc, v) in sum.iter_mut().zip(entry.embedding.as_slice()) {
            *acc += *v as f64;
        }
    }
    let norm: f64 = sum.iter().map(|v| v * v).sum::<f64>().sqrt();
    let mu_values: Vec<f32> = if norm > 0.0 {
        sum.iter().map(|v| (v / norm) as f32).collect()
    } else {
        sum.iter().map(|_| 0.0).collect()
    };
    let mu = Embedding::new_unchecked(mu_values);

    let mut chosen: Vec<ChosenMedoid> = Vec::new();
    let mut remaining: Vec<&AcceptedEntry> = entries.iter().collect();

    while chosen.len() < MAX_MEDOIDS_PER_CLASS && !remaining.is_empty() {
        let mut best_idx = 0usize;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, candidate) in remaining.iter().enumerate() {
            let centroid_term = mu.cosine(&candidate.embedding)? as f64;
            let diversity_term = chosen
                .iter()
                .map(|m| m.vector.cosine(&candidate.embedding).unwrap_or(-1.0) as f64)
                .fold(f64::NEG_INFINITY, f64::max);
            let diversity_term = if diversity_term.is_finite() {
                diversity_term
            } else {
                0.0
            };
            let score = centroid_term - lambda * diversity_term;
            // Tie-break toward earliest ledger sequence: since `remaining`
            // is scanned in ascending-sequence order and ties only update
            // `best_score` on a strictly greater score, the first (oldest)
            // candidate at a given score wins by construction.
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        let picked = remaining.remove(best_idx);
        chosen.push(ChosenMedoid {
            vector: picked.embedding.clone(),
            sequence: picked.sequence,
        });
    }

    Ok(chosen)
}

/// An int8-quantized medoid ready for on-disk storage (§6 medoid file).
#[derive(Debug, Clone, PartialEq)]
pub struct Medoid {
    /// Embedding dimension.
    pub dim: u32,
    /// 1-based ordinal among this class's medoids.
    pub ordinal: u8,
    /// Per-component quantization scale: `127 / max(|v|)`.
    pub scale: f32,
    /// Quantization zero-point; always `0` (§6).
    pub zero: i8,
    /// Quantized payload, `dim` int8 components.
    pub payload: Vec<i8>,
}

impl Medoid {
    /// Quantize a float32 medoid to int8 (§4.5 step 4).
    pub fn quantize(vector: &Embedding, ordinal: u8) -> Medoid {
        let values = vector.as_slice();
        let max_abs = values.iter().fold(0f32, |acc, v| acc.max(v.abs()));
        let scale = if max_abs > 0.0 { 127.0 / max_abs } else { 1.0 };
        let payload: Vec<i8> = values
            .iter()
            .map(|v| (v * scale).round().clamp(-127.0, 127.0) as i8)
            .collect();
        Medoid {
            dim: vector.dim() as u32,
            ordinal,
            scale,
            zero: 0,
            payload,
        }
    }

    /// Dequantize back to float32 (for round-trip error checks, §8).
    pub fn dequantize(&self) -> Vec<f32> {
        self.payload
            .iter()
            .map(|v| *v as f32 / self.scale)
            .collect()
    }

    fn digest(&self) -> [u8; DIGEST_LEN] {
        let mut hasher = Blake2s256::new();
        hasher.update(self.payload.iter().map(|v| *v as u8).collect::<Vec<u8>>());
        let out = hasher.finalize();
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&out);
        digest
    }

    /// Serialize to the on-disk medoid layout: fixed header, payload,
    /// trailing content digest (§6).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 1 + 4 + 1 + self.payload.len() + DIGEST_LEN);
        out.extend_from_slice(&self.dim.to_le_bytes());
        out.push(self.ordinal);
        out.extend_from_slice(&self.scale.to_le_bytes());
        out.push(self.zero as u8);
        out.extend(self.payload.iter().map(|v| *v as u8));
        out.extend_from_slice(&self.digest());
        out
    }

    /// Parse and validate a medoid file, checking the trailing digest
    /// against the payload bytes that precede it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Medoid> {
        if bytes.len() < 10 + DIGEST_LEN {
            return Err(Error::Data("medoid file too short".into()));
        }
        let dim = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let ordinal = bytes[4];
        let scale = f32::from_le_bytes(bytes[5..9].try_into().unwrap());
        let zero = bytes[9] as i8;
        let payload_end = 10 + dim as usize;
        if bytes.len() != payload_end + DIGEST_LEN {
            return Err(Error::Data("medoid file length does not match dim".into()));
        }
        let payload: Vec<i8> = bytes[10..payload_end].iter().map(|b| *b as i8).collect();
        let medoid = Medoid {
            dim,
            ordinal,
            scale,
            zero,
            payload,
        };
        let expected = &bytes[payload_end..payload_end + DIGEST_LEN];
        if medoid.digest().as_slice() != expected {
            return Err(Error::Data("medoid digest mismatch".into()));
        }
        Ok(medoid)
    }

    /// Write via write-temp + rename, the only mutation path for medoid
    /// files — always a full atomic replace, never an in-place edit (§4.5
    /// step 5, §5 "Medoid files are replaced atomically").
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&self.to_bytes())?;
            tmp.flush()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Read and validate a medoid file from disk.
    pub fn read(path: impl AsRef<Path>) -> Result<Medoid> {
        let mut file = File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Medoid::from_bytes(&bytes)
    }
}

/// A single line appended to `promotion_ledger` after a class finishes
/// promotion (§4.5 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRecord {
    /// Class label that was promoted.
    pub class: String,
    /// Ledger sequences of the chosen medoids, in ordinal order.
    pub chosen_sequences: Vec<u64>,
    /// Hex digest of the written medoid files, concatenated in ordinal order.
    pub digest: String,
}

/// Append-only log of promotion runs, one JSON line per class promoted.
pub struct PromotionLedger {
    path: PathBuf,
}

impl PromotionLedger {
    /// Open (or create) the promotion ledger file.
    pub fn open(path: impl Into<PathBuf>) -> PromotionLedger {
        PromotionLedger { path: path.into() }
    }

    /// Append a promotion record, durable on return.
    pub fn append(&self, record: &PromotionRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Outcome of promoting every class present in a grouped accepted-entry map.
#[derive(Debug, Default)]
pub struct PromotionSummary {
    /// Classes successfully promoted, with their medoid count.
    pub promoted: Vec<(String, usize)>,
    /// Classes skipped, with the reason (§4.5 failures).
    pub skipped: Vec<PromotionSkip>,
}

/// Promote a single class's accepted entries to quantized medoid files
/// under `out_dir`, named `<label>.medoid.<ordinal>`, and append a record
/// to `promotion_ledger` (§4.5).
///
/// `EmptyClass` is non-fatal and returned as `Ok(None)`; any I/O failure
/// aborts the whole run (§4.5 failures) and leaves previously-written
/// medoids for other classes untouched, since each class's files are
/// replaced independently via atomic rename.
pub fn promote_class(
    label: &str,
    entries: &[AcceptedEntry],
    out_dir: impl AsRef<Path>,
    ledger: &PromotionLedger,
    lambda: f64,
) -> Result<Option<usize>> {
    if entries.is_empty() {
        tracing::info!(label, "promotion skipped: empty class");
        return Ok(None);
    }

    let chosen = herd(entries, lambda)?;
    let mut sequences = Vec::with_capacity(chosen.len());
    let mut digest_bytes = Vec::new();

    for (i, medoid_src) in chosen.iter().enumerate() {
        let ordinal = (i + 1) as u8;
        let medoid = Medoid::quantize(&medoid_src.vector, ordinal);
        let path = out_dir
            .as_ref()
            .join(format!("{label}.medoid.{ordinal}"));
        medoid.write_atomic(&path)?;
        sequences.push(medoid_src.sequence);
        digest_bytes.extend_from_slice(&medoid.digest());
    }

    let record = PromotionRecord {
        class: label.to_string(),
        chosen_sequences: sequences,
        digest: hex_encode(&digest_bytes),
    };
    ledger.append(&record)?;

    tracing::info!(label, medoids = chosen.len(), "promoted class");
    Ok(Some(chosen.len()))
}

/// Promote every class present in `by_class` (§4.5, driving CLI `promote`
/// subcommand).
pub fn promote_all(
    by_class: &HashMap<String, Vec<AcceptedEntry>>,
    out_dir: impl AsRef<Path>,
    ledger: &PromotionLedger,
    lambda: f64,
) -> Result<PromotionSummary> {
    fs::create_dir_all(out_dir.as_ref())?;
    let mut summary = PromotionSummary::default();
    let mut labels: Vec<&String> = by_class.keys().collect();
    labels.sort();
    for label in labels {
        let entries = &by_class[label];
        match promote_class(label, entries, out_dir.as_ref(), ledger, lambda)? {
            Some(count) => summary.promoted.push((label.clone(), count)),
            None => summary.skipped.push(PromotionSkip::EmptyClass {
                label: label.clone(),
            }),
        }
    }
    Ok(summary)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
fn cosine_error(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (na * nb)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn unit(vals: &[f32]) -> Embedding {
        let norm = vals.iter().map(|v| v * v).sum::<f32>().sqrt();
        Embedding::new(vals.iter().map(|v| v / norm).collect()).unwrap()
    }

    fn entries_for(label: &str, vectors: &[Vec<f32>]) -> Vec<AcceptedEntry> {
        vectors
            .iter()
            .enumerate()
            .map(|(i, v)| AcceptedEntry {
                label: label.to_string(),
                embedding: unit(v),
                sequence: i as u64,
            })
            .collect()
    }

    #[test]
    fn quantize_round_trip_cosine_error_within_tolerance() {
        let v = unit(&[0.3, -0.7, 0.5, 0.1, -0.2]);
        let medoid = Medoid::quantize(&v, 1);
        let dequantized = medoid.dequantize();
        let err = cosine_error(v.as_slice(), &dequantized);
        assert!(err <= 5e-3, "cosine error {err} exceeds tolerance");
    }

    #[test]
    fn medoid_file_round_trips_through_bytes() {
        let v = unit(&[1.0, 2.0, -3.0]);
        let medoid = Medoid::quantize(&v, 2);
        let bytes = medoid.to_bytes();
        let reparsed = Medoid::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed, medoid);
    }

    #[test]
    fn tampered_payload_fails_digest_check() {
        let v = unit(&[1.0, 2.0, -3.0]);
        let medoid = Medoid::quantize(&v, 1);
        let mut bytes = medoid.to_bytes();
        let payload_start = 10;
        bytes[payload_start] ^= 0xFF;
        assert!(Medoid::from_bytes(&bytes).is_err());
    }

    #[test]
    fn promotion_caps_at_three_medoids() {
        let dir = tempdir().unwrap();
        let vectors: Vec<Vec<f32>> = (0..10)
            .map(|i| vec![1.0, 0.05 * i as f32, -0.02 * i as f32])
            .collect();
        let entries = entries_for("widget", &vectors);
        let ledger = PromotionLedger::open(dir.path().join("promotion_ledger.jsonl"));

        let count = promote_class("widget", &entries, dir.path(), &ledger, DEFAULT_LAMBDA)
            .unwrap()
            .unwrap();
        assert!(count <= MAX_MEDOIDS_PER_CLASS);
        assert_eq!(count, 3);

        for ordinal in 1..=count {
            let path = dir.path().join(format!("widget.medoid.{ordinal}"));
            assert!(path.exists());
        }
    }

    #[test]
    fn empty_class_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let ledger = PromotionLedger::open(dir.path().join("promotion_ledger.jsonl"));
        let result = promote_class("ghost", &[], dir.path(), &ledger, DEFAULT_LAMBDA).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn promote_all_groups_by_class_and_writes_ledger() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join("promotion_ledger.jsonl");
        let ledger = PromotionLedger::open(&ledger_path);

        let mut by_class = HashMap::new();
        by_class.insert(
            "red-mug".to_string(),
            entries_for("red-mug", &[vec![1.0, 0.1], vec![0.95, 0.05]]),
        );
        by_class.insert("empty-class".to_string(), vec![]);

        let summary = promote_all(&by_class, dir.path(), &ledger, DEFAULT_LAMBDA).unwrap();
        assert_eq!(summary.promoted.len(), 1);
        assert_eq!(summary.skipped.len(), 1);
        assert!(ledger_path.exists());
    }

    #[test]
    fn accepted_by_class_filters_rejects_and_sorts_by_sequence() {
        let entries = vec![
            LedgerEntry {
                label: "a".into(),
                embedding: vec![1.0, 0.0],
                accepted: true,
                reason: None,
                timestamp_ms: 0,
                sequence: 3,
                prev_hash: vrt_ledger::GENESIS_HASH.to_string(),
                entry_hash: String::new(),
            },
            LedgerEntry {
                label: "a".into(),
                embedding: vec![0.0, 1.0],
                accepted: false,
                reason: Some("below tau".into()),
                timestamp_ms: 0,
                sequence: 1,
                prev_hash: vrt_ledger::GENESIS_HASH.to_string(),
                entry_hash: String::new(),
            },
            LedgerEntry {
                label: "a".into(),
                embedding: vec![0.9, 0.1],
                accepted: true,
                reason: None,
                timestamp_ms: 0,
                sequence: 2,
                prev_hash: vrt_ledger::GENESIS_HASH.to_string(),
                entry_hash: String::new(),
            },
        ];
        let by_class = accepted_by_class(&entries);
        let group = by_class.get("a").unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].sequence, 2);
        assert_eq!(group[1].sequence, 3);
    }
}

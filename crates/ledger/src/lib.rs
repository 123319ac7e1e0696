//! Evidence Ledger: the append-only, hash-chained record of verified
//! candidates (§4.6).
//!
//! Grounded on two teacher patterns: the causal hash chain from
//! `primitives/src/event_log.rs` (upgraded here from `DefaultHasher` to
//! real SHA-256, the upgrade path that file's own doc comment calls
//! out), and the JSONL append-with-flush discipline of a line-delimited
//! evidence log — `OpenOptions::append(true)` plus an explicit `flush`
//! so `append` is durable before it returns.
//!
//! Each entry carries two hashes: `prev_hash` links it to its
//! predecessor (reordering/deletion detection), and `entry_hash` is a
//! digest of the entry's own content (corruption detection, localized
//! to the tampered entry itself — see §8 scenario 5: corrupting an
//! entry's embedding on disk must be caught *at that entry*, not one
//! entry downstream).

#![warn(missing_docs)]
#![warn(clippy::all)]

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use vrt_core::error::{Error, Result};

/// Length in hex characters of a SHA-256 digest.
const GENESIS_HASH_LEN: usize = 64;

/// Hex `prev_hash` used by the very first entry in a chain: 64 `'0'`
/// characters, matching the width of a real SHA-256 hex digest.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Owned copy of [`GENESIS_HASH`], for callers that need a `String`.
pub fn genesis_hash() -> String {
    GENESIS_HASH.to_string()
}

/// A single append-only record: a Verify outcome, accepted or rejected
/// (§4.3, §4.6). Only `accepted == true` entries feed KB promotion;
/// rejected entries still appear so the calibration-accounting
/// invariant `called == accepted + rejected` is verifiable from the
/// ledger alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Proposed label.
    pub label: String,
    /// The re-embedded candidate vector, float32, L2-normalized.
    pub embedding: Vec<f32>,
    /// Verify's decision.
    pub accepted: bool,
    /// Single-line reason, populated on reject (e.g. `UnknownLabel`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Wall-clock timestamp, milliseconds since epoch.
    pub timestamp_ms: u64,
    /// Strictly monotonic sequence number, starting at 0.
    pub sequence: u64,
    /// Hex SHA-256 of the previous entry's own [`Self::entry_hash`], or
    /// [`GENESIS_HASH`] for `sequence == 0`.
    pub prev_hash: String,
    /// Hex SHA-256 of this entry's own content (every field above),
    /// computed at append time. Lets [`verify_chain`] localize
    /// corruption to the tampered entry itself instead of reporting it
    /// one entry downstream, which is all `prev_hash` linkage alone
    /// could ever do.
    pub entry_hash: String,
}

/// The subset of a [`LedgerEntry`]'s fields that feed its own
/// `entry_hash` — everything except `entry_hash` itself, so the digest
/// can't include its own value.
#[derive(Serialize)]
struct EntryContent<'a> {
    label: &'a str,
    embedding: &'a [f32],
    accepted: bool,
    reason: &'a Option<String>,
    timestamp_ms: u64,
    sequence: u64,
    prev_hash: &'a str,
}

/// Hash of `entry`'s own content, independent of what it claims its
/// `entry_hash` is. Recomputing this and comparing against the stored
/// `entry_hash` is how on-disk tampering is localized to the exact
/// entry that was changed.
fn content_hash(entry: &LedgerEntry) -> Result<String> {
    let content = EntryContent {
        label: &entry.label,
        embedding: &entry.embedding,
        accepted: entry.accepted,
        reason: &entry.reason,
        timestamp_ms: entry.timestamp_ms,
        sequence: entry.sequence,
        prev_hash: &entry.prev_hash,
    };
    let bytes = serde_json::to_vec(&content)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Result of scanning a ledger file for corruption (§4.6 contract).
#[derive(Debug, Clone, PartialEq)]
pub struct ChainVerification {
    /// Number of entries read.
    pub length: u64,
    /// Count of entries with `accepted == true`.
    pub accepted: u64,
    /// Count of entries with `accepted == false`.
    pub rejected: u64,
}

/// Verify that `entries` form an unbroken hash chain from genesis, with
/// strictly increasing sequence numbers and every entry's own content
/// matching its recorded `entry_hash` (§8 invariant).
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<ChainVerification> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut accepted = 0u64;
    let mut rejected = 0u64;

    for (i, entry) in entries.iter().enumerate() {
        if entry.sequence != i as u64 {
            return Err(Error::LedgerCorrupt {
                sequence: entry.sequence,
                reason: format!("expected sequence {i}, found {}", entry.sequence),
            });
        }
        if entry.prev_hash != expected_prev {
            return Err(Error::LedgerCorrupt {
                sequence: entry.sequence,
                reason: "prev_hash does not match the preceding entry's hash".to_string(),
            });
        }
        let recomputed = content_hash(entry)?;
        if recomputed != entry.entry_hash {
            return Err(Error::LedgerCorrupt {
                sequence: entry.sequence,
                reason: "entry content does not match its recorded hash".to_string(),
            });
        }

        expected_prev = entry.entry_hash.clone();
        if entry.accepted {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }

    Ok(ChainVerification {
        length: entries.len() as u64,
        accepted,
        rejected,
    })
}

struct WriterState {
    file: File,
    next_sequence: u64,
    head_hash: String,
}

/// An append-only ledger file, single-writer, hash-chained.
///
/// All appends serialize through an internal mutex (§5 "single-writer
/// mutual-exclusion guard"); in practice only the Oracle's background
/// worker ever calls `append`, but the guard makes that a documented
/// invariant rather than an assumption.
pub struct Ledger {
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl Ledger {
    /// Open an existing ledger file (verifying its chain) or create a
    /// new empty one.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Ledger> {
        let path = path.into();
        let (next_sequence, head_hash) = if path.exists() {
            let entries = read_entries(&path)?;
            let verification = verify_chain(&entries)?;
            let head = match entries.last() {
                Some(last) => last.entry_hash.clone(),
                None => GENESIS_HASH.to_string(),
            };
            (verification.length, head)
        } else {
            (0, GENESIS_HASH.to_string())
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        tracing::info!(path = %path.display(), next_sequence, "opened evidence ledger");

        Ok(Ledger {
            path,
            state: Mutex::new(WriterState {
                file,
                next_sequence,
                head_hash,
            }),
        })
    }

    /// Append a new entry. Durable after return: the write is flushed
    /// to disk before this call returns (§4.6 contract).
    pub fn append(
        &self,
        label: impl Into<String>,
        embedding: Vec<f32>,
        accepted: bool,
        reason: Option<String>,
        timestamp_ms: u64,
    ) -> Result<LedgerEntry> {
        let mut state = self.state.lock();

        let mut entry = LedgerEntry {
            label: label.into(),
            embedding,
            accepted,
            reason,
            timestamp_ms,
            sequence: state.next_sequence,
            prev_hash: state.head_hash.clone(),
            entry_hash: String::new(),
        };
        entry.entry_hash = content_hash(&entry)?;

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        state.file.write_all(&line)?;
        state.file.flush()?;

        state.head_hash = entry.entry_hash.clone();
        state.next_sequence += 1;

        if accepted {
            tracing::debug!(sequence = entry.sequence, label = %entry.label, "ledger: accepted");
        }

        Ok(entry)
    }

    /// Path of the backing JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file from disk and verify the chain, returning all
    /// entries in sequence order.
    pub fn load(&self) -> Result<Vec<LedgerEntry>> {
        read_entries(&self.path)
    }
}

fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let entry: LedgerEntry = serde_json::from_str(&line)?;
        entries.push(entry);
    }
    Ok(entries)
}

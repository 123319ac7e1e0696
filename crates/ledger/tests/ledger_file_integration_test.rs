//! On-disk Evidence Ledger integration tests.
//!
//! The unit tests in `src/lib.rs` tamper with `LedgerEntry` structs
//! in-memory. These drive the real file path instead: write a ledger
//! through the `Ledger` API, edit the JSONL file on disk the way an
//! out-of-band process or a storage fault would, then reopen through
//! `Ledger::open_or_create` (the §4.6 "re-verify on reopen" contract).

use std::fs;
use tempfile::tempdir;
use vrt_core::error::Error;
use vrt_ledger::Ledger;

#[test]
fn reopen_after_a_full_run_sees_every_entry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.jsonl");

    {
        let ledger = Ledger::open_or_create(&path).unwrap();
        ledger.append("wrench", vec![1.0, 0.0], true, None, 1_000).unwrap();
        ledger
            .append("screwdriver", vec![0.0, 1.0], false, Some("below tau".into()), 1_001)
            .unwrap();
        ledger.append("wrench", vec![0.9, 0.1], true, None, 1_002).unwrap();
    }

    let reopened = Ledger::open_or_create(&path).unwrap();
    let entries = reopened.load().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].sequence, 2);
}

#[test]
fn tampering_with_the_jsonl_file_directly_is_caught_on_reopen() {
    // §8 scenario 5: append three accepts A, B, C; corrupt B's embedding
    // on disk; re-open must detect LedgerCorrupt at B itself (sequence
    // 1), not at C — each entry carries a hash of its own content, so
    // corruption localizes to the tampered record regardless of where
    // in the chain it falls.
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.jsonl");

    {
        let ledger = Ledger::open_or_create(&path).unwrap();
        ledger.append("wrench", vec![1.0, 0.0], true, None, 1_000).unwrap(); // A
        ledger.append("pliers", vec![0.0, 1.0], true, None, 1_001).unwrap(); // B
        ledger.append("wrench", vec![0.9, 0.1], true, None, 1_002).unwrap(); // C
    }

    let original = fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = original.lines().map(String::from).collect();
    lines[1] = lines[1].replace("[0.0,1.0]", "[9.9,9.9]");
    fs::write(&path, lines.join("\n") + "\n").unwrap();

    let err = Ledger::open_or_create(&path).unwrap_err();
    assert!(matches!(err, Error::LedgerCorrupt { sequence: 1, .. }));
}

#[test]
fn opening_a_path_that_does_not_exist_yet_creates_an_empty_ledger() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.jsonl");
    assert!(!path.exists());

    let ledger = Ledger::open_or_create(&path).unwrap();
    assert!(ledger.load().unwrap().is_empty());
    assert!(path.exists());
}

//! Fixture I/O: turns a JSONL file of pre-computed embeddings into the
//! [`vrt_engine::FrameSource`]/[`vrt_engine::Embedder`] pair the engine is
//! built against.
//!
//! §6 "Inbound from collaborators" treats frame capture and the embedder
//! model as external collaborators with defined interfaces only; this CLI
//! is a reference collaborator that replays a fixture instead of a live
//! camera, matching §4.3's "in the current spec the embedding is reused"
//! note — there is no raw-frame decode step here, just already-embedded
//! rows read back off disk.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use serde::Deserialize;
use vrt_core::embedding::Embedding;
use vrt_core::error::{Error, Result};
use vrt_core::match_result::BBox;
use vrt_engine::{Embedder, FrameSource, UpstreamStageDurations};

/// One line of a fixture file: an already-L2-normalized embedding plus
/// optional per-frame metadata the engine threads through to
/// `MatchResult` and `stage_timings.csv`.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameRecord {
    /// Raw embedding components; validated to unit norm on read.
    pub embedding: Vec<f32>,
    /// Optional bounding-box hint (§3 `MatchResult.bbox`).
    #[serde(default)]
    pub bbox: Option<BBox>,
    /// Optional frame timestamp, milliseconds.
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
    /// Upstream detector cost for this frame, milliseconds. Defaults to 0
    /// for fixtures with no detector in front of them.
    #[serde(default)]
    pub detect_ms: f64,
    /// Upstream tracker cost for this frame, milliseconds.
    #[serde(default)]
    pub track_ms: f64,
}

/// Streams [`FrameRecord`]s from a JSONL file, one object per line.
pub struct FixtureSource {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    last_upstream: UpstreamStageDurations,
}

impl FixtureSource {
    /// Open a fixture file for streaming (§6 "an iterator producing frames").
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(FixtureSource {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            last_upstream: UpstreamStageDurations::default(),
        })
    }
}

impl FrameSource for FixtureSource {
    type Frame = FrameRecord;

    fn next_frame(&mut self) -> Option<Self::Frame> {
        loop {
            let line = self.lines.next()?.ok()?;
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: FrameRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(line = self.line_no, error = %e, "skipping malformed fixture row");
                    continue;
                }
            };
            self.last_upstream = UpstreamStageDurations {
                detect_ms: record.detect_ms,
                track_ms: record.track_ms,
            };
            return Some(record);
        }
    }

    fn bbox_hint(&self, frame: &Self::Frame) -> Option<BBox> {
        frame.bbox
    }

    fn timestamp_ms(&self, frame: &Self::Frame) -> Option<u64> {
        frame.timestamp_ms
    }

    fn upstream_stage_durations(&self) -> UpstreamStageDurations {
        self.last_upstream
    }
}

/// An identity embedder: the fixture already carries the embedding, so
/// `embed` just validates and returns it (§4.3 step 1, §6 embedder
/// interface). A deployment with a real model swaps this for one that
/// decodes pixels instead.
pub struct IdentityEmbedder;

impl Embedder for IdentityEmbedder {
    type Frame = FrameRecord;

    fn embed(&self, frame: &Self::Frame) -> Result<Embedding> {
        Embedding::new(frame.embedding.clone())
            .map_err(|_| Error::Data("fixture row is not a valid L2-normalized embedding".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn reads_embedding_rows_skipping_blank_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"embedding":[1.0,0.0]}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"embedding":[0.0,1.0],"timestamp_ms":42}}"#).unwrap();

        let mut source = FixtureSource::open(file.path()).unwrap();
        let first = source.next_frame().unwrap();
        assert_eq!(first.embedding, vec![1.0, 0.0]);
        let second = source.next_frame().unwrap();
        assert_eq!(second.timestamp_ms, Some(42));
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn identity_embedder_validates_norm() {
        let embedder = IdentityEmbedder;
        let bad = FrameRecord {
            embedding: vec![1.0, 1.0],
            bbox: None,
            timestamp_ms: None,
            detect_ms: 0.0,
            track_ms: 0.0,
        };
        assert!(embedder.embed(&bad).is_err());
    }
}

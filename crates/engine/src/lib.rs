//! The recognition engine's hot loop (§2 system overview).
//!
//! This crate owns exactly one thing: turning a [`FrameSource`] of input
//! frames into a sequence of [`vrt_core::MatchResult`]s plus end-of-run
//! telemetry, by driving LabelBank, the latency Controller, the
//! Candidate Oracle, Verify, the Evidence Ledger, and Telemetry in the
//! shape described in spec §2 and §5. Every other crate in this
//! workspace is a component this one wires together; none of them know
//! about each other directly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collaborators;
pub mod pipeline;

pub use collaborators::{Embedder, FrameSource, UpstreamStageDurations};
pub use pipeline::{Engine, RunReport};

#[cfg(test)]
mod tests {
    use super::*;
    use vrt_core::config::Config;
    use vrt_core::embedding::Embedding;
    use vrt_core::error::Result;
    use vrt_core::match_result::UNKNOWN_LABEL;
    use vrt_labelbank::shard::ExemplarRow;
    use vrt_labelbank::Shard;
    use vrt_ledger::Ledger;
    use vrt_verify::Gallery;

    fn unit(vals: &[f32]) -> Embedding {
        let norm = vals.iter().map(|v| v * v).sum::<f32>().sqrt();
        Embedding::new(vals.iter().map(|v| v / norm).collect()).unwrap()
    }

    struct FixedEmbedder;

    impl Embedder for FixedEmbedder {
        type Frame = Embedding;

        fn embed(&self, frame: &Embedding) -> Result<Embedding> {
            Ok(frame.clone())
        }
    }

    /// Replays a fixed sequence of pre-built embeddings, one per frame.
    struct ScriptedFrames {
        frames: std::vec::IntoIter<Embedding>,
    }

    impl ScriptedFrames {
        fn new(frames: Vec<Embedding>) -> Self {
            ScriptedFrames {
                frames: frames.into_iter(),
            }
        }
    }

    impl FrameSource for ScriptedFrames {
        type Frame = Embedding;

        fn next_frame(&mut self) -> Option<Embedding> {
            self.frames.next()
        }
    }

    fn build_shard() -> Shard {
        let e1 = unit(&[1.0, 0.0]);
        let e2 = unit(&[0.6, 0.8]);
        Shard::build(
            vec![
                ExemplarRow {
                    label: "red-mug".to_string(),
                    vector: e1,
                },
                ExemplarRow {
                    label: "maroon-cup".to_string(),
                    vector: e2,
                },
            ],
            0.01,
            0.95,
        )
        .unwrap()
    }

    #[test]
    fn known_hit_produces_expected_label() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open_or_create(dir.path().join("ledger.jsonl")).unwrap();
        let query = unit(&[0.99, 0.05]);
        let frames = ScriptedFrames::new(vec![query]);

        let mut engine =
            Engine::new(Config::default(), build_shard(), Gallery::new(), ledger, frames);
        let report = engine.run(&FixedEmbedder).unwrap();

        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.label, "red-mug");
        assert!(result.label_matches_top_neighbor());
        assert!(result.neighbors_sorted_desc());
    }

    #[test]
    fn open_set_query_is_unknown_and_enqueued_for_verify() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open_or_create(dir.path().join("ledger.jsonl")).unwrap();
        // With a single exemplar per label there are no same-class pairs to
        // calibrate from, so the fallback threshold is 0.0 (§4.4); a query
        // that scores negative against every row still falls below it.
        let query = unit(&[-1.0, -1.0, 0.0]);
        let shard = Shard::build(
            vec![
                ExemplarRow {
                    label: "red-mug".to_string(),
                    vector: unit(&[1.0, 0.0, 0.0]),
                },
                ExemplarRow {
                    label: "maroon-cup".to_string(),
                    vector: unit(&[0.0, 1.0, 0.0]),
                },
            ],
            0.01,
            0.95,
        )
        .unwrap();
        let frames = ScriptedFrames::new(vec![query]);

        let mut engine = Engine::new(Config::default(), shard, Gallery::new(), ledger, frames);
        let report = engine.run(&FixedEmbedder).unwrap();

        let result = &report.results[0];
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!(!result.neighbors.is_empty());
        // Unknown queries are handed to the Oracle for shadow-mode verify.
        assert_eq!(report.oracle_metrics.enqueued, 1);
    }

    #[test]
    fn skipped_frames_reuse_last_processed_unknown_value() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open_or_create(dir.path().join("ledger.jsonl")).unwrap();

        let config = Config {
            pipeline_frame_stride: 3,
            pipeline_min_stride: 3,
            pipeline_max_stride: 3,
            pipeline_auto_stride: false,
            ..Config::default()
        };

        let query = unit(&[0.99, 0.05]);
        let frames = ScriptedFrames::new(vec![query.clone(), query.clone(), query]);

        let mut engine = Engine::new(config, build_shard(), Gallery::new(), ledger, frames);
        let report = engine.run(&FixedEmbedder).unwrap();

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[0].label, "red-mug");
        assert!(!report.results[0].budget_hit);
        // Skipped frames carry the prior label forward and flag budget_hit.
        assert_eq!(report.results[1].label, report.results[0].label);
        assert!(report.results[1].budget_hit);
        assert_eq!(report.results[2].label, report.results[0].label);
        assert!(report.results[2].budget_hit);
    }

    #[test]
    fn metrics_report_kb_size_matches_shard_count() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open_or_create(dir.path().join("ledger.jsonl")).unwrap();
        let frames = ScriptedFrames::new(vec![unit(&[1.0, 0.0])]);

        let mut engine =
            Engine::new(Config::default(), build_shard(), Gallery::new(), ledger, frames);
        let report = engine.run(&FixedEmbedder).unwrap();

        assert_eq!(report.metrics.kb_size, 2);
        assert_eq!(report.metrics.metrics_schema_version, "0.1");
    }

    #[test]
    fn controller_raises_stride_under_sustained_overbudget_load() {
        // §8 scenario 3: embed only runs on processed frames, so once the
        // controller starts skipping, skipped frames cost near nothing
        // and processed frames stay pinned at the embedder's real cost.
        struct SlowEmbedder {
            calls: std::cell::Cell<u64>,
        }
        impl Embedder for SlowEmbedder {
            type Frame = Embedding;
            fn embed(&self, frame: &Embedding) -> Result<Embedding> {
                self.calls.set(self.calls.get() + 1);
                std::thread::sleep(std::time::Duration::from_millis(15));
                Ok(frame.clone())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open_or_create(dir.path().join("ledger.jsonl")).unwrap();
        // A small window (warmup = max(window, 30) = 30) keeps this test's
        // wall-clock cost down while still exercising the real policy.
        let config = Config {
            latency_budget_ms: 10,
            latency_window: 30,
            ..Config::default()
        };
        let query = unit(&[0.99, 0.05]);
        let frames = ScriptedFrames::new(std::iter::repeat(query).take(200).collect());

        let mut engine = Engine::new(config, build_shard(), Gallery::new(), ledger, frames);
        let embedder = SlowEmbedder {
            calls: std::cell::Cell::new(0),
        };
        let report = engine.run(&embedder).unwrap();

        assert!(report.metrics.controller.end_stride > 1);
        assert!(report.metrics.controller.frames_processed < report.metrics.controller.frames_total);
    }
}

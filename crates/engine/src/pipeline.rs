//! The hot loop: wires LabelBank, the Windowed p95 Controller, the
//! Candidate Oracle, Verify, the Evidence Ledger, and Telemetry behind
//! the [`Embedder`]/[`FrameSource`] collaborator traits (§2 system
//! overview, §5 concurrency model).
//!
//! Frame handling is single-threaded and in-line: detect/embed/match
//! happen synchronously per frame. The only background work is the
//! Oracle's single worker thread draining unknown candidates into
//! Verify and, on accept, the Ledger — exactly the "one producer, one
//! consumer, bounded queue" shape `vrt_oracle` already implements.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use vrt_core::config::Config;
use vrt_core::error::Result;
use vrt_core::match_result::{Backend, MatchResult, UNKNOWN_LABEL};
use vrt_core::purity::PurityGuard;
use vrt_labelbank::Shard;
use vrt_ledger::Ledger;
use vrt_oracle::{Candidate, CandidateOracle, OracleMetrics};
use vrt_telemetry::{MetricsReport, Telemetry};
use vrt_verify::{Gallery, VerifyEngine, VerifyMetrics};

use crate::collaborators::{Embedder, FrameSource};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// End-of-run artifacts and bookkeeping, ready to be written to disk by
/// a caller (the CLI) or inspected directly by a test.
pub struct RunReport {
    /// Every per-frame result, in input order.
    pub results: Vec<MatchResult>,
    /// `metrics.json` contents.
    pub metrics: MetricsReport,
    /// Rendered `stage_timings.csv`, ready to write verbatim.
    pub stage_timings: Telemetry,
    /// Oracle queue metrics at end-of-run.
    pub oracle_metrics: OracleMetrics,
    /// Verify calibration-accounting metrics at end-of-run.
    pub verify_metrics: VerifyMetrics,
}

/// Wires every pipeline component into a single run over a
/// [`FrameSource`]'s input.
pub struct Engine<S: FrameSource> {
    config: Config,
    shard: Shard,
    controller: vrt_controller::Controller,
    oracle: CandidateOracle,
    verify_metrics_handle: Arc<VerifyEngine>,
    ledger: Arc<Ledger>,
    purity: PurityGuard,
    telemetry: Telemetry,
    frame_source: S,
}

impl<S: FrameSource> Engine<S> {
    /// Construct an engine from a resolved config, an opened LabelBank
    /// shard, a curated Verify gallery, an evidence ledger, and a frame
    /// source. The Oracle's background worker is spawned immediately and
    /// runs for the lifetime of this engine.
    pub fn new(config: Config, shard: Shard, gallery: Gallery, ledger: Ledger, frame_source: S) -> Self {
        let verify_engine = Arc::new(VerifyEngine::new(gallery));
        let ledger = Arc::new(ledger);

        let worker_verify = Arc::clone(&verify_engine);
        let worker_ledger = Arc::clone(&ledger);
        let oracle = CandidateOracle::spawn(config.oracle_maxlen, move |candidate: Candidate| {
            verify_candidate(&worker_verify, &worker_ledger, candidate);
        });

        let controller = vrt_controller::Controller::new(&config);

        Engine {
            config,
            shard,
            controller,
            oracle,
            verify_metrics_handle: verify_engine,
            ledger,
            purity: PurityGuard::new(),
            telemetry: Telemetry::new(),
            frame_source,
        }
    }

    /// Run to completion: drains the frame source, then shuts the Oracle
    /// worker down (draining its in-flight call, abandoning anything
    /// still queued, per §5 cancellation) and assembles the end-of-run
    /// report.
    pub fn run<E>(&mut self, embedder: &E) -> Result<RunReport>
    where
        E: Embedder<Frame = S::Frame>,
    {
        let run_start = Instant::now();
        let mut results = Vec::new();
        let mut last_result: Option<MatchResult> = None;
        let mut frame_index: u64 = 0;
        let mut last_accounted_ms: f64 = 0.0;

        loop {
            let decision = self.controller.next_decision();
            let frame_start = Instant::now();

            let Some(frame) = self.frame_source.next_frame() else {
                break;
            };
            let bbox = self.frame_source.bbox_hint(&frame);
            let timestamp_ms = self.frame_source.timestamp_ms(&frame);

            let result = if decision.should_process {
                let upstream = self.frame_source.upstream_stage_durations();
                self.telemetry.record_stage("detect", upstream.detect_ms);
                self.telemetry.record_stage("track", upstream.track_ms);
                let mut accounted_ms = upstream.detect_ms + upstream.track_ms;

                let embed_start = Instant::now();
                let embedding = embedder.embed(&frame);
                let embed_ms = embed_start.elapsed().as_secs_f64() * 1000.0;
                self.telemetry.record_stage("embed", embed_ms);
                accounted_ms += embed_ms;

                let mut result = match embedding {
                    Ok(embedding) => {
                        let match_start = Instant::now();
                        let looked_up = self.shard.lookup_with_fallback(
                            &embedding,
                            self.config.matcher_topk,
                            Some(self.config.matcher_threshold),
                        );
                        let match_ms = match_start.elapsed().as_secs_f64() * 1000.0;
                        self.telemetry.record_stage("match", match_ms);
                        accounted_ms += match_ms;

                        match looked_up {
                            Ok(mut result) => {
                                if result.neighbors.len() < self.config.matcher_min_neighbors {
                                    result.label = UNKNOWN_LABEL.to_string();
                                    result.confidence = 0.0;
                                }
                                if result.label == UNKNOWN_LABEL {
                                    self.oracle.try_enqueue(Candidate {
                                        embedding,
                                        proposed_label: result
                                            .neighbors
                                            .first()
                                            .map(|n| n.label.clone())
                                            .unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
                                        neighbors: result.neighbors.clone(),
                                        frame_index,
                                    });
                                }
                                result
                            }
                            Err(_) => unknown_result(),
                        }
                    }
                    Err(_) => unknown_result(),
                };

                result.bbox = bbox;
                result.timestamp_ms = timestamp_ms;
                last_accounted_ms = accounted_ms;
                result
            } else {
                // Skipped: reuse the last processed frame's unknown
                // signal rather than re-running detect/embed/match (§4.7
                // skip semantics).
                let mut result = last_result.clone().unwrap_or_else(unknown_result);
                result.bbox = bbox;
                result.timestamp_ms = timestamp_ms;
                result
            };

            let duration_ms = frame_start.elapsed().as_secs_f64() * 1000.0;
            if decision.should_process {
                let overhead_ms = (duration_ms - last_accounted_ms).max(0.0);
                self.telemetry.record_stage("overhead", overhead_ms);
            }

            let report = self.controller.record(duration_ms, decision.should_process);
            self.telemetry.record_frame(duration_ms);

            let mut final_result = result;
            final_result.stride = report.stride;
            final_result.budget_hit = report.budget_hit;

            if decision.should_process {
                last_result = Some(final_result.clone());
            }
            results.push(final_result);
            frame_index += 1;
        }

        self.oracle.shutdown();

        let run_wall_ms = run_start.elapsed().as_secs_f64() * 1000.0;
        let backend_selected = match vrt_labelbank::ACTIVE_BACKEND {
            Backend::Faiss => "faiss",
            Backend::Numpy => "numpy",
        };
        let metrics = self.telemetry.finalize(
            run_wall_ms,
            self.shard.count(),
            backend_selected,
            self.controller.summary(),
            self.config.unknown_rate_band,
            self.purity.summary(),
            None,
        );

        Ok(RunReport {
            results,
            metrics,
            stage_timings: std::mem::take(&mut self.telemetry),
            oracle_metrics: self.oracle.metrics(),
            verify_metrics: self.verify_metrics_handle.metrics(),
        })
    }

    /// Shard this engine was constructed with (e.g. for `kb_size`
    /// reporting before a run completes).
    pub fn shard(&self) -> &Shard {
        &self.shard
    }
}

fn unknown_result() -> MatchResult {
    MatchResult {
        label: UNKNOWN_LABEL.to_string(),
        confidence: 0.0,
        neighbors: Vec::new(),
        backend: vrt_labelbank::ACTIVE_BACKEND,
        stride: 1,
        budget_hit: false,
        bbox: None,
        timestamp_ms: None,
        sdk_version: vrt_core::sdk::SDK_VERSION,
    }
}

fn verify_candidate(verify: &VerifyEngine, ledger: &Ledger, candidate: Candidate) {
    let outcome = verify.verify(&candidate.proposed_label, &candidate.embedding);
    let append = ledger.append(
        outcome.label,
        candidate.embedding.into_vec(),
        outcome.accepted,
        outcome.reason,
        now_ms(),
    );
    if let Err(e) = append {
        tracing::error!(error = %e, "failed to append verify outcome to ledger");
    }
}

//! Telemetry & Result Schema (§4.8): accumulates per-run statistics and
//! renders the two end-of-run artifacts, `metrics.json` and
//! `stage_timings.csv`.
//!
//! Percentile and mean bookkeeping mirrors `vrt_controller`'s windowed
//! p95 (same NumPy "linear" interpolation), just over the whole run's
//! samples instead of a bounded ring buffer, since these are end-of-run
//! aggregates rather than an online control signal.

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use vrt_controller::ControllerSummary;
use vrt_core::error::Result;
use vrt_core::purity::PuritySummary;

/// Current `metrics.json` schema version (§4.8, §6).
pub const METRICS_SCHEMA_VERSION: &str = "0.1";

/// The four named hot-loop stages plus the residual "overhead" bucket
/// (§4.8, §6 `stage_ms`).
pub const STAGES: [&str; 5] = ["detect", "track", "embed", "match", "overhead"];

#[derive(Debug, Default, Clone)]
struct StageAccumulator {
    total_ms: f64,
    count: u64,
}

/// Accumulates per-frame wall durations and per-stage timings for the
/// duration of a run.
#[derive(Debug, Default)]
pub struct Telemetry {
    frame_durations_ms: Vec<f64>,
    stages: HashMap<&'static str, StageAccumulator>,
}

impl Telemetry {
    /// A fresh, empty accumulator.
    pub fn new() -> Self {
        let mut stages = HashMap::new();
        for stage in STAGES {
            stages.insert(stage, StageAccumulator::default());
        }
        Telemetry {
            frame_durations_ms: Vec::new(),
            stages,
        }
    }

    /// Record one frame's total wall duration. Called for every frame,
    /// processed or skipped (mirrors the controller's own per-frame
    /// recording, §4.7).
    pub fn record_frame(&mut self, duration_ms: f64) {
        self.frame_durations_ms.push(duration_ms);
    }

    /// Record a named stage's duration. Callers must only invoke this for
    /// *processed* frames (§4.7 "Stage timings accumulate only for
    /// processed frames"); skipped frames never call this.
    pub fn record_stage(&mut self, stage: &'static str, duration_ms: f64) {
        let entry = self.stages.entry(stage).or_default();
        entry.total_ms += duration_ms;
        entry.count += 1;
    }

    /// Render `stage_timings.csv`: header `stage,total_ms,mean_ms,count`,
    /// UTF-8, LF line endings (§4.8, §6).
    pub fn write_stage_timings_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(b"stage,total_ms,mean_ms,count\n")?;
        for stage in STAGES {
            let acc = self.stages.get(stage).cloned().unwrap_or_default();
            let mean_ms = if acc.count > 0 {
                acc.total_ms / acc.count as f64
            } else {
                0.0
            };
            file.write_all(
                format!("{stage},{:.6},{:.6},{}\n", acc.total_ms, mean_ms, acc.count).as_bytes(),
            )?;
        }
        Ok(())
    }

    /// Per-stage mean, in milliseconds, for the `metrics.json` `stage_ms`
    /// block.
    pub fn stage_means_ms(&self) -> StageMeans {
        let mean = |stage: &str| {
            let acc = self.stages.get(stage).cloned().unwrap_or_default();
            if acc.count > 0 {
                acc.total_ms / acc.count as f64
            } else {
                0.0
            }
        };
        StageMeans {
            detect: mean("detect"),
            track: mean("track"),
            embed: mean("embed"),
            matching: mean("match"),
            overhead: mean("overhead"),
        }
    }

    /// Build the final `metrics.json` report. `run_wall_ms` is the total
    /// wall-clock duration of the run, used for `fps`.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        &self,
        run_wall_ms: f64,
        kb_size: usize,
        backend_selected: &str,
        controller: ControllerSummary,
        unknown_rate_band: [f64; 2],
        purity: PuritySummary,
        process_cold_start_ms: Option<f64>,
    ) -> MetricsReport {
        let p50 = percentile_linear(&self.frame_durations_ms, 0.50);
        let p95 = percentile_linear(&self.frame_durations_ms, 0.95);
        let p99 = percentile_linear(&self.frame_durations_ms, 0.99);
        let fps = if run_wall_ms > 0.0 {
            self.frame_durations_ms.len() as f64 / (run_wall_ms / 1000.0)
        } else {
            0.0
        };

        let report = MetricsReport {
            metrics_schema_version: METRICS_SCHEMA_VERSION.to_string(),
            fps,
            p50,
            p95,
            p99,
            stage_ms: self.stage_means_ms(),
            kb_size,
            backend_selected: backend_selected.to_string(),
            sdk_version: vrt_core::sdk::SDK_VERSION.to_string(),
            controller,
            unknown_rate_band,
            process_cold_start_ms,
            purity,
            metrics_hash: 0,
        };
        let hash = metrics_hash(&report);
        MetricsReport {
            metrics_hash: hash,
            ..report
        }
    }
}

/// Per-stage mean milliseconds (§6 `stage_ms`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageMeans {
    /// Detector stage mean, ms.
    pub detect: f64,
    /// Tracker stage mean, ms.
    pub track: f64,
    /// Embedder stage mean, ms.
    pub embed: f64,
    /// Match (LabelBank lookup) stage mean, ms.
    #[serde(rename = "match")]
    pub matching: f64,
    /// Residual overhead mean, ms.
    pub overhead: f64,
}

/// The `metrics.json` artifact (§4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Schema version, always `"0.1"` for this implementation.
    pub metrics_schema_version: String,
    /// Frames per second over the whole run.
    pub fps: f64,
    /// 50th percentile per-frame wall duration, ms.
    pub p50: f64,
    /// 95th percentile per-frame wall duration, ms.
    pub p95: f64,
    /// 99th percentile per-frame wall duration, ms.
    pub p99: f64,
    /// Mean per-stage durations (processed frames only).
    pub stage_ms: StageMeans,
    /// Number of exemplar rows in the opened LabelBank shard.
    pub kb_size: usize,
    /// Similarity backend tag (`"faiss"` or `"numpy"`).
    pub backend_selected: String,
    /// SDK/result-schema version.
    pub sdk_version: String,
    /// End-of-run controller summary.
    pub controller: ControllerSummary,
    /// `[low, high]` band the observed unknown-rate is expected to fall in.
    pub unknown_rate_band: [f64; 2],
    /// Process cold-start time, only populated when a debug flag is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_cold_start_ms: Option<f64>,
    /// Hot-loop network-purity summary.
    pub purity: PuritySummary,
    /// Stable hash over the canonical, wall-clock-free subset of this
    /// report (§4.8, §6): `metrics_schema_version`, `kb_size`,
    /// `backend_selected`, `sdk_version`, `unknown_rate_band`. Every other
    /// field is either a wall-clock measurement or derived from one, so
    /// it is excluded from the bit-stability contract by construction.
    pub metrics_hash: u64,
}

impl MetricsReport {
    /// Serialize to pretty JSON, written as `metrics.json` (§6).
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// Compute the canonical, wall-clock-free `metrics_hash` (§4.8, §6).
fn metrics_hash(report: &MetricsReport) -> u64 {
    let canonical = serde_json::json!({
        "metrics_schema_version": report.metrics_schema_version,
        "kb_size": report.kb_size,
        "backend_selected": report.backend_selected,
        "sdk_version": report.sdk_version,
        "unknown_rate_band": report.unknown_rate_band,
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    xxhash_rust::xxh3::xxh3_64(&bytes)
}

/// NumPy "linear"-interpolated percentile, matching `vrt_controller`'s
/// windowed p95 convention (§4.7), applied here over the full run.
fn percentile_linear(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let index = q * (n - 1) as f64;
    let lo = index.floor() as usize;
    let hi = index.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = index - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_controller_summary() -> ControllerSummary {
        ControllerSummary {
            start_stride: 1,
            end_stride: 1,
            frames_total: 10,
            frames_processed: 10,
            p95_window_ms: None,
            auto_stride: true,
            min_stride: 1,
            max_stride: 4,
            window: 120,
            low_water: 0.8,
        }
    }

    #[test]
    fn stage_timings_only_count_processed_frames() {
        let mut telemetry = Telemetry::new();
        telemetry.record_stage("detect", 2.0);
        telemetry.record_stage("detect", 4.0);

        let dir = tempdir().unwrap();
        let path = dir.path().join("stage_timings.csv");
        telemetry.write_stage_timings_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("stage,total_ms,mean_ms,count\n"));
        assert!(contents.contains("detect,6.000000,3.000000,2\n"));
        assert!(contents.contains("track,0.000000,0.000000,0\n"));
    }

    #[test]
    fn metrics_hash_is_stable_across_wall_clock_differences() {
        let mut a = Telemetry::new();
        let mut b = Telemetry::new();
        a.record_frame(10.0);
        a.record_frame(12.0);
        b.record_frame(999.0); // different wall timing, same business fields

        let report_a = a.finalize(
            100.0,
            50,
            "numpy",
            sample_controller_summary(),
            [0.0, 1.0],
            PuritySummary {
                sockets_blocked: 0,
                dns_blocked: 0,
            },
            None,
        );
        let report_b = b.finalize(
            500.0,
            50,
            "numpy",
            sample_controller_summary(),
            [0.0, 1.0],
            PuritySummary {
                sockets_blocked: 0,
                dns_blocked: 0,
            },
            None,
        );

        assert_eq!(report_a.metrics_hash, report_b.metrics_hash);
        assert_ne!(report_a.fps, report_b.fps);
    }

    #[test]
    fn metrics_hash_changes_with_kb_size() {
        let telemetry = Telemetry::new();
        let base = sample_controller_summary();
        let purity = PuritySummary {
            sockets_blocked: 0,
            dns_blocked: 0,
        };
        let r1 = telemetry.finalize(10.0, 50, "numpy", base.clone(), [0.0, 1.0], purity, None);
        let r2 = telemetry.finalize(10.0, 51, "numpy", base, [0.0, 1.0], purity, None);
        assert_ne!(r1.metrics_hash, r2.metrics_hash);
    }

    #[test]
    fn percentile_linear_matches_controller_convention() {
        let values: Vec<f64> = (1..=11).map(|v| v as f64).collect();
        assert!((percentile_linear(&values, 0.95) - 10.5).abs() < 1e-9);
    }

    #[test]
    fn write_json_round_trips() {
        let telemetry = Telemetry::new();
        let report = telemetry.finalize(
            10.0,
            5,
            "faiss",
            sample_controller_summary(),
            [0.0, 1.0],
            PuritySummary {
                sockets_blocked: 0,
                dns_blocked: 0,
            },
            Some(120.0),
        );
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        report.write_json(&path).unwrap();
        let read_back: MetricsReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read_back.metrics_hash, report.metrics_hash);
        assert_eq!(read_back.kb_size, 5);
    }
}

//! Resolved runtime configuration (§6).
//!
//! Every enumerated config key is resolved exactly once, at startup, into
//! an immutable [`Config`] value with precedence CLI > environment >
//! manifest (TOML) > built-in default — the same "resolve once, pass an
//! immutable value down" discipline the teacher uses for its own
//! database configuration, except here the merge is explicit rather than
//! file-only, because the CLI and environment layers both participate.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fully resolved pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Per-frame latency budget, in milliseconds.
    pub latency_budget_ms: u64,
    /// Windowed-p95 ring buffer size.
    pub latency_window: usize,
    /// Fraction of budget below which the controller starts a low-water streak.
    pub latency_low_water: f64,
    /// Initial frame stride.
    pub pipeline_frame_stride: u32,
    /// Minimum stride the controller may select.
    pub pipeline_min_stride: u32,
    /// Maximum stride the controller may select.
    pub pipeline_max_stride: u32,
    /// Whether the controller is allowed to adapt stride automatically.
    pub pipeline_auto_stride: bool,
    /// Number of neighbors requested per LabelBank lookup.
    pub matcher_topk: usize,
    /// Fallback accept threshold used when a label has no calibrated entry.
    pub matcher_threshold: f32,
    /// Minimum neighbors required before a lookup is considered valid.
    pub matcher_min_neighbors: usize,
    /// Path to the LabelBank shard JSON/binary artifact.
    pub paths_kb_json: String,
    /// Candidate Oracle queue capacity.
    pub oracle_maxlen: usize,
    /// `[low, high]` band the observed unknown-rate is expected to fall in.
    pub unknown_rate_band: [f64; 2],
}

impl Default for Config {
    fn default() -> Self {
        Config {
            latency_budget_ms: 66,
            latency_window: 120,
            latency_low_water: 0.8,
            pipeline_frame_stride: 1,
            pipeline_min_stride: 1,
            pipeline_max_stride: 4,
            pipeline_auto_stride: true,
            matcher_topk: 5,
            matcher_threshold: 0.35,
            matcher_min_neighbors: 1,
            paths_kb_json: "kb.json".to_string(),
            oracle_maxlen: 64,
            unknown_rate_band: [0.0, 1.0],
        }
    }
}

/// A single layer of possibly-partial config overrides.
///
/// All fields are optional; `None` means "this layer does not set this
/// key" so the merge can fall through to the next, lower-precedence
/// layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigLayer {
    /// See [`Config::latency_budget_ms`].
    pub latency_budget_ms: Option<u64>,
    /// See [`Config::latency_window`].
    pub latency_window: Option<usize>,
    /// See [`Config::latency_low_water`].
    pub latency_low_water: Option<f64>,
    /// See [`Config::pipeline_frame_stride`].
    pub pipeline_frame_stride: Option<u32>,
    /// See [`Config::pipeline_min_stride`].
    pub pipeline_min_stride: Option<u32>,
    /// See [`Config::pipeline_max_stride`].
    pub pipeline_max_stride: Option<u32>,
    /// See [`Config::pipeline_auto_stride`].
    pub pipeline_auto_stride: Option<bool>,
    /// See [`Config::matcher_topk`].
    pub matcher_topk: Option<usize>,
    /// See [`Config::matcher_threshold`].
    pub matcher_threshold: Option<f32>,
    /// See [`Config::matcher_min_neighbors`].
    pub matcher_min_neighbors: Option<usize>,
    /// See [`Config::paths_kb_json`].
    pub paths_kb_json: Option<String>,
    /// See [`Config::oracle_maxlen`].
    pub oracle_maxlen: Option<usize>,
    /// See [`Config::unknown_rate_band`].
    pub unknown_rate_band: Option<[f64; 2]>,
}

impl ConfigLayer {
    /// Parse a layer from a TOML manifest (`paths.kb_json`-style dotted keys).
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::Config(format!("invalid manifest: {e}")))
    }

    /// Build a layer from `VRT_`-prefixed environment variables, e.g.
    /// `VRT_LATENCY_BUDGET_MS=50`.
    pub fn from_env(vars: &HashMap<String, String>) -> Result<Self, Error> {
        let mut layer = ConfigLayer::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("VRT_") else {
                continue;
            };
            let name = name.to_lowercase();
            apply_field(&mut layer, &name, value)?;
        }
        Ok(layer)
    }

    /// Merge `other` over `self`: any field `other` sets wins.
    fn merged_over(self, other: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            latency_budget_ms: other.latency_budget_ms.or(self.latency_budget_ms),
            latency_window: other.latency_window.or(self.latency_window),
            latency_low_water: other.latency_low_water.or(self.latency_low_water),
            pipeline_frame_stride: other.pipeline_frame_stride.or(self.pipeline_frame_stride),
            pipeline_min_stride: other.pipeline_min_stride.or(self.pipeline_min_stride),
            pipeline_max_stride: other.pipeline_max_stride.or(self.pipeline_max_stride),
            pipeline_auto_stride: other.pipeline_auto_stride.or(self.pipeline_auto_stride),
            matcher_topk: other.matcher_topk.or(self.matcher_topk),
            matcher_threshold: other.matcher_threshold.or(self.matcher_threshold),
            matcher_min_neighbors: other.matcher_min_neighbors.or(self.matcher_min_neighbors),
            paths_kb_json: other.paths_kb_json.or(self.paths_kb_json),
            oracle_maxlen: other.oracle_maxlen.or(self.oracle_maxlen),
            unknown_rate_band: other.unknown_rate_band.or(self.unknown_rate_band),
        }
    }

    fn into_config(self) -> Result<Config, Error> {
        let d = Config::default();
        let cfg = Config {
            latency_budget_ms: self.latency_budget_ms.unwrap_or(d.latency_budget_ms),
            latency_window: self.latency_window.unwrap_or(d.latency_window),
            latency_low_water: self.latency_low_water.unwrap_or(d.latency_low_water),
            pipeline_frame_stride: self
                .pipeline_frame_stride
                .unwrap_or(d.pipeline_frame_stride),
            pipeline_min_stride: self.pipeline_min_stride.unwrap_or(d.pipeline_min_stride),
            pipeline_max_stride: self.pipeline_max_stride.unwrap_or(d.pipeline_max_stride),
            pipeline_auto_stride: self
                .pipeline_auto_stride
                .unwrap_or(d.pipeline_auto_stride),
            matcher_topk: self.matcher_topk.unwrap_or(d.matcher_topk),
            matcher_threshold: self.matcher_threshold.unwrap_or(d.matcher_threshold),
            matcher_min_neighbors: self
                .matcher_min_neighbors
                .unwrap_or(d.matcher_min_neighbors),
            paths_kb_json: self.paths_kb_json.unwrap_or(d.paths_kb_json),
            oracle_maxlen: self.oracle_maxlen.unwrap_or(d.oracle_maxlen),
            unknown_rate_band: self.unknown_rate_band.unwrap_or(d.unknown_rate_band),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl Config {
    /// Resolve a final `Config` from the four precedence layers, highest first:
    /// `cli > env > manifest > default`.
    pub fn resolve(
        cli: ConfigLayer,
        env: ConfigLayer,
        manifest: ConfigLayer,
    ) -> Result<Config, Error> {
        let merged = ConfigLayer::default()
            .merged_over(manifest)
            .merged_over(env)
            .merged_over(cli);
        merged.into_config()
    }

    /// Validate cross-field invariants that a single layer can't check alone.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pipeline_min_stride < 1 {
            return Err(Error::Config("pipeline.min_stride must be >= 1".into()));
        }
        if self.pipeline_max_stride < self.pipeline_min_stride {
            return Err(Error::Config(
                "pipeline.max_stride must be >= pipeline.min_stride".into(),
            ));
        }
        if !(self.pipeline_min_stride..=self.pipeline_max_stride)
            .contains(&self.pipeline_frame_stride)
        {
            return Err(Error::Config(
                "pipeline.frame_stride must fall within [min_stride, max_stride]".into(),
            ));
        }
        if self.matcher_topk == 0 {
            return Err(Error::Config("matcher.topk must be >= 1".into()));
        }
        if self.unknown_rate_band[0] > self.unknown_rate_band[1] {
            return Err(Error::Config(
                "unknown_rate_band low must be <= high".into(),
            ));
        }
        Ok(())
    }
}

fn apply_field(layer: &mut ConfigLayer, name: &str, value: &str) -> Result<(), Error> {
    let parse_err = |e: std::num::ParseIntError| Error::Config(format!("{name}: {e}"));
    let parse_float_err = |e: std::num::ParseFloatError| Error::Config(format!("{name}: {e}"));
    match name {
        "latency_budget_ms" => layer.latency_budget_ms = Some(value.parse().map_err(parse_err)?),
        "latency_window" => layer.latency_window = Some(value.parse().map_err(parse_err)?),
        "latency_low_water" => {
            layer.latency_low_water = Some(value.parse().map_err(parse_float_err)?)
        }
        "pipeline_frame_stride" => {
            layer.pipeline_frame_stride = Some(value.parse().map_err(parse_err)?)
        }
        "pipeline_min_stride" => {
            layer.pipeline_min_stride = Some(value.parse().map_err(parse_err)?)
        }
        "pipeline_max_stride" => {
            layer.pipeline_max_stride = Some(value.parse().map_err(parse_err)?)
        }
        "pipeline_auto_stride" => {
            layer.pipeline_auto_stride =
                Some(value.parse().map_err(|_| {
                    Error::Config(format!("{name}: expected true/false, got '{value}'"))
                })?)
        }
        "matcher_topk" => layer.matcher_topk = Some(value.parse().map_err(parse_err)?),
        "matcher_threshold" => {
            layer.matcher_threshold = Some(value.parse().map_err(parse_float_err)?)
        }
        "matcher_min_neighbors" => {
            layer.matcher_min_neighbors = Some(value.parse().map_err(parse_err)?)
        }
        "paths_kb_json" => layer.paths_kb_json = Some(value.to_string()),
        "oracle_maxlen" => layer.oracle_maxlen = Some(value.parse().map_err(parse_err)?),
        "unknown_rate_band" => {
            let (low, high) = value.split_once(',').ok_or_else(|| {
                Error::Config(format!(
                    "{name}: expected 'low,high', got '{value}'"
                ))
            })?;
            layer.unknown_rate_band = Some([
                low.trim().parse().map_err(parse_float_err)?,
                high.trim().parse().map_err(parse_float_err)?,
            ]);
        }
        _ => {} // Unrecognized VRT_* var: ignored, not an error.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn precedence_cli_beats_env_beats_manifest() {
        let manifest = ConfigLayer {
            latency_budget_ms: Some(100),
            ..Default::default()
        };
        let env = ConfigLayer {
            latency_budget_ms: Some(50),
            ..Default::default()
        };
        let cli = ConfigLayer {
            latency_budget_ms: Some(20),
            ..Default::default()
        };
        let cfg = Config::resolve(cli, env, manifest).unwrap();
        assert_eq!(cfg.latency_budget_ms, 20);
    }

    #[test]
    fn missing_layers_fall_back_to_default() {
        let cfg = Config::resolve(
            ConfigLayer::default(),
            ConfigLayer::default(),
            ConfigLayer::default(),
        )
        .unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn env_layer_parses_prefixed_vars() {
        let mut vars = HashMap::new();
        vars.insert("VRT_LATENCY_BUDGET_MS".to_string(), "33".to_string());
        vars.insert("UNRELATED".to_string(), "ignored".to_string());
        let layer = ConfigLayer::from_env(&vars).unwrap();
        assert_eq!(layer.latency_budget_ms, Some(33));
    }

    #[test]
    fn env_layer_parses_unknown_rate_band() {
        let mut vars = HashMap::new();
        vars.insert("VRT_UNKNOWN_RATE_BAND".to_string(), "0.05, 0.3".to_string());
        let layer = ConfigLayer::from_env(&vars).unwrap();
        assert_eq!(layer.unknown_rate_band, Some([0.05, 0.3]));
    }

    #[test]
    fn env_layer_rejects_malformed_unknown_rate_band() {
        let mut vars = HashMap::new();
        vars.insert("VRT_UNKNOWN_RATE_BAND".to_string(), "0.05".to_string());
        assert!(ConfigLayer::from_env(&vars).is_err());
    }

    #[test]
    fn rejects_stride_out_of_range() {
        let cli = ConfigLayer {
            pipeline_frame_stride: Some(9),
            ..Default::default()
        };
        let err = Config::resolve(cli, ConfigLayer::default(), ConfigLayer::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

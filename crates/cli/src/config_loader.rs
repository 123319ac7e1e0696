//! Resolves the four config layers — CLI > env > manifest > default
//! (§6, §9) — into one immutable [`vrt_core::config::Config`].

use std::collections::HashMap;
use std::path::Path;

use vrt_core::config::{Config, ConfigLayer};
use vrt_core::error::Result;

/// CLI-supplied overrides, one optional field per [`ConfigLayer`] key.
/// Every field left `None` falls through to env/manifest/default.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub latency_budget_ms: Option<u64>,
    pub latency_window: Option<usize>,
    pub latency_low_water: Option<f64>,
    pub pipeline_frame_stride: Option<u32>,
    pub pipeline_min_stride: Option<u32>,
    pub pipeline_max_stride: Option<u32>,
    pub pipeline_auto_stride: Option<bool>,
    pub matcher_topk: Option<usize>,
    pub matcher_threshold: Option<f32>,
    pub matcher_min_neighbors: Option<usize>,
    pub oracle_maxlen: Option<usize>,
    pub unknown_rate_band: Option<[f64; 2]>,
}

impl CliOverrides {
    fn into_layer(self) -> ConfigLayer {
        ConfigLayer {
            latency_budget_ms: self.latency_budget_ms,
            latency_window: self.latency_window,
            latency_low_water: self.latency_low_water,
            pipeline_frame_stride: self.pipeline_frame_stride,
            pipeline_min_stride: self.pipeline_min_stride,
            pipeline_max_stride: self.pipeline_max_stride,
            pipeline_auto_stride: self.pipeline_auto_stride,
            matcher_topk: self.matcher_topk,
            matcher_threshold: self.matcher_threshold,
            matcher_min_neighbors: self.matcher_min_neighbors,
            paths_kb_json: None,
            oracle_maxlen: self.oracle_maxlen,
            unknown_rate_band: self.unknown_rate_band,
        }
    }
}

/// Resolve `cli > env (VRT_*) > manifest (TOML, optional) > built-in default`.
pub fn resolve(cli: CliOverrides, manifest_path: Option<&Path>) -> Result<Config> {
    let manifest = match manifest_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            ConfigLayer::from_toml_str(&raw)?
        }
        None => ConfigLayer::default(),
    };

    let env_vars: HashMap<String, String> = std::env::vars().collect();
    let env = ConfigLayer::from_env(&env_vars)?;

    Config::resolve(cli.into_layer(), env, manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_layer_carries_every_cli_override() {
        let overrides = CliOverrides {
            latency_budget_ms: Some(10),
            matcher_threshold: Some(0.5),
            unknown_rate_band: Some([0.1, 0.2]),
            ..Default::default()
        };
        let layer = overrides.into_layer();
        assert_eq!(layer.latency_budget_ms, Some(10));
        assert_eq!(layer.matcher_threshold, Some(0.5));
        assert_eq!(layer.unknown_rate_band, Some([0.1, 0.2]));
        // Not CLI-settable: always routed through env/manifest instead.
        assert_eq!(layer.paths_kb_json, None);
    }
}

//! SDK version stamped into every [`crate::MatchResult`] and `metrics.json`.

/// Semantic version of this crate's result contract (not the Cargo package version).
pub const SDK_VERSION: &str = "0.1.0";

//! Core types shared across the recognition engine.
//!
//! This crate defines the vocabulary every other crate in the workspace
//! builds on:
//! - [`Embedding`]: a validated, L2-normalized float vector.
//! - [`MatchResult`] / [`NeighborHit`]: the frozen v0.1 per-frame result.
//! - [`Error`] / [`Result`]: the unified error hierarchy and exit-code map.
//! - [`Config`]: resolved runtime configuration (CLI > env > manifest > default).
//! - [`PuritySummary`] / [`PurityGuard`]: hot-loop network-syscall accounting.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod embedding;
pub mod error;
pub mod match_result;
pub mod purity;
pub mod sdk;

pub use config::Config;
pub use embedding::Embedding;
pub use error::{Error, Result};
pub use match_result::{MatchResult, NeighborHit};
pub use purity::{PuritySummary, PurityGuard};
pub use sdk::SDK_VERSION;
